//! Guest code shared by the end-to-end tests.

use std::sync::atomic::{AtomicI64, Ordering};

use super::{GuestError, LocalClass, LocalModule, LocalRuntime};
use crate::registry::{ModuleHandle, PluginHandle};
use crate::{
    Cdt, CdtArray, CdtType, KeywordArgs, PackedArray, PositionalArgs, Signature, TypeDescriptor,
    Xllr, XllrCreateInfo,
};

pub(crate) const PLUGIN: &str = "local";
pub(crate) const MODULE: &str = "guest/core";

/// Scalar kinds with an `echo_<name>` identity function.
pub(crate) const ECHO_TYPES: [CdtType; 18] = [
    CdtType::Bool,
    CdtType::Int8,
    CdtType::Int16,
    CdtType::Int32,
    CdtType::Int64,
    CdtType::UInt8,
    CdtType::UInt16,
    CdtType::UInt32,
    CdtType::UInt64,
    CdtType::Float32,
    CdtType::Float64,
    CdtType::Char8,
    CdtType::Char16,
    CdtType::Char32,
    CdtType::String8,
    CdtType::String16,
    CdtType::String32,
    CdtType::Handle,
];

pub(crate) struct Counter {
    pub(crate) value: AtomicI64,
}

pub(crate) struct GuestException {
    pub(crate) code: i64,
}

fn sig<const P: usize, const R: usize>(
    params: [TypeDescriptor; P],
    retvals: [TypeDescriptor; R],
) -> Signature {
    Signature::new(params, retvals)
}

fn int64_2d() -> TypeDescriptor {
    TypeDescriptor::array(CdtType::Int64, 2)
}

fn packed_bytes() -> TypeDescriptor {
    TypeDescriptor::packed(CdtType::UInt8)
}

fn add_signature() -> Signature {
    sig(
        [TypeDescriptor::INT64, TypeDescriptor::INT64],
        [TypeDescriptor::INT64],
    )
}

fn core_module() -> LocalModule {
    let mut module = LocalModule::new();
    for ty in ECHO_TYPES {
        let descriptor = TypeDescriptor::new(ty);
        module = module.function(
            format!("echo_{ty}"),
            sig([descriptor.clone()], [descriptor]),
            |call| {
                let value = call.arg_cdt(0)?.clone();
                call.ret(value)
            },
        );
    }

    module
        .function("echo_any", sig([TypeDescriptor::ANY], [TypeDescriptor::ANY]), |call| {
            let value = call.arg_cdt(0)?.clone();
            call.ret(value)
        })
        .function("hello_world", sig([], [TypeDescriptor::STRING8]), |call| {
            call.ret("Hello World, from the guest")
        })
        .function("no_op", sig([], []), |_| Ok(()))
        .function(
            "div_integers",
            sig([TypeDescriptor::INT64, TypeDescriptor::INT64], [TypeDescriptor::FLOAT64]),
            |call| {
                let x: i64 = call.arg(0)?;
                let y: i64 = call.arg(1)?;
                if y == 0 {
                    return Err(GuestError::new("division by zero"));
                }
                call.ret(x as f64 / y as f64)
            },
        )
        .function("always_fails", sig([], []), |call| {
            Err(call.raise(
                "guest.GuestException",
                GuestException { code: 7 },
                "guest raised GuestException(7)",
            ))
        })
        .function("panics", sig([], []), |_| panic!("guest bug"))
        .function("make_then_fail", sig([], [TypeDescriptor::HANDLE]), |call| {
            let handle = call.new_object(
                "guest.Counter",
                Counter {
                    value: AtomicI64::new(0),
                },
            );
            call.ret(handle)?;
            Err(GuestError::new("gave up after building a counter"))
        })
        .function("export_then_panic", sig([], [TypeDescriptor::CALLABLE]), |call| {
            let add = call.export(add_signature(), |call| {
                let x: i64 = call.arg(0)?;
                let y: i64 = call.arg(1)?;
                call.ret(x + y)
            })?;
            call.ret(add)?;
            panic!("guest bug after export")
        })
        .function("sum_ragged", sig([int64_2d()], [TypeDescriptor::INT64]), |call| {
            let rows: Vec<Vec<i64>> = call.arg(0)?;
            call.ret(rows.iter().flatten().sum::<i64>())
        })
        .function("make_ragged", sig([], [int64_2d()]), |call| {
            let array =
                CdtArray::from_2d(CdtType::Int64, vec![vec![1_i64, 2, 3], vec![4], vec![5, 6]])?;
            call.ret(array)
        })
        .function(
            "sum_3d",
            sig([TypeDescriptor::array(CdtType::Int32, 3)], [TypeDescriptor::INT64]),
            |call| {
                let planes: Vec<Vec<Vec<i32>>> = call.arg(0)?;
                let sum: i64 = planes.iter().flatten().flatten().map(|&v| i64::from(v)).sum();
                call.ret(sum)
            },
        )
        .function("echo_bytes", sig([packed_bytes()], [packed_bytes()]), |call| {
            let bytes: PackedArray = call.arg(0)?;
            call.ret(bytes)
        })
        .function(
            "sum_packed_int64",
            sig([TypeDescriptor::packed(CdtType::Int64)], [TypeDescriptor::INT64]),
            |call| {
                let packed: PackedArray = call.arg(0)?;
                let values = packed
                    .as_slice::<i64>()
                    .ok_or_else(|| GuestError::new("expected packed int64"))?;
                call.ret(values.iter().sum::<i64>())
            },
        )
        .function(
            "arg_positional_arg_named",
            sig(
                [
                    TypeDescriptor::STRING8,
                    TypeDescriptor::POSITIONAL_ARGS,
                    TypeDescriptor::KEYWORD_ARGS,
                ],
                [TypeDescriptor::POSITIONAL_ARGS],
            ),
            |call| {
                let value: String = call.arg(0)?;
                let args: PositionalArgs = call.arg(1)?;
                let kwargs: KeywordArgs = call.arg(2)?;
                let mut out = PositionalArgs::new().with(value);
                for arg in args.iter() {
                    out.push(arg.clone());
                }
                for (name, value) in kwargs.iter() {
                    out.push(name);
                    out.push(value.clone());
                }
                call.ret(out)
            },
        )
        .function(
            "named_only",
            sig([TypeDescriptor::KEYWORD_ARGS], [TypeDescriptor::STRING8]),
            |call| {
                let kwargs: KeywordArgs = call.arg(0)?;
                let named = kwargs
                    .get("named")
                    .ok_or_else(|| GuestError::new("missing keyword argument `named`"))?;
                call.ret(named.clone())
            },
        )
        .function(
            "call_callback_add",
            sig(
                [TypeDescriptor::CALLABLE, TypeDescriptor::INT64],
                [TypeDescriptor::INT64],
            ),
            |call| {
                let add: crate::Callable = call.arg(0)?;
                let times: i64 = call.arg(1)?;
                let mut total = 0;
                for i in 0..times {
                    let out = call.call(&add, [Cdt::Int64(1), Cdt::Int64(2)])?;
                    let sum: i64 = out[0].get()?;
                    if sum != 3 {
                        return Err(GuestError::new(format!("call {i}: add(1, 2) returned {sum}")));
                    }
                    total += sum;
                }
                call.ret(total)
            },
        )
        .function(
            "fetch_handle",
            sig([TypeDescriptor::CALLABLE], [TypeDescriptor::HANDLE]),
            |call| {
                let source: crate::Callable = call.arg(0)?;
                let out = call.call(&source, [])?;
                call.ret(out[0].clone())?;
                call.release(&out)
            },
        )
        .function("return_callback_add", sig([], [TypeDescriptor::CALLABLE]), |call| {
            let add = call.export(add_signature(), |call| {
                let x: i64 = call.arg(0)?;
                let y: i64 = call.arg(1)?;
                call.ret(x + y)
            })?;
            call.ret(add)
        })
        .function(
            "call_transformer",
            sig(
                [TypeDescriptor::CALLABLE, TypeDescriptor::STRING8],
                [TypeDescriptor::STRING8],
            ),
            |call| {
                let transform: crate::Callable = call.arg(0)?;
                let input: String = call.arg(1)?;
                let out = call.call(&transform, [Cdt::String8(input)])?;
                call.ret(out[0].clone())
            },
        )
        .class(
            LocalClass::new("guest.Counter")
                .constructor([TypeDescriptor::INT64], |call| {
                    let start: i64 = call.arg(0)?;
                    let handle = call.new_object(
                        "guest.Counter",
                        Counter {
                            value: AtomicI64::new(start),
                        },
                    );
                    call.ret(handle)
                })
                .method("inc", sig([], [TypeDescriptor::INT64]), |call| {
                    let this = call.this::<Counter>()?;
                    call.ret(this.value.fetch_add(1, Ordering::SeqCst) + 1)
                })
                .method("get", sig([], [TypeDescriptor::INT64]), |call| {
                    let this = call.this::<Counter>()?;
                    call.ret(this.value.load(Ordering::SeqCst))
                })
                .static_method("describe", sig([], [TypeDescriptor::STRING8]), |call| {
                    call.ret("a counter")
                })
                .field::<Counter, _, _>(
                    "value",
                    TypeDescriptor::INT64,
                    |counter| Cdt::Int64(counter.value.load(Ordering::SeqCst)),
                    |counter, value| {
                        counter.value.store(value.get()?, Ordering::SeqCst);
                        Ok(())
                    },
                ),
        )
        .class(
            LocalClass::new("guest.GuestException").read_only_field::<GuestException, _>(
                "code",
                TypeDescriptor::INT64,
                |exception| Cdt::Int64(exception.code),
            ),
        )
        .attribute("FIVE_SECONDS", TypeDescriptor::INT64, 5_i64)
}

pub(crate) fn runtime() -> LocalRuntime {
    LocalRuntime::new(PLUGIN).with_module(MODULE, core_module())
}

pub(crate) fn xllr() -> (Xllr, LocalRuntime) {
    let xllr = Xllr::new(XllrCreateInfo::default());
    let runtime = runtime();
    runtime.register(&xllr);
    (xllr, runtime)
}

pub(crate) fn load(xllr: &Xllr) -> (PluginHandle, ModuleHandle) {
    let plugin = xllr.load_runtime_plugin(PLUGIN).expect("load local plugin");
    let module = xllr.load_module(&plugin, MODULE).expect("load guest module");
    (plugin, module)
}
