//! The call path.
//!
//! No registry lock is held while the plugin runs: the plugin state and the
//! function entry are cloned out first, so a guest may re-enter the core
//! (callbacks, nested invocations, handle releases) from inside a call.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};

use log::{trace, warn};
use parking_lot::Mutex;

use crate::plugin::{Fresh, PluginCall};
use crate::registry::PluginState;
use crate::{Cdt, Cdts, CdtsPair, ErrorKind, FunctionId, Handle, Xllr, XllrError};

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        return (*message).to_string();
    }
    if let Some(message) = payload.downcast_ref::<String>() {
        return message.clone();
    }
    "unknown panic".to_string()
}

/// Handles must be live and issued by the plugin they are passed to.
fn check_handles(state: &PluginState, xllr: &Xllr, params: &Cdts) -> Result<(), XllrError> {
    let mut result = Ok(());
    for param in params {
        param.walk(&mut |cdt| {
            if result.is_err() {
                return;
            }
            match cdt {
                Cdt::Handle(handle) if !handle.is_null() => {
                    if handle.runtime() != state.runtime {
                        result = Err(XllrError::ForeignHandle {
                            handle: *handle,
                            runtime: state.name.clone(),
                        });
                    } else if !state.handles.is_live(*handle) {
                        result = Err(XllrError::UnknownHandle(*handle));
                    }
                }
                Cdt::Callable(callable) if !xllr.inner.callbacks.is_live(callable) => {
                    result = Err(XllrError::UnknownFunction(format!(
                        "callable {:#x}",
                        callable.to_bits()
                    )));
                }
                _ => {}
            }
        });
        result.clone()?;
    }
    result
}

impl Xllr {
    /// Calls a resolved entity. `retvals` is cleared and, on success, holds
    /// one value per declared return slot; every handle and callable in it
    /// holds a count owned by the caller. On error it is left empty.
    pub fn invoke(
        &self,
        function: FunctionId,
        params: &Cdts,
        retvals: &mut Cdts,
    ) -> Result<(), XllrError> {
        let state = self
            .state(function.runtime())
            .ok_or_else(|| XllrError::UnknownFunction(function.to_string()))?;
        let entry = state.function(function)?;
        let signature = &*entry.signature;

        if params.len() != signature.params.len() {
            return Err(XllrError::WrongParamCount {
                expected: signature.params.len(),
                got: params.len(),
            });
        }
        if retvals.capacity() < signature.retvals.len() {
            return Err(XllrError::CapacityExceeded {
                capacity: retvals.capacity(),
            });
        }
        signature.check_params(params)?;
        check_handles(&state, self, params)?;
        retvals.clear();

        trace!("{}: invoke {function} `{}`", state.name, entry.path);
        let mut call = PluginCall {
            xllr: self,
            state: &state,
            function,
            signature,
            binding: &entry.binding,
            params,
            retvals: &mut *retvals,
            fresh: Mutex::new(Fresh::default()),
        };
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            state.plugin.invoke(entry.entity, &mut call)
        }));
        let fresh = call.fresh.into_inner();
        let result = match outcome {
            Ok(Ok(())) => signature
                .check_retvals(retvals)
                .and_then(|()| self.adopt(retvals, fresh.clone())),
            Ok(Err(err)) => Err(match err.kind() {
                ErrorKind::InvocationFailed => err,
                _ => XllrError::invocation(err.to_string()),
            }),
            Err(payload) => Err(XllrError::invocation(format!(
                "plugin panicked: {}",
                panic_message(payload.as_ref())
            ))),
        };
        if let Err(err) = &result {
            warn!("{}: `{}` failed: {err}", state.name, entry.path);
            self.discard(fresh, err.exception());
            retvals.clear();
        }
        result
    }

    /// Makes every reference in `retvals` one the receiver owns: fresh counts
    /// change hands, anything else is retained. Undoes its retains on error.
    pub(crate) fn adopt(&self, retvals: &Cdts, mut fresh: Fresh) -> Result<(), XllrError> {
        let mut retained = Fresh::default();
        let mut result: Result<(), XllrError> = Ok(());
        for value in retvals {
            value.walk(&mut |cdt| {
                if result.is_err() {
                    return;
                }
                result = match cdt {
                    Cdt::Handle(handle) if !handle.is_null() => {
                        if fresh.take_handle(*handle) {
                            Ok(())
                        } else {
                            self.retain_handle(*handle)
                                .map(|handle| retained.handles.push(handle))
                        }
                    }
                    Cdt::Callable(callable) => {
                        if fresh.take_callable(callable) {
                            Ok(())
                        } else {
                            self.retain_callable(callable)
                                .map(|()| retained.callables.push(callable.clone()))
                        }
                    }
                    _ => Ok(()),
                };
            });
        }
        result.map_err(|err| {
            self.discard(retained, None);
            XllrError::invocation(format!("returned a dead reference: {err}"))
        })
    }

    /// Gives back the counts a failed call minted, except the exception its
    /// error hands to the caller.
    pub(crate) fn discard(&self, fresh: Fresh, keep: Option<Handle>) {
        if fresh.is_empty() {
            return;
        }
        for handle in fresh.handles {
            if Some(handle) == keep {
                continue;
            }
            if let Err(err) = self.release_handle(handle) {
                warn!("releasing {handle} after a failed call: {err}");
            }
        }
        for callable in &fresh.callables {
            if let Err(err) = self.release_callable(callable) {
                warn!(
                    "releasing callable {:#x} after a failed call: {err}",
                    callable.to_bits()
                );
            }
        }
    }

    /// Releases every handle and callable in `values`, arrays included.
    /// Keeps going past failures and reports the first.
    pub fn release_values(&self, values: &Cdts) -> Result<(), XllrError> {
        let mut first = Ok(());
        for value in values {
            value.walk(&mut |cdt| {
                let released = match cdt {
                    Cdt::Handle(handle) if !handle.is_null() => self.release_handle(*handle),
                    Cdt::Callable(callable) => self.release_callable(callable),
                    _ => Ok(()),
                };
                if let Err(err) = released {
                    if first.is_ok() {
                        first = Err(err);
                    }
                }
            });
        }
        first
    }

    /// [`invoke`](Self::invoke) with a return buffer sized for the entity.
    pub fn call(&self, function: FunctionId, params: Cdts) -> Result<Cdts, XllrError> {
        let mut retvals = Cdts::with_capacity(self.signature(function)?.retvals.len());
        self.invoke(function, &params, &mut retvals)?;
        Ok(retvals)
    }

    /// Buffers sized from the entity's arity.
    pub fn alloc_cdts(&self, function: FunctionId) -> Result<CdtsPair, XllrError> {
        let signature = self.signature(function)?;
        Ok(CdtsPair::new(signature.params.len(), signature.retvals.len()))
    }

    pub fn signature(&self, function: FunctionId) -> Result<crate::Signature, XllrError> {
        let state = self
            .state(function.runtime())
            .ok_or_else(|| XllrError::UnknownFunction(function.to_string()))?;
        Ok((*state.function(function)?.signature).clone())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    use super::*;
    use crate::local::fixtures::{self, ECHO_TYPES};
    use crate::registry::ModuleHandle;
    use crate::{
        CdtArray, CdtType, Handle, KeywordArgs, OwnedHandle, PackedArray, PositionalArgs,
        RuntimeId, Signature, TypeDescriptor,
    };

    fn resolve(
        xllr: &Xllr,
        module: &ModuleHandle,
        path: &str,
        params: &[TypeDescriptor],
        retvals: &[TypeDescriptor],
    ) -> FunctionId {
        xllr.load_entity(module, path, params, retvals)
            .unwrap_or_else(|err| panic!("{path}: {err}"))
    }

    fn sample(ty: CdtType, xllr: &Xllr, counter: Handle) -> Cdt {
        match ty {
            CdtType::Bool => Cdt::Bool(true),
            CdtType::Int8 => Cdt::Int8(i8::MIN),
            CdtType::Int16 => Cdt::Int16(-12345),
            CdtType::Int32 => Cdt::Int32(i32::MAX),
            CdtType::Int64 => Cdt::Int64(i64::MIN + 1),
            CdtType::UInt8 => Cdt::UInt8(u8::MAX),
            CdtType::UInt16 => Cdt::UInt16(54321),
            CdtType::UInt32 => Cdt::UInt32(u32::MAX),
            CdtType::UInt64 => Cdt::UInt64(u64::MAX),
            CdtType::Float32 => Cdt::Float32(3.5),
            CdtType::Float64 => Cdt::Float64(-0.1),
            CdtType::Char8 => Cdt::Char8(b'x'),
            CdtType::Char16 => Cdt::Char16(0x00e9),
            CdtType::Char32 => Cdt::Char32('🦀'),
            CdtType::String8 => Cdt::String8("héllo, wörld".into()),
            CdtType::String16 => Cdt::string16("ĥello"),
            CdtType::String32 => Cdt::string32("𝄞 clef"),
            CdtType::Handle => Cdt::Handle(counter),
            other => panic!("no sample for {other} in {xllr:?}"),
        }
    }

    fn new_counter(xllr: &Xllr, module: &ModuleHandle, start: i64) -> Handle {
        let ctor = resolve(
            xllr,
            module,
            "class=guest.Counter,callable=<init>",
            &[TypeDescriptor::INT64],
            &[TypeDescriptor::HANDLE],
        );
        let out = xllr
            .call(ctor, Cdts::from_vec(vec![Cdt::Int64(start)]))
            .expect("construct");
        out[0].get::<Handle>().expect("handle")
    }

    #[test]
    fn every_primitive_round_trips() {
        let (xllr, _runtime) = fixtures::xllr();
        let (plugin, module) = fixtures::load(&xllr);
        let counter = new_counter(&xllr, &module, 0);

        for ty in ECHO_TYPES {
            let descriptor = TypeDescriptor::new(ty);
            let echo = resolve(
                &xllr,
                &module,
                &format!("callable=echo_{ty}"),
                &[descriptor.clone()],
                &[descriptor],
            );
            let value = sample(ty, &xllr, counter);
            let out = xllr
                .call(echo, Cdts::from_vec(vec![value.clone()]))
                .unwrap_or_else(|err| panic!("echo_{ty}: {err}"));
            assert_eq!(out.len(), 1);
            assert_eq!(out[0], value, "echo_{ty}");
            xllr.release_values(&out).expect("release the echoed copy");
        }
        assert_eq!(xllr.handle_count(counter), Some(1));

        xllr.release_handle(counter).expect("release");
        xllr.release_runtime_plugin(&plugin).expect("release plugin");
    }

    #[test]
    fn param_count_must_match_exactly() {
        let (xllr, _runtime) = fixtures::xllr();
        let (plugin, module) = fixtures::load(&xllr);
        let div = resolve(
            &xllr,
            &module,
            "callable=div_integers",
            &[TypeDescriptor::INT64, TypeDescriptor::INT64],
            &[TypeDescriptor::FLOAT64],
        );
        for params in [vec![], vec![Cdt::Int64(1)], vec![Cdt::Int64(1); 3]] {
            let got = params.len();
            let err = xllr.call(div, Cdts::from_vec(params)).expect_err("arity");
            assert!(
                matches!(err, XllrError::WrongParamCount { expected: 2, got: g } if g == got),
                "{err}"
            );
        }
        let out = xllr
            .call(div, Cdts::from_vec(vec![Cdt::Int64(7), Cdt::Int64(2)]))
            .expect("valid call");
        assert_eq!(out[0], Cdt::Float64(3.5));
        xllr.release_runtime_plugin(&plugin).expect("release plugin");
    }

    #[test]
    fn undersized_return_buffer_is_rejected() {
        let (xllr, _runtime) = fixtures::xllr();
        let (plugin, module) = fixtures::load(&xllr);
        let hello = resolve(
            &xllr,
            &module,
            "callable=hello_world",
            &[],
            &[TypeDescriptor::STRING8],
        );
        let mut retvals = Cdts::with_capacity(0);
        let err = xllr
            .invoke(hello, &Cdts::default(), &mut retvals)
            .expect_err("no room");
        assert_eq!(err.kind(), ErrorKind::CapacityExceeded);

        let mut pair = xllr.alloc_cdts(hello).expect("alloc");
        xllr.invoke(hello, &pair.params, &mut pair.retvals).expect("sized");
        assert!(pair.retvals[0].as_str().expect("string").starts_with("Hello World"));
        xllr.release_runtime_plugin(&plugin).expect("release plugin");
    }

    #[test]
    fn handles_are_valid_only_while_counted() {
        let (xllr, runtime) = fixtures::xllr();
        let (plugin, module) = fixtures::load(&xllr);
        let counter = new_counter(&xllr, &module, 10);
        let inc = resolve(
            &xllr,
            &module,
            "class=guest.Counter,callable=inc,instance_required",
            &[TypeDescriptor::HANDLE],
            &[TypeDescriptor::INT64],
        );
        let params = || Cdts::from_vec(vec![Cdt::Handle(counter)]);

        xllr.retain_handle(counter).expect("retain");
        xllr.retain_handle(counter).expect("retain");
        assert_eq!(xllr.handle_count(counter), Some(3));
        for expected in [11, 12] {
            xllr.release_handle(counter).expect("release");
            let out = xllr.call(inc, params()).expect("still live");
            assert_eq!(out[0], Cdt::Int64(expected));
        }
        assert_eq!(xllr.handle_count(counter), Some(1));
        xllr.release_handle(counter).expect("last release");
        assert_eq!(runtime.live_objects(), 0);

        let err = xllr.call(inc, params()).expect_err("released");
        assert_eq!(err.kind(), ErrorKind::UnknownHandle);
        let err = xllr.retain_handle(counter).expect_err("released");
        assert_eq!(err.kind(), ErrorKind::UnknownHandle);
        xllr.release_runtime_plugin(&plugin).expect("release plugin");
    }

    #[test]
    fn owned_handle_releases_on_drop() {
        let (xllr, runtime) = fixtures::xllr();
        let (plugin, module) = fixtures::load(&xllr);
        let owned = OwnedHandle::new(&xllr, new_counter(&xllr, &module, 0));
        let second = owned.try_clone().expect("clone");
        assert_eq!(xllr.handle_count(owned.handle()), Some(2));
        drop(owned);
        assert_eq!(runtime.live_objects(), 1);
        drop(second);
        assert_eq!(runtime.live_objects(), 0);
        xllr.release_runtime_plugin(&plugin).expect("release plugin");
    }

    #[test]
    fn fields_and_attributes() {
        let (xllr, _runtime) = fixtures::xllr();
        let (plugin, module) = fixtures::load(&xllr);
        let counter = new_counter(&xllr, &module, 1);
        let this = TypeDescriptor::HANDLE.with_alias("guest.Counter");
        let get = resolve(
            &xllr,
            &module,
            "class=guest.Counter,field=value,getter,instance_required",
            &[this.clone()],
            &[TypeDescriptor::INT64],
        );
        let set = resolve(
            &xllr,
            &module,
            "class=guest.Counter,field=value,setter,instance_required",
            &[this, TypeDescriptor::INT64],
            &[],
        );
        xllr.call(set, Cdts::from_vec(vec![Cdt::Handle(counter), Cdt::Int64(99)]))
            .expect("set");
        let out = xllr
            .call(get, Cdts::from_vec(vec![Cdt::Handle(counter)]))
            .expect("get");
        assert_eq!(out[0], Cdt::Int64(99));

        let five = resolve(
            &xllr,
            &module,
            "attribute=FIVE_SECONDS,getter",
            &[],
            &[TypeDescriptor::INT64],
        );
        assert_eq!(xllr.call(five, Cdts::default()).expect("get")[0], Cdt::Int64(5));

        let err = xllr
            .load_entity(
                &module,
                "class=guest.Counter,field=value,getter",
                &[TypeDescriptor::HANDLE],
                &[TypeDescriptor::INT64],
            )
            .expect_err("missing instance_required");
        assert_eq!(err.kind(), ErrorKind::EntityNotFound);

        xllr.release_handle(counter).expect("release");
        xllr.release_runtime_plugin(&plugin).expect("release plugin");
    }

    #[test]
    fn ragged_arrays_keep_row_lengths() {
        let (xllr, _runtime) = fixtures::xllr();
        let (plugin, module) = fixtures::load(&xllr);
        let int64_2d = TypeDescriptor::array(CdtType::Int64, 2);
        let sum = resolve(
            &xllr,
            &module,
            "callable=sum_ragged",
            &[int64_2d.clone()],
            &[TypeDescriptor::INT64],
        );
        let ragged =
            CdtArray::from_2d(CdtType::Int64, vec![vec![1_i64, 2, 3], vec![4], vec![5, 6]])
                .expect("array");
        let out = xllr
            .call(sum, Cdts::from_vec(vec![Cdt::Array(ragged.clone())]))
            .expect("sum");
        assert_eq!(out[0], Cdt::Int64(21));

        let make = resolve(&xllr, &module, "callable=make_ragged", &[], &[int64_2d]);
        let out = xllr.call(make, Cdts::default()).expect("make");
        let array = out[0].as_array().expect("array");
        assert_eq!(array.row_lengths(), vec![3, 1, 2]);
        assert_eq!(array, &ragged);

        let sum3 = resolve(
            &xllr,
            &module,
            "callable=sum_3d",
            &[TypeDescriptor::array(CdtType::Int32, 3)],
            &[TypeDescriptor::INT64],
        );
        let cube = CdtArray::from_3d(
            CdtType::Int32,
            vec![vec![vec![1_i32, 2], vec![3]], vec![vec![4, 5, 6], vec![]]],
        )
        .expect("3d");
        let out = xllr.call(sum3, Cdts::from_vec(vec![cube.into()])).expect("sum3");
        assert_eq!(out[0], Cdt::Int64(21));
        xllr.release_runtime_plugin(&plugin).expect("release plugin");
    }

    #[test]
    fn packed_arrays_round_trip() {
        let (xllr, _runtime) = fixtures::xllr();
        let (plugin, module) = fixtures::load(&xllr);
        let bytes = TypeDescriptor::packed(CdtType::UInt8);
        let echo = resolve(&xllr, &module, "callable=echo_bytes", &[bytes.clone()], &[bytes]);
        let data: Vec<u8> = (0..=255).collect();
        let out = xllr
            .call(echo, Cdts::from_vec(vec![PackedArray::new(data.clone()).into()]))
            .expect("echo bytes");
        assert_eq!(out[0].as_packed().and_then(PackedArray::as_slice::<u8>), Some(&data[..]));

        let sum = resolve(
            &xllr,
            &module,
            "callable=sum_packed_int64",
            &[TypeDescriptor::packed(CdtType::Int64)],
            &[TypeDescriptor::INT64],
        );
        let values: Vec<i64> = (1..=100).collect();
        let out = xllr
            .call(sum, Cdts::from_vec(vec![PackedArray::new(values).into()]))
            .expect("sum");
        assert_eq!(out[0], Cdt::Int64(5050));

        let unpacked = CdtArray::from_1d(CdtType::Int64, [1_i64, 2]).expect("array");
        let err = xllr
            .call(sum, Cdts::from_vec(vec![unpacked.into()]))
            .expect_err("an ordinary array is not packed");
        assert_eq!(err.kind(), ErrorKind::InvocationFailed);
        xllr.release_runtime_plugin(&plugin).expect("release plugin");
    }

    #[test]
    fn argument_packs_reach_duck_typed_guests() {
        let (xllr, runtime) = fixtures::xllr();
        let (plugin, module) = fixtures::load(&xllr);
        let all = resolve(
            &xllr,
            &module,
            "callable=arg_positional_arg_named",
            &[
                TypeDescriptor::STRING8,
                TypeDescriptor::POSITIONAL_ARGS,
                TypeDescriptor::KEYWORD_ARGS,
            ],
            &[TypeDescriptor::POSITIONAL_ARGS],
        );
        let counter = new_counter(&xllr, &module, 0);
        let args = PositionalArgs::new().with("var positional arg").with(counter);
        let kwargs = KeywordArgs::new().with("key1", "val1");
        let out = xllr
            .call(
                all,
                Cdts::from_vec(vec!["positional arg".into(), args.into(), kwargs.into()]),
            )
            .expect("call");
        let items: PositionalArgs = out[0].get().expect("list");
        let expected = PositionalArgs::new()
            .with("positional arg")
            .with("var positional arg")
            .with(counter)
            .with("key1")
            .with("val1");
        assert_eq!(items, expected);
        // the handle inside the returned list is the caller's too
        assert_eq!(xllr.handle_count(counter), Some(2));
        xllr.release_values(&out).expect("release list");

        let err = xllr
            .call(all, Cdts::from_vec(vec!["only".into(), Cdt::Null, Cdt::Null]))
            .expect_err("null is not an any[]");
        assert_eq!(err.kind(), ErrorKind::InvocationFailed);

        let named_only = resolve(
            &xllr,
            &module,
            "callable=named_only",
            &[TypeDescriptor::KEYWORD_ARGS],
            &[TypeDescriptor::STRING8],
        );
        let kwargs = KeywordArgs::new().with("named", "test");
        let out = xllr
            .call(named_only, Cdts::from_vec(vec![kwargs.into()]))
            .expect("named only");
        assert_eq!(out[0], Cdt::String8("test".into()));
        let err = xllr
            .call(named_only, Cdts::from_vec(vec![KeywordArgs::new().into()]))
            .expect_err("missing name");
        assert!(err.to_string().contains("`named`"));

        xllr.release_handle(counter).expect("release");
        assert_eq!(runtime.live_objects(), 0);
        xllr.release_runtime_plugin(&plugin).expect("release plugin");
    }

    #[test]
    fn host_callback_survives_repeated_guest_calls() {
        let (xllr, _runtime) = fixtures::xllr();
        let (plugin, module) = fixtures::load(&xllr);
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let add = xllr
            .wrap_host_function(
                move |params: &Cdts, retvals: &mut Cdts| {
                    seen.fetch_add(1, Ordering::SeqCst);
                    retvals.push(params[0].get::<i64>()? + params[1].get::<i64>()?)
                },
                Signature::new(
                    [TypeDescriptor::INT64, TypeDescriptor::INT64],
                    [TypeDescriptor::INT64],
                ),
            )
            .expect("wrap");

        let driver = resolve(
            &xllr,
            &module,
            "callable=call_callback_add",
            &[TypeDescriptor::CALLABLE, TypeDescriptor::INT64],
            &[TypeDescriptor::INT64],
        );
        let out = xllr
            .call(driver, Cdts::from_vec(vec![add.clone().into(), Cdt::Int64(100)]))
            .expect("guest drives callback");
        assert_eq!(out[0], Cdt::Int64(300));
        assert_eq!(calls.load(Ordering::SeqCst), 100);

        xllr.release_callable(&add).expect("release");
        let err = xllr
            .call(driver, Cdts::from_vec(vec![add.into(), Cdt::Int64(1)]))
            .expect_err("released callable");
        assert_eq!(err.kind(), ErrorKind::UnknownFunction);
        xllr.release_runtime_plugin(&plugin).expect("release plugin");
    }

    #[test]
    fn failing_callback_fails_the_guest_call() {
        let (xllr, _runtime) = fixtures::xllr();
        let (plugin, module) = fixtures::load(&xllr);
        let shout = xllr
            .wrap_host_function(
                |_: &Cdts, _: &mut Cdts| Err(XllrError::invocation("host refused")),
                Signature::new([TypeDescriptor::STRING8], [TypeDescriptor::STRING8]),
            )
            .expect("wrap");
        let transform = resolve(
            &xllr,
            &module,
            "callable=call_transformer",
            &[TypeDescriptor::CALLABLE, TypeDescriptor::STRING8],
            &[TypeDescriptor::STRING8],
        );
        let err = xllr
            .call(transform, Cdts::from_vec(vec![shout.clone().into(), "hi".into()]))
            .expect_err("callback failed");
        assert_eq!(err.kind(), ErrorKind::InvocationFailed);
        assert!(err.to_string().contains("host refused"));
        xllr.release_callable(&shout).expect("release");
        xllr.release_runtime_plugin(&plugin).expect("release plugin");
    }

    #[test]
    fn guest_callable_is_host_invocable() {
        let (xllr, runtime) = fixtures::xllr();
        let (plugin, module) = fixtures::load(&xllr);
        let factory = resolve(
            &xllr,
            &module,
            "callable=return_callback_add",
            &[],
            &[TypeDescriptor::CALLABLE],
        );
        let out = xllr.call(factory, Cdts::default()).expect("factory");
        let add_signature = Signature::new(
            [TypeDescriptor::INT64, TypeDescriptor::INT64],
            [TypeDescriptor::INT64],
        );
        let add = xllr
            .wrap_guest_callable(&out[0], &add_signature)
            .expect("unwrap");
        // the wrapper took its own reference
        xllr.release_callable(out[0].as_callable().expect("callable"))
            .expect("drop the returned reference");
        for i in 0..10 {
            let sum = add.call([Cdt::Int64(i), Cdt::Int64(1)]).expect("call");
            assert_eq!(sum[0], Cdt::Int64(i + 1));
        }

        let err = xllr.release_runtime_plugin(&plugin).expect_err("callable live");
        assert_eq!(err.kind(), ErrorKind::StillInUse);
        drop(add);
        assert_eq!(xllr.live_callables(), 0);
        xllr.release_runtime_plugin(&plugin).expect("release plugin");
        assert!(!runtime.is_running());
    }

    #[test]
    fn failures_are_isolated() {
        let (xllr, _runtime) = fixtures::xllr();
        let (plugin, module) = fixtures::load(&xllr);
        let fails = resolve(&xllr, &module, "callable=always_fails", &[], &[]);
        let panics = resolve(&xllr, &module, "callable=panics", &[], &[]);
        let hello = resolve(
            &xllr,
            &module,
            "callable=hello_world",
            &[],
            &[TypeDescriptor::STRING8],
        );

        for _ in 0..3 {
            let err = xllr.call(fails, Cdts::default()).expect_err("always fails");
            assert_eq!(err.kind(), ErrorKind::InvocationFailed);
            assert!(!err.kind().is_load_time());
            let XllrError::InvocationFailed {
                exception: Some(exception),
                ..
            } = err
            else {
                panic!("expected a guest exception handle, got {err}");
            };
            let code = resolve(
                &xllr,
                &module,
                "class=guest.GuestException,field=code,getter,instance_required",
                &[TypeDescriptor::HANDLE],
                &[TypeDescriptor::INT64],
            );
            let out = xllr
                .call(code, Cdts::from_vec(vec![Cdt::Handle(exception)]))
                .expect("read exception");
            assert_eq!(out[0], Cdt::Int64(7));
            xllr.release_handle(exception).expect("release exception");

            let err = xllr.call(panics, Cdts::default()).expect_err("panics");
            assert_eq!(err.kind(), ErrorKind::InvocationFailed);
            assert!(err.to_string().contains("guest bug"));

            let out = xllr.call(hello, Cdts::default()).expect("unaffected");
            assert_eq!(out.len(), 1);
        }

        let div = resolve(
            &xllr,
            &module,
            "callable=div_integers",
            &[TypeDescriptor::INT64, TypeDescriptor::INT64],
            &[TypeDescriptor::FLOAT64],
        );
        let err = xllr
            .call(div, Cdts::from_vec(vec![Cdt::Int64(1), Cdt::Int64(0)]))
            .expect_err("division by zero");
        assert!(err.to_string().contains("division by zero"));
        xllr.release_runtime_plugin(&plugin).expect("release plugin");
    }

    #[test]
    fn failed_calls_release_what_they_built() {
        let (xllr, runtime) = fixtures::xllr();
        let (plugin, module) = fixtures::load(&xllr);
        let make_then_fail = resolve(
            &xllr,
            &module,
            "callable=make_then_fail",
            &[],
            &[TypeDescriptor::HANDLE],
        );
        let export_then_panic = resolve(
            &xllr,
            &module,
            "callable=export_then_panic",
            &[],
            &[TypeDescriptor::CALLABLE],
        );

        let mut retvals = Cdts::with_capacity(1);
        let err = xllr
            .invoke(make_then_fail, &Cdts::default(), &mut retvals)
            .expect_err("fails");
        assert!(err.to_string().contains("gave up"));
        assert_eq!(err.exception(), None);
        assert!(retvals.is_empty());
        assert_eq!(runtime.live_objects(), 0);

        let err = xllr
            .invoke(export_then_panic, &Cdts::default(), &mut retvals)
            .expect_err("panics");
        assert!(err.to_string().contains("guest bug after export"));
        assert!(retvals.is_empty());
        assert_eq!(xllr.live_callables(), 0);

        xllr.release_runtime_plugin(&plugin).expect("nothing leaked");
    }

    #[test]
    fn returned_handles_belong_to_the_caller() {
        let (xllr, runtime) = fixtures::xllr();
        let (plugin, module) = fixtures::load(&xllr);
        let counter = new_counter(&xllr, &module, 0);
        assert_eq!(xllr.handle_count(counter), Some(1));

        let echo = resolve(
            &xllr,
            &module,
            "callable=echo_handle",
            &[TypeDescriptor::HANDLE],
            &[TypeDescriptor::HANDLE],
        );
        let echoed = xllr
            .call(echo, Cdts::from_vec(vec![Cdt::Handle(counter)]))
            .expect("echo");
        assert_eq!(xllr.handle_count(counter), Some(2));

        let source = xllr
            .wrap_host_function(
                move |_: &Cdts, retvals: &mut Cdts| retvals.push(counter),
                Signature::new([], [TypeDescriptor::HANDLE]),
            )
            .expect("wrap");
        let fetch = resolve(
            &xllr,
            &module,
            "callable=fetch_handle",
            &[TypeDescriptor::CALLABLE],
            &[TypeDescriptor::HANDLE],
        );
        let fetched = xllr
            .call(fetch, Cdts::from_vec(vec![source.clone().into()]))
            .expect("fetch");
        assert_eq!(fetched[0], Cdt::Handle(counter));
        assert_eq!(xllr.handle_count(counter), Some(3));

        xllr.release_values(&echoed).expect("echoed copy");
        xllr.release_values(&fetched).expect("fetched copy");
        assert_eq!(runtime.live_objects(), 1);
        xllr.release_handle(counter).expect("original");
        assert_eq!(runtime.live_objects(), 0);
        xllr.release_callable(&source).expect("release");
        xllr.release_runtime_plugin(&plugin).expect("release plugin");
    }

    #[test]
    fn release_values_walks_arrays() {
        let (xllr, runtime) = fixtures::xllr();
        let (plugin, module) = fixtures::load(&xllr);
        let first = new_counter(&xllr, &module, 1);
        let second = new_counter(&xllr, &module, 2);
        let handles = CdtArray::new(
            CdtType::Handle,
            1,
            vec![Cdt::Handle(first), Cdt::Handle(Handle::null(plugin.runtime()))],
        )
        .expect("array");
        let values = Cdts::from_vec(vec![handles.into(), Cdt::Int64(3), Cdt::Handle(second)]);
        xllr.release_values(&values).expect("release");
        assert_eq!(runtime.live_objects(), 0);

        let err = xllr.release_values(&values).expect_err("already released");
        assert_eq!(err.kind(), ErrorKind::UnknownHandle);
        xllr.release_runtime_plugin(&plugin).expect("release plugin");
    }

    #[test]
    fn module_load_is_idempotent() {
        let (xllr, _runtime) = fixtures::xllr();
        let (plugin, first) = fixtures::load(&xllr);
        let second = xllr.load_module(&plugin, fixtures::MODULE).expect("again");
        let path = "callable=echo_int64";
        let sig = [TypeDescriptor::INT64];
        let a = resolve(&xllr, &first, path, &sig, &sig);
        let b = resolve(&xllr, &second, path, &sig, &sig);
        assert_eq!(a, b);
        let input = || Cdts::from_vec(vec![Cdt::Int64(5)]);
        assert_eq!(
            xllr.call(a, input()).expect("a"),
            xllr.call(b, input()).expect("b")
        );
        xllr.release_runtime_plugin(&plugin).expect("release plugin");
    }

    #[test]
    fn zero_parameter_calls() {
        let (xllr, _runtime) = fixtures::xllr();
        let (plugin, module) = fixtures::load(&xllr);
        let no_op = resolve(&xllr, &module, "callable=no_op", &[], &[]);
        let mut pair = xllr.alloc_cdts(no_op).expect("alloc");
        assert_eq!(pair.params.capacity(), 0);
        xllr.invoke(no_op, &pair.params, &mut pair.retvals).expect("no-op");
        assert!(pair.retvals.is_empty());

        let describe = resolve(
            &xllr,
            &module,
            "class=guest.Counter,callable=describe",
            &[],
            &[TypeDescriptor::STRING8],
        );
        let out = xllr.call(describe, Cdts::default()).expect("static method");
        assert_eq!(out[0], Cdt::String8("a counter".into()));
        xllr.release_runtime_plugin(&plugin).expect("release plugin");
    }

    #[test]
    fn resolution_never_coerces() {
        let (xllr, _runtime) = fixtures::xllr();
        let (plugin, module) = fixtures::load(&xllr);
        let err = xllr
            .load_entity(
                &module,
                "callable=echo_int64",
                &[TypeDescriptor::INT32],
                &[TypeDescriptor::INT32],
            )
            .expect_err("int32 is not int64");
        assert_eq!(err.kind(), ErrorKind::SignatureMismatch);
        assert!(err.kind().is_load_time());

        let err = xllr
            .load_entity(&module, "callable=echo_int64", &[], &[TypeDescriptor::INT64])
            .expect_err("arity");
        assert_eq!(err.kind(), ErrorKind::SignatureMismatch);

        let err = xllr
            .load_entity(
                &module,
                "class=guest.Counter,callable=inc",
                &[],
                &[TypeDescriptor::INT64],
            )
            .expect_err("instance method without receiver");
        assert_eq!(err.kind(), ErrorKind::EntityNotFound);
        xllr.release_runtime_plugin(&plugin).expect("release plugin");
    }

    #[test]
    fn any_slots_are_checked_per_call() {
        let (xllr, _runtime) = fixtures::xllr();
        let (plugin, module) = fixtures::load(&xllr);
        // the caller does not know the guest type; the guest declares int64
        let echo = resolve(
            &xllr,
            &module,
            "callable=echo_int64",
            &[TypeDescriptor::ANY],
            &[TypeDescriptor::ANY],
        );
        let out = xllr
            .call(echo, Cdts::from_vec(vec![Cdt::Int64(8)]))
            .expect("int64 passes");
        assert_eq!(out[0], Cdt::Int64(8));
        let err = xllr
            .call(echo, Cdts::from_vec(vec![Cdt::String8("8".into())]))
            .expect_err("string fails at call time");
        assert_eq!(err.kind(), ErrorKind::InvocationFailed);

        // and a guest that takes anything
        let echo_any = resolve(
            &xllr,
            &module,
            "callable=echo_any",
            &[TypeDescriptor::ANY],
            &[TypeDescriptor::ANY],
        );
        for value in [Cdt::Int64(1), "x".into(), Cdt::Null] {
            let out = xllr
                .call(echo_any, Cdts::from_vec(vec![value.clone()]))
                .expect("echo any");
            assert_eq!(out[0], value);
        }
        xllr.release_runtime_plugin(&plugin).expect("release plugin");
    }

    #[test]
    fn static_types_are_checked_before_the_guest_runs() {
        let (xllr, _runtime) = fixtures::xllr();
        let (plugin, module) = fixtures::load(&xllr);
        let echo = resolve(
            &xllr,
            &module,
            "callable=echo_int64",
            &[TypeDescriptor::INT64],
            &[TypeDescriptor::INT64],
        );
        let err = xllr
            .call(echo, Cdts::from_vec(vec![Cdt::Int32(1)]))
            .expect_err("wrong kind");
        assert_eq!(err.kind(), ErrorKind::InvocationFailed);
        xllr.release_runtime_plugin(&plugin).expect("release plugin");
    }

    #[test]
    fn foreign_handles_are_rejected() {
        let (xllr, _runtime) = fixtures::xllr();
        let (plugin, module) = fixtures::load(&xllr);
        let echo = resolve(
            &xllr,
            &module,
            "callable=echo_handle",
            &[TypeDescriptor::HANDLE],
            &[TypeDescriptor::HANDLE],
        );
        let foreign = Handle::null(RuntimeId(9999));
        let err = xllr
            .call(
                echo,
                Cdts::from_vec(vec![Cdt::Handle(Handle::from_bits(RuntimeId(9999), 1 << 32))]),
            )
            .expect_err("foreign");
        assert_eq!(err.kind(), ErrorKind::ForeignHandle);

        // null handles are values, not references
        let out = xllr
            .call(echo, Cdts::from_vec(vec![Cdt::Handle(foreign)]))
            .expect("null passes through");
        assert!(xllr.is_null(out[0].get::<Handle>().expect("handle")));
        xllr.release_runtime_plugin(&plugin).expect("release plugin");
    }

    #[test]
    fn nested_calls_reenter_the_dispatcher() {
        let (xllr, _runtime) = fixtures::xllr();
        let (plugin, module) = fixtures::load(&xllr);
        let hello = resolve(
            &xllr,
            &module,
            "callable=hello_world",
            &[],
            &[TypeDescriptor::STRING8],
        );

        // host callback that itself calls back into the guest
        let inner = xllr.clone();
        let shout = xllr
            .wrap_host_function(
                move |params: &Cdts, retvals: &mut Cdts| {
                    let greeting = inner.call(hello, Cdts::default())?;
                    let input: String = params[0].get()?;
                    retvals.push(format!("{input}: {}", greeting[0].as_str().unwrap_or("")))
                },
                Signature::new([TypeDescriptor::STRING8], [TypeDescriptor::STRING8]),
            )
            .expect("wrap");
        let transform = resolve(
            &xllr,
            &module,
            "callable=call_transformer",
            &[TypeDescriptor::CALLABLE, TypeDescriptor::STRING8],
            &[TypeDescriptor::STRING8],
        );
        let out = xllr
            .call(transform, Cdts::from_vec(vec![shout.clone().into(), "guest says".into()]))
            .expect("nested");
        assert_eq!(
            out[0],
            Cdt::String8("guest says: Hello World, from the guest".into())
        );
        xllr.release_callable(&shout).expect("release");
        xllr.release_runtime_plugin(&plugin).expect("release plugin");
    }

    #[test]
    fn concurrent_calls_share_one_function_id() {
        let (xllr, runtime) = fixtures::xllr();
        let (plugin, module) = fixtures::load(&xllr);
        let counter = new_counter(&xllr, &module, 0);
        let inc = resolve(
            &xllr,
            &module,
            "class=guest.Counter,callable=inc,instance_required",
            &[TypeDescriptor::HANDLE],
            &[TypeDescriptor::INT64],
        );

        let threads: Vec<_> = (0..8)
            .map(|_| {
                let xllr = xllr.clone();
                thread::spawn(move || {
                    for _ in 0..250 {
                        xllr.call(inc, Cdts::from_vec(vec![Cdt::Handle(counter)]))
                            .expect("inc");
                    }
                })
            })
            .collect();
        for thread in threads {
            thread.join().expect("worker");
        }

        let get = resolve(
            &xllr,
            &module,
            "class=guest.Counter,callable=get,instance_required",
            &[TypeDescriptor::HANDLE],
            &[TypeDescriptor::INT64],
        );
        let out = xllr
            .call(get, Cdts::from_vec(vec![Cdt::Handle(counter)]))
            .expect("get");
        assert_eq!(out[0], Cdt::Int64(2000));
        xllr.release_handle(counter).expect("release");
        assert_eq!(runtime.live_objects(), 0);
        xllr.release_runtime_plugin(&plugin).expect("release plugin");
    }
}
