use std::process;

use clap::{Parser as ClapParser, Subcommand};
use log::{LevelFilter, warn};

use xllr::{
    Cdt, CdtType, Cdts, EntityPath, Handle, PackedArray, RuntimeId, TypeDescriptor, Xllr,
    XllrError,
};

#[derive(ClapParser, Debug)]
#[command(author, version, about = "Cross-language call runtime diagnostics", long_about = None)]
struct Cli {
    /// Raise log verbosity (-v info, -vv debug, -vvv trace). RUST_LOG wins.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Parse an entity path and print its parts
    CheckPath {
        #[arg(help = "e.g. class=pkg.Type,callable=method,instance_required")]
        path: String,
    },
    /// Load a plugin and module, then call one entity
    Call {
        #[arg(
            long,
            help = "Runtime plugin name, searched in XLLR_HOME and XLLR_PLUGIN_PATH"
        )]
        plugin: String,
        #[arg(long, help = "Module location understood by the plugin")]
        module: String,
        #[arg(long, help = "Entity path")]
        entity: String,
        #[arg(long = "param", value_parser = parse_param, help = "Parameter as type:value")]
        params: Vec<(TypeDescriptor, Cdt)>,
        #[arg(long = "ret", value_parser = parse_type, help = "Return type, once per slot")]
        retvals: Vec<TypeDescriptor>,
    },
}

fn parse_type(raw: &str) -> Result<TypeDescriptor, String> {
    raw.parse::<TypeDescriptor>().map_err(|err| err.to_string())
}

/// Comma-separated elements of a packed array; empty for no elements.
fn parse_list<T: std::str::FromStr>(raw: &str, value: &str) -> Result<Vec<T>, String>
where
    T::Err: std::fmt::Display,
{
    value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(|item| item.parse().map_err(|err| format!("`{raw}`: `{item}`: {err}")))
        .collect()
}

fn parse_packed(raw: &str, base: CdtType, value: &str) -> Result<PackedArray, String> {
    let packed: PackedArray = match base {
        CdtType::Bool => parse_list::<bool>(raw, value)?.into(),
        CdtType::Int8 => parse_list::<i8>(raw, value)?.into(),
        CdtType::Int16 => parse_list::<i16>(raw, value)?.into(),
        CdtType::Int32 => parse_list::<i32>(raw, value)?.into(),
        CdtType::Int64 => parse_list::<i64>(raw, value)?.into(),
        CdtType::UInt8 => parse_list::<u8>(raw, value)?.into(),
        CdtType::UInt16 => parse_list::<u16>(raw, value)?.into(),
        CdtType::UInt32 => parse_list::<u32>(raw, value)?.into(),
        CdtType::UInt64 => parse_list::<u64>(raw, value)?.into(),
        CdtType::Float32 => parse_list::<f32>(raw, value)?.into(),
        CdtType::Float64 => parse_list::<f64>(raw, value)?.into(),
        other => return Err(format!("`{raw}`: {other} cannot be packed")),
    };
    Ok(packed)
}

/// `type:value` for scalars and strings, `handle:null` for a null handle,
/// `int64[packed]:1,2,3` for a packed array.
fn parse_param(raw: &str) -> Result<(TypeDescriptor, Cdt), String> {
    let (ty, value) = raw
        .split_once(':')
        .ok_or_else(|| format!("`{raw}`: expected type:value"))?;
    let descriptor = parse_type(ty)?;
    if descriptor.packed {
        let packed = parse_packed(raw, descriptor.base, value)?;
        return Ok((descriptor, Cdt::Packed(packed)));
    }
    if descriptor.is_array() {
        return Err(format!("`{raw}`: only packed arrays can be given on the command line"));
    }
    let bad = |err: &dyn std::fmt::Display| format!("`{raw}`: {err}");
    let one_char = || {
        let mut chars = value.chars();
        match (chars.next(), chars.next()) {
            (Some(c), None) => Ok(c),
            _ => Err(format!("`{raw}`: expected exactly one character")),
        }
    };
    let cdt = match descriptor.base {
        CdtType::Null => Cdt::Null,
        CdtType::Bool => Cdt::Bool(value.parse().map_err(|e| bad(&e))?),
        CdtType::Int8 => Cdt::Int8(value.parse().map_err(|e| bad(&e))?),
        CdtType::Int16 => Cdt::Int16(value.parse().map_err(|e| bad(&e))?),
        CdtType::Int32 => Cdt::Int32(value.parse().map_err(|e| bad(&e))?),
        CdtType::Int64 => Cdt::Int64(value.parse().map_err(|e| bad(&e))?),
        CdtType::UInt8 => Cdt::UInt8(value.parse().map_err(|e| bad(&e))?),
        CdtType::UInt16 => Cdt::UInt16(value.parse().map_err(|e| bad(&e))?),
        CdtType::UInt32 => Cdt::UInt32(value.parse().map_err(|e| bad(&e))?),
        CdtType::UInt64 => Cdt::UInt64(value.parse().map_err(|e| bad(&e))?),
        CdtType::Float32 => Cdt::Float32(value.parse().map_err(|e| bad(&e))?),
        CdtType::Float64 => Cdt::Float64(value.parse().map_err(|e| bad(&e))?),
        CdtType::Char8 => {
            let c = one_char()?;
            Cdt::Char8(u8::try_from(c).map_err(|e| bad(&e))?)
        }
        CdtType::Char16 => {
            let c = one_char()?;
            Cdt::Char16(u16::try_from(u32::from(c)).map_err(|e| bad(&e))?)
        }
        CdtType::Char32 => Cdt::Char32(one_char()?),
        CdtType::String8 => Cdt::String8(value.to_string()),
        CdtType::String16 => Cdt::string16(value),
        CdtType::String32 => Cdt::string32(value),
        CdtType::Handle if value == "null" => Cdt::Handle(Handle::null(RuntimeId::NONE)),
        other => {
            return Err(format!("`{raw}`: {other} values cannot be given on the command line"));
        }
    };
    Ok((descriptor, cdt))
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .init();
}

fn check_path(raw: &str) -> Result<(), XllrError> {
    let path = EntityPath::parse(raw)?;
    for (key, value) in path.pairs() {
        match value {
            Some(value) => println!("{:<18} {value}", key.name()),
            None => println!("{}", key.name()),
        }
    }
    let (owner, member) = path.split_member();
    if let Some(owner) = owner {
        println!("{:<18} {owner}", "owner");
    }
    println!("{:<18} {member}", "member");
    Ok(())
}

fn call(
    plugin: &str,
    module: &str,
    entity: &str,
    params: Vec<(TypeDescriptor, Cdt)>,
    retvals: &[TypeDescriptor],
) -> Result<(), XllrError> {
    let xllr = Xllr::global();
    let plugin = xllr.load_runtime_plugin(plugin)?;
    let (types, values): (Vec<_>, Vec<_>) = params.into_iter().unzip();

    let result = xllr
        .load_module(&plugin, module)
        .and_then(|module| xllr.load_entity(&module, entity, &types, retvals))
        .and_then(|function| xllr.call(function, Cdts::from_vec(values)));
    match result {
        Ok(out) => {
            for (slot, value) in out.iter().enumerate() {
                println!("[{slot}] {value:?}");
            }
            if let Err(err) = xllr.release_values(&out) {
                warn!("releasing returned values: {err}");
            }
        }
        Err(XllrError::InvocationFailed {
            message,
            exception: Some(exception),
        }) => {
            if let Err(err) = xllr.release_handle(exception) {
                warn!("releasing the guest exception: {err}");
            }
            xllr.release_runtime_plugin(&plugin)?;
            return Err(XllrError::invocation(message));
        }
        Err(err) => {
            xllr.release_runtime_plugin(&plugin)?;
            return Err(err);
        }
    }
    xllr.release_runtime_plugin(&plugin)
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let result = match cli.command {
        Command::CheckPath { path } => check_path(&path),
        Command::Call {
            plugin,
            module,
            entity,
            params,
            retvals,
        } => call(&plugin, &module, &entity, params, &retvals),
    };

    if let Err(err) = result {
        eprintln!("Error ({:?}): {err}", err.kind());
        process::exit(1);
    }
}
