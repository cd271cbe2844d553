//! Command line runner
//!
//! Loads a module, runs its start function, and optionally calls an export
//! with textual arguments.
//!
//! Usage: wasmbed [--stack-size BYTES] [--step-limit N] [--dump] [--json] FILE [FUNC [ARGS...]]

use std::env;
use std::fs;
use std::process;

use serde_json::json;
use tracing_subscriber::{fmt, EnvFilter};
use wasmbed::parser::module::{ExportIndex, ImportDesc, ParsedModule};
use wasmbed::{Environment, Error, Module, Runtime, RuntimeConfig, Value};

struct Options {
    config: RuntimeConfig,
    dump: bool,
    json: bool,
    file: String,
    function: Option<String>,
    args: Vec<String>,
}

fn print_help(prog: &str) {
    eprintln!("Usage: {prog} [options] <module.wasm> [FUNC [ARGS...]]");
    eprintln!();
    eprintln!("Loads a module and runs its start function. When FUNC is given the");
    eprintln!("export is called with ARGS converted to its parameter types.");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  --stack-size BYTES  Value stack size (default: WASMBED_STACK_SIZE or 65536)");
    eprintln!("  --step-limit N      Trap after N executed instructions per call");
    eprintln!("  --dump              Print imports, exports, memory and data segments");
    eprintln!("  --json              Print output as JSON");
    eprintln!("  -h, --help          Show this help message");
    eprintln!();
    eprintln!("Logging is controlled with WASMBED_LOG or RUST_LOG.");
}

fn parse_number<T: std::str::FromStr>(flag: &str, value: Option<&String>) -> Result<T, String> {
    value
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| format!("{flag} requires a number"))
}

fn parse_options(args: &[String]) -> Result<Options, String> {
    let mut config = RuntimeConfig::from_env();
    let mut dump = false;
    let mut json = false;
    let mut positional = Vec::new();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--stack-size" if positional.is_empty() => {
                i += 1;
                config = config.with_stack_size(parse_number("--stack-size", args.get(i))?);
            }
            "--step-limit" if positional.is_empty() => {
                i += 1;
                config = config.with_step_limit(Some(parse_number("--step-limit", args.get(i))?));
            }
            "--dump" if positional.is_empty() => dump = true,
            "--json" if positional.is_empty() => json = true,
            opt if opt.starts_with("--") && positional.is_empty() => {
                return Err(format!("unknown option: {opt}"));
            }
            // everything after FILE belongs to the call, including negative numbers
            arg => positional.push(arg.to_string()),
        }
        i += 1;
    }

    let mut positional = positional.into_iter();
    let file = positional.next().ok_or("no module file given")?;
    Ok(Options {
        config,
        dump,
        json,
        file,
        function: positional.next(),
        args: positional.collect(),
    })
}

fn init_logging() {
    let filter = EnvFilter::try_from_env("WASMBED_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("warn"));
    let subscriber = fmt::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .compact()
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

fn dump_text(info: &ParsedModule) {
    println!("imports:");
    for import in &info.imports {
        match &import.desc {
            ImportDesc::Function(type_idx) => {
                let sig = info.types.get(*type_idx as usize).map(|t| t.to_string()).unwrap_or_default();
                println!("  {}.{} {sig}", import.module, import.name);
            }
            _ => println!("  {import}"),
        }
    }
    println!("exports:");
    for export in &info.exports {
        match export.index {
            ExportIndex::Function(idx) => {
                let sig = info.function_type(idx).map(|t| t.to_string()).unwrap_or_default();
                println!("  {} {sig}", export.name);
            }
            _ => println!("  {export}"),
        }
    }
    match info.memory_limits() {
        Some(limits) => println!("memory: {limits}"),
        None => println!("memory: none"),
    }
    println!("data:");
    for (i, segment) in info.data.iter().enumerate() {
        println!("  [{i}] offset {:?}, {} bytes: {}", segment.offset, segment.bytes.len(), hex::encode(&segment.bytes));
    }
}

fn dump_json(info: &ParsedModule) -> serde_json::Value {
    let imports: Vec<_> = info
        .imports
        .iter()
        .map(|import| {
            let signature = match &import.desc {
                ImportDesc::Function(type_idx) => info.types.get(*type_idx as usize).map(|t| t.to_string()),
                _ => None,
            };
            json!({ "module": import.module, "name": import.name, "desc": import.to_string(), "signature": signature })
        })
        .collect();
    let exports: Vec<_> = info
        .exports
        .iter()
        .map(|export| {
            let signature = match export.index {
                ExportIndex::Function(idx) => info.function_type(idx).map(|t| t.to_string()),
                _ => None,
            };
            json!({ "name": export.name, "signature": signature })
        })
        .collect();
    let data: Vec<_> = info
        .data
        .iter()
        .map(|segment| json!({ "offset": format!("{:?}", segment.offset), "bytes": hex::encode(&segment.bytes) }))
        .collect();
    let memory = info.memory_limits().map(|l| json!({ "min": l.min, "max": l.max }));
    json!({ "imports": imports, "exports": exports, "memory": memory, "data": data })
}

fn run(options: &Options) -> Result<(), Error> {
    let bytes = fs::read(&options.file)
        .map_err(|e| Error::not_found(format!("couldn't read {}: {e}", options.file)))?;

    let env = Environment::new();
    let module = Module::parse(&env, &bytes)?;
    if options.dump {
        match options.json {
            true => println!("{}", dump_json(module.info())),
            false => dump_text(module.info()),
        }
        if options.function.is_none() {
            return Ok(());
        }
    }

    let runtime = Runtime::with_config(&env, options.config)?;
    let loaded = runtime.load(module)?;
    runtime.run_start(&loaded)?;

    let Some(name) = &options.function else {
        return Ok(());
    };
    let func = runtime.find_function(name)?;
    if options.args.len() != func.arg_count() {
        return Err(Error::arg_mismatch(format!(
            "{} expects {} arguments, got {}",
            func.descriptor(),
            func.arg_count(),
            options.args.len()
        )));
    }
    let args = options
        .args
        .iter()
        .enumerate()
        .map(|(i, text)| match func.arg_type(i) {
            Some(typ) => Value::parse(typ, text).map_err(Error::arg_mismatch),
            None => Err(Error::arg_mismatch(format!("no parameter {i}"))),
        })
        .collect::<Result<Vec<_>, _>>()?;

    let results = func.call(&args)?;
    if options.json {
        println!("{}", json!({ "function": func.descriptor(), "results": results }));
    } else {
        for value in &results {
            println!("{value}");
        }
    }
    Ok(())
}

fn main() {
    let args: Vec<String> = env::args().collect();
    let prog = args.first().map(String::as_str).unwrap_or("wasmbed");

    if args.len() < 2 || args.iter().any(|a| a == "-h" || a == "--help") {
        print_help(prog);
        process::exit(if args.len() < 2 { 1 } else { 0 });
    }

    init_logging();

    let options = match parse_options(&args) {
        Ok(options) => options,
        Err(msg) => {
            eprintln!("{msg}");
            print_help(prog);
            process::exit(1);
        }
    };

    if let Err(err) = run(&options) {
        if options.json {
            println!("{}", json!({ "error": err.to_string(), "code": err.code() }));
        } else {
            eprintln!("error: {err}");
        }
        process::exit(err.code() as i32);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        std::iter::once("wasmbed").chain(list.iter().copied()).map(String::from).collect()
    }

    #[test]
    fn options_stop_at_the_first_positional() {
        let options = parse_options(&args(&["--stack-size", "4096", "--json", "m.wasm", "f", "--dump", "-3"])).unwrap();
        assert_eq!(options.config.stack_size_bytes, 4096);
        assert!(options.json);
        assert!(!options.dump);
        assert_eq!(options.file, "m.wasm");
        assert_eq!(options.function.as_deref(), Some("f"));
        assert_eq!(options.args, vec!["--dump", "-3"]);
    }

    #[test]
    fn step_limit_and_errors() {
        let options = parse_options(&args(&["--step-limit", "10", "m.wasm"])).unwrap();
        assert_eq!(options.config.step_limit, Some(10));
        assert_eq!(options.function, None);

        assert!(parse_options(&args(&["--step-limit", "ten", "m.wasm"])).is_err());
        assert!(parse_options(&args(&["--verbose", "m.wasm"])).is_err());
        assert!(parse_options(&args(&["--dump"])).is_err());
    }
}
