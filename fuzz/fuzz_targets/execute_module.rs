#![no_main]

use libfuzzer_sys::fuzz_target;

use wasmbed::parser::module::ExportIndex;
use wasmbed::{Environment, Module, Runtime, RuntimeConfig, Value};

fuzz_target!(|data: &[u8]| {
    let env = Environment::new();
    let module = match Module::parse(&env, data) {
        Ok(m) => m,
        Err(_) => return, // Invalid module, nothing to execute
    };
    let exports: Vec<String> = module
        .info()
        .exports
        .iter()
        .filter(|e| matches!(e.index, ExportIndex::Function(_)))
        .map(|e| e.name.clone())
        .collect();

    // A step limit keeps infinite loops from hanging the fuzzer
    let config = RuntimeConfig::default()
        .with_step_limit(Some(100_000))
        .with_max_memory_pages(16);
    let Ok(runtime) = Runtime::with_config(&env, config) else {
        return;
    };
    let loaded = match runtime.load(module) {
        Ok(loaded) => loaded,
        Err(_) => return, // Instantiation failed (e.g., missing imports)
    };
    if runtime.run_start(&loaded).is_err() {
        return;
    }

    for name in exports {
        if let Ok(func) = runtime.find_function(&name) {
            let args: Vec<Value> = func.descriptor().params.iter().map(|t| Value::default_for(*t)).collect();
            let _ = func.call(&args);
        }
    }
});
