#![no_main]

use libfuzzer_sys::fuzz_target;

use wasmbed::parser;

fuzz_target!(|data: &[u8]| {
    // We don't care about the result - we're looking for panics/crashes
    let _ = parser::parse(data);
});
