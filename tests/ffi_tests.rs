mod common;

#[cfg(test)]
mod tests {
    use crate::common;
    use std::ffi::{c_void, CStr};
    use std::ptr;
    use std::sync::atomic::{AtomicU32, Ordering};
    use wasmbed::ffi::*;
    use wasmbed::parser::builder::{Code, ModuleBuilder};
    use wasmbed::parser::module::ValueType::*;
    use wasmbed::{ResultCode, Value};

    const OK: i32 = ResultCode::Ok as i32;

    fn value(raw: WasmbedValue) -> Value {
        match raw.ty {
            WASMBED_TYPE_I32 => Value::I32(raw.bits as u32 as i32),
            WASMBED_TYPE_I64 => Value::I64(raw.bits as i64),
            other => panic!("unexpected type code {other}"),
        }
    }

    fn parse_module(env: u64, bytes: &[u8]) -> u64 {
        let mut module = 0;
        let rc = unsafe { wasmbed_parse_module(env, bytes.as_ptr(), bytes.len() as u64, &mut module) };
        assert_eq!(rc, OK);
        module
    }

    #[test]
    fn add_round_trip() {
        let env = wasmbed_new_environment();
        assert_ne!(env, 0);
        let rt = wasmbed_new_runtime(env, 64 * 1024);
        assert_ne!(rt, 0);
        let module = parse_module(env, &common::add_module());
        assert_eq!(wasmbed_load_module(rt, module), OK);
        assert_eq!(wasmbed_run_start(rt, module), OK);

        let mut add = 0;
        assert_eq!(unsafe { wasmbed_find_function(rt, c"add".as_ptr(), &mut add) }, OK);
        assert_eq!(wasmbed_get_arg_count(add), 2);
        assert_eq!(wasmbed_get_ret_count(add), 1);

        let args = [
            WasmbedValue { ty: WASMBED_TYPE_I32, bits: 2 },
            WasmbedValue { ty: WASMBED_TYPE_I32, bits: 3 },
        ];
        assert_eq!(unsafe { wasmbed_call(add, args.as_ptr(), 2) }, OK);
        let mut results = [WasmbedValue::NONE; 2];
        let mut count = 0;
        assert_eq!(unsafe { wasmbed_get_results(add, results.as_mut_ptr(), 2, &mut count) }, OK);
        assert_eq!(count, 1);
        assert_eq!(value(results[0]), Value::I32(5));

        let argv = [c"-7".as_ptr(), c"0x10".as_ptr()];
        assert_eq!(unsafe { wasmbed_call_argv(add, 2, argv.as_ptr()) }, OK);
        assert_eq!(unsafe { wasmbed_get_results(add, results.as_mut_ptr(), 2, &mut count) }, OK);
        assert_eq!(value(results[0]), Value::I32(9));

        assert_eq!(unsafe { wasmbed_call(add, args.as_ptr(), 1) }, ResultCode::ArgMismatch as i32);
        let mut info: WasmbedErrorInfo = unsafe { std::mem::zeroed() };
        assert_eq!(unsafe { wasmbed_get_error_info(rt, &mut info) }, OK);
        assert_eq!(info.code, ResultCode::ArgMismatch as i32);
        assert!(info.line > 0);
        let message = CStr::from_bytes_until_nul(&info.message).unwrap().to_str().unwrap();
        assert!(message.contains("takes 2 arguments"), "{message}");

        let mut missing = 0;
        let rc = unsafe { wasmbed_find_function(rt, c"missing".as_ptr(), &mut missing) };
        assert_eq!(rc, ResultCode::NotFound as i32);

        assert_eq!(wasmbed_free_runtime(rt), OK);
        assert_eq!(unsafe { wasmbed_call(add, args.as_ptr(), 2) }, ResultCode::InvalidState as i32);
        assert_eq!(wasmbed_free_module(module), OK);
        assert_eq!(wasmbed_free_environment(env), OK);
    }

    unsafe extern "C" fn count_calls(
        user_data: *mut c_void,
        memory: *mut u8,
        memory_len: u64,
        args: *const WasmbedValue,
        nargs: u32,
        _results: *mut WasmbedValue,
        _nresults: u32,
    ) -> i32 {
        let counter = &*(user_data as *const AtomicU32);
        counter.fetch_add(1, Ordering::SeqCst);
        if nargs != 1 || memory_len == 0 {
            return 1;
        }
        let addr = (*args).bits as usize;
        *memory.add(addr) = 0xAB;
        0
    }

    #[test]
    fn raw_host_function_sees_user_data_and_memory() {
        let mut b = ModuleBuilder::new();
        let mark = b.import_function("host", "mark", &[I32], &[]);
        b.memory(1, Some(1));
        let run = b.add_function(&[], &[], &[], Code::new().i32_const(100).call(mark).end());
        b.export_function("run", run);

        let counter = AtomicU32::new(0);
        let env = wasmbed_new_environment();
        let rt = wasmbed_new_runtime(env, 64 * 1024);
        let module = parse_module(env, &b.build());

        let rc = unsafe {
            wasmbed_link_raw_function(
                module,
                c"host".as_ptr(),
                c"mark".as_ptr(),
                c"v(I)".as_ptr(),
                Some(count_calls),
                &counter as *const AtomicU32 as *mut c_void,
            )
        };
        assert_eq!(rc, ResultCode::LinkError as i32);
        let rc = unsafe {
            wasmbed_link_raw_function(
                module,
                c"host".as_ptr(),
                c"mark".as_ptr(),
                c"v(i)".as_ptr(),
                Some(count_calls),
                &counter as *const AtomicU32 as *mut c_void,
            )
        };
        assert_eq!(rc, OK);
        assert_eq!(wasmbed_load_module(rt, module), OK);

        let mut run = 0;
        assert_eq!(unsafe { wasmbed_find_function(rt, c"run".as_ptr(), &mut run) }, OK);
        assert_eq!(unsafe { wasmbed_call(run, ptr::null(), 0) }, OK);
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        let mut data = ptr::null_mut();
        let mut len = 0;
        assert_eq!(unsafe { wasmbed_get_memory(rt, &mut data, &mut len) }, OK);
        assert_eq!(len, 65536);
        assert_eq!(unsafe { *data.add(100) }, 0xAB);
        let mut size = 0;
        assert_eq!(unsafe { wasmbed_get_memory_size(rt, &mut size) }, OK);
        assert_eq!(size, len);

        let mut tag = 7u32;
        assert_eq!(wasmbed_set_user_data(rt, &mut tag as *mut u32 as *mut c_void), OK);
        let mut back = ptr::null_mut();
        assert_eq!(unsafe { wasmbed_get_user_data(rt, &mut back) }, OK);
        assert_eq!(back as *mut u32, &mut tag as *mut u32);

        assert_eq!(wasmbed_free_runtime(rt), OK);
        assert_eq!(wasmbed_free_module(module), OK);
        assert_eq!(wasmbed_free_environment(env), OK);
    }

    #[test]
    fn stale_handles_are_rejected() {
        let env = wasmbed_new_environment();
        let rt = wasmbed_new_runtime(env, 64 * 1024);
        assert_eq!(wasmbed_free_runtime(rt), OK);
        assert_eq!(wasmbed_free_runtime(rt), ResultCode::InvalidState as i32);
        assert_eq!(wasmbed_load_module(rt, 0), ResultCode::InvalidState as i32);
        assert_eq!(wasmbed_get_arg_count(0), 0);

        let module = parse_module(env, &common::add_module());
        let second = wasmbed_new_runtime(env, 64 * 1024);
        assert_eq!(wasmbed_free_environment(env), OK);
        assert_eq!(wasmbed_load_module(second, module), ResultCode::InvalidState as i32);
        let mut size = 0;
        let rc = unsafe { wasmbed_get_memory_size(second, &mut size) };
        assert_eq!(rc, ResultCode::InvalidState as i32);
        assert_eq!(wasmbed_new_runtime(env, 64 * 1024), 0);
        assert_eq!(wasmbed_free_runtime(second), OK);
        assert_eq!(wasmbed_free_module(module), OK);
    }

    #[test]
    fn bad_bytes_report_parse_error() {
        let env = wasmbed_new_environment();
        let mut module = 0;
        let rc = unsafe { wasmbed_parse_module(env, b"\0asm\x02".as_ptr(), 5, &mut module) };
        assert_eq!(rc, ResultCode::ParseError as i32);
        assert_eq!(module, 0);

        let mut info: WasmbedErrorInfo = unsafe { std::mem::zeroed() };
        assert_eq!(unsafe { wasmbed_get_error_info(env, &mut info) }, OK);
        assert_eq!(info.code, ResultCode::ParseError as i32);
        assert_eq!(wasmbed_reset_error_info(env), OK);
        assert_eq!(unsafe { wasmbed_get_error_info(env, &mut info) }, OK);
        assert_eq!(info.code, OK);

        let text = unsafe { CStr::from_ptr(wasmbed_result_message(ResultCode::ParseError as i32)) };
        assert_eq!(text.to_str().unwrap(), "parse error");
        assert_eq!(wasmbed_free_environment(env), OK);
    }
}
