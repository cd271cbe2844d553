mod common;

#[cfg(test)]
mod tests {
    use crate::common;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use rstest::rstest;
    use wasmbed::parser::{self, ParseErrorKind};
    use wasmbed::{Environment, Module, ResultCode};

    #[rstest]
    #[case::empty(b"")]
    #[case::short_magic(b"\0as")]
    #[case::bad_magic(b"\0wasm\x01\0\0")]
    #[case::bad_version(b"\0asm\x02\0\0\0")]
    fn bad_header_is_a_parse_error(#[case] bytes: &[u8]) {
        let env = Environment::new();
        let err = Module::parse(&env, bytes).unwrap_err();
        assert_eq!(err.code(), ResultCode::ParseError);
        assert_eq!(env.last_error().unwrap().code, ResultCode::ParseError);
    }

    #[test]
    fn minimal_module_parses() {
        let info = parser::parse(b"\0asm\x01\0\0\0").unwrap();
        assert!(info.types.is_empty());
        assert!(info.exports.is_empty());
        assert_eq!(info.start, None);
    }

    #[test]
    fn parsing_twice_is_deterministic() {
        let bytes = common::recursion_module();
        let first = parser::parse(&bytes).unwrap();
        let second = parser::parse(&bytes).unwrap();
        assert_eq!(format!("{first:?}"), format!("{second:?}"));
    }

    #[test]
    fn truncated_input_never_panics() {
        let bytes = common::memory_module(Some(2));
        let mut rejected = 0;
        for len in 0..bytes.len() {
            // a cut on a section boundary can leave a valid prefix
            if let Err(err) = parser::parse(&bytes[..len]) {
                assert!(err.offset <= len, "offset {} past truncation at {len}", err.offset);
                rejected += 1;
            }
        }
        assert!(rejected > bytes.len() / 2);
    }

    #[test]
    fn duplicate_section_is_rejected() {
        let mut bytes = b"\0asm\x01\0\0\0".to_vec();
        // two empty type sections
        bytes.extend_from_slice(&[0x01, 0x01, 0x00, 0x01, 0x01, 0x00]);
        let err = parser::parse(&bytes).unwrap_err();
        assert!(matches!(err.kind, ParseErrorKind::SectionOutOfOrder(_)));
    }

    #[test]
    fn random_bytes_never_panic() {
        let mut rng = StdRng::seed_from_u64(0x5eed);
        for _ in 0..2000 {
            let len = rng.gen_range(0..256);
            let mut bytes: Vec<u8> = (0..len).map(|_| rng.gen()).collect();
            if rng.gen_bool(0.5) && bytes.len() >= 8 {
                bytes[..8].copy_from_slice(b"\0asm\x01\0\0\0");
            }
            let _ = parser::parse(&bytes);
        }
    }

    #[test]
    fn mutated_modules_never_panic() {
        let mut rng = StdRng::seed_from_u64(42);
        let original = common::recursion_module();
        for _ in 0..2000 {
            let mut bytes = original.clone();
            for _ in 0..rng.gen_range(1..4) {
                let idx = rng.gen_range(8..bytes.len());
                bytes[idx] = rng.gen();
            }
            if let Ok(info) = parser::parse(&bytes) {
                assert_eq!(info.code.len(), info.functions.len());
            }
        }
    }
}
