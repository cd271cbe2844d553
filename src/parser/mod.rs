//! Binary module decoder.
//!
//! [`parse`] reads a complete `.wasm` image, checks section order and
//! sizes, resolves every index against the declared counts and validates
//! each function body. The result is either a fully valid
//! [`module::ParsedModule`] or a [`ParseError`]; nothing partial escapes.

pub mod builder;
pub mod encoding;
pub mod error;
pub mod instruction;
pub mod limits;
pub mod module;
pub mod reader;
pub mod structure;
pub mod validate;

pub use error::{ParseError, ParseErrorKind};

use encoding::*;
use instruction::Instruction;
use module::*;
use reader::Reader;
use std::collections::HashSet;
use structure::ControlMap;
use tracing::{debug, trace};
use validate::{CodeValidator, ValidationError};

pub fn parse(bytes: &[u8]) -> Result<ParsedModule, ParseError> {
    let mut reader = Reader::new(bytes);
    read_header(&mut reader)?;

    let mut module = ParsedModule::default();
    let mut last_rank = 0;

    while !reader.is_empty() {
        let section_start = reader.pos();
        let sec_id = reader.read_byte()?;
        let sec_len = reader.read_vu32()?;
        let mut section = reader.sub_reader(sec_len as usize)?;

        if sec_id == SECTION_CUSTOM {
            let name = section.read_name()?;
            trace!(name = %name, len = sec_len, "skipping custom section");
            module.custom_sections.push(name);
            continue;
        }

        let rank = section_rank(sec_id)
            .ok_or_else(|| reader.error_at(section_start, ParseErrorKind::UnknownSection(sec_id)))?;
        if rank <= last_rank {
            return Err(reader.error_at(section_start, ParseErrorKind::SectionOutOfOrder(sec_id)));
        }
        last_rank = rank;

        trace!(id = sec_id, len = sec_len, offset = section_start, "section");
        read_section(sec_id, &mut section, &mut module)?;

        if !section.is_empty() {
            return Err(section.error(ParseErrorKind::SectionSizeMismatch));
        }
    }

    if module.functions.len() != module.code.len() {
        return Err(reader.error(ParseErrorKind::FunctionCodeMismatch));
    }
    if let Some(count) = module.data_count {
        if count as usize != module.data.len() {
            return Err(reader.error(ParseErrorKind::DataCountMismatch));
        }
    }

    debug!(
        types = module.types.len(),
        imports = module.imports.len(),
        functions = module.functions.len(),
        exports = module.exports.len(),
        "parsed module"
    );
    Ok(module)
}

fn read_header(reader: &mut Reader) -> Result<(), ParseError> {
    let magic = reader
        .read_u32()
        .map_err(|_| reader.error_at(0, ParseErrorKind::BadMagic))?;
    if magic != MAGIC {
        return Err(reader.error_at(0, ParseErrorKind::BadMagic));
    }
    let version = reader.read_u32()?;
    if version != VERSION {
        return Err(reader.error_at(4, ParseErrorKind::UnsupportedVersion(version)));
    }
    Ok(())
}

fn read_section(sec_id: u8, reader: &mut Reader, module: &mut ParsedModule) -> Result<(), ParseError> {
    match sec_id {
        SECTION_TYPE => read_section_type(reader, module),
        SECTION_IMPORT => read_section_import(reader, module),
        SECTION_FUNCTION => read_section_function(reader, module),
        SECTION_TABLE => read_section_table(reader, module),
        SECTION_MEMORY => read_section_memory(reader, module),
        SECTION_GLOBAL => read_section_global(reader, module),
        SECTION_EXPORT => read_section_export(reader, module),
        SECTION_START => read_section_start(reader, module),
        SECTION_ELEMENT => read_section_element(reader, module),
        SECTION_DATA_COUNT => {
            module.data_count = Some(reader.read_vu32()?);
            Ok(())
        }
        SECTION_CODE => read_section_code(reader, module),
        SECTION_DATA => read_section_data(reader, module),
        _ => Err(reader.error(ParseErrorKind::UnknownSection(sec_id))),
    }
}

/* SECTION READERS ************************************************/

fn read_count(reader: &mut Reader, limit: u32, what: &'static str) -> Result<u32, ParseError> {
    let at = reader.pos();
    let count = reader.read_vu32()?;
    if count > limit {
        return Err(reader.error_at(at, ParseErrorKind::LimitExceeded(what)));
    }
    reader.check_count(count)?;
    Ok(count)
}

fn read_value_type(reader: &mut Reader) -> Result<ValueType, ParseError> {
    let at = reader.pos();
    let byte = reader.read_byte()?;
    ValueType::decode(byte).ok_or_else(|| reader.error_at(at, ParseErrorKind::InvalidValueType(byte)))
}

fn read_result_types(reader: &mut Reader, limit: u32, what: &'static str) -> Result<Vec<ValueType>, ParseError> {
    let count = read_count(reader, limit, what)?;
    let mut types = Vec::with_capacity(count as usize);
    for _ in 0..count {
        types.push(read_value_type(reader)?);
    }
    Ok(types)
}

fn read_limits(reader: &mut Reader) -> Result<Limits, ParseError> {
    let at = reader.pos();
    let flags = reader.read_byte()?;
    let limits = match flags {
        LIMITS_MIN => Limits {
            min: reader.read_vu32()?,
            max: None,
        },
        LIMITS_MIN_MAX => Limits {
            min: reader.read_vu32()?,
            max: Some(reader.read_vu32()?),
        },
        _ => return Err(reader.error_at(at, ParseErrorKind::InvalidLimitsFlags(flags))),
    };
    if let Some(max) = limits.max {
        if limits.min > max {
            return Err(reader.error_at(at, ParseErrorKind::LimitsMinExceedsMax));
        }
    }
    Ok(limits)
}

fn read_memory_limits(reader: &mut Reader) -> Result<Limits, ParseError> {
    let at = reader.pos();
    let limits = read_limits(reader)?;
    if limits.min > limits::MAX_MEMORY_PAGES || limits.max.unwrap_or(0) > limits::MAX_MEMORY_PAGES {
        return Err(reader.error_at(at, ParseErrorKind::MemoryTooLarge));
    }
    Ok(limits)
}

fn read_table_type(reader: &mut Reader) -> Result<TableType, ParseError> {
    let at = reader.pos();
    let ref_type = reader.read_byte()?;
    if ref_type != TYPE_FUNCREF {
        return Err(reader.error_at(at, ParseErrorKind::InvalidRefType(ref_type)));
    }
    let limits = read_limits(reader)?;
    if limits.min > limits::MAX_TABLE_SIZE {
        return Err(reader.error_at(at, ParseErrorKind::LimitExceeded("table size")));
    }
    Ok(TableType { limits })
}

fn read_global_type(reader: &mut Reader) -> Result<GlobalType, ParseError> {
    let value_type = read_value_type(reader)?;
    let at = reader.pos();
    let mutable = match reader.read_byte()? {
        0 => false,
        1 => true,
        other => return Err(reader.error_at(at, ParseErrorKind::InvalidMutability(other))),
    };
    Ok(GlobalType { value_type, mutable })
}

/// Constant expressions: a single constant or `global.get` of an imported
/// immutable global, followed by `end`.
fn read_const_expr(reader: &mut Reader, module: &ParsedModule, expected: ValueType) -> Result<ConstExpr, ParseError> {
    let at = reader.pos();
    let (expr, value_type) = match reader.read_byte()? {
        OP_I32_CONST => (ConstExpr::I32(reader.read_vs32()?), ValueType::I32),
        OP_I64_CONST => (ConstExpr::I64(reader.read_vs64()?), ValueType::I64),
        OP_F32_CONST => (ConstExpr::F32(reader.read_f32()?), ValueType::F32),
        OP_F64_CONST => (ConstExpr::F64(reader.read_f64()?), ValueType::F64),
        OP_GLOBAL_GET => {
            let idx = reader.read_vu32()?;
            if idx >= module.imported_global_count() {
                return Err(reader.error_at(at, ValidationError::UnknownGlobal(idx).into()));
            }
            let gt = module
                .global_type(idx)
                .ok_or_else(|| reader.error_at(at, ValidationError::UnknownGlobal(idx).into()))?;
            if gt.mutable {
                return Err(reader.error_at(at, ParseErrorKind::ConstantExpressionRequired));
            }
            (ConstExpr::GlobalGet(idx), gt.value_type)
        }
        _ => return Err(reader.error_at(at, ParseErrorKind::ConstantExpressionRequired)),
    };
    if value_type != expected {
        return Err(reader.error_at(at, ValidationError::TypeMismatch.into()));
    }
    if reader.read_byte()? != OP_END {
        return Err(reader.error_at(at, ParseErrorKind::ConstantExpressionRequired));
    }
    Ok(expr)
}

fn check_single(reader: &Reader, module: &ParsedModule, at: usize) -> Result<(), ParseError> {
    let imported_memories = module
        .imports
        .iter()
        .filter(|i| matches!(i.desc, ImportDesc::Memory(_)))
        .count();
    if imported_memories + module.memories.len() > 1 {
        return Err(reader.error_at(at, ParseErrorKind::MultipleMemories));
    }
    let imported_tables = module
        .imports
        .iter()
        .filter(|i| matches!(i.desc, ImportDesc::Table(_)))
        .count();
    if imported_tables + module.tables.len() > 1 {
        return Err(reader.error_at(at, ParseErrorKind::MultipleTables));
    }
    Ok(())
}

fn read_section_type(reader: &mut Reader, module: &mut ParsedModule) -> Result<(), ParseError> {
    let count = read_count(reader, limits::MAX_TYPES, "type count")?;
    for _ in 0..count {
        let at = reader.pos();
        let marker = reader.read_byte()?;
        if marker != TYPE_FUNC {
            return Err(reader.error_at(at, ParseErrorKind::BadFunctionTypeMarker(marker)));
        }
        let parameters = read_result_types(reader, limits::MAX_FUNCTION_PARAMS, "parameter count")?;
        let return_types = read_result_types(reader, limits::MAX_FUNCTION_RETURNS, "result count")?;
        module.types.push(FunctionType {
            parameters,
            return_types,
        });
    }
    Ok(())
}

fn read_section_import(reader: &mut Reader, module: &mut ParsedModule) -> Result<(), ParseError> {
    let count = read_count(reader, limits::MAX_IMPORTS, "import count")?;
    for _ in 0..count {
        let module_name = reader.read_name()?;
        let name = reader.read_name()?;
        let at = reader.pos();
        let desc = match reader.read_byte()? {
            DESC_FUNC => {
                let type_idx = reader.read_vu32()?;
                if type_idx as usize >= module.types.len() {
                    return Err(reader.error_at(at, ValidationError::UnknownType(type_idx).into()));
                }
                ImportDesc::Function(type_idx)
            }
            DESC_TABLE => ImportDesc::Table(read_table_type(reader)?),
            DESC_MEMORY => ImportDesc::Memory(read_memory_limits(reader)?),
            DESC_GLOBAL => ImportDesc::Global(read_global_type(reader)?),
            other => return Err(reader.error_at(at, ParseErrorKind::InvalidExternalKind(other))),
        };
        trace!(module = %module_name, name = %name, "import");
        module.imports.push(Import {
            module: module_name,
            name,
            desc,
        });
        check_single(reader, module, at)?;
    }
    Ok(())
}

fn read_section_function(reader: &mut Reader, module: &mut ParsedModule) -> Result<(), ParseError> {
    let count = read_count(reader, limits::MAX_FUNCTIONS, "function count")?;
    for _ in 0..count {
        let at = reader.pos();
        let type_idx = reader.read_vu32()?;
        if type_idx as usize >= module.types.len() {
            return Err(reader.error_at(at, ValidationError::UnknownType(type_idx).into()));
        }
        module.functions.push(type_idx);
    }
    Ok(())
}

fn read_section_table(reader: &mut Reader, module: &mut ParsedModule) -> Result<(), ParseError> {
    let count = read_count(reader, 1, "table count")?;
    for _ in 0..count {
        let at = reader.pos();
        module.tables.push(read_table_type(reader)?);
        check_single(reader, module, at)?;
    }
    Ok(())
}

fn read_section_memory(reader: &mut Reader, module: &mut ParsedModule) -> Result<(), ParseError> {
    let at = reader.pos();
    let count = reader.read_vu32()?;
    if count > 1 {
        return Err(reader.error_at(at, ParseErrorKind::MultipleMemories));
    }
    for _ in 0..count {
        module.memories.push(read_memory_limits(reader)?);
        check_single(reader, module, at)?;
    }
    Ok(())
}

fn read_section_global(reader: &mut Reader, module: &mut ParsedModule) -> Result<(), ParseError> {
    let count = read_count(reader, limits::MAX_GLOBALS, "global count")?;
    for _ in 0..count {
        let global_type = read_global_type(reader)?;
        let init = read_const_expr(reader, module, global_type.value_type)?;
        module.globals.push(Global { global_type, init });
    }
    Ok(())
}

fn read_section_export(reader: &mut Reader, module: &mut ParsedModule) -> Result<(), ParseError> {
    let count = read_count(reader, limits::MAX_EXPORTS, "export count")?;
    let mut names = HashSet::new();
    for _ in 0..count {
        let name_at = reader.pos();
        let name = reader.read_name()?;
        let at = reader.pos();
        let kind = reader.read_byte()?;
        let idx = reader.read_vu32()?;
        let index =
            ExportIndex::decode(kind, idx).ok_or_else(|| reader.error_at(at, ParseErrorKind::InvalidExternalKind(kind)))?;
        let in_range = match index {
            ExportIndex::Function(i) => i < module.total_functions(),
            ExportIndex::Table(i) => i == 0 && module.has_table(),
            ExportIndex::Memory(i) => i == 0 && module.memory_limits().is_some(),
            ExportIndex::Global(i) => i < module.total_globals(),
        };
        if !in_range {
            let what = match index {
                ExportIndex::Function(_) => "function",
                ExportIndex::Table(_) => "table",
                ExportIndex::Memory(_) => "memory",
                ExportIndex::Global(_) => "global",
            };
            return Err(reader.error_at(at, ParseErrorKind::IndexOutOfRange { what, index: idx }));
        }
        if !names.insert(name.clone()) {
            return Err(reader.error_at(name_at, ParseErrorKind::DuplicateExport(name)));
        }
        module.exports.push(Export { name, index });
    }
    Ok(())
}

fn read_section_start(reader: &mut Reader, module: &mut ParsedModule) -> Result<(), ParseError> {
    let at = reader.pos();
    let func_idx = reader.read_vu32()?;
    let ft = module
        .function_type(func_idx)
        .ok_or_else(|| reader.error_at(at, ValidationError::UnknownFunction(func_idx).into()))?;
    if !ft.parameters.is_empty() || !ft.return_types.is_empty() {
        return Err(reader.error_at(at, ParseErrorKind::InvalidStartFunction));
    }
    module.start = Some(func_idx);
    Ok(())
}

fn read_section_element(reader: &mut Reader, module: &mut ParsedModule) -> Result<(), ParseError> {
    let count = read_count(reader, limits::MAX_ELEMENT_SEGMENTS, "element segment count")?;
    for _ in 0..count {
        let at = reader.pos();
        let flags = reader.read_vu32()?;
        if flags != ELEM_ACTIVE_FUNCS {
            return Err(reader.error_at(at, ParseErrorKind::Unsupported("element segment kind")));
        }
        if !module.has_table() {
            return Err(reader.error_at(at, ValidationError::UnknownTable(0).into()));
        }
        let offset = read_const_expr(reader, module, ValueType::I32)?;
        let n = read_count(reader, limits::MAX_TABLE_SIZE, "element count")?;
        let mut functions = Vec::with_capacity(n as usize);
        for _ in 0..n {
            let fat = reader.pos();
            let func_idx = reader.read_vu32()?;
            if func_idx >= module.total_functions() {
                return Err(reader.error_at(fat, ValidationError::UnknownFunction(func_idx).into()));
            }
            functions.push(func_idx);
        }
        module.elements.push(Element { offset, functions });
    }
    Ok(())
}

fn read_section_code(reader: &mut Reader, module: &mut ParsedModule) -> Result<(), ParseError> {
    let at = reader.pos();
    let count = reader.read_vu32()?;
    if count as usize != module.functions.len() {
        return Err(reader.error_at(at, ParseErrorKind::FunctionCodeMismatch));
    }

    let mut bodies = Vec::with_capacity(count as usize);
    for i in 0..count as usize {
        let type_idx = module.functions[i];
        bodies.push(read_function_body(reader, module, type_idx)?);
    }
    module.code = bodies;
    Ok(())
}

fn read_function_body(reader: &mut Reader, module: &ParsedModule, type_idx: u32) -> Result<FunctionBody, ParseError> {
    let at = reader.pos();
    let size = reader.read_vu32()?;
    if size > limits::MAX_FUNCTION_SIZE {
        return Err(reader.error_at(at, ParseErrorKind::LimitExceeded("function body size")));
    }
    let offset = reader.pos();
    let mut body = reader.sub_reader(size as usize)?;

    let function_type = module
        .types
        .get(type_idx as usize)
        .ok_or_else(|| reader.error_at(at, ValidationError::UnknownType(type_idx).into()))?;

    let groups = body.read_vu32()?;
    body.check_count(groups)?;
    let mut entries = Vec::with_capacity(groups as usize);
    let mut total = function_type.parameters.len() as u64;
    for _ in 0..groups {
        let group_at = body.pos();
        let count = body.read_vu32()?;
        let value_type = read_value_type(&mut body)?;
        total += count as u64;
        if total > limits::MAX_FUNCTION_LOCALS as u64 {
            return Err(body.error_at(group_at, ParseErrorKind::TooManyLocals));
        }
        entries.push((count, value_type));
    }
    let locals = Locals::new(entries);

    let mut validator = CodeValidator::new(module, function_type, locals.iter());
    let mut map = ControlMap::new();
    while !map.finished() {
        if body.is_empty() {
            return Err(body.error(ValidationError::MissingEnd.into()));
        }
        let inst_at = body.pos();
        let inst = Instruction::decode(&mut body)?;
        validator
            .validate(&inst)
            .map_err(|e| body.error_at(inst_at, e.into()))?;
        map.push(inst);
    }
    if !body.is_empty() {
        return Err(body.error(ValidationError::OperatorsAfterEnd.into()));
    }
    let max_stack_height = validator
        .finish()
        .map_err(|e| body.error(e.into()))?;

    Ok(FunctionBody {
        locals,
        code: map.into_code(),
        max_stack_height,
        offset,
    })
}

fn read_section_data(reader: &mut Reader, module: &mut ParsedModule) -> Result<(), ParseError> {
    let count = read_count(reader, limits::MAX_DATA_SEGMENTS, "data segment count")?;
    for _ in 0..count {
        let at = reader.pos();
        let flags = reader.read_vu32()?;
        match flags {
            DATA_ACTIVE => {}
            DATA_ACTIVE_EXPLICIT => {
                let mem = reader.read_vu32()?;
                if mem != 0 {
                    return Err(reader.error_at(at, ParseErrorKind::IndexOutOfRange { what: "memory", index: mem }));
                }
            }
            DATA_PASSIVE => return Err(reader.error_at(at, ParseErrorKind::Unsupported("passive data segment"))),
            _ => return Err(reader.error_at(at, ParseErrorKind::Unsupported("data segment kind"))),
        }
        if module.memory_limits().is_none() {
            return Err(reader.error_at(at, ValidationError::UnknownMemory.into()));
        }
        let offset = read_const_expr(reader, module, ValueType::I32)?;
        let len = reader.read_vu32()?;
        let bytes = reader.read_bytes(len as usize)?.to_vec();
        module.data.push(Data { offset, bytes });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEADER: [u8; 8] = [0x00, 0x61, 0x73, 0x6d, 0x01, 0x00, 0x00, 0x00];

    fn with_header(rest: &[u8]) -> Vec<u8> {
        let mut bytes = HEADER.to_vec();
        bytes.extend_from_slice(rest);
        bytes
    }

    #[test]
    fn test_empty_module() {
        let module = parse(&HEADER).unwrap();
        assert!(module.types.is_empty());
        assert!(module.code.is_empty());
    }

    #[test]
    fn test_bad_header() {
        assert_eq!(parse(&[]).unwrap_err().kind, ParseErrorKind::BadMagic);
        assert_eq!(parse(b"\0asn\x01\0\0\0").unwrap_err().kind, ParseErrorKind::BadMagic);
        let err = parse(b"\0asm\x02\0\0\0").unwrap_err();
        assert_eq!(err.kind, ParseErrorKind::UnsupportedVersion(2));
        assert_eq!(err.offset, 4);
    }

    #[test]
    fn test_section_order() {
        // memory section (5) then type section (1)
        let bytes = with_header(&[0x05, 0x03, 0x01, 0x00, 0x01, 0x01, 0x01, 0x00]);
        let err = parse(&bytes).unwrap_err();
        assert_eq!(err.kind, ParseErrorKind::SectionOutOfOrder(1));
        assert_eq!(err.offset, 13);

        // duplicate type section
        let bytes = with_header(&[0x01, 0x01, 0x00, 0x01, 0x01, 0x00]);
        assert_eq!(parse(&bytes).unwrap_err().kind, ParseErrorKind::SectionOutOfOrder(1));
    }

    #[test]
    fn test_custom_sections_anywhere() {
        let bytes = with_header(&[
            0x00, 0x04, 0x03, b'f', b'o', b'o', // custom
            0x01, 0x01, 0x00, // empty type section
            0x00, 0x05, 0x03, b'b', b'a', b'r', 0xff, // custom with payload
        ]);
        let module = parse(&bytes).unwrap();
        assert_eq!(module.custom_sections, vec!["foo".to_string(), "bar".to_string()]);
    }

    #[test]
    fn test_section_size_mismatch() {
        // type section claims 2 bytes but only needs 1
        let bytes = with_header(&[0x01, 0x02, 0x00, 0x00]);
        assert_eq!(parse(&bytes).unwrap_err().kind, ParseErrorKind::SectionSizeMismatch);
        // section longer than input
        let bytes = with_header(&[0x01, 0x05, 0x00]);
        assert_eq!(parse(&bytes).unwrap_err().kind, ParseErrorKind::UnexpectedEof);
    }

    #[test]
    fn test_unknown_section() {
        let bytes = with_header(&[0x0d, 0x00]);
        assert_eq!(parse(&bytes).unwrap_err().kind, ParseErrorKind::UnknownSection(13));
    }

    #[test]
    fn test_function_without_code() {
        // one type () -> (), one function, no code section
        let bytes = with_header(&[0x01, 0x04, 0x01, 0x60, 0x00, 0x00, 0x03, 0x02, 0x01, 0x00]);
        assert_eq!(parse(&bytes).unwrap_err().kind, ParseErrorKind::FunctionCodeMismatch);
    }

    #[test]
    fn test_memory_limits() {
        // min 2, max 1
        let bytes = with_header(&[0x05, 0x04, 0x01, 0x01, 0x02, 0x01]);
        assert_eq!(parse(&bytes).unwrap_err().kind, ParseErrorKind::LimitsMinExceedsMax);
        // min 65537
        let bytes = with_header(&[0x05, 0x05, 0x01, 0x00, 0x81, 0x80, 0x04]);
        assert_eq!(parse(&bytes).unwrap_err().kind, ParseErrorKind::MemoryTooLarge);
    }
}
