use serde::{Deserialize, Serialize};
use std::fmt;

use super::encoding;
use super::instruction::Instruction;

/// A decoded and validated module. Immutable once produced by
/// [`super::parse`]; runtime state lives in the runtime that loads it.
#[derive(Debug, Default)]
pub struct ParsedModule {
    pub types: Vec<FunctionType>,
    pub imports: Vec<Import>,
    /// Type index of each defined (non-imported) function
    pub functions: Vec<u32>,
    pub tables: Vec<TableType>,
    pub memories: Vec<Limits>,
    pub globals: Vec<Global>,
    pub exports: Vec<Export>,
    pub start: Option<u32>,
    pub elements: Vec<Element>,
    pub data_count: Option<u32>,
    pub code: Vec<FunctionBody>,
    pub data: Vec<Data>,
    pub custom_sections: Vec<String>,
}

impl ParsedModule {
    pub fn imported_function_count(&self) -> u32 {
        self.imports
            .iter()
            .filter(|i| matches!(i.desc, ImportDesc::Function(_)))
            .count() as u32
    }

    pub fn imported_global_count(&self) -> u32 {
        self.imports
            .iter()
            .filter(|i| matches!(i.desc, ImportDesc::Global(_)))
            .count() as u32
    }

    /// Size of the function index space (imports first, then definitions)
    pub fn total_functions(&self) -> u32 {
        self.imported_function_count() + self.functions.len() as u32
    }

    pub fn total_globals(&self) -> u32 {
        self.imported_global_count() + self.globals.len() as u32
    }

    /// Type index of a function in the combined index space
    pub fn function_type_index(&self, func_idx: u32) -> Option<u32> {
        let imported = self.imported_function_count();
        if func_idx < imported {
            self.imports
                .iter()
                .filter_map(|i| match i.desc {
                    ImportDesc::Function(type_idx) => Some(type_idx),
                    _ => None,
                })
                .nth(func_idx as usize)
        } else {
            self.functions.get((func_idx - imported) as usize).copied()
        }
    }

    pub fn function_type(&self, func_idx: u32) -> Option<&FunctionType> {
        self.function_type_index(func_idx)
            .and_then(|t| self.types.get(t as usize))
    }

    pub fn global_type(&self, global_idx: u32) -> Option<GlobalType> {
        let imported = self.imported_global_count();
        if global_idx < imported {
            self.imports
                .iter()
                .filter_map(|i| match i.desc {
                    ImportDesc::Global(gt) => Some(gt),
                    _ => None,
                })
                .nth(global_idx as usize)
        } else {
            self.globals
                .get((global_idx - imported) as usize)
                .map(|g| g.global_type)
        }
    }

    /// Limits of the module's memory, whether imported or defined
    pub fn memory_limits(&self) -> Option<Limits> {
        self.imports
            .iter()
            .find_map(|i| match i.desc {
                ImportDesc::Memory(limits) => Some(limits),
                _ => None,
            })
            .or_else(|| self.memories.first().copied())
    }

    pub fn has_table(&self) -> bool {
        !self.tables.is_empty() || self.imports.iter().any(|i| matches!(i.desc, ImportDesc::Table(_)))
    }

    pub fn export(&self, name: &str) -> Option<&Export> {
        self.exports.iter().find(|e| e.name == name)
    }

    pub fn exported_functions(&self) -> impl Iterator<Item = (&str, u32)> {
        self.exports.iter().filter_map(|e| match e.index {
            ExportIndex::Function(idx) => Some((e.name.as_str(), idx)),
            _ => None,
        })
    }

    pub fn get_function_name(&self, func_idx: u32) -> Option<&str> {
        self.exported_functions()
            .find(|(_, idx)| *idx == func_idx)
            .map(|(name, _)| name)
    }
}

#[derive(PartialEq, Eq, Hash, Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueType {
    I32,
    I64,
    F32,
    F64,
}

impl ValueType {
    pub fn decode(byte: u8) -> Option<Self> {
        match byte {
            encoding::TYPE_I32 => Some(ValueType::I32),
            encoding::TYPE_I64 => Some(ValueType::I64),
            encoding::TYPE_F32 => Some(ValueType::F32),
            encoding::TYPE_F64 => Some(ValueType::F64),
            _ => None,
        }
    }

    pub fn encode(&self) -> u8 {
        match self {
            ValueType::I32 => encoding::TYPE_I32,
            ValueType::I64 => encoding::TYPE_I64,
            ValueType::F32 => encoding::TYPE_F32,
            ValueType::F64 => encoding::TYPE_F64,
        }
    }

    /// Character used in compact host signatures such as `"i(iI)"`
    pub fn signature_char(&self) -> char {
        match self {
            ValueType::I32 => 'i',
            ValueType::I64 => 'I',
            ValueType::F32 => 'f',
            ValueType::F64 => 'F',
        }
    }

    pub fn from_signature_char(c: char) -> Option<Self> {
        match c {
            'i' => Some(ValueType::I32),
            'I' => Some(ValueType::I64),
            'f' => Some(ValueType::F32),
            'F' => Some(ValueType::F64),
            _ => None,
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            ValueType::I32 => "i32",
            ValueType::I64 => "i64",
            ValueType::F32 => "f32",
            ValueType::F64 => "f64",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct FunctionType {
    pub parameters: Vec<ValueType>,
    pub return_types: Vec<ValueType>,
}

impl FunctionType {
    pub fn new(parameters: &[ValueType], return_types: &[ValueType]) -> Self {
        FunctionType {
            parameters: parameters.to_vec(),
            return_types: return_types.to_vec(),
        }
    }

    /// Parse a compact signature: the result type character (`v` for none),
    /// then the parameter characters in parentheses, e.g. `"i(ii)"`, `"v()"`.
    pub fn parse_signature(signature: &str) -> Option<FunctionType> {
        let signature: String = signature.chars().filter(|c| !c.is_whitespace()).collect();
        let open = signature.find('(')?;
        let params = signature[open + 1..].strip_suffix(')')?;

        let return_types = signature[..open]
            .chars()
            .filter(|c| *c != 'v')
            .map(ValueType::from_signature_char)
            .collect::<Option<Vec<_>>>()?;
        let parameters = params
            .chars()
            .map(ValueType::from_signature_char)
            .collect::<Option<Vec<_>>>()?;

        Some(FunctionType {
            parameters,
            return_types,
        })
    }

    pub fn to_signature(&self) -> String {
        let results: String = if self.return_types.is_empty() {
            "v".to_string()
        } else {
            self.return_types.iter().map(ValueType::signature_char).collect()
        };
        let params: String = self.parameters.iter().map(ValueType::signature_char).collect();
        format!("{results}({params})")
    }
}

impl fmt::Display for FunctionType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let join = |types: &[ValueType]| {
            types
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<String>>()
                .join(", ")
        };
        write!(
            f,
            "({}) -> {}",
            join(&self.parameters),
            match self.return_types.len() {
                0 => "nil".to_string(),
                1 => join(&self.return_types),
                _ => format!("({})", join(&self.return_types)),
            }
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    pub min: u32,
    pub max: Option<u32>,
}

impl fmt::Display for Limits {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.max {
            Some(max) => write!(f, "min = {}, max = {}", self.min, max),
            None => write!(f, "min = {}", self.min),
        }
    }
}

/// Tables only hold `funcref`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableType {
    pub limits: Limits,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GlobalType {
    pub value_type: ValueType,
    pub mutable: bool,
}

impl fmt::Display for GlobalType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.mutable {
            write!(f, "(mut {})", self.value_type)
        } else {
            write!(f, "{}", self.value_type)
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ImportDesc {
    Function(u32),
    Table(TableType),
    Memory(Limits),
    Global(GlobalType),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Import {
    pub module: String,
    pub name: String,
    pub desc: ImportDesc,
}

impl fmt::Display for Import {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.desc {
            ImportDesc::Function(type_index) => write!(f, "func sig={} <- {}.{}", type_index, self.module, self.name),
            ImportDesc::Table(t) => write!(f, "table {} <- {}.{}", t.limits, self.module, self.name),
            ImportDesc::Memory(l) => write!(f, "memory {} <- {}.{}", l, self.module, self.name),
            ImportDesc::Global(g) => write!(f, "global {} <- {}.{}", g, self.module, self.name),
        }
    }
}

/// Constant initialiser for globals and segment offsets
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ConstExpr {
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
    GlobalGet(u32),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Global {
    pub global_type: GlobalType,
    pub init: ConstExpr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportIndex {
    Function(u32),
    Table(u32),
    Memory(u32),
    Global(u32),
}

impl ExportIndex {
    pub fn decode(byte: u8, idx: u32) -> Option<ExportIndex> {
        match byte {
            encoding::DESC_FUNC => Some(ExportIndex::Function(idx)),
            encoding::DESC_TABLE => Some(ExportIndex::Table(idx)),
            encoding::DESC_MEMORY => Some(ExportIndex::Memory(idx)),
            encoding::DESC_GLOBAL => Some(ExportIndex::Global(idx)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Export {
    pub name: String,
    pub index: ExportIndex,
}

impl fmt::Display for Export {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let typ = match self.index {
            ExportIndex::Function(i) => format!("Function({i})"),
            ExportIndex::Table(i) => format!("Table({i})"),
            ExportIndex::Memory(i) => format!("Memory({i})"),
            ExportIndex::Global(i) => format!("Global({i})"),
        };
        write!(f, "{} {}", self.name, typ)
    }
}

/// Active element segment for table 0
#[derive(Debug, Clone, PartialEq)]
pub struct Element {
    pub offset: ConstExpr,
    pub functions: Vec<u32>,
}

/// Active data segment for memory 0
#[derive(Debug, Clone, PartialEq)]
pub struct Data {
    pub offset: ConstExpr,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Locals {
    entries: Vec<(u32, ValueType)>,
}

impl Locals {
    // Initialize with a list of count+ValueType pairs
    pub fn new(entries: Vec<(u32, ValueType)>) -> Self {
        Self { entries }
    }

    pub fn len(&self) -> u64 {
        self.entries.iter().map(|(count, _)| *count as u64).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = ValueType> + '_ {
        self.entries
            .iter()
            .flat_map(|(count, value_type)| std::iter::repeat(*value_type).take(*count as usize))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FunctionBody {
    pub locals: Locals,
    /// Flat instruction stream with resolved block targets
    pub code: Vec<Instruction>,
    /// Highest operand stack depth reached, excluding locals
    pub max_stack_height: u32,
    /// Offset of the body in the module binary
    pub offset: usize,
}
