//! Implementation limits for module parsing.
//!
//! These follow the limits mainstream engines apply (V8's wasm-limits.h).
//! They stop malformed input from claiming unrealistic counts before any
//! allocation happens.

// =============================================================================
// Module-level limits
// =============================================================================

pub const MAX_TYPES: u32 = 1_000_000;

pub const MAX_FUNCTIONS: u32 = 1_000_000;

pub const MAX_IMPORTS: u32 = 100_000;

pub const MAX_EXPORTS: u32 = 100_000;

pub const MAX_GLOBALS: u32 = 1_000_000;

pub const MAX_DATA_SEGMENTS: u32 = 100_000;

pub const MAX_ELEMENT_SEGMENTS: u32 = 100_000;

// =============================================================================
// Function-level limits
// =============================================================================

/// Maximum function body size in bytes
pub const MAX_FUNCTION_SIZE: u32 = 7_654_321;

pub const MAX_FUNCTION_PARAMS: u32 = 1_000;

pub const MAX_FUNCTION_RETURNS: u32 = 1_000;

/// Maximum number of local variables in a function, parameters included
pub const MAX_FUNCTION_LOCALS: u32 = 50_000;

// =============================================================================
// Instruction-level limits
// =============================================================================

pub const MAX_BR_TABLE_LABELS: u32 = 65_536;

// =============================================================================
// Table and memory limits
// =============================================================================

/// Maximum table size (number of elements)
pub const MAX_TABLE_SIZE: u32 = 10_000_000;

/// Maximum memory pages for 32-bit addressing (4 GB)
pub const MAX_MEMORY_PAGES: u32 = 65_536;
