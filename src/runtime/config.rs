use std::env;

use crate::runtime::memory::MAX_PAGES;

/// Default value stack size in bytes
pub const DEFAULT_STACK_SIZE: usize = 64 * 1024;

/// Bytes accounted per value stack slot
pub const SLOT_SIZE: usize = 8;

/// Slots reserved per active call frame for bookkeeping
pub const FRAME_OVERHEAD: usize = 4;

/// Execution-time configuration for a runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Value stack budget; `stack_size_bytes / SLOT_SIZE` slots are available
    /// for locals, operands and frame bookkeeping.
    pub stack_size_bytes: usize,
    /// Upper bound on memory pages regardless of what modules declare.
    pub max_memory_pages: u32,
    /// Optional per-call watchdog (executed instructions).
    pub step_limit: Option<u64>,
}

impl RuntimeConfig {
    pub const DEFAULT: Self = Self {
        stack_size_bytes: DEFAULT_STACK_SIZE,
        max_memory_pages: MAX_PAGES,
        step_limit: None,
    };

    #[must_use]
    pub fn with_stack_size(mut self, bytes: usize) -> Self {
        self.stack_size_bytes = bytes;
        self
    }

    #[must_use]
    pub fn with_max_memory_pages(mut self, pages: u32) -> Self {
        self.max_memory_pages = pages.min(MAX_PAGES);
        self
    }

    #[must_use]
    pub fn with_step_limit(mut self, steps: Option<u64>) -> Self {
        self.step_limit = steps;
        self
    }

    /// Defaults overridden by `WASMBED_STACK_SIZE`, `WASMBED_MAX_MEMORY_PAGES`
    /// and `WASMBED_STEP_LIMIT`. Unparsable values are ignored with a warning.
    #[must_use]
    pub fn from_env() -> Self {
        let stack = env::var("WASMBED_STACK_SIZE").ok();
        let pages = env::var("WASMBED_MAX_MEMORY_PAGES").ok();
        let steps = env::var("WASMBED_STEP_LIMIT").ok();
        apply_env_overrides(Self::DEFAULT, stack.as_deref(), pages.as_deref(), steps.as_deref())
    }

    /// Number of value stack slots this configuration allows
    pub fn stack_slots(&self) -> usize {
        self.stack_size_bytes / SLOT_SIZE
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}

fn parse_number<T: std::str::FromStr>(name: &str, text: Option<&str>) -> Option<T> {
    let text = text?.trim();
    match text.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(variable = name, value = text, "ignoring unparsable setting");
            None
        }
    }
}

fn apply_env_overrides(
    mut config: RuntimeConfig,
    stack: Option<&str>,
    pages: Option<&str>,
    steps: Option<&str>,
) -> RuntimeConfig {
    if let Some(bytes) = parse_number("WASMBED_STACK_SIZE", stack) {
        config = config.with_stack_size(bytes);
    }
    if let Some(pages) = parse_number("WASMBED_MAX_MEMORY_PAGES", pages) {
        config = config.with_max_memory_pages(pages);
    }
    if let Some(steps) = parse_number::<u64>("WASMBED_STEP_LIMIT", steps) {
        config = config.with_step_limit((steps > 0).then_some(steps));
    }
    config
}
