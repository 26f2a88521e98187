//! VM limits and host callbacks

use std::fmt;

use crate::symbols::MAX_VARIABLES;

/// Default operand stack capacity
pub const STACK_MAX: usize = 16384;

/// Default call depth
pub const FRAMES_MAX: usize = 1024;

/// Static resource limits. Exceeding any of them aborts the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmConfig {
    pub max_stack: usize,
    /// Applies to call frames within one context and to nested sequence resumes
    pub max_frames: usize,
    pub max_globals: usize,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            max_stack: STACK_MAX,
            max_frames: FRAMES_MAX,
            max_globals: MAX_VARIABLES,
        }
    }
}

impl VmConfig {
    pub fn with_max_stack(mut self, max_stack: usize) -> Self {
        self.max_stack = max_stack;
        self
    }

    pub fn with_max_frames(mut self, max_frames: usize) -> Self {
        self.max_frames = max_frames;
        self
    }

    /// Global slots are addressed by 16-bit operands, so the limit is capped there
    pub fn with_max_globals(mut self, max_globals: usize) -> Self {
        self.max_globals = max_globals.min(MAX_VARIABLES);
        self
    }
}

pub type PrintHook = Box<dyn FnMut(&str)>;

/// Callbacks into the embedding host
pub struct VmHooks {
    pub print: PrintHook,
}

impl VmHooks {
    pub fn with_print(print: impl FnMut(&str) + 'static) -> Self {
        Self {
            print: Box::new(print),
        }
    }
}

impl Default for VmHooks {
    fn default() -> Self {
        Self::with_print(|text| println!("{}", text))
    }
}

impl fmt::Debug for VmHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VmHooks").finish_non_exhaustive()
    }
}
