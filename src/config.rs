//! Runtime configuration types.

/// Configuration for the compile-and-run pipeline.
#[derive(Debug, Clone, Copy, Default)]
pub struct RuntimeConfig {
    /// Log a `[JIT]` line to stderr for each compiled function.
    pub trace_jit: bool,
    /// Hex-dump the emitted machine code to stderr after compilation.
    pub dump_code: bool,
}
