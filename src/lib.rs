//! numjit - a JIT compiler for a JavaScript-like numeric language.
//!
//! Source text is lexed and parsed into a small AST, then translated in a
//! single pass to x86-64 machine code that operates entirely on IEEE-754
//! doubles. The code is published as executable memory and called through
//! the host C calling convention.

pub mod compiler;
pub mod config;
pub mod jit;

// Re-export commonly used types
pub use config::RuntimeConfig;
pub use jit::{CodeGenerator, CompileError, CompiledFunction};
