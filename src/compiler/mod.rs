pub mod ast;
pub mod lexer;
pub mod parser;

pub use lexer::Lexer;
pub use parser::Parser;

use std::io::{Cursor, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::config::RuntimeConfig;
use crate::jit::{self, CodeGenerator, CompiledFunction};

/// Compile source text into a callable function.
///
/// The program must contain a function declaration; the first one becomes
/// the compilation unit. Structural diagnostics from the code generator are
/// reported to stderr but do not fail the compilation.
pub fn compile(
    filename: &str,
    source: &str,
    config: &RuntimeConfig,
) -> Result<CompiledFunction, String> {
    // Lexing
    let mut lexer = Lexer::new(filename, source);
    let tokens = lexer.scan_tokens()?;

    // Parsing
    let mut parser = Parser::new(filename, tokens);
    let program = parser.parse()?;

    // Code generation
    let mut generator = CodeGenerator::new();
    generator.set_trace(config.trace_jit);
    let compiled = generator
        .compile_function(&program)
        .map_err(|e| format!("error: {}", e))?;

    for diagnostic in generator.diagnostics() {
        eprintln!("warning: {}", diagnostic);
    }

    if config.dump_code {
        eprintln!("== Machine code ==");
        eprint!("{}", format_code(generator.machine_code()));
    }

    Ok(compiled)
}

/// Compile a source file into a callable function.
pub fn compile_file(path: &Path, config: &RuntimeConfig) -> Result<CompiledFunction, String> {
    let source = std::fs::read_to_string(path)
        .map_err(|e| format!("error: failed to read '{}': {}", path.display(), e))?;
    compile(&path.to_string_lossy(), &source, config)
}

/// Compile source text and call the function with the given arguments.
pub fn run_source(
    filename: &str,
    source: &str,
    config: &RuntimeConfig,
    args: &[f64],
) -> Result<f64, String> {
    let compiled = compile(filename, source, config)?;
    call_compiled(&compiled, args)
}

/// Compile a file and call the function with the given arguments.
pub fn run_file(path: &Path, config: &RuntimeConfig, args: &[f64]) -> Result<f64, String> {
    let compiled = compile_file(path, config)?;
    call_compiled(&compiled, args)
}

/// Call a compiled function with a runtime-chosen number of arguments.
///
/// The compiled code follows the host C ABI for `double fn(double, …)`, so
/// each argument count maps to a distinct function-pointer type.
pub fn call_compiled(func: &CompiledFunction, args: &[f64]) -> Result<f64, String> {
    type F0 = extern "C" fn() -> f64;
    type F1 = extern "C" fn(f64) -> f64;
    type F2 = extern "C" fn(f64, f64) -> f64;
    type F3 = extern "C" fn(f64, f64, f64) -> f64;
    type F4 = extern "C" fn(f64, f64, f64, f64) -> f64;
    type F5 = extern "C" fn(f64, f64, f64, f64, f64) -> f64;
    type F6 = extern "C" fn(f64, f64, f64, f64, f64, f64) -> f64;
    type F7 = extern "C" fn(f64, f64, f64, f64, f64, f64, f64) -> f64;
    type F8 = extern "C" fn(f64, f64, f64, f64, f64, f64, f64, f64) -> f64;
    type F9 = extern "C" fn(f64, f64, f64, f64, f64, f64, f64, f64, f64) -> f64;
    type F10 = extern "C" fn(f64, f64, f64, f64, f64, f64, f64, f64, f64, f64) -> f64;

    // SAFETY: the generated code reads exactly as many parameters as the
    // source function declares; passing the matching count is the caller's
    // contract, checked at the language level by the test suite.
    let result = unsafe {
        match *args {
            [] => func.entry_point::<F0>()(),
            [a] => func.entry_point::<F1>()(a),
            [a, b] => func.entry_point::<F2>()(a, b),
            [a, b, c] => func.entry_point::<F3>()(a, b, c),
            [a, b, c, d] => func.entry_point::<F4>()(a, b, c, d),
            [a, b, c, d, e] => func.entry_point::<F5>()(a, b, c, d, e),
            [a, b, c, d, e, f] => func.entry_point::<F6>()(a, b, c, d, e, f),
            [a, b, c, d, e, f, g] => func.entry_point::<F7>()(a, b, c, d, e, f, g),
            [a, b, c, d, e, f, g, h] => func.entry_point::<F8>()(a, b, c, d, e, f, g, h),
            [a, b, c, d, e, f, g, h, i] => func.entry_point::<F9>()(a, b, c, d, e, f, g, h, i),
            [a, b, c, d, e, f, g, h, i, j] => {
                func.entry_point::<F10>()(a, b, c, d, e, f, g, h, i, j)
            }
            _ => return Err("too many arguments: at most 10 are supported".to_string()),
        }
    };
    Ok(result)
}

/// Output captured from a run.
#[derive(Debug, Clone, Default)]
pub struct CapturedOutput {
    /// Everything `print` wrote.
    pub stdout: String,
}

/// Compile and run source text, capturing `print` output for testing.
///
/// Returns the captured output alongside the run result so tests can check
/// both. Redirects the process-global print sink for the duration of the
/// call; concurrent capturing runs would interleave.
pub fn run_source_capturing_output(
    filename: &str,
    source: &str,
    config: &RuntimeConfig,
    args: &[f64],
) -> (CapturedOutput, Result<f64, String>) {
    let buffer = Arc::new(Mutex::new(Cursor::new(Vec::new())));
    jit::set_print_sink(Box::new(SharedWriter(Arc::clone(&buffer))));

    let result = run_source(filename, source, config, args);

    jit::take_print_sink();
    let output = {
        let buffer = buffer.lock().unwrap();
        CapturedOutput {
            stdout: String::from_utf8_lossy(buffer.get_ref()).to_string(),
        }
    };

    (output, result)
}

/// Compile and run a file, capturing `print` output for testing.
pub fn run_file_capturing_output(
    path: &Path,
    config: &RuntimeConfig,
    args: &[f64],
) -> (CapturedOutput, Result<f64, String>) {
    let source = match std::fs::read_to_string(path) {
        Ok(source) => source,
        Err(e) => {
            return (
                CapturedOutput::default(),
                Err(format!("error: failed to read '{}': {}", path.display(), e)),
            );
        }
    };
    run_source_capturing_output(&path.to_string_lossy(), &source, config, args)
}

/// A Write wrapper that writes to a shared buffer.
struct SharedWriter(Arc<Mutex<Cursor<Vec<u8>>>>);

impl Write for SharedWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.0.lock().unwrap().flush()
    }
}

/// Hex dump of emitted machine code, 16 bytes per row.
pub fn format_code(code: &[u8]) -> String {
    let mut out = String::new();
    for (row, chunk) in code.chunks(16).enumerate() {
        out.push_str(&format!("{:08x}:", row * 16));
        for byte in chunk {
            out.push_str(&format!(" {:02x}", byte));
        }
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compile_reports_parse_errors() {
        let err = compile("test.js", "function f( {}", &RuntimeConfig::default()).unwrap_err();
        assert!(err.contains("test.js"), "error should name the file: {}", err);
    }

    #[test]
    fn test_compile_requires_a_function() {
        let err = compile("test.js", "var x = 1;", &RuntimeConfig::default()).unwrap_err();
        assert!(err.contains("function"), "unexpected error: {}", err);
    }

    #[test]
    fn test_format_code() {
        let formatted = format_code(&[0x55, 0x48, 0x89, 0xE5]);
        assert_eq!(formatted, "00000000: 55 48 89 e5\n");
    }

    #[cfg(all(target_arch = "x86_64", unix))]
    #[test]
    fn test_run_source_capturing_output() {
        let source = "function f(x) { print | x; return x + 1; }";
        let (output, result) =
            run_source_capturing_output("test.js", source, &RuntimeConfig::default(), &[41.0]);
        assert_eq!(result.unwrap(), 42.0);
        assert_eq!(output.stdout, "41\n");
    }
}
