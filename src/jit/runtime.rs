//! Host-side runtime helpers callable from generated code.
//!
//! Generated code invokes helpers through `movabs rax, <addr>; call rax`,
//! so every helper must be an `extern "C"` function with a stable address
//! for the lifetime of the compiled code. Helpers take a single double;
//! that is the only call shape the emitter produces.

use std::collections::HashMap;
use std::io::Write;
use std::sync::Mutex;

/// Signature of a runtime helper reachable from generated code.
pub type RuntimeFn = extern "C" fn(f64);

/// Name → helper-address table consulted when emitting `callee | argument`.
pub struct RuntimeTable {
    entries: HashMap<String, RuntimeFn>,
}

impl RuntimeTable {
    /// An empty table.
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// The default table with the built-in helpers registered.
    pub fn with_builtins() -> Self {
        let mut table = Self::new();
        table.register("print", print_value);
        table
    }

    /// Register (or replace) a helper under the given name.
    pub fn register(&mut self, name: &str, func: RuntimeFn) {
        self.entries.insert(name.to_string(), func);
    }

    /// Look up a helper by name.
    pub fn get(&self, name: &str) -> Option<RuntimeFn> {
        self.entries.get(name).copied()
    }

    /// Whether a helper with this name is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }
}

impl Default for RuntimeTable {
    fn default() -> Self {
        Self::with_builtins()
    }
}

/// Redirectable sink for `print`; `None` means stdout.
///
/// The sink is process-global because the generated call sequence passes no
/// context, only the argument value.
static PRINT_SINK: Mutex<Option<Box<dyn Write + Send>>> = Mutex::new(None);

/// Redirect `print` output, e.g. into a capture buffer for tests.
pub fn set_print_sink(writer: Box<dyn Write + Send>) {
    *PRINT_SINK.lock().unwrap() = Some(writer);
}

/// Restore `print` to stdout, returning the previous sink if any.
pub fn take_print_sink() -> Option<Box<dyn Write + Send>> {
    PRINT_SINK.lock().unwrap().take()
}

/// The built-in `print` helper: writes the value and a newline.
pub extern "C" fn print_value(value: f64) {
    let mut sink = PRINT_SINK.lock().unwrap();
    match sink.as_mut() {
        Some(writer) => {
            let _ = write_value(writer, value);
        }
        None => {
            let _ = write_value(&mut std::io::stdout(), value);
        }
    }
}

/// Formatting shared by `print` and its tests: `10`, not `10.0`.
fn write_value(writer: &mut dyn Write, value: f64) -> std::io::Result<()> {
    writeln!(writer, "{}", value)
}
