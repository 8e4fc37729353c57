//! The code generator: a single-pass AST walker emitting x86-64 bytes.
//!
//! Every value is a double living in an 8-byte frame slot addressed off
//! `rbp`. Expression results flow through a stack of destination slots: the
//! caller of a sub-expression pushes the slot the result should land in,
//! the sub-expression writes it there, nested expressions push and pop
//! their own intermediates. There is no register allocation beyond this;
//! `xmm0`/`xmm1` are scratch within a single operation and `rax` stages
//! 64-bit absolute loads.
//!
//! Control flow is resolved with fixup stacks: jumps whose target is not
//! yet known are emitted with a zero rel32 and their immediate offsets are
//! recorded, then patched once the target offset is reached. The nesting of
//! the AST guarantees the stacks drain in LIFO order; a non-empty stack
//! after the function envelope closes is an internal error.

use std::collections::HashMap;
use std::rc::Rc;

use crate::compiler::ast::{BinaryOp, Expr, UnaryOp};

use super::codebuf::{CodeBuffer, relative32};
use super::literals::LiteralPool;
use super::memory::{ExecutableMemory, MemoryError};
use super::runtime::{RuntimeFn, RuntimeTable};
use super::x86_64::X64Assembler;

/// Number of `f64` parameters the host C ABI passes in `xmm` registers.
#[cfg(windows)]
pub const REGISTER_ARGS: usize = 4;
#[cfg(not(windows))]
pub const REGISTER_ARGS: usize = 8;

/// Bit pattern of `1.0`, the boolean-normalization mask.
const DOUBLE_ONE_BITS: u64 = 0x3FF0000000000000;

/// The IEEE-754 sign bit, used for negation.
const SIGN_BIT: u64 = 0x8000000000000000;

/// Displacement off `rbp` for a slot: negative for frame locals, positive
/// for caller-stack arguments.
fn displacement(slot: i32) -> i32 {
    -slot * 8
}

/// Slot index for a caller-stack parameter, chosen so that [`displacement`]
/// lands on the argument's standard stack slot.
#[cfg(windows)]
fn stack_arg_slot(index: usize) -> i32 {
    // Arguments start at [rbp + 48]: return address, saved rbp, and the
    // 32-byte shadow area.
    -(index as i32 + 2)
}
#[cfg(not(windows))]
fn stack_arg_slot(index: usize) -> i32 {
    // Arguments start at [rbp + 16]: return address and saved rbp.
    -(index as i32 - 6)
}

/// Frame reservation in bytes, padded so `rsp` stays 16-byte aligned at
/// emitted call sites.
fn frame_size(next_slot: i32) -> u32 {
    let mut bytes = next_slot * 8;
    if next_slot % 2 == 1 {
        bytes += 8;
    }
    bytes as u32
}

/// Errors that abort compilation.
#[derive(Debug)]
pub enum CompileError {
    /// The tree handed to the compiler contains no function declaration.
    NotAFunction,
    /// An identifier was used before being defined.
    UnboundIdentifier(String),
    /// A `var` or parameter re-bound an existing name.
    Redefinition(String),
    /// An expression was visited with no destination slot pushed.
    MissingDestination,
    /// `break` outside of any loop.
    BreakOutsideLoop,
    /// `continue` outside of any loop.
    ContinueOutsideLoop,
    /// A fixup stack was out of balance when a construct closed.
    UnbalancedFixups(&'static str),
    /// Publishing the executable page failed.
    Memory(MemoryError),
}

impl std::fmt::Display for CompileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CompileError::NotAFunction => write!(f, "expected a function declaration"),
            CompileError::UnboundIdentifier(name) => {
                write!(f, "identifier `{}` is not defined", name)
            }
            CompileError::Redefinition(name) => write!(f, "`{}` is already defined", name),
            CompileError::MissingDestination => {
                write!(f, "no destination slot for expression result")
            }
            CompileError::BreakOutsideLoop => write!(f, "`break` outside of a loop"),
            CompileError::ContinueOutsideLoop => write!(f, "`continue` outside of a loop"),
            CompileError::UnbalancedFixups(what) => {
                write!(f, "unbalanced {} after compilation", what)
            }
            CompileError::Memory(err) => write!(f, "{}", err),
        }
    }
}

impl std::error::Error for CompileError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CompileError::Memory(err) => Some(err),
            _ => None,
        }
    }
}

impl From<MemoryError> for CompileError {
    fn from(err: MemoryError) -> Self {
        CompileError::Memory(err)
    }
}

/// A published, callable function.
///
/// Owns its executable page and keeps the literal pool alive: the machine
/// code reads constants through absolute addresses into the pool, so the
/// pool must outlive every page that references it. The page is unmapped
/// when the handle drops.
#[derive(Debug)]
pub struct CompiledFunction {
    memory: ExecutableMemory,
    _literals: Rc<LiteralPool>,
}

impl CompiledFunction {
    /// Entry pointer of the compiled code.
    pub fn as_ptr(&self) -> *const u8 {
        self.memory.as_ptr()
    }

    /// Length of the machine code.
    pub fn code_len(&self) -> usize {
        self.memory.code_len()
    }

    /// View the published machine code.
    pub fn code(&self) -> &[u8] {
        // SAFETY: the page is readable (read-execute) and exactly
        // `code_len` bytes of it were written at publication.
        unsafe { std::slice::from_raw_parts(self.memory.as_ptr(), self.memory.code_len()) }
    }

    /// Get the entry point as a function pointer.
    ///
    /// # Safety
    /// `F` must be an `extern "C"` function-pointer type whose signature
    /// matches the compiled function's parameter count (all `f64`,
    /// returning `f64`).
    pub unsafe fn entry_point<F>(&self) -> F
    where
        F: Copy,
    {
        // SAFETY: the caller guarantees the signature; the page is
        // executable by construction.
        unsafe {
            let ptr = self.memory.as_ptr();
            std::mem::transmute_copy(&ptr)
        }
    }
}

/// The JIT code generator.
///
/// Long-lived: `compile_function` resets all per-function state, but the
/// literal pool persists across compilations so that previously returned
/// [`CompiledFunction`]s stay valid.
pub struct CodeGenerator {
    buf: CodeBuffer,
    literals: Rc<LiteralPool>,
    runtime: RuntimeTable,
    /// Identifier → slot. Positive slots are frame locals; negative slots
    /// are caller-stack arguments.
    slots: HashMap<String, i32>,
    next_slot: i32,
    /// Destination-slot stack: the top is where the currently visited
    /// expression must write its result.
    dests: Vec<i32>,
    /// Offsets of jp/je immediates awaiting their false-branch target.
    cond_fixups: Vec<usize>,
    /// Offsets of unconditional forward jumps awaiting a later target.
    forward_fixups: Vec<usize>,
    /// Offsets of `jmp`s emitted for `return`, patched to the epilogue.
    return_fixups: Vec<usize>,
    /// Per-loop pending `break` jumps, innermost last.
    break_scopes: Vec<Vec<usize>>,
    /// Per-loop pending `continue` jumps, innermost last.
    continue_scopes: Vec<Vec<usize>>,
    /// Structural problems that skip emission but do not abort compilation.
    diagnostics: Vec<String>,
    trace: bool,
}

impl CodeGenerator {
    pub fn new() -> Self {
        Self {
            buf: CodeBuffer::new(),
            literals: Rc::new(LiteralPool::new()),
            runtime: RuntimeTable::with_builtins(),
            slots: HashMap::new(),
            next_slot: 1,
            dests: Vec::new(),
            cond_fixups: Vec::new(),
            forward_fixups: Vec::new(),
            return_fixups: Vec::new(),
            break_scopes: Vec::new(),
            continue_scopes: Vec::new(),
            diagnostics: Vec::new(),
            trace: false,
        }
    }

    /// Log a `[JIT]` line to stderr for each compiled function.
    pub fn set_trace(&mut self, on: bool) {
        self.trace = on;
    }

    /// Register an additional runtime helper callable via `name | arg`.
    pub fn register_runtime_fn(&mut self, name: &str, func: RuntimeFn) {
        self.runtime.register(name, func);
    }

    /// Structural diagnostics collected during the last compilation.
    pub fn diagnostics(&self) -> &[String] {
        &self.diagnostics
    }

    /// Machine code of the last compilation.
    pub fn machine_code(&self) -> &[u8] {
        self.buf.code()
    }

    /// Compile a function declaration (or the first one in a top-level
    /// statement list) and publish it as executable memory.
    pub fn compile_function(&mut self, root: &Expr) -> Result<CompiledFunction, CompileError> {
        let func = match root {
            Expr::Function { .. } => root,
            Expr::TopStatements(items) => items
                .iter()
                .find(|item| matches!(item, Expr::Function { .. }))
                .ok_or(CompileError::NotAFunction)?,
            _ => return Err(CompileError::NotAFunction),
        };

        self.reset();
        self.emit(func)?;
        self.check_balanced()?;

        let memory = ExecutableMemory::publish(self.buf.code())?;

        if self.trace {
            let name = match func {
                Expr::Function { name, .. } => name.as_str(),
                _ => "<fn>",
            };
            eprintln!(
                "[JIT] compiled `{}`: {} bytes, {} slots, {} literals",
                name,
                self.buf.len(),
                self.next_slot - 1,
                self.literals.len()
            );
        }

        Ok(CompiledFunction {
            memory,
            _literals: Rc::clone(&self.literals),
        })
    }

    /// Clear all per-function state. The literal pool deliberately
    /// survives: published pages hold absolute addresses into it.
    fn reset(&mut self) {
        self.buf.clear();
        self.slots.clear();
        self.next_slot = 1;
        self.dests.clear();
        self.cond_fixups.clear();
        self.forward_fixups.clear();
        self.return_fixups.clear();
        self.break_scopes.clear();
        self.continue_scopes.clear();
        self.diagnostics.clear();
    }

    fn check_balanced(&self) -> Result<(), CompileError> {
        if !self.dests.is_empty() {
            return Err(CompileError::UnbalancedFixups("destination stack"));
        }
        if !self.cond_fixups.is_empty() {
            return Err(CompileError::UnbalancedFixups("conditional jumps"));
        }
        if !self.forward_fixups.is_empty() {
            return Err(CompileError::UnbalancedFixups("forward jumps"));
        }
        if !self.return_fixups.is_empty() {
            return Err(CompileError::UnbalancedFixups("return jumps"));
        }
        if !self.break_scopes.is_empty() || !self.continue_scopes.is_empty() {
            return Err(CompileError::UnbalancedFixups("loop scopes"));
        }
        Ok(())
    }

    // ==================== Dispatch ====================

    fn emit(&mut self, expr: &Expr) -> Result<(), CompileError> {
        match expr {
            Expr::Number(value) => {
                let dest = self.dest()?;
                self.load_literal(dest, *value);
            }
            Expr::Bool(value) => {
                let dest = self.dest()?;
                self.load_literal(dest, if *value { 1.0 } else { 0.0 });
            }
            Expr::Null | Expr::Undefined => {
                let dest = self.dest()?;
                self.load_literal(dest, 0.0);
            }
            Expr::Ident(name) => {
                let src = self.lookup(name)?;
                let dest = self.dest()?;
                self.copy_slot(dest, src);
            }
            Expr::Unary { op, operand } => self.emit_unary(*op, operand)?,
            Expr::Binary { op, left, right } => self.emit_binary(*op, left, right)?,
            Expr::Call(inner) => self.emit(inner)?,
            Expr::VarDef { name, init } => {
                let var = self.define(name)?;
                let tmp = self.fresh_slot();
                self.dests.push(tmp);
                self.emit(init)?;
                self.dests.pop();
                // Explicit move into the variable's slot, even when the
                // initializer already landed next to it.
                self.copy_slot(var, tmp);
            }
            Expr::Block(items) | Expr::List(items) | Expr::TopStatements(items) => {
                for item in items {
                    let scratch = self.fresh_slot();
                    self.dests.push(scratch);
                    self.emit(item)?;
                    self.dests.pop();
                }
            }
            Expr::If {
                condition,
                then_branch,
                else_branch,
            } => {
                let cond_slot = self.fresh_slot();
                self.dests.push(cond_slot);
                self.emit(condition)?;
                self.jump_if_condition_false()?;

                self.emit(then_branch)?;
                if else_branch.is_some() {
                    self.begin_forward_jump();
                }
                self.patch_conditional_jumps()?;

                if let Some(else_branch) = else_branch {
                    self.emit(else_branch)?;
                    self.end_forward_jump()?;
                }
            }
            Expr::While { condition, body } => {
                self.open_loop_scopes();
                let loop_top = self.buf.offset();

                let cond_slot = self.fresh_slot();
                self.dests.push(cond_slot);
                self.emit(condition)?;
                self.jump_if_condition_false()?;

                self.emit(body)?;
                self.jump_to(loop_top);
                self.patch_conditional_jumps()?;

                self.close_continue_scope(loop_top)?;
                let after = self.buf.offset();
                self.close_break_scope(after)?;
            }
            Expr::For {
                init,
                condition,
                iteration,
                body,
            } => {
                self.open_loop_scopes();

                let init_slot = self.fresh_slot();
                self.dests.push(init_slot);
                self.emit(init)?;
                self.dests.pop();

                let loop_top = self.buf.offset();
                let cond_slot = self.fresh_slot();
                self.dests.push(cond_slot);
                self.emit(condition)?;
                self.jump_if_condition_false()?;

                self.emit(body)?;

                let iteration_offset = self.buf.offset();
                let iter_slot = self.fresh_slot();
                self.dests.push(iter_slot);
                self.emit(iteration)?;
                self.dests.pop();

                self.jump_to(loop_top);
                self.patch_conditional_jumps()?;

                self.close_continue_scope(iteration_offset)?;
                let after = self.buf.offset();
                self.close_break_scope(after)?;
            }
            Expr::Break => {
                let at = self.buf.offset();
                self.break_scopes
                    .last_mut()
                    .ok_or(CompileError::BreakOutsideLoop)?
                    .push(at);
                self.asm().jmp_rel32(0);
            }
            Expr::Continue => {
                let at = self.buf.offset();
                self.continue_scopes
                    .last_mut()
                    .ok_or(CompileError::ContinueOutsideLoop)?
                    .push(at);
                self.asm().jmp_rel32(0);
            }
            Expr::Function { params, body, .. } => self.emit_function(params, body)?,
        }
        Ok(())
    }

    // ==================== Expressions ====================

    fn emit_unary(&mut self, op: UnaryOp, operand: &Expr) -> Result<(), CompileError> {
        match op {
            UnaryOp::Return => {
                let slot = self.fresh_slot();
                self.dests.push(slot);
                self.emit(operand)?;
                self.dests.pop();

                self.asm().movsd_load(0, displacement(slot));

                // Result stays in xmm0 across the jump to the epilogue.
                self.return_fixups.push(self.buf.offset());
                self.asm().jmp_rel32(0);
            }
            UnaryOp::Neg => {
                let slot = self.fresh_slot();
                self.dests.push(slot);
                self.emit(operand)?;
                self.dests.pop();

                self.asm().movsd_load(0, displacement(slot));

                let mask = self.fresh_slot();
                self.load_literal_bits(mask, SIGN_BIT);
                self.asm().movsd_load(1, displacement(mask));
                self.asm().pxor(0, 1);

                let dest = self.dest()?;
                self.asm().movq_store(displacement(dest), 0);
            }
        }
        Ok(())
    }

    fn emit_binary(&mut self, op: BinaryOp, left: &Expr, right: &Expr) -> Result<(), CompileError> {
        // The AST has no call node for built-ins; `|` is repurposed as
        // runtime-helper invocation.
        if op == BinaryOp::Pipe {
            return self.emit_runtime_call(left, right);
        }

        let left_slot = self.operand_slot(left)?;
        self.dests.push(left_slot);
        self.emit(left)?;

        let right_slot = self.operand_slot(right)?;
        self.dests.push(right_slot);
        self.emit(right)?;

        let second = self.dests.pop().ok_or(CompileError::MissingDestination)?;
        let first = self.dests.pop().ok_or(CompileError::MissingDestination)?;

        self.asm().movsd_load(0, displacement(first));
        self.asm().movsd_load(1, displacement(second));

        match op {
            BinaryOp::Add => self.asm().addsd(0, 1),
            BinaryOp::Sub => self.asm().subsd(0, 1),
            BinaryOp::Mul => self.asm().mulsd(0, 1),
            BinaryOp::Div => self.asm().divsd(0, 1),

            BinaryOp::Lt => self.compare(0x01),
            BinaryOp::Le => self.compare(0x02),
            BinaryOp::Gt => self.compare(0x06),
            BinaryOp::Ge => self.compare(0x05),
            BinaryOp::Eq | BinaryOp::StrictEq => self.compare(0x00),
            BinaryOp::Ne | BinaryOp::StrictNe => self.compare(0x04),

            BinaryOp::And => {
                self.asm().pand(0, 1);
                self.normalize_boolean();
            }
            BinaryOp::Or => {
                self.asm().por(0, 1);
                self.normalize_boolean();
            }

            BinaryOp::Assign => {
                // Slot reuse put the left identifier's own slot in `first`.
                self.asm().movsd_store(displacement(first), 1);
                self.asm().movsd_rr(0, 1);
            }

            // Handled by the early return above.
            BinaryOp::Pipe => {}
        }

        let dest = self.dest()?;
        self.asm().movq_store(displacement(dest), 0);
        Ok(())
    }

    /// CMPSD with the given SSE predicate, then boolean-normalize the
    /// all-ones/all-zeros result to exactly `1.0`/`0.0`.
    fn compare(&mut self, predicate: u8) {
        self.asm().cmpsd(0, 1, predicate);
        self.normalize_boolean();
    }

    /// AND `xmm0` with the bit pattern of `1.0`, staged through a fresh
    /// slot so the mask is an ordinary pool constant.
    fn normalize_boolean(&mut self) {
        let mask = self.fresh_slot();
        self.load_literal_bits(mask, DOUBLE_ONE_BITS);
        self.asm().movsd_load(1, displacement(mask));
        self.asm().pand(0, 1);
    }

    /// Destination slot for a sub-expression: a bare identifier reuses its
    /// own slot (a call wrapper reduces to the wrapped callee); anything
    /// else gets a fresh slot.
    fn operand_slot(&mut self, expr: &Expr) -> Result<i32, CompileError> {
        match expr {
            Expr::Ident(name) => self.lookup(name),
            Expr::Call(inner) => self.operand_slot(inner),
            _ => Ok(self.fresh_slot()),
        }
    }

    // ==================== Runtime binding ====================

    fn emit_runtime_call(&mut self, callee: &Expr, argument: &Expr) -> Result<(), CompileError> {
        let Some(name) = callee_name(callee) else {
            self.diagnostics
                .push("expected a runtime function name to the left of `|`".to_string());
            return Ok(());
        };
        let Some(func) = self.runtime.get(name) else {
            self.diagnostics
                .push(format!("`{}` is not a registered runtime function", name));
            return Ok(());
        };

        let slot = self.operand_slot(argument)?;
        self.dests.push(slot);
        self.emit(argument)?;
        self.dests.pop();

        // Argument in xmm0, helper address through rax.
        self.asm().movsd_load(0, displacement(slot));
        self.asm().mov_rax_imm64(func as usize as u64);
        self.asm().call_rax();
        Ok(())
    }

    // ==================== Function envelope ====================

    fn emit_function(&mut self, params: &[String], body: &Expr) -> Result<(), CompileError> {
        self.asm().push_rbp();
        self.asm().mov_rbp_rsp();
        // Frame size is unknown until the body has allocated its slots.
        let frame_patch = self.asm().sub_rsp_imm32(0);

        for (index, name) in params.iter().enumerate() {
            if index < REGISTER_ARGS {
                let slot = self.define(name)?;
                self.asm().movq_store(displacement(slot), index as u8);
            } else {
                self.bind_stack_arg(name, index)?;
            }
        }

        self.emit(body)?;

        // Falling off the end returns 0.0; explicit returns jump past this
        // into the epilogue with their value already in xmm0.
        self.asm().xorpd(0, 0);

        let epilogue = self.buf.offset();
        while let Some(at) = self.return_fixups.pop() {
            self.patch_jump(at, epilogue);
        }

        let frame = frame_size(self.next_slot);
        self.buf.patch_u32(frame_patch, frame);

        self.asm().add_rsp_imm32(frame);
        self.asm().mov_rsp_rbp();
        self.asm().pop_rbp();
        self.asm().ret();
        Ok(())
    }

    // ==================== Conditional-jump protocol ====================

    /// Emit "jump to the (not yet known) false branch if the condition in
    /// the top destination slot is 0.0 or NaN".
    ///
    /// `ucomisd` against zero sets ZF on equality and PF on unordered, so
    /// both `jp` and `je` are emitted and both immediates are recorded.
    fn jump_if_condition_false(&mut self) -> Result<(), CompileError> {
        let cond = self.dests.pop().ok_or(CompileError::MissingDestination)?;
        let disp = displacement(cond);

        self.asm().pxor(0, 0);

        self.asm().ucomisd_load(0, disp);
        self.cond_fixups.push(self.buf.offset());
        self.asm().jp_rel32(0);

        self.asm().ucomisd_load(0, disp);
        self.cond_fixups.push(self.buf.offset());
        self.asm().je_rel32(0);

        Ok(())
    }

    /// Patch the pending jp/je pair to the current offset.
    fn patch_conditional_jumps(&mut self) -> Result<(), CompileError> {
        let here = self.buf.offset();
        for _ in 0..2 {
            let at = self
                .cond_fixups
                .pop()
                .ok_or(CompileError::UnbalancedFixups("conditional jumps"))?;
            self.patch_cond_jump(at, here);
        }
        Ok(())
    }

    // ==================== Jump helpers ====================

    fn begin_forward_jump(&mut self) {
        self.forward_fixups.push(self.buf.offset());
        self.asm().jmp_rel32(0);
    }

    fn end_forward_jump(&mut self) -> Result<(), CompileError> {
        let at = self
            .forward_fixups
            .pop()
            .ok_or(CompileError::UnbalancedFixups("forward jumps"))?;
        let here = self.buf.offset();
        self.patch_jump(at, here);
        Ok(())
    }

    /// Emit a resolved `jmp` to an already-known (backward) offset.
    fn jump_to(&mut self, target: usize) {
        let rel = relative32(self.buf.offset() + 5, target);
        self.asm().jmp_rel32(rel);
    }

    /// Rewrite the immediate of a `jmp rel32` at `at` to reach `target`.
    fn patch_jump(&mut self, at: usize, target: usize) {
        self.buf.patch_u32(at + 1, relative32(at + 5, target));
    }

    /// Rewrite the immediate of a `jcc rel32` (two-byte opcode) at `at`.
    fn patch_cond_jump(&mut self, at: usize, target: usize) {
        self.buf.patch_u32(at + 2, relative32(at + 6, target));
    }

    // ==================== Break/continue scopes ====================

    fn open_loop_scopes(&mut self) {
        self.break_scopes.push(Vec::new());
        self.continue_scopes.push(Vec::new());
    }

    fn close_break_scope(&mut self, target: usize) -> Result<(), CompileError> {
        let scope = self
            .break_scopes
            .pop()
            .ok_or(CompileError::UnbalancedFixups("break scopes"))?;
        for at in scope {
            self.patch_jump(at, target);
        }
        Ok(())
    }

    fn close_continue_scope(&mut self, target: usize) -> Result<(), CompileError> {
        let scope = self
            .continue_scopes
            .pop()
            .ok_or(CompileError::UnbalancedFixups("continue scopes"))?;
        for at in scope {
            self.patch_jump(at, target);
        }
        Ok(())
    }

    // ==================== Slots and literals ====================

    fn fresh_slot(&mut self) -> i32 {
        let slot = self.next_slot;
        self.next_slot += 1;
        slot
    }

    fn define(&mut self, name: &str) -> Result<i32, CompileError> {
        if self.slots.contains_key(name) {
            return Err(CompileError::Redefinition(name.to_string()));
        }
        let slot = self.fresh_slot();
        self.slots.insert(name.to_string(), slot);
        Ok(slot)
    }

    fn bind_stack_arg(&mut self, name: &str, index: usize) -> Result<(), CompileError> {
        if self.slots.contains_key(name) {
            return Err(CompileError::Redefinition(name.to_string()));
        }
        self.slots.insert(name.to_string(), stack_arg_slot(index));
        Ok(())
    }

    fn lookup(&self, name: &str) -> Result<i32, CompileError> {
        self.slots
            .get(name)
            .copied()
            .ok_or_else(|| CompileError::UnboundIdentifier(name.to_string()))
    }

    fn dest(&self) -> Result<i32, CompileError> {
        self.dests
            .last()
            .copied()
            .ok_or(CompileError::MissingDestination)
    }

    /// Load a pool constant into a slot: `movabs rax, [entry]` then a store
    /// off `rbp`. The entry's absolute address is baked into the code.
    fn load_literal(&mut self, slot: i32, value: f64) {
        self.load_literal_bits(slot, value.to_bits());
    }

    fn load_literal_bits(&mut self, slot: i32, bits: u64) {
        let address = self.literals.intern_bits(bits) as u64;
        let disp = displacement(slot);
        self.asm().mov_rax_abs(address);
        self.asm().mov_frame_rax(disp);
    }

    /// Double-move between slots through xmm0.
    fn copy_slot(&mut self, to: i32, from: i32) {
        self.asm().movsd_load(0, displacement(from));
        self.asm().movq_store(displacement(to), 0);
    }

    fn asm(&mut self) -> X64Assembler<'_> {
        X64Assembler::new(&mut self.buf)
    }
}

impl Default for CodeGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// Reduce a callee expression to the identifier it names, unwrapping call
/// nodes.
fn callee_name(expr: &Expr) -> Option<&str> {
    match expr {
        Expr::Ident(name) => Some(name),
        Expr::Call(inner) => callee_name(inner),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn func(params: &[&str], body: Vec<Expr>) -> Expr {
        Expr::Function {
            name: "f".to_string(),
            params: params.iter().map(|p| p.to_string()).collect(),
            body: Box::new(Expr::Block(body)),
        }
    }

    fn num(value: f64) -> Expr {
        Expr::Number(value)
    }

    fn ident(name: &str) -> Expr {
        Expr::Ident(name.to_string())
    }

    fn binary(op: BinaryOp, left: Expr, right: Expr) -> Expr {
        Expr::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    fn ret(expr: Expr) -> Expr {
        Expr::Unary {
            op: UnaryOp::Return,
            operand: Box::new(expr),
        }
    }

    fn var(name: &str, init: Expr) -> Expr {
        Expr::VarDef {
            name: name.to_string(),
            init: Box::new(init),
        }
    }

    #[test]
    fn test_empty_function_bytes() {
        let mut generator = CodeGenerator::new();
        generator.compile_function(&func(&[], vec![])).unwrap();

        // push rbp; mov rbp, rsp; sub rsp, 16 (1 slot, padded);
        // xorpd xmm0, xmm0; add rsp, 16; mov rsp, rbp; pop rbp; ret
        #[rustfmt::skip]
        let expected = [
            0x55,
            0x48, 0x89, 0xE5,
            0x48, 0x81, 0xEC, 0x10, 0x00, 0x00, 0x00,
            0x66, 0x0F, 0x57, 0xC0,
            0x48, 0x81, 0xC4, 0x10, 0x00, 0x00, 0x00,
            0x48, 0x89, 0xEC,
            0x5D,
            0xC3,
        ];
        assert_eq!(generator.machine_code(), &expected);
    }

    #[test]
    fn test_fixup_stacks_empty_after_control_flow() {
        let body = vec![
            var("x", num(0.0)),
            Expr::While {
                condition: Box::new(binary(BinaryOp::Lt, ident("x"), num(3.0))),
                body: Box::new(Expr::Block(vec![
                    Expr::If {
                        condition: Box::new(binary(BinaryOp::Eq, ident("x"), num(1.0))),
                        then_branch: Box::new(Expr::Block(vec![Expr::Continue])),
                        else_branch: Some(Box::new(Expr::Block(vec![]))),
                    },
                    binary(BinaryOp::Assign, ident("x"), binary(BinaryOp::Add, ident("x"), num(1.0))),
                ])),
            },
            ret(ident("x")),
        ];

        let mut generator = CodeGenerator::new();
        generator.compile_function(&func(&[], body)).unwrap();

        assert!(generator.dests.is_empty());
        assert!(generator.cond_fixups.is_empty());
        assert!(generator.forward_fixups.is_empty());
        assert!(generator.return_fixups.is_empty());
        assert!(generator.break_scopes.is_empty());
        assert!(generator.continue_scopes.is_empty());
    }

    #[test]
    fn test_redefinition_rejected() {
        let body = vec![var("x", num(1.0)), var("x", num(2.0))];
        let mut generator = CodeGenerator::new();
        let err = generator.compile_function(&func(&[], body)).unwrap_err();
        assert!(matches!(err, CompileError::Redefinition(name) if name == "x"));
    }

    #[test]
    fn test_unbound_identifier_rejected() {
        let body = vec![ret(ident("missing"))];
        let mut generator = CodeGenerator::new();
        let err = generator.compile_function(&func(&[], body)).unwrap_err();
        assert!(matches!(err, CompileError::UnboundIdentifier(name) if name == "missing"));
    }

    #[test]
    fn test_break_outside_loop_rejected() {
        let mut generator = CodeGenerator::new();
        let err = generator
            .compile_function(&func(&[], vec![Expr::Break]))
            .unwrap_err();
        assert!(matches!(err, CompileError::BreakOutsideLoop));
    }

    #[test]
    fn test_continue_outside_loop_rejected() {
        let mut generator = CodeGenerator::new();
        let err = generator
            .compile_function(&func(&[], vec![Expr::Continue]))
            .unwrap_err();
        assert!(matches!(err, CompileError::ContinueOutsideLoop));
    }

    #[test]
    fn test_not_a_function_rejected() {
        let mut generator = CodeGenerator::new();
        let err = generator.compile_function(&num(1.0)).unwrap_err();
        assert!(matches!(err, CompileError::NotAFunction));

        let err = generator
            .compile_function(&Expr::TopStatements(vec![num(1.0)]))
            .unwrap_err();
        assert!(matches!(err, CompileError::NotAFunction));
    }

    #[test]
    fn test_bad_pipe_callee_is_diagnostic_not_error() {
        // `5 | 3` — no runtime function name on the left
        let body = vec![binary(BinaryOp::Pipe, num(5.0), num(3.0))];
        let mut generator = CodeGenerator::new();
        generator.compile_function(&func(&[], body)).unwrap();
        assert_eq!(generator.diagnostics().len(), 1);
        assert!(generator.diagnostics()[0].contains("runtime function name"));
    }

    #[test]
    fn test_unknown_runtime_name_is_diagnostic_not_error() {
        let body = vec![binary(BinaryOp::Pipe, ident("plot"), num(3.0))];
        let mut generator = CodeGenerator::new();
        generator.compile_function(&func(&[], body)).unwrap();
        assert_eq!(generator.diagnostics().len(), 1);
        assert!(generator.diagnostics()[0].contains("plot"));
    }

    #[test]
    fn test_call_wrapper_reduces_to_identifier() {
        // `(print) | 1` with the callee wrapped in a call node
        let callee = Expr::Call(Box::new(ident("print")));
        let body = vec![binary(BinaryOp::Pipe, callee, num(1.0))];
        let mut generator = CodeGenerator::new();
        generator.compile_function(&func(&[], body)).unwrap();
        assert!(generator.diagnostics().is_empty());
    }

    #[test]
    fn test_emission_is_deterministic() {
        let tree = func(
            &["a", "b"],
            vec![ret(binary(
                BinaryOp::Add,
                binary(BinaryOp::Mul, ident("a"), num(2.0)),
                ident("b"),
            ))],
        );

        let mut generator = CodeGenerator::new();
        generator.compile_function(&tree).unwrap();
        let first = generator.machine_code().to_vec();
        generator.compile_function(&tree).unwrap();
        let second = generator.machine_code().to_vec();

        // Same generator, same pool addresses: byte-for-byte identical.
        assert_eq!(first, second);
    }

    #[test]
    fn test_literals_coalesce_in_pool() {
        let body = vec![
            var("x", num(5.0)),
            ret(binary(BinaryOp::Add, num(5.0), num(5.0))),
        ];
        let mut generator = CodeGenerator::new();
        generator.compile_function(&func(&[], body)).unwrap();
        assert_eq!(generator.literals.len(), 1);
        assert!(generator.literals.contains(5.0));
    }

    #[test]
    fn test_pool_survives_reset() {
        let mut generator = CodeGenerator::new();
        generator
            .compile_function(&func(&[], vec![ret(num(7.0))]))
            .unwrap();
        let address = generator.literals.intern(7.0);

        generator
            .compile_function(&func(&[], vec![ret(num(9.0))]))
            .unwrap();

        assert_eq!(generator.literals.intern(7.0), address);
        assert!(generator.literals.contains(9.0));
    }

    #[test]
    fn test_displacements() {
        assert_eq!(displacement(1), -8);
        assert_eq!(displacement(3), -24);
        // Caller-stack arguments resolve to positive displacements.
        #[cfg(not(windows))]
        assert_eq!(displacement(stack_arg_slot(REGISTER_ARGS)), 16);
        #[cfg(windows)]
        assert_eq!(displacement(stack_arg_slot(REGISTER_ARGS)), 48);
    }

    #[test]
    fn test_frame_size_keeps_alignment() {
        assert_eq!(frame_size(1), 16);
        assert_eq!(frame_size(2), 16);
        assert_eq!(frame_size(3), 32);
        assert_eq!(frame_size(4), 32);
    }

    #[test]
    fn test_many_params_bind_stack_slots() {
        let params: Vec<String> = (0..REGISTER_ARGS + 2).map(|i| format!("a{}", i)).collect();
        let names: Vec<&str> = params.iter().map(|p| p.as_str()).collect();
        let body = vec![ret(ident(&format!("a{}", REGISTER_ARGS + 1)))];

        let mut generator = CodeGenerator::new();
        generator.compile_function(&func(&names, body)).unwrap();

        // Register parameters got positive slots, the extras negative ones.
        assert!(generator.slots[&format!("a{}", REGISTER_ARGS - 1)] > 0);
        assert!(generator.slots[&format!("a{}", REGISTER_ARGS)] < 0);
    }
}
