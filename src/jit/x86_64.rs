//! x86-64 instruction encoding for the JIT.
//!
//! A thin assembler over [`CodeBuffer`] covering exactly the instruction
//! forms the emitter produces: SSE2 scalar-double arithmetic between
//! `xmm` registers, loads/stores between `xmm` registers and `rbp`-relative
//! frame slots, the absolute loads used for pool constants and runtime
//! function pointers, and rel32 control flow.
//!
//! Frame slots are always addressed as `[rbp + disp32]` with a full 32-bit
//! displacement, and `sub/add rsp` always use the imm32 form, so that every
//! patchable immediate has a fixed width and offset.

use super::codebuf::CodeBuffer;

/// An SSE register number (`xmm0`..`xmm7`).
pub type Xmm = u8;

/// ModR/M byte for a register-to-register operation.
fn modrm_rr(reg: u8, rm: u8) -> u8 {
    0b1100_0000 | ((reg & 0x7) << 3) | (rm & 0x7)
}

/// ModR/M byte for `[rbp + disp32]` with the given register field.
fn modrm_rbp_disp32(reg: u8) -> u8 {
    0b1000_0101 | ((reg & 0x7) << 3)
}

/// x86-64 assembler writing into a code buffer.
pub struct X64Assembler<'a> {
    buf: &'a mut CodeBuffer,
}

impl<'a> X64Assembler<'a> {
    pub fn new(buf: &'a mut CodeBuffer) -> Self {
        Self { buf }
    }

    // ==================== Frame setup ====================

    /// PUSH RBP
    pub fn push_rbp(&mut self) {
        self.buf.emit_u8(0x55);
    }

    /// POP RBP
    pub fn pop_rbp(&mut self) {
        self.buf.emit_u8(0x5D);
    }

    /// MOV RBP, RSP
    pub fn mov_rbp_rsp(&mut self) {
        self.buf.emit_bytes(&[0x48, 0x89, 0xE5]);
    }

    /// MOV RSP, RBP
    pub fn mov_rsp_rbp(&mut self) {
        self.buf.emit_bytes(&[0x48, 0x89, 0xEC]);
    }

    /// SUB RSP, imm32 (always the 4-byte-immediate form).
    ///
    /// Returns the offset of the immediate so the prologue reservation can
    /// be patched once the frame size is known.
    pub fn sub_rsp_imm32(&mut self, imm: u32) -> usize {
        self.buf.emit_bytes(&[0x48, 0x81, 0xEC]);
        let at = self.buf.offset();
        self.buf.emit_u32(imm);
        at
    }

    /// ADD RSP, imm32 (always the 4-byte-immediate form).
    pub fn add_rsp_imm32(&mut self, imm: u32) {
        self.buf.emit_bytes(&[0x48, 0x81, 0xC4]);
        self.buf.emit_u32(imm);
    }

    /// RET
    pub fn ret(&mut self) {
        self.buf.emit_u8(0xC3);
    }

    // ==================== Absolute loads ====================

    /// MOV RAX, [moffs64] (load the qword stored at an absolute address).
    ///
    /// Used for literal-pool constants: the pool entry's address is baked
    /// into the instruction stream.
    pub fn mov_rax_abs(&mut self, address: u64) {
        self.buf.emit_bytes(&[0x48, 0xA1]);
        self.buf.emit_u64(address);
    }

    /// MOV RAX, imm64 (movabs).
    pub fn mov_rax_imm64(&mut self, imm: u64) {
        self.buf.emit_bytes(&[0x48, 0xB8]);
        self.buf.emit_u64(imm);
    }

    /// MOV [RBP + disp32], RAX
    pub fn mov_frame_rax(&mut self, disp: i32) {
        self.buf.emit_bytes(&[0x48, 0x89, 0x85]);
        self.buf.emit_u32(disp as u32);
    }

    // ==================== SSE2 data movement ====================

    /// MOVSD xmm, QWORD PTR [RBP + disp32]
    pub fn movsd_load(&mut self, dst: Xmm, disp: i32) {
        self.buf.emit_bytes(&[0xF2, 0x0F, 0x10, modrm_rbp_disp32(dst)]);
        self.buf.emit_u32(disp as u32);
    }

    /// MOVSD QWORD PTR [RBP + disp32], xmm
    pub fn movsd_store(&mut self, disp: i32, src: Xmm) {
        self.buf.emit_bytes(&[0xF2, 0x0F, 0x11, modrm_rbp_disp32(src)]);
        self.buf.emit_u32(disp as u32);
    }

    /// MOVSD xmm, xmm
    pub fn movsd_rr(&mut self, dst: Xmm, src: Xmm) {
        self.buf.emit_bytes(&[0xF2, 0x0F, 0x10, modrm_rr(dst, src)]);
    }

    /// MOVQ QWORD PTR [RBP + disp32], xmm
    pub fn movq_store(&mut self, disp: i32, src: Xmm) {
        self.buf.emit_bytes(&[0x66, 0x0F, 0xD6, modrm_rbp_disp32(src)]);
        self.buf.emit_u32(disp as u32);
    }

    // ==================== SSE2 arithmetic ====================

    /// ADDSD xmm, xmm
    pub fn addsd(&mut self, dst: Xmm, src: Xmm) {
        self.scalar_op(0x58, dst, src);
    }

    /// SUBSD xmm, xmm
    pub fn subsd(&mut self, dst: Xmm, src: Xmm) {
        self.scalar_op(0x5C, dst, src);
    }

    /// MULSD xmm, xmm
    pub fn mulsd(&mut self, dst: Xmm, src: Xmm) {
        self.scalar_op(0x59, dst, src);
    }

    /// DIVSD xmm, xmm
    pub fn divsd(&mut self, dst: Xmm, src: Xmm) {
        self.scalar_op(0x5E, dst, src);
    }

    /// F2 0F <op> /r with a register-direct operand; the second opcode byte
    /// selects among ADDSD/SUBSD/MULSD/DIVSD.
    pub fn scalar_op(&mut self, op: u8, dst: Xmm, src: Xmm) {
        self.buf.emit_bytes(&[0xF2, 0x0F, op, modrm_rr(dst, src)]);
    }

    /// CMPSD xmm, xmm, imm8 (SSE compare predicate; result is all-ones or
    /// all-zeros in the destination).
    pub fn cmpsd(&mut self, dst: Xmm, src: Xmm, predicate: u8) {
        self.buf.emit_bytes(&[0xF2, 0x0F, 0xC2, modrm_rr(dst, src), predicate]);
    }

    /// UCOMISD xmm, QWORD PTR [RBP + disp32] (sets ZF on equality, PF on
    /// unordered).
    pub fn ucomisd_load(&mut self, dst: Xmm, disp: i32) {
        self.buf.emit_bytes(&[0x66, 0x0F, 0x2E, modrm_rbp_disp32(dst)]);
        self.buf.emit_u32(disp as u32);
    }

    // ==================== Packed bitwise ====================

    /// PAND xmm, xmm
    pub fn pand(&mut self, dst: Xmm, src: Xmm) {
        self.buf.emit_bytes(&[0x66, 0x0F, 0xDB, modrm_rr(dst, src)]);
    }

    /// POR xmm, xmm
    pub fn por(&mut self, dst: Xmm, src: Xmm) {
        self.buf.emit_bytes(&[0x66, 0x0F, 0xEB, modrm_rr(dst, src)]);
    }

    /// PXOR xmm, xmm
    pub fn pxor(&mut self, dst: Xmm, src: Xmm) {
        self.buf.emit_bytes(&[0x66, 0x0F, 0xEF, modrm_rr(dst, src)]);
    }

    /// XORPD xmm, xmm
    pub fn xorpd(&mut self, dst: Xmm, src: Xmm) {
        self.buf.emit_bytes(&[0x66, 0x0F, 0x57, modrm_rr(dst, src)]);
    }

    // ==================== Control flow ====================

    /// JMP rel32
    pub fn jmp_rel32(&mut self, offset: u32) {
        self.buf.emit_u8(0xE9);
        self.buf.emit_u32(offset);
    }

    /// JP rel32 (jump if parity — unordered comparison result)
    pub fn jp_rel32(&mut self, offset: u32) {
        self.buf.emit_bytes(&[0x0F, 0x8A]);
        self.buf.emit_u32(offset);
    }

    /// JE rel32 (jump if equal/zero)
    pub fn je_rel32(&mut self, offset: u32) {
        self.buf.emit_bytes(&[0x0F, 0x84]);
        self.buf.emit_u32(offset);
    }

    /// CALL RAX (indirect call through the register holding the helper
    /// address)
    pub fn call_rax(&mut self) {
        self.buf.emit_bytes(&[0xFF, 0xD0]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn emit(f: impl FnOnce(&mut X64Assembler)) -> Vec<u8> {
        let mut buf = CodeBuffer::new();
        let mut asm = X64Assembler::new(&mut buf);
        f(&mut asm);
        buf.code().to_vec()
    }

    #[test]
    fn test_frame_setup() {
        // push rbp; mov rbp, rsp = 55 48 89 E5
        assert_eq!(
            emit(|a| {
                a.push_rbp();
                a.mov_rbp_rsp();
            }),
            vec![0x55, 0x48, 0x89, 0xE5]
        );
    }

    #[test]
    fn test_frame_teardown() {
        // mov rsp, rbp; pop rbp; ret = 48 89 EC 5D C3
        assert_eq!(
            emit(|a| {
                a.mov_rsp_rbp();
                a.pop_rbp();
                a.ret();
            }),
            vec![0x48, 0x89, 0xEC, 0x5D, 0xC3]
        );
    }

    #[test]
    fn test_sub_rsp_imm32() {
        // sub rsp, 0x20 = 48 81 EC 20 00 00 00 (imm32 form, never imm8)
        let mut buf = CodeBuffer::new();
        let mut asm = X64Assembler::new(&mut buf);
        let at = asm.sub_rsp_imm32(0x20);
        assert_eq!(at, 3);
        assert_eq!(buf.code(), &[0x48, 0x81, 0xEC, 0x20, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn test_add_rsp_imm32() {
        // add rsp, 0x10 = 48 81 C4 10 00 00 00
        assert_eq!(
            emit(|a| a.add_rsp_imm32(0x10)),
            vec![0x48, 0x81, 0xC4, 0x10, 0x00, 0x00, 0x00]
        );
    }

    #[test]
    fn test_mov_rax_abs() {
        // mov rax, [0x1122334455667788] = 48 A1 88 77 66 55 44 33 22 11
        assert_eq!(
            emit(|a| a.mov_rax_abs(0x1122334455667788)),
            vec![0x48, 0xA1, 0x88, 0x77, 0x66, 0x55, 0x44, 0x33, 0x22, 0x11]
        );
    }

    #[test]
    fn test_mov_rax_imm64() {
        // movabs rax, 42 = 48 B8 2A 00 ...
        assert_eq!(
            emit(|a| a.mov_rax_imm64(42)),
            vec![0x48, 0xB8, 0x2A, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00]
        );
    }

    #[test]
    fn test_mov_frame_rax() {
        // mov [rbp-8], rax = 48 89 85 F8 FF FF FF
        assert_eq!(
            emit(|a| a.mov_frame_rax(-8)),
            vec![0x48, 0x89, 0x85, 0xF8, 0xFF, 0xFF, 0xFF]
        );
    }

    #[test]
    fn test_movsd_load_xmm0() {
        // movsd xmm0, [rbp-8] = F2 0F 10 85 F8 FF FF FF
        assert_eq!(
            emit(|a| a.movsd_load(0, -8)),
            vec![0xF2, 0x0F, 0x10, 0x85, 0xF8, 0xFF, 0xFF, 0xFF]
        );
    }

    #[test]
    fn test_movsd_load_xmm1() {
        // movsd xmm1, [rbp-16] = F2 0F 10 8D F0 FF FF FF
        assert_eq!(
            emit(|a| a.movsd_load(1, -16)),
            vec![0xF2, 0x0F, 0x10, 0x8D, 0xF0, 0xFF, 0xFF, 0xFF]
        );
    }

    #[test]
    fn test_movsd_load_positive_disp() {
        // caller-stack argument: movsd xmm0, [rbp+16] = F2 0F 10 85 10 00 00 00
        assert_eq!(
            emit(|a| a.movsd_load(0, 16)),
            vec![0xF2, 0x0F, 0x10, 0x85, 0x10, 0x00, 0x00, 0x00]
        );
    }

    #[test]
    fn test_movsd_store() {
        // movsd [rbp-8], xmm1 = F2 0F 11 8D F8 FF FF FF
        assert_eq!(
            emit(|a| a.movsd_store(-8, 1)),
            vec![0xF2, 0x0F, 0x11, 0x8D, 0xF8, 0xFF, 0xFF, 0xFF]
        );
    }

    #[test]
    fn test_movsd_rr() {
        // movsd xmm0, xmm1 = F2 0F 10 C1
        assert_eq!(emit(|a| a.movsd_rr(0, 1)), vec![0xF2, 0x0F, 0x10, 0xC1]);
    }

    #[test]
    fn test_movq_store() {
        // movq [rbp-8], xmm0 = 66 0F D6 85 F8 FF FF FF
        assert_eq!(
            emit(|a| a.movq_store(-8, 0)),
            vec![0x66, 0x0F, 0xD6, 0x85, 0xF8, 0xFF, 0xFF, 0xFF]
        );
    }

    #[test]
    fn test_movq_store_high_xmm() {
        // movq [rbp-8], xmm4 = 66 0F D6 A5 F8 FF FF FF (register argument spill)
        assert_eq!(
            emit(|a| a.movq_store(-8, 4)),
            vec![0x66, 0x0F, 0xD6, 0xA5, 0xF8, 0xFF, 0xFF, 0xFF]
        );
    }

    #[test]
    fn test_scalar_arithmetic() {
        // addsd/subsd/mulsd/divsd xmm0, xmm1
        assert_eq!(emit(|a| a.addsd(0, 1)), vec![0xF2, 0x0F, 0x58, 0xC1]);
        assert_eq!(emit(|a| a.subsd(0, 1)), vec![0xF2, 0x0F, 0x5C, 0xC1]);
        assert_eq!(emit(|a| a.mulsd(0, 1)), vec![0xF2, 0x0F, 0x59, 0xC1]);
        assert_eq!(emit(|a| a.divsd(0, 1)), vec![0xF2, 0x0F, 0x5E, 0xC1]);
    }

    #[test]
    fn test_cmpsd() {
        // cmpltsd xmm0, xmm1 = F2 0F C2 C1 01
        assert_eq!(emit(|a| a.cmpsd(0, 1, 0x01)), vec![0xF2, 0x0F, 0xC2, 0xC1, 0x01]);
    }

    #[test]
    fn test_ucomisd_load() {
        // ucomisd xmm0, [rbp-8] = 66 0F 2E 85 F8 FF FF FF
        assert_eq!(
            emit(|a| a.ucomisd_load(0, -8)),
            vec![0x66, 0x0F, 0x2E, 0x85, 0xF8, 0xFF, 0xFF, 0xFF]
        );
    }

    #[test]
    fn test_packed_bitwise() {
        assert_eq!(emit(|a| a.pand(0, 1)), vec![0x66, 0x0F, 0xDB, 0xC1]);
        assert_eq!(emit(|a| a.por(0, 1)), vec![0x66, 0x0F, 0xEB, 0xC1]);
        assert_eq!(emit(|a| a.pxor(0, 0)), vec![0x66, 0x0F, 0xEF, 0xC0]);
        assert_eq!(emit(|a| a.xorpd(0, 0)), vec![0x66, 0x0F, 0x57, 0xC0]);
    }

    #[test]
    fn test_jumps() {
        assert_eq!(emit(|a| a.jmp_rel32(0x10)), vec![0xE9, 0x10, 0x00, 0x00, 0x00]);
        assert_eq!(emit(|a| a.jp_rel32(0x10)), vec![0x0F, 0x8A, 0x10, 0x00, 0x00, 0x00]);
        assert_eq!(emit(|a| a.je_rel32(0x10)), vec![0x0F, 0x84, 0x10, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn test_call_rax() {
        assert_eq!(emit(|a| a.call_rax()), vec![0xFF, 0xD0]);
    }
}
