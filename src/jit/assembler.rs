//! In-place assembler for Thumb code.
//!
//! Instructions are written forward from the start of a caller-supplied
//! halfword buffer and 32-bit literals backward from its end. Branches and
//! literal loads carry their label or literal index in the offset field
//! until [`Assembler::assemble`] relaxes out-of-range conditional branches,
//! rewrites every field with a real offset and moves the literal pool
//! behind the code.
//!
//! A literal load far enough from the end of the buffer that the pool
//! might end up out of its reach keeps room for a bytewise build of the
//! constant, which relaxation falls back to when needed.

use super::JitError;
use super::thumb::{self, Cond, Reg};

/// Largest buffer the assembler will use, in halfwords. An unconditional
/// branch can reach anywhere inside it.
pub const MAX_HALFWORDS: usize = 1020;

/// Labels per function. Index 255 is reserved as the "skip next" marker
/// in relaxed branches.
pub const MAX_LABELS: usize = 255;

/// Literals per function.
pub const MAX_LITERALS: usize = 256;

const SKIP_NEXT: u8 = 0xFF;

/// Halfwords from a literal load to the end of the pool that
/// `ldr rt, [pc, #imm8*4]` is sure to span.
const LITERAL_REACH: usize = 510;

/// A branch target, pinned once with [`Assembler::pin`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Label(u8);

impl Label {
    pub fn new(index: usize) -> Self {
        assert!(index < MAX_LABELS, "label index {} out of range", index);
        Label(index as u8)
    }

    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// A pooled 32-bit constant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Literal(u8);

impl Literal {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Layout of a finished function inside the buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Assembled {
    /// Halfwords of code, excluding alignment padding.
    pub code_len: usize,
    /// One past the last halfword written (code, padding and literals).
    pub len: usize,
    /// Number of pooled literals.
    pub literals: usize,
    /// Conditional branches that needed the long form.
    pub relaxed: usize,
}

pub struct Assembler<'a> {
    buf: &'a mut [u16],
    /// Next instruction slot.
    pos: usize,
    /// Lowest halfword owned by the literal pool.
    pool_start: usize,
    labels: Vec<Option<usize>>,
    literals: usize,
    /// Offsets of literal loads followed by room for `mov32_bytewise`.
    far_loads: Vec<usize>,
    error: Option<JitError>,
}

impl<'a> Assembler<'a> {
    /// Create an assembler over `buf` with `labels` label slots.
    pub fn new(buf: &'a mut [u16], labels: usize) -> Self {
        assert!(labels <= MAX_LABELS, "too many labels: {}", labels);
        let len = buf.len().min(MAX_HALFWORDS) & !1;
        let buf = &mut buf[..len];
        Self {
            buf,
            pos: 0,
            pool_start: len,
            labels: vec![None; labels],
            literals: 0,
            far_loads: Vec::new(),
            error: None,
        }
    }

    /// Current write offset in halfwords.
    pub fn offset(&self) -> usize {
        self.pos
    }

    /// Instructions emitted so far (before assembly).
    pub fn code(&self) -> &[u16] {
        &self.buf[..self.pos]
    }

    fn fail(&mut self, error: JitError) {
        if self.error.is_none() {
            self.error = Some(error);
        }
    }

    fn push(&mut self, hw: u16) {
        if self.pos < self.pool_start {
            self.buf[self.pos] = hw;
            self.pos += 1;
        } else {
            self.fail(JitError::BufferExhausted);
        }
    }

    /// Append one instruction. A conditional branch also reserves room for
    /// its long form.
    pub fn emit(&mut self, hw: u16) {
        self.push(hw);
        if thumb::is_cond_branch(hw) {
            self.push(thumb::NOP);
        }
    }

    /// Append a VM table call carrying `control` as its inline payload.
    pub fn vm_tab(&mut self, control: u16) {
        self.push(thumb::VM_MARKER);
        self.push(control);
    }

    /// Resolve `label` to the current offset.
    pub fn pin(&mut self, label: Label) {
        let slot = &mut self.labels[label.index()];
        assert!(slot.is_none(), "label {} pinned twice", label.index());
        *slot = Some(self.pos);
    }

    pub fn is_pinned(&self, label: Label) -> bool {
        self.labels[label.index()].is_some()
    }

    /// Handle for a pooled constant, reusing an existing entry if one holds
    /// the same value.
    pub fn literal(&mut self, value: u32) -> Literal {
        let end = self.buf.len();
        for k in 0..self.literals {
            let at = end - 2 * (k + 1);
            let stored = self.buf[at] as u32 | (self.buf[at + 1] as u32) << 16;
            if stored == value {
                return Literal(k as u8);
            }
        }
        if self.literals == MAX_LITERALS {
            self.fail(JitError::LiteralPoolFull);
            return Literal(0);
        }
        if self.pool_start < self.pos + 2 {
            self.fail(JitError::BufferExhausted);
            return Literal(0);
        }
        self.pool_start -= 2;
        self.buf[self.pool_start] = value as u16;
        self.buf[self.pool_start + 1] = (value >> 16) as u16;
        let k = self.literals;
        self.literals += 1;
        Literal(k as u8)
    }

    /// B label
    pub fn b(&mut self, label: Label) {
        self.emit(thumb::b(label.index() as u16));
    }

    /// B<cond> label
    pub fn b_cond(&mut self, cond: Cond, label: Label) {
        self.emit(thumb::b_cond(cond, label.0));
    }

    /// LDR rt, =literal
    ///
    /// Clobbers the flags if the load has to be replaced by a bytewise
    /// build.
    pub fn ldr_literal(&mut self, rt: Reg, literal: Literal) {
        if self.buf.len() - self.pos <= LITERAL_REACH {
            self.push(thumb::ldr_literal(rt, literal.0));
            return;
        }
        self.far_loads.push(self.pos);
        self.push(thumb::ldr_literal(rt, literal.0));
        for _ in 1..thumb::MOV32_HALFWORDS {
            self.push(thumb::NOP);
        }
    }

    /// Relax, link and lay out the function.
    pub fn assemble(self) -> Result<Assembled, JitError> {
        if let Some(error) = self.error {
            return Err(error);
        }
        let mut labels = Vec::with_capacity(self.labels.len());
        for (i, label) in self.labels.iter().enumerate() {
            match label {
                Some(at) => labels.push(*at),
                None => panic!("label {} was never pinned", i),
            }
        }

        let (code_len, relaxed) = relax(self.buf, self.pos, &mut labels, &self.far_loads);
        let (code_len, len) = link(self.buf, code_len, self.pool_start, self.literals, &labels);

        Ok(Assembled { code_len, len, literals: self.literals, relaxed })
    }
}

/// Drop the placeholders of short conditional branches and rewrite the
/// others as an inverted skip plus an unconditional branch.
///
/// This is one pass: a branch judged long is not reconsidered when later
/// removals would have brought it in range. Backward distances are exact
/// because every removal before the target is already known; forward
/// distances use the raw distance, which can only shrink.
///
/// Literal loads listed in `far_loads` are judged the same way against
/// the end of the pool: in reach they drop their reserved room, otherwise
/// the room is filled with a bytewise build of the constant.
fn relax(buf: &mut [u16], end: usize, labels: &mut [usize], far_loads: &[usize]) -> (usize, usize) {
    let mut removed: Vec<usize> = Vec::new();
    let mut relaxed = 0;
    let mut read = 0;
    let mut write = 0;
    let mut far_loads = far_loads.iter().peekable();

    while read < end {
        let hw = buf[read];
        if far_loads.next_if_eq(&&read).is_some() {
            let k = thumb::ldr_literal_field(hw) as usize;
            if end - read + 2 * k <= LITERAL_REACH {
                buf[write] = hw;
                write += 1;
                removed.extend(read + 1..read + thumb::MOV32_HALFWORDS);
            } else {
                let at = buf.len() - 2 * (k + 1);
                let value = buf[at] as u32 | (buf[at + 1] as u32) << 16;
                let build = thumb::mov32_bytewise(thumb::ldr_literal_rt(hw), value);
                buf[write..write + build.len()].copy_from_slice(&build);
                write += build.len();
            }
            read += thumb::MOV32_HALFWORDS;
            continue;
        }
        if thumb::is_vm_marker(hw) {
            buf[write] = hw;
            buf[write + 1] = buf[read + 1];
            read += 2;
            write += 2;
            continue;
        }
        if let Some(cond) = thumb::cond_branch_cond(hw) {
            let label = thumb::cond_branch_field(hw) as usize;
            let target = labels[label];
            let offset = if target <= read {
                let moved = removed.partition_point(|&at| at < target);
                (target - moved) as isize - write as isize - 2
            } else {
                target as isize - read as isize - 2
            };
            if (-128..=127).contains(&offset) {
                buf[write] = hw;
                write += 1;
                removed.push(read + 1);
            } else {
                buf[write] = thumb::b_cond(cond.invert(), SKIP_NEXT);
                buf[write + 1] = thumb::b(label as u16);
                write += 2;
                relaxed += 1;
            }
            read += 2;
            continue;
        }
        buf[write] = hw;
        read += 1;
        write += 1;
    }

    for at in labels.iter_mut() {
        *at -= removed.partition_point(|&r| r < *at);
    }
    (write, relaxed)
}

/// Rewrite branch, literal and VM table fields, then place the pool.
fn link(
    buf: &mut [u16],
    code_len: usize,
    pool_start: usize,
    literals: usize,
    labels: &[usize],
) -> (usize, usize) {
    let pool_words: Vec<u16> = buf[pool_start..pool_start + 2 * literals].to_vec();
    let pool = if literals > 0 { (code_len + 1) & !1 } else { code_len };
    if pool > code_len {
        buf[code_len] = thumb::NOP;
    }

    let mut at = 0;
    while at < code_len {
        let hw = buf[at];
        if thumb::is_vm_marker(hw) {
            buf[at] = thumb::blx(Reg::R9);
            at += 2;
            continue;
        }
        if thumb::is_cond_branch(hw) {
            let field = thumb::cond_branch_field(hw);
            let imm = if field == SKIP_NEXT {
                0
            } else {
                let offset = labels[field as usize] as isize - (at as isize + 2);
                debug_assert!((-128..=127).contains(&offset), "short branch out of range");
                offset as i8 as u8
            };
            buf[at] = thumb::with_cond_branch_field(hw, imm);
        } else if thumb::is_branch(hw) {
            let label = thumb::branch_field(hw) as usize;
            let offset = labels[label] as isize - (at as isize + 2);
            buf[at] = thumb::b(offset as u16 & 0x7FF);
        } else if thumb::is_ldr_literal(hw) {
            let k = thumb::ldr_literal_field(hw) as usize;
            let address = 2 * (pool + 2 * k);
            let pc = (2 * at + 4) & !3;
            let words = (address - pc) / 4;
            debug_assert!(words <= 0xFF, "literal load at {} out of reach", at);
            buf[at] = thumb::with_ldr_literal_field(hw, words as u8);
        }
        at += 1;
    }

    // The pool was filled from the end of the buffer, so literal k sits
    // 2 * (k + 1) halfwords before its end.
    for k in 0..literals {
        let from = 2 * (literals - k - 1);
        buf[pool + 2 * k] = pool_words[from];
        buf[pool + 2 * k + 1] = pool_words[from + 1];
    }
    (code_len, pool + 2 * literals)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jit::disasm::disassemble;

    #[test]
    fn test_emit_reserves_placeholder() {
        let mut buf = [0u16; 16];
        let mut asm = Assembler::new(&mut buf, 1);
        asm.b_cond(Cond::Eq, Label::new(0));
        asm.emit(thumb::NOP);
        assert_eq!(asm.offset(), 3);
        asm.pin(Label::new(0));
        let out = asm.assemble().unwrap();
        assert_eq!(out.code_len, 2);
        assert_eq!(out.relaxed, 0);
        // beq over the nop: offset 0 means "branch to pc + 4"
        assert_eq!(buf[0], 0xD000);
    }

    #[test]
    fn test_short_and_relaxed_branches() {
        let mut buf = [0u16; MAX_HALFWORDS];
        let mut asm = Assembler::new(&mut buf, 2);
        let back = Label::new(0);
        let fwd = Label::new(1);
        asm.pin(back);
        asm.b_cond(Cond::Ne, back);
        asm.b_cond(Cond::Eq, fwd);
        for _ in 0..1000 {
            asm.emit(thumb::NOP);
        }
        asm.pin(fwd);
        let out = asm.assemble().unwrap();

        assert_eq!(out.relaxed, 1);
        // bne to itself: one halfword, placeholder gone
        assert_eq!(buf[0], thumb::b_cond(Cond::Ne, 0xFE));
        // beq became bne-skip plus b
        assert_eq!(buf[1], thumb::b_cond(Cond::Ne, 0));
        assert!(thumb::is_branch(buf[2]));
        assert_eq!(thumb::branch_offset(buf[2]), 999);
        assert_eq!(out.code_len, 1003);
    }

    #[test]
    fn test_backward_distance_counts_removed_placeholders() {
        let mut buf = [0u16; 512];
        let mut asm = Assembler::new(&mut buf, 1);
        let top = Label::new(0);
        asm.pin(top);
        for _ in 0..64 {
            asm.b_cond(Cond::Eq, top);
        }
        asm.b_cond(Cond::Ne, top);
        let out = asm.assemble().unwrap();
        // 65 short branches; the last sits at 64 and reaches back 66 halfwords
        assert_eq!(out.code_len, 65);
        assert_eq!(out.relaxed, 0);
        assert_eq!(thumb::cond_branch_offset(buf[64]), -66);
    }

    #[test]
    fn test_literal_dedup() {
        let mut buf = [0u16; 32];
        let mut asm = Assembler::new(&mut buf, 0);
        let a = asm.literal(0x1234_5678);
        let b = asm.literal(0xCAFE_F00D);
        let c = asm.literal(0x1234_5678);
        assert_eq!(a, c);
        assert_ne!(a, b);
        asm.ldr_literal(Reg::R1, a);
        asm.ldr_literal(Reg::R2, b);
        asm.ldr_literal(Reg::R3, c);
        let out = asm.assemble().unwrap();

        assert_eq!(out.literals, 2);
        // three instructions, one nop of padding, then the pool
        assert_eq!(out.code_len, 3);
        assert_eq!(buf[3], thumb::NOP);
        assert_eq!(&buf[4..8], &[0x5678, 0x1234, 0xF00D, 0xCAFE]);
        assert_eq!(out.len, 8);
        assert_eq!(buf[0], thumb::ldr_literal(Reg::R1, 1));
        assert_eq!(buf[1], thumb::ldr_literal(Reg::R2, 2));
        assert_eq!(buf[2], thumb::ldr_literal(Reg::R3, 0));
    }

    #[test]
    fn test_far_literal_load_keeps_ldr_when_pool_is_close() {
        let mut buf = [0u16; MAX_HALFWORDS];
        let mut asm = Assembler::new(&mut buf, 0);
        let k = asm.literal(0x1234_5678);
        asm.ldr_literal(Reg::R1, k);
        // room for the bytewise build while the function may still grow
        assert_eq!(asm.offset(), thumb::MOV32_HALFWORDS);
        asm.emit(thumb::NOP);
        let out = asm.assemble().unwrap();

        assert_eq!(out.code_len, 2);
        assert_eq!(buf[0], thumb::ldr_literal(Reg::R1, 0));
        assert_eq!(&buf[2..4], &[0x5678, 0x1234]);
    }

    #[test]
    fn test_far_literal_load_is_built_bytewise_out_of_reach() {
        let mut buf = [0u16; MAX_HALFWORDS];
        let mut asm = Assembler::new(&mut buf, 1);
        let k = asm.literal(0x1234_5678);
        asm.ldr_literal(Reg::R2, k);
        for _ in 0..600 {
            asm.emit(thumb::NOP);
        }
        let top = Label::new(0);
        asm.pin(top);
        asm.b_cond(Cond::Eq, top);
        let out = asm.assemble().unwrap();

        assert_eq!(&buf[..7], &thumb::mov32_bytewise(Reg::R2, 0x1234_5678));
        assert_eq!(out.code_len, 7 + 600 + 1);
        assert_eq!(out.relaxed, 0);
        assert_eq!(thumb::cond_branch_offset(buf[607]), -2);
    }

    #[test]
    fn test_vm_tab_payload_is_kept_verbatim() {
        let mut buf = [0u16; 16];
        let mut asm = Assembler::new(&mut buf, 0);
        // payload that looks like a conditional branch and a literal load
        asm.vm_tab(0xD1FF);
        asm.vm_tab(0x4801);
        let out = asm.assemble().unwrap();
        assert_eq!(out.code_len, 4);
        assert_eq!(&buf[..4], &[0x47C8, 0xD1FF, 0x47C8, 0x4801]);
        assert_eq!(disassemble(&buf[..4])[0], "blx r9");
    }

    #[test]
    fn test_buffer_exhausted() {
        let mut buf = [0u16; 4];
        let mut asm = Assembler::new(&mut buf, 0);
        asm.literal(0x1234_5678);
        asm.emit(thumb::NOP);
        asm.emit(thumb::NOP);
        asm.emit(thumb::NOP);
        assert_eq!(asm.assemble(), Err(JitError::BufferExhausted));
    }

    #[test]
    fn test_buffer_is_clamped_to_even_length() {
        let mut buf = [0u16; 5];
        let mut asm = Assembler::new(&mut buf, 0);
        asm.literal(7);
        asm.literal(8);
        asm.emit(thumb::NOP);
        assert_eq!(asm.assemble(), Err(JitError::BufferExhausted));
    }

    #[test]
    #[should_panic(expected = "pinned twice")]
    fn test_pin_twice_panics() {
        let mut buf = [0u16; 4];
        let mut asm = Assembler::new(&mut buf, 1);
        asm.pin(Label::new(0));
        asm.pin(Label::new(0));
    }

    #[test]
    #[should_panic(expected = "never pinned")]
    fn test_unpinned_label_panics() {
        let mut buf = [0u16; 4];
        let mut asm = Assembler::new(&mut buf, 1);
        asm.b(Label::new(0));
        let _ = asm.assemble();
    }
}
