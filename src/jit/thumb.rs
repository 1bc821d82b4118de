//! Thumb (ARMv6-M) instruction encoding.
//!
//! Every function here is a pure pack or inspect operation on a single
//! 16-bit halfword. Nothing in this module knows about labels, literals
//! or the register window; the assembler and allocator build on top of it.

/// ARM core registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Reg {
    R0 = 0, R1 = 1, R2 = 2, R3 = 3,
    R4 = 4, R5 = 5, R6 = 6, R7 = 7,
    R8 = 8, R9 = 9, R10 = 10, R11 = 11,
    R12 = 12,
    Sp = 13,
    Lr = 14,
    Pc = 15,
}

impl Reg {
    const ALL: [Reg; 16] = [
        Reg::R0, Reg::R1, Reg::R2, Reg::R3,
        Reg::R4, Reg::R5, Reg::R6, Reg::R7,
        Reg::R8, Reg::R9, Reg::R10, Reg::R11,
        Reg::R12, Reg::Sp, Reg::Lr, Reg::Pc,
    ];

    pub fn code(self) -> u16 {
        self as u16
    }

    /// Register with the given number (0-15).
    pub fn from_index(index: usize) -> Reg {
        Self::ALL[index & 15]
    }

    pub fn is_low(self) -> bool {
        (self as u8) < 8
    }

    fn low(self) -> u16 {
        debug_assert!(self.is_low(), "{:?} is not a low register", self);
        self as u16
    }
}

/// Condition codes usable in a conditional branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Cond {
    Eq = 0b0000,  // Equal
    Ne = 0b0001,  // Not equal
    Hs = 0b0010,  // Carry set / unsigned higher or same
    Lo = 0b0011,  // Carry clear / unsigned lower
    Mi = 0b0100,  // Minus / negative
    Pl = 0b0101,  // Plus / positive or zero
    Vs = 0b0110,  // Overflow set
    Vc = 0b0111,  // Overflow clear
    Hi = 0b1000,  // Unsigned higher
    Ls = 0b1001,  // Unsigned lower or same
    Ge = 0b1010,  // Signed greater than or equal
    Lt = 0b1011,  // Signed less than
    Gt = 0b1100,  // Signed greater than
    Le = 0b1101,  // Signed less than or equal
}

impl Cond {
    const ALL: [Cond; 14] = [
        Cond::Eq, Cond::Ne, Cond::Hs, Cond::Lo,
        Cond::Mi, Cond::Pl, Cond::Vs, Cond::Vc,
        Cond::Hi, Cond::Ls, Cond::Ge, Cond::Lt,
        Cond::Gt, Cond::Le,
    ];

    pub fn code(self) -> u16 {
        self as u16
    }

    /// Condition for a 4-bit field; `None` for AL and the UDF/SVC space.
    pub fn from_code(code: u16) -> Option<Cond> {
        Self::ALL.get(code as usize).copied()
    }

    /// The condition that holds exactly when `self` does not.
    pub fn invert(self) -> Cond {
        Self::ALL[(self as usize) ^ 1]
    }

    pub fn mnemonic(self) -> &'static str {
        match self {
            Cond::Eq => "eq",
            Cond::Ne => "ne",
            Cond::Hs => "hs",
            Cond::Lo => "lo",
            Cond::Mi => "mi",
            Cond::Pl => "pl",
            Cond::Vs => "vs",
            Cond::Vc => "vc",
            Cond::Hi => "hi",
            Cond::Ls => "ls",
            Cond::Ge => "ge",
            Cond::Lt => "lt",
            Cond::Gt => "gt",
            Cond::Le => "le",
        }
    }
}

/// Two-register data processing opcodes (`0100 00oo oomm mddd`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AluOp {
    And = 0,
    Eor = 1,
    Lsl = 2,
    Lsr = 3,
    Asr = 4,
    Adc = 5,
    Sbc = 6,
    Ror = 7,
    Tst = 8,
    Rsb = 9,
    Cmp = 10,
    Cmn = 11,
    Orr = 12,
    Mul = 13,
    Bic = 14,
    Mvn = 15,
}

impl AluOp {
    const ALL: [AluOp; 16] = [
        AluOp::And, AluOp::Eor, AluOp::Lsl, AluOp::Lsr,
        AluOp::Asr, AluOp::Adc, AluOp::Sbc, AluOp::Ror,
        AluOp::Tst, AluOp::Rsb, AluOp::Cmp, AluOp::Cmn,
        AluOp::Orr, AluOp::Mul, AluOp::Bic, AluOp::Mvn,
    ];

    pub fn from_code(code: u16) -> AluOp {
        Self::ALL[(code & 15) as usize]
    }

    pub fn mnemonic(self) -> &'static str {
        match self {
            AluOp::And => "ands",
            AluOp::Eor => "eors",
            AluOp::Lsl => "lsls",
            AluOp::Lsr => "lsrs",
            AluOp::Asr => "asrs",
            AluOp::Adc => "adcs",
            AluOp::Sbc => "sbcs",
            AluOp::Ror => "rors",
            AluOp::Tst => "tst",
            AluOp::Rsb => "rsbs",
            AluOp::Cmp => "cmp",
            AluOp::Cmn => "cmn",
            AluOp::Orr => "orrs",
            AluOp::Mul => "muls",
            AluOp::Bic => "bics",
            AluOp::Mvn => "mvns",
        }
    }
}

/// `nop`
pub const NOP: u16 = 0xBF00;

/// `udf #0xfe`, the first halfword of a VM table marker pair.
pub const VM_MARKER: u16 = 0xDEFE;

// ==================== Shifts and add/subtract ====================

/// LSLS Rd, Rm, #imm5
pub fn lsls_imm(rd: Reg, rm: Reg, imm5: u8) -> u16 {
    ((imm5 as u16 & 31) << 6) | (rm.low() << 3) | rd.low()
}

/// LSRS Rd, Rm, #shift (1-32)
pub fn lsrs_imm(rd: Reg, rm: Reg, shift: u8) -> u16 {
    debug_assert!((1..=32).contains(&shift));
    0x0800 | ((shift as u16 & 31) << 6) | (rm.low() << 3) | rd.low()
}

/// ASRS Rd, Rm, #shift (1-32)
pub fn asrs_imm(rd: Reg, rm: Reg, shift: u8) -> u16 {
    debug_assert!((1..=32).contains(&shift));
    0x1000 | ((shift as u16 & 31) << 6) | (rm.low() << 3) | rd.low()
}

/// ADDS Rd, Rn, Rm
pub fn adds_reg(rd: Reg, rn: Reg, rm: Reg) -> u16 {
    0x1800 | (rm.low() << 6) | (rn.low() << 3) | rd.low()
}

/// SUBS Rd, Rn, Rm
pub fn subs_reg(rd: Reg, rn: Reg, rm: Reg) -> u16 {
    0x1A00 | (rm.low() << 6) | (rn.low() << 3) | rd.low()
}

/// ADDS Rd, Rn, #imm3
pub fn adds_imm3(rd: Reg, rn: Reg, imm3: u8) -> u16 {
    debug_assert!(imm3 < 8);
    0x1C00 | ((imm3 as u16 & 7) << 6) | (rn.low() << 3) | rd.low()
}

/// SUBS Rd, Rn, #imm3
pub fn subs_imm3(rd: Reg, rn: Reg, imm3: u8) -> u16 {
    debug_assert!(imm3 < 8);
    0x1E00 | ((imm3 as u16 & 7) << 6) | (rn.low() << 3) | rd.low()
}

// ==================== 8-bit immediates ====================

/// MOVS Rd, #imm8
pub fn movs_imm(rd: Reg, imm8: u8) -> u16 {
    0x2000 | (rd.low() << 8) | imm8 as u16
}

/// CMP Rn, #imm8
pub fn cmp_imm(rn: Reg, imm8: u8) -> u16 {
    0x2800 | (rn.low() << 8) | imm8 as u16
}

/// ADDS Rdn, #imm8
pub fn adds_imm8(rdn: Reg, imm8: u8) -> u16 {
    0x3000 | (rdn.low() << 8) | imm8 as u16
}

/// SUBS Rdn, #imm8
pub fn subs_imm8(rdn: Reg, imm8: u8) -> u16 {
    0x3800 | (rdn.low() << 8) | imm8 as u16
}

/// Halfwords in a [`mov32_bytewise`] sequence.
pub const MOV32_HALFWORDS: usize = 7;

/// Build any 32-bit value in `rd` a byte at a time, high byte first:
/// `movs`, then three rounds of `lsls #8; adds`. Sets the flags.
pub fn mov32_bytewise(rd: Reg, value: u32) -> [u16; MOV32_HALFWORDS] {
    let [b3, b2, b1, b0] = value.to_be_bytes();
    [
        movs_imm(rd, b3),
        lsls_imm(rd, rd, 8),
        adds_imm8(rd, b2),
        lsls_imm(rd, rd, 8),
        adds_imm8(rd, b1),
        lsls_imm(rd, rd, 8),
        adds_imm8(rd, b0),
    ]
}

// ==================== Data processing ====================

/// Two-register ALU operation: `op Rdn, Rm`.
///
/// For `rsbs` the encoded form is `rsbs Rd, Rm, #0`; for `cmp`, `cmn` and
/// `tst` the first register is only read.
pub fn alu(op: AluOp, rdn: Reg, rm: Reg) -> u16 {
    0x4000 | ((op as u16) << 6) | (rm.low() << 3) | rdn.low()
}

/// MOV Rd, Rm (any registers, flags untouched)
pub fn mov(rd: Reg, rm: Reg) -> u16 {
    let d = rd.code();
    0x4600 | ((d & 8) << 4) | (rm.code() << 3) | (d & 7)
}

/// ADD Rdn, Rm (any registers, flags untouched)
pub fn add_hi(rdn: Reg, rm: Reg) -> u16 {
    let d = rdn.code();
    0x4400 | ((d & 8) << 4) | (rm.code() << 3) | (d & 7)
}

/// BX Rm
pub fn bx(rm: Reg) -> u16 {
    0x4700 | (rm.code() << 3)
}

/// BLX Rm
pub fn blx(rm: Reg) -> u16 {
    0x4780 | (rm.code() << 3)
}

// ==================== Loads and stores ====================

/// LDR Rt, [PC, #imm8*4]
pub fn ldr_literal(rt: Reg, imm8: u8) -> u16 {
    0x4800 | (rt.low() << 8) | imm8 as u16
}

/// STR Rt, [Rn, #imm5*4]
pub fn str_imm(rt: Reg, rn: Reg, imm5: u8) -> u16 {
    0x6000 | ((imm5 as u16 & 31) << 6) | (rn.low() << 3) | rt.low()
}

/// LDR Rt, [Rn, #imm5*4]
pub fn ldr_imm(rt: Reg, rn: Reg, imm5: u8) -> u16 {
    0x6800 | ((imm5 as u16 & 31) << 6) | (rn.low() << 3) | rt.low()
}

/// STR Rt, [SP, #imm8*4]
pub fn str_sp(rt: Reg, imm8: u8) -> u16 {
    0x9000 | (rt.low() << 8) | imm8 as u16
}

/// LDR Rt, [SP, #imm8*4]
pub fn ldr_sp(rt: Reg, imm8: u8) -> u16 {
    0x9800 | (rt.low() << 8) | imm8 as u16
}

/// ADR Rd, #imm8*4 (address generation relative to the aligned PC)
pub fn adr(rd: Reg, imm8: u8) -> u16 {
    0xA000 | (rd.low() << 8) | imm8 as u16
}

/// ADD Rd, SP, #imm8*4
pub fn add_sp_imm(rd: Reg, imm8: u8) -> u16 {
    0xA800 | (rd.low() << 8) | imm8 as u16
}

/// PUSH {reglist[, lr]}
pub fn push(reglist: u8, lr: bool) -> u16 {
    0xB400 | ((lr as u16) << 8) | reglist as u16
}

/// POP {reglist[, pc]}
pub fn pop(reglist: u8, pc: bool) -> u16 {
    0xBC00 | ((pc as u16) << 8) | reglist as u16
}

/// STM Rn!, {reglist}
pub fn stm(rn: Reg, reglist: u8) -> u16 {
    0xC000 | (rn.low() << 8) | reglist as u16
}

/// LDM Rn!, {reglist}
pub fn ldm(rn: Reg, reglist: u8) -> u16 {
    0xC800 | (rn.low() << 8) | reglist as u16
}

// ==================== Branches ====================

/// B<cond> with a raw 8-bit offset field (halfwords, relative to PC+4).
pub fn b_cond(cond: Cond, imm8: u8) -> u16 {
    0xD000 | (cond.code() << 8) | imm8 as u16
}

/// UDF #imm8
pub fn udf(imm8: u8) -> u16 {
    0xDE00 | imm8 as u16
}

/// B with a raw 11-bit offset field (halfwords, relative to PC+4).
pub fn b(imm11: u16) -> u16 {
    0xE000 | (imm11 & 0x7FF)
}

// ==================== Inspectors ====================

/// Conditional branch (`1101 cccc`, excluding the UDF and SVC rows).
pub fn is_cond_branch(hw: u16) -> bool {
    (hw & 0xF000) == 0xD000 && ((hw >> 8) & 0xF) < 0xE
}

pub fn cond_branch_cond(hw: u16) -> Option<Cond> {
    if is_cond_branch(hw) {
        Cond::from_code((hw >> 8) & 0xF)
    } else {
        None
    }
}

pub fn cond_branch_field(hw: u16) -> u8 {
    (hw & 0xFF) as u8
}

pub fn with_cond_branch_field(hw: u16, imm8: u8) -> u16 {
    (hw & 0xFF00) | imm8 as u16
}

/// Unconditional 11-bit branch.
pub fn is_branch(hw: u16) -> bool {
    (hw & 0xF800) == 0xE000
}

pub fn branch_field(hw: u16) -> u16 {
    hw & 0x7FF
}

/// PC-relative literal load.
pub fn is_ldr_literal(hw: u16) -> bool {
    (hw & 0xF800) == 0x4800
}

pub fn ldr_literal_field(hw: u16) -> u8 {
    (hw & 0xFF) as u8
}

pub fn ldr_literal_rt(hw: u16) -> Reg {
    Reg::from_index(((hw >> 8) & 7) as usize)
}

pub fn with_ldr_literal_field(hw: u16, imm8: u8) -> u16 {
    (hw & 0xFF00) | imm8 as u16
}

pub fn is_vm_marker(hw: u16) -> bool {
    hw == VM_MARKER
}

/// Sign-extend the offset field of a conditional branch.
pub fn cond_branch_offset(hw: u16) -> i32 {
    (hw & 0xFF) as u8 as i8 as i32
}

/// Sign-extend the offset field of an unconditional branch.
pub fn branch_offset(hw: u16) -> i32 {
    (((hw & 0x7FF) << 5) as i16 >> 5) as i32
}
