//! Planning and emission of 32-bit constant loads.
//!
//! ARMv6-M has no wide move, so every constant is either built from an
//! 8-bit `movs` with some follow-up arithmetic or loaded from the literal
//! pool. [`plan`] picks the cheapest recipe; [`load_immediate`] emits it.

use super::assembler::Assembler;
use super::thumb::{self, AluOp, Reg};

/// Recipe for putting a constant into a register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImmPlan {
    /// `movs rd, #v`
    Mov(u8),
    /// `movs rd, #v; mvns rd, rd`
    Mvn(u8),
    /// `movs rd, #base; adds rd, #add`
    MovAdd { base: u8, add: u8 },
    /// `movs rd, #base; lsls rd, rd, #shift` followed by an
    /// `adds`/`subs` of `adjust` when it is non-zero.
    Shifted { base: u8, shift: u8, adjust: i16 },
    /// `ldr rd, [pc, #literal]`
    Literal(u32),
}

impl ImmPlan {
    /// Size in halfwords, counting pool space for literal loads.
    pub fn cost(&self) -> usize {
        match self {
            ImmPlan::Mov(_) => 1,
            ImmPlan::Mvn(_) | ImmPlan::MovAdd { .. } => 2,
            ImmPlan::Shifted { adjust: 0, .. } => 2,
            ImmPlan::Shifted { .. } => 3,
            ImmPlan::Literal(_) => 3,
        }
    }
}

/// Choose the cheapest way to materialize `value`.
///
/// Synthesis wins ties against the literal pool: it keeps the pool small
/// and never fails on pool reach.
pub fn plan(value: u32) -> ImmPlan {
    if value <= 0xFF {
        return ImmPlan::Mov(value as u8);
    }
    if !value <= 0xFF {
        return ImmPlan::Mvn(!value as u8);
    }
    if value <= 0xFF + 0xFF {
        return ImmPlan::MovAdd { base: 0xFF, add: (value - 0xFF) as u8 };
    }

    let trailing = value.trailing_zeros();
    if (value >> trailing) <= 0xFF {
        return ImmPlan::Shifted {
            base: (value >> trailing) as u8,
            shift: trailing as u8,
            adjust: 0,
        };
    }

    for shift in 1..32u32 {
        let floor = value >> shift;
        for base in [floor, floor + 1] {
            if base == 0 || base > 0xFF {
                continue;
            }
            let shifted = ((base as u64) << shift) & 0xFFFF_FFFF;
            let adjust = value as i64 - shifted as i64;
            if (-0xFF..=0xFF).contains(&adjust) {
                return ImmPlan::Shifted {
                    base: base as u8,
                    shift: shift as u8,
                    adjust: adjust as i16,
                };
            }
        }
    }

    ImmPlan::Literal(value)
}

/// Emit instructions leaving `value` in `rd`. Clobbers the flags.
pub fn load_immediate(asm: &mut Assembler, rd: Reg, value: u32) {
    match plan(value) {
        ImmPlan::Mov(v) => asm.emit(thumb::movs_imm(rd, v)),
        ImmPlan::Mvn(v) => {
            asm.emit(thumb::movs_imm(rd, v));
            asm.emit(thumb::alu(AluOp::Mvn, rd, rd));
        }
        ImmPlan::MovAdd { base, add } => {
            asm.emit(thumb::movs_imm(rd, base));
            asm.emit(thumb::adds_imm8(rd, add));
        }
        ImmPlan::Shifted { base, shift, adjust } => {
            asm.emit(thumb::movs_imm(rd, base));
            asm.emit(thumb::lsls_imm(rd, rd, shift));
            if adjust > 0 {
                asm.emit(thumb::adds_imm8(rd, adjust as u8));
            } else if adjust < 0 {
                asm.emit(thumb::subs_imm8(rd, (-adjust) as u8));
            }
        }
        ImmPlan::Literal(v) => {
            let literal = asm.literal(v);
            asm.ldr_literal(rd, literal);
        }
    }
}
