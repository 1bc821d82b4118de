//! Control words for calls into the VM table.
//!
//! Generated code reaches the runtime with `blx r9` followed by one inline
//! halfword. Bits 15..12 select the routine, bits 11..0 carry its operands.
//! The runtime resumes execution after the control word.

use super::thumb::Reg;

/// A decoded VM table request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmCall {
    /// Save the return address from `r0`, reserve `frame` words and move
    /// stack-passed arguments into their homes.
    Enter { args: u8, frame: u8 },
    /// Release the frame and return `returns` values to the caller.
    Leave { returns: u8 },
    /// Call `function` with arguments at `[r0]`, writing results back there.
    Call { function: u16 },
    /// Replace the current frame with a call to `function`.
    TailCall { function: u16 },
    /// `rd = rn / rm`, signed.
    Div { rd: Reg, rn: Reg, rm: Reg },
    /// `rd = rn % rm`, signed.
    Rem { rd: Reg, rn: Reg, rm: Reg },
}

/// Largest argument count `Enter` can describe.
pub const MAX_ARGS: usize = 15;

/// Largest result count `Leave` can describe.
pub const MAX_RETURNS: usize = 0xFF;

/// Largest function index `Call` can describe.
pub const MAX_FUNCTION: usize = 0xFFF;

impl VmCall {
    pub fn encode(self) -> u16 {
        fn regs(rd: Reg, rn: Reg, rm: Reg) -> u16 {
            (rd.code() & 7) << 6 | (rn.code() & 7) << 3 | (rm.code() & 7)
        }
        match self {
            VmCall::Enter { args, frame } => {
                0x1000 | ((args as u16 & 0xF) << 8) | frame as u16
            }
            VmCall::Leave { returns } => 0x2000 | returns as u16,
            VmCall::Call { function } => 0x3000 | (function & 0xFFF),
            VmCall::TailCall { function } => 0x4000 | (function & 0xFFF),
            VmCall::Div { rd, rn, rm } => 0x5000 | regs(rd, rn, rm),
            VmCall::Rem { rd, rn, rm } => 0x6000 | regs(rd, rn, rm),
        }
    }

    pub fn decode(word: u16) -> Option<VmCall> {
        let operand = word & 0xFFF;
        let reg = |shift: u16| Reg::from_index(((operand >> shift) & 7) as usize);
        let call = match word >> 12 {
            1 => VmCall::Enter {
                args: (operand >> 8) as u8,
                frame: operand as u8,
            },
            2 => VmCall::Leave { returns: operand as u8 },
            3 => VmCall::Call { function: operand },
            4 => VmCall::TailCall { function: operand },
            5 => VmCall::Div { rd: reg(6), rn: reg(3), rm: reg(0) },
            6 => VmCall::Rem { rd: reg(6), rn: reg(3), rm: reg(0) },
            _ => return None,
        };
        Some(call)
    }
}

impl std::fmt::Display for VmCall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VmCall::Enter { args, frame } => write!(f, "enter args={} frame={}", args, frame),
            VmCall::Leave { returns } => write!(f, "leave returns={}", returns),
            VmCall::Call { function } => write!(f, "call #{}", function),
            VmCall::TailCall { function } => write!(f, "tailcall #{}", function),
            VmCall::Div { rd, rn, rm } => write!(
                f,
                "div r{}, r{}, r{}",
                rd.code(),
                rn.code(),
                rm.code()
            ),
            VmCall::Rem { rd, rn, rm } => write!(
                f,
                "rem r{}, r{}, r{}",
                rd.code(),
                rn.code(),
                rm.code()
            ),
        }
    }
}
