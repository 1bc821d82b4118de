//! Disassembler for the Thumb subset the backend emits.
//!
//! Used by tests to compare generated code against expected mnemonics and by
//! the CLI to print listings. The halfword after a VM table call is shown as
//! its decoded control word.

use super::thumb::{self, AluOp};
use super::vmcall::VmCall;

fn reg_name(r: u16) -> String {
    match r {
        13 => "sp".to_string(),
        14 => "lr".to_string(),
        15 => "pc".to_string(),
        _ => format!("r{}", r),
    }
}

fn low(hw: u16, shift: u16) -> String {
    format!("r{}", (hw >> shift) & 7)
}

fn reglist(list: u16, extra: Option<&str>) -> String {
    let mut names: Vec<String> = (0..8)
        .filter(|i| list & (1 << i) != 0)
        .map(|i| format!("r{}", i))
        .collect();
    if let Some(extra) = extra {
        names.push(extra.to_string());
    }
    format!("{{{}}}", names.join(", "))
}

/// Render one instruction located at halfword offset `at`.
pub fn decode(hw: u16, at: usize) -> String {
    let imm8 = hw & 0xFF;
    let imm5 = (hw >> 6) & 31;
    match hw >> 11 {
        0b00000 => format!("lsls {}, {}, #{}", low(hw, 0), low(hw, 3), imm5),
        0b00001 => format!("lsrs {}, {}, #{}", low(hw, 0), low(hw, 3), if imm5 == 0 { 32 } else { imm5 }),
        0b00010 => format!("asrs {}, {}, #{}", low(hw, 0), low(hw, 3), if imm5 == 0 { 32 } else { imm5 }),
        0b00011 => {
            let name = if hw & 0x0200 == 0 { "adds" } else { "subs" };
            if hw & 0x0400 == 0 {
                format!("{} {}, {}, {}", name, low(hw, 0), low(hw, 3), low(hw, 6))
            } else {
                format!("{} {}, {}, #{}", name, low(hw, 0), low(hw, 3), (hw >> 6) & 7)
            }
        }
        0b00100 => format!("movs {}, #{}", low(hw, 8), imm8),
        0b00101 => format!("cmp {}, #{}", low(hw, 8), imm8),
        0b00110 => format!("adds {}, #{}", low(hw, 8), imm8),
        0b00111 => format!("subs {}, #{}", low(hw, 8), imm8),
        0b01000 => decode_data(hw),
        0b01001 => format!("ldr {}, [pc, #{}]", low(hw, 8), imm8 * 4),
        0b01100 => format!("str {}, [{}, #{}]", low(hw, 0), low(hw, 3), imm5 * 4),
        0b01101 => format!("ldr {}, [{}, #{}]", low(hw, 0), low(hw, 3), imm5 * 4),
        0b10010 => format!("str {}, [sp, #{}]", low(hw, 8), imm8 * 4),
        0b10011 => format!("ldr {}, [sp, #{}]", low(hw, 8), imm8 * 4),
        0b10100 => format!("adr {}, #{}", low(hw, 8), imm8 * 4),
        0b10101 => format!("add {}, sp, #{}", low(hw, 8), imm8 * 4),
        0b10110 | 0b10111 => decode_misc(hw),
        0b11000 => format!("stm {}!, {}", low(hw, 8), reglist(imm8, None)),
        0b11001 => format!("ldm {}!, {}", low(hw, 8), reglist(imm8, None)),
        0b11010 | 0b11011 => match thumb::cond_branch_cond(hw) {
            Some(cond) => {
                let target = at as i32 + 2 + thumb::cond_branch_offset(hw);
                format!("b{} {}", cond.mnemonic(), target)
            }
            None if (hw >> 8) & 0xF == 0xE => format!("udf #{}", imm8),
            None => format!("svc #{}", imm8),
        },
        0b11100 => {
            let target = at as i32 + 2 + thumb::branch_offset(hw);
            format!("b {}", target)
        }
        _ => format!(".hword {:#06x}", hw),
    }
}

fn decode_data(hw: u16) -> String {
    if hw & 0x0400 == 0 {
        let op = AluOp::from_code((hw >> 6) & 15);
        let (rdn, rm) = (low(hw, 0), low(hw, 3));
        return match op {
            AluOp::Rsb => format!("rsbs {}, {}, #0", rdn, rm),
            _ => format!("{} {}, {}", op.mnemonic(), rdn, rm),
        };
    }
    let rd = reg_name(((hw >> 4) & 8) | (hw & 7));
    let rm = reg_name((hw >> 3) & 15);
    match (hw >> 8) & 3 {
        0 => format!("add {}, {}", rd, rm),
        1 => format!("cmp {}, {}", rd, rm),
        2 => format!("mov {}, {}", rd, rm),
        _ if hw & 0x80 == 0 => format!("bx {}", rm),
        _ => format!("blx {}", rm),
    }
}

fn decode_misc(hw: u16) -> String {
    match hw & 0xFF00 {
        0xB400 | 0xB500 => format!("push {}", reglist(hw & 0xFF, (hw & 0x100 != 0).then_some("lr"))),
        0xBC00 | 0xBD00 => format!("pop {}", reglist(hw & 0xFF, (hw & 0x100 != 0).then_some("pc"))),
        0xBF00 if hw == thumb::NOP => "nop".to_string(),
        _ => format!(".hword {:#06x}", hw),
    }
}

fn is_vm_call(hw: u16) -> bool {
    hw == thumb::blx(thumb::Reg::R9) || thumb::is_vm_marker(hw)
}

fn decode_control(word: u16) -> String {
    match VmCall::decode(word) {
        Some(call) => format!(".vm {}", call),
        None => format!(".hword {:#06x}", word),
    }
}

/// Render a run of instructions, one line per halfword.
pub fn disassemble(code: &[u16]) -> Vec<String> {
    let mut lines = Vec::with_capacity(code.len());
    let mut at = 0;
    while at < code.len() {
        let hw = code[at];
        lines.push(decode(hw, at));
        if is_vm_call(hw) && at + 1 < code.len() {
            lines.push(decode_control(code[at + 1]));
            at += 1;
        }
        at += 1;
    }
    lines
}

/// Render a finished function with offsets: `code_len` halfwords of code
/// followed by padding and the literal pool.
pub fn listing(function: &[u16], code_len: usize) -> String {
    let mut out = String::new();
    let code = &function[..code_len.min(function.len())];
    for (i, line) in disassemble(code).into_iter().enumerate() {
        out.push_str(&format!("{:04x}:  {:04x}  {}\n", i * 2, code[i], line));
    }
    let mut at = code_len;
    if at % 2 == 1 && at < function.len() {
        out.push_str(&format!("{:04x}:  {:04x}  {}\n", at * 2, function[at], decode(function[at], at)));
        at += 1;
    }
    while at + 1 < function.len() {
        let word = function[at] as u32 | (function[at + 1] as u32) << 16;
        out.push_str(&format!("{:04x}:  {:08x}  .word {:#x}\n", at * 2, word, word));
        at += 2;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jit::thumb::{Cond, Reg};

    #[test]
    fn test_decode_common_forms() {
        assert_eq!(decode(thumb::movs_imm(Reg::R1, 5), 0), "movs r1, #5");
        assert_eq!(decode(thumb::adds_reg(Reg::R1, Reg::R2, Reg::R3), 0), "adds r1, r2, r3");
        assert_eq!(decode(thumb::subs_imm3(Reg::R1, Reg::R2, 4), 0), "subs r1, r2, #4");
        assert_eq!(decode(thumb::alu(AluOp::Mul, Reg::R1, Reg::R1), 0), "muls r1, r1");
        assert_eq!(decode(thumb::alu(AluOp::Rsb, Reg::R2, Reg::R2), 0), "rsbs r2, r2, #0");
        assert_eq!(decode(thumb::mov(Reg::R0, Reg::Lr), 0), "mov r0, lr");
        assert_eq!(decode(thumb::blx(Reg::R9), 0), "blx r9");
        assert_eq!(decode(thumb::ldr_sp(Reg::R1, 1), 0), "ldr r1, [sp, #4]");
        assert_eq!(decode(thumb::add_sp_imm(Reg::R0, 2), 0), "add r0, sp, #8");
        assert_eq!(decode(thumb::lsrs_imm(Reg::R1, Reg::R1, 32), 0), "lsrs r1, r1, #32");
        assert_eq!(decode(thumb::push(0b0011_0000, true), 0), "push {r4, r5, lr}");
        assert_eq!(decode(thumb::ldm(Reg::R0, 0b110), 0), "ldm r0!, {r1, r2}");
        assert_eq!(decode(thumb::NOP, 0), "nop");
        assert_eq!(decode(thumb::VM_MARKER, 0), "udf #254");
    }

    #[test]
    fn test_branch_targets() {
        assert_eq!(decode(thumb::b_cond(Cond::Ne, 0xFE), 10), "bne 10");
        assert_eq!(decode(thumb::b_cond(Cond::Ge, 3), 10), "bge 15");
        assert_eq!(decode(thumb::b(0x7FF), 4), "b 5");
    }

    #[test]
    fn test_vm_payload() {
        let code = [0x4670, 0x47C8, 0x1102, 0x47C8, 0x2001];
        assert_eq!(
            disassemble(&code),
            vec!["mov r0, lr", "blx r9", ".vm enter args=1 frame=2", "blx r9", ".vm leave returns=1"]
        );
    }

    #[test]
    fn test_listing_shows_pool() {
        let function = [thumb::ldr_literal(Reg::R1, 0), thumb::NOP, 0x5678, 0x1234];
        let text = listing(&function, 1);
        assert!(text.contains("0000:  4900  ldr r1, [pc, #0]"));
        assert!(text.contains("0002:  bf00  nop"));
        assert!(text.contains(".word 0x12345678"));
    }
}
