//! Reference machine for compiled functions.
//!
//! Interprets the Thumb subset the backend emits and plays the runtime
//! behind `blx r9`. Functions are mapped at `CODE_BASE + index * 0x1000`;
//! the stack is a flat array of words ending at the top of the stack
//! region. Used by the test suite and the `run` command.

use crate::jit::CompiledFunction;
use crate::jit::thumb::{self, AluOp, Cond};
use crate::jit::vmcall::VmCall;
use std::fmt;

pub const CODE_BASE: u32 = 0x0800_0000;
const CODE_STRIDE: u32 = 0x1000;
pub const STACK_BASE: u32 = 0x2000_0000;
/// Value of `r9`; `blx` to it enters the runtime.
pub const VM_TABLE: u32 = 0x1000_0001;
/// Return address handed to functions called from the host.
const HOST_RETURN: u32 = 0xFFFF_FFFE;
/// Pattern left in `r0`-`r7` after a call.
const CLOBBER: u32 = 0xBAD0_0000;

pub const DEFAULT_STACK_WORDS: usize = 0x4000;
pub const DEFAULT_STEP_LIMIT: u64 = 50_000_000;
pub const MAX_CALL_DEPTH: usize = 256;

const SP: usize = 13;
const LR: usize = 14;
const PC: usize = 15;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimError {
    Unsupported { address: u32, halfword: u16 },
    MemoryFault { address: u32 },
    StackOverflow,
    DivideByZero { address: u32 },
    UnknownFunction { index: usize },
    ArgumentCount { expected: usize, got: usize },
    /// `Leave` without a matching `Enter`, or with `sp` moved.
    BadFrame { address: u32 },
    CallDepth,
    StepLimit,
}

impl fmt::Display for SimError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SimError::Unsupported { address, halfword } => {
                write!(f, "unsupported instruction {:#06x} at {:#010x}", halfword, address)
            }
            SimError::MemoryFault { address } => write!(f, "memory fault at {:#010x}", address),
            SimError::StackOverflow => write!(f, "stack overflow"),
            SimError::DivideByZero { address } => write!(f, "division by zero at {:#010x}", address),
            SimError::UnknownFunction { index } => write!(f, "no function #{}", index),
            SimError::ArgumentCount { expected, got } => {
                write!(f, "expected {} arguments, got {}", expected, got)
            }
            SimError::BadFrame { address } => write!(f, "unbalanced frame at {:#010x}", address),
            SimError::CallDepth => write!(f, "call depth exceeds {}", MAX_CALL_DEPTH),
            SimError::StepLimit => write!(f, "step limit reached"),
        }
    }
}

impl std::error::Error for SimError {}

#[derive(Debug, Clone, Copy)]
struct Frame {
    return_address: u32,
    entry_sp: u32,
    frame_sp: u32,
    args: usize,
}

#[derive(Debug, Clone, Copy, Default)]
struct Flags {
    n: bool,
    z: bool,
    c: bool,
    v: bool,
}

impl Flags {
    fn holds(self, cond: Cond) -> bool {
        match cond {
            Cond::Eq => self.z,
            Cond::Ne => !self.z,
            Cond::Hs => self.c,
            Cond::Lo => !self.c,
            Cond::Mi => self.n,
            Cond::Pl => !self.n,
            Cond::Vs => self.v,
            Cond::Vc => !self.v,
            Cond::Hi => self.c && !self.z,
            Cond::Ls => !self.c || self.z,
            Cond::Ge => self.n == self.v,
            Cond::Lt => self.n != self.v,
            Cond::Gt => !self.z && self.n == self.v,
            Cond::Le => self.z || self.n != self.v,
        }
    }
}

/// Shift `value` by `amount` the way the register-form shifts do,
/// returning the result and the carry out.
fn shift(op: AluOp, value: u32, amount: u32, carry: bool) -> (u32, bool) {
    if amount == 0 {
        return (value, carry);
    }
    let bit = |n: u32| (value >> n) & 1 != 0;
    match op {
        AluOp::Lsl if amount < 32 => (value << amount, bit(32 - amount)),
        AluOp::Lsl if amount == 32 => (0, bit(0)),
        AluOp::Lsl => (0, false),
        AluOp::Lsr if amount < 32 => (value >> amount, bit(amount - 1)),
        AluOp::Lsr if amount == 32 => (0, bit(31)),
        AluOp::Lsr => (0, false),
        AluOp::Asr if amount < 32 => (((value as i32) >> amount) as u32, bit(amount - 1)),
        AluOp::Asr => (((value as i32) >> 31) as u32, bit(31)),
        _ => {
            let result = value.rotate_right(amount % 32);
            (result, result >> 31 != 0)
        }
    }
}

pub struct Machine<'a> {
    functions: &'a [CompiledFunction],
    regs: [u32; 16],
    flags: Flags,
    pc: u32,
    stack: Vec<u32>,
    frames: Vec<Frame>,
    results: Vec<u32>,
    depth: usize,
    steps: u64,
    step_limit: u64,
}

impl<'a> Machine<'a> {
    pub fn new(functions: &'a [CompiledFunction]) -> Self {
        Self {
            functions,
            regs: [0; 16],
            flags: Flags::default(),
            pc: HOST_RETURN,
            stack: vec![0; DEFAULT_STACK_WORDS],
            frames: Vec::new(),
            results: Vec::new(),
            depth: 0,
            steps: 0,
            step_limit: DEFAULT_STEP_LIMIT,
        }
    }

    pub fn with_stack_words(mut self, words: usize) -> Self {
        self.stack = vec![0; words];
        self
    }

    pub fn with_step_limit(mut self, limit: u64) -> Self {
        self.step_limit = limit;
        self
    }

    /// Instructions executed so far, over all calls.
    pub fn steps(&self) -> u64 {
        self.steps
    }

    /// Call function `index` from the host and return its results.
    pub fn call(&mut self, index: usize, args: &[u32]) -> Result<Vec<u32>, SimError> {
        let function = self.function(index)?;
        if args.len() != function.shape.args {
            return Err(SimError::ArgumentCount { expected: function.shape.args, got: args.len() });
        }
        self.regs = [0; 16];
        self.regs[9] = VM_TABLE;
        self.regs[SP] = self.stack_top();
        self.frames.clear();
        self.depth = 0;
        self.invoke(index, args)
    }

    fn stack_top(&self) -> u32 {
        STACK_BASE + 4 * self.stack.len() as u32
    }

    fn function(&self, index: usize) -> Result<&'a CompiledFunction, SimError> {
        self.functions.get(index).ok_or(SimError::UnknownFunction { index })
    }

    fn fetch(&self, address: u32) -> Result<u16, SimError> {
        let fault = SimError::MemoryFault { address };
        let offset = address.checked_sub(CODE_BASE).ok_or(fault.clone())?;
        let function = self.functions.get((offset / CODE_STRIDE) as usize).ok_or(fault.clone())?;
        let at = (offset % CODE_STRIDE) as usize;
        if at % 2 != 0 {
            return Err(fault);
        }
        function.code.get(at / 2).copied().ok_or(fault)
    }

    fn load(&self, address: u32) -> Result<u32, SimError> {
        if address % 4 != 0 {
            return Err(SimError::MemoryFault { address });
        }
        if address >= STACK_BASE && address < self.stack_top() {
            return Ok(self.stack[((address - STACK_BASE) / 4) as usize]);
        }
        let lo = self.fetch(address)? as u32;
        let hi = self.fetch(address + 2)? as u32;
        Ok(lo | hi << 16)
    }

    fn store(&mut self, address: u32, value: u32) -> Result<(), SimError> {
        if address % 4 != 0 || address < STACK_BASE || address >= self.stack_top() {
            return Err(SimError::MemoryFault { address });
        }
        self.stack[((address - STACK_BASE) / 4) as usize] = value;
        Ok(())
    }

    /// Set up a call to `index` whose stack arguments go right below
    /// `caller_sp`. Returns the entry address.
    fn enter(
        &mut self,
        index: usize,
        args: &[u32],
        caller_sp: u32,
        return_address: u32,
    ) -> Result<u32, SimError> {
        self.function(index)?;
        let extra = args.len().saturating_sub(3) as u32;
        let sp = caller_sp
            .checked_sub(4 * extra)
            .filter(|&sp| sp >= STACK_BASE)
            .ok_or(SimError::StackOverflow)?;
        for (k, &value) in args.iter().enumerate().skip(3) {
            self.store(sp + 4 * (k as u32 - 3), value)?;
        }
        for (k, &value) in args.iter().take(3).enumerate() {
            self.regs[1 + k] = value;
        }
        self.regs[SP] = sp;
        self.regs[LR] = return_address;
        Ok(CODE_BASE + index as u32 * CODE_STRIDE)
    }

    /// Run function `index` to completion on the current stack.
    fn invoke(&mut self, index: usize, args: &[u32]) -> Result<Vec<u32>, SimError> {
        if self.depth == MAX_CALL_DEPTH {
            return Err(SimError::CallDepth);
        }
        let saved_sp = self.regs[SP];
        let saved_pc = self.pc;
        let frames = self.frames.len();

        self.pc = self.enter(index, args, saved_sp, HOST_RETURN | 1)?;
        self.depth += 1;
        while self.pc != HOST_RETURN {
            if let Err(e) = self.step() {
                self.depth -= 1;
                return Err(e);
            }
        }
        self.depth -= 1;

        if self.frames.len() != frames {
            return Err(SimError::BadFrame { address: saved_pc });
        }
        self.regs[SP] = saved_sp;
        self.pc = saved_pc;
        Ok(std::mem::take(&mut self.results))
    }

    fn set_nz(&mut self, result: u32) {
        self.flags.n = result >> 31 != 0;
        self.flags.z = result == 0;
    }

    fn add_with_carry(&mut self, x: u32, y: u32, carry: bool) -> u32 {
        let unsigned = x as u64 + y as u64 + carry as u64;
        let signed = x as i32 as i64 + y as i32 as i64 + carry as i64;
        let result = unsigned as u32;
        self.set_nz(result);
        self.flags.c = result as u64 != unsigned;
        self.flags.v = result as i32 as i64 != signed;
        result
    }

    fn sub_flags(&mut self, x: u32, y: u32) -> u32 {
        self.add_with_carry(x, !y, true)
    }

    fn read(&self, r: usize, at: u32) -> u32 {
        if r == PC { at + 4 } else { self.regs[r] }
    }

    fn step(&mut self) -> Result<(), SimError> {
        self.steps += 1;
        if self.steps > self.step_limit {
            return Err(SimError::StepLimit);
        }
        let at = self.pc;
        let hw = self.fetch(at)?;
        let unsupported = SimError::Unsupported { address: at, halfword: hw };
        let lo = |shift: u16| ((hw >> shift) & 7) as usize;
        let imm5 = ((hw >> 6) & 31) as u32;
        let imm8 = (hw & 0xFF) as u32;
        let literal_base = (at + 4) & !3;
        let mut next = at + 2;

        match hw >> 11 {
            0b00000 | 0b00001 | 0b00010 => {
                let op = match hw >> 11 {
                    0 => AluOp::Lsl,
                    1 => AluOp::Lsr,
                    _ => AluOp::Asr,
                };
                let amount = if imm5 == 0 && op != AluOp::Lsl { 32 } else { imm5 };
                let (result, carry) = shift(op, self.regs[lo(3)], amount, self.flags.c);
                self.flags.c = carry;
                self.set_nz(result);
                self.regs[lo(0)] = result;
            }
            0b00011 => {
                let rn = self.regs[lo(3)];
                let operand = if hw & 0x0400 == 0 { self.regs[lo(6)] } else { ((hw >> 6) & 7) as u32 };
                self.regs[lo(0)] = if hw & 0x0200 == 0 {
                    self.add_with_carry(rn, operand, false)
                } else {
                    self.sub_flags(rn, operand)
                };
            }
            0b00100 => {
                self.set_nz(imm8);
                self.regs[lo(8)] = imm8;
            }
            0b00101 => {
                self.sub_flags(self.regs[lo(8)], imm8);
            }
            0b00110 => self.regs[lo(8)] = self.add_with_carry(self.regs[lo(8)], imm8, false),
            0b00111 => self.regs[lo(8)] = self.sub_flags(self.regs[lo(8)], imm8),
            0b01000 if hw & 0x0400 == 0 => self.data_processing(hw),
            0b01000 => {
                let rd = (((hw >> 4) & 8) | (hw & 7)) as usize;
                let rm = ((hw >> 3) & 15) as usize;
                let value = self.read(rm, at);
                match (hw >> 8) & 3 {
                    0 => {
                        let sum = self.read(rd, at).wrapping_add(value);
                        if rd == PC { next = sum & !1 } else { self.regs[rd] = sum }
                    }
                    1 => {
                        self.sub_flags(self.read(rd, at), value);
                    }
                    2 => {
                        if rd == PC { next = value & !1 } else { self.regs[rd] = value }
                    }
                    _ if hw & 0x80 != 0 && value == VM_TABLE => next = self.vm_call(at)?,
                    _ if hw & 0x80 != 0 => {
                        self.regs[LR] = next | 1;
                        next = value & !1;
                    }
                    _ => next = value & !1,
                }
            }
            0b01001 => self.regs[lo(8)] = self.load(literal_base + imm8 * 4)?,
            0b01100 => self.store(self.regs[lo(3)].wrapping_add(imm5 * 4), self.regs[lo(0)])?,
            0b01101 => self.regs[lo(0)] = self.load(self.regs[lo(3)].wrapping_add(imm5 * 4))?,
            0b10010 => self.store(self.regs[SP].wrapping_add(imm8 * 4), self.regs[lo(8)])?,
            0b10011 => self.regs[lo(8)] = self.load(self.regs[SP].wrapping_add(imm8 * 4))?,
            0b10100 => self.regs[lo(8)] = literal_base + imm8 * 4,
            0b10101 => self.regs[lo(8)] = self.regs[SP].wrapping_add(imm8 * 4),
            0b10110 | 0b10111 => match hw & 0xFF00 {
                _ if hw == thumb::NOP => {}
                0xB400 | 0xB500 => {
                    let count = (hw & 0x1FF).count_ones();
                    let mut address = self.regs[SP].wrapping_sub(4 * count);
                    self.regs[SP] = address;
                    for r in (0..8).filter(|r| hw & (1 << r) != 0) {
                        self.store(address, self.regs[r])?;
                        address += 4;
                    }
                    if hw & 0x100 != 0 {
                        self.store(address, self.regs[LR])?;
                    }
                }
                0xBC00 | 0xBD00 => {
                    let mut address = self.regs[SP];
                    for r in (0..8).filter(|r| hw & (1 << r) != 0) {
                        self.regs[r] = self.load(address)?;
                        address += 4;
                    }
                    if hw & 0x100 != 0 {
                        next = self.load(address)? & !1;
                        address += 4;
                    }
                    self.regs[SP] = address;
                }
                _ => return Err(unsupported),
            },
            0b11000 | 0b11001 => {
                let rn = lo(8);
                let mut address = self.regs[rn];
                let load = hw >> 11 == 0b11001;
                for r in (0..8).filter(|r| hw & (1 << r) != 0) {
                    if load {
                        self.regs[r] = self.load(address)?;
                    } else {
                        self.store(address, self.regs[r])?;
                    }
                    address += 4;
                }
                if !load || hw & (1 << rn) == 0 {
                    self.regs[rn] = address;
                }
            }
            0b11010 | 0b11011 => match thumb::cond_branch_cond(hw) {
                Some(cond) => {
                    if self.flags.holds(cond) {
                        next = (at as i32 + 4 + 2 * thumb::cond_branch_offset(hw)) as u32;
                    }
                }
                None => return Err(unsupported),
            },
            0b11100 => next = (at as i32 + 4 + 2 * thumb::branch_offset(hw)) as u32,
            _ => return Err(unsupported),
        }

        self.pc = next;
        Ok(())
    }

    fn data_processing(&mut self, hw: u16) {
        let op = AluOp::from_code((hw >> 6) & 15);
        let d = (hw & 7) as usize;
        let (a, b) = (self.regs[d], self.regs[((hw >> 3) & 7) as usize]);
        let result = match op {
            AluOp::And => a & b,
            AluOp::Eor => a ^ b,
            AluOp::Orr => a | b,
            AluOp::Bic => a & !b,
            AluOp::Mvn => !b,
            AluOp::Mul => a.wrapping_mul(b),
            AluOp::Lsl | AluOp::Lsr | AluOp::Asr | AluOp::Ror => {
                let (result, carry) = shift(op, a, b & 0xFF, self.flags.c);
                self.flags.c = carry;
                result
            }
            AluOp::Adc => {
                self.regs[d] = self.add_with_carry(a, b, self.flags.c);
                return;
            }
            AluOp::Sbc => {
                self.regs[d] = self.add_with_carry(a, !b, self.flags.c);
                return;
            }
            AluOp::Rsb => {
                self.regs[d] = self.sub_flags(0, b);
                return;
            }
            AluOp::Cmp => {
                self.sub_flags(a, b);
                return;
            }
            AluOp::Cmn => {
                self.add_with_carry(a, b, false);
                return;
            }
            AluOp::Tst => {
                self.set_nz(a & b);
                return;
            }
        };
        self.set_nz(result);
        self.regs[d] = result;
    }

    /// Service the VM table request following `blx r9` at `at` and return
    /// the address to continue at.
    fn vm_call(&mut self, at: u32) -> Result<u32, SimError> {
        let word = self.fetch(at + 2)?;
        let resume = at + 4;
        self.regs[LR] = (at + 2) | 1;
        let call = VmCall::decode(word)
            .ok_or(SimError::Unsupported { address: at + 2, halfword: word })?;

        match call {
            VmCall::Enter { args, frame } => {
                let entry_sp = self.regs[SP];
                let frame_sp = entry_sp
                    .checked_sub(4 * frame as u32)
                    .filter(|&sp| sp >= STACK_BASE)
                    .ok_or(SimError::StackOverflow)?;
                let args = args as usize;
                self.frames.push(Frame { return_address: self.regs[0], entry_sp, frame_sp, args });
                self.regs[SP] = frame_sp;
                for k in 3..args as u32 {
                    let value = self.load(entry_sp + 4 * (k - 3))?;
                    self.store(frame_sp + 4 * k, value)?;
                }
                if args > 8 {
                    for k in 0..3 {
                        self.store(frame_sp + 4 * k as u32, self.regs[1 + k])?;
                    }
                }
                Ok(resume)
            }
            VmCall::Leave { returns } => {
                let frame = self.frames.pop().ok_or(SimError::BadFrame { address: at })?;
                if self.regs[SP] != frame.frame_sp {
                    return Err(SimError::BadFrame { address: at });
                }
                let mut results = Vec::with_capacity(returns as usize);
                for k in 0..returns as u32 {
                    let value = if k < 3 {
                        self.regs[1 + k as usize]
                    } else {
                        self.load(frame.frame_sp + 4 * k)?
                    };
                    results.push(value);
                }
                self.results = results;
                self.regs[SP] = frame.entry_sp;
                Ok(frame.return_address & !1)
            }
            VmCall::Call { function } => {
                let base = self.regs[0];
                let args = self.arguments(function as usize, base)?;
                let results = self.invoke(function as usize, &args)?;
                for (k, &value) in results.iter().enumerate() {
                    self.store(base + 4 * k as u32, value)?;
                }
                for r in 0..8 {
                    self.regs[r] = CLOBBER | r as u32;
                }
                Ok(resume)
            }
            VmCall::TailCall { function } => {
                let args = self.arguments(function as usize, self.regs[0])?;
                let frame = self.frames.pop().ok_or(SimError::BadFrame { address: at })?;
                let caller_sp = frame.entry_sp + 4 * frame.args.saturating_sub(3) as u32;
                for r in 0..8 {
                    self.regs[r] = CLOBBER | r as u32;
                }
                self.enter(function as usize, &args, caller_sp, frame.return_address)
            }
            VmCall::Div { rd, rn, rm } | VmCall::Rem { rd, rn, rm } => {
                let n = self.regs[rn.code() as usize] as i32;
                let m = self.regs[rm.code() as usize] as i32;
                if m == 0 {
                    return Err(SimError::DivideByZero { address: at });
                }
                let value = if matches!(call, VmCall::Div { .. }) {
                    n.wrapping_div(m)
                } else {
                    n.wrapping_rem(m)
                };
                self.regs[rd.code() as usize] = value as u32;
                Ok(resume)
            }
        }
    }

    fn arguments(&self, index: usize, base: u32) -> Result<Vec<u32>, SimError> {
        let count = self.function(index)?.shape.args as u32;
        (0..count).map(|k| self.load(base + 4 * k)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::parse;
    use crate::config::JitConfig;
    use crate::jit::compile_function;

    fn build(src: &str) -> (Vec<CompiledFunction>, crate::bytecode::Module) {
        let module = parse(src).unwrap();
        let compiled = module
            .functions
            .iter()
            .map(|f| compile_function(f, &JitConfig::default()).unwrap())
            .collect();
        (compiled, module)
    }

    fn run(src: &str, name: &str, args: &[u32]) -> Vec<u32> {
        let (compiled, module) = build(src);
        Machine::new(&compiled).call(module.find(name).unwrap(), args).unwrap()
    }

    fn signed(values: &[i32]) -> Vec<u32> {
        values.iter().map(|&v| v as u32).collect()
    }

    #[test]
    fn test_square() {
        let src = ".func square args=1 returns=1\n pull 0\n mul\n";
        assert_eq!(run(src, "square", &[7]), vec![49]);
        assert_eq!(run(src, "square", &[0xFFFF_FFFF]), vec![1]);
    }

    #[test]
    fn test_arithmetic_and_constants() {
        let src = "
            .func mix args=2 returns=1
                pull 0
                imm 1000
                sub
                imm 3
                mul
                imm 0x12345678
                xor
                pull 1
                imm -300
                add
                or
                shove 0
                drop 1
        ";
        for (a, b) in [(5u32, 9u32), (0xFFFF_0000, 300), (1234, 0x8000_0000)] {
            let expected = (a.wrapping_sub(1000).wrapping_mul(3) ^ 0x1234_5678) | b.wrapping_sub(300);
            assert_eq!(run(src, "mix", &[a, b]), vec![expected]);
        }
    }

    #[test]
    fn test_shifts() {
        let src = "
            .func sar4 args=1 returns=1
                imm 4
                sar
            .func shr0 args=1 returns=1
                imm 0
                shr
            .func shl_by args=2 returns=1
                shl
            .func sar_by args=2 returns=1
                sar
        ";
        assert_eq!(run(src, "sar4", &[-64i32 as u32]), signed(&[-4]));
        assert_eq!(run(src, "shr0", &[0x8000_0001]), vec![0x8000_0001]);
        assert_eq!(run(src, "shl_by", &[3, 4]), vec![48]);
        assert_eq!(run(src, "sar_by", &[0x8000_0000, 31]), vec![0xFFFF_FFFF]);
    }

    #[test]
    fn test_unary() {
        let src = "
            .func neg args=1 returns=1
                neg
            .func not args=1 returns=1
                not
        ";
        assert_eq!(run(src, "neg", &[5]), signed(&[-5]));
        assert_eq!(run(src, "not", &[0x0F0F_0F0F]), vec![0xF0F0_F0F0]);
    }

    #[test]
    fn test_division() {
        let src = "
            .func div args=2 returns=1
                div
            .func rem args=2 returns=1
                rem
        ";
        assert_eq!(run(src, "div", &signed(&[-7, 2])), signed(&[-3]));
        assert_eq!(run(src, "rem", &signed(&[-7, 2])), signed(&[-1]));
        assert_eq!(run(src, "div", &signed(&[i32::MIN, -1])), signed(&[i32::MIN]));

        let (compiled, _) = build(src);
        let err = Machine::new(&compiled).call(0, &[1, 0]).unwrap_err();
        assert!(matches!(err, SimError::DivideByZero { .. }));
    }

    #[test]
    fn test_loop() {
        let src = "
            .func sum_to args=1 returns=1
                imm 0
            loop:
                pull 0
                imm 0
                beq done
                pull 1
                pull 0
                add
                shove 1
                pull 0
                imm 1
                sub
                shove 0
                jump loop
            done:
                shove 0
        ";
        assert_eq!(run(src, "sum_to", &[100]), vec![5050]);
        assert_eq!(run(src, "sum_to", &[0]), vec![0]);
    }

    #[test]
    fn test_signed_and_unsigned_compares() {
        let src = "
            .func lt args=2 returns=1
                blt yes
                imm 0
                ret
            yes:
                imm 1
            .func lo args=2 returns=1
                blo yes
                imm 0
                ret
            yes:
                imm 1
        ";
        assert_eq!(run(src, "lt", &signed(&[-1, 1])), vec![1]);
        assert_eq!(run(src, "lo", &signed(&[-1, 1])), vec![0]);
        assert_eq!(run(src, "lo", &[1, 2]), vec![1]);
    }

    #[test]
    fn test_shared_return_paths() {
        let src = "
            .func max args=2 returns=1
                pull 0
                pull 1
                bge first
                shove 0
                ret
            first:
                drop 1
                ret
            .func abs args=1 returns=1
                pull 0
                imm 0
                bge done
                neg
            done:
        ";
        assert_eq!(run(src, "max", &signed(&[3, 9])), vec![9]);
        assert_eq!(run(src, "max", &signed(&[-3, -9])), signed(&[-3]));
        assert_eq!(run(src, "abs", &signed(&[-5])), vec![5]);
        assert_eq!(run(src, "abs", &signed(&[6])), vec![6]);
    }

    const FIB: &str = "
        .func fib args=1 returns=1
            pull 0
            imm 2
            blt base
            pull 0
            imm 1
            sub
            call fib
            pull 0
            imm 2
            sub
            call fib
            add
            shove 0
        base:
    ";

    #[test]
    fn test_recursive_calls() {
        assert_eq!(run(FIB, "fib", &[15]), vec![610]);
    }

    #[test]
    fn test_tail_calls_reuse_the_frame() {
        let src = "
            .func count args=2 returns=1 tailcall
                pull 0
                imm 0
                beq done
                pull 0
                imm 1
                sub
                pull 1
                imm 2
                add
                shove 1
                shove 0
                call count
                ret
            done:
                shove 0
        ";
        // far deeper than MAX_CALL_DEPTH nested calls would allow
        assert_eq!(run(src, "count", &[1000, 0]), vec![2000]);
    }

    #[test]
    fn test_deep_operand_stack() {
        let mut src = String::from(".func deep returns=1\n");
        for i in 1..=12 {
            src.push_str(&format!(" imm {}\n", i));
        }
        for _ in 0..11 {
            src.push_str(" add\n");
        }
        assert_eq!(run(&src, "deep", &[]), vec![78]);
    }

    #[test]
    fn test_stack_arguments() {
        let src = "
            .func weigh5 args=5 returns=1
                pull 4
                imm 16
                mul
                pull 3
                imm 8
                mul
                add
                add
                add
                add
                add
            .func sum10 args=10 returns=1
                add
                add
                add
                add
                add
                add
                add
                add
                add
            .func main returns=1
                imm 1
                imm 2
                imm 3
                imm 4
                imm 5
                call weigh5
                imm 1
                imm 2
                imm 3
                imm 4
                imm 5
                imm 6
                imm 7
                imm 8
                imm 9
                imm 10
                call sum10
                add
        ";
        // weigh5 adds up 1 + 2 + 3 + 4 + 5 + 5*16 + 4*8
        assert_eq!(run(src, "weigh5", &[1, 2, 3, 4, 5]), vec![127]);
        assert_eq!(run(src, "sum10", &[1, 2, 3, 4, 5, 6, 7, 8, 9, 10]), vec![55]);
        assert_eq!(run(src, "main", &[]), vec![182]);
    }

    #[test]
    fn test_multiple_results() {
        let src = "
            .func spread args=1 returns=5
                pull 0
                imm 1
                add
                pull 0
                imm 2
                add
                pull 0
                imm 3
                add
                pull 0
                imm 4
                add
            .func many returns=10
                imm 0
                imm 1
                imm 2
                imm 3
                imm 4
                imm 5
                imm 6
                imm 7
                imm 8
                imm 9
            .func total returns=1
                imm 10
                call spread
                add
                add
                add
                add
        ";
        assert_eq!(run(src, "spread", &[10]), vec![10, 11, 12, 13, 14]);
        assert_eq!(run(src, "many", &[]), (0..10).collect::<Vec<u32>>());
        assert_eq!(run(src, "total", &[]), vec![60]);
    }

    #[test]
    fn test_relaxed_branch_executes() {
        let mut src = String::from(".func far args=1 returns=1\n pull 0\n imm 0\n beq skip\n");
        for _ in 0..150 {
            src.push_str(" imm 3\n add\n");
        }
        src.push_str("skip:\n");
        let (compiled, _) = build(&src);
        assert!(compiled[0].relaxed > 0);
        let mut machine = Machine::new(&compiled);
        assert_eq!(machine.call(0, &[0]).unwrap(), vec![0]);
        assert_eq!(machine.call(0, &[1]).unwrap(), vec![451]);
    }

    #[test]
    fn test_limits_and_errors() {
        let (compiled, _) = build(".func spin\nl:\n jump l\n");
        let err = Machine::new(&compiled).with_step_limit(1000).call(0, &[]).unwrap_err();
        assert_eq!(err, SimError::StepLimit);

        let err = Machine::new(&compiled).call(0, &[1]).unwrap_err();
        assert_eq!(err, SimError::ArgumentCount { expected: 0, got: 1 });
        assert_eq!(Machine::new(&compiled).call(3, &[]).unwrap_err(), SimError::UnknownFunction { index: 3 });

        let (compiled, _) = build(".func down args=1 returns=1\n call down\n");
        let err = Machine::new(&compiled).call(0, &[1]).unwrap_err();
        assert_eq!(err, SimError::CallDepth);

        let (compiled, _) = build(FIB);
        let err = Machine::new(&compiled).with_stack_words(8).call(0, &[10]).unwrap_err();
        assert_eq!(err, SimError::StackOverflow);
    }
}
