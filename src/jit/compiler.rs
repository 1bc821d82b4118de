//! Compiler driver: bytecode in, Thumb out.
//!
//! Walks one function's instructions in order and maps each onto register
//! allocator and assembler operations. Generated functions follow a fixed
//! contract with the runtime:
//!
//! - on entry `lr` holds the return address and `r9` the VM table
//! - arguments 0-2 arrive in `r1`-`r3`, the rest on the caller's stack
//! - the prologue is `mov r0, lr` plus an `Enter` VM table call
//! - the epilogue is a `Leave` VM table call with results 0-2 in `r1`-`r3`
//!   and the rest in their stack homes

use super::JitError;
use super::assembler::{Assembled, Assembler, Label, MAX_HALFWORDS, MAX_LABELS};
use super::regalloc::{AllocState, RegisterAllocator};
use super::thumb::{self, AluOp, Cond, Reg};
use super::vmcall::{self, VmCall};
use crate::bytecode::{BinaryOp, BytecodeReader, Compare, Function, FunctionShape, Insn, UnaryOp};
use crate::config::JitConfig;
use serde::Serialize;

/// Largest frame addressable with `ldr rt, [sp, #imm8*4]`.
pub const MAX_FRAME: usize = 0xFF;

/// A finished function, detached from its build buffer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompiledFunction {
    pub name: String,
    pub shape: FunctionShape,
    /// Code, padding and literal pool.
    pub code: Vec<u16>,
    /// Halfwords of code before the padding and pool.
    pub code_len: usize,
    pub literals: usize,
    pub relaxed: usize,
}

impl CompiledFunction {
    /// Size in bytes.
    pub fn size(&self) -> usize {
        self.code.len() * 2
    }
}

fn branch_cond(cond: Compare) -> Cond {
    match cond {
        Compare::Eq => Cond::Eq,
        Compare::Ne => Cond::Ne,
        Compare::Lt => Cond::Lt,
        Compare::Le => Cond::Le,
        Compare::Gt => Cond::Gt,
        Compare::Ge => Cond::Ge,
        Compare::Lo => Cond::Lo,
        Compare::Ls => Cond::Ls,
        Compare::Hi => Cond::Hi,
        Compare::Hs => Cond::Hs,
    }
}

fn frame_words(shape: &FunctionShape) -> Result<usize, JitError> {
    if shape.args > vmcall::MAX_ARGS {
        return Err(JitError::TooManyArguments { count: shape.args });
    }
    if shape.returns > vmcall::MAX_RETURNS {
        return Err(JitError::TooManyReturns { count: shape.returns });
    }
    // one label is reserved for the epilogue
    if shape.labels >= MAX_LABELS {
        return Err(JitError::TooManyLabels { count: shape.labels });
    }
    let frame = shape.max_depth.max(shape.args);
    if frame > MAX_FRAME {
        return Err(JitError::FrameTooLarge { words: frame });
    }
    Ok(frame)
}

struct FunctionCompiler<'a, 'r, R: BytecodeReader> {
    asm: Assembler<'a>,
    alloc: RegisterAllocator,
    reader: &'r mut R,
    shape: FunctionShape,
    /// Allocator state every branch to a label must establish.
    label_states: Vec<Option<AllocState>>,
    next_label: usize,
    epilogue: Label,
    reachable: bool,
    /// A return was marshalled but its branch to the epilogue not emitted.
    pending_return: bool,
    /// Labels seen while a return is pending.
    pending_labels: Vec<usize>,
    peeked: Option<Insn>,
    trace: bool,
}

impl<'a, 'r, R: BytecodeReader> FunctionCompiler<'a, 'r, R> {
    fn new(reader: &'r mut R, buf: &'a mut [u16], trace: bool) -> Self {
        let shape = *reader.shape();
        Self {
            asm: Assembler::new(buf, shape.labels + 1),
            alloc: RegisterAllocator::new(shape.args),
            reader,
            shape,
            label_states: vec![None; shape.labels],
            next_label: 0,
            epilogue: Label::new(shape.labels),
            reachable: true,
            pending_return: false,
            pending_labels: Vec::new(),
            peeked: None,
            trace,
        }
    }

    fn next(&mut self) -> Option<Insn> {
        self.peeked.take().or_else(|| self.reader.next_insn())
    }

    fn peek(&mut self) -> Option<Insn> {
        if self.peeked.is_none() {
            self.peeked = self.reader.next_insn();
        }
        self.peeked
    }

    fn prologue(&mut self, frame: usize) {
        self.asm.emit(thumb::mov(Reg::R0, Reg::Lr));
        let enter = VmCall::Enter { args: self.shape.args as u8, frame: frame as u8 };
        self.asm.vm_tab(enter.encode());
    }

    fn epilogue(&mut self) -> Result<(), JitError> {
        if !self.pending_labels.is_empty() {
            // trailing labels fall off the end into an implicit return
            self.compile_insn(Insn::Return)?;
        }
        if self.reachable {
            self.ret();
        }
        self.pending_return = false;
        self.asm.pin(self.epilogue);
        let leave = VmCall::Leave { returns: self.shape.returns as u8 };
        self.asm.vm_tab(leave.encode());
        Ok(())
    }

    /// Establish the state recorded for `label`, or record the current one.
    fn sync_to(&mut self, label: usize) {
        match self.label_states[label] {
            Some(state) => self.alloc.apply_state(&mut self.asm, state),
            None => self.label_states[label] = Some(self.alloc.get_state()),
        }
    }

    fn join_label(&mut self, label: usize) {
        if self.reachable {
            self.alloc.flush_deferred(&mut self.asm);
            self.sync_to(label);
        } else {
            let state = match self.label_states[label] {
                Some(state) => state,
                None => {
                    let state = AllocState::spilled(self.alloc.depth());
                    self.label_states[label] = Some(state);
                    state
                }
            };
            self.alloc.assume_state(state);
        }
        self.asm.pin(Label::new(label));
        self.reachable = true;
    }

    fn take_label(&mut self) -> usize {
        let label = self.next_label;
        self.next_label += 1;
        label
    }

    /// Emit the branch owed by a pending return and place the labels that
    /// were waiting behind it.
    fn flush_pending_return(&mut self) {
        self.asm.b(self.epilogue);
        self.pending_return = false;
        for label in std::mem::take(&mut self.pending_labels) {
            self.join_label(label);
        }
    }

    /// Whether the waiting labels can be placed on the pending epilogue
    /// branch itself, because every path into them already returns.
    fn labels_share_return(&mut self) -> bool {
        let Some(shape) = AllocState::returning(self.shape.returns) else {
            return false;
        };
        let shares = self
            .pending_labels
            .iter()
            .all(|&l| self.label_states[l].is_none_or(|state| state == shape));
        if shares {
            for label in std::mem::take(&mut self.pending_labels) {
                self.label_states[label] = Some(shape);
                self.asm.pin(Label::new(label));
            }
        }
        shares
    }

    fn compile_insn(&mut self, insn: Insn) -> Result<(), JitError> {
        if self.trace {
            eprintln!("[JIT]   {:>4}: {}", self.asm.offset(), insn);
        }
        if self.pending_return {
            match insn {
                Insn::Return if self.pending_labels.is_empty() => return Ok(()),
                Insn::Label => {
                    let label = self.take_label();
                    self.pending_labels.push(label);
                    return Ok(());
                }
                Insn::Return if self.labels_share_return() => return Ok(()),
                _ => self.flush_pending_return(),
            }
        }

        match insn {
            Insn::Immediate(value) => self.alloc.push_immediate(&mut self.asm, value),
            Insn::Binary(op) => self.binary(op),
            Insn::Unary(op) => self.unary(op),
            Insn::CompareBranch { cond, label } => self.compare_branch(cond, label),
            Insn::Jump(label) => {
                self.alloc.flush_deferred(&mut self.asm);
                self.sync_to(label);
                self.asm.b(Label::new(label));
                self.reachable = false;
            }
            Insn::Label => {
                let label = self.take_label();
                self.join_label(label);
            }
            Insn::Pull(slot) => self.alloc.pull(&mut self.asm, slot),
            Insn::Shove(slot) => self.alloc.shove(&mut self.asm, slot),
            Insn::Drop(n) => self.alloc.drop(&mut self.asm, n),
            Insn::Call { function, args, returns } => self.call(function, args, returns)?,
            Insn::Return => self.ret(),
        }
        Ok(())
    }

    fn ret(&mut self) {
        self.alloc.marshal_returns(&mut self.asm);
        self.pending_return = true;
        self.reachable = false;
    }

    fn binary(&mut self, op: BinaryOp) {
        let imm = self.alloc.top_immediate();
        match (op, imm) {
            (BinaryOp::Add | BinaryOp::Sub, Some(v)) if (-0xFF..=0xFF).contains(&v) => {
                self.add_immediate(op, v)
            }
            (BinaryOp::Shl | BinaryOp::Shr | BinaryOp::Sar, Some(v)) if (0..32).contains(&v) => {
                self.shift_immediate(op, v as u8)
            }
            (BinaryOp::Div | BinaryOp::Rem, _) => {
                let rm = self.alloc.consume(&mut self.asm);
                let rn = self.alloc.consume(&mut self.asm);
                let rd = self.alloc.acquire(&mut self.asm);
                let call = if op == BinaryOp::Div {
                    VmCall::Div { rd, rn, rm }
                } else {
                    VmCall::Rem { rd, rn, rm }
                };
                self.asm.vm_tab(call.encode());
            }
            _ => {
                let rhs = self.alloc.consume(&mut self.asm);
                let lhs = self.alloc.consume(&mut self.asm);
                let dst = self.alloc.acquire(&mut self.asm);
                match op {
                    BinaryOp::Add => self.asm.emit(thumb::adds_reg(dst, lhs, rhs)),
                    BinaryOp::Sub => self.asm.emit(thumb::subs_reg(dst, lhs, rhs)),
                    BinaryOp::Mul => self.commutative(AluOp::Mul, dst, lhs, rhs),
                    BinaryOp::And => self.commutative(AluOp::And, dst, lhs, rhs),
                    BinaryOp::Or => self.commutative(AluOp::Orr, dst, lhs, rhs),
                    BinaryOp::Xor => self.commutative(AluOp::Eor, dst, lhs, rhs),
                    BinaryOp::Shl => self.shift(AluOp::Lsl, dst, lhs, rhs),
                    BinaryOp::Shr => self.shift(AluOp::Lsr, dst, lhs, rhs),
                    BinaryOp::Sar => self.shift(AluOp::Asr, dst, lhs, rhs),
                    BinaryOp::Div | BinaryOp::Rem => unreachable!(),
                }
            }
        }
    }

    fn add_immediate(&mut self, op: BinaryOp, value: i32) {
        self.alloc.drop(&mut self.asm, 1);
        let lhs = self.alloc.consume(&mut self.asm);
        let dst = self.alloc.acquire(&mut self.asm);
        let add = (op == BinaryOp::Add) == (value >= 0);
        let n = value.unsigned_abs() as u8;
        if n < 8 {
            let hw = if add {
                thumb::adds_imm3(dst, lhs, n)
            } else {
                thumb::subs_imm3(dst, lhs, n)
            };
            self.asm.emit(hw);
        } else {
            if dst != lhs {
                self.asm.emit(thumb::mov(dst, lhs));
            }
            let hw = if add { thumb::adds_imm8(dst, n) } else { thumb::subs_imm8(dst, n) };
            self.asm.emit(hw);
        }
    }

    fn shift_immediate(&mut self, op: BinaryOp, shift: u8) {
        self.alloc.drop(&mut self.asm, 1);
        let lhs = self.alloc.consume(&mut self.asm);
        let dst = self.alloc.acquire(&mut self.asm);
        // a right shift field of 0 means 32, so shifting by 0 is a plain lsls
        let hw = match op {
            _ if shift == 0 => thumb::lsls_imm(dst, lhs, 0),
            BinaryOp::Shl => thumb::lsls_imm(dst, lhs, shift),
            BinaryOp::Shr => thumb::lsrs_imm(dst, lhs, shift),
            _ => thumb::asrs_imm(dst, lhs, shift),
        };
        self.asm.emit(hw);
    }

    fn commutative(&mut self, op: AluOp, dst: Reg, lhs: Reg, rhs: Reg) {
        if dst == lhs {
            self.asm.emit(thumb::alu(op, dst, rhs));
        } else if dst == rhs {
            self.asm.emit(thumb::alu(op, dst, lhs));
        } else {
            self.asm.emit(thumb::mov(dst, lhs));
            self.asm.emit(thumb::alu(op, dst, rhs));
        }
    }

    fn shift(&mut self, op: AluOp, dst: Reg, lhs: Reg, rhs: Reg) {
        if dst != lhs {
            assert_ne!(dst, rhs, "shift amount lives in the destination register");
            self.asm.emit(thumb::mov(dst, lhs));
        }
        self.asm.emit(thumb::alu(op, dst, rhs));
    }

    fn unary(&mut self, op: UnaryOp) {
        if let Some(value) = self.alloc.top_immediate() {
            self.alloc.drop(&mut self.asm, 1);
            let folded = match op {
                UnaryOp::Neg => value.wrapping_neg(),
                UnaryOp::Not => !value,
            };
            self.alloc.push_immediate(&mut self.asm, folded);
            return;
        }
        let r = self.alloc.replace(&mut self.asm);
        let alu = match op {
            UnaryOp::Neg => AluOp::Rsb,
            UnaryOp::Not => AluOp::Mvn,
        };
        self.asm.emit(thumb::alu(alu, r, r));
    }

    fn compare_branch(&mut self, cond: Compare, label: usize) {
        match self.alloc.top_immediate().filter(|v| (0..=0xFF).contains(v)) {
            Some(value) => {
                self.alloc.drop(&mut self.asm, 1);
                let lhs = self.alloc.consume(&mut self.asm);
                self.alloc.flush_deferred(&mut self.asm);
                self.asm.emit(thumb::cmp_imm(lhs, value as u8));
            }
            None => {
                let rhs = self.alloc.consume(&mut self.asm);
                let lhs = self.alloc.consume(&mut self.asm);
                self.alloc.flush_deferred(&mut self.asm);
                self.asm.emit(thumb::alu(AluOp::Cmp, lhs, rhs));
            }
        }
        // only loads and stores from here on, so the flags survive
        self.sync_to(label);
        self.asm.b_cond(branch_cond(cond), Label::new(label));
    }

    fn call(&mut self, function: usize, args: usize, returns: usize) -> Result<(), JitError> {
        if function > vmcall::MAX_FUNCTION {
            return Err(JitError::FunctionOutOfRange { index: function });
        }
        let base = self.alloc.depth() - args;
        let tail = self.shape.tail_call
            && base == 0
            && returns == self.shape.returns
            && self.peek() == Some(Insn::Return);

        self.alloc.spill_all(&mut self.asm);
        self.asm.emit(thumb::add_sp_imm(Reg::R0, base as u8));
        let function = function as u16;
        if tail {
            self.next();
            self.asm.vm_tab(VmCall::TailCall { function }.encode());
        } else {
            self.asm.vm_tab(VmCall::Call { function }.encode());
        }
        self.alloc.drop(&mut self.asm, args);
        for _ in 0..returns {
            self.alloc.acquire_spilled(&mut self.asm);
        }
        if tail {
            self.reachable = false;
        }
        Ok(())
    }
}

/// Compile the function produced by `reader` into `buf`.
///
/// At most `config.capacity` halfwords of `buf` are used.
pub fn compile<R: BytecodeReader>(
    reader: &mut R,
    buf: &mut [u16],
    config: &JitConfig,
) -> Result<Assembled, JitError> {
    let shape = *reader.shape();
    let frame = frame_words(&shape)?;
    if config.trace_jit {
        eprintln!(
            "[JIT] Compiling: {} args, {} returns, {} labels, frame {} words",
            shape.args, shape.returns, shape.labels, frame
        );
    }

    let capacity = config.capacity.min(buf.len());
    let mut compiler = FunctionCompiler::new(reader, &mut buf[..capacity], config.trace_jit);
    compiler.prologue(frame);
    while let Some(insn) = compiler.next() {
        compiler.compile_insn(insn)?;
    }
    compiler.epilogue()?;
    let assembled = compiler.asm.assemble()?;

    if config.trace_jit {
        eprintln!(
            "[JIT] Assembled {} halfwords ({} code, {} literals, {} relaxed branches)",
            assembled.len, assembled.code_len, assembled.literals, assembled.relaxed
        );
    }
    Ok(assembled)
}

/// Compile a parsed function into its own buffer.
pub fn compile_function(function: &Function, config: &JitConfig) -> Result<CompiledFunction, JitError> {
    let mut buf = vec![0u16; config.capacity.min(MAX_HALFWORDS)];
    let assembled = compile(&mut function.reader(), &mut buf, config)?;
    buf.truncate(assembled.len);
    let compiled = CompiledFunction {
        name: function.name.clone(),
        shape: function.shape,
        code: buf,
        code_len: assembled.code_len,
        literals: assembled.literals,
        relaxed: assembled.relaxed,
    };
    if config.trace_jit {
        eprintln!("[JIT] Compiled function '{}' ({} bytes)", compiled.name, compiled.size());
    }
    Ok(compiled)
}
