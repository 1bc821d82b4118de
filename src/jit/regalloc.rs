//! Register window allocator for the bytecode operand stack.
//!
//! Operand stack slot `d` is cached in register `r{(d + 1) % 8}`. Only the
//! eight most recent slots (the window) can live in registers; every slot
//! below the window is up to date in its home `[sp, #4*d]`.
//!
//! Values pushed by `pull` and immediates are kept deferred as `Copy` and
//! `Immediate` placements and only turned into instructions when something
//! needs them in a register.

use super::assembler::Assembler;
use super::immediate::load_immediate;
use super::thumb::{self, Reg};

/// Registers in the window.
pub const WINDOW: usize = 8;

/// Arguments and results passed in `r1`-`r3`.
pub const REG_ARGS: usize = 3;

/// Where the value of one window slot currently lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// No slot this deep.
    Empty,
    /// Only in the home location.
    Unloaded,
    /// In the register and the home location.
    Clean,
    /// In the register only.
    Dirty,
    /// Same value as the given slot, not yet copied.
    Copy(usize),
    /// The given constant, not yet materialized.
    Immediate(i32),
}

impl Placement {
    fn is_resident(self) -> bool {
        matches!(self, Placement::Clean | Placement::Dirty)
    }

    fn is_deferred(self) -> bool {
        matches!(self, Placement::Copy(_) | Placement::Immediate(_))
    }
}

/// Register residency of the window, two bits per register, plus the
/// stack depth. Branches record it at labels so that every path into a
/// label agrees on which slots are in registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocState {
    cells: u16,
    depth: usize,
}

impl AllocState {
    const EMPTY: u16 = 0;
    const UNLOADED: u16 = 1;
    const CLEAN: u16 = 2;
    const DIRTY: u16 = 3;

    fn get(self, cell: usize) -> u16 {
        (self.cells >> (2 * cell)) & 3
    }

    fn with(self, cell: usize, bits: u16) -> Self {
        let cells = (self.cells & !(3 << (2 * cell))) | (bits << (2 * cell));
        Self { cells, depth: self.depth }
    }

    fn placement(self, cell: usize) -> Placement {
        match self.get(cell) {
            Self::EMPTY => Placement::Empty,
            Self::UNLOADED => Placement::Unloaded,
            Self::CLEAN => Placement::Clean,
            _ => Placement::Dirty,
        }
    }

    pub fn depth(self) -> usize {
        self.depth
    }

    /// Every slot of the window in memory only.
    pub fn spilled(depth: usize) -> Self {
        let mut state = Self { cells: 0, depth };
        for slot in window(depth) {
            state = state.with(cell(slot), Self::UNLOADED);
        }
        state
    }

    /// The state `marshal_returns` leaves behind for `returns` results:
    /// the first three in `r1`-`r3`, the rest in their homes.
    pub fn returning(returns: usize) -> Option<Self> {
        if returns > WINDOW {
            return None;
        }
        let mut state = Self { cells: 0, depth: returns };
        for slot in 0..returns {
            let bits = if slot < REG_ARGS { Self::DIRTY } else { Self::UNLOADED };
            state = state.with(cell(slot), bits);
        }
        Some(state)
    }

    pub fn is_return_shape(self, returns: usize) -> bool {
        Self::returning(returns) == Some(self)
    }
}

fn cell(slot: usize) -> usize {
    (slot + 1) % WINDOW
}

fn reg(slot: usize) -> Reg {
    Reg::from_index(cell(slot))
}

/// Home offset of `slot` in words from `sp`.
fn home(slot: usize) -> u8 {
    debug_assert!(slot <= 0xFF, "slot {} has no addressable home", slot);
    slot as u8
}

fn window(depth: usize) -> std::ops::Range<usize> {
    depth.saturating_sub(WINDOW)..depth
}

pub struct RegisterAllocator {
    cells: [Placement; WINDOW],
    depth: usize,
    max_depth: usize,
}

impl RegisterAllocator {
    /// Allocator on function entry: arguments 0-2 in `r1`-`r3`, the rest
    /// already stored in their homes.
    pub fn new(args: usize) -> Self {
        let mut cells = [Placement::Empty; WINDOW];
        for slot in window(args) {
            cells[cell(slot)] = if slot < REG_ARGS {
                Placement::Dirty
            } else {
                Placement::Unloaded
            };
        }
        Self { cells, depth: args, max_depth: args }
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    /// Placement of `slot`; slots below the window report `Unloaded`.
    pub fn placement(&self, slot: usize) -> Placement {
        if slot >= self.depth {
            Placement::Empty
        } else if slot + WINDOW >= self.depth {
            self.cells[cell(slot)]
        } else {
            Placement::Unloaded
        }
    }

    /// The constant on top of the stack, if it is still deferred.
    pub fn top_immediate(&self) -> Option<i32> {
        match self.depth.checked_sub(1).map(|top| self.cells[cell(top)]) {
            Some(Placement::Immediate(value)) => Some(value),
            _ => None,
        }
    }

    fn set(&mut self, slot: usize, placement: Placement) {
        self.cells[cell(slot)] = placement;
    }

    /// Copy the value of `src` into the register of `dst` without touching
    /// the flags.
    fn copy_into(&self, asm: &mut Assembler, dst: usize, src: usize) {
        match self.placement(src) {
            Placement::Clean | Placement::Dirty => asm.emit(thumb::mov(reg(dst), reg(src))),
            Placement::Unloaded => asm.emit(thumb::ldr_sp(reg(dst), home(src))),
            other => unreachable!("copy source {} is {:?}", src, other),
        }
    }

    /// Give every slot below `floor` that still aliases `src` its own copy.
    fn resolve_copies_of(&mut self, asm: &mut Assembler, src: usize, floor: usize) {
        for slot in window(self.depth) {
            if slot < floor && slot != src && self.placement(slot) == Placement::Copy(src) {
                self.copy_into(asm, slot, src);
                self.set(slot, Placement::Dirty);
            }
        }
    }

    /// Bring the value of `slot` into its own register.
    fn realize(&mut self, asm: &mut Assembler, slot: usize) {
        match self.placement(slot) {
            Placement::Clean | Placement::Dirty => {}
            Placement::Unloaded => {
                asm.emit(thumb::ldr_sp(reg(slot), home(slot)));
                self.set(slot, Placement::Clean);
            }
            Placement::Copy(src) => {
                self.copy_into(asm, slot, src);
                self.set(slot, Placement::Dirty);
            }
            Placement::Immediate(value) => {
                load_immediate(asm, reg(slot), value as u32);
                self.set(slot, Placement::Dirty);
            }
            Placement::Empty => unreachable!("slot {} is empty", slot),
        }
    }

    /// Commit `slot` to its home so its register can be reused.
    fn deactivate(&mut self, asm: &mut Assembler, slot: usize) {
        self.resolve_copies_of(asm, slot, self.depth);
        match self.placement(slot) {
            Placement::Empty | Placement::Unloaded | Placement::Clean => {}
            Placement::Dirty => asm.emit(thumb::str_sp(reg(slot), home(slot))),
            Placement::Copy(src) if self.placement(src).is_resident() => {
                asm.emit(thumb::str_sp(reg(src), home(slot)));
            }
            Placement::Copy(_) | Placement::Immediate(_) => {
                self.realize(asm, slot);
                asm.emit(thumb::str_sp(reg(slot), home(slot)));
            }
        }
        self.set(slot, Placement::Unloaded);
    }

    /// Push a new slot, evicting the slot that shares its register.
    fn open_slot(&mut self, asm: &mut Assembler) -> usize {
        let slot = self.depth;
        if slot >= WINDOW {
            self.deactivate(asm, slot - WINDOW);
        }
        self.depth += 1;
        self.max_depth = self.max_depth.max(self.depth);
        slot
    }

    /// Pop the top slot; its register falls back to the slot eight below.
    fn pop_cell(&mut self) {
        let top = self.depth - 1;
        self.cells[cell(top)] = if top >= WINDOW {
            Placement::Unloaded
        } else {
            Placement::Empty
        };
        self.depth = top;
    }

    /// Push a slot for a value about to be computed and return its register.
    pub fn acquire(&mut self, asm: &mut Assembler) -> Reg {
        let slot = self.open_slot(asm);
        self.set(slot, Placement::Dirty);
        reg(slot)
    }

    /// Push a slot whose value is already in its home (call results).
    pub fn acquire_spilled(&mut self, asm: &mut Assembler) {
        let slot = self.open_slot(asm);
        self.set(slot, Placement::Unloaded);
    }

    pub fn push_immediate(&mut self, asm: &mut Assembler, value: i32) {
        let slot = self.open_slot(asm);
        self.set(slot, Placement::Immediate(value));
    }

    /// Pop the top slot and return a register holding its value.
    ///
    /// The register stays valid until the next push.
    pub fn consume(&mut self, asm: &mut Assembler) -> Reg {
        assert!(self.depth > 0, "consume on an empty operand stack");
        let top = self.depth - 1;
        self.resolve_copies_of(asm, top, top);
        let result = match self.placement(top) {
            Placement::Copy(src) if self.placement(src).is_resident() => reg(src),
            _ => {
                self.realize(asm, top);
                reg(top)
            }
        };
        self.pop_cell();
        result
    }

    /// Materialize the top slot in its own register for in-place update.
    pub fn replace(&mut self, asm: &mut Assembler) -> Reg {
        assert!(self.depth > 0, "replace on an empty operand stack");
        let top = self.depth - 1;
        self.resolve_copies_of(asm, top, top);
        self.realize(asm, top);
        self.set(top, Placement::Dirty);
        reg(top)
    }

    /// Push a copy of `idx`.
    pub fn pull(&mut self, asm: &mut Assembler, idx: usize) {
        assert!(idx < self.depth, "pull of slot {} at depth {}", idx, self.depth);
        if idx + WINDOW > self.depth {
            let slot = self.open_slot(asm);
            let value = match self.placement(idx) {
                Placement::Copy(src) => Placement::Copy(src),
                Placement::Immediate(value) => Placement::Immediate(value),
                _ => Placement::Copy(idx),
            };
            self.set(slot, value);
        } else if idx + WINDOW == self.depth && self.placement(idx).is_resident() {
            // same register: evicting `idx` leaves its value in place
            let slot = self.open_slot(asm);
            self.set(slot, Placement::Dirty);
        } else {
            let rd = self.acquire(asm);
            asm.emit(thumb::ldr_sp(rd, home(idx)));
        }
    }

    /// Pop the top slot and store its value into `idx`.
    pub fn shove(&mut self, asm: &mut Assembler, idx: usize) {
        assert!(
            self.depth >= 2 && idx < self.depth - 1,
            "shove into slot {} at depth {}",
            idx,
            self.depth
        );
        let top = self.depth - 1;
        let value = self.placement(top);
        if value == Placement::Copy(idx) {
            self.pop_cell();
            return;
        }
        self.resolve_copies_of(asm, top, top);
        self.resolve_copies_of(asm, idx, top);

        if idx + WINDOW >= self.depth {
            let moved = match value {
                Placement::Copy(_) | Placement::Immediate(_) => value,
                Placement::Clean | Placement::Dirty => {
                    asm.emit(thumb::mov(reg(idx), reg(top)));
                    Placement::Dirty
                }
                Placement::Unloaded => {
                    asm.emit(thumb::ldr_sp(reg(idx), home(top)));
                    Placement::Dirty
                }
                Placement::Empty => unreachable!("top slot {} is empty", top),
            };
            self.set(idx, moved);
        } else {
            self.realize(asm, top);
            asm.emit(thumb::str_sp(reg(top), home(idx)));
        }
        self.pop_cell();
    }

    /// Pop `n` slots, materializing only what surviving slots still alias.
    pub fn drop(&mut self, asm: &mut Assembler, n: usize) {
        assert!(n <= self.depth, "drop of {} slots at depth {}", n, self.depth);
        let floor = self.depth - n;
        for slot in floor..self.depth {
            self.resolve_copies_of(asm, slot, floor);
        }
        for _ in 0..n {
            self.pop_cell();
        }
    }

    /// Turn every deferred slot of the window into a register value.
    pub fn flush_deferred(&mut self, asm: &mut Assembler) {
        for slot in window(self.depth) {
            if self.placement(slot).is_deferred() {
                self.realize(asm, slot);
            }
        }
    }

    /// Snapshot of register residency. No slot may be deferred.
    pub fn get_state(&self) -> AllocState {
        let mut state = AllocState { cells: 0, depth: self.depth };
        for (i, placement) in self.cells.iter().enumerate() {
            let bits = match placement {
                Placement::Empty => AllocState::EMPTY,
                Placement::Unloaded => AllocState::UNLOADED,
                Placement::Clean => AllocState::CLEAN,
                Placement::Dirty => AllocState::DIRTY,
                Placement::Copy(_) | Placement::Immediate(_) => {
                    panic!("state taken with deferred slot in r{}", i)
                }
            };
            state = state.with(i, bits);
        }
        state
    }

    /// Move values between registers and homes until the window matches
    /// `target`. Emits only loads and stores, so the flags survive.
    pub fn apply_state(&mut self, asm: &mut Assembler, target: AllocState) {
        assert_eq!(self.depth, target.depth, "state applied at a different depth");
        for slot in window(self.depth) {
            let want = target.placement(cell(slot));
            let have = self.placement(slot);
            match (have, want) {
                (Placement::Dirty, Placement::Unloaded | Placement::Clean) => {
                    asm.emit(thumb::str_sp(reg(slot), home(slot)));
                }
                (Placement::Unloaded, Placement::Clean | Placement::Dirty) => {
                    asm.emit(thumb::ldr_sp(reg(slot), home(slot)));
                }
                (have, _) if have.is_deferred() => {
                    panic!("state applied with deferred slot {}", slot)
                }
                _ => {}
            }
            assert_ne!(want, Placement::Empty, "state has no entry for slot {}", slot);
            self.set(slot, want);
        }
    }

    /// Adopt `state` without emitting code, for code only reached by
    /// branches that already established it.
    pub fn assume_state(&mut self, state: AllocState) {
        for (i, placement) in self.cells.iter_mut().enumerate() {
            *placement = state.placement(i);
        }
        self.depth = state.depth;
        self.max_depth = self.max_depth.max(state.depth);
    }

    /// Store every register value of the window to its home.
    pub fn spill_all(&mut self, asm: &mut Assembler) {
        self.flush_deferred(asm);
        for slot in window(self.depth) {
            if self.placement(slot) == Placement::Dirty {
                asm.emit(thumb::str_sp(reg(slot), home(slot)));
            }
            self.set(slot, Placement::Unloaded);
        }
    }

    /// Put the stack into the shape `Leave` expects: results 0-2 in
    /// `r1`-`r3`, the rest in their homes.
    pub fn marshal_returns(&mut self, asm: &mut Assembler) {
        self.flush_deferred(asm);
        match AllocState::returning(self.depth) {
            Some(target) => self.apply_state(asm, target),
            None => {
                self.spill_all(asm);
                for slot in 0..REG_ARGS {
                    asm.emit(thumb::ldr_sp(Reg::from_index(slot + 1), home(slot)));
                }
            }
        }
    }
}
