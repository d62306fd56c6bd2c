//! Lowering context for one function body.
//!
//! Tracks, per nested scope, the known type of every windowed register and
//! the operands the emitter has pushed but not yet consumed. The constant
//! index map is shared by the whole function, since all scopes emit into
//! the same chunk.

use crate::bytecode::register::{WINDOW_SLOTS, translate};
use crate::lang::node::{Arg, Immediate, Register, RegisterCategory, RegisterType};
use std::collections::HashMap;

#[derive(Debug, Clone)]
struct Scope {
    reg_types: [Option<RegisterType>; WINDOW_SLOTS],
    /// Operands known to sit on the data stack, innermost last.
    top: Vec<Arg>,
}

impl Scope {
    fn root() -> Self {
        Self {
            reg_types: std::array::from_fn(|_| None),
            top: Vec::new(),
        }
    }

    /// A child sees its parent's register types but none of its operands.
    fn child(&self) -> Self {
        Self {
            reg_types: self.reg_types.clone(),
            top: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ScopeStack {
    constants: HashMap<i64, usize>,
    frames: Vec<Scope>,
}

impl Default for ScopeStack {
    fn default() -> Self {
        Self::new()
    }
}

impl ScopeStack {
    pub fn new() -> Self {
        Self {
            constants: HashMap::new(),
            frames: vec![Scope::root()],
        }
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    pub fn push_scope(&mut self) {
        let child = self.current().child();
        self.frames.push(child);
    }

    /// Discard the innermost scope. Types learned inside it do not flow
    /// back to the parent. The root scope is never popped.
    pub fn pop_scope(&mut self) {
        if self.frames.len() > 1 {
            self.frames.pop();
        }
    }

    fn current(&self) -> &Scope {
        // `frames` always holds the root.
        &self.frames[self.frames.len() - 1]
    }

    fn current_mut(&mut self) -> &mut Scope {
        let last = self.frames.len() - 1;
        &mut self.frames[last]
    }

    // ── register types ──

    /// Known type of `reg`, if any. Globals are never tracked.
    pub fn reg_type(&self, reg: Register) -> Option<&RegisterType> {
        if reg.category == RegisterCategory::Global {
            return None;
        }
        self.current()
            .reg_types
            .get(translate(reg) as usize)
            .and_then(Option::as_ref)
    }

    pub fn set_reg_type(&mut self, reg: Register, ty: Option<RegisterType>) {
        if reg.category == RegisterCategory::Global {
            return;
        }
        if let Some(slot) = self.current_mut().reg_types.get_mut(translate(reg) as usize) {
            *slot = ty;
        }
    }

    // ── constants ──

    pub fn constant_index(&self, value: i64) -> Option<usize> {
        self.constants.get(&value).copied()
    }

    pub fn insert_constant(&mut self, value: i64, index: usize) {
        self.constants.insert(value, index);
    }

    // ── top of stack ──

    /// Whether `arg` is exactly the operand on top of the data stack, so
    /// pushing it again can be a `Dup`.
    pub fn same_as_top(&self, arg: &Arg) -> bool {
        match (self.current().top.last(), arg) {
            (Some(Arg::Imm(Immediate::Int(a))), Arg::Imm(Immediate::Int(b))) => a == b,
            (Some(Arg::Imm(Immediate::Float(a))), Arg::Imm(Immediate::Float(b))) => a == b,
            (Some(Arg::Reg(a)), Arg::Reg(b)) => a.category == b.category && a.id == b.id,
            _ => false,
        }
    }

    pub fn push_top(&mut self, arg: Arg) {
        self.current_mut().top.push(arg);
    }

    pub fn pop_top(&mut self) -> Option<Arg> {
        self.current_mut().top.pop()
    }

    pub fn top_len(&self) -> usize {
        self.current().top.len()
    }
}
