/// Why the interpreter stopped. Every kind is fatal.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FaultKind {
    #[error("bad opcode {0:#04x}")]
    BadOpcode(u8),

    #[error("trap")]
    Trap,

    #[error("data stack underflow")]
    StackUnderflow,

    #[error("auxiliary slot {0} out of range")]
    AuxOutOfRange(i64),

    #[error("constant {index} out of range (pool holds {len})")]
    ConstantOutOfRange { index: i64, len: usize },

    #[error("global {0} out of range")]
    GlobalOutOfRange(i64),

    #[error("value {0:#x} is not a pointer")]
    NotAPointer(i64),

    #[error("field {index} out of range (class has {count})")]
    FieldOutOfRange { index: i64, count: usize },

    /// Pointers must be moved out of a field, not copied.
    #[error("field {index} holds a pointer")]
    PointerField { index: i64 },

    #[error("no chunk {0}")]
    InvalidChunk(i64),

    #[error("no class {0}")]
    InvalidClass(i64),

    #[error("ran past the end of a {len}-instruction chunk")]
    ChunkOverrun { len: usize },

    #[error("heap exhausted")]
    HeapExhausted,

    #[error("division by zero")]
    DivisionByZero,

    #[error("execution step limit exceeded ({0})")]
    StepLimit(u64),

    #[error("call depth limit exceeded ({0})")]
    CallDepth(usize),

    #[error("output failed: {0}")]
    Output(String),
}

/// A fatal interpreter fault with the location it happened at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fault {
    pub kind: FaultKind,
    pub chunk: usize,
    pub pc: usize,
    /// Chunks of the suspended callers, outermost first.
    pub call_stack: Vec<usize>,
}

impl std::fmt::Display for Fault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "fault at chunk {} pc {}: {}", self.chunk, self.pc, self.kind)?;

        if !self.call_stack.is_empty() {
            write!(f, "\n  call stack:")?;

            for (i, chunk) in self.call_stack.iter().rev().enumerate() {
                write!(f, "\n    {}: chunk {}", i, chunk)?;
            }
        }
        Ok(())
    }
}

impl std::error::Error for Fault {}

impl Fault {
    pub fn new(kind: FaultKind, chunk: usize, pc: usize) -> Self {
        Fault {
            kind,
            chunk,
            pc,
            call_stack: Vec::new(),
        }
    }

    pub fn with_call_stack(mut self, call_stack: Vec<usize>) -> Self {
        self.call_stack = call_stack;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_without_call_stack() {
        let fault = Fault::new(FaultKind::BadOpcode(0x3c), 2, 7);
        assert_eq!(fault.to_string(), "fault at chunk 2 pc 7: bad opcode 0x3c");
    }

    #[test]
    fn test_display_lists_innermost_caller_first() {
        let fault = Fault::new(FaultKind::Trap, 3, 0).with_call_stack(vec![1, 2]);
        let msg = fault.to_string();
        assert!(msg.contains("call stack:\n    0: chunk 2\n    1: chunk 1"));
    }

    #[test]
    fn test_field_kind_display() {
        let kind = FaultKind::FieldOutOfRange { index: 4, count: 2 };
        assert_eq!(kind.to_string(), "field 4 out of range (class has 2)");
    }
}
