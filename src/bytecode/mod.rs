pub mod compile;
pub mod compile_error;
pub mod context;
pub mod disasm;
pub mod ir;
pub mod op;
pub mod register;

pub use ir::{Chunk, Executable};
pub use op::{Instruction, Opcode};
