//! Lowering and execution core for a register-based assembly language.
//!
//! A [`lang::program::Program`] tree is lowered by
//! [`bytecode::compile::Compiler`] into an [`bytecode::Executable`], which
//! [`runtime::vm_bc::Vm`] interprets.

pub mod bytecode;
pub mod lang;
pub mod runtime;
