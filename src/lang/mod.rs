//! # Program tree
//!
//! The typed program representation produced by the external front end and
//! consumed by the emitter in [`crate::bytecode::compile`].
//!
//! ## Notation used in the docs
//!
//! - Registers are written `l0` (local), `p0` (param), `o0` (outgoing
//!   param), `r0` (return) and `g0` (global).
//! - `obj.Type:field` is a member access through the pointer held in `obj`.

pub mod node;
pub mod program;
