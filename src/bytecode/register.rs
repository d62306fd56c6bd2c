//! Register → auxiliary-stack address translation.
//!
//! ```text
//!   0..16   outgoing params   (o0..o15)
//!  32..48   locals            (l0..l15)
//!  48..64   params / returns  (p0..p15, r0..r15 share these)
//! ```
//!
//! A call pushes 48 fresh slots in front of the window, so the caller's
//! `o0..o15` reappear at 48..64 as the callee's `p0..p15`; whatever the
//! callee leaves in `r0..r15` is back in the caller's `o0..o15` on return.

use crate::lang::node::{Register, RegisterCategory};

pub const OUTGOING_BASE: u8 = 0;
pub const LOCAL_BASE: u8 = 32;
pub const PARAM_BASE: u8 = 48;

/// Slots addressable within one window.
pub const WINDOW_SLOTS: usize = 64;

/// Auxiliary-stack address of `reg` within the current window.
///
/// Globals have no window layout yet and map to their raw id.
pub fn translate(reg: Register) -> u8 {
    match reg.category {
        RegisterCategory::Param | RegisterCategory::Return => PARAM_BASE + reg.id,
        RegisterCategory::Local => LOCAL_BASE + reg.id,
        RegisterCategory::OutgoingParam => OUTGOING_BASE + reg.id,
        RegisterCategory::Global => reg.id,
    }
}

/// Whether `reg.id` fits its bank: 16 registers per windowed bank, and
/// globals up to what a parameter byte can index.
pub fn in_bank(reg: Register) -> bool {
    match reg.category {
        RegisterCategory::Global => reg.id <= i8::MAX as u8,
        _ => reg.id < 16,
    }
}
