//! Slice reassembly
//!
//! The ring of slice slots between the socket and the playout pacer.

pub mod assembler;
pub mod slot;

pub use assembler::{RetireReason, RetiredSlice, SliceAssembler, SlotEvent};
pub use slot::{BlockMask, SliceSlot, SlotState};
