//! Interrupt-event multiplexing core for a userspace packet-processing
//! runtime.
//!
//! Two facilities cover the two waiter shapes drivers need:
//!
//! - [`InterruptManager`]: a registry of fd-keyed interrupt sources served
//!   by one background dispatch thread. Drivers register plain-function
//!   callbacks against a device's [`IntrHandle`]; the thread drains each
//!   ready descriptor and fires its callbacks exactly once per event, in
//!   registration order. Registration and unregistration are safe from any
//!   thread, including from within a running callback.
//! - [`poll`]: a caller-driven multiplexer for latency-sensitive per-queue
//!   vectors, built on a lock-free per-slot state machine instead of the
//!   global registry.
//!
//! Backend control of the underlying device interrupt (enable, disable,
//! acknowledge) is keyed by [`HandleType`] in [`backend`].

pub mod backend;
mod dispatch;
pub mod error;
pub mod handle;
pub mod poll;
pub mod registry;
mod utils;

pub use error::IntrError;
pub use handle::{HandleType, IntrHandle, MAX_RXTX_INTR_VEC, NB_OTHER_INTR, RXTX_VEC_OFFSET};
pub use poll::{EventSlot, PolledEvent, RxCtlOp, SlotCallback, SlotCtl, SlotStatus};
pub use registry::{InterruptManager, IntrCallback, UnregisterHook};
