//! Vehicle monitor connectivity firmware library.
//!
//! Two protocol engines built on a shared non-blocking transport
//! layer: the SSH console's SCP file-transfer sub-protocol and the
//! cellular modem controller.  Both are pure state machines driven by
//! readable/drained/tick callbacks, so the integrator owns the event
//! loop and the hardware bindings.

#![deny(unused_must_use)]

pub mod buffer;
pub mod config;
pub mod error;
pub mod events;
pub mod modem;
pub mod scp;
pub mod transport;

pub use error::{Error, Result};
