//! Integration test driver for `tests/integration/` submodule.
//!
//! Each `mod` below maps to a file that exercises a subsystem end to
//! end through its public API, with scripted transports standing in
//! for the SSH channel and the modem UART.

mod modem_lifecycle_tests;
mod scp_transfer_tests;
mod sms_ussd_tests;
