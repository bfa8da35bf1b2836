//! Data-session lifecycle tracking.
//!
//! The controller starts a PPP session on the data channel once a
//! `CONNECT` answers the context-activation commands, and tears it
//! down on `NO CARRIER`, `+PPPD: DISCONNECTED` or any state change
//! that leaves network mode.  The actual LCP/IPCP negotiation lives
//! outside this crate; what the state machine needs is whether the
//! session is up and how often it has bounced.

use log::info;

#[derive(Default)]
pub struct DataSession {
    connected: bool,
    pub connect_count: u32,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
}

impl DataSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn connect(&mut self) {
        if !self.connected {
            self.connected = true;
            self.connect_count += 1;
            info!("data session up (count {})", self.connect_count);
        }
    }

    pub fn disconnect(&mut self) {
        if self.connected {
            self.connected = false;
            info!("data session down");
        }
    }

    pub fn on_rx(&mut self, n: usize) {
        self.rx_bytes += n as u64;
    }

    pub fn on_tx(&mut self, n: usize) {
        self.tx_bytes += n as u64;
    }
}
