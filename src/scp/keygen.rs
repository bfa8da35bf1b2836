//! Background host-key provisioning.
//!
//! Key generation can take tens of seconds on the device, so it runs on
//! a dedicated worker thread while the console keeps serving.  The
//! finished key record is persisted through a [`StoragePort`]
//! (postcard-encoded) and announced with a [`Event::HostKeyReady`].
//! The generator itself is supplied by the integrator (it wraps whatever
//! the SSH library offers), hence the `anyhow::Result` seam.

use std::sync::mpsc;
use std::thread;

use log::{error, info};
use serde::{Deserialize, Serialize};

use crate::events::{Event, EventSink};

/// Storage key the record is persisted under.
pub const HOST_KEY_SLOT: &str = "ssh.server.key";

/// Persistence seam for small binary records.
pub trait StoragePort {
    fn save(&mut self, slot: &str, data: &[u8]) -> anyhow::Result<()>;
    fn load(&self, slot: &str) -> Option<Vec<u8>>;
}

/// Persisted host key material.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct KeyRecord {
    /// Key algorithm label (e.g. "ssh-rsa").
    pub algorithm: String,
    /// DER-encoded private key blob.
    pub der: Vec<u8>,
}

/// Load a previously generated host key, if one is stored.
pub fn load_host_key(store: &dyn StoragePort) -> Option<KeyRecord> {
    let bytes = store.load(HOST_KEY_SLOT)?;
    match postcard::from_bytes(&bytes) {
        Ok(record) => Some(record),
        Err(e) => {
            error!("host key record corrupt: {e}");
            None
        }
    }
}

/// One-shot background key generation task.
pub struct HostKeyTask {
    rx: mpsc::Receiver<anyhow::Result<KeyRecord>>,
    finished: bool,
}

impl HostKeyTask {
    /// Spawn the generator on a worker thread.
    pub fn spawn<F>(generator: F) -> anyhow::Result<Self>
    where
        F: FnOnce() -> anyhow::Result<KeyRecord> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel();
        thread::Builder::new()
            .name("hostkey-gen".to_string())
            .spawn(move || {
                info!("host key generation started");
                let result = generator();
                // Receiver gone means the server shut down; nothing to do.
                let _ = tx.send(result);
            })?;
        Ok(Self {
            rx,
            finished: false,
        })
    }

    /// Poll for completion.  Call once per tick; on the completing tick
    /// the record is persisted and the ready event fires.  Returns
    /// `true` once the task has finished (successfully or not).
    pub fn poll(&mut self, store: &mut dyn StoragePort, events: &mut dyn EventSink) -> bool {
        if self.finished {
            return true;
        }
        match self.rx.try_recv() {
            Ok(Ok(record)) => {
                self.finished = true;
                match postcard::to_allocvec(&record) {
                    Ok(bytes) => {
                        if let Err(e) = store.save(HOST_KEY_SLOT, &bytes) {
                            error!("host key store failed: {e}");
                        } else {
                            info!(
                                "host key ready ({}, {} bytes)",
                                record.algorithm,
                                record.der.len()
                            );
                            events.signal(Event::HostKeyReady);
                        }
                    }
                    Err(e) => error!("host key encode failed: {e}"),
                }
                true
            }
            Ok(Err(e)) => {
                self.finished = true;
                error!("host key generation failed: {e}");
                true
            }
            Err(mpsc::TryRecvError::Empty) => false,
            Err(mpsc::TryRecvError::Disconnected) => {
                self.finished = true;
                error!("host key worker vanished");
                true
            }
        }
    }
}
