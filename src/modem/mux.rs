//! GSM 07.10 style serial multiplexer.
//!
//! Once the modem enters multiplexed mode the single UART carries
//! several logical channels (control, NMEA, data, poll, command), each
//! one framed:
//!
//! ```text
//! ┌──────┬──────┬──────┬──────┬─────────┬──────┬──────┐
//! │ 0xF9 │ addr │ ctrl │ len  │ payload │ fcs  │ 0xF9 │
//! └──────┴──────┴──────┴──────┴─────────┴──────┴──────┘
//! ```
//!
//! `addr` carries the DLCI in its upper bits, `ctrl` is SABM/UA/DISC
//! for channel management and UIH for payload.  The decoder is fully
//! streaming: frames may arrive split across any number of UART reads.
//! Every good frame refreshes the staleness clock the controller's
//! watchdog reads.

use log::{debug, warn};

use crate::buffer::ByteBuffer;

pub const FLAG: u8 = 0xF9;
pub const CTRL_SABM: u8 = 0x3F;
pub const CTRL_UA: u8 = 0x73;
pub const CTRL_DISC: u8 = 0x53;
pub const CTRL_UIH: u8 = 0xEF;

/// Per-channel receive buffer capacity.
const CHANNEL_BUF: usize = 2048;

/// Payload cap for a single-byte length field.
const MAX_PAYLOAD: usize = 127;

/// Reversed CRC-8 (poly x^8 + x^2 + x + 1) over the frame header.
fn crc_update(mut crc: u8, byte: u8) -> u8 {
    crc ^= byte;
    for _ in 0..8 {
        if crc & 1 != 0 {
            crc = (crc >> 1) ^ 0xE0;
        } else {
            crc >>= 1;
        }
    }
    crc
}

fn fcs(bytes: &[u8]) -> u8 {
    let crc = bytes.iter().fold(0xFF, |c, &b| crc_update(c, b));
    0xFF - crc
}

struct Channel {
    open: bool,
    buf: ByteBuffer,
}

enum Decode {
    Sync,
    Header { have: usize },
    Payload { dlci: u8, ctrl: u8, len: usize, have: usize },
    Fcs { dlci: u8, ctrl: u8 },
    Trailer,
}

pub struct Mux {
    channels: Vec<Channel>,
    state: Decode,
    header: [u8; 3],
    payload: Vec<u8>,
    started: bool,
    /// Ticks since the last structurally valid frame.
    frame_age: u32,
    pub good_frames: u32,
    pub bad_frames: u32,
}

impl Mux {
    /// `channel_count` includes the control channel (DLCI 0).
    pub fn new(channel_count: u8) -> Self {
        let channels = (0..channel_count)
            .map(|_| Channel {
                open: false,
                buf: ByteBuffer::new(CHANNEL_BUF),
            })
            .collect();
        Self {
            channels,
            state: Decode::Sync,
            header: [0; 3],
            payload: Vec::new(),
            started: false,
            frame_age: 0,
            good_frames: 0,
            bad_frames: 0,
        }
    }

    pub fn channel_count(&self) -> u8 {
        self.channels.len() as u8
    }

    pub fn open_channels(&self) -> usize {
        self.channels.iter().filter(|c| c.open).count()
    }

    pub fn is_open(&self, dlci: u8) -> bool {
        self.channels.get(dlci as usize).is_some_and(|c| c.open)
    }

    /// All channels acknowledged open.
    pub fn is_up(&self) -> bool {
        self.started && self.channels.iter().all(|c| c.open)
    }

    pub fn mark_started(&mut self) {
        self.started = true;
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    /// Ticks since the last good frame.
    pub fn good_frame_age(&self) -> u32 {
        self.frame_age
    }

    /// Advance the staleness clock; call once per second.
    pub fn on_ticker(&mut self) {
        self.frame_age = self.frame_age.saturating_add(1);
    }

    // -----------------------------------------------------------------
    // Encode
    // -----------------------------------------------------------------

    pub(crate) fn frame(dlci: u8, ctrl: u8, payload: &[u8]) -> Vec<u8> {
        debug_assert!(payload.len() <= MAX_PAYLOAD);
        let addr = (dlci << 2) | 0x03;
        let len = ((payload.len() as u8) << 1) | 0x01;
        let header = [addr, ctrl, len];
        let mut out = Vec::with_capacity(payload.len() + 6);
        out.push(FLAG);
        out.extend_from_slice(&header);
        out.extend_from_slice(payload);
        out.push(fcs(&header));
        out.push(FLAG);
        out
    }

    /// Channel-open request for `dlci`.
    pub fn sabm(dlci: u8) -> Vec<u8> {
        Self::frame(dlci, CTRL_SABM, &[])
    }

    /// Channel teardown for `dlci`.
    pub fn disc(dlci: u8) -> Vec<u8> {
        Self::frame(dlci, CTRL_DISC, &[])
    }

    /// Open acknowledgment for `dlci`, as the modem side sends it.
    pub fn ua(dlci: u8) -> Vec<u8> {
        Self::frame(dlci, CTRL_UA, &[])
    }

    /// Encode `data` as UIH frames on `dlci`, splitting as needed.
    pub fn encode(dlci: u8, data: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        for chunk in data.chunks(MAX_PAYLOAD) {
            out.extend(Self::frame(dlci, CTRL_UIH, chunk));
        }
        out
    }

    // -----------------------------------------------------------------
    // Decode
    // -----------------------------------------------------------------

    /// Feed raw UART bytes through the frame decoder, demultiplexing
    /// payload into the per-channel buffers.
    pub fn process(&mut self, data: &[u8]) {
        for &b in data {
            self.process_byte(b);
        }
    }

    fn process_byte(&mut self, b: u8) {
        match &mut self.state {
            Decode::Sync => {
                if b == FLAG {
                    self.state = Decode::Header { have: 0 };
                }
            }
            Decode::Header { have } => {
                // Back-to-back frames share a flag byte.
                if *have == 0 && b == FLAG {
                    return;
                }
                self.header[*have] = b;
                *have += 1;
                if *have == 3 {
                    let dlci = self.header[0] >> 2;
                    let ctrl = self.header[1];
                    let len = (self.header[2] >> 1) as usize;
                    if self.header[2] & 0x01 == 0 || len > MAX_PAYLOAD {
                        warn!("mux: bad length field, resync");
                        self.bad_frames += 1;
                        self.state = Decode::Sync;
                        return;
                    }
                    self.payload.clear();
                    self.state = if len == 0 {
                        Decode::Fcs { dlci, ctrl }
                    } else {
                        Decode::Payload {
                            dlci,
                            ctrl,
                            len,
                            have: 0,
                        }
                    };
                }
            }
            Decode::Payload {
                dlci,
                ctrl,
                len,
                have,
            } => {
                self.payload.push(b);
                *have += 1;
                if have == len {
                    let (dlci, ctrl) = (*dlci, *ctrl);
                    self.state = Decode::Fcs { dlci, ctrl };
                }
            }
            Decode::Fcs { dlci, ctrl } => {
                let (dlci, ctrl) = (*dlci, *ctrl);
                if fcs(&self.header) != b {
                    warn!("mux: FCS mismatch on DLCI {dlci}");
                    self.bad_frames += 1;
                    self.state = Decode::Sync;
                    return;
                }
                self.good_frames += 1;
                self.frame_age = 0;
                self.dispatch(dlci, ctrl);
                self.state = Decode::Trailer;
            }
            Decode::Trailer => {
                // Closing flag doubles as the next frame's opener.
                self.state = if b == FLAG {
                    Decode::Header { have: 0 }
                } else {
                    Decode::Sync
                };
            }
        }
    }

    fn dispatch(&mut self, dlci: u8, ctrl: u8) {
        let Some(channel) = self.channels.get_mut(dlci as usize) else {
            warn!("mux: frame for unknown DLCI {dlci}");
            self.bad_frames += 1;
            return;
        };
        match ctrl {
            CTRL_UA => {
                if !channel.open {
                    debug!("mux: DLCI {dlci} open");
                }
                channel.open = true;
            }
            CTRL_DISC => {
                channel.open = false;
            }
            CTRL_UIH => {
                let accepted = channel.buf.push_slice(&self.payload);
                if accepted < self.payload.len() {
                    warn!("mux: DLCI {dlci} buffer overflow");
                }
            }
            CTRL_SABM => {
                // Peer-initiated opens are not part of this profile.
                debug!("mux: unexpected SABM on DLCI {dlci}");
            }
            other => {
                debug!("mux: ignoring control 0x{other:02X} on DLCI {dlci}");
            }
        }
    }

    /// Next complete line on a channel, if any.
    pub fn read_line(&mut self, dlci: u8) -> Option<String> {
        self.channels.get_mut(dlci as usize)?.buf.read_line()
    }

    /// Drain raw channel bytes (data channel payload in network mode).
    pub fn drain(&mut self, dlci: u8, out: &mut [u8]) -> usize {
        match self.channels.get_mut(dlci as usize) {
            Some(c) => c.buf.pop_slice(out),
            None => 0,
        }
    }

    pub fn pending(&self, dlci: u8) -> usize {
        self.channels
            .get(dlci as usize)
            .map_or(0, |c| c.buf.used())
    }
}
