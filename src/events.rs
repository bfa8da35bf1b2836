//! System event plumbing.
//!
//! Events are produced by the protocol engines (modem state transitions,
//! received SMS/USSD, GPS lifecycle) and consumed by the integrator's main
//! loop.  Engines write through an [`EventSink`] so tests can record; the
//! static [`EVENT_CHANNEL`] bridges the engines to the consumer task
//! without heap-allocated queues.
//!
//! ```text
//! ┌──────────────┐              ┌──────────────┐
//! │ Modem engine │──EventSink──▶│ EVENT_CHANNEL│──▶ main loop
//! │ SCP engine   │              │ (embassy)    │
//! └──────────────┘              └──────────────┘
//! ```

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;

/// Events emitted by the engines, tagged with any payload the consumer
/// needs.  `name()` gives the stable dotted identifier used in logs and
/// by scripting consumers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    ModemPoweringOn,
    ModemPoweredOn,
    ModemMuxStart,
    ModemNetWait,
    ModemNetStart,
    ModemNetLoss,
    ModemNetHold,
    ModemNetSleep,
    ModemNetMode,
    ModemNetDeepSleep,
    ModemPoweringOff,
    ModemPoweredOff,
    ModemStop,
    ModemInstalled,
    GpsStarted,
    GpsStopped,
    ReceivedSms {
        sender: String,
        timestamp: String,
        body: String,
    },
    ReceivedUssd {
        text: String,
    },
    PincodeRequired,
    WrongPincode,
    SimNotInserted,
    HostKeyReady,
}

impl Event {
    /// Stable dotted event name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::ModemPoweringOn => "system.modem.poweringon",
            Self::ModemPoweredOn => "system.modem.poweredon",
            Self::ModemMuxStart => "system.modem.muxstart",
            Self::ModemNetWait => "system.modem.netwait",
            Self::ModemNetStart => "system.modem.netstart",
            Self::ModemNetLoss => "system.modem.netloss",
            Self::ModemNetHold => "system.modem.nethold",
            Self::ModemNetSleep => "system.modem.netsleep",
            Self::ModemNetMode => "system.modem.netmode",
            Self::ModemNetDeepSleep => "system.modem.netdeepsleep",
            Self::ModemPoweringOff => "system.modem.poweringoff",
            Self::ModemPoweredOff => "system.modem.poweredoff",
            Self::ModemStop => "system.modem.stop",
            Self::ModemInstalled => "system.modem.installed",
            Self::GpsStarted => "system.modem.gpsstart",
            Self::GpsStopped => "system.modem.gpsstop",
            Self::ReceivedSms { .. } => "system.modem.received.sms",
            Self::ReceivedUssd { .. } => "system.modem.received.ussd",
            Self::PincodeRequired => "system.modem.pincode_not_set",
            Self::WrongPincode => "system.modem.wrongpincode",
            Self::SimNotInserted => "system.modem.simnotinserted",
            Self::HostKeyReady => "system.ssh.hostkey.ready",
        }
    }
}

/// External events the modem engine consumes (vehicle power state drives
/// the GPS park-pause scheduler).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputEvent {
    VehicleOn,
    VehicleOff,
    VehicleAwake,
}

/// Sink for engine-emitted events.  The production sink forwards onto
/// [`EVENT_CHANNEL`]; tests record.
pub trait EventSink {
    fn signal(&mut self, event: Event);
}

/// Depth of the engine-to-consumer event channel.
const EVENT_DEPTH: usize = 16;

/// Engine → main loop event channel.
pub static EVENT_CHANNEL: Channel<CriticalSectionRawMutex, Event, EVENT_DEPTH> = Channel::new();

/// Production sink: non-blocking publish onto [`EVENT_CHANNEL`].
/// A full channel drops the event with a warning rather than stalling
/// the protocol engine.
pub struct ChannelSink;

impl EventSink for ChannelSink {
    fn signal(&mut self, event: Event) {
        log::debug!("event: {}", event.name());
        if EVENT_CHANNEL.try_send(event).is_err() {
            log::warn!("event channel full, event dropped");
        }
    }
}

/// Recording sink for tests.
pub struct RecordingSink {
    pub events: Vec<Event>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self { events: Vec::new() }
    }

    /// Names of all recorded events, in order.
    pub fn names(&self) -> Vec<&'static str> {
        self.events.iter().map(Event::name).collect()
    }
}

impl Default for RecordingSink {
    fn default() -> Self {
        Self::new()
    }
}

impl EventSink for RecordingSink {
    fn signal(&mut self, event: Event) {
        self.events.push(event);
    }
}
