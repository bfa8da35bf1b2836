//! Modem driver abstraction.
//!
//! The controller runs one generic state machine; per-model behavior
//! (channel layout, GPS commands, vendor quirks) lives in a driver.
//! Drivers are selected by matching the `AT+CGMM` model string against
//! the registry, or pinned by the `modem.driver` config key.
//!
//! Every state hook is consulted before the controller's default
//! handling: a `Handled` result suppresses the default for that state,
//! `Passthrough` falls through to it.  Drivers act on the controller
//! through [`ModemControl`] so they stay testable without a UART.

use crate::config::ModemConfig;
use crate::modem::ModemState;

/// Outcome of a driver enter/leave/activity hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookResult {
    /// Driver took over; skip the default handling.
    Handled,
    /// Fall through to the controller's default handling.
    Passthrough,
}

/// Outcome of a driver ticker hook.  `Handled` may also redirect the
/// state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickResult {
    Passthrough,
    Handled(Option<ModemState>),
}

/// Logical channel assignment inside the multiplexer.  DLCI 0 is
/// always the 07.10 control channel; `count` covers it.
#[derive(Debug, Clone, Copy)]
pub struct MuxChannelMap {
    pub ctrl: u8,
    pub nmea: u8,
    pub data: u8,
    pub poll: u8,
    pub cmd: u8,
    pub count: u8,
}

/// Controller surface exposed to driver hooks.
pub trait ModemControl {
    /// Raw UART transmit (pre-mux states).
    fn tx(&mut self, data: &[u8]);
    /// Transmit on a mux channel.
    fn muxtx(&mut self, channel: u8, data: &[u8]);
    fn config(&self) -> &ModemConfig;
}

#[allow(unused_variables)]
pub trait ModemDriver {
    fn name(&self) -> &'static str;

    fn channels(&self) -> MuxChannelMap;

    /// Software power-down command.
    fn power_off_command(&self) -> &'static [u8] {
        b"AT+CPOF\r\n"
    }

    /// Registration / signal / operator poll burst.
    fn status_poll(&self) -> &'static [u8] {
        b"AT+CREG?;+CGREG?;+CEREG?;+CSQ;+COPS?\r\n"
    }

    fn gps_start_commands(&self) -> &'static [u8] {
        b"AT+CGPS=1\r\n"
    }

    fn gps_stop_commands(&self) -> &'static [u8] {
        b"AT+CGPS=0\r\n"
    }

    /// Command selecting the preferred network type, if the model
    /// supports one.
    fn net_type_command(&self, net_type: &str) -> Option<&'static [u8]> {
        None
    }

    fn state_enter(&mut self, ctl: &mut dyn ModemControl, state: ModemState) -> HookResult {
        HookResult::Passthrough
    }

    fn state_leave(&mut self, ctl: &mut dyn ModemControl, state: ModemState) -> HookResult {
        HookResult::Passthrough
    }

    fn state_ticker(
        &mut self,
        ctl: &mut dyn ModemControl,
        state: ModemState,
        ticker: u32,
    ) -> TickResult {
        TickResult::Passthrough
    }
}

// ---------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------

pub struct DriverSpec {
    pub name: &'static str,
    /// Substring matched against the `AT+CGMM` model string.
    pub pattern: &'static str,
    pub make: fn() -> Box<dyn ModemDriver>,
}

/// Known drivers, probed in order.  "auto" is the fallback and never
/// matches a model string.
pub fn registry() -> &'static [DriverSpec] {
    &[
        DriverSpec {
            name: "SIM7600",
            pattern: "SIM7600",
            make: || Box::new(Sim7600),
        },
        DriverSpec {
            name: "SIM5360",
            pattern: "SIM5360",
            make: || Box::new(Sim5360),
        },
        DriverSpec {
            name: "auto",
            pattern: "",
            make: || Box::new(GenericDriver),
        },
    ]
}

/// Match a model response line against the registry patterns.
pub fn identify(line: &str) -> Option<&'static DriverSpec> {
    registry()
        .iter()
        .find(|d| !d.pattern.is_empty() && line.contains(d.pattern))
}

pub fn by_name(name: &str) -> Option<&'static DriverSpec> {
    registry().iter().find(|d| d.name == name)
}

// ---------------------------------------------------------------------
// Drivers
// ---------------------------------------------------------------------

/// Default five-channel layout shared by the SIMCOM drivers.
pub const DEFAULT_CHANNELS: MuxChannelMap = MuxChannelMap {
    ctrl: 0,
    nmea: 1,
    data: 2,
    poll: 3,
    cmd: 4,
    count: 5,
};

/// Fallback driver for unrecognized models.  Conservative channel map,
/// no vendor extensions.
pub struct GenericDriver;

impl ModemDriver for GenericDriver {
    fn name(&self) -> &'static str {
        "auto"
    }

    fn channels(&self) -> MuxChannelMap {
        DEFAULT_CHANNELS
    }
}

/// SIMCOM SIM7600 (LTE Cat-1/Cat-4).
pub struct Sim7600;

impl ModemDriver for Sim7600 {
    fn name(&self) -> &'static str {
        "SIM7600"
    }

    fn channels(&self) -> MuxChannelMap {
        DEFAULT_CHANNELS
    }

    fn status_poll(&self) -> &'static [u8] {
        b"AT+CREG?;+CGREG?;+CEREG?;+CSQ;+COPS?;+CPSI?\r\n"
    }

    fn gps_start_commands(&self) -> &'static [u8] {
        b"AT+CGPS=1,1;+CGPSNMEARATE=1\r\n"
    }

    fn gps_stop_commands(&self) -> &'static [u8] {
        b"AT+CGPS=0\r\n"
    }

    fn net_type_command(&self, net_type: &str) -> Option<&'static [u8]> {
        match net_type {
            "LTE" => Some(b"AT+CNMP=38\r\n"),
            "GSM" => Some(b"AT+CNMP=13\r\n"),
            "auto" => Some(b"AT+CNMP=2\r\n"),
            _ => None,
        }
    }

    fn state_ticker(
        &mut self,
        ctl: &mut dyn ModemControl,
        state: ModemState,
        ticker: u32,
    ) -> TickResult {
        // Automatic timezone update, once during power-on init.
        if state == ModemState::PoweredOn && ticker == 14 {
            ctl.tx(b"AT+CTZU=1\r\n");
        }
        TickResult::Passthrough
    }
}

/// SIMCOM SIM5360 (UMTS/HSPA).
pub struct Sim5360;

impl ModemDriver for Sim5360 {
    fn name(&self) -> &'static str {
        "SIM5360"
    }

    fn channels(&self) -> MuxChannelMap {
        DEFAULT_CHANNELS
    }

    fn gps_start_commands(&self) -> &'static [u8] {
        b"AT+CGPS=1,1\r\n"
    }

    fn net_type_command(&self, net_type: &str) -> Option<&'static [u8]> {
        match net_type {
            "GSM" => Some(b"AT+CNMP=13\r\n"),
            "auto" => Some(b"AT+CNMP=2\r\n"),
            _ => None,
        }
    }
}
