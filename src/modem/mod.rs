//! Cellular modem controller.
//!
//! Drives a SIMCOM-class cellular module from power-on through network
//! registration, serial multiplexing and data session, with SMS/USSD
//! handling and a GPS park-pause scheduler on the side.  The engine is
//! a tick-based state machine: the integrator calls [`Modem::poll_uart`]
//! when the UART is readable and [`Modem::on_ticker`] once per second,
//! and consumes emitted [`Event`]s.
//!
//! ```text
//!                 ┌──────────────────────────────────────────────┐
//!                 ▼                                              │
//! CheckPowerOff → PoweringOn → Identify → PoweredOn → MuxStart   │
//!                 ▲                                      │       │
//!                 │                                   NetWait ───┼─▶ NetHold
//!              PowerOffOn ◀── NetLoss ◀── NetMode ◀── NetStart   │
//!                 ▲              │ ×3        ▲                   │
//!                 └──────────────┘           └── data session ───┘
//! ```
//!
//! Every state carries an optional timeout with a goto target, so a
//! wedged modem always lands back on a recovery path.  A second
//! watchdog restarts the whole stack when the mux link stops carrying
//! valid frames for [`MUX_STALE_SECS`].

pub mod cmd;
pub mod driver;
pub mod gps;
pub mod mux;
pub mod parser;
pub mod ppp;

use core::fmt;

use embedded_hal::digital::OutputPin;
use log::{debug, error, info, warn};

use crate::buffer::ByteBuffer;
use crate::config::ModemConfig;
use crate::error::{CommandError, Error, ModemError};
use crate::events::{Event, EventSink, InputEvent};
use crate::transport::{Transport, TransportError};

use cmd::CommandExchange;
use driver::{HookResult, ModemControl, ModemDriver, MuxChannelMap, TickResult};
use gps::{GpsAction, GpsScheduler, GpsUserMode};
use mux::Mux;
use ppp::DataSession;

/// Seconds without a valid mux frame before the stack is restarted.
pub const MUX_STALE_SECS: u32 = 180;

/// Consecutive data-session losses tolerated before a full power
/// cycle is forced instead of another reconnect.
pub const NETLOSS_RETRY_MAX: u32 = 3;

/// Raw receive buffer for the pre-mux line states.
const UART_BUF: usize = 2048;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ModemState {
    #[default]
    None,
    CheckPowerOff,
    PoweringOn,
    Identify,
    PoweredOn,
    MuxStart,
    NetWait,
    NetStart,
    NetLoss,
    NetHold,
    NetSleep,
    NetMode,
    NetDeepSleep,
    PoweringOff,
    PoweredOff,
    PowerOffOn,
    Development,
}

impl fmt::Display for ModemState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::None => "None",
            Self::CheckPowerOff => "CheckPowerOff",
            Self::PoweringOn => "PoweringOn",
            Self::Identify => "Identify",
            Self::PoweredOn => "PoweredOn",
            Self::MuxStart => "MuxStart",
            Self::NetWait => "NetWait",
            Self::NetStart => "NetStart",
            Self::NetLoss => "NetLoss",
            Self::NetHold => "NetHold",
            Self::NetSleep => "NetSleep",
            Self::NetMode => "NetMode",
            Self::NetDeepSleep => "NetDeepSleep",
            Self::PoweringOff => "PoweringOff",
            Self::PoweredOff => "PoweredOff",
            Self::PowerOffOn => "PowerOffOn",
            Self::Development => "Development",
        };
        f.write_str(name)
    }
}

/// Network registration status, ordered by how useful the
/// registration is.  The overall status is the best of the three
/// registration domains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum NetReg {
    #[default]
    Unknown,
    NotRegistered,
    Denied,
    Searching,
    Registered,
    RegisteredEmergencyServices,
    RegisteredRoamingSms,
    RegisteredRoaming,
    RegisteredHomeSms,
    RegisteredHome,
}

impl NetReg {
    pub fn is_registered(self) -> bool {
        self >= Self::Registered
    }
}

impl fmt::Display for NetReg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unknown => "Unknown",
            Self::NotRegistered => "NotRegistered",
            Self::Denied => "Denied",
            Self::Searching => "Searching",
            Self::Registered => "Registered",
            Self::RegisteredEmergencyServices => "RegisteredEmergencyServices",
            Self::RegisteredRoamingSms => "RegisteredRoamingSMS",
            Self::RegisteredRoaming => "RegisteredRoaming",
            Self::RegisteredHomeSms => "RegisteredHomeSMS",
            Self::RegisteredHome => "RegisteredHome",
        };
        f.write_str(name)
    }
}

/// Registration domain index into the per-domain status table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegDomain {
    Gsm = 0,
    Gprs = 1,
    Eps = 2,
}

/// Modem power rail control.
pub trait PowerPort {
    fn power_on(&mut self);
    fn power_off(&mut self);
    fn power_cycle(&mut self);
}

pub struct NullPower;

impl PowerPort for NullPower {
    fn power_on(&mut self) {}
    fn power_off(&mut self) {}
    fn power_cycle(&mut self) {}
}

/// Power rail behind a single GPIO enable pin.
pub struct GpioPower<P: OutputPin> {
    pin: P,
}

impl<P: OutputPin> GpioPower<P> {
    pub fn new(pin: P) -> Self {
        Self { pin }
    }
}

impl<P: OutputPin> PowerPort for GpioPower<P> {
    fn power_on(&mut self) {
        let _ = self.pin.set_high();
    }

    fn power_off(&mut self) {
        let _ = self.pin.set_low();
    }

    fn power_cycle(&mut self) {
        let _ = self.pin.set_low();
        let _ = self.pin.set_high();
    }
}

/// Consumer of GNSS output diverted off the NMEA channel.
pub trait NmeaPort {
    fn sentence(&mut self, line: &str);
}

pub struct NullNmea;

impl NmeaPort for NullNmea {
    fn sentence(&mut self, _line: &str) {}
}

/// Point-in-time snapshot for status displays and metrics.
#[derive(Debug, Clone)]
pub struct ModemStatus {
    pub state: ModemState,
    pub netreg: NetReg,
    pub provider: String,
    pub model: String,
    pub fw_version: String,
    pub iccid: String,
    pub net_mode: String,
    pub signal_dbm: Option<i32>,
    pub open_channels: usize,
    pub mux_frame_age: u32,
    pub good_frames: u32,
    pub bad_frames: u32,
    pub buffer_overflows: u32,
    pub data_connected: bool,
}

/// Signal quality in dBm from a raw `+CSQ` value; 99 means unknown.
pub fn csq_to_dbm(csq: u8) -> Option<i32> {
    if csq > 31 {
        return None;
    }
    Some(-113 + 2 * i32::from(csq))
}

// NetStart progress sentinels, written by the line handler and acted
// on by the ticker.
const UD_NONE: u8 = 0;
const UD_STARTING: u8 = 1;
const UD_CONNECTED: u8 = 2;
const UD_LOST: u8 = 99;
const UD_FAILED: u8 = 100;

pub struct Modem<T: Transport> {
    uart: T,
    power: Box<dyn PowerPort>,
    events: Box<dyn EventSink>,
    nmea: Box<dyn NmeaPort>,
    pub(crate) config: ModemConfig,
    driver: Option<Box<dyn ModemDriver>>,

    state: ModemState,
    state_ticker: u32,
    state_timeout: Option<(u32, ModemState)>,
    netloss_retries: u32,
    /// NetStart progress sentinel (UD_*).
    userdata: u8,

    buffer: ByteBuffer,
    mux: Option<Mux>,
    ppp: DataSession,
    gps: GpsScheduler,
    cmd: CommandExchange,

    pub(crate) netreg: [NetReg; 3],
    pub(crate) netreg_overall: NetReg,
    pub(crate) provider: String,
    pub(crate) model: String,
    pub(crate) iccid: String,
    pub(crate) fw_version: String,
    pub(crate) net_mode: String,
    pub(crate) signal_csq: u8,

    pub(crate) sms: Option<parser::SmsAccumulator>,
    pub(crate) ussd: Option<String>,

    err_buffer_overflows: u32,
    err_tx_stalls: u32,
}

impl<T: Transport> Modem<T> {
    pub fn new(
        uart: T,
        config: ModemConfig,
        power: Box<dyn PowerPort>,
        events: Box<dyn EventSink>,
    ) -> Self {
        let gps = GpsScheduler::new(&config);
        Self {
            uart,
            power,
            events,
            nmea: Box::new(NullNmea),
            config,
            driver: None,
            state: ModemState::None,
            state_ticker: 0,
            state_timeout: None,
            netloss_retries: 0,
            userdata: UD_NONE,
            buffer: ByteBuffer::new(UART_BUF),
            mux: None,
            ppp: DataSession::new(),
            gps,
            cmd: CommandExchange::new(),
            netreg: [NetReg::Unknown; 3],
            netreg_overall: NetReg::Unknown,
            provider: String::new(),
            model: String::new(),
            iccid: String::new(),
            fw_version: String::new(),
            net_mode: String::new(),
            signal_csq: 99,
            sms: None,
            ussd: None,
            err_buffer_overflows: 0,
            err_tx_stalls: 0,
        }
    }

    pub fn set_nmea_port(&mut self, nmea: Box<dyn NmeaPort>) {
        self.nmea = nmea;
    }

    pub fn state(&self) -> ModemState {
        self.state
    }

    pub fn netreg(&self) -> NetReg {
        self.netreg_overall
    }

    pub fn data_connected(&self) -> bool {
        self.ppp.is_connected()
    }

    pub fn status(&self) -> ModemStatus {
        ModemStatus {
            state: self.state,
            netreg: self.netreg_overall,
            provider: self.provider.clone(),
            model: self.model.clone(),
            fw_version: self.fw_version.clone(),
            iccid: self.iccid.clone(),
            net_mode: self.net_mode.clone(),
            signal_dbm: csq_to_dbm(self.signal_csq),
            open_channels: self.mux.as_ref().map_or(0, Mux::open_channels),
            mux_frame_age: self.mux.as_ref().map_or(0, Mux::good_frame_age),
            good_frames: self.mux.as_ref().map_or(0, |m| m.good_frames),
            bad_frames: self.mux.as_ref().map_or(0, |m| m.bad_frames),
            buffer_overflows: self.err_buffer_overflows,
            data_connected: self.ppp.is_connected(),
        }
    }

    /// Borrow the underlying UART transport.
    pub fn uart_mut(&mut self) -> &mut T {
        &mut self.uart
    }

    /// False while the modem is off or shutting down, when nothing
    /// written to the UART will be acted on.
    fn is_powered(&self) -> bool {
        !matches!(
            self.state,
            ModemState::PoweredOff | ModemState::PoweringOff | ModemState::CheckPowerOff
        )
    }

    /// Begin the power-on lifecycle.
    pub fn start(&mut self) {
        self.set_state(ModemState::PoweringOn);
    }

    /// Orderly shutdown.  The power-off command is verified through
    /// CheckPowerOff before the modem is declared off.
    pub fn stop(&mut self) {
        self.set_state(ModemState::PoweringOff);
    }

    // -----------------------------------------------------------------
    // State machine core
    // -----------------------------------------------------------------

    pub fn set_state(&mut self, new: ModemState) {
        let old = self.state;
        info!("modem: state {old} -> {new}");
        self.state_timeout = None;
        if old != ModemState::None && !self.driver_leave(old) {
            self.default_leave(old);
        }
        self.state = new;
        self.state_ticker = 0;
        if !self.driver_enter(new) {
            self.default_enter(new);
        }
    }

    fn set_timeout(&mut self, secs: u32, goto: ModemState) {
        self.state_timeout = Some((secs, goto));
    }

    fn signal(&mut self, event: Event) {
        self.events.signal(event);
    }

    fn default_enter(&mut self, state: ModemState) {
        use ModemState::*;
        match state {
            CheckPowerOff => {
                self.set_timeout(15, PoweredOff);
            }
            PoweringOn => {
                self.signal(Event::ModemPoweringOn);
                self.power.power_cycle();
                self.set_timeout(30, PoweringOn);
            }
            Identify => {
                self.set_timeout(30, PowerOffOn);
            }
            PoweredOn => {
                self.signal(Event::ModemPoweredOn);
                self.set_timeout(30, PoweringOn);
            }
            MuxStart => {
                self.signal(Event::ModemMuxStart);
                self.set_timeout(120, PoweringOn);
                self.start_mux();
            }
            NetWait => {
                self.signal(Event::ModemNetWait);
                let poll = self.channel_map().poll;
                if self.mux.as_ref().is_some_and(|m| m.is_open(poll)) {
                    self.muxtx(poll, b"AT+CGATT=1\r\n");
                }
                if let Some(a) = self.gps.on_session_ready() {
                    self.apply_gps(a);
                }
            }
            NetStart => {
                self.signal(Event::ModemNetStart);
                self.set_timeout(30, PowerOffOn);
                self.userdata = UD_NONE;
            }
            NetLoss => {
                self.signal(Event::ModemNetLoss);
                self.netloss_retries += 1;
                if self.netloss_retries >= NETLOSS_RETRY_MAX {
                    warn!(
                        "modem: {} data session losses, forcing power cycle",
                        self.netloss_retries
                    );
                    self.set_timeout(3, PowerOffOn);
                } else {
                    self.set_timeout(10, NetWait);
                }
                if self.ppp.is_connected() {
                    let ch = self.channel_map().cmd;
                    self.muxtx(ch, b"AT+CGATT=0\r\n");
                    self.ppp.disconnect();
                }
            }
            NetHold => {
                self.signal(Event::ModemNetHold);
            }
            NetSleep => {
                self.signal(Event::ModemNetSleep);
                self.ppp.disconnect();
                if self.gps.is_running() {
                    self.gps.force_down();
                    self.apply_gps(GpsAction::Stop);
                }
            }
            NetMode => {
                self.signal(Event::ModemNetMode);
                self.ppp.connect();
                self.netloss_retries = 0;
            }
            NetDeepSleep => {
                self.signal(Event::ModemNetDeepSleep);
                self.ppp.disconnect();
            }
            PoweringOff => {
                self.signal(Event::ModemStop);
                self.signal(Event::ModemPoweringOff);
                let cmd = self
                    .driver
                    .as_ref()
                    .map_or(&b"AT+CPOF\r\n"[..], |d| d.power_off_command())
                    .to_vec();
                self.txcmd(&cmd);
                self.stop_mux();
                self.set_timeout(20, CheckPowerOff);
            }
            PoweredOff => {
                self.signal(Event::ModemPoweredOff);
                self.stop_mux();
                // Identify reinstalls the driver on the next power-on.
                self.driver = Option::None;
            }
            PowerOffOn => {
                self.signal(Event::ModemStop);
                self.stop_mux();
                self.power.power_off();
                self.netloss_retries = 0;
                self.driver = Option::None;
                self.set_timeout(3, PoweringOn);
            }
            Development | None => {}
        }
    }

    fn default_leave(&mut self, state: ModemState) {
        if state == ModemState::NetMode {
            self.ppp.disconnect();
        }
    }

    fn driver_enter(&mut self, state: ModemState) -> bool {
        let Some(mut d) = self.driver.take() else {
            return false;
        };
        let r = d.state_enter(self, state);
        self.driver = Some(d);
        r == HookResult::Handled
    }

    fn driver_leave(&mut self, state: ModemState) -> bool {
        let Some(mut d) = self.driver.take() else {
            return false;
        };
        let r = d.state_leave(self, state);
        self.driver = Some(d);
        r == HookResult::Handled
    }

    fn driver_ticker(&mut self, state: ModemState, ticker: u32) -> TickResult {
        let Some(mut d) = self.driver.take() else {
            return TickResult::Passthrough;
        };
        let r = d.state_ticker(self, state, ticker);
        self.driver = Some(d);
        r
    }

    // -----------------------------------------------------------------
    // Ticker
    // -----------------------------------------------------------------

    /// Once-per-second state machine tick.
    pub fn on_ticker(&mut self) {
        self.state_ticker += 1;

        // The staleness watchdog outranks everything else this tick.
        if let Some(mux) = &mut self.mux {
            mux.on_ticker();
            if mux.is_started() && mux.good_frame_age() >= MUX_STALE_SECS {
                error!(
                    "modem: no valid mux frame for {}s, restarting stack",
                    MUX_STALE_SECS
                );
                self.ppp.disconnect();
                self.stop_mux();
                self.set_state(ModemState::PoweringOn);
                return;
            }
        }

        let ticker = self.state_ticker;
        let handled = match self.driver_ticker(self.state, ticker) {
            TickResult::Handled(Some(next)) => {
                self.set_state(next);
                return;
            }
            TickResult::Handled(None) => true,
            TickResult::Passthrough => false,
        };

        let next = if handled {
            None
        } else {
            self.default_ticker(ticker)
        };

        if let Some(a) = self.gps.tick() {
            self.apply_gps(a);
        }
        self.cmd.on_ticker();

        if let Some(next) = next {
            self.set_state(next);
            return;
        }

        // A direct transition above replaces the timeout countdown.
        if let Some((ticks, goto)) = &mut self.state_timeout {
            *ticks -= 1;
            if *ticks == 0 {
                let goto = *goto;
                warn!("modem: state {} timed out, goto {goto}", self.state);
                self.set_state(goto);
            }
        }
    }

    fn default_ticker(&mut self, ticker: u32) -> Option<ModemState> {
        // A glob import here would pull in `ModemState::None` and
        // shadow `Option::None` for the whole body.
        use ModemState::{
            CheckPowerOff, Identify, MuxStart, NetHold, NetLoss, NetMode, NetStart, NetWait,
            PowerOffOn, PoweredOn, PoweringOn,
        };
        match self.state {
            CheckPowerOff | PoweringOn => {
                if ticker % 3 == 0 {
                    self.tx(b"AT\r\n");
                }
                None
            }
            Identify => {
                if ticker == 1 && self.config.driver != "auto" {
                    let name = self.config.driver.clone();
                    match driver::by_name(&name) {
                        Some(spec) => {
                            self.install_driver(spec);
                            return Some(PoweredOn);
                        }
                        None => {
                            warn!("modem: unknown driver '{name}', probing model");
                        }
                    }
                }
                if ticker % 3 == 1 {
                    self.tx(b"AT+CGMM\r\n");
                }
                None
            }
            PoweredOn => {
                match ticker {
                    8 => self.tx(
                        b"AT+CPIN?;+CREG=1;+CGREG=1;+CEREG=1;+CLIP=1;+CMGF=1;\
                          +CNMI=1,2,0,0,0;+CSDH=1;+CMEE=2;+CSQ;E0\r\n",
                    ),
                    10 => self.tx(b"AT+CGMR;+ICCID\r\n"),
                    12 => {
                        self.tx(b"AT+COPS=3,0;+COPS?\r\n");
                        let net_type = self.config.net_type.clone();
                        let cmd = self
                            .driver
                            .as_ref()
                            .and_then(|d| d.net_type_command(&net_type));
                        if let Some(cmd) = cmd {
                            self.tx(cmd);
                        }
                    }
                    t if t >= 20 => {
                        if self.config.enable_net {
                            return Some(MuxStart);
                        }
                        // Networking disabled: sit powered on for SMS.
                        self.state_timeout = None;
                    }
                    _ => {}
                }
                None
            }
            MuxStart => {
                if self.mux.as_ref().is_some_and(Mux::is_up) {
                    return Some(NetWait);
                }
                if ticker % 5 == 0 {
                    self.resend_mux_opens();
                }
                None
            }
            NetWait => {
                if ticker == 1 && (self.config.apn.is_empty() || !self.config.enable_net) {
                    return Some(NetHold);
                }
                if ticker % 10 == 0 {
                    self.send_status_poll();
                }
                if ticker > 3 && self.netreg_overall.is_registered() {
                    return Some(NetStart);
                }
                None
            }
            NetStart => {
                if ticker == 1 {
                    self.userdata = UD_STARTING;
                    let cmd = format!(
                        "AT+CGDCONT=1,\"IP\",\"{}\";+CGDATA=\"PPP\",1\r\n",
                        self.config.apn
                    );
                    let data = self.channel_map().data;
                    self.muxtx(data, cmd.as_bytes());
                }
                match self.userdata {
                    UD_CONNECTED => {
                        self.userdata = UD_NONE;
                        Some(NetMode)
                    }
                    UD_LOST => {
                        self.userdata = UD_NONE;
                        Some(NetLoss)
                    }
                    UD_FAILED => {
                        self.userdata = UD_NONE;
                        Some(PowerOffOn)
                    }
                    _ => None,
                }
            }
            NetMode => {
                if self.userdata == UD_LOST {
                    self.userdata = UD_NONE;
                    return Some(NetLoss);
                }
                if ticker > 5 && ticker % 30 == 0 {
                    self.send_status_poll();
                }
                None
            }
            NetHold => {
                if ticker % 30 == 0 {
                    self.send_status_poll();
                }
                None
            }
            _ => None,
        }
    }

    // -----------------------------------------------------------------
    // UART input
    // -----------------------------------------------------------------

    /// Drain the UART and run the receive path.  Call on readable.
    pub fn poll_uart(&mut self) {
        let mut tmp = [0u8; 256];
        loop {
            match self.uart.read(&mut tmp) {
                Ok(0) => break,
                Ok(n) => {
                    let data = tmp[..n].to_vec();
                    self.on_rx(&data);
                }
                Err(TransportError::WouldBlock) => break,
                Err(e) => {
                    warn!("modem: uart read failed: {e}");
                    break;
                }
            }
        }
    }

    pub(crate) fn on_rx(&mut self, data: &[u8]) {
        if let Some(mux) = &mut self.mux {
            mux.process(data);
            self.drain_mux_channels();
        } else {
            let accepted = self.buffer.push_slice(data);
            if accepted < data.len() {
                self.err_buffer_overflows += 1;
            }
            self.line_activity();
        }
    }

    /// Pre-mux receive path: whole lines, interpreted per state.
    fn line_activity(&mut self) {
        use ModemState::*;
        while let Some(line) = self.buffer.read_line() {
            if line.is_empty() {
                continue;
            }
            match self.state {
                CheckPowerOff => {
                    // The modem answered the probe: it is alive and
                    // must be shut down properly.
                    if line == "OK" {
                        self.set_state(PoweringOff);
                        return;
                    }
                }
                PoweringOn => {
                    if line == "OK" || line == "RDY" {
                        self.set_state(Identify);
                        return;
                    }
                }
                Identify => {
                    if self.identify_line(&line) {
                        return;
                    }
                }
                PoweredOn | Development => {
                    self.standard_line_handler(0, &line);
                }
                PoweredOff => {
                    // Chatter from a modem that should be off.
                    debug!("modem: activity while powered off");
                    self.set_state(PoweringOff);
                    return;
                }
                _ => {
                    // Power transitions: discard.
                }
            }
        }
    }

    /// Returns true when a driver was installed and the state moved on.
    fn identify_line(&mut self, line: &str) -> bool {
        // Skip terminators, command echo and unsolicited result codes;
        // anything else is the model string.
        if line == "OK"
            || line == "ERROR"
            || line == "RDY"
            || line.starts_with("AT")
            || line.starts_with('+')
            || line.starts_with('*')
        {
            return false;
        }
        let spec = driver::identify(line).unwrap_or_else(|| {
            warn!("modem: unrecognized model '{line}', using auto driver");
            // The registry always carries the auto fallback.
            driver::by_name("auto").unwrap_or(&driver::registry()[0])
        });
        self.model = line.to_string();
        self.install_driver(spec);
        self.set_state(ModemState::PoweredOn);
        true
    }

    fn install_driver(&mut self, spec: &driver::DriverSpec) {
        info!("modem: installing driver {}", spec.name);
        self.driver = Some((spec.make)());
        self.signal(Event::ModemInstalled);
    }

    fn drain_mux_channels(&mut self) {
        let map = self.channel_map();
        // In network mode the data channel carries PPP payload, not
        // AT lines.
        if self.state == ModemState::NetMode {
            let mut tmp = [0u8; 256];
            loop {
                let n = match &mut self.mux {
                    Some(m) => m.drain(map.data, &mut tmp),
                    None => 0,
                };
                if n == 0 {
                    break;
                }
                self.ppp.on_rx(n);
            }
        }
        for dlci in 0..map.count {
            if dlci == map.data && self.state == ModemState::NetMode {
                continue;
            }
            loop {
                let line = match &mut self.mux {
                    Some(m) => m.read_line(dlci),
                    // A line handler may have torn the mux down.
                    None => return,
                };
                let Some(line) = line else { break };
                if line.is_empty() {
                    continue;
                }
                if dlci == map.nmea && (line.starts_with("$G") || line.starts_with("+CGNSS")) {
                    self.nmea.sentence(&line);
                } else {
                    self.standard_line_handler(dlci, &line);
                }
            }
        }
    }

    // -----------------------------------------------------------------
    // Mux management
    // -----------------------------------------------------------------

    pub(crate) fn channel_map(&self) -> MuxChannelMap {
        self.driver
            .as_ref()
            .map_or(driver::DEFAULT_CHANNELS, |d| d.channels())
    }

    fn start_mux(&mut self) {
        let map = self.channel_map();
        let mut mux = Mux::new(map.count);
        mux.mark_started();
        self.mux = Some(mux);
        // 07.10 entry, then open every channel.
        self.uart_write(b"AT+CMUX=0\r\n");
        for dlci in 0..map.count {
            let frame = Mux::sabm(dlci);
            self.uart_write(&frame);
        }
    }

    fn resend_mux_opens(&mut self) {
        let map = self.channel_map();
        let mut frames = Vec::new();
        if let Some(mux) = &self.mux {
            for dlci in 0..map.count {
                if !mux.is_open(dlci) {
                    frames.extend(Mux::sabm(dlci));
                }
            }
        }
        if !frames.is_empty() {
            self.uart_write(&frames);
        }
    }

    fn stop_mux(&mut self) {
        self.gps.force_down();
        let Some(mux) = self.mux.take() else { return };
        let mut frames = Vec::new();
        for dlci in 0..mux.channel_count() {
            if mux.is_open(dlci) {
                frames.extend(Mux::disc(dlci));
            }
        }
        if !frames.is_empty() {
            self.uart_write(&frames);
        }
        self.buffer.clear();
    }

    // -----------------------------------------------------------------
    // Transmit paths
    // -----------------------------------------------------------------

    fn uart_write(&mut self, data: &[u8]) {
        let mut off = 0;
        while off < data.len() {
            match self.uart.write(&data[off..]) {
                Ok(n) => off += n,
                Err(TransportError::WouldBlock) => {
                    self.err_tx_stalls += 1;
                    warn!("modem: uart tx stalled, {} bytes dropped", data.len() - off);
                    return;
                }
                Err(e) => {
                    warn!("modem: uart write failed: {e}");
                    return;
                }
            }
        }
    }

    /// Command on whichever path is live: the mux command channel once
    /// multiplexed, the raw UART before that.
    fn txcmd(&mut self, data: &[u8]) {
        if self.mux.as_ref().is_some_and(Mux::is_started) {
            let ch = self.channel_map().cmd;
            self.muxtx(ch, data);
        } else {
            self.tx(data);
        }
    }

    fn send_status_poll(&mut self) {
        let poll = self
            .driver
            .as_ref()
            .map_or(&b"AT+CREG?;+CGREG?;+CEREG?;+CSQ;+COPS?\r\n"[..], |d| {
                d.status_poll()
            })
            .to_vec();
        let ch = self.channel_map().poll;
        self.muxtx(ch, &poll);
    }

    // -----------------------------------------------------------------
    // GPS
    // -----------------------------------------------------------------

    fn apply_gps(&mut self, action: GpsAction) {
        let cmd = match action {
            GpsAction::Start => self
                .driver
                .as_ref()
                .map_or(&b"AT+CGPS=1\r\n"[..], |d| d.gps_start_commands()),
            GpsAction::Stop => self
                .driver
                .as_ref()
                .map_or(&b"AT+CGPS=0\r\n"[..], |d| d.gps_stop_commands()),
        }
        .to_vec();
        self.txcmd(&cmd);
        self.signal(match action {
            GpsAction::Start => Event::GpsStarted,
            GpsAction::Stop => Event::GpsStopped,
        });
    }

    pub fn set_gps_usermode(&mut self, mode: GpsUserMode) {
        if let Some(a) = self.gps.set_usermode(mode) {
            self.apply_gps(a);
        }
    }

    /// Vehicle power state drives the GPS park-pause schedule.
    pub fn on_input(&mut self, event: InputEvent) {
        if let Some(a) = self.gps.on_input(event) {
            self.apply_gps(a);
        }
    }

    // -----------------------------------------------------------------
    // Command and SMS API
    // -----------------------------------------------------------------

    /// Start an AT command on the command channel.  Fails fast with
    /// `ChannelInUse` while a previous command is outstanding; poll
    /// [`Modem::poll_command`] for the outcome.
    pub fn send_command(&mut self, command: &str, timeout_secs: u32) -> Result<(), Error> {
        if !self.is_powered() {
            return Err(ModemError::NotReady.into());
        }
        self.cmd.begin(timeout_secs).map_err(Error::Command)?;
        let mut wire = command.as_bytes().to_vec();
        if !command.ends_with('\n') {
            wire.extend_from_slice(b"\r\n");
        }
        self.txcmd(&wire);
        Ok(())
    }

    /// Outcome of the command started by [`Modem::send_command`], once
    /// terminated or timed out.
    pub fn poll_command(&mut self) -> Option<Result<String, CommandError>> {
        self.cmd.take_output()
    }

    /// Send a text-mode SMS.
    pub fn send_sms(&mut self, number: &str, body: &str) -> Result<(), Error> {
        if !self.config.enable_sms {
            return Err(Error::Config("modem.enable_sms is off"));
        }
        if !self.is_powered() {
            return Err(ModemError::NotReady.into());
        }
        let header = format!("AT+CMGS=\"{number}\"\r\n");
        self.txcmd(header.as_bytes());
        let mut payload = body.as_bytes().to_vec();
        payload.push(0x1A);
        self.txcmd(&payload);
        Ok(())
    }

    // -----------------------------------------------------------------
    // Hooks used by the line parser
    // -----------------------------------------------------------------

    pub(crate) fn emit(&mut self, event: Event) {
        self.signal(event);
    }

    pub(crate) fn cmd_channel(&self) -> u8 {
        self.channel_map().cmd
    }

    pub(crate) fn data_channel(&self) -> u8 {
        self.channel_map().data
    }

    pub(crate) fn cmd_exchange(&mut self) -> &mut CommandExchange {
        &mut self.cmd
    }

    pub(crate) fn netstart_sentinel(&mut self, value: u8) {
        self.userdata = value;
    }

    pub(crate) fn netstart_pending(&self) -> bool {
        self.userdata == UD_STARTING
    }

    pub(crate) fn update_netreg(&mut self, domain: RegDomain, value: NetReg) {
        self.netreg[domain as usize] = value;
        let overall = self
            .netreg
            .iter()
            .copied()
            .max()
            .unwrap_or(NetReg::Unknown);
        if overall != self.netreg_overall {
            info!(
                "modem: registration {} -> {overall}",
                self.netreg_overall
            );
            self.netreg_overall = overall;
            if !overall.is_registered()
                && matches!(self.state, ModemState::NetMode | ModemState::NetStart)
            {
                self.userdata = UD_LOST;
            }
        }
    }
}

impl<T: Transport> ModemControl for Modem<T> {
    fn tx(&mut self, data: &[u8]) {
        self.uart_write(data);
    }

    fn muxtx(&mut self, channel: u8, data: &[u8]) {
        if self.mux.is_none() {
            debug!("modem: muxtx with mux down, dropping");
            return;
        }
        let wire = Mux::encode(channel, data);
        self.uart_write(&wire);
    }

    fn config(&self) -> &ModemConfig {
        &self.config
    }
}
