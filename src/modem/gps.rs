//! GPS park-pause scheduling.
//!
//! When the vehicle switches off, keeping the GNSS engine powered
//! drains the 12V battery, so the scheduler can pause it after a
//! configurable delay and periodically reactivate it to refresh the
//! parked position.  A user override (`Start`/`Stop`) wins over both
//! the config enable flag and the automatic schedule.
//!
//! The scheduler itself never touches the modem; `tick` and the input
//! handlers return [`GpsAction`]s the controller turns into channel
//! commands and events.

use log::debug;

use crate::config::ModemConfig;
use crate::events::InputEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GpsUserMode {
    /// Follow the config flag and the park schedule.
    #[default]
    Default,
    /// Force the receiver on.
    Start,
    /// Force the receiver off.
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GpsAction {
    Start,
    Stop,
}

#[derive(Default)]
pub struct GpsScheduler {
    enabled: bool,
    usermode: GpsUserMode,
    pause_secs: u32,
    reactivate_secs: u32,
    reactlock_secs: u32,
    vehicle_on: bool,
    running: bool,
    /// Countdown to pausing the receiver after the vehicle parks.
    stop_ticker: u32,
    /// Countdown to a parked position refresh.
    start_ticker: u32,
}

impl GpsScheduler {
    pub fn new(config: &ModemConfig) -> Self {
        let mut s = Self::default();
        s.configure(config);
        s
    }

    pub fn configure(&mut self, config: &ModemConfig) {
        self.enabled = config.enable_gps;
        self.pause_secs = config.gps_park_pause_secs;
        self.reactivate_secs = config.gps_park_reactivate_mins * 60;
        self.reactlock_secs = config.gps_park_reactlock_mins * 60;
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn usermode(&self) -> GpsUserMode {
        self.usermode
    }

    fn wanted(&self) -> bool {
        match self.usermode {
            GpsUserMode::Start => true,
            GpsUserMode::Stop => false,
            GpsUserMode::Default => self.enabled,
        }
    }

    fn apply(&mut self, want: bool) -> Option<GpsAction> {
        if want == self.running {
            return None;
        }
        self.running = want;
        Some(if want { GpsAction::Start } else { GpsAction::Stop })
    }

    /// Session start decision when the modem reaches a network state.
    pub fn on_session_ready(&mut self) -> Option<GpsAction> {
        self.apply(self.wanted())
    }

    /// The mux link went away; the receiver is gone with it.  Clears
    /// the running flag without an action so the next session ready
    /// re-starts cleanly.
    pub fn force_down(&mut self) {
        self.running = false;
        self.stop_ticker = 0;
        self.start_ticker = 0;
    }

    pub fn set_usermode(&mut self, mode: GpsUserMode) -> Option<GpsAction> {
        self.usermode = mode;
        self.stop_ticker = 0;
        self.start_ticker = 0;
        self.apply(self.wanted())
    }

    pub fn on_input(&mut self, event: InputEvent) -> Option<GpsAction> {
        match event {
            InputEvent::VehicleOn | InputEvent::VehicleAwake => {
                self.vehicle_on = true;
                self.stop_ticker = 0;
                self.start_ticker = 0;
                if self.usermode == GpsUserMode::Default {
                    return self.apply(self.wanted());
                }
            }
            InputEvent::VehicleOff => {
                self.vehicle_on = false;
                if self.usermode == GpsUserMode::Default
                    && self.running
                    && self.pause_secs > 0
                {
                    debug!("gps: parking, pause in {}s", self.pause_secs);
                    self.stop_ticker = self.pause_secs;
                }
            }
        }
        None
    }

    /// Once-per-second schedule tick.
    pub fn tick(&mut self) -> Option<GpsAction> {
        if self.usermode != GpsUserMode::Default || self.vehicle_on {
            return None;
        }
        if self.stop_ticker > 0 {
            self.stop_ticker -= 1;
            if self.stop_ticker == 0 {
                if self.reactivate_secs > 0 {
                    self.start_ticker = self.reactivate_secs;
                }
                return self.apply(false);
            }
        } else if self.start_ticker > 0 {
            self.start_ticker -= 1;
            if self.start_ticker == 0 {
                if self.reactlock_secs > 0 {
                    self.stop_ticker = self.reactlock_secs;
                }
                return self.apply(true);
            }
        }
        None
    }
}
