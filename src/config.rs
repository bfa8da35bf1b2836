//! System configuration parameters
//!
//! All tunable parameters for the connectivity firmware.  Values can be
//! overridden from persistent storage by the integrator; the engines take
//! a snapshot at construction and re-read on explicit reload.

use serde::{Deserialize, Serialize};

/// Core system configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemConfig {
    pub modem: ModemConfig,
    pub ssh: SshConfig,
}

/// Cellular modem controller configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModemConfig {
    /// Driver selection; "auto" probes the model string at power-on.
    pub driver: String,
    /// Network access point name; empty means data networking stays held.
    pub apn: String,
    pub apn_user: String,
    pub apn_password: String,
    /// Allow SMS handling.
    pub enable_sms: bool,
    /// Allow data networking (mux + data session).
    pub enable_net: bool,
    /// Allow the GPS/NMEA channel.
    pub enable_gps: bool,
    /// SIM PIN, if the card needs one.  Empty means no PIN configured.
    pub pincode: String,
    /// Set when the modem rejected `pincode`; the PIN is never retried
    /// while this latch is up, to protect the SIM from lockout.
    pub wrong_pincode: bool,
    /// Preferred network type passed to the driver ("auto", "LTE", "GSM").
    pub net_type: String,
    /// Seconds after vehicle-off before GPS is paused (0 = never pause).
    pub gps_park_pause_secs: u32,
    /// While parked, reactivate GPS every this many minutes (0 = never).
    pub gps_park_reactivate_mins: u32,
    /// Minutes a park reactivation keeps GPS on before re-pausing.
    pub gps_park_reactlock_mins: u32,
}

/// SSH console / SCP transfer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshConfig {
    /// Path prefixes the SCP engine refuses to read or write.
    pub protected_paths: Vec<String>,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            modem: ModemConfig::default(),
            ssh: SshConfig::default(),
        }
    }
}

impl Default for ModemConfig {
    fn default() -> Self {
        Self {
            driver: "auto".to_string(),
            apn: String::new(),
            apn_user: String::new(),
            apn_password: String::new(),
            enable_sms: true,
            enable_net: true,
            enable_gps: false,
            pincode: String::new(),
            wrong_pincode: false,
            net_type: "auto".to_string(),
            gps_park_pause_secs: 0,
            gps_park_reactivate_mins: 0,
            gps_park_reactlock_mins: 0,
        }
    }
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            protected_paths: vec!["/store/syscfg".to_string()],
        }
    }
}
