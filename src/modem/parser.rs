//! Unsolicited result code and response line parsing.
//!
//! Every complete line off the UART (or a mux channel) that is not
//! NMEA or PPP payload lands in [`Modem::standard_line_handler`].  It
//! feeds an in-flight command exchange, tracks declared-length SMS and
//! quote-delimited USSD bodies across lines, and interprets the URCs
//! the state machine depends on: registration, signal quality,
//! operator, SIM PIN state and data-session progress.

use log::{debug, info, trace, warn};

use crate::events::Event;
use crate::transport::Transport;

use super::{Modem, ModemState, NetReg, RegDomain};

/// Accumulated body cap; a runaway multi-line message is finalized
/// early rather than growing without bound.
const BODY_CAP: usize = 1000;

/// In-flight SMS delivery (`+CMT:` header seen, body incomplete).
pub struct SmsAccumulator {
    pub sender: String,
    pub timestamp: String,
    coding: u32,
    declared_len: usize,
    body: String,
}

/// Data coding scheme values 8..=11 (low nibble) are UCS-2.
fn is_ucs2(coding: u32) -> bool {
    (8..=11).contains(&(coding & 15))
}

/// Decode a UCS-2 big-endian hex body ("00480069" -> "Hi").
fn decode_ucs2_hex(hex: &str) -> String {
    let digits: Vec<u32> = hex.chars().filter_map(|c| c.to_digit(16)).collect();
    let units: Vec<u16> = digits
        .chunks_exact(4)
        .map(|d| ((d[0] << 12) | (d[1] << 8) | (d[2] << 4) | d[3]) as u16)
        .collect();
    String::from_utf16_lossy(&units)
}

/// Split a CSV parameter list, honoring double quotes.  Quotes are
/// stripped from the returned fields.
fn csv_fields(s: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut cur = String::new();
    let mut quoted = false;
    for c in s.chars() {
        match c {
            '"' => quoted = !quoted,
            ',' if !quoted => fields.push(core::mem::take(&mut cur)),
            _ => cur.push(c),
        }
    }
    fields.push(cur);
    fields
}

/// Registration code from a `+CREG?`/`+CGREG?`/`+CEREG?` response or
/// URC.  Query responses carry `<n>,<stat>`, URCs just `<stat>`, both
/// optionally followed by quoted location fields.
fn parse_reg_code(params: &str) -> Option<u32> {
    let numeric: Vec<u32> = params
        .split(',')
        .map(str::trim)
        .take_while(|f| !f.starts_with('"'))
        .filter_map(|f| f.parse().ok())
        .collect();
    match numeric.as_slice() {
        [] => None,
        [stat] => Some(*stat),
        [_n, stat, ..] => Some(*stat),
    }
}

fn reg_code_to_netreg(code: u32) -> NetReg {
    match code {
        0 => NetReg::NotRegistered,
        1 => NetReg::RegisteredHome,
        2 => NetReg::Searching,
        3 => NetReg::Denied,
        5 => NetReg::RegisteredRoaming,
        6 => NetReg::RegisteredHomeSms,
        7 => NetReg::RegisteredRoamingSms,
        8 => NetReg::RegisteredEmergencyServices,
        _ => NetReg::Unknown,
    }
}

/// First quoted string in a parameter list, e.g. the operator name in
/// a `+COPS?` response.
fn first_quoted(s: &str) -> Option<&str> {
    let start = s.find('"')? + 1;
    let len = s[start..].find('"')?;
    Some(&s[start..start + len])
}

impl<T: Transport> Modem<T> {
    pub(crate) fn standard_line_handler(&mut self, channel: u8, line: &str) {
        trace!("modem: rx[{channel}] {line}");

        // A declared-length SMS or quote-delimited USSD body spans
        // lines; collect it before any prefix dispatch.
        if self.sms.is_some() && !line.starts_with("+CMT:") {
            self.sms_body_line(line);
            return;
        }
        if self.ussd.is_some() {
            self.ussd_body_line(line);
            return;
        }

        // In-flight command output collection.  Before the mux is up
        // there is only one stream, so every line is command output.
        // The line is still interpreted below so URCs in the response
        // take effect.
        let cmd_path = self.mux.is_none() || channel == self.cmd_channel();
        if cmd_path && self.cmd_exchange().is_busy() {
            self.cmd_exchange().feed_line(line);
        }

        if line.starts_with("$G") || line.starts_with("+CGNSSINFO") {
            self.nmea.sentence(line);
        } else if line == "CONNECT" {
            if channel == self.data_channel() && self.netstart_pending() {
                self.netstart_sentinel(super::UD_CONNECTED);
            }
        } else if line.starts_with("+PPPD: DISCONNECTED")
            || (line == "NO CARRIER" && channel == self.data_channel())
        {
            if matches!(self.state, ModemState::NetStart | ModemState::NetMode) {
                info!("modem: data carrier lost");
                self.netstart_sentinel(super::UD_LOST);
            }
        } else if line == "ERROR" {
            if channel == self.data_channel() && self.netstart_pending() {
                warn!("modem: data session setup rejected");
                self.netstart_sentinel(super::UD_FAILED);
            }
        } else if let Some(params) = line.strip_prefix("+CSQ: ") {
            let csq = params
                .split(',')
                .next()
                .and_then(|f| f.trim().parse().ok())
                .unwrap_or(99);
            self.signal_csq = csq;
        } else if let Some(params) = line.strip_prefix("+CREG: ") {
            self.handle_reg(RegDomain::Gsm, params);
        } else if let Some(params) = line.strip_prefix("+CGREG: ") {
            self.handle_reg(RegDomain::Gprs, params);
        } else if let Some(params) = line.strip_prefix("+CEREG: ") {
            self.handle_reg(RegDomain::Eps, params);
        } else if let Some(params) = line.strip_prefix("+COPS: ") {
            if let Some(name) = first_quoted(params) {
                if self.provider != name {
                    info!("modem: operator '{name}'");
                    self.provider = name.to_string();
                }
            }
        } else if let Some(params) = line.strip_prefix("+CPSI: ") {
            // "<system>,<mode>,..." reduced to the first two fields.
            let fields = csv_fields(params);
            self.net_mode = fields
                .iter()
                .take(2)
                .map(String::as_str)
                .collect::<Vec<_>>()
                .join(",");
        } else if let Some(params) = line.strip_prefix("+ICCID: ") {
            self.iccid = params.trim().to_string();
        } else if let Some(params) = line.strip_prefix("+CGMR: ") {
            self.fw_version = params.trim().to_string();
        } else if let Some(params) = line.strip_prefix("+CPIN: ") {
            self.handle_cpin(params.trim());
        } else if let Some(params) = line.strip_prefix("+CME ERROR: ") {
            self.handle_cme(params.trim());
        } else if let Some(params) = line.strip_prefix("+CMT: ") {
            self.handle_sms_header(params);
        } else if let Some(params) = line.strip_prefix("+CUSD: ") {
            self.handle_ussd(params);
        } else {
            debug!("modem: unhandled line [{channel}] {line}");
        }
    }

    fn handle_reg(&mut self, domain: RegDomain, params: &str) {
        match parse_reg_code(params) {
            Some(code) => self.update_netreg(domain, reg_code_to_netreg(code)),
            None => warn!("modem: malformed registration line '{params}'"),
        }
    }

    fn handle_cpin(&mut self, status: &str) {
        match status {
            "READY" => {}
            "SIM PIN" => {
                if self.config.wrong_pincode {
                    warn!("modem: SIM asks for PIN but a wrong pincode is latched");
                    self.emit(Event::WrongPincode);
                } else if self.config.pincode.is_empty() {
                    warn!("modem: SIM asks for PIN, none configured");
                    self.emit(Event::PincodeRequired);
                } else {
                    info!("modem: unlocking SIM");
                    let cmd = format!("AT+CPIN=\"{}\"\r\n", self.config.pincode);
                    self.txcmd(cmd.as_bytes());
                }
            }
            "SIM PUK" => {
                warn!("modem: SIM is PUK locked");
                self.emit(Event::WrongPincode);
            }
            other => {
                warn!("modem: unexpected SIM state '{other}'");
            }
        }
    }

    fn handle_cme(&mut self, message: &str) {
        if message.contains("incorrect password") {
            // Latch, so the same wrong PIN is never retried into a
            // SIM lockout.
            warn!("modem: SIM rejected the configured pincode");
            self.config.wrong_pincode = true;
            self.emit(Event::WrongPincode);
        } else if message.contains("SIM not inserted") {
            self.emit(Event::SimNotInserted);
        } else {
            debug!("modem: +CME ERROR: {message}");
        }
    }

    // -----------------------------------------------------------------
    // SMS
    // -----------------------------------------------------------------

    fn handle_sms_header(&mut self, params: &str) {
        let fields = csv_fields(params);
        if fields.len() < 10 {
            warn!("modem: malformed SMS header ({} fields)", fields.len());
            return;
        }
        let coding = fields[6].trim().parse().unwrap_or(0);
        let declared_len = fields[9].trim().parse().unwrap_or(0);
        self.sms = Some(SmsAccumulator {
            sender: fields[0].clone(),
            timestamp: fields[2].clone(),
            coding,
            declared_len,
            body: String::new(),
        });
        if declared_len == 0 {
            self.finish_sms();
        }
    }

    fn sms_body_line(&mut self, line: &str) {
        let Some(sms) = &mut self.sms else { return };
        if !sms.body.is_empty() {
            sms.body.push('\n');
        }
        sms.body.push_str(line);
        if sms.body.len() >= sms.declared_len || sms.body.len() > BODY_CAP {
            self.finish_sms();
        }
    }

    fn finish_sms(&mut self) {
        let Some(sms) = self.sms.take() else { return };
        if !self.config.enable_sms {
            debug!("modem: SMS handling disabled, dropping message");
            return;
        }
        let body = if is_ucs2(sms.coding) {
            decode_ucs2_hex(&sms.body)
        } else {
            sms.body
        };
        info!("modem: SMS from {} ({} chars)", sms.sender, body.len());
        self.emit(Event::ReceivedSms {
            sender: sms.sender,
            timestamp: sms.timestamp,
            body,
        });
    }

    // -----------------------------------------------------------------
    // USSD
    // -----------------------------------------------------------------

    fn handle_ussd(&mut self, params: &str) {
        // +CUSD: <m>[,"<text>"[,<dcs>]]; the text may span lines.
        let Some(start) = params.find('"') else {
            debug!("modem: USSD result without text");
            return;
        };
        let rest = &params[start + 1..];
        match rest.find('"') {
            Some(end) => {
                let text = rest[..end].to_string();
                self.emit(Event::ReceivedUssd { text });
            }
            None => {
                self.ussd = Some(rest.to_string());
            }
        }
    }

    fn ussd_body_line(&mut self, line: &str) {
        let Some(text) = &mut self.ussd else { return };
        text.push('\n');
        match line.find('"') {
            Some(end) => {
                text.push_str(&line[..end]);
                let text = match self.ussd.take() {
                    Some(t) => t,
                    None => return,
                };
                self.emit(Event::ReceivedUssd { text });
            }
            None => {
                text.push_str(line);
                if text.len() > BODY_CAP {
                    warn!("modem: USSD text overflow, finalizing");
                    let text = match self.ussd.take() {
                        Some(t) => t,
                        None => return,
                    };
                    self.emit(Event::ReceivedUssd { text });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::testutil::*;
    use super::super::{csq_to_dbm, ModemState, NetReg};
    use super::*;
    use crate::config::ModemConfig;

    fn apn_config() -> ModemConfig {
        ModemConfig {
            apn: "internet".to_string(),
            ..ModemConfig::default()
        }
    }

    #[test]
    fn csq_line_updates_signal() {
        let mut m = muxed_modem(apn_config(), "SIM7600G-H");
        let poll = m.channel_map().poll;
        feed_mux_line(&mut m, poll, "+CSQ: 24,99");
        assert_eq!(m.status().signal_dbm, Some(-65));
        feed_mux_line(&mut m, poll, "+CSQ: 99,99");
        assert_eq!(m.status().signal_dbm, None);
    }

    #[test]
    fn creg_query_response_takes_second_field() {
        let mut m = muxed_modem(apn_config(), "SIM7600G-H");
        let poll = m.channel_map().poll;
        feed_mux_line(&mut m, poll, "+CREG: 1,5");
        assert_eq!(m.netreg(), NetReg::RegisteredRoaming);
    }

    #[test]
    fn creg_urc_with_location_takes_first_field() {
        let mut m = muxed_modem(apn_config(), "SIM7600G-H");
        let poll = m.channel_map().poll;
        feed_mux_line(&mut m, poll, "+CREG: 5,\"54DB\",\"0F6B\"");
        assert_eq!(m.netreg(), NetReg::RegisteredRoaming);
        feed_mux_line(&mut m, poll, "+CEREG: 0,1");
        assert_eq!(m.netreg(), NetReg::RegisteredHome);
    }

    #[test]
    fn registered_netwait_advances_to_netstart() {
        let mut m = muxed_modem(apn_config(), "SIM7600G-H");
        let poll = m.channel_map().poll;
        feed_mux_line(&mut m, poll, "+CREG: 1,1");
        ticks(&mut m, 5);
        assert_eq!(m.state(), ModemState::NetStart);
        let out = String::from_utf8_lossy(&m.uart.take_outgoing()).to_string();
        assert!(out.contains("AT+CGDCONT=1,\"IP\",\"internet\""));
        assert!(out.contains("+CGDATA=\"PPP\",1"));
    }

    #[test]
    fn connect_on_data_channel_reaches_netmode() {
        let mut m = muxed_modem(apn_config(), "SIM7600G-H");
        let (poll, data) = (m.channel_map().poll, m.channel_map().data);
        feed_mux_line(&mut m, poll, "+CREG: 1,1");
        ticks(&mut m, 5);
        assert_eq!(m.state(), ModemState::NetStart);
        feed_mux_line(&mut m, data, "CONNECT");
        m.on_ticker();
        assert_eq!(m.state(), ModemState::NetMode);
        assert!(m.data_connected());
    }

    #[test]
    fn error_during_netstart_forces_power_cycle() {
        let mut m = muxed_modem(apn_config(), "SIM7600G-H");
        let (poll, data) = (m.channel_map().poll, m.channel_map().data);
        feed_mux_line(&mut m, poll, "+CREG: 1,1");
        ticks(&mut m, 5);
        feed_mux_line(&mut m, data, "ERROR");
        m.on_ticker();
        assert_eq!(m.state(), ModemState::PowerOffOn);
    }

    #[test]
    fn pppd_disconnect_in_netmode_goes_to_netloss() {
        let mut m = muxed_modem(apn_config(), "SIM7600G-H");
        let (poll, data) = (m.channel_map().poll, m.channel_map().data);
        feed_mux_line(&mut m, poll, "+CREG: 1,1");
        ticks(&mut m, 5);
        feed_mux_line(&mut m, data, "CONNECT");
        m.on_ticker();
        assert_eq!(m.state(), ModemState::NetMode);
        // The data channel carries payload in NetMode; the disconnect
        // notice arrives on the control channel.
        feed_mux_line(&mut m, 0, "+PPPD: DISCONNECTED");
        m.on_ticker();
        assert_eq!(m.state(), ModemState::NetLoss);
        assert!(!m.data_connected());
    }

    #[test]
    fn cops_sets_provider() {
        let mut m = muxed_modem(apn_config(), "SIM7600G-H");
        feed_mux_line(&mut m, 0, "+COPS: 0,0,\"Vodafone NL\",7");
        assert_eq!(m.status().provider, "Vodafone NL");
    }

    #[test]
    fn iccid_and_firmware_versions_are_captured() {
        let mut m = muxed_modem(apn_config(), "SIM7600G-H");
        feed_mux_line(&mut m, 0, "+ICCID: 8931440300223344556");
        feed_mux_line(&mut m, 0, "+CGMR: LE20B04SIM7600M22");
        let status = m.status();
        assert_eq!(status.iccid, "8931440300223344556");
        assert_eq!(status.fw_version, "LE20B04SIM7600M22");
    }

    #[test]
    fn sim_pin_request_sends_configured_pin() {
        let (mut m, _events) = test_modem_with_events(ModemConfig {
            pincode: "1234".to_string(),
            ..ModemConfig::default()
        });
        m.set_state(ModemState::PoweredOn);
        m.uart.take_outgoing();
        feed_line(&mut m, "+CPIN: SIM PIN");
        let out = String::from_utf8_lossy(&m.uart.take_outgoing()).to_string();
        assert!(out.contains("AT+CPIN=\"1234\""));
    }

    #[test]
    fn wrong_pincode_latch_blocks_pin_retry() {
        let (mut m, events) = test_modem_with_events(ModemConfig {
            pincode: "1234".to_string(),
            ..ModemConfig::default()
        });
        m.set_state(ModemState::PoweredOn);
        feed_line(&mut m, "+CME ERROR: incorrect password");
        assert!(m.config.wrong_pincode);
        m.uart.take_outgoing();
        feed_line(&mut m, "+CPIN: SIM PIN");
        let out = String::from_utf8_lossy(&m.uart.take_outgoing()).to_string();
        assert!(!out.contains("AT+CPIN="));
        let names: Vec<&str> = events.borrow().iter().map(|e| e.name()).collect();
        assert_eq!(
            names
                .iter()
                .filter(|n| **n == "system.modem.wrongpincode")
                .count(),
            2
        );
    }

    #[test]
    fn missing_pincode_raises_required_event() {
        let (mut m, events) = test_modem_with_events(ModemConfig::default());
        m.set_state(ModemState::PoweredOn);
        feed_line(&mut m, "+CPIN: SIM PIN");
        assert!(events
            .borrow()
            .iter()
            .any(|e| e.name() == "system.modem.pincode_not_set"));
    }

    #[test]
    fn sim_not_inserted_raises_event() {
        let (mut m, events) = test_modem_with_events(ModemConfig::default());
        m.set_state(ModemState::PoweredOn);
        feed_line(&mut m, "+CME ERROR: SIM not inserted");
        assert!(events
            .borrow()
            .iter()
            .any(|e| e.name() == "system.modem.simnotinserted"));
    }

    #[test]
    fn single_line_sms_emits_one_event() {
        let (mut m, events) = test_modem_with_events(ModemConfig::default());
        m.set_state(ModemState::PoweredOn);
        feed_line(
            &mut m,
            "+CMT: \"+31612345678\",\"\",\"26/08/30,11:22:33+08\",145,36,0,0,\"+3165\",145,5",
        );
        feed_line(&mut m, "hello");
        let events = events.borrow();
        let sms: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                Event::ReceivedSms {
                    sender,
                    timestamp,
                    body,
                } => Some((sender.clone(), timestamp.clone(), body.clone())),
                _ => None,
            })
            .collect();
        assert_eq!(sms.len(), 1);
        assert_eq!(sms[0].0, "+31612345678");
        assert_eq!(sms[0].1, "26/08/30,11:22:33+08");
        assert_eq!(sms[0].2, "hello");
    }

    #[test]
    fn multiline_sms_accumulates_to_declared_length() {
        let (mut m, events) = test_modem_with_events(ModemConfig::default());
        m.set_state(ModemState::PoweredOn);
        // 12 chars: "first" + newline + "second".
        feed_line(
            &mut m,
            "+CMT: \"+31612345678\",\"\",\"26/08/30,11:22:33+08\",145,36,0,0,\"+3165\",145,12",
        );
        feed_line(&mut m, "first");
        assert!(events
            .borrow()
            .iter()
            .all(|e| !matches!(e, Event::ReceivedSms { .. })));
        feed_line(&mut m, "second");
        let events = events.borrow();
        let bodies: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                Event::ReceivedSms { body, .. } => Some(body.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(bodies, vec!["first\nsecond".to_string()]);
    }

    #[test]
    fn ucs2_sms_body_is_decoded() {
        let (mut m, events) = test_modem_with_events(ModemConfig::default());
        m.set_state(ModemState::PoweredOn);
        feed_line(
            &mut m,
            "+CMT: \"+31612345678\",\"\",\"26/08/30,11:22:33+08\",145,36,0,8,\"+3165\",145,8",
        );
        feed_line(&mut m, "00480069");
        let events = events.borrow();
        let sms = events
            .iter()
            .find_map(|e| match e {
                Event::ReceivedSms { body, .. } => Some(body.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(sms, "Hi");
    }

    #[test]
    fn disabled_sms_handling_drops_message() {
        let (mut m, events) = test_modem_with_events(ModemConfig {
            enable_sms: false,
            ..ModemConfig::default()
        });
        m.set_state(ModemState::PoweredOn);
        feed_line(
            &mut m,
            "+CMT: \"+31612345678\",\"\",\"26/08/30,11:22:33+08\",145,36,0,0,\"+3165\",145,5",
        );
        feed_line(&mut m, "hello");
        assert!(events
            .borrow()
            .iter()
            .all(|e| !matches!(e, Event::ReceivedSms { .. })));
    }

    #[test]
    fn single_line_ussd_emits_event() {
        let (mut m, events) = test_modem_with_events(ModemConfig::default());
        m.set_state(ModemState::PoweredOn);
        feed_line(&mut m, "+CUSD: 0,\"Your balance is 5 EUR\",15");
        let events = events.borrow();
        let texts: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                Event::ReceivedUssd { text } => Some(text.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(texts, vec!["Your balance is 5 EUR".to_string()]);
    }

    #[test]
    fn multiline_ussd_accumulates_until_closing_quote() {
        let (mut m, events) = test_modem_with_events(ModemConfig::default());
        m.set_state(ModemState::PoweredOn);
        feed_line(&mut m, "+CUSD: 0,\"Balance:");
        assert!(events
            .borrow()
            .iter()
            .all(|e| !matches!(e, Event::ReceivedUssd { .. })));
        feed_line(&mut m, "5 EUR\",15");
        let events = events.borrow();
        let texts: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                Event::ReceivedUssd { text } => Some(text.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(texts, vec!["Balance:\n5 EUR".to_string()]);
    }

    #[test]
    fn command_output_collected_through_mux() {
        let mut m = muxed_modem(apn_config(), "SIM7600G-H");
        m.send_command("AT+CSQ", 5).unwrap();
        let cmd = m.channel_map().cmd;
        feed_mux_line(&mut m, cmd, "+CSQ: 17,99");
        assert!(m.poll_command().is_none());
        feed_mux_line(&mut m, cmd, "OK");
        let out = m.poll_command().unwrap().unwrap();
        assert_eq!(out, "+CSQ: 17,99\nOK\n");
        // The URC side effect still lands.
        assert_eq!(m.status().signal_dbm, csq_to_dbm(17));
    }

    #[test]
    fn reg_code_parsing_variants() {
        assert_eq!(parse_reg_code("1"), Some(1));
        assert_eq!(parse_reg_code("1,5"), Some(5));
        assert_eq!(parse_reg_code("5,\"54DB\",\"0F6B\""), Some(5));
        assert_eq!(parse_reg_code("\"54DB\""), None);
        assert_eq!(parse_reg_code(""), None);
    }

    #[test]
    fn csv_fields_honor_quotes() {
        let f = csv_fields("\"a,b\",c,\"d\"");
        assert_eq!(f, vec!["a,b", "c", "d"]);
    }

    #[test]
    fn ucs2_decoding() {
        assert!(is_ucs2(8));
        assert!(is_ucs2(11));
        assert!(!is_ucs2(0));
        assert_eq!(decode_ucs2_hex("00480069"), "Hi");
        assert_eq!(decode_ucs2_hex(""), "");
    }
}
