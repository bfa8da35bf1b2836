//! Modem controller lifecycle, end to end over a scripted UART.
//!
//! Drives the full power-on sequence the way the integrator would:
//! `start()`, one `on_ticker()` per simulated second, `poll_uart()`
//! whenever the script has bytes, and assertions on emitted events.

use std::cell::RefCell;
use std::rc::Rc;

use vmlink::config::ModemConfig;
use vmlink::events::{Event, EventSink};
use vmlink::modem::mux::Mux;
use vmlink::modem::{Modem, ModemState, NetReg, NullPower, MUX_STALE_SECS};
use vmlink::transport::ScriptedTransport;

struct SharedSink(Rc<RefCell<Vec<Event>>>);

impl EventSink for SharedSink {
    fn signal(&mut self, event: Event) {
        self.0.borrow_mut().push(event);
    }
}

type Events = Rc<RefCell<Vec<Event>>>;

fn modem(config: ModemConfig) -> (Modem<ScriptedTransport>, Events) {
    let events: Events = Rc::new(RefCell::new(Vec::new()));
    let m = Modem::new(
        ScriptedTransport::new(),
        config,
        Box::new(NullPower),
        Box::new(SharedSink(events.clone())),
    );
    (m, events)
}

fn data_config() -> ModemConfig {
    ModemConfig {
        apn: "internet".to_string(),
        ..ModemConfig::default()
    }
}

fn feed(m: &mut Modem<ScriptedTransport>, line: &str) {
    m.uart_mut().feed(line.as_bytes());
    m.uart_mut().feed(b"\r\n");
    m.poll_uart();
}

fn feed_mux(m: &mut Modem<ScriptedTransport>, dlci: u8, line: &str) {
    let mut payload = line.as_bytes().to_vec();
    payload.extend_from_slice(b"\r\n");
    m.uart_mut().feed(&Mux::encode(dlci, &payload));
    m.poll_uart();
}

fn ticks(m: &mut Modem<ScriptedTransport>, n: u32) {
    for _ in 0..n {
        m.on_ticker();
    }
}

/// The SIM7600 driver's channel layout: 0 ctrl, 1 NMEA, 2 data,
/// 3 poll, 4 command.
const CHANNELS: u8 = 5;
const POLL: u8 = 3;
const DATA: u8 = 2;

/// Bring a fresh modem all the way to a connected data session.
fn bring_up(m: &mut Modem<ScriptedTransport>) {
    m.start();
    feed(m, "RDY");
    assert_eq!(m.state(), ModemState::Identify);
    feed(m, "SIM7600G-H");
    assert_eq!(m.state(), ModemState::PoweredOn);
    ticks(m, 20);
    assert_eq!(m.state(), ModemState::MuxStart);
    for dlci in 0..CHANNELS {
        m.uart_mut().feed(&Mux::ua(dlci));
    }
    m.poll_uart();
    m.on_ticker();
    assert_eq!(m.state(), ModemState::NetWait);
    feed_mux(m, POLL, "+CREG: 1,1");
    ticks(m, 5);
    assert_eq!(m.state(), ModemState::NetStart);
    feed_mux(m, DATA, "CONNECT");
    m.on_ticker();
    assert_eq!(m.state(), ModemState::NetMode);
}

#[test]
fn events_flow_through_the_static_channel() {
    use vmlink::events::{ChannelSink, EVENT_CHANNEL};

    let mut m = Modem::new(
        ScriptedTransport::new(),
        data_config(),
        Box::new(NullPower),
        Box::new(ChannelSink),
    );
    m.start();
    m.stop();

    let mut names = Vec::new();
    while let Ok(e) = EVENT_CHANNEL.try_receive() {
        names.push(e.name());
    }
    assert_eq!(
        names,
        vec![
            "system.modem.poweringon",
            "system.modem.stop",
            "system.modem.poweringoff",
        ]
    );
}

#[test]
fn power_on_to_data_session_emits_ordered_events() {
    let (mut m, events) = modem(data_config());
    bring_up(&mut m);

    assert!(m.data_connected());
    assert_eq!(m.netreg(), NetReg::RegisteredHome);

    let names: Vec<&str> = events.borrow().iter().map(Event::name).collect();
    assert_eq!(
        names,
        vec![
            "system.modem.poweringon",
            "system.modem.installed",
            "system.modem.poweredon",
            "system.modem.muxstart",
            "system.modem.netwait",
            "system.modem.netstart",
            "system.modem.netmode",
        ]
    );
}

#[test]
fn powered_on_init_configures_sms_and_registration_urcs() {
    let (mut m, _) = modem(data_config());
    m.start();
    feed(&mut m, "RDY");
    feed(&mut m, "SIM7600G-H");
    m.uart_mut().take_outgoing();
    ticks(&mut m, 12);
    let out = String::from_utf8_lossy(&m.uart_mut().take_outgoing()).to_string();
    assert!(out.contains("+CREG=1;+CGREG=1;+CEREG=1"));
    assert!(out.contains("+CNMI=1,2,0,0,0"));
    assert!(out.contains("+ICCID"));
    assert!(out.contains("+COPS?"));
}

#[test]
fn shutdown_verifies_power_off_before_declaring_off() {
    let (mut m, events) = modem(data_config());
    bring_up(&mut m);

    m.stop();
    assert_eq!(m.state(), ModemState::PoweringOff);
    // Power-down command went out on the mux before teardown.
    let out = m.uart_mut().take_outgoing();
    assert!(!out.is_empty());

    // No confirmation: fall back to probing the power state.
    ticks(&mut m, 20);
    assert_eq!(m.state(), ModemState::CheckPowerOff);
    ticks(&mut m, 15);
    assert_eq!(m.state(), ModemState::PoweredOff);

    let names: Vec<&str> = events.borrow().iter().map(Event::name).collect();
    assert!(names.contains(&"system.modem.stop"));
    assert_eq!(names.last(), Some(&"system.modem.poweredoff"));
}

#[test]
fn mux_that_never_opens_times_out_to_power_cycle() {
    let (mut m, _) = modem(data_config());
    m.start();
    feed(&mut m, "RDY");
    feed(&mut m, "SIM7600G-H");
    ticks(&mut m, 20);
    assert_eq!(m.state(), ModemState::MuxStart);
    // No UA ever arrives.
    ticks(&mut m, 120);
    assert_eq!(m.state(), ModemState::PoweringOn);
}

#[test]
fn stale_link_watchdog_restarts_connected_stack() {
    let (mut m, _) = modem(data_config());
    bring_up(&mut m);
    ticks(&mut m, MUX_STALE_SECS);
    assert_eq!(m.state(), ModemState::PoweringOn);
    assert!(!m.data_connected());
}

#[test]
fn third_consecutive_loss_forces_power_cycle() {
    let (mut m, _) = modem(data_config());
    bring_up(&mut m);

    // Loss 1: NetMode -> NetLoss -> (10s) -> NetWait -> NetStart.
    feed_mux(&mut m, 0, "+PPPD: DISCONNECTED");
    m.on_ticker();
    assert_eq!(m.state(), ModemState::NetLoss);
    ticks(&mut m, 10);
    assert_eq!(m.state(), ModemState::NetWait);
    ticks(&mut m, 5);
    assert_eq!(m.state(), ModemState::NetStart);

    // Loss 2, before the session ever comes back up.
    feed_mux(&mut m, 0, "+PPPD: DISCONNECTED");
    m.on_ticker();
    assert_eq!(m.state(), ModemState::NetLoss);
    ticks(&mut m, 10);
    ticks(&mut m, 5);
    assert_eq!(m.state(), ModemState::NetStart);

    // Loss 3: the retry budget is spent, short fuse to PowerOffOn.
    feed_mux(&mut m, 0, "+PPPD: DISCONNECTED");
    m.on_ticker();
    assert_eq!(m.state(), ModemState::NetLoss);
    ticks(&mut m, 3);
    assert_eq!(m.state(), ModemState::PowerOffOn);

    // And the budget is fresh after the power cycle.
    ticks(&mut m, 3);
    assert_eq!(m.state(), ModemState::PoweringOn);
}

#[test]
fn reaching_netmode_resets_loss_budget() {
    let (mut m, _) = modem(data_config());
    bring_up(&mut m);

    for _ in 0..2 {
        feed_mux(&mut m, 0, "+PPPD: DISCONNECTED");
        m.on_ticker();
        assert_eq!(m.state(), ModemState::NetLoss);
        ticks(&mut m, 10);
        ticks(&mut m, 5);
        assert_eq!(m.state(), ModemState::NetStart);
        feed_mux(&mut m, DATA, "CONNECT");
        m.on_ticker();
        assert_eq!(m.state(), ModemState::NetMode);
    }

    // Two more losses still stay on the reconnect path.
    feed_mux(&mut m, 0, "+PPPD: DISCONNECTED");
    m.on_ticker();
    ticks(&mut m, 10);
    assert_eq!(m.state(), ModemState::NetWait);
}

#[test]
fn netwait_without_apn_parks_in_nethold() {
    let (mut m, events) = modem(ModemConfig::default());
    m.start();
    feed(&mut m, "RDY");
    feed(&mut m, "SIM7600G-H");
    ticks(&mut m, 20);
    for dlci in 0..CHANNELS {
        m.uart_mut().feed(&Mux::ua(dlci));
    }
    m.poll_uart();
    ticks(&mut m, 2);
    assert_eq!(m.state(), ModemState::NetHold);
    let names: Vec<&str> = events.borrow().iter().map(Event::name).collect();
    assert!(names.contains(&"system.modem.nethold"));
}
