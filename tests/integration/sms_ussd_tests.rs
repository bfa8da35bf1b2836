//! SMS / USSD handling and the command channel, through the public
//! modem API.

use std::cell::RefCell;
use std::rc::Rc;

use vmlink::config::ModemConfig;
use vmlink::error::{CommandError, Error};
use vmlink::events::{Event, EventSink};
use vmlink::modem::{Modem, ModemState, NullPower};
use vmlink::transport::ScriptedTransport;

struct SharedSink(Rc<RefCell<Vec<Event>>>);

impl EventSink for SharedSink {
    fn signal(&mut self, event: Event) {
        self.0.borrow_mut().push(event);
    }
}

type Events = Rc<RefCell<Vec<Event>>>;

/// A modem sitting in PoweredOn, where URCs arrive on the raw UART.
fn powered_on(config: ModemConfig) -> (Modem<ScriptedTransport>, Events) {
    let events: Events = Rc::new(RefCell::new(Vec::new()));
    let mut m = Modem::new(
        ScriptedTransport::new(),
        config,
        Box::new(NullPower),
        Box::new(SharedSink(events.clone())),
    );
    m.set_state(ModemState::PoweredOn);
    m.uart_mut().take_outgoing();
    events.borrow_mut().clear();
    (m, events)
}

fn feed(m: &mut Modem<ScriptedTransport>, line: &str) {
    m.uart_mut().feed(line.as_bytes());
    m.uart_mut().feed(b"\r\n");
    m.poll_uart();
}

const SMS_HEADER: &str =
    "+CMT: \"+31612345678\",\"\",\"26/08/30,14:00:00+08\",145,36,0,0,\"+31653\",145,";

#[test]
fn multiline_sms_delivers_exactly_one_event() {
    let (mut m, events) = powered_on(ModemConfig::default());
    feed(&mut m, &format!("{SMS_HEADER}12"));
    feed(&mut m, "first");
    feed(&mut m, "second");
    let events = events.borrow();
    assert_eq!(events.len(), 1);
    match &events[0] {
        Event::ReceivedSms {
            sender,
            timestamp,
            body,
        } => {
            assert_eq!(sender, "+31612345678");
            assert_eq!(timestamp, "26/08/30,14:00:00+08");
            assert_eq!(body, "first\nsecond");
        }
        other => panic!("unexpected event {other:?}"),
    }
}

#[test]
fn back_to_back_sms_deliveries_stay_separate() {
    let (mut m, events) = powered_on(ModemConfig::default());
    feed(&mut m, &format!("{SMS_HEADER}3"));
    feed(&mut m, "one");
    feed(&mut m, &format!("{SMS_HEADER}3"));
    feed(&mut m, "two");
    let events = events.borrow();
    assert_eq!(events.len(), 2);
}

#[test]
fn ussd_response_spanning_lines_is_one_event() {
    let (mut m, events) = powered_on(ModemConfig::default());
    feed(&mut m, "+CUSD: 0,\"Your balance:");
    feed(&mut m, "5 EUR\",15");
    let events = events.borrow();
    assert_eq!(events.len(), 1);
    assert_eq!(
        events[0],
        Event::ReceivedUssd {
            text: "Your balance:\n5 EUR".to_string()
        }
    );
}

#[test]
fn outbound_sms_is_terminated_with_ctrl_z() {
    let (mut m, _) = powered_on(ModemConfig::default());
    m.send_sms("+31612345678", "on my way").unwrap();
    let out = m.uart_mut().take_outgoing();
    let text = String::from_utf8_lossy(&out).to_string();
    assert!(text.contains("AT+CMGS=\"+31612345678\""));
    assert!(text.contains("on my way"));
    assert_eq!(out.last(), Some(&0x1A));
}

#[test]
fn command_channel_is_exclusive_until_collected() {
    let (mut m, _) = powered_on(ModemConfig::default());
    m.send_command("AT+COPS?", 10).unwrap();
    assert_eq!(
        m.send_command("AT+CSQ", 10),
        Err(Error::Command(CommandError::ChannelInUse))
    );
    feed(&mut m, "+COPS: 0,0,\"Vodafone NL\",7");
    feed(&mut m, "OK");
    let out = m.poll_command().unwrap().unwrap();
    assert!(out.contains("Vodafone NL"));
    assert!(out.ends_with("OK\n"));
    // Collected: the channel is free again.
    assert!(m.send_command("AT+CSQ", 10).is_ok());
}

#[test]
fn pin_flow_locks_out_after_rejection() {
    let (mut m, events) = powered_on(ModemConfig {
        pincode: "0000".to_string(),
        ..ModemConfig::default()
    });
    feed(&mut m, "+CPIN: SIM PIN");
    let out = String::from_utf8_lossy(&m.uart_mut().take_outgoing()).to_string();
    assert!(out.contains("AT+CPIN=\"0000\""));

    feed(&mut m, "+CME ERROR: incorrect password");
    // The next PIN request must not retry the rejected code.
    feed(&mut m, "+CPIN: SIM PIN");
    let out = String::from_utf8_lossy(&m.uart_mut().take_outgoing()).to_string();
    assert!(!out.contains("AT+CPIN="));
    let names: Vec<&str> = events.borrow().iter().map(Event::name).collect();
    assert!(names.contains(&"system.modem.wrongpincode"));
}
