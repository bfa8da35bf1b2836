//! Property tests for the invariants that must hold for arbitrary
//! input: the mux decoder and the SCP sink never panic on byte soup,
//! framing is split-invariant, registration folding is
//! order-insensitive, and timed states always land on their fallback
//! target.

use proptest::prelude::*;

use vmlink::config::{ModemConfig, SshConfig};
use vmlink::events::RecordingSink;
use vmlink::modem::mux::{Mux, FLAG};
use vmlink::modem::{csq_to_dbm, Modem, ModemState, NetReg, NullPower};
use vmlink::scp::vfs::MemFs;
use vmlink::scp::{NullCommandPort, ScpSession, SessionRequest};
use vmlink::transport::ScriptedTransport;

fn modem(config: ModemConfig) -> Modem<ScriptedTransport> {
    Modem::new(
        ScriptedTransport::new(),
        config,
        Box::new(NullPower),
        Box::new(RecordingSink::new()),
    )
}

proptest! {
    /// Arbitrary bytes through the mux decoder: no panic, and after a
    /// flag flush the next well-formed frame decodes.
    #[test]
    fn mux_decoder_survives_byte_soup(
        soup in proptest::collection::vec(any::<u8>(), 0..512),
    ) {
        let mut mux = Mux::new(4);
        mux.process(&soup);
        // Garbage can leave the decoder mid-payload; a run of flag
        // bytes longer than the maximum frame drains any such state.
        mux.process(&[FLAG; 256]);
        let good = mux.good_frames;
        mux.process(&Mux::encode(1, b"OK\r\n"));
        prop_assert!(mux.good_frames > good, "decoder failed to resync");
    }

    /// Frame decoding is invariant under arbitrary read chunking.
    #[test]
    fn mux_decoding_is_chunking_invariant(
        payload in "[ -~]{1,40}",
        cuts in proptest::collection::vec(0usize..64, 0..8),
    ) {
        let mut line = payload.clone();
        line.push_str("\r\n");
        let wire = Mux::encode(2, line.as_bytes());

        let mut offsets: Vec<usize> =
            cuts.iter().map(|c| c % wire.len()).collect();
        offsets.sort_unstable();
        offsets.dedup();

        let mut mux = Mux::new(4);
        let mut start = 0;
        for off in offsets {
            mux.process(&wire[start..off]);
            start = off;
        }
        mux.process(&wire[start..]);
        prop_assert_eq!(mux.read_line(2), Some(payload));
    }

    /// Overall registration is the best of the three domains, no
    /// matter in which order the URCs arrive.
    #[test]
    fn registration_folding_is_order_insensitive(perm in 0usize..6) {
        const LINES: [&str; 3] = ["+CREG: 1,0", "+CGREG: 1,5", "+CEREG: 1,2"];
        const ORDERS: [[usize; 3]; 6] = [
            [0, 1, 2],
            [0, 2, 1],
            [1, 0, 2],
            [1, 2, 0],
            [2, 0, 1],
            [2, 1, 0],
        ];
        let mut m = modem(ModemConfig::default());
        m.set_state(ModemState::PoweredOn);
        for &i in &ORDERS[perm] {
            m.uart_mut().feed(LINES[i].as_bytes());
            m.uart_mut().feed(b"\r\n");
            m.poll_uart();
        }
        prop_assert_eq!(m.netreg(), NetReg::RegisteredRoaming);
        prop_assert!(m.netreg().is_registered());
    }

    /// A silent modem in a timed state lands exactly on its fallback
    /// target, and never leaves before the deadline.
    #[test]
    fn timed_states_land_on_fallback(early in 1u32..10) {
        let table = [
            (ModemState::CheckPowerOff, 15, ModemState::PoweredOff),
            (ModemState::Identify, 30, ModemState::PowerOffOn),
            (ModemState::NetStart, 30, ModemState::PowerOffOn),
            (ModemState::PoweringOff, 20, ModemState::CheckPowerOff),
            (ModemState::NetLoss, 10, ModemState::NetWait),
        ];
        for (state, secs, fallback) in table {
            let mut m = modem(ModemConfig {
                apn: "internet".to_string(),
                ..ModemConfig::default()
            });
            m.set_state(state);
            for _ in 0..early.min(secs - 1) {
                m.on_ticker();
            }
            prop_assert_eq!(m.state(), state, "left {:?} early", state);
            for _ in early.min(secs - 1)..secs {
                m.on_ticker();
            }
            prop_assert_eq!(m.state(), fallback, "wrong fallback for {:?}", state);
        }
    }

    /// The SCP sink never panics on arbitrary channel input, and never
    /// holds more than the one file it is currently receiving.
    #[test]
    fn scp_sink_survives_byte_soup(
        soup in proptest::collection::vec(any::<u8>(), 0..256),
        chunk in 1usize..64,
    ) {
        let mut fs = MemFs::new();
        fs.put_dir("/store");
        let config = SshConfig::default();
        let mut s = ScpSession::new(
            ScriptedTransport::new(),
            &config,
            Box::new(NullCommandPort),
        );
        s.accept(&SessionRequest::Exec("scp -r -t /store".to_string()), &mut fs);
        for part in soup.chunks(chunk) {
            s.channel_mut().feed(part);
            s.on_readable(&mut fs);
            prop_assert!(fs.open_handles() <= 1);
        }
        if s.is_closed() {
            prop_assert_eq!(fs.open_handles(), 0);
        }
    }

    /// Signal conversion stays inside the 3GPP dBm range.
    #[test]
    fn csq_conversion_is_bounded(csq in any::<u8>()) {
        match csq_to_dbm(csq) {
            Some(dbm) => {
                prop_assert!(csq <= 31);
                prop_assert!((-113..=-51).contains(&dbm));
            }
            None => prop_assert!(csq > 31),
        }
    }
}
