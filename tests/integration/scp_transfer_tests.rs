//! SCP transfer scenarios driven through the public session API: a
//! scripted channel plays the remote `scp` client, an in-memory VFS
//! plays the flash filesystem.

use vmlink::config::SshConfig;
use vmlink::scp::vfs::MemFs;
use vmlink::scp::{CommandPort, NullCommandPort, ScpSession, SessionRequest};
use vmlink::transport::ScriptedTransport;

fn session() -> ScpSession<ScriptedTransport> {
    let config = SshConfig::default();
    ScpSession::new(ScriptedTransport::new(), &config, Box::new(NullCommandPort))
}

/// Ack the engine until the source run completes, collecting the wire.
fn drive_source(s: &mut ScpSession<ScriptedTransport>, fs: &mut MemFs) -> Vec<u8> {
    let mut wire = Vec::new();
    for _ in 0..64 {
        if s.is_closed() {
            break;
        }
        s.channel_mut().feed(&[0]);
        s.on_readable(fs);
        wire.extend(s.channel_mut().take_outgoing());
    }
    assert!(s.is_closed(), "source run did not finish");
    wire
}

#[test]
fn uploaded_file_lands_in_the_vfs() {
    let mut fs = MemFs::new();
    fs.put_dir("/store");
    let mut s = session();
    s.accept(&SessionRequest::Exec("scp -t /store".to_string()), &mut fs);
    assert_eq!(s.channel_mut().take_outgoing(), vec![0]);

    s.channel_mut().feed(b"C0644 11 notes.txt\n");
    s.on_readable(&mut fs);
    assert_eq!(s.channel_mut().take_outgoing(), vec![0]);

    s.channel_mut().feed(b"hello world");
    s.channel_mut().feed(&[0]);
    s.on_readable(&mut fs);
    assert_eq!(s.channel_mut().take_outgoing(), vec![0]);
    assert_eq!(fs.file_content("/store/notes.txt"), Some(&b"hello world"[..]));
    assert_eq!(fs.open_handles(), 0);
}

#[test]
fn recursive_upload_then_download_round_trips() {
    let mut fs = MemFs::new();
    fs.put_dir("/store");

    // Push a small tree.
    let mut up = session();
    up.accept(
        &SessionRequest::Exec("scp -r -t /store".to_string()),
        &mut fs,
    );
    up.channel_mut().take_outgoing();
    for part in [
        &b"D0755 0 logs\n"[..],
        b"C0644 3 a.txt\n",
        b"abc\0",
        b"C0644 4 b.txt\n",
        b"wxyz\0",
        b"E\n",
    ] {
        up.channel_mut().feed(part);
        up.on_readable(&mut fs);
    }
    assert!(fs.has_dir("/store/logs"));
    assert_eq!(fs.file_content("/store/logs/a.txt"), Some(&b"abc"[..]));
    assert_eq!(fs.file_content("/store/logs/b.txt"), Some(&b"wxyz"[..]));

    // Pull it back and check the emitted protocol.
    let mut down = session();
    down.accept(
        &SessionRequest::Exec("scp -r -f /store/logs".to_string()),
        &mut fs,
    );
    let wire = drive_source(&mut down, &mut fs);
    let text = String::from_utf8_lossy(&wire).to_string();
    assert!(text.contains("D0755 0 logs\n"));
    assert!(text.contains("C0644 3 a.txt\n"));
    assert!(text.contains("abc\0"));
    assert!(text.contains("C0644 4 b.txt\n"));
    assert!(text.contains("E\n"));
    assert_eq!(down.exit_status(), Some(0));
    assert_eq!(fs.open_handles(), 0);
}

#[test]
fn protected_path_upload_is_refused() {
    let mut fs = MemFs::new();
    fs.put_dir("/store");
    let mut s = session();
    s.accept(&SessionRequest::Exec("scp -t /store".to_string()), &mut fs);
    s.channel_mut().take_outgoing();

    s.channel_mut().feed(b"C0644 6 syscfg\n");
    s.on_readable(&mut fs);
    let out = s.channel_mut().take_outgoing();
    assert_eq!(out[0], 2, "fatal response expected");
    assert!(String::from_utf8_lossy(&out).contains("scp:"));
    assert!(s.is_closed());
    assert_eq!(s.exit_status(), Some(1));
    assert!(fs.file_content("/store/syscfg").is_none());
}

#[test]
fn protected_path_download_is_refused() {
    let mut fs = MemFs::new();
    fs.put_file("/store/syscfg", b"secrets");
    let mut s = session();
    s.accept(
        &SessionRequest::Exec("scp -f /store/syscfg".to_string()),
        &mut fs,
    );
    s.channel_mut().feed(&[0]);
    s.on_readable(&mut fs);
    let out = s.channel_mut().take_outgoing();
    assert_eq!(out[0], 2);
    assert!(s.is_closed());
    assert_eq!(s.exit_status(), Some(1));
}

#[test]
fn traversal_name_is_rejected_with_fatal() {
    let mut fs = MemFs::new();
    fs.put_dir("/store");
    let mut s = session();
    s.accept(&SessionRequest::Exec("scp -t /store".to_string()), &mut fs);
    s.channel_mut().take_outgoing();

    s.channel_mut().feed(b"C0644 5 ../pwn\n");
    s.on_readable(&mut fs);
    let out = s.channel_mut().take_outgoing();
    assert_eq!(out[0], 2);
    assert!(s.is_closed());
}

#[test]
fn mount_point_listing_works_without_backing_entry() {
    // "/sd" has no VFS node; the engine still presents it as an empty
    // directory so recursive pulls of an unmounted card succeed.
    let mut fs = MemFs::new();
    let mut s = session();
    s.accept(&SessionRequest::Exec("scp -r -f /sd".to_string()), &mut fs);
    let wire = drive_source(&mut s, &mut fs);
    let text = String::from_utf8_lossy(&wire).to_string();
    assert!(text.contains("D0755 0 sd\n"));
    assert!(text.contains("E\n"));
    assert_eq!(s.exit_status(), Some(0));
}

struct EchoPort;

impl CommandPort for EchoPort {
    fn execute(&mut self, cmd: &str) -> String {
        format!("ran: {cmd}\r\n")
    }
}

#[test]
fn non_scp_exec_runs_through_the_command_port() {
    let mut fs = MemFs::new();
    let config = SshConfig::default();
    let mut s = ScpSession::new(ScriptedTransport::new(), &config, Box::new(EchoPort));
    s.accept(&SessionRequest::Exec("stat vehicle".to_string()), &mut fs);
    let out = String::from_utf8_lossy(&s.channel_mut().take_outgoing()).to_string();
    assert!(out.contains("ran: stat vehicle"));
    assert!(s.is_closed());
    assert_eq!(s.exit_status(), Some(0));
}
