//! SCP source/sink sub-protocol state machine.
//!
//! One `ScpSession` serves one accepted SSH channel.  The engine is
//! fully non-blocking: the integrator calls [`ScpSession::on_readable`]
//! when channel bytes arrive and [`ScpSession::on_drained`] when a
//! previously blocked send can continue.  Every parser in here is
//! resumable at any byte boundary, and unsent output is retained across
//! calls, so backpressure never loses or duplicates data.
//!
//! Wire grammar served to the remote `scp` client:
//! ```text
//! C<mode> <size> <name>\n    file follows (<size> bytes + NUL status)
//! D<mode> 0 <name>\n         descend into directory
//! E\n                        ascend
//! T<mtime> 0 <atime> 0\n     timestamps (acknowledged, ignored)
//! ```
//! Responses are a single `\0` ACK, or `\1`/`\2` followed by a textual
//! diagnostic line (warning / hard error).

use log::{debug, error, warn};

use crate::config::SshConfig;
use crate::error::ScpError;
use crate::scp::vfs::{DirId, FileId, Metadata, Vfs};
use crate::scp::{CommandPort, ScpCommand, SessionRequest};
use crate::transport::{Transport, TransportError};

/// Hard cap on a single transferred file.
const MAX_FILE_SIZE: u64 = 10 * 1024 * 1024;

/// File content is streamed in chunks of this size.
const CHUNK_SIZE: usize = 512;

/// Control lines and peer diagnostics are capped at this length.
const MAX_LINE: usize = 1024;

/// Console output backlog above which shell output is dropped and
/// counted instead of queued.
const CONSOLE_BACKLOG: usize = 4096;

const ACK: [u8; 1] = [0];

/// Session protocol state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Channel accepted, session request not yet dispatched.
    Accept,
    /// Source mode: waiting for the peer's opening ACK.
    Source,
    /// Source mode: evaluate the current path and emit its control line.
    SourceLoop,
    /// Source mode: iterate entries of the directory on top of the stack.
    SourceDir,
    /// Source mode: stream file content to the peer.
    SourceSend,
    /// Source mode: wait for the peer's response byte.
    SourceResponse,
    /// Sink mode: send the opening ACK.
    Sink,
    /// Sink mode: collect and parse control lines.
    SinkLoop,
    /// Sink mode: receive file payload bytes.
    SinkReceive,
    /// Sink mode: wait for the peer's trailing status byte.
    SinkResponse,
    /// Interactive console.
    Shell,
    /// One-shot non-scp command.
    Exec,
    /// Draining final output before close.
    Closing,
    /// Terminal state; `exit_status` is final.
    Closed,
}

/// Where to continue after a peer response arrives in source mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Resume {
    /// Opening ACK received: evaluate the requested path.
    Start,
    /// `C` line acknowledged: stream the open file.
    StreamFile,
    /// File or `D`/`E` acknowledged: continue the directory walk, or
    /// exit when the stack is empty.
    Continue,
}

/// Outcome of the resumable response reader.
enum Response {
    Pending,
    Ack,
    Warning(String),
    Fatal(String),
}

enum Step {
    Progress,
    Blocked,
    Done,
}

struct DirFrame {
    /// Path length to restore when this frame pops.
    saved_len: usize,
    /// Open directory iterator (source mode only).
    handle: Option<DirId>,
}

pub struct ScpSession<T: Transport> {
    ch: T,
    state: SessionState,
    cmd_port: Box<dyn CommandPort>,
    protected: Vec<String>,

    // Transfer flags from the scp invocation.
    recursive: bool,
    verbose: bool,
    sink_into_dir: bool,

    /// Current path being operated on; grows and shrinks with the
    /// directory stack.
    path: String,
    dir_stack: Vec<DirFrame>,
    file: Option<FileId>,
    /// Sink: payload bytes still expected.  Source: unused.
    file_remaining: u64,

    // Unsent output, retained across would-block.
    pending: Vec<u8>,
    pending_off: usize,

    // Resumable response reader.
    resume: Resume,
    resp_first: u8,
    resp_text: Vec<u8>,
    resp_active: bool,

    // Sink control-line accumulator.
    line: Vec<u8>,

    // Shell line accumulator and loss accounting.
    shell_line: Vec<u8>,
    console_dropped: usize,

    exit_status: Option<u32>,
}

impl<T: Transport> ScpSession<T> {
    pub fn new(ch: T, config: &SshConfig, cmd_port: Box<dyn CommandPort>) -> Self {
        Self {
            ch,
            state: SessionState::Accept,
            cmd_port,
            protected: config.protected_paths.clone(),
            recursive: false,
            verbose: false,
            sink_into_dir: false,
            path: String::new(),
            dir_stack: Vec::new(),
            file: None,
            file_remaining: 0,
            pending: Vec::new(),
            pending_off: 0,
            resume: Resume::Start,
            resp_first: 0,
            resp_text: Vec::new(),
            resp_active: false,
            line: Vec::new(),
            shell_line: Vec::new(),
            console_dropped: 0,
            exit_status: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.state == SessionState::Closed
    }

    /// Final exit status to report through the channel, once closed.
    pub fn exit_status(&self) -> Option<u32> {
        self.exit_status
    }

    pub fn channel_mut(&mut self) -> &mut T {
        &mut self.ch
    }

    /// Dispatch the session request received on the channel.
    pub fn accept(&mut self, request: &SessionRequest, fs: &mut dyn Vfs) {
        debug_assert_eq!(self.state, SessionState::Accept);
        match request {
            SessionRequest::Exec(cmd) => {
                if let Some(scp) = ScpCommand::parse(cmd) {
                    self.begin_transfer(&scp, fs);
                } else if cmd.split_whitespace().next() == Some("scp") {
                    // An scp invocation we cannot serve must not fall
                    // through to the command interpreter.
                    self.fail_peer("usage: scp [-rvpd] -t|-f <path>", ScpError::UnsupportedRequest);
                } else {
                    self.state = SessionState::Exec;
                    let out = self.cmd_port.execute(cmd);
                    self.console_write(out.as_bytes());
                    self.finish(0);
                }
            }
            SessionRequest::Shell => {
                self.state = SessionState::Shell;
                self.console_write(b"vmlink> ");
            }
        }
        self.advance(fs);
    }

    /// Channel bytes are waiting.
    pub fn on_readable(&mut self, fs: &mut dyn Vfs) {
        self.advance(fs);
    }

    /// A previously blocked send can continue.
    pub fn on_drained(&mut self, fs: &mut dyn Vfs) {
        if self.flush_pending()
            && self.console_dropped > 0
            && matches!(self.state, SessionState::Shell | SessionState::Exec)
        {
            // Ctrl-R marker so the user knows output went missing.
            let note = format!("\x12[{} bytes lost]\r\n", self.console_dropped);
            self.console_dropped = 0;
            self.queue(note.as_bytes());
        }
        self.advance(fs);
    }

    // -----------------------------------------------------------------
    // Request dispatch
    // -----------------------------------------------------------------

    fn begin_transfer(&mut self, cmd: &ScpCommand, fs: &mut dyn Vfs) {
        self.recursive = cmd.recursive;
        self.verbose = cmd.verbose;
        self.path = cmd.path.clone();
        // `scp host:/data/` arrives with the slash; a trailing slash
        // always names a directory.
        let trimmed_len = self.path.trim_end_matches('/').len();
        let had_trailing_slash = trimmed_len < self.path.len();
        if had_trailing_slash {
            self.path.truncate(trimmed_len.max(1));
        }
        if cmd.sink {
            self.sink_into_dir = cmd.target_dir
                || had_trailing_slash
                || stat_with_override(fs, &self.path).is_ok_and(|m| m.is_dir);
            self.state = SessionState::Sink;
        } else {
            self.state = SessionState::Source;
        }
        if self.verbose {
            debug!(
                "scp {} {} (recursive={})",
                if cmd.sink { "sink" } else { "source" },
                self.path,
                self.recursive
            );
        }
    }

    // -----------------------------------------------------------------
    // Main drive loop
    // -----------------------------------------------------------------

    fn advance(&mut self, fs: &mut dyn Vfs) {
        loop {
            let step = match self.state {
                SessionState::Accept | SessionState::Exec => Step::Done,
                SessionState::Source => self.step_response(Resume::Start, fs),
                SessionState::SourceLoop => self.step_source_loop(fs),
                SessionState::SourceDir => self.step_source_dir(fs),
                SessionState::SourceSend => self.step_source_send(fs),
                SessionState::SourceResponse => {
                    let resume = self.resume;
                    self.step_response(resume, fs)
                }
                SessionState::Sink => {
                    self.queue(&ACK);
                    self.state = SessionState::SinkLoop;
                    Step::Progress
                }
                SessionState::SinkLoop => self.step_sink_loop(fs),
                SessionState::SinkReceive => self.step_sink_receive(fs),
                SessionState::SinkResponse => self.step_sink_response(),
                SessionState::Shell => self.step_shell(),
                SessionState::Closing => self.step_closing(),
                SessionState::Closed => Step::Done,
            };
            match step {
                Step::Progress => {}
                Step::Blocked | Step::Done => break,
            }
        }
    }

    // -----------------------------------------------------------------
    // Source mode
    // -----------------------------------------------------------------

    fn step_source_loop(&mut self, fs: &mut dyn Vfs) -> Step {
        if !self.flush_pending() {
            return Step::Blocked;
        }
        if self.is_protected(&self.path) {
            let msg = format!("{}: protected path", self.path);
            return self.fail_peer(&msg, ScpError::ProtectedPath);
        }
        let meta = match stat_with_override(fs, &self.path) {
            Ok(m) => m,
            Err(_) => {
                let msg = format!("{}: no such file or directory", self.path);
                return self.fail_peer(&msg, ScpError::MalformedControlLine);
            }
        };
        let name = basename(&self.path).to_string();
        if meta.is_dir {
            if !self.recursive {
                let msg = format!("{}: not a regular file", self.path);
                return self.fail_peer(&msg, ScpError::UnsupportedRequest);
            }
            // Mount overrides list as empty when the VFS cannot open them.
            let handle = match fs.open_dir(&self.path) {
                Ok(h) => Some(h),
                Err(_) if is_mount_override(&self.path) => None,
                Err(_) => {
                    let msg = format!("{}: cannot read directory", self.path);
                    return self.fail_peer(&msg, ScpError::MalformedControlLine);
                }
            };
            self.dir_stack.push(DirFrame {
                saved_len: self.path.len(),
                handle,
            });
            let line = format!("D{:04o} 0 {}\n", meta.mode, name);
            if self.verbose {
                debug!("scp source: {}", line.trim_end());
            }
            self.queue(line.as_bytes());
            self.await_response(Resume::Continue);
        } else {
            let file = match fs.open(&self.path) {
                Ok(f) => f,
                Err(_) => {
                    let msg = format!("{}: cannot open", self.path);
                    return self.fail_peer(&msg, ScpError::MalformedControlLine);
                }
            };
            self.file = Some(file);
            let line = format!("C{:04o} {} {}\n", meta.mode, meta.size, name);
            if self.verbose {
                debug!("scp source: {}", line.trim_end());
            }
            self.queue(line.as_bytes());
            self.await_response(Resume::StreamFile);
        }
        Step::Progress
    }

    fn step_source_dir(&mut self, fs: &mut dyn Vfs) -> Step {
        if !self.flush_pending() {
            return Step::Blocked;
        }
        let Some(frame) = self.dir_stack.last() else {
            // Stack drained while a frame was expected.
            self.finish(0);
            return Step::Progress;
        };
        let saved_len = frame.saved_len;
        let handle = frame.handle;
        self.path.truncate(saved_len);
        let entry = match handle {
            Some(h) => fs.read_dir(h),
            None => Ok(None),
        };
        match entry {
            Ok(Some(name)) => {
                if name == "." || name == ".." {
                    return Step::Progress;
                }
                self.path = join(&self.path, &name);
                self.state = SessionState::SourceLoop;
                Step::Progress
            }
            Ok(None) | Err(_) => {
                if let Some(frame) = self.dir_stack.pop() {
                    if let Some(h) = frame.handle {
                        fs.close_dir(h);
                    }
                    self.path.truncate(frame.saved_len);
                }
                self.queue(b"E\n");
                self.await_response(Resume::Continue);
                Step::Progress
            }
        }
    }

    fn step_source_send(&mut self, fs: &mut dyn Vfs) -> Step {
        if !self.flush_pending() {
            return Step::Blocked;
        }
        let Some(file) = self.file else {
            // File vanished under us; treat as EOF.
            self.queue(&ACK);
            self.await_response(Resume::Continue);
            return Step::Progress;
        };
        let mut buf = [0u8; CHUNK_SIZE];
        match fs.read(file, &mut buf) {
            Ok(0) => {
                fs.close(file);
                self.file = None;
                // Trailing NUL marks a clean end of file content.
                self.queue(&ACK);
                self.await_response(Resume::Continue);
            }
            Ok(n) => self.queue(&buf[..n]),
            Err(e) => {
                fs.close(file);
                self.file = None;
                let msg = format!("{}: read failed ({e})", self.path);
                return self.fail_peer(&msg, ScpError::MalformedControlLine);
            }
        }
        Step::Progress
    }

    fn step_response(&mut self, resume: Resume, fs: &mut dyn Vfs) -> Step {
        if !self.flush_pending() {
            return Step::Blocked;
        }
        match self.get_response() {
            Response::Pending => Step::Blocked,
            Response::Ack => {
                self.route_response(resume);
                Step::Progress
            }
            Response::Warning(text) => {
                warn!("scp peer warning: {text}");
                // The peer refused the announced entry; its content
                // must never be streamed.  Drop the open file and move
                // on as if the transfer of that entry had completed.
                if matches!(resume, Resume::StreamFile) {
                    if let Some(file) = self.file.take() {
                        fs.close(file);
                    }
                    self.route_response(Resume::Continue);
                } else {
                    self.route_response(resume);
                }
                Step::Progress
            }
            Response::Fatal(text) => {
                error!("scp peer error: {text}");
                self.finish(1);
                Step::Progress
            }
        }
    }

    fn route_response(&mut self, resume: Resume) {
        match resume {
            Resume::Start => self.state = SessionState::SourceLoop,
            Resume::StreamFile => self.state = SessionState::SourceSend,
            Resume::Continue => {
                if self.dir_stack.is_empty() {
                    self.finish(0);
                } else {
                    self.state = SessionState::SourceDir;
                }
            }
        }
    }

    // -----------------------------------------------------------------
    // Sink mode
    // -----------------------------------------------------------------

    fn step_sink_loop(&mut self, fs: &mut dyn Vfs) -> Step {
        if !self.flush_pending() {
            return Step::Blocked;
        }
        let mut byte = [0u8; 1];
        match self.ch.read(&mut byte) {
            Err(TransportError::WouldBlock) => Step::Blocked,
            Err(_) => {
                // Peer closed: clean when no transfer is mid-flight.
                let clean = self.file.is_none() && self.dir_stack.is_empty();
                self.finish(u32::from(!clean));
                Step::Progress
            }
            Ok(_) => {
                if byte[0] == b'\n' {
                    let line = core::mem::take(&mut self.line);
                    self.handle_control_line(&line, fs)
                } else {
                    if self.line.len() >= MAX_LINE {
                        return self.fail_peer(
                            "protocol error: line too long",
                            ScpError::MalformedControlLine,
                        );
                    }
                    self.line.push(byte[0]);
                    Step::Progress
                }
            }
        }
    }

    fn handle_control_line(&mut self, raw: &[u8], fs: &mut dyn Vfs) -> Step {
        let line = String::from_utf8_lossy(raw);
        let line = line.trim_end_matches('\r');
        if self.verbose {
            debug!("scp sink: {line}");
        }
        match line.bytes().next() {
            Some(b'T') => {
                // Timestamps acknowledged but not applied.
                self.queue(&ACK);
                Step::Progress
            }
            Some(b'E') => {
                let Some(frame) = self.dir_stack.pop() else {
                    return self.fail_peer(
                        "protocol error: unbalanced E",
                        ScpError::StackUnderflow,
                    );
                };
                self.path.truncate(frame.saved_len);
                self.queue(&ACK);
                Step::Progress
            }
            Some(b'C') => self.handle_sink_entry(line, false, fs),
            Some(b'D') => self.handle_sink_entry(line, true, fs),
            _ => self.fail_peer("protocol error", ScpError::MalformedControlLine),
        }
    }

    fn handle_sink_entry(&mut self, line: &str, is_dir: bool, fs: &mut dyn Vfs) -> Step {
        let Some((_mode, size, name)) = parse_entry_line(line) else {
            return self.fail_peer("protocol error", ScpError::MalformedControlLine);
        };
        if name.is_empty() || name == ".." || name.contains('/') {
            let msg = format!("{name}: unsafe name");
            return self.fail_peer(&msg, ScpError::UnsafeName);
        }
        if is_dir && !self.recursive {
            return self.fail_peer("received directory without -r", ScpError::UnsupportedRequest);
        }
        if !is_dir && size > MAX_FILE_SIZE {
            let msg = format!("{name}: file too large");
            return self.fail_peer(&msg, ScpError::FileTooLarge);
        }
        let target = if self.sink_into_dir || !self.dir_stack.is_empty() {
            join(&self.path, name)
        } else {
            self.path.clone()
        };
        if self.is_protected(&target) {
            let msg = format!("{target}: protected path");
            return self.fail_peer(&msg, ScpError::ProtectedPath);
        }

        if is_dir {
            match stat_with_override(fs, &target) {
                Ok(m) if m.is_dir => {}
                Ok(_) => {
                    let msg = format!("{target}: not a directory");
                    return self.fail_peer(&msg, ScpError::UnsafeName);
                }
                Err(_) => {
                    if fs.mkdir(&target).is_err() {
                        let msg = format!("{target}: mkdir failed");
                        return self.fail_peer(&msg, ScpError::UnsafeName);
                    }
                }
            }
            self.dir_stack.push(DirFrame {
                saved_len: self.path.len(),
                handle: None,
            });
            self.path = target;
            self.queue(&ACK);
            return Step::Progress;
        }

        if stat_with_override(fs, &target).is_ok_and(|m| m.is_dir) {
            let msg = format!("{target}: is a directory");
            return self.fail_peer(&msg, ScpError::UnsafeName);
        }
        let file = match fs.create(&target) {
            Ok(f) => f,
            Err(e) => {
                let msg = format!("{target}: create failed ({e})");
                return self.fail_peer(&msg, ScpError::MalformedControlLine);
            }
        };
        // ACK for the control line tells the peer to start the payload.
        self.queue(&ACK);
        if size == 0 {
            // Empty file: payload phase is skipped entirely.
            fs.close(file);
            self.queue(&ACK);
            self.state = SessionState::SinkResponse;
        } else {
            self.file = Some(file);
            self.file_remaining = size;
            self.state = SessionState::SinkReceive;
        }
        Step::Progress
    }

    fn step_sink_receive(&mut self, fs: &mut dyn Vfs) -> Step {
        let Some(file) = self.file else {
            self.state = SessionState::SinkResponse;
            return Step::Progress;
        };
        let want = (self.file_remaining.min(CHUNK_SIZE as u64)) as usize;
        let mut buf = [0u8; CHUNK_SIZE];
        match self.ch.read(&mut buf[..want]) {
            Err(TransportError::WouldBlock) => Step::Blocked,
            Err(_) => {
                fs.close(file);
                self.file = None;
                self.finish(1);
                Step::Progress
            }
            Ok(n) => {
                if fs.write(file, &buf[..n]).is_err() {
                    fs.close(file);
                    self.file = None;
                    let msg = format!("{}: write failed", self.path);
                    return self.fail_peer(&msg, ScpError::MalformedControlLine);
                }
                self.file_remaining -= n as u64;
                if self.file_remaining == 0 {
                    fs.close(file);
                    self.file = None;
                    self.queue(&ACK);
                    self.state = SessionState::SinkResponse;
                }
                Step::Progress
            }
        }
    }

    fn step_sink_response(&mut self) -> Step {
        if !self.flush_pending() {
            return Step::Blocked;
        }
        match self.get_response() {
            Response::Pending => Step::Blocked,
            Response::Ack => {
                self.state = SessionState::SinkLoop;
                Step::Progress
            }
            Response::Warning(text) => {
                warn!("scp peer warning: {text}");
                self.state = SessionState::SinkLoop;
                Step::Progress
            }
            Response::Fatal(text) => {
                error!("scp peer error: {text}");
                self.finish(1);
                Step::Progress
            }
        }
    }

    // -----------------------------------------------------------------
    // Shell / console
    // -----------------------------------------------------------------

    fn step_shell(&mut self) -> Step {
        if !self.flush_pending() {
            return Step::Blocked;
        }
        let mut byte = [0u8; 1];
        match self.ch.read(&mut byte) {
            Err(TransportError::WouldBlock) => Step::Blocked,
            Err(_) => {
                self.finish(0);
                Step::Progress
            }
            Ok(_) => {
                let b = byte[0];
                if b == b'\n' || b == b'\r' {
                    let raw = core::mem::take(&mut self.shell_line);
                    let cmd = String::from_utf8_lossy(&raw).trim().to_string();
                    self.console_write(b"\r\n");
                    if cmd == "exit" {
                        self.finish(0);
                    } else if !cmd.is_empty() {
                        let out = self.cmd_port.execute(&cmd);
                        self.console_write(out.as_bytes());
                        self.console_write(b"vmlink> ");
                    } else {
                        self.console_write(b"vmlink> ");
                    }
                } else {
                    if self.shell_line.len() < MAX_LINE {
                        self.shell_line.push(b);
                    }
                    // Echo for interactive feel.
                    self.console_write(&byte);
                }
                Step::Progress
            }
        }
    }

    /// Console output path: under backlog pressure bytes are dropped and
    /// counted rather than stalling the engine; never used for SCP
    /// protocol bytes.
    fn console_write(&mut self, data: &[u8]) {
        let backlog = self.pending.len() - self.pending_off;
        if backlog >= CONSOLE_BACKLOG {
            self.console_dropped += data.len();
            return;
        }
        self.queue(data);
    }

    // -----------------------------------------------------------------
    // Shared plumbing
    // -----------------------------------------------------------------

    fn await_response(&mut self, resume: Resume) {
        self.resume = resume;
        self.state = SessionState::SourceResponse;
    }

    /// Resumable peer-response reader.  `\0` is a plain ACK; any other
    /// first byte starts a diagnostic line ended by `\n` (`\1` warning,
    /// otherwise hard error).
    fn get_response(&mut self) -> Response {
        let mut byte = [0u8; 1];
        loop {
            match self.ch.read(&mut byte) {
                Err(TransportError::WouldBlock) => return Response::Pending,
                Err(_) => {
                    self.resp_active = false;
                    self.resp_text.clear();
                    return Response::Fatal("channel closed".to_string());
                }
                Ok(_) => {}
            }
            let b = byte[0];
            if !self.resp_active {
                if b == 0 {
                    return Response::Ack;
                }
                self.resp_active = true;
                self.resp_first = b;
                self.resp_text.clear();
                continue;
            }
            if b == b'\n' || self.resp_text.len() >= MAX_LINE {
                let text = String::from_utf8_lossy(&self.resp_text)
                    .trim_end()
                    .to_string();
                self.resp_active = false;
                self.resp_text.clear();
                return if self.resp_first == 1 {
                    Response::Warning(text)
                } else {
                    Response::Fatal(text)
                };
            }
            self.resp_text.push(b);
        }
    }

    fn queue(&mut self, data: &[u8]) {
        self.pending.extend_from_slice(data);
        let _ = self.flush_pending();
    }

    /// Push retained output onto the channel.  Returns `true` when the
    /// backlog is fully drained.
    fn flush_pending(&mut self) -> bool {
        while self.pending_off < self.pending.len() {
            match self.ch.write(&self.pending[self.pending_off..]) {
                Ok(n) => self.pending_off += n,
                Err(TransportError::WouldBlock) => return false,
                Err(_) => {
                    self.pending.clear();
                    self.pending_off = 0;
                    if self.exit_status.is_none() {
                        self.exit_status = Some(1);
                    }
                    self.state = SessionState::Closed;
                    return false;
                }
            }
        }
        self.pending.clear();
        self.pending_off = 0;
        true
    }

    /// Report a protocol failure to the peer and shut the session down.
    fn fail_peer(&mut self, msg: &str, err: ScpError) -> Step {
        warn!("scp: {msg} ({err})");
        let line = format!("\x02scp: {msg}\n");
        self.queue(line.as_bytes());
        self.finish(1);
        Step::Progress
    }

    fn finish(&mut self, status: u32) {
        if self.exit_status.is_none() {
            self.exit_status = Some(status);
        }
        if self.state != SessionState::Closed {
            self.state = SessionState::Closing;
        }
    }

    fn step_closing(&mut self) -> Step {
        if !self.flush_pending() {
            return if self.state == SessionState::Closed {
                Step::Done
            } else {
                Step::Blocked
            };
        }
        let _ = self.ch.flush();
        self.state = SessionState::Closed;
        Step::Done
    }

    fn is_protected(&self, path: &str) -> bool {
        self.protected.iter().any(|p| path.starts_with(p.as_str()))
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// `/store` and `/sd` are mount points that must behave as directories
/// even when the filesystem below cannot stat them.
fn is_mount_override(path: &str) -> bool {
    path == "/store" || path == "/sd"
}

fn stat_with_override(fs: &dyn Vfs, path: &str) -> Result<Metadata, crate::error::VfsError> {
    match fs.stat(path) {
        Ok(m) => Ok(m),
        Err(e) => {
            if is_mount_override(path) {
                Ok(Metadata {
                    is_dir: true,
                    size: 0,
                    mode: 0o755,
                })
            } else {
                Err(e)
            }
        }
    }
}

fn basename(path: &str) -> &str {
    path.trim_end_matches('/').rsplit('/').next().unwrap_or(path)
}

fn join(base: &str, name: &str) -> String {
    if base.ends_with('/') {
        format!("{base}{name}")
    } else {
        format!("{base}/{name}")
    }
}

/// Parse `C<mode> <size> <name>` / `D<mode> <size> <name>`.
/// The mode must match `0[0-7][0-7][0-7]` exactly.
fn parse_entry_line(line: &str) -> Option<(u16, u64, &str)> {
    let rest = &line[1..];
    let bytes = rest.as_bytes();
    if bytes.len() < 5 || bytes[0] != b'0' || bytes[4] != b' ' {
        return None;
    }
    if !bytes[1..4].iter().all(|b| (b'0'..=b'7').contains(b)) {
        return None;
    }
    let mode = u16::from_str_radix(&rest[..4], 8).ok()?;
    let rest = &rest[5..];
    let sp = rest.find(' ')?;
    let size: u64 = rest[..sp].parse().ok()?;
    let name = &rest[sp + 1..];
    Some((mode, size, name))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
