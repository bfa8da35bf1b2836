//! SCP console server engine.
//!
//! The integrator's SSH library owns the cryptography and the wire
//! protocol; this module owns everything above an accepted channel:
//! session-request dispatch (shell, exec, scp), the SCP source/sink
//! sub-protocol state machine, credential verification, and host-key
//! provisioning.
//!
//! ```text
//! SSH library ──channel bytes──▶ ScpSession ──Vfs──▶ /store, /sd
//!                                   │
//!                                   └─CommandPort─▶ console commands
//! ```

pub mod auth;
pub mod keygen;
pub mod session;
pub mod vfs;

pub use session::{ScpSession, SessionState};

/// What the peer asked this channel to become.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionRequest {
    /// Interactive shell.
    Shell,
    /// One-shot command (scp invocations arrive this way).
    Exec(String),
}

/// Seam to the device command interpreter, used by shell and non-scp
/// exec requests.
pub trait CommandPort {
    /// Execute one command line and return its output.
    fn execute(&mut self, cmd: &str) -> String;
}

/// Command port that knows no commands.
pub struct NullCommandPort;

impl CommandPort for NullCommandPort {
    fn execute(&mut self, cmd: &str) -> String {
        format!("unknown command: {cmd}\r\n")
    }
}

/// Parsed `scp` invocation from an exec request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScpCommand {
    /// `-t`: peer sends, we sink.  `-f`: peer fetches, we source.
    pub sink: bool,
    pub recursive: bool,
    pub verbose: bool,
    pub preserve: bool,
    pub target_dir: bool,
    pub path: String,
}

impl ScpCommand {
    /// Parse an exec command line; `None` when it is not an scp
    /// invocation this engine can serve.
    pub fn parse(cmd: &str) -> Option<Self> {
        let mut tokens = cmd.split_whitespace();
        if tokens.next()? != "scp" {
            return None;
        }

        let mut sink = None;
        let mut recursive = false;
        let mut verbose = false;
        let mut preserve = false;
        let mut target_dir = false;
        let mut path = None;

        for tok in tokens {
            match tok {
                // Exactly one direction flag is allowed.
                "-t" | "-f" => {
                    if sink.is_some() {
                        return None;
                    }
                    sink = Some(tok == "-t");
                }
                "-r" => recursive = true,
                "-v" => verbose = true,
                "-p" => preserve = true,
                "-d" => target_dir = true,
                other if !other.starts_with('-') && path.is_none() => {
                    path = Some(other.to_string());
                }
                _ => return None,
            }
        }

        Some(Self {
            sink: sink?,
            recursive,
            verbose,
            preserve,
            target_dir,
            path: path?,
        })
    }
}
