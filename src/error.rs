//! Unified error types for the vmlink firmware.
//!
//! A single `Error` enum that every subsystem can convert into, keeping the
//! top-level task loops' error handling uniform.  Variants are `Copy` so they
//! can be cheaply passed through the state machines without allocation.

use core::fmt;

use crate::transport::TransportError;

// ---------------------------------------------------------------------------
// Top-level firmware error
// ---------------------------------------------------------------------------

/// Every fallible operation in the firmware funnels into this type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The underlying byte channel failed.
    Transport(TransportError),
    /// The SCP transfer engine hit a protocol violation.
    Scp(ScpError),
    /// A virtual-filesystem operation failed.
    Vfs(VfsError),
    /// The modem controller failed.
    Modem(ModemError),
    /// The interactive modem command channel failed.
    Command(CommandError),
    /// Configuration is invalid or could not be loaded.
    Config(&'static str),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transport(e) => write!(f, "transport: {e}"),
            Self::Scp(e) => write!(f, "scp: {e}"),
            Self::Vfs(e) => write!(f, "vfs: {e}"),
            Self::Modem(e) => write!(f, "modem: {e}"),
            Self::Command(e) => write!(f, "command: {e}"),
            Self::Config(msg) => write!(f, "config: {msg}"),
        }
    }
}

impl std::error::Error for Error {}

// ---------------------------------------------------------------------------
// SCP protocol errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScpError {
    /// Control line did not match the expected `C`/`D`/`E`/`T` grammar.
    MalformedControlLine,
    /// File mode field did not match `0[0-7][0-7][0-7] `.
    BadMode,
    /// Declared file size exceeds the transfer cap.
    FileTooLarge,
    /// Entry name contained `/`, was `..`, or was empty.
    UnsafeName,
    /// `E` received with no directory frame to pop.
    StackUnderflow,
    /// Target path is on the protected list.
    ProtectedPath,
    /// The peer reported a hard error.
    PeerError,
    /// Session request was not something the engine can serve.
    UnsupportedRequest,
    /// Credentials did not verify.
    AuthFailed,
}

impl fmt::Display for ScpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MalformedControlLine => write!(f, "malformed control line"),
            Self::BadMode => write!(f, "bad file mode"),
            Self::FileTooLarge => write!(f, "file too large"),
            Self::UnsafeName => write!(f, "unsafe entry name"),
            Self::StackUnderflow => write!(f, "directory stack underflow"),
            Self::ProtectedPath => write!(f, "protected path"),
            Self::PeerError => write!(f, "peer reported error"),
            Self::UnsupportedRequest => write!(f, "unsupported session request"),
            Self::AuthFailed => write!(f, "authentication failed"),
        }
    }
}

impl From<ScpError> for Error {
    fn from(e: ScpError) -> Self {
        Self::Scp(e)
    }
}

// ---------------------------------------------------------------------------
// VFS errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VfsError {
    NotFound,
    NotAFile,
    NotADirectory,
    AlreadyExists,
    NoSpace,
    Io,
}

impl fmt::Display for VfsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound => write!(f, "not found"),
            Self::NotAFile => write!(f, "not a file"),
            Self::NotADirectory => write!(f, "not a directory"),
            Self::AlreadyExists => write!(f, "already exists"),
            Self::NoSpace => write!(f, "no space"),
            Self::Io => write!(f, "I/O error"),
        }
    }
}

impl From<VfsError> for Error {
    fn from(e: VfsError) -> Self {
        Self::Vfs(e)
    }
}

// ---------------------------------------------------------------------------
// Modem errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModemError {
    /// The modem is powered off or shutting down.
    NotReady,
    /// UART write failed or the port is gone.
    UartWriteFailed,
    /// A mux channel index was out of range or the channel is closed.
    ChannelUnavailable,
    /// The mux is not running.
    MuxDown,
    /// The requested driver name is not registered.
    UnknownDriver,
}

impl fmt::Display for ModemError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotReady => write!(f, "modem is not powered on"),
            Self::UartWriteFailed => write!(f, "UART write failed"),
            Self::ChannelUnavailable => write!(f, "mux channel unavailable"),
            Self::MuxDown => write!(f, "mux not running"),
            Self::UnknownDriver => write!(f, "unknown driver"),
        }
    }
}

impl From<ModemError> for Error {
    fn from(e: ModemError) -> Self {
        Self::Modem(e)
    }
}

// ---------------------------------------------------------------------------
// Interactive command channel errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandError {
    /// Another interactive command is already in flight.
    ChannelInUse,
    /// The modem never terminated the response within the timeout.
    Timeout,
    /// Response overflowed the collection buffer.
    Overflow,
}

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ChannelInUse => write!(f, "channel in use"),
            Self::Timeout => write!(f, "response timeout"),
            Self::Overflow => write!(f, "response overflow"),
        }
    }
}

impl From<CommandError> for Error {
    fn from(e: CommandError) -> Self {
        Self::Command(e)
    }
}

impl From<TransportError> for Error {
    fn from(e: TransportError) -> Self {
        Self::Transport(e)
    }
}

// ---------------------------------------------------------------------------
// Convenience Result alias
// ---------------------------------------------------------------------------

/// Firmware-wide `Result` alias.
pub type Result<T> = core::result::Result<T, Error>;
