//! AT command exchange on the dedicated command channel.
//!
//! One command may be in flight at a time; a second request while the
//! channel is busy fails immediately with `ChannelInUse` instead of
//! queueing.  Output lines are collected until a terminator (`OK`,
//! `ERROR`, `+CME ERROR`, `+CMS ERROR`) or the tick deadline, and the
//! caller polls for the outcome.

use heapless::String as HString;

use crate::error::CommandError;

/// Collected output cap.  Long responses past this fail with
/// `Overflow` rather than truncating silently.
const OUTPUT_CAP: usize = 2048;

fn is_terminator(line: &str) -> bool {
    line == "OK"
        || line == "ERROR"
        || line.starts_with("+CME ERROR")
        || line.starts_with("+CMS ERROR")
}

enum Phase {
    Idle,
    Collecting,
    Done(Result<(), CommandError>),
}

pub struct CommandExchange {
    phase: Phase,
    output: HString<OUTPUT_CAP>,
    deadline: u32,
}

impl CommandExchange {
    pub fn new() -> Self {
        Self {
            phase: Phase::Idle,
            output: HString::new(),
            deadline: 0,
        }
    }

    pub fn is_busy(&self) -> bool {
        matches!(self.phase, Phase::Collecting)
    }

    /// Claim the channel for one command.  Fails fast while a command
    /// is in flight or its output has not been collected yet.
    pub fn begin(&mut self, timeout_ticks: u32) -> Result<(), CommandError> {
        if !matches!(self.phase, Phase::Idle) {
            return Err(CommandError::ChannelInUse);
        }
        self.output.clear();
        self.deadline = timeout_ticks;
        self.phase = Phase::Collecting;
        Ok(())
    }

    /// Feed one response line.  Returns true when the command completed.
    pub fn feed_line(&mut self, line: &str) -> bool {
        if !self.is_busy() {
            return false;
        }
        if self.output.push_str(line).is_err() || self.output.push('\n').is_err() {
            self.phase = Phase::Done(Err(CommandError::Overflow));
            return true;
        }
        if is_terminator(line) {
            self.phase = Phase::Done(Ok(()));
            return true;
        }
        false
    }

    /// Once-per-second deadline tick.
    pub fn on_ticker(&mut self) {
        if !self.is_busy() {
            return;
        }
        self.deadline = self.deadline.saturating_sub(1);
        if self.deadline == 0 {
            self.phase = Phase::Done(Err(CommandError::Timeout));
        }
    }

    /// Take the finished command's output, releasing the channel.
    /// `None` while still collecting or idle.
    pub fn take_output(&mut self) -> Option<Result<String, CommandError>> {
        match core::mem::replace(&mut self.phase, Phase::Idle) {
            Phase::Done(Ok(())) => Some(Ok(self.output.as_str().to_string())),
            Phase::Done(Err(e)) => Some(Err(e)),
            other => {
                self.phase = other;
                None
            }
        }
    }
}

impl Default for CommandExchange {
    fn default() -> Self {
        Self::new()
    }
}
