use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Phase of the feeder's conversation with the printer.
///
/// # Valid transitions
///
/// - Disconnected -> Handshaking -> Idle (resync succeeded)
/// - Idle -> Printing (a job became available)
/// - Printing <-> Stalled (window full without ack for a while / any ok)
/// - Printing <-> Paused (user toggle)
/// - any -> Disconnected (EOF, hard I/O error, persistent errors, silence)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Not currently in sync with the printer.
    Disconnected,

    /// Resync procedure in progress.
    Handshaking,

    /// In sync with the printer but no active job.
    Idle,

    /// Commands are flowing from a source to the printer.
    Printing,

    /// Commands are waiting because the printer buffer has been full for a
    /// while. Not a failure; indicates a long running command like G28.
    Stalled,

    /// Paused by the user.
    Paused,
}

impl Phase {
    /// True while a job occupies the engine (the job descriptor in the
    /// printer snapshot stays valid).
    pub fn job_active(&self) -> bool {
        matches!(self, Phase::Printing | Phase::Stalled | Phase::Paused)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::Disconnected => "Disconnected",
            Phase::Handshaking => "Handshaking",
            Phase::Idle => "Idle",
            Phase::Printing => "Printing",
            Phase::Stalled => "Stalled",
            Phase::Paused => "Paused",
        };
        write!(f, "{}", s)
    }
}

/// What to do when a job fails with an I/O or protocol error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoErrorPolicy {
    /// Reinitialize communication with the printer, take the next job.
    Next,
    /// Terminate the process with a non-zero exit code.
    Quit,
}

impl FromStr for IoErrorPolicy {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "next" => Ok(IoErrorPolicy::Next),
            "quit" => Ok(IoErrorPolicy::Quit),
            other => Err(crate::Error::Config(format!(
                "--ioerror must be 'next' or 'quit', not '{}'",
                other
            ))),
        }
    }
}

/// Where a job failure originated. Decides whether the printer link needs
/// a resync and whether a reopen backoff applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultSite {
    /// The G-code source failed; the printer link is still good.
    Source,
    /// The printer conversation failed; reconnect and resync.
    Printer,
    /// Opening the printer device itself failed (e.g. USB unplugged);
    /// back off before retrying.
    PrinterHard,
    /// The user aborted the job; not an error for policy purposes.
    Abort,
}
