use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    // Protocol failures that abort the current job
    #[error("Persistent error state on printer")]
    PersistentPrinterError,

    #[error("Printer timeout waiting for ack")]
    AckTimeout,

    #[error("Too many 'Resend's received from printer")]
    ResendStorm,

    #[error("Illegal 'Resend' received from printer")]
    IllegalResend,

    #[error("EOF on printer connection")]
    PrinterEof,

    #[error("Failed to establish connection with printer")]
    HandshakeFailed,

    #[error("Print aborted")]
    Aborted,

    // Configuration
    #[error("Illegal port specified: {0}")]
    IllegalPort(i64),

    #[error("Don't understand this argument: {0}")]
    BadSource(String),

    #[error("Configuration error: {0}")]
    Config(String),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
