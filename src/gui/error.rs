use std::{error::Error, fmt::Display, io, sync::mpsc};

/// Why the monitor stopped early.
#[derive(Debug)]
pub enum MonitorError {
    /// Talking to the terminal failed
    IOError(io::Error),
    /// The device manager went away
    Disconnected,
}

impl Display for MonitorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#?}", self)
    }
}

impl Error for MonitorError {}

impl From<io::Error> for MonitorError {
    fn from(value: io::Error) -> Self {
        Self::IOError(value)
    }
}

impl From<mpsc::TryRecvError> for MonitorError {
    fn from(_: mpsc::TryRecvError) -> Self {
        Self::Disconnected
    }
}
