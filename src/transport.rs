//! The byte pipe between a device session and a board.
//!
//! Sessions only ever talk to a [`Transport`], so the serial port can be
//! swapped for the [simulator](crate::simulator) or a test double when the
//! session is built.

use log::{trace, warn};
use serial2::SerialPort;

use std::{borrow::Cow, fmt, io, time::Duration};

/// Baud rate of the EVB1000 USB-serial bridge.
pub const DEFAULT_BAUD_RATE: u32 = 115200;

// Finite so a silent board can't keep a stopped session alive forever.
const READ_TIMEOUT: Duration = Duration::from_millis(500);

// An apr line is about 120 bytes, anything this long without a newline is noise.
const MAX_LINE_LEN: usize = 4096;

/// Why a transport could not be opened.
#[derive(Debug)]
pub enum OpenError {
    /// The device is there but not ready yet, try again
    NotReady(io::Error),
    /// Trying again will not help
    Unrecoverable(io::Error),
}

impl fmt::Display for OpenError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            OpenError::NotReady(e) => Cow::from(format!("device not ready: {}", e)),
            OpenError::Unrecoverable(e) => Cow::from(format!("cannot open device: {}", e)),
        };
        write!(f, "{}", msg)
    }
}

impl std::error::Error for OpenError {}

/// A line oriented connection to one board.
pub trait Transport: Send {
    /// Opens the connection.
    fn open(&mut self) -> Result<(), OpenError>;

    /// Reads one line, terminator included. An empty line means nothing
    /// arrived before the transport gave up waiting.
    fn read_line(&mut self) -> io::Result<Vec<u8>>;

    /// Closes the connection. Closing twice, or closing a transport that was
    /// never opened, does nothing.
    fn close(&mut self);
}

/// A [`Transport`] over a real serial port.
pub struct SerialTransport {
    path: String,
    baud_rate: u32,
    port: Option<SerialPort>,
    pending: Vec<u8>,
}

impl SerialTransport {
    /// Describes the port at `path`, it is not opened until [`Transport::open`].
    pub fn new(path: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            path: path.into(),
            baud_rate,
            port: None,
            pending: Vec::new(),
        }
    }

    fn take_line(&mut self) -> Option<Vec<u8>> {
        let end = self.pending.iter().position(|&c| c == b'\n')?;
        Some(self.pending.drain(..=end).collect())
    }

    fn push_bytes(&mut self, bytes: &[u8]) {
        self.pending.extend_from_slice(bytes);
        if self.pending.len() > MAX_LINE_LEN && !self.pending.contains(&b'\n') {
            warn!(
                "{}: no line end in {} bytes, dropping them",
                self.path,
                self.pending.len()
            );
            self.pending.clear();
        }
    }
}

impl Transport for SerialTransport {
    fn open(&mut self) -> Result<(), OpenError> {
        if self.port.is_some() {
            return Ok(());
        }

        let mut port = SerialPort::open(&self.path, self.baud_rate).map_err(|e| match e.kind() {
            io::ErrorKind::InvalidInput => OpenError::Unrecoverable(e),
            // Windows in particular lists the port a moment before the driver
            // lets anyone open it
            _ => OpenError::NotReady(e),
        })?;
        port.set_read_timeout(READ_TIMEOUT)
            .map_err(OpenError::Unrecoverable)?;

        self.pending.clear();
        self.port = Some(port);
        Ok(())
    }

    fn read_line(&mut self) -> io::Result<Vec<u8>> {
        let mut buffer = [0; 256];
        loop {
            if let Some(line) = self.take_line() {
                return Ok(line);
            }

            let port = self
                .port
                .as_ref()
                .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "port is closed"))?;

            match port.read(&mut buffer) {
                Ok(0) => return Ok(Vec::new()),
                Ok(read_len) => self.push_bytes(&buffer[..read_len]),
                Err(e) if e.kind() == io::ErrorKind::TimedOut => return Ok(Vec::new()),
                Err(e) => return Err(e),
            }
        }
    }

    fn close(&mut self) {
        if self.port.take().is_some() {
            trace!("Closed {}", self.path);
        }
        self.pending.clear();
    }
}
