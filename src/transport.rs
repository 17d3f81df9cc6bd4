//! Byte-stream transport to the board.
//!
//! The board speaks an ASCII, newline-framed protocol over a serial link.
//! This module only moves bytes: framing a line read with a timeout and
//! discarding stale input. Retry and parsing policy live in [`crate::board`].

use std::io::{self, Read, Write};
use std::time::{Duration, Instant};

use log::debug;
use serialport::{ClearBuffer, SerialPort};

use crate::errors::Result;

/// Per-read timeout on the underlying port; `read_line` loops on this
/// until its own deadline expires.
const PORT_READ_TIMEOUT: Duration = Duration::from_millis(50);

/// The controller resets when the port is opened; give it time to boot
/// before the first exchange.
const BOOT_SETTLE: Duration = Duration::from_secs(2);

/// Raw duplex channel to the board.
///
/// Exactly one [`crate::board::Board`] owns the transport for a session;
/// nothing else may read or write it concurrently.
pub trait Transport {
    /// Write all bytes and flush.
    fn send(&mut self, bytes: &[u8]) -> Result<()>;

    /// Read one newline-terminated line, waiting at most `timeout`.
    ///
    /// Returns `Ok(None)` if no complete line arrived in time. The trailing
    /// newline and any carriage return are stripped.
    fn read_line(&mut self, timeout: Duration) -> Result<Option<String>>;

    /// Discard any buffered input so a stale response from an earlier
    /// exchange cannot be mistaken for the next one.
    fn reset_input_buffer(&mut self) -> Result<()>;
}

/// Serial-port transport (e.g. `/dev/ttyACM0`).
pub struct SerialTransport {
    port: Box<dyn SerialPort>,
}

impl SerialTransport {
    /// Open the port and wait out the controller's post-open reset.
    pub fn open(path: &str, baud_rate: u32) -> Result<Self> {
        let port = serialport::new(path, baud_rate)
            .timeout(PORT_READ_TIMEOUT)
            .open()?;
        debug!("opened {path} at {baud_rate} baud, waiting for board reset");
        std::thread::sleep(BOOT_SETTLE);
        Ok(Self { port })
    }
}

impl Transport for SerialTransport {
    fn send(&mut self, bytes: &[u8]) -> Result<()> {
        self.port.write_all(bytes)?;
        self.port.flush()?;
        Ok(())
    }

    fn read_line(&mut self, timeout: Duration) -> Result<Option<String>> {
        let deadline = Instant::now() + timeout;
        let mut buf: Vec<u8> = Vec::with_capacity(256);
        loop {
            let mut byte = [0u8; 1];
            match self.port.read(&mut byte) {
                Ok(n) if n >= 1 => {
                    if byte[0] == b'\n' {
                        let line = String::from_utf8_lossy(&buf).trim().to_string();
                        return Ok(Some(line));
                    }
                    buf.push(byte[0]);
                }
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) if e.kind() == io::ErrorKind::TimedOut => {}
                Err(e) => return Err(e.into()),
            }

            if Instant::now() >= deadline {
                return Ok(None);
            }
        }
    }

    fn reset_input_buffer(&mut self) -> Result<()> {
        self.port.clear(ClearBuffer::Input)?;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod mock {
    //! Scripted transport for driver and session tests.

    use std::collections::VecDeque;
    use std::time::Duration;

    use super::Transport;
    use crate::errors::Result;

    enum Scripted {
        Line(String),
        /// No response for the rest of the current attempt; cleared by the
        /// next `reset_input_buffer`.
        Silence,
    }

    #[derive(Default)]
    pub struct MockTransport {
        script: VecDeque<Scripted>,
        /// Every `send` payload, in order.
        pub sent: Vec<Vec<u8>>,
        /// Number of input-buffer resets observed.
        pub resets: usize,
        /// When the script runs out, keep replaying the last line instead of
        /// going quiet. Used by polling tests whose loops are time-bounded.
        pub repeat_last: bool,
        last: Option<String>,
        silent_until_reset: bool,
    }

    impl MockTransport {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn push_line(&mut self, line: &str) {
            self.script.push_back(Scripted::Line(line.to_string()));
        }

        pub fn push_silence(&mut self) {
            self.script.push_back(Scripted::Silence);
        }

        /// All commands sent so far, flattened to a single byte sequence.
        pub fn sent_bytes(&self) -> Vec<u8> {
            self.sent.iter().flatten().copied().collect()
        }

        pub fn count_sent(&self, byte: u8) -> usize {
            self.sent_bytes().iter().filter(|&&b| b == byte).count()
        }
    }

    impl Transport for MockTransport {
        fn send(&mut self, bytes: &[u8]) -> Result<()> {
            self.sent.push(bytes.to_vec());
            Ok(())
        }

        fn read_line(&mut self, _timeout: Duration) -> Result<Option<String>> {
            if self.silent_until_reset {
                return Ok(None);
            }
            match self.script.pop_front() {
                Some(Scripted::Line(line)) => {
                    self.last = Some(line.clone());
                    Ok(Some(line))
                }
                Some(Scripted::Silence) => {
                    self.silent_until_reset = true;
                    Ok(None)
                }
                None => {
                    if self.repeat_last {
                        Ok(self.last.clone())
                    } else {
                        Ok(None)
                    }
                }
            }
        }

        fn reset_input_buffer(&mut self) -> Result<()> {
            self.resets += 1;
            self.silent_until_reset = false;
            Ok(())
        }
    }
}
