//! Trait abstraction for line-oriented serial port reads to enable testing

use async_trait::async_trait;
use std::io;
use tokio::io::{AsyncBufReadExt, BufReader};

/// Trait for reading raw lines from a serial port
#[async_trait]
pub trait SerialLineIO: Send {
    /// Append bytes up to and including the next `\n` to `buf`.
    ///
    /// Returns the number of bytes appended; `0` means the port closed.
    /// Bytes are appended as they arrive, so a read cancelled by a timeout
    /// leaves its partial line in `buf` for the next call to complete.
    async fn read_line(&mut self, buf: &mut Vec<u8>) -> io::Result<usize>;
}

/// Wrapper around tokio_serial::SerialStream that implements SerialLineIO
pub struct TokioSerialPort {
    reader: BufReader<tokio_serial::SerialStream>,
}

impl TokioSerialPort {
    pub fn new(port: tokio_serial::SerialStream) -> Self {
        Self {
            reader: BufReader::new(port),
        }
    }
}

#[async_trait]
impl SerialLineIO for TokioSerialPort {
    async fn read_line(&mut self, buf: &mut Vec<u8>) -> io::Result<usize> {
        self.reader.read_until(b'\n', buf).await
    }
}
