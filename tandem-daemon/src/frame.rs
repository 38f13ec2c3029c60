//! Framed transport over any blocking byte stream.
//!
//! ```text
//! request:  <10-byte command name><10-byte payload length><payload>
//! response: <10-byte payload length><payload>
//! ```
//!
//! Reads and writes loop until the exact byte count is transferred. A
//! declared length above the memory ceiling is rejected before any buffer
//! is allocated.

use std::io::{ErrorKind, Read, Write};

use tandem_sync::record::{length_field, parse_length_field, FIELD_WIDTH};

use crate::error::DaemonError;

pub struct FrameReader<R> {
    inner: R,
    ceiling: usize,
}

impl<R: Read> FrameReader<R> {
    pub fn new(inner: R, ceiling: usize) -> Self {
        Self { inner, ceiling }
    }

    /// Next request, or `None` when the peer closed cleanly between frames.
    pub fn read_request(&mut self) -> Result<Option<(String, Vec<u8>)>, DaemonError> {
        let mut name = [0u8; FIELD_WIDTH];
        if !self.fill_or_eof(&mut name)? {
            return Ok(None);
        }
        let name = std::str::from_utf8(&name)
            .map_err(|_| DaemonError::Frame("command name is not ASCII".into()))?
            .trim()
            .to_string();
        let payload = self.read_sized()?;
        Ok(Some((name, payload)))
    }

    pub fn read_response(&mut self) -> Result<Vec<u8>, DaemonError> {
        self.read_sized()
    }

    fn read_sized(&mut self) -> Result<Vec<u8>, DaemonError> {
        let mut field = [0u8; FIELD_WIDTH];
        self.fill(&mut field)?;
        let len = parse_length_field(&field).map_err(|e| DaemonError::Frame(e.to_string()))?;
        if len > self.ceiling {
            return Err(DaemonError::FrameTooLarge {
                len,
                ceiling: self.ceiling,
            });
        }
        let mut payload = vec![0u8; len];
        self.fill(&mut payload)?;
        Ok(payload)
    }

    fn fill(&mut self, buf: &mut [u8]) -> Result<(), DaemonError> {
        if self.fill_or_eof(buf)? {
            Ok(())
        } else {
            Err(DaemonError::ConnectionClosed("peer"))
        }
    }

    /// `Ok(false)` only when EOF arrives before the first byte.
    fn fill_or_eof(&mut self, buf: &mut [u8]) -> Result<bool, DaemonError> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.inner.read(&mut buf[filled..]) {
                Ok(0) if filled == 0 => return Ok(false),
                Ok(0) => return Err(DaemonError::ConnectionClosed("peer")),
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(stream_err(e)),
            }
        }
        Ok(true)
    }
}

pub struct FrameWriter<W> {
    inner: W,
    ceiling: usize,
}

impl<W: Write> FrameWriter<W> {
    pub fn new(inner: W, ceiling: usize) -> Self {
        Self { inner, ceiling }
    }

    pub fn write_request(&mut self, command: &str, payload: &[u8]) -> Result<(), DaemonError> {
        if command.is_empty() || command.len() > FIELD_WIDTH || !command.is_ascii() {
            return Err(DaemonError::Frame(format!("bad command name {command:?}")));
        }
        self.check(payload.len())?;
        let header = format!("{command:>width$}{}", length_field(payload.len()), width = FIELD_WIDTH);
        self.send(header.as_bytes(), payload)
    }

    pub fn write_response(&mut self, payload: &[u8]) -> Result<(), DaemonError> {
        self.check(payload.len())?;
        self.send(length_field(payload.len()).as_bytes(), payload)
    }

    fn check(&self, len: usize) -> Result<(), DaemonError> {
        if len > self.ceiling {
            return Err(DaemonError::FrameTooLarge {
                len,
                ceiling: self.ceiling,
            });
        }
        Ok(())
    }

    fn send(&mut self, header: &[u8], payload: &[u8]) -> Result<(), DaemonError> {
        self.inner.write_all(header).map_err(stream_err)?;
        self.inner.write_all(payload).map_err(stream_err)?;
        self.inner.flush().map_err(stream_err)
    }
}

fn stream_err(e: std::io::Error) -> DaemonError {
    match e.kind() {
        ErrorKind::BrokenPipe | ErrorKind::ConnectionReset | ErrorKind::UnexpectedEof => {
            DaemonError::ConnectionClosed("peer")
        }
        _ => DaemonError::Io {
            path: "<peer stream>".into(),
            source: e,
        },
    }
}
