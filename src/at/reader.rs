use embassy_time::{Duration, Instant, Timer};
use embedded_io_async::{Read, ReadReady, Write};
use heapless::Vec;

use crate::config::Config;
use crate::error::Error;

/// The byte stream the engine runs over: a UART, a CMUX channel, a mock.
pub trait Transport: Read + Write + ReadReady {}

impl<T: Read + Write + ReadReady> Transport for T {}

fn io<E: embedded_io_async::Error>(e: E) -> Error {
    Error::Io(e.kind())
}

/// Strip ASCII whitespace from both ends.
pub fn trim(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    let end = bytes
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(start, |i| i + 1);
    &bytes[start..end]
}

/// `timeout` from now. A timeout too long to represent never expires.
pub fn deadline(timeout: Duration) -> Instant {
    Instant::now().checked_add(timeout).unwrap_or(Instant::MAX)
}

pub fn parse_int(bytes: &[u8]) -> Option<i32> {
    core::str::from_utf8(trim(bytes)).ok()?.parse().ok()
}

pub fn parse_float(bytes: &[u8]) -> Option<f32> {
    core::str::from_utf8(trim(bytes)).ok()?.parse().ok()
}

/// Token-level access to the byte stream.
///
/// Every helper gives up once `read_timeout` passes without the delimiter
/// (or, for [`Reader::read_exact`], without a new byte).
pub struct Reader<S> {
    stream: S,
    timeout: Duration,
    poll_interval: Duration,
}

impl<S: Transport> Reader<S> {
    pub(crate) fn new(stream: S, config: &Config) -> Self {
        Self {
            stream,
            timeout: config.read_timeout,
            poll_interval: config.poll_interval,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn inner(&mut self) -> &mut S {
        &mut self.stream
    }

    /// Suspend until the next poll of an idle stream.
    pub async fn pause(&self) {
        if self.poll_interval.as_ticks() == 0 {
            embassy_futures::yield_now().await;
        } else {
            Timer::after(self.poll_interval).await;
        }
    }

    /// `true` when at least one byte can be read without suspending.
    pub fn ready(&mut self) -> Result<bool, Error> {
        self.stream.read_ready().map_err(io)
    }

    /// Next byte, if one has already arrived.
    pub async fn try_read_byte(&mut self) -> Result<Option<u8>, Error> {
        if !self.ready()? {
            return Ok(None);
        }
        let mut byte = [0u8; 1];
        match self.stream.read(&mut byte).await.map_err(io)? {
            0 => Ok(None),
            _ => Ok(Some(byte[0])),
        }
    }

    async fn next_byte(&mut self, deadline: Instant) -> Result<Option<u8>, Error> {
        loop {
            if let Some(byte) = self.try_read_byte().await? {
                return Ok(Some(byte));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            self.pause().await;
        }
    }

    /// Wait up to the read timeout for one byte.
    pub async fn read_byte(&mut self) -> Result<Option<u8>, Error> {
        let deadline = deadline(self.timeout);
        self.next_byte(deadline).await
    }

    /// Collect bytes into `out` up to, not including, `delimiter`. Bytes that
    /// don't fit in `out` are discarded. Returns `false` on timeout.
    pub async fn read_until<const N: usize>(
        &mut self,
        delimiter: u8,
        out: &mut Vec<u8, N>,
    ) -> Result<bool, Error> {
        let deadline = deadline(self.timeout);
        while let Some(byte) = self.next_byte(deadline).await? {
            if byte == delimiter {
                return Ok(true);
            }
            out.push(byte).ok();
        }
        Ok(false)
    }

    pub async fn skip_until(&mut self, delimiter: u8) -> Result<bool, Error> {
        let deadline = deadline(self.timeout);
        while let Some(byte) = self.next_byte(deadline).await? {
            if byte == delimiter {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Parse the integer that precedes `delimiter`.
    pub async fn int_until(&mut self, delimiter: u8) -> Result<Option<i32>, Error> {
        let mut token: Vec<u8, 16> = Vec::new();
        if !self.read_until(delimiter, &mut token).await? {
            return Ok(None);
        }
        Ok(parse_int(&token))
    }

    pub async fn float_until(&mut self, delimiter: u8) -> Result<Option<f32>, Error> {
        let mut token: Vec<u8, 24> = Vec::new();
        if !self.read_until(delimiter, &mut token).await? {
            return Ok(None);
        }
        Ok(parse_float(&token))
    }

    /// Fill `buf`, returning how many bytes arrived before the stream went
    /// quiet for longer than the read timeout.
    pub async fn read_exact(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        for (count, slot) in buf.iter_mut().enumerate() {
            match self.read_byte().await? {
                Some(byte) => *slot = byte,
                None => return Ok(count),
            }
        }
        Ok(buf.len())
    }

    pub async fn write_all(&mut self, bytes: &[u8]) -> Result<(), Error> {
        self.stream.write_all(bytes).await.map_err(io)
    }

    pub async fn flush(&mut self) -> Result<(), Error> {
        self.stream.flush().await.map_err(io)
    }
}
