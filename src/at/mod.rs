//! The AT transaction engine.
//!
//! One command is in flight at a time. After writing it, [`AtClient::wait_response`]
//! pulls the reply byte by byte into an accumulator, offers every new tail to a
//! [`UrcHandler`] first and then tests it against the caller's terminators.

mod reader;

pub use reader::{deadline, parse_float, parse_int, trim, Reader, Transport};

use core::fmt::{self, Write as _};

use embassy_sync::{blocking_mutex::raw::NoopRawMutex, mutex::MutexGuard};
use embassy_time::{Duration, Instant};
use heapless::{String, Vec};

use crate::config::Config;
use crate::error::Error;
use crate::fmt::LossyStr;
use crate::socket::SocketAccess;

/// Size of the accumulator, which doubles as the capture buffer.
pub const INGRESS_BUF_SIZE: usize = 256;
/// Longest command line, `AT` prefix and line terminator included.
pub const LINE_BUF_SIZE: usize = 256;
pub const MAX_PATTERNS: usize = 5;

/// Result of waiting for a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Outcome {
    /// 1-based index of the pattern that matched first
    Matched(usize),
    Timeout,
}

impl Outcome {
    /// Numeric form, `0` standing for a timeout.
    pub fn index(&self) -> usize {
        match self {
            Self::Matched(index) => *index,
            Self::Timeout => 0,
        }
    }

    pub fn is(&self, index: usize) -> bool {
        *self == Self::Matched(index)
    }
}

/// Recognizes unsolicited messages inside a pending transaction.
///
/// Handlers get the stream to finish reading the message and the socket
/// state to record its effect. They cannot issue commands: any query a
/// notice calls for is left to the next maintenance poll.
pub trait UrcHandler {
    /// Called after every byte appended to `buf`. Returns `true` once the
    /// tail was an unsolicited message that has been fully consumed.
    async fn handle<S: Transport>(
        &self,
        buf: &[u8],
        reader: &mut Reader<S>,
        sockets: &dyn SocketAccess,
    ) -> Result<bool, Error>;
}

/// Handler for transactions that expect no unsolicited traffic.
pub struct NoUrc;

impl UrcHandler for NoUrc {
    async fn handle<S: Transport>(
        &self,
        _buf: &[u8],
        _reader: &mut Reader<S>,
        _sockets: &dyn SocketAccess,
    ) -> Result<bool, Error> {
        Ok(false)
    }
}

pub struct AtClient<S> {
    reader: Reader<S>,
    buf: Vec<u8, INGRESS_BUF_SIZE>,
    config: Config,
}

impl<S: Transport> AtClient<S> {
    pub fn new(stream: S, config: Config) -> Self {
        Self {
            reader: Reader::new(stream, &config),
            buf: Vec::new(),
            config,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn reader(&mut self) -> &mut Reader<S> {
        &mut self.reader
    }

    /// Text accumulated by the last wait, terminator included.
    pub fn response(&self) -> &[u8] {
        &self.buf
    }

    /// Write `AT<command><line terminator>`.
    pub async fn send(&mut self, command: fmt::Arguments<'_>) -> Result<(), Error> {
        let mut line: String<LINE_BUF_SIZE> = String::new();
        line.write_str("AT")?;
        line.write_fmt(command)?;
        debug!("Sending command: {:?}", LossyStr(line.as_bytes()));
        line.write_str(self.config.line_terminator.as_str())?;

        self.reader.write_all(line.as_bytes()).await?;
        self.reader.flush().await
    }

    /// Write payload bytes without any framing.
    pub async fn write_raw(&mut self, bytes: &[u8]) -> Result<(), Error> {
        trace!("Writing {} raw bytes", bytes.len());
        self.reader.write_all(bytes).await?;
        self.reader.flush().await
    }

    fn push(&mut self, byte: u8) {
        if self.buf.is_full() {
            // Keep the tail, it is what the patterns are tested against.
            self.buf.remove(0);
        }
        self.buf.push(byte).ok();
    }

    /// Wait for the first of up to [`MAX_PATTERNS`] terminators.
    ///
    /// Patterns are suffix-matched against everything received since the
    /// call started, in priority order. Unsolicited messages recognized by
    /// `urc` are dropped from the accumulator and never match.
    pub async fn wait_response<U: UrcHandler>(
        &mut self,
        timeout: Duration,
        patterns: &[&str],
        urc: &U,
        sockets: &dyn SocketAccess,
    ) -> Result<Outcome, Error> {
        debug_assert!(patterns.len() <= MAX_PATTERNS);
        self.buf.clear();
        let deadline = reader::deadline(timeout);

        loop {
            let Some(byte) = self.reader.try_read_byte().await? else {
                if Instant::now() >= deadline {
                    break;
                }
                self.reader.pause().await;
                continue;
            };

            // Line noise
            if byte == 0 {
                continue;
            }
            self.push(byte);

            if urc.handle(&self.buf, &mut self.reader, sockets).await? {
                self.buf.clear();
                continue;
            }

            if let Some(index) = patterns
                .iter()
                .position(|p| self.buf.ends_with(p.as_bytes()))
            {
                if Some(patterns[index]) == self.config.verbose_error {
                    let mut detail: Vec<u8, 64> = Vec::new();
                    self.reader.read_until(b'\n', &mut detail).await?;
                    error!(
                        "{} {:?}",
                        patterns[index],
                        LossyStr(reader::trim(&detail))
                    );
                }
                return Ok(Outcome::Matched(index + 1));
            }

            if Instant::now() >= deadline {
                break;
            }
        }

        let rest = reader::trim(&self.buf);
        if !rest.is_empty() {
            warn!("Unhandled: {:?}", LossyStr(rest));
        }
        Ok(Outcome::Timeout)
    }

    /// Wait on the default set: `OK`, `ERROR`, then the verbose error prefix
    /// when the module reports one.
    pub async fn wait_ok<U: UrcHandler>(
        &mut self,
        timeout: Duration,
        urc: &U,
        sockets: &dyn SocketAccess,
    ) -> Result<Outcome, Error> {
        let terminator = self.config.line_terminator;
        match self.config.verbose_error {
            Some(verbose) => {
                let patterns = [terminator.ok(), terminator.error(), verbose];
                self.wait_response(timeout, &patterns, urc, sockets).await
            }
            None => {
                let patterns = [terminator.ok(), terminator.error()];
                self.wait_response(timeout, &patterns, urc, sockets).await
            }
        }
    }
}

/// Exclusive access to the engine for the duration of a recipe.
///
/// Holding a session keeps every other caller out of the stream, so a
/// multi-step exchange (create, configure, connect) can't be interleaved
/// with someone else's command.
pub struct Session<'a, S, U> {
    at: MutexGuard<'a, NoopRawMutex, AtClient<S>>,
    urc: &'a U,
    sockets: &'a dyn SocketAccess,
}

impl<'a, S: Transport, U: UrcHandler> Session<'a, S, U> {
    pub(crate) fn new(
        at: MutexGuard<'a, NoopRawMutex, AtClient<S>>,
        urc: &'a U,
        sockets: &'a dyn SocketAccess,
    ) -> Self {
        Self {
            at,
            urc,
            sockets,
        }
    }

    pub fn config(&self) -> Config {
        *self.at.config()
    }

    pub fn sockets(&self) -> &'a dyn SocketAccess {
        self.sockets
    }

    pub fn reader(&mut self) -> &mut Reader<S> {
        self.at.reader()
    }

    pub fn response(&self) -> &[u8] {
        self.at.response()
    }

    pub async fn send(&mut self, command: fmt::Arguments<'_>) -> Result<(), Error> {
        self.at.send(command).await
    }

    pub async fn write_raw(&mut self, bytes: &[u8]) -> Result<(), Error> {
        self.at.write_raw(bytes).await
    }

    pub async fn wait(&mut self, timeout: Duration, patterns: &[&str]) -> Result<Outcome, Error> {
        let (urc, sockets) = (self.urc, self.sockets);
        self.at
            .wait_response(timeout, patterns, urc, sockets)
            .await
    }

    pub async fn wait_ok(&mut self, timeout: Duration) -> Result<Outcome, Error> {
        let (urc, sockets) = (self.urc, self.sockets);
        self.at.wait_ok(timeout, urc, sockets).await
    }

    /// Wait for `pattern`, giving up early on `ERROR` or a verbose error.
    pub async fn expect(&mut self, timeout: Duration, pattern: &str) -> Result<bool, Error> {
        let config = *self.at.config();
        let error = config.line_terminator.error();
        let outcome = match config.verbose_error {
            Some(verbose) => self.wait(timeout, &[pattern, error, verbose]).await?,
            None => self.wait(timeout, &[pattern, error]).await?,
        };
        Ok(outcome.is(1))
    }

    /// Send and wait for `OK` within the configured command timeout.
    pub async fn command(&mut self, command: fmt::Arguments<'_>) -> Result<bool, Error> {
        self.send(command).await?;
        let timeout = self.at.config().command_timeout;
        Ok(self.wait_ok(timeout).await?.is(1))
    }
}
