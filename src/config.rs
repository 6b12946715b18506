use embassy_time::Duration;
use serde::{Deserialize, Serialize};

/// Line ending the module expects after a command and emits after each
/// response line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum LineTerminator {
    CrLf,
    Lf,
}

impl LineTerminator {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::CrLf => "\r\n",
            Self::Lf => "\n",
        }
    }

    /// Success terminator, including the line ending.
    pub const fn ok(&self) -> &'static str {
        match self {
            Self::CrLf => "OK\r\n",
            Self::Lf => "OK\n",
        }
    }

    /// Failure terminator, including the line ending.
    pub const fn error(&self) -> &'static str {
        match self {
            Self::CrLf => "ERROR\r\n",
            Self::Lf => "ERROR\n",
        }
    }
}

/// Where received bytes wait until the application reads them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BufferingMode {
    /// The module keeps received data in its own memory; it has to be queried
    /// and fetched explicitly.
    Module,
    /// The module pushes every received byte inside an unsolicited message.
    Push,
}

/// Per-vendor engine configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    pub line_terminator: LineTerminator,
    /// Prefix of a structured error line, e.g. `+CME ERROR:`
    pub verbose_error: Option<&'static str>,
    pub buffering: BufferingMode,
    pub mux_capacity: u8,
    /// Number of muxes, counted from zero, that may carry TLS. Never above
    /// `mux_capacity`.
    pub secure_mux_capacity: u8,
    pub max_send_chunk: usize,
    pub max_read_chunk: usize,
    /// Attempts per chunk before a send is abandoned
    pub send_attempts: u8,

    pub command_timeout: Duration,
    /// Per-token deadline of the line reader helpers
    pub read_timeout: Duration,
    /// Pause between two polls of an idle stream
    pub poll_interval: Duration,
    /// How long a maintenance poll listens for unsolicited messages
    pub urc_window: Duration,
    pub close_timeout: Duration,
}

impl Config {
    pub const fn new() -> Self {
        Self {
            line_terminator: LineTerminator::CrLf,
            verbose_error: None,
            buffering: BufferingMode::Module,
            mux_capacity: 1,
            secure_mux_capacity: 0,
            max_send_chunk: 256,
            max_read_chunk: 256,
            send_attempts: 3,
            command_timeout: Duration::from_secs(1),
            read_timeout: Duration::from_secs(1),
            poll_interval: Duration::from_millis(1),
            urc_window: Duration::from_millis(15),
            close_timeout: Duration::from_secs(5),
        }
    }

    pub const fn line_terminator(mut self, line_terminator: LineTerminator) -> Self {
        self.line_terminator = line_terminator;
        self
    }

    pub const fn verbose_error(mut self, prefix: &'static str) -> Self {
        self.verbose_error = Some(prefix);
        self
    }

    pub const fn buffering(mut self, buffering: BufferingMode) -> Self {
        self.buffering = buffering;
        self
    }

    pub const fn mux_capacity(mut self, standard: u8, secure: u8) -> Self {
        self.mux_capacity = standard;
        self.secure_mux_capacity = if secure > standard { standard } else { secure };
        self
    }

    pub const fn max_send_chunk(mut self, len: usize) -> Self {
        self.max_send_chunk = len;
        self
    }

    pub const fn max_read_chunk(mut self, len: usize) -> Self {
        self.max_read_chunk = len;
        self
    }

    pub const fn send_attempts(mut self, attempts: u8) -> Self {
        self.send_attempts = attempts;
        self
    }

    pub const fn command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    pub const fn read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub const fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub const fn urc_window(mut self, window: Duration) -> Self {
        self.urc_window = window;
        self
    }

    pub const fn close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout = timeout;
        self
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}
