#[cfg(feature = "esp-at")]
pub mod esp_at;
#[cfg(feature = "simcom")]
pub mod simcom;
#[cfg(feature = "ublox")]
pub mod ublox;

use embassy_time::Duration;
use no_std_net::Ipv4Addr;

use crate::at::{parse_int, trim, Reader, Session, Transport, UrcHandler};
use crate::config::Config;
use crate::error::Error;
use crate::socket::{ContextId, SocketAccess};

/// Outcome of one module-side read.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Received {
    /// Bytes moved into the receive buffer.
    pub moved: usize,
    /// Bytes the module says it still holds, if the reply carries a count.
    pub left: Option<usize>,
}

impl Received {
    pub const fn new(moved: usize, left: Option<usize>) -> Self {
        Self { moved, left }
    }

    /// The module-side count after asking for `want` bytes while `before`
    /// were believed to be waiting. A short read means the old count was
    /// stale and nothing is left.
    pub fn remaining(&self, before: usize, want: usize) -> usize {
        match self.left {
            Some(left) => left,
            None if self.moved < want => 0,
            None => before.saturating_sub(self.moved),
        }
    }
}

/// The command catalog of one module family.
///
/// Recipes only format commands and parse replies; the transaction engine,
/// the socket registry and the send/receive flow stay in the core. Every
/// recipe runs inside a [`Session`] the caller already holds, and returns
/// `false`, `None` or `0` for protocol failures.
pub trait Dialect: UrcHandler {
    fn config(&self) -> Config;

    /// Bring the module into the mode the socket layer expects.
    async fn init<S: Transport, U: UrcHandler>(
        &self,
        at: &mut Session<'_, S, U>,
    ) -> Result<bool, Error> {
        if !at.command(format_args!("E0")).await? {
            return Ok(false);
        }
        if self.config().verbose_error.is_some() {
            return at.command(format_args!("+CMEE=2")).await;
        }
        Ok(true)
    }

    /// Open a TCP connection on `mux`. Returns the mux the module actually
    /// used, `None` when the connection failed.
    async fn open<S: Transport, U: UrcHandler>(
        &self,
        at: &mut Session<'_, S, U>,
        mux: u8,
        host: &str,
        port: u16,
        tls: Option<ContextId>,
        timeout: Duration,
    ) -> Result<Option<u8>, Error>;

    /// Announce a payload of `len` bytes and wait for the prompt.
    async fn begin_send<S: Transport, U: UrcHandler>(
        &self,
        at: &mut Session<'_, S, U>,
        mux: u8,
        len: usize,
    ) -> Result<bool, Error>;

    /// Wait for the module to confirm a payload. Returns the number of bytes
    /// it accepted.
    async fn end_send<S: Transport, U: UrcHandler>(
        &self,
        at: &mut Session<'_, S, U>,
        mux: u8,
        len: usize,
    ) -> Result<usize, Error>;

    /// Free space in the module's send buffer, for modules that can report
    /// it.
    async fn send_space<S: Transport, U: UrcHandler>(
        &self,
        _at: &mut Session<'_, S, U>,
        _mux: u8,
    ) -> Result<Option<usize>, Error> {
        Ok(None)
    }

    /// Bytes waiting on the module's side. Only used in
    /// [`BufferingMode::Module`](crate::config::BufferingMode::Module); the
    /// caller records the count.
    async fn available<S: Transport, U: UrcHandler>(
        &self,
        _at: &mut Session<'_, S, U>,
        _mux: u8,
    ) -> Result<usize, Error> {
        Ok(0)
    }

    /// Move up to `len` bytes from the module into the socket's receive
    /// buffer. The caller updates the module-side count from the result.
    async fn read<S: Transport, U: UrcHandler>(
        &self,
        _at: &mut Session<'_, S, U>,
        _mux: u8,
        _len: usize,
    ) -> Result<Received, Error> {
        Ok(Received::default())
    }

    async fn is_connected<S: Transport, U: UrcHandler>(
        &self,
        at: &mut Session<'_, S, U>,
        mux: u8,
    ) -> Result<bool, Error>;

    /// Close `mux`. `false` if the module never confirmed.
    async fn close<S: Transport, U: UrcHandler>(
        &self,
        at: &mut Session<'_, S, U>,
        mux: u8,
    ) -> Result<bool, Error>;

    /// Refresh the connection state of every open socket.
    async fn refresh<S: Transport, U: UrcHandler>(
        &self,
        at: &mut Session<'_, S, U>,
    ) -> Result<(), Error> {
        let sockets = at.sockets();
        for mux in sockets.active().iter() {
            let connected = self.is_connected(at, mux).await?;
            sockets.set_connected(mux, connected);
        }
        Ok(())
    }

    async fn local_ip<S: Transport, U: UrcHandler>(
        &self,
        _at: &mut Session<'_, S, U>,
    ) -> Result<Option<Ipv4Addr>, Error> {
        Err(Error::Unsupported)
    }
}

/// Parse a dotted quad out of a response fragment.
pub(crate) fn parse_ipv4(bytes: &[u8]) -> Option<Ipv4Addr> {
    let text = core::str::from_utf8(trim(bytes)).ok()?;
    text.trim_matches('"').parse().ok()
}

/// Read a mux number terminated by `delimiter`.
pub(crate) async fn read_mux<S: Transport>(
    reader: &mut Reader<S>,
    delimiter: u8,
) -> Result<Option<u8>, Error> {
    Ok(reader
        .int_until(delimiter)
        .await?
        .and_then(|mux| u8::try_from(mux).ok()))
}

/// The mux that starts the line ending in `suffix`, as in `3, CLOSED`.
pub(crate) fn line_mux(buf: &[u8], suffix: &[u8]) -> Option<u8> {
    let head = buf.strip_suffix(suffix)?;
    let start = head.iter().rposition(|b| *b == b'\n').map_or(0, |i| i + 1);
    parse_int(&head[start..]).and_then(|mux| u8::try_from(mux).ok())
}

/// Copy `len` payload bytes from the stream into the receive buffer of
/// `mux`. Returns how many were read off the stream; bytes that don't fit
/// the buffer are dropped.
pub(crate) async fn drain_payload<S: Transport>(
    reader: &mut Reader<S>,
    sockets: &dyn SocketAccess,
    mux: u8,
    len: usize,
) -> Result<usize, Error> {
    let mut chunk = [0u8; 64];
    let mut read = 0;
    while read < len {
        let want = (len - read).min(chunk.len());
        let got = reader.read_exact(&mut chunk[..want]).await?;
        sockets.enqueue(mux, &chunk[..got]);
        read += got;
        if got < want {
            warn!("[{}] Payload cut short, {} bytes missing", mux, len - read);
            break;
        }
    }
    Ok(read)
}

/// A dialect picked at runtime, e.g. after reading the model id.
#[derive(Debug, Clone, Copy)]
pub enum Module {
    #[cfg(feature = "ublox")]
    Ublox(ublox::Ublox),
    #[cfg(feature = "simcom")]
    Simcom(simcom::Simcom),
    #[cfg(feature = "esp-at")]
    EspAt(esp_at::EspAt),
}

impl Module {
    /// Match the reply of `AT+CGMM`/`AT+GMR` against the known families.
    pub fn from_model_id(model: &[u8]) -> Option<Self> {
        let starts = |prefix: &[u8]| model.starts_with(prefix);
        match () {
            #[cfg(feature = "ublox")]
            _ if starts(b"SARA") || starts(b"LARA") || starts(b"TOBY") => {
                Some(Self::Ublox(ublox::Ublox))
            }
            #[cfg(feature = "simcom")]
            _ if starts(b"SIM") => Some(Self::Simcom(simcom::Simcom)),
            #[cfg(feature = "esp-at")]
            _ if starts(b"ESP") || starts(b"AT version") => Some(Self::EspAt(esp_at::EspAt)),
            _ => {
                warn!("Unknown module {:?}", crate::fmt::LossyStr(model));
                None
            }
        }
    }
}

macro_rules! inner {
    ($self: ident, $fn: ident ( $($arg: expr),* )) => {
        match $self {
            #[cfg(feature = "ublox")]
            Self::Ublox(inner) => inner.$fn($($arg),*).await,
            #[cfg(feature = "simcom")]
            Self::Simcom(inner) => inner.$fn($($arg),*).await,
            #[cfg(feature = "esp-at")]
            Self::EspAt(inner) => inner.$fn($($arg),*).await,
        }
    };
}

impl UrcHandler for Module {
    async fn handle<S: Transport>(
        &self,
        buf: &[u8],
        reader: &mut Reader<S>,
        sockets: &dyn SocketAccess,
    ) -> Result<bool, Error> {
        inner!(self, handle(buf, reader, sockets))
    }
}

impl Dialect for Module {
    fn config(&self) -> Config {
        match self {
            #[cfg(feature = "ublox")]
            Self::Ublox(inner) => inner.config(),
            #[cfg(feature = "simcom")]
            Self::Simcom(inner) => inner.config(),
            #[cfg(feature = "esp-at")]
            Self::EspAt(inner) => inner.config(),
        }
    }

    async fn init<S: Transport, U: UrcHandler>(
        &self,
        at: &mut Session<'_, S, U>,
    ) -> Result<bool, Error> {
        inner!(self, init(at))
    }

    async fn open<S: Transport, U: UrcHandler>(
        &self,
        at: &mut Session<'_, S, U>,
        mux: u8,
        host: &str,
        port: u16,
        tls: Option<ContextId>,
        timeout: Duration,
    ) -> Result<Option<u8>, Error> {
        inner!(self, open(at, mux, host, port, tls, timeout))
    }

    async fn begin_send<S: Transport, U: UrcHandler>(
        &self,
        at: &mut Session<'_, S, U>,
        mux: u8,
        len: usize,
    ) -> Result<bool, Error> {
        inner!(self, begin_send(at, mux, len))
    }

    async fn end_send<S: Transport, U: UrcHandler>(
        &self,
        at: &mut Session<'_, S, U>,
        mux: u8,
        len: usize,
    ) -> Result<usize, Error> {
        inner!(self, end_send(at, mux, len))
    }

    async fn send_space<S: Transport, U: UrcHandler>(
        &self,
        at: &mut Session<'_, S, U>,
        mux: u8,
    ) -> Result<Option<usize>, Error> {
        inner!(self, send_space(at, mux))
    }

    async fn available<S: Transport, U: UrcHandler>(
        &self,
        at: &mut Session<'_, S, U>,
        mux: u8,
    ) -> Result<usize, Error> {
        inner!(self, available(at, mux))
    }

    async fn read<S: Transport, U: UrcHandler>(
        &self,
        at: &mut Session<'_, S, U>,
        mux: u8,
        len: usize,
    ) -> Result<Received, Error> {
        inner!(self, read(at, mux, len))
    }

    async fn is_connected<S: Transport, U: UrcHandler>(
        &self,
        at: &mut Session<'_, S, U>,
        mux: u8,
    ) -> Result<bool, Error> {
        inner!(self, is_connected(at, mux))
    }

    async fn close<S: Transport, U: UrcHandler>(
        &self,
        at: &mut Session<'_, S, U>,
        mux: u8,
    ) -> Result<bool, Error> {
        inner!(self, close(at, mux))
    }

    async fn refresh<S: Transport, U: UrcHandler>(
        &self,
        at: &mut Session<'_, S, U>,
    ) -> Result<(), Error> {
        inner!(self, refresh(at))
    }

    async fn local_ip<S: Transport, U: UrcHandler>(
        &self,
        at: &mut Session<'_, S, U>,
    ) -> Result<Option<Ipv4Addr>, Error> {
        inner!(self, local_ip(at))
    }
}
