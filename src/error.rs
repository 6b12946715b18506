use embedded_io_async::ErrorKind;

/// Errors surfaced by the engine and the socket façade.
///
/// Protocol outcomes (a timeout, an `ERROR` terminator, a peer closing the
/// connection) are not errors; they come back as [`crate::at::Outcome`],
/// `false` or a short byte count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[non_exhaustive]
pub enum Error {
    /// The underlying transport failed
    Io(ErrorKind),

    /// The handle refers to a socket that has been released
    InvalidSocket,
    /// Every arena entry is taken
    SocketSetFull,
    /// The module offers no mux for this kind of socket
    NoMux,

    /// A formatted command did not fit the line buffer
    CommandOverflow,
    /// The vendor catalog has no recipe for this operation
    Unsupported,
}

impl embedded_io_async::Error for Error {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::Io(kind) => *kind,
            Self::InvalidSocket => ErrorKind::NotConnected,
            Self::SocketSetFull | Self::NoMux => ErrorKind::OutOfMemory,
            Self::CommandOverflow => ErrorKind::InvalidInput,
            Self::Unsupported => ErrorKind::Unsupported,
        }
    }
}

impl From<core::fmt::Error> for Error {
    fn from(_: core::fmt::Error) -> Self {
        Self::CommandOverflow
    }
}
