mod buffer;
mod set;

pub use buffer::RxBuffer;
pub use set::{SharedSockets, SocketHandle, SocketSet};

use serde::{Deserialize, Serialize};

/// Lifecycle of a socket as seen by the application.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Default, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum State {
    /// Not connected, nothing held on the module
    #[default]
    Idle,
    /// Connect transaction in flight
    Connecting,
    Connected,
    /// Draining the module-side backlog before the close command
    Closing,
}

/// Identifier of a TLS context (security profile) configured on the module.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ContextId(pub u8);

/// A set of mux numbers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct MuxMask(u32);

impl MuxMask {
    pub const fn empty() -> Self {
        Self(0)
    }

    pub fn insert(&mut self, mux: u8) {
        if mux < 32 {
            self.0 |= 1 << mux;
        }
    }

    pub fn remove(&mut self, mux: u8) {
        if mux < 32 {
            self.0 &= !(1 << mux);
        }
    }

    pub fn contains(&self, mux: u8) -> bool {
        mux < 32 && self.0 & (1 << mux) != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn iter(self) -> impl Iterator<Item = u8> {
        (0..32u8).filter(move |mux| self.contains(*mux))
    }
}

/// State mutations reachable from unsolicited message handlers and command
/// recipes. Everything here is synchronous: a handler finishes mutating a
/// socket before the engine resumes matching.
///
/// Unknown or unregistered muxes are ignored.
pub trait SocketAccess {
    fn is_registered(&self, mux: u8) -> bool;

    /// Record the connection state. `false` is an asynchronous close: the
    /// socket returns to [`State::Idle`] but keeps its received backlog.
    fn set_connected(&self, mux: u8, connected: bool);

    /// Flag that the module holds new data worth querying on the next poll.
    fn set_got_data(&self, mux: u8);

    /// Record how many bytes the module reports as buffered on its side.
    fn set_available(&self, mux: u8, available: usize);

    /// Append payload bytes to the receive buffer. Returns how many were
    /// accepted; the remainder is dropped.
    fn enqueue(&self, mux: u8, data: &[u8]) -> usize;

    /// Free space in the receive buffer.
    fn rx_window(&self, mux: u8) -> usize;

    /// Muxes on which the module currently holds a connection.
    fn active(&self) -> MuxMask;

    fn disconnect_all(&self) {
        for mux in self.active().iter() {
            self.set_connected(mux, false);
        }
    }
}

/// Per-socket state kept in the [`SocketSet`] arena.
#[derive(Debug)]
pub struct Socket<const RX: usize> {
    pub(crate) requested_mux: u8,
    pub(crate) mux: Option<u8>,
    pub(crate) tls: Option<ContextId>,
    pub(crate) state: State,
    pub(crate) connected: bool,
    pub(crate) available: usize,
    pub(crate) got_data: bool,
    /// The module holds resources for `mux` that need an explicit close.
    pub(crate) opened: bool,
    pub(crate) rx: RxBuffer<RX>,
}

impl<const RX: usize> Socket<RX> {
    pub(crate) fn new(requested_mux: u8, tls: Option<ContextId>) -> Self {
        Self {
            requested_mux,
            mux: None,
            tls,
            state: State::Idle,
            connected: false,
            available: 0,
            got_data: false,
            opened: false,
            rx: RxBuffer::new(),
        }
    }

    /// The mux currently owned in the registry, if any.
    pub fn mux(&self) -> Option<u8> {
        self.mux
    }

    pub fn is_secure(&self) -> bool {
        self.tls.is_some()
    }

    pub fn context(&self) -> Option<ContextId> {
        self.tls
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Bytes the module still holds for this socket.
    pub fn module_available(&self) -> usize {
        self.available
    }

    /// Bytes readable without a round trip plus bytes still on the module.
    pub fn readable(&self) -> usize {
        self.rx.len() + self.available
    }

    pub(crate) fn begin_connect(&mut self) {
        self.state = State::Connecting;
        self.connected = false;
        self.available = 0;
        self.got_data = false;
        self.rx.clear();
    }

    pub(crate) fn established(&mut self) {
        self.state = State::Connected;
        self.connected = true;
        self.opened = true;
    }

    /// The peer (or the network) closed the connection. Module-side reads
    /// stop, the local backlog stays readable.
    pub(crate) fn closed_by_peer(&mut self) {
        self.connected = false;
        self.available = 0;
        self.got_data = false;
        self.state = State::Idle;
    }

    pub(crate) fn reset(&mut self) {
        self.closed_by_peer();
        self.opened = false;
        self.rx.clear();
    }
}
