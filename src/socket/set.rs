use core::cell::RefCell;

use embassy_sync::blocking_mutex::{raw::NoopRawMutex, Mutex};
use serde::{Deserialize, Serialize};

use super::{ContextId, MuxMask, Socket, SocketAccess, State};
use crate::error::Error;

/// A generation-checked index into a [`SocketSet`].
///
/// Releasing a socket bumps the generation of its entry, so handles kept
/// around afterwards fail with [`Error::InvalidSocket`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SocketHandle {
    index: u8,
    generation: u16,
}

#[derive(Debug)]
struct Entry<const RX: usize> {
    generation: u16,
    socket: Option<Socket<RX>>,
}

/// Arena of sockets plus the mux registry pointing into it.
///
/// The registry never owns a socket; it stores handles, and a handle whose
/// entry was released or reused simply stops resolving.
#[derive(Debug)]
pub struct SocketSet<const N: usize, const RX: usize> {
    entries: [Entry<RX>; N],
    muxes: [Option<SocketHandle>; N],
    capacity: u8,
    secure_capacity: u8,
    /// Muxes still open on the module after their socket went away
    dropped: MuxMask,
}

impl<const N: usize, const RX: usize> SocketSet<N, RX> {
    /// `capacity` and `secure_capacity` are clamped to `N`, and the secure
    /// range never exceeds the standard one.
    pub fn new(capacity: u8, secure_capacity: u8) -> Self {
        let capacity = capacity.min(N.min(u8::MAX as usize) as u8);
        Self {
            entries: core::array::from_fn(|_| Entry {
                generation: 0,
                socket: None,
            }),
            muxes: [None; N],
            capacity,
            secure_capacity: secure_capacity.min(capacity),
            dropped: MuxMask::empty(),
        }
    }

    pub fn capacity(&self) -> u8 {
        self.capacity
    }

    pub fn secure_capacity(&self) -> u8 {
        self.secure_capacity
    }

    /// Number of live sockets.
    pub fn len(&self) -> usize {
        self.entries.iter().filter(|e| e.socket.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn range(&self, secure: bool) -> u8 {
        if secure {
            self.secure_capacity
        } else {
            self.capacity
        }
    }

    /// Create a socket and give it a provisional mux.
    pub fn add(&mut self, requested_mux: u8, tls: Option<ContextId>) -> Result<SocketHandle, Error> {
        if self.range(tls.is_some()) == 0 {
            return Err(Error::NoMux);
        }

        let index = self
            .entries
            .iter()
            .position(|e| e.socket.is_none())
            .ok_or(Error::SocketSetFull)?;

        let entry = &mut self.entries[index];
        entry.socket = Some(Socket::new(requested_mux, tls));
        let handle = SocketHandle {
            index: index as u8,
            generation: entry.generation,
        };

        self.assign(handle, requested_mux)?;
        Ok(handle)
    }

    pub fn get(&self, handle: SocketHandle) -> Result<&Socket<RX>, Error> {
        match self.entries.get(handle.index as usize) {
            Some(Entry {
                generation,
                socket: Some(socket),
            }) if *generation == handle.generation => Ok(socket),
            _ => Err(Error::InvalidSocket),
        }
    }

    pub fn get_mut(&mut self, handle: SocketHandle) -> Result<&mut Socket<RX>, Error> {
        match self.entries.get_mut(handle.index as usize) {
            Some(Entry {
                generation,
                socket: Some(socket),
            }) if *generation == handle.generation => Ok(socket),
            _ => Err(Error::InvalidSocket),
        }
    }

    /// The live handle registered on `mux`.
    pub fn owner(&self, mux: u8) -> Option<SocketHandle> {
        let handle = (*self.muxes.get(mux as usize)?)?;
        let socket = self.get(handle).ok()?;
        (socket.mux == Some(mux)).then_some(handle)
    }

    pub fn by_mux(&self, mux: u8) -> Option<&Socket<RX>> {
        let handle = self.owner(mux)?;
        self.get(handle).ok()
    }

    pub fn by_mux_mut(&mut self, mux: u8) -> Option<&mut Socket<RX>> {
        let handle = self.owner(mux)?;
        self.get_mut(handle).ok()
    }

    fn first_free(&self, range: u8) -> Option<u8> {
        (0..range).find(|mux| self.owner(*mux).is_none())
    }

    fn register(&mut self, handle: SocketHandle, mux: u8) -> Result<(), Error> {
        let slot = self.muxes.get_mut(mux as usize).ok_or(Error::NoMux)?;
        *slot = Some(handle);
        self.get_mut(handle)?.mux = Some(mux);
        Ok(())
    }

    pub(crate) fn unregister(&mut self, handle: SocketHandle) {
        let Ok(socket) = self.get_mut(handle) else {
            return;
        };
        if let Some(mux) = socket.mux.take() {
            if let Some(slot) = self.muxes.get_mut(mux as usize) {
                if *slot == Some(handle) {
                    *slot = None;
                }
            }
        }
    }

    fn evict(&mut self, victim: SocketHandle) {
        let Ok(socket) = self.get_mut(victim) else {
            return;
        };
        warn!("Evicting socket from mux {:?}", socket.mux);
        let held = socket.opened.then_some(socket.mux).flatten();
        socket.closed_by_peer();
        socket.opened = false;
        if let Some(mux) = held {
            self.dropped.insert(mux);
        }
        self.unregister(victim);
    }

    /// Muxes left open on the module by released or evicted sockets that no
    /// socket occupies now. A mux already handed to another socket stays
    /// marked until that socket connects or moves away.
    pub fn take_dropped(&mut self) -> MuxMask {
        let mut free = MuxMask::empty();
        for mux in self.dropped.iter() {
            if self.owner(mux).is_none() {
                free.insert(mux);
            }
        }
        for mux in free.iter() {
            self.dropped.remove(mux);
        }
        free
    }

    /// Whether `mux` was left open on the module, clearing the mark.
    pub fn take_dropped_mux(&mut self, mux: u8) -> bool {
        let dropped = self.dropped.contains(mux);
        self.dropped.remove(mux);
        dropped
    }

    /// Pick a mux for `handle`, preferring `requested`.
    ///
    /// Falls back to the first free mux, then to `requested` modulo the
    /// capacity, evicting whoever sits there.
    pub fn assign(&mut self, handle: SocketHandle, requested: u8) -> Result<u8, Error> {
        let socket = self.get(handle)?;
        let current = socket.mux;
        let range = self.range(socket.is_secure());
        if range == 0 {
            return Err(Error::NoMux);
        }

        let requested_free = match self.owner(requested) {
            None => true,
            Some(owner) => owner == handle,
        };

        let mux = if requested < range && requested_free {
            requested
        } else if let Some(free) = self.first_free(range) {
            free
        } else {
            let fallback = requested % range;
            if let Some(victim) = self.owner(fallback).filter(|h| *h != handle) {
                self.evict(victim);
            }
            fallback
        };

        if current != Some(mux) {
            self.unregister(handle);
        }
        self.register(handle, mux)?;
        Ok(mux)
    }

    /// Adopt the mux the module reported for `handle` after a connect.
    ///
    /// A different handle sitting on `actual` is moved to a free mux, and
    /// only evicted when none is left. Returns `false` when `actual` is out
    /// of range for this kind of socket.
    pub fn reconcile(&mut self, handle: SocketHandle, actual: u8) -> Result<bool, Error> {
        let socket = self.get(handle)?;
        if actual >= self.range(socket.is_secure()) {
            warn!("Module assigned mux {} outside of range", actual);
            return Ok(false);
        }
        if socket.mux == Some(actual) && self.owner(actual) == Some(handle) {
            return Ok(true);
        }

        if let Some(previous) = socket.mux {
            debug!("Mux changed from {} to {}", previous, actual);
        }
        self.unregister(handle);

        if let Some(other) = self.owner(actual) {
            let secure = self.get(other)?.is_secure();
            match self.first_free(self.range(secure)) {
                Some(free) => {
                    warn!("Relocating socket from mux {} to {}", actual, free);
                    self.register(other, free)?;
                }
                None => self.evict(other),
            }
        }

        self.register(handle, actual)?;
        Ok(true)
    }

    /// Repair drift between registry slots and the sockets' own mux fields.
    pub fn reconcile_all(&mut self) {
        for mux in 0..self.capacity {
            let Some(handle) = self.muxes[mux as usize] else {
                continue;
            };
            let consistent = self
                .get(handle)
                .map(|s| s.mux == Some(mux))
                .unwrap_or(false);
            if !consistent {
                debug!("Clearing stale registry slot {}", mux);
                self.muxes[mux as usize] = None;
            }
        }

        for index in 0..N {
            let entry = &self.entries[index];
            let Some(socket) = entry.socket.as_ref() else {
                continue;
            };
            let handle = SocketHandle {
                index: index as u8,
                generation: entry.generation,
            };
            let Some(mux) = socket.mux else {
                continue;
            };
            let range = self.range(socket.is_secure());
            match self.muxes.get(mux as usize).copied().flatten() {
                Some(owner) if owner == handle => {}
                None if mux < range => self.muxes[mux as usize] = Some(handle),
                _ => {
                    warn!("Socket lost mux {}", mux);
                    if let Ok(socket) = self.get_mut(handle) {
                        socket.mux = None;
                    }
                }
            }
        }
    }

    /// Destroy a socket, freeing its registry slot.
    pub fn release(&mut self, handle: SocketHandle) -> Result<Socket<RX>, Error> {
        let socket = self.get(handle)?;
        if let (true, Some(mux)) = (socket.opened, socket.mux) {
            debug!("Socket on mux {} released while open", mux);
            self.dropped.insert(mux);
        }
        self.unregister(handle);
        let entry = &mut self.entries[handle.index as usize];
        entry.generation = entry.generation.wrapping_add(1);
        entry.socket.take().ok_or(Error::InvalidSocket)
    }

    pub fn iter(&self) -> impl Iterator<Item = (SocketHandle, &Socket<RX>)> {
        self.entries.iter().enumerate().filter_map(|(index, entry)| {
            entry.socket.as_ref().map(|socket| {
                (
                    SocketHandle {
                        index: index as u8,
                        generation: entry.generation,
                    },
                    socket,
                )
            })
        })
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Socket<RX>> {
        self.entries.iter_mut().filter_map(|e| e.socket.as_mut())
    }

    /// Muxes with pending data notices, clearing the flags.
    pub fn take_got_data(&mut self) -> MuxMask {
        let mut mask = MuxMask::empty();
        for socket in self.iter_mut() {
            if socket.got_data {
                socket.got_data = false;
                if let (Some(mux), true) = (socket.mux, socket.connected) {
                    mask.insert(mux);
                }
            }
        }
        mask
    }
}

/// The socket set shared between the application and the URC dispatcher.
pub struct SharedSockets<const N: usize, const RX: usize> {
    inner: Mutex<NoopRawMutex, RefCell<SocketSet<N, RX>>>,
}

impl<const N: usize, const RX: usize> SharedSockets<N, RX> {
    pub fn new(capacity: u8, secure_capacity: u8) -> Self {
        Self {
            inner: Mutex::new(RefCell::new(SocketSet::new(capacity, secure_capacity))),
        }
    }

    /// Run `f` with exclusive access to the set. `f` must not call back into
    /// this `SharedSockets`.
    pub fn with<R>(&self, f: impl FnOnce(&mut SocketSet<N, RX>) -> R) -> R {
        self.inner.lock(|set| f(&mut set.borrow_mut()))
    }

    fn with_mux(&self, mux: u8, f: impl FnOnce(&mut Socket<RX>)) {
        self.with(|set| match set.by_mux_mut(mux) {
            Some(socket) => f(socket),
            None => trace!("No socket on mux {}", mux),
        })
    }
}

impl<const N: usize, const RX: usize> SocketAccess for SharedSockets<N, RX> {
    fn is_registered(&self, mux: u8) -> bool {
        self.with(|set| set.owner(mux).is_some())
    }

    fn set_connected(&self, mux: u8, connected: bool) {
        self.with_mux(mux, |socket| {
            if connected {
                socket.connected = true;
            } else if socket.connected || socket.state != State::Idle {
                socket.closed_by_peer();
            }
        })
    }

    fn set_got_data(&self, mux: u8) {
        self.with_mux(mux, |socket| socket.got_data = true)
    }

    fn set_available(&self, mux: u8, available: usize) {
        self.with_mux(mux, |socket| socket.available = available)
    }

    fn enqueue(&self, mux: u8, data: &[u8]) -> usize {
        self.with(|set| match set.by_mux_mut(mux) {
            Some(socket) => {
                let accepted = socket.rx.enqueue_slice(data);
                if accepted < data.len() {
                    warn!(
                        "[{}] Receive buffer full, dropped {} bytes",
                        mux,
                        data.len() - accepted
                    );
                }
                accepted
            }
            None => 0,
        })
    }

    fn rx_window(&self, mux: u8) -> usize {
        self.with(|set| set.by_mux(mux).map(|s| s.rx.window()).unwrap_or(0))
    }

    fn active(&self) -> MuxMask {
        self.with(|set| {
            let mut mask = MuxMask::empty();
            for (_, socket) in set.iter() {
                if let (Some(mux), true) = (socket.mux, socket.opened) {
                    mask.insert(mux);
                }
            }
            mask
        })
    }
}
