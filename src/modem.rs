use core::fmt;

use embassy_sync::{blocking_mutex::raw::NoopRawMutex, mutex::Mutex};
use embassy_time::{Duration, Instant, Timer};
use no_std_net::Ipv4Addr;

use crate::at::{deadline, AtClient, Outcome, Session, Transport};
use crate::client::TcpClient;
use crate::config::{BufferingMode, Config};
use crate::error::Error;
use crate::modules::Dialect;
use crate::socket::{ContextId, SharedSockets, SocketAccess};
use crate::ssl::{CertificateKind, CertificateNames, Tls, TlsVersion, Validation};

/// A module on the other end of `S`, spoken to in dialect `D`.
///
/// `N` bounds the number of sockets (and muxes) tracked, `RX` is the size of
/// each socket's receive buffer.
pub struct Modem<S, D, const N: usize, const RX: usize> {
    at: Mutex<NoopRawMutex, AtClient<S>>,
    pub(crate) sockets: SharedSockets<N, RX>,
    pub(crate) dialect: D,
    pub(crate) config: Config,
}

impl<S: Transport, D: Dialect, const N: usize, const RX: usize> Modem<S, D, N, RX> {
    /// URC windows a single poll listens for at most.
    const POLL_ROUNDS: usize = 4;

    pub fn new(stream: S, dialect: D) -> Self {
        let config = dialect.config();
        Self::with_config(stream, dialect, config)
    }

    pub fn with_config(stream: S, dialect: D, config: Config) -> Self {
        Self {
            at: Mutex::new(AtClient::new(stream, config)),
            sockets: SharedSockets::new(config.mux_capacity, config.secure_mux_capacity),
            dialect,
            config,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn dialect(&self) -> &D {
        &self.dialect
    }

    /// Take the engine for a multi-step recipe. Unsolicited messages seen
    /// while the session waits are handled by the dialect.
    pub async fn session(&self) -> Session<'_, S, D> {
        Session::new(self.at.lock().await, &self.dialect, &self.sockets)
    }

    /// A plain TCP socket, preferably on `mux`.
    pub fn socket(&self, mux: u8) -> Result<TcpClient<'_, S, D, N, RX>, Error> {
        let handle = self.sockets.with(|set| set.add(mux, None))?;
        Ok(TcpClient::new(self, handle))
    }

    /// A socket negotiated through TLS context `context`.
    pub fn secure_socket(
        &self,
        mux: u8,
        context: ContextId,
    ) -> Result<TcpClient<'_, S, D, N, RX>, Error> {
        let handle = self.sockets.with(|set| set.add(mux, Some(context)))?;
        Ok(TcpClient::new(self, handle))
    }

    /// Repeat `AT` until the module answers `OK` or `timeout` passes.
    pub async fn test_at(&self, timeout: Duration) -> Result<bool, Error> {
        let deadline = deadline(timeout);
        let mut at = self.session().await;
        while Instant::now() < deadline {
            at.send(format_args!("")).await?;
            if at.wait_ok(Duration::from_millis(200)).await?.is(1) {
                return Ok(true);
            }
            Timer::after(Duration::from_millis(100)).await;
        }
        warn!("Module not responding");
        Ok(false)
    }

    pub async fn init(&self) -> Result<bool, Error> {
        let mut at = self.session().await;
        self.dialect.init(&mut at).await
    }

    /// Run a single-line command against the default terminators.
    pub async fn command(
        &self,
        command: fmt::Arguments<'_>,
        timeout: Duration,
    ) -> Result<Outcome, Error> {
        let mut at = self.session().await;
        at.send(command).await?;
        at.wait_ok(timeout).await
    }

    /// Background poll. Runs the follow-up queries unsolicited messages
    /// asked for, closes muxes left behind by dropped sockets, then handles
    /// whatever else the module has sent.
    pub async fn maintain(&self) -> Result<(), Error> {
        let mut at = self.session().await;
        let dropped = self.sockets.with(|set| set.take_dropped());
        for mux in dropped.iter() {
            debug!("[{}] Closing dropped socket", mux);
            self.dialect.close(&mut at, mux).await?;
        }
        self.poll(&mut at).await
    }

    pub(crate) async fn poll(&self, at: &mut Session<'_, S, D>) -> Result<(), Error> {
        let mut rounds = 0;
        loop {
            if self.config.buffering == BufferingMode::Module {
                let pending = self.sockets.with(|set| set.take_got_data());
                for mux in pending.iter() {
                    let available = self.dialect.available(at, mux).await?;
                    trace!("[{}] {} bytes on the module", mux, available);
                    self.sockets.set_available(mux, available);
                    if available == 0 {
                        let connected = self.dialect.is_connected(at, mux).await?;
                        self.sockets.set_connected(mux, connected);
                    }
                }
            }
            if !at.reader().ready()? {
                return Ok(());
            }
            if rounds == Self::POLL_ROUNDS {
                debug!("Module still talking, deferring to the next poll");
                return Ok(());
            }
            rounds += 1;
            at.wait(self.config.urc_window, &[]).await?;
        }
    }

    /// Query the state of every open socket and repair the mux registry.
    pub async fn refresh_sockets(&self) -> Result<(), Error> {
        let mut at = self.session().await;
        self.dialect.refresh(&mut at).await?;
        self.sockets.with(|set| set.reconcile_all());
        Ok(())
    }

    pub async fn local_ip(&self) -> Result<Option<Ipv4Addr>, Error> {
        let mut at = self.session().await;
        self.dialect.local_ip(&mut at).await
    }
}

impl<S: Transport, D: Tls, const N: usize, const RX: usize> Modem<S, D, N, RX> {
    pub async fn load_certificate(
        &self,
        kind: CertificateKind,
        name: &str,
        data: &[u8],
    ) -> Result<bool, Error> {
        let mut at = self.session().await;
        self.dialect.load_certificate(&mut at, kind, name, data).await
    }

    pub async fn delete_certificate(
        &self,
        kind: CertificateKind,
        name: &str,
    ) -> Result<bool, Error> {
        let mut at = self.session().await;
        self.dialect.delete_certificate(&mut at, kind, name).await
    }

    pub async fn configure_context(
        &self,
        context: ContextId,
        validation: Validation,
        version: TlsVersion,
        names: &CertificateNames<'_>,
    ) -> Result<bool, Error> {
        let mut at = self.session().await;
        self.dialect
            .configure_context(&mut at, context, validation, version, names)
            .await
    }
}
