use embassy_time::{Duration, Instant, Timer};

use crate::at::{deadline, Session, Transport};
use crate::config::BufferingMode;
use crate::error::Error;
use crate::modem::Modem;
use crate::modules::Dialect;
use crate::send::send_chunked;
use crate::socket::{Socket, SocketHandle, State};

/// A TCP connection through the module.
///
/// Mirrors the classic network client surface: `connect`, `write`, `read`,
/// `available`, `connected` and `stop`. The socket's slot in the modem is
/// released when the client is dropped; a connection still open at that
/// point is closed by the next [`Modem::maintain`].
pub struct TcpClient<'m, S: Transport, D: Dialect, const N: usize, const RX: usize> {
    modem: &'m Modem<S, D, N, RX>,
    handle: SocketHandle,
}

impl<'m, S: Transport, D: Dialect, const N: usize, const RX: usize> TcpClient<'m, S, D, N, RX> {
    pub(crate) fn new(modem: &'m Modem<S, D, N, RX>, handle: SocketHandle) -> Self {
        Self { modem, handle }
    }

    fn with<R>(&self, f: impl FnOnce(&mut Socket<RX>) -> R) -> Result<R, Error> {
        self.modem
            .sockets
            .with(|set| set.get_mut(self.handle).map(f))
    }

    pub fn handle(&self) -> SocketHandle {
        self.handle
    }

    pub fn state(&self) -> State {
        self.with(|s| s.state()).unwrap_or_default()
    }

    /// The mux the socket currently owns. Only final once connected.
    pub fn mux(&self) -> Option<u8> {
        self.with(|s| s.mux()).ok().flatten()
    }

    pub fn is_secure(&self) -> bool {
        self.with(|s| s.is_secure()).unwrap_or(false)
    }

    /// Open a connection to `host:port`. A connection still held from an
    /// earlier call is closed first.
    pub async fn connect(&mut self, host: &str, port: u16, timeout: Duration) -> Result<bool, Error> {
        let modem = self.modem;
        let mut at = modem.session().await;

        if self.with(|s| s.opened)? {
            self.close(&mut at).await?;
        }

        let (mux, tls) = modem.sockets.with(|set| {
            let requested = set.get(self.handle)?.requested_mux;
            let mux = set.assign(self.handle, requested)?;
            let socket = set.get_mut(self.handle)?;
            socket.begin_connect();
            Ok::<_, Error>((mux, socket.context()))
        })?;

        if modem.sockets.with(|set| set.take_dropped_mux(mux)) {
            debug!("[{}] Closing leftover connection", mux);
            modem.dialect.close(&mut at, mux).await?;
        }

        debug!("[{}] Connecting to {}:{}", mux, host, port);
        let opened = modem
            .dialect
            .open(&mut at, mux, host, port, tls, timeout)
            .await;
        let actual = match opened {
            Ok(Some(actual)) => actual,
            Ok(None) => {
                warn!("[{}] Connect failed", mux);
                self.with(|s| s.state = State::Idle)?;
                return Ok(false);
            }
            Err(e) => {
                self.with(|s| s.state = State::Idle)?;
                return Err(e);
            }
        };

        let adopted = modem.sockets.with(|set| {
            if !set.reconcile(self.handle, actual)? {
                return Ok(false);
            }
            set.get_mut(self.handle)?.established();
            Ok::<_, Error>(true)
        })?;
        if !adopted {
            modem.dialect.close(&mut at, actual).await?;
            self.with(|s| s.state = State::Idle)?;
            return Ok(false);
        }

        info!("[{}] Connected", actual);
        modem.poll(&mut at).await?;
        Ok(true)
    }

    /// Send `buf`, returning how many bytes the module confirmed. Nothing is
    /// sent once the connection is gone.
    pub async fn write(&mut self, buf: &[u8]) -> Result<usize, Error> {
        let modem = self.modem;
        let mut at = modem.session().await;
        modem.poll(&mut at).await?;

        let Some(mux) = self.with(|s| s.mux.filter(|_| s.connected))? else {
            return Ok(0);
        };
        send_chunked(&mut at, &modem.dialect, mux, buf).await
    }

    /// Copy received bytes into `buf` without waiting for new ones. The local
    /// backlog stays readable after the peer closed.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        let modem = self.modem;
        let mut at = modem.session().await;
        modem.poll(&mut at).await?;

        let mut count = 0;
        loop {
            count += self.with(|s| s.rx.dequeue_slice(&mut buf[count..]))?;
            if count == buf.len() || modem.config.buffering != BufferingMode::Module {
                break;
            }
            if self.fetch(&mut at).await? == 0 {
                break;
            }
        }
        Ok(count)
    }

    /// Pull the next batch from the module into the receive buffer.
    async fn fetch(&self, at: &mut Session<'_, S, D>) -> Result<usize, Error> {
        let modem = self.modem;
        let (mux, want) = self.with(|s| {
            let want = s
                .available
                .min(s.rx.window())
                .min(modem.config.max_read_chunk);
            (s.mux.filter(|_| s.connected), want)
        })?;
        let (Some(mux), true) = (mux, want > 0) else {
            return Ok(0);
        };

        let received = modem.dialect.read(at, mux, want).await?;
        self.with(|s| s.available = received.remaining(s.available, want))?;
        Ok(received.moved)
    }

    /// Bytes readable now plus bytes the module still holds.
    pub async fn available(&mut self) -> Result<usize, Error> {
        let (buffered, connected) = self.with(|s| (s.rx.len(), s.connected))?;
        if buffered == 0 && connected {
            let mut at = self.modem.session().await;
            self.modem.poll(&mut at).await?;
        }
        self.with(|s| s.readable())
    }

    /// `true` while data is left to read, otherwise the last known state.
    pub async fn connected(&mut self) -> Result<bool, Error> {
        if self.available().await? > 0 {
            return Ok(true);
        }
        self.with(|s| s.connected)
    }

    /// Drain the module-side backlog for up to `max_wait`, close the
    /// connection and discard the receive buffer. Ends in [`State::Idle`]
    /// whatever the module answers.
    pub async fn stop(&mut self, max_wait: Duration) -> Result<(), Error> {
        let mut at = self.modem.session().await;
        let result = self.shutdown(&mut at, max_wait).await;
        self.modem.sockets.with(|set| {
            set.get_mut(self.handle)?.reset();
            set.unregister(self.handle);
            Ok::<_, Error>(())
        })?;
        result
    }

    async fn shutdown(&self, at: &mut Session<'_, S, D>, max_wait: Duration) -> Result<(), Error> {
        if !self.with(|s| s.opened)? {
            return Ok(());
        }
        self.with(|s| s.state = State::Closing)?;

        let deadline = deadline(max_wait);
        while Instant::now() < deadline {
            self.with(|s| s.rx.clear())?;
            if self.fetch(at).await? == 0 {
                break;
            }
        }
        self.close(at).await
    }

    /// Close the module side, keeping the socket and its mux.
    async fn close(&self, at: &mut Session<'_, S, D>) -> Result<(), Error> {
        let Some(mux) = self.with(|s| s.mux)? else {
            return Ok(());
        };
        if !self.modem.dialect.close(at, mux).await? {
            warn!("[{}] Close not confirmed", mux);
        }
        self.with(|s| s.reset())
    }
}

impl<'m, S: Transport, D: Dialect, const N: usize, const RX: usize> Drop
    for TcpClient<'m, S, D, N, RX>
{
    fn drop(&mut self) {
        self.modem.sockets.with(|set| set.release(self.handle)).ok();
    }
}

mod embedded_io_impls {
    use super::*;
    use embedded_io_async::ErrorKind;

    impl<'m, S: Transport, D: Dialect, const N: usize, const RX: usize>
        embedded_io_async::ErrorType for TcpClient<'m, S, D, N, RX>
    {
        type Error = Error;
    }

    impl<'m, S: Transport, D: Dialect, const N: usize, const RX: usize> embedded_io_async::Read
        for TcpClient<'m, S, D, N, RX>
    {
        /// Wait until at least one byte arrived. `Ok(0)` is end of stream:
        /// the peer closed and the backlog is empty.
        async fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
            if buf.is_empty() {
                return Ok(0);
            }
            loop {
                let n = TcpClient::read(self, buf).await?;
                if n > 0 || !self.connected().await? {
                    return Ok(n);
                }
                Timer::after(self.modem.config.urc_window).await;
            }
        }
    }

    impl<'m, S: Transport, D: Dialect, const N: usize, const RX: usize> embedded_io_async::Write
        for TcpClient<'m, S, D, N, RX>
    {
        async fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
            if buf.is_empty() {
                return Ok(0);
            }
            match TcpClient::write(self, buf).await? {
                0 if !self.with(|s| s.connected)? => Err(Error::Io(ErrorKind::NotConnected)),
                0 => Err(Error::Io(ErrorKind::WriteZero)),
                n => Ok(n),
            }
        }

        async fn flush(&mut self) -> Result<(), Self::Error> {
            Ok(())
        }
    }
}

#[cfg(all(test, feature = "ublox", feature = "simcom"))]
mod tests {
    use super::*;
    use crate::modules::simcom::Simcom;
    use crate::modules::ublox::Ublox;
    use crate::test_helpers::MockSerial;
    use crate::Config;
    use embassy_futures::block_on;
    use embedded_io_async::ErrorKind;

    const TIMEOUT: Duration = Duration::from_millis(100);

    fn fast(config: Config) -> Config {
        config
            .command_timeout(TIMEOUT)
            .read_timeout(TIMEOUT)
            .close_timeout(TIMEOUT)
    }

    fn ublox(serial: &MockSerial) -> Modem<MockSerial, Ublox, 7, 64> {
        Modem::with_config(serial.clone(), Ublox, fast(Ublox.config()))
    }

    fn simcom(serial: &MockSerial, config: Config) -> Modem<MockSerial, Simcom, 5, 64> {
        Modem::with_config(serial.clone(), Simcom, fast(config))
    }

    fn expect_simcom_connect(serial: &MockSerial, mux: u8) {
        let start = std::format!("AT+CIPSTART={},\"TCP\",\"host\",80\r\n", mux);
        let reply = std::format!("\r\nOK\r\n\r\n{}, CONNECT OK\r\n", mux);
        serial
            .expect(b"AT+CIPSSL=0\r\n", b"\r\nOK\r\n")
            .expect(start.as_bytes(), reply.as_bytes());
    }

    #[test]
    fn connect_adopts_module_mux() {
        let serial = MockSerial::new();
        serial
            .expect(b"AT+USOCR=6\r\n", b"\r\n+USOCR: 3\r\n\r\nOK\r\n")
            .expect(b"AT+USOCO=3,\"host\",80\r\n", b"\r\nOK\r\n");
        let modem = ublox(&serial);

        block_on(async {
            let mut client = modem.socket(0).unwrap();
            assert_eq!(client.mux(), Some(0));
            assert!(client.connect("host", 80, TIMEOUT).await.unwrap());

            assert_eq!(client.mux(), Some(3));
            assert_eq!(client.state(), State::Connected);
            modem.sockets.with(|set| {
                assert_eq!(set.owner(3), Some(client.handle()));
                assert_eq!(set.owner(0), None);
            });
        });
    }

    #[test]
    fn reconcile_relocates_other_socket() {
        let serial = MockSerial::new();
        serial
            .expect(b"AT+USOCR=6\r\n", b"\r\n+USOCR: 3\r\n\r\nOK\r\n")
            .expect(b"AT+USOCO=3,\"host\",80\r\n", b"\r\nOK\r\n");
        let modem = ublox(&serial);

        block_on(async {
            let other = modem.socket(3).unwrap();
            let mut client = modem.socket(0).unwrap();
            assert!(client.connect("host", 80, TIMEOUT).await.unwrap());

            assert_eq!(client.mux(), Some(3));
            assert_eq!(other.mux(), Some(0));
        });
    }

    #[test]
    fn failed_connect_returns_to_idle() {
        let serial = MockSerial::new();
        serial
            .expect(b"AT+CIPSSL=0\r\n", b"\r\nOK\r\n")
            .expect(
                b"AT+CIPSTART=1,\"TCP\",\"host\",80\r\n",
                b"\r\nOK\r\n\r\n1, CONNECT FAIL\r\n",
            );
        let modem = simcom(&serial, Simcom.config());

        block_on(async {
            let mut client = modem.socket(1).unwrap();
            assert!(!client.connect("host", 80, TIMEOUT).await.unwrap());
            assert_eq!(client.state(), State::Idle);
            assert!(!client.connected().await.unwrap());
            assert_eq!(client.write(b"data").await.unwrap(), 0);
        });
        assert_eq!(serial.count(b"AT+CIPSEND"), 0);
    }

    #[test]
    fn backlog_stays_readable_after_peer_close() {
        let serial = MockSerial::new();
        expect_simcom_connect(&serial, 0);
        serial
            .expect(b"AT+CIPRXGET=4,0\r\n", b"\r\n+CIPRXGET: 4,0,6\r\n\r\nOK\r\n")
            .expect(
                b"AT+CIPRXGET=2,0,6\r\n",
                b"\r\n+CIPRXGET: 2,0,6,0\r\nhello!\r\nOK\r\n",
            );
        let modem = simcom(&serial, Simcom.config());

        block_on(async {
            let mut client = modem.socket(0).unwrap();
            assert!(client.connect("host", 80, TIMEOUT).await.unwrap());

            serial.inject(b"\r\n+CIPRXGET: 1,0\r\n");
            assert_eq!(client.available().await.unwrap(), 6);

            let mut buf = [0u8; 4];
            assert_eq!(client.read(&mut buf).await.unwrap(), 4);
            assert_eq!(&buf, b"hell");

            serial.inject(b"\r\n0, CLOSED\r\n");
            modem.maintain().await.unwrap();
            assert_eq!(client.state(), State::Idle);

            let mut last = client.available().await.unwrap();
            assert_eq!(last, 2);
            assert!(client.connected().await.unwrap());

            let mut byte = [0u8; 1];
            while client.read(&mut byte).await.unwrap() == 1 {
                let now = client.available().await.unwrap();
                assert!(now <= last);
                last = now;
            }
            assert_eq!(last, 0);
            assert!(!client.connected().await.unwrap());

            assert_eq!(
                embedded_io_async::Read::read(&mut client, &mut byte)
                    .await
                    .unwrap(),
                0
            );
            assert_eq!(
                embedded_io_async::Write::write(&mut client, b"late").await,
                Err(Error::Io(ErrorKind::NotConnected))
            );
        });
        assert_eq!(serial.pending(), 0);
    }

    #[test]
    fn stop_is_idempotent() {
        let serial = MockSerial::new();
        expect_simcom_connect(&serial, 0);
        serial.expect(b"AT+CIPCLOSE=0,1\r\n", b"\r\n0, CLOSE OK\r\n");
        let modem = simcom(&serial, Simcom.config());

        block_on(async {
            let mut client = modem.socket(0).unwrap();
            assert!(client.connect("host", 80, TIMEOUT).await.unwrap());

            client.stop(TIMEOUT).await.unwrap();
            assert_eq!(client.state(), State::Idle);
            client.stop(TIMEOUT).await.unwrap();
            assert_eq!(client.state(), State::Idle);
            assert_eq!(client.mux(), None);
        });
        assert_eq!(serial.count(b"AT+CIPCLOSE"), 1);
    }

    #[test]
    fn stop_drains_module_backlog() {
        let serial = MockSerial::new();
        expect_simcom_connect(&serial, 0);
        serial
            .expect(b"AT+CIPRXGET=4,0\r\n", b"\r\n+CIPRXGET: 4,0,10\r\n\r\nOK\r\n")
            .expect(
                b"AT+CIPRXGET=2,0,4\r\n",
                b"\r\n+CIPRXGET: 2,0,4,6\r\nabcd\r\nOK\r\n",
            )
            .expect(
                b"AT+CIPRXGET=2,0,4\r\n",
                b"\r\n+CIPRXGET: 2,0,4,2\r\nefgh\r\nOK\r\n",
            )
            .expect(
                b"AT+CIPRXGET=2,0,2\r\n",
                b"\r\n+CIPRXGET: 2,0,2,0\r\nij\r\nOK\r\n",
            )
            .expect(b"AT+CIPCLOSE=0,1\r\n", b"\r\n0, CLOSE OK\r\n");
        let modem = simcom(&serial, Simcom.config().max_read_chunk(4));

        block_on(async {
            let mut client = modem.socket(0).unwrap();
            assert!(client.connect("host", 80, TIMEOUT).await.unwrap());
            serial.inject(b"\r\n+CIPRXGET: 1,0\r\n");
            assert_eq!(client.available().await.unwrap(), 10);

            client.stop(Duration::from_secs(1)).await.unwrap();
            assert_eq!(client.state(), State::Idle);
            assert_eq!(client.available().await.unwrap(), 0);
        });
        assert_eq!(serial.pending(), 0);
    }

    #[test]
    fn unconfirmed_close_still_ends_idle() {
        let serial = MockSerial::new();
        serial
            .expect(b"AT+USOCR=6\r\n", b"\r\n+USOCR: 0\r\n\r\nOK\r\n")
            .expect(b"AT+USOCO=0,\"host\",80\r\n", b"\r\nOK\r\n");
        let modem = ublox(&serial);

        block_on(async {
            let mut client = modem.socket(0).unwrap();
            assert!(client.connect("host", 80, TIMEOUT).await.unwrap());
            client.stop(TIMEOUT).await.unwrap();
            assert_eq!(client.state(), State::Idle);
            assert!(!client.connected().await.unwrap());
        });
        assert_eq!(serial.count(b"AT+USOCL=0"), 1);
    }

    #[test]
    fn dropped_socket_is_closed_by_maintain() {
        let serial = MockSerial::new();
        expect_simcom_connect(&serial, 2);
        serial.expect(b"AT+CIPCLOSE=2,1\r\n", b"\r\n2, CLOSE OK\r\n");
        let modem = simcom(&serial, Simcom.config());

        block_on(async {
            let mut client = modem.socket(2).unwrap();
            assert!(client.connect("host", 80, TIMEOUT).await.unwrap());
            drop(client);
            assert!(modem.sockets.with(|set| set.owner(2).is_none() && set.is_empty()));

            modem.maintain().await.unwrap();
        });
        assert_eq!(serial.pending(), 0);
    }

    #[test]
    fn reused_mux_is_closed_before_connect() {
        let serial = MockSerial::new();
        expect_simcom_connect(&serial, 2);
        serial.expect(b"AT+CIPCLOSE=2,1\r\n", b"\r\n2, CLOSE OK\r\n");
        expect_simcom_connect(&serial, 2);
        let modem = simcom(&serial, Simcom.config());

        block_on(async {
            let mut first = modem.socket(2).unwrap();
            assert!(first.connect("host", 80, TIMEOUT).await.unwrap());
            drop(first);

            let mut second = modem.socket(2).unwrap();
            assert_eq!(second.mux(), Some(2));
            modem.maintain().await.unwrap();
            assert_eq!(serial.count(b"AT+CIPCLOSE"), 0);

            assert!(second.connect("host", 80, TIMEOUT).await.unwrap());
            assert_eq!(second.state(), State::Connected);
        });
        assert_eq!(serial.count(b"AT+CIPCLOSE=2,1"), 1);
        assert_eq!(serial.pending(), 0);
    }

    #[test]
    fn empty_module_read_clears_count() {
        let serial = MockSerial::new();
        expect_simcom_connect(&serial, 0);
        serial
            .expect(b"AT+CIPRXGET=4,0\r\n", b"\r\n+CIPRXGET: 4,0,6\r\n\r\nOK\r\n")
            .expect(
                b"AT+CIPRXGET=2,0,6\r\n",
                b"\r\n+CIPRXGET: 2,0,0,0\r\n\r\nOK\r\n",
            );
        let modem = simcom(&serial, Simcom.config());

        block_on(async {
            let mut client = modem.socket(0).unwrap();
            assert!(client.connect("host", 80, TIMEOUT).await.unwrap());
            serial.inject(b"\r\n+CIPRXGET: 1,0\r\n");
            assert_eq!(client.available().await.unwrap(), 6);

            let mut buf = [0u8; 8];
            assert_eq!(client.read(&mut buf).await.unwrap(), 0);
            assert_eq!(client.available().await.unwrap(), 0);

            serial.inject(b"\r\n0, CLOSED\r\n");
            modem.maintain().await.unwrap();
            assert!(!client.connected().await.unwrap());
        });
        assert_eq!(serial.pending(), 0);
    }

    #[test]
    fn short_module_read_clears_count() {
        let serial = MockSerial::new();
        serial
            .expect(b"AT+USOCR=6\r\n", b"\r\n+USOCR: 0\r\n\r\nOK\r\n")
            .expect(b"AT+USOCO=0,\"host\",80\r\n", b"\r\nOK\r\n")
            .expect(b"AT+USORD=0,0\r\n", b"\r\n+USORD: 0,6\r\n\r\nOK\r\n")
            .expect(b"AT+USORD=0,6\r\n", b"\r\n+USORD: 0,2,\"hi\"\r\n\r\nOK\r\n");
        let modem = ublox(&serial);

        block_on(async {
            let mut client = modem.socket(0).unwrap();
            assert!(client.connect("host", 80, TIMEOUT).await.unwrap());
            serial.inject(b"\r\n+UUSORD: 0,6\r\n");

            let mut buf = [0u8; 8];
            assert_eq!(client.read(&mut buf).await.unwrap(), 2);
            assert_eq!(&buf[..2], b"hi");
            assert_eq!(client.available().await.unwrap(), 0);
        });
        assert_eq!(serial.pending(), 0);
    }

    #[test]
    fn reconnect_closes_previous_connection() {
        let serial = MockSerial::new();
        expect_simcom_connect(&serial, 1);
        serial.expect(b"AT+CIPCLOSE=1,1\r\n", b"\r\n1, CLOSE OK\r\n");
        expect_simcom_connect(&serial, 1);
        let modem = simcom(&serial, Simcom.config());

        block_on(async {
            let mut client = modem.socket(1).unwrap();
            assert!(client.connect("host", 80, TIMEOUT).await.unwrap());
            assert!(client.connect("host", 80, TIMEOUT).await.unwrap());
            assert_eq!(client.state(), State::Connected);
        });
        assert_eq!(serial.pending(), 0);
    }
}
