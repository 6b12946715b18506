//! SIMCom SIM800/SIM7000 style multi-connection TCP (`+CIPxxx`).
//!
//! Connections run in `+CIPMUX=1` mode on client-chosen muxes, with manual
//! receive (`+CIPRXGET=1`) so data waits on the module until fetched.

use embassy_time::Duration;
use no_std_net::Ipv4Addr;

use super::{drain_payload, line_mux, parse_ipv4, read_mux, Dialect, Received};
use crate::at::{trim, Reader, Session, Transport, UrcHandler};
use crate::config::Config;
use crate::error::Error;
use crate::socket::{ContextId, SocketAccess};

#[derive(Debug, Clone, Copy, Default)]
pub struct Simcom;

impl Simcom {
    const SEND_TIMEOUT: Duration = Duration::from_secs(15);
}

/// Notices that carry nothing for the socket layer, swallowed to the end of
/// the line.
const IGNORED: [&[u8]; 4] = [b"*PSNWID:", b"*PSUTTZ:", b"+CTZV:", b"DST:"];

impl UrcHandler for Simcom {
    async fn handle<S: Transport>(
        &self,
        buf: &[u8],
        reader: &mut Reader<S>,
        sockets: &dyn SocketAccess,
    ) -> Result<bool, Error> {
        if buf.ends_with(b"+CIPRXGET: 1,") {
            if let Some(mux) = read_mux(reader, b'\n').await? {
                trace!("[{}] URC: data pending", mux);
                sockets.set_got_data(mux);
            }
            return Ok(true);
        }
        if buf.ends_with(b", CLOSED\r\n") {
            if let Some(mux) = line_mux(buf, b", CLOSED\r\n") {
                trace!("[{}] URC: closed", mux);
                sockets.set_connected(mux, false);
            }
            return Ok(true);
        }
        if IGNORED.iter().any(|notice| buf.ends_with(notice)) {
            reader.skip_until(b'\n').await?;
            return Ok(true);
        }
        Ok(false)
    }
}

impl Dialect for Simcom {
    fn config(&self) -> Config {
        Config::new()
            .verbose_error("+CME ERROR:")
            .mux_capacity(5, 5)
            .max_send_chunk(1460)
            .max_read_chunk(1460)
    }

    async fn init<S: Transport, U: UrcHandler>(
        &self,
        at: &mut Session<'_, S, U>,
    ) -> Result<bool, Error> {
        Ok(at.command(format_args!("E0")).await?
            && at.command(format_args!("+CMEE=2")).await?
            && at.command(format_args!("+CIPMUX=1")).await?
            && at.command(format_args!("+CIPQSEND=1")).await?
            && at.command(format_args!("+CIPRXGET=1")).await?)
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
        if !at
            .command(format_args!("+CIPSSL={}", u8::from(tls.is_some())))
            .await?
        {
            return Ok(None);
        }
        at.send(format_args!(
            "+CIPSTART={},\"TCP\",\"{}\",{}",
            mux, host, port
        ))
        .await?;
        let outcome = at
            .wait(
                timeout,
                &[
                    "CONNECT OK\r\n",
                    "CONNECT FAIL\r\n",
                    "ALREADY CONNECT\r\n",
                    "ERROR\r\n",
                    "CLOSE OK\r\n",
                ],
            )
            .await?;
        Ok(outcome.is(1).then_some(mux))
    }

    async fn begin_send<S: Transport, U: UrcHandler>(
        &self,
        at: &mut Session<'_, S, U>,
        mux: u8,
        len: usize,
    ) -> Result<bool, Error> {
        let timeout = at.config().command_timeout;
        at.send(format_args!("+CIPSEND={},{}", mux, len)).await?;
        at.expect(timeout, ">").await
    }

    async fn end_send<S: Transport, U: UrcHandler>(
        &self,
        at: &mut Session<'_, S, U>,
        _mux: u8,
        _len: usize,
    ) -> Result<usize, Error> {
        // DATA ACCEPT:<mux>,<len>
        if !at.expect(Self::SEND_TIMEOUT, "\r\nDATA ACCEPT:").await? {
            return Ok(0);
        }
        at.reader().skip_until(b',').await?;
        let sent = at.reader().int_until(b'\n').await?.unwrap_or(0);
        Ok(sent.max(0) as usize)
    }

    async fn send_space<S: Transport, U: UrcHandler>(
        &self,
        at: &mut Session<'_, S, U>,
        mux: u8,
    ) -> Result<Option<usize>, Error> {
        let config = at.config();
        let terminator = config.line_terminator;
        at.send(format_args!("+CIPSEND?")).await?;

        let mut space = None;
        loop {
            let outcome = at
                .wait(
                    config.command_timeout,
                    &["+CIPSEND:", terminator.ok(), terminator.error()],
                )
                .await?;
            if !outcome.is(1) {
                break;
            }
            let line_mux = read_mux(at.reader(), b',').await?;
            let size = at.reader().int_until(b'\n').await?;
            if line_mux == Some(mux) {
                space = size.map(|size| size.max(0) as usize);
            }
        }
        Ok(space)
    }

    async fn available<S: Transport, U: UrcHandler>(
        &self,
        at: &mut Session<'_, S, U>,
        mux: u8,
    ) -> Result<usize, Error> {
        let timeout = at.config().command_timeout;
        at.send(format_args!("+CIPRXGET=4,{}", mux)).await?;
        if !at.expect(timeout, "+CIPRXGET: 4,").await? {
            return Ok(0);
        }
        at.reader().skip_until(b',').await?;
        let available = at.reader().int_until(b'\n').await?.unwrap_or(0);
        at.wait_ok(timeout).await?;
        Ok(available.max(0) as usize)
    }

    async fn read<S: Transport, U: UrcHandler>(
        &self,
        at: &mut Session<'_, S, U>,
        mux: u8,
        len: usize,
    ) -> Result<Received, Error> {
        let timeout = at.config().command_timeout;
        at.send(format_args!("+CIPRXGET=2,{},{}", mux, len)).await?;
        if !at.expect(timeout, "+CIPRXGET: 2,").await? {
            return Ok(Received::default());
        }
        // +CIPRXGET: 2,<mux>,<returned>,<left on the module>
        at.reader().skip_until(b',').await?;
        let returned = at.reader().int_until(b',').await?.unwrap_or(0).max(0) as usize;
        let left = at
            .reader()
            .int_until(b'\n')
            .await?
            .map(|left| left.max(0) as usize);
        trace!("[{}] {} bytes returned, {:?} left", mux, returned, left);

        let sockets = at.sockets();
        let moved = drain_payload(at.reader(), sockets, mux, returned).await?;
        at.wait_ok(timeout).await?;
        Ok(Received::new(moved, left))
    }

    async fn is_connected<S: Transport, U: UrcHandler>(
        &self,
        at: &mut Session<'_, S, U>,
        mux: u8,
    ) -> Result<bool, Error> {
        let timeout = at.config().command_timeout;
        at.send(format_args!("+CIPSTATUS={}", mux)).await?;
        let outcome = at
            .wait(
                timeout,
                &[
                    ",\"CONNECTED\"",
                    ",\"CLOSED\"",
                    ",\"CLOSING\"",
                    ",\"REMOTE CLOSING\"",
                    ",\"INITIAL\"",
                ],
            )
            .await?;
        at.wait_ok(timeout).await?;
        Ok(outcome.is(1))
    }

    async fn close<S: Transport, U: UrcHandler>(
        &self,
        at: &mut Session<'_, S, U>,
        mux: u8,
    ) -> Result<bool, Error> {
        let timeout = at.config().close_timeout;
        // Quick close, the module answers without waiting for the peer.
        at.send(format_args!("+CIPCLOSE={},1", mux)).await?;
        Ok(at
            .wait(timeout, &["CLOSE OK\r\n", "ERROR\r\n"])
            .await?
            .is(1))
    }

    async fn local_ip<S: Transport, U: UrcHandler>(
        &self,
        at: &mut Session<'_, S, U>,
    ) -> Result<Option<Ipv4Addr>, Error> {
        let timeout = at.config().command_timeout;
        // +CIFSR answers with a bare address and no OK; the chained E0
        // supplies a terminator.
        at.send(format_args!("+CIFSR;E0")).await?;
        if !at.wait_ok(timeout).await?.is(1) {
            return Ok(None);
        }
        let response = trim(at.response());
        let line = response
            .split(|b| *b == b'\n')
            .next()
            .unwrap_or(response);
        Ok(parse_ipv4(line))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::socket::State;
    use crate::test_helpers::MockSerial;
    use crate::Modem;
    use embassy_futures::block_on;

    type TestModem = Modem<MockSerial, Simcom, 5, 64>;

    fn modem(serial: &MockSerial) -> TestModem {
        let config = Simcom
            .config()
            .command_timeout(Duration::from_millis(100))
            .read_timeout(Duration::from_millis(100))
            .close_timeout(Duration::from_millis(100));
        Modem::with_config(serial.clone(), Simcom, config)
    }

    #[test]
    fn init_sequence() {
        let serial = MockSerial::new();
        serial
            .expect(b"ATE0\r\n", b"ATE0\r\r\nOK\r\n")
            .expect(b"AT+CMEE=2\r\n", b"\r\nOK\r\n")
            .expect(b"AT+CIPMUX=1\r\n", b"\r\nOK\r\n")
            .expect(b"AT+CIPQSEND=1\r\n", b"\r\nOK\r\n")
            .expect(b"AT+CIPRXGET=1\r\n", b"\r\nOK\r\n");
        let modem = modem(&serial);

        assert!(block_on(modem.init()).unwrap());
        assert_eq!(serial.pending(), 0);
    }

    #[test]
    fn connect_outcomes() {
        let serial = MockSerial::new();
        serial
            .expect(b"AT+CIPSSL=0\r\n", b"\r\nOK\r\n")
            .expect(
                b"AT+CIPSTART=2,\"TCP\",\"example.com\",80\r\n",
                b"\r\nOK\r\n\r\n2, CONNECT OK\r\n",
            )
            .expect(b"AT+CIPSSL=1\r\n", b"\r\nOK\r\n")
            .expect(
                b"AT+CIPSTART=3,\"TCP\",\"example.com\",443\r\n",
                b"\r\nOK\r\n\r\n3, CONNECT FAIL\r\n",
            );
        let modem = modem(&serial);

        block_on(async {
            let mut at = modem.session().await;
            let timeout = Duration::from_millis(100);
            let plain = Simcom
                .open(&mut at, 2, "example.com", 80, None, timeout)
                .await
                .unwrap();
            assert_eq!(plain, Some(2));
            let secure = Simcom
                .open(&mut at, 3, "example.com", 443, Some(ContextId(0)), timeout)
                .await
                .unwrap();
            assert_eq!(secure, None);
        });
    }

    #[test]
    fn send_confirmation() {
        let serial = MockSerial::new();
        serial
            .expect(b"AT+CIPSEND?\r\n", b"\r\n+CIPSEND: 0,1460\r\n+CIPSEND: 1,512\r\n\r\nOK\r\n")
            .expect(b"AT+CIPSEND=1,3\r\n", b"\r\n> ")
            .expect(b"abc", b"\r\nDATA ACCEPT:1,3\r\n");
        let modem = modem(&serial);

        block_on(async {
            let mut at = modem.session().await;
            assert_eq!(Simcom.send_space(&mut at, 1).await.unwrap(), Some(512));
            assert!(Simcom.begin_send(&mut at, 1, 3).await.unwrap());
            at.write_raw(b"abc").await.unwrap();
            assert_eq!(Simcom.end_send(&mut at, 1, 3).await.unwrap(), 3);
        });
    }

    #[test]
    fn manual_receive() {
        let serial = MockSerial::new();
        serial
            .expect(b"AT+CIPRXGET=4,0\r\n", b"\r\n+CIPRXGET: 4,0,9\r\n\r\nOK\r\n")
            .expect(
                b"AT+CIPRXGET=2,0,4\r\n",
                b"\r\n+CIPRXGET: 2,0,4,5\r\nGET \r\nOK\r\n",
            );
        let modem = modem(&serial);
        let handle = modem.sockets.with(|set| {
            let handle = set.add(0, None).unwrap();
            set.get_mut(handle).unwrap().established();
            handle
        });

        block_on(async {
            let mut at = modem.session().await;
            assert_eq!(Simcom.available(&mut at, 0).await.unwrap(), 9);
            assert_eq!(
                Simcom.read(&mut at, 0, 4).await.unwrap(),
                Received::new(4, Some(5))
            );
        });
        let mut buf = [0u8; 8];
        let n = modem
            .sockets
            .with(|set| set.get_mut(handle).unwrap().rx.dequeue_slice(&mut buf));
        assert_eq!(&buf[..n], b"GET ");
    }

    #[test]
    fn status_and_close() {
        let serial = MockSerial::new();
        serial
            .expect(
                b"AT+CIPSTATUS=0\r\n",
                b"\r\n+CIPSTATUS: 0,0,\"TCP\",\"93.184.216.34\",\"80\",\"CONNECTED\"\r\n\r\nOK\r\n",
            )
            .expect(
                b"AT+CIPSTATUS=1\r\n",
                b"\r\n+CIPSTATUS: 1,,\"\",\"\",\"\",\"INITIAL\"\r\n\r\nOK\r\n",
            )
            .expect(b"AT+CIPCLOSE=0,1\r\n", b"\r\n0, CLOSE OK\r\n");
        let modem = modem(&serial);

        block_on(async {
            let mut at = modem.session().await;
            assert!(Simcom.is_connected(&mut at, 0).await.unwrap());
            assert!(!Simcom.is_connected(&mut at, 1).await.unwrap());
            assert!(Simcom.close(&mut at, 0).await.unwrap());
        });
    }

    #[test]
    fn urcs_update_sockets() {
        let serial = MockSerial::new();
        serial.inject(b"\r\n*PSUTTZ: 2024,5,1,12,0,0,\"+8\",0\r\n\r\n+CIPRXGET: 1,0\r\n");
        serial.inject(b"\r\nDST: 0\r\n\r\n1, CLOSED\r\n");
        let modem = modem(&serial);
        let (a, b) = modem.sockets.with(|set| {
            let a = set.add(0, None).unwrap();
            let b = set.add(1, None).unwrap();
            set.get_mut(a).unwrap().established();
            set.get_mut(b).unwrap().established();
            (a, b)
        });

        block_on(async {
            let mut at = modem.session().await;
            at.wait(Duration::from_millis(50), &[]).await.unwrap();
        });
        assert_eq!(serial.unread(), 0);
        modem.sockets.with(|set| {
            assert!(set.get(a).unwrap().got_data);
            assert!(set.get(a).unwrap().is_connected());
            assert_eq!(set.get(b).unwrap().state(), State::Idle);
        });
    }

    #[test]
    fn local_ip_from_capture() {
        let serial = MockSerial::new();
        serial.expect(b"AT+CIFSR;E0\r\n", b"\r\n100.64.1.9\r\n\r\nOK\r\n");
        let modem = modem(&serial);

        let ip = block_on(modem.local_ip()).unwrap();
        assert_eq!(ip, Some(Ipv4Addr::new(100, 64, 1, 9)));
    }
}
