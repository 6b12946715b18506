//! Espressif ESP-AT firmware (ESP8266/ESP32) in multi-connection mode.
//!
//! The module keeps nothing: every received byte is pushed immediately as
//! `+IPD,<mux>,<len>:<data>` and has to be buffered here.

use embassy_time::Duration;
use heapless::Vec;
use no_std_net::Ipv4Addr;

use super::{drain_payload, line_mux, parse_ipv4, read_mux, Dialect};
use crate::at::{Reader, Session, Transport, UrcHandler};
use crate::config::{BufferingMode, Config};
use crate::error::Error;
use crate::socket::{ContextId, MuxMask, SocketAccess};

#[derive(Debug, Clone, Copy, Default)]
pub struct EspAt;

impl EspAt {
    const SEND_TIMEOUT: Duration = Duration::from_secs(10);
    const KEEP_ALIVE: u16 = 120;

    /// Muxes with a live connection, from one bulk `+CIPSTATUS`. `None` if
    /// the listing didn't complete.
    async fn statuses<S: Transport, U: UrcHandler>(
        &self,
        at: &mut Session<'_, S, U>,
    ) -> Result<Option<MuxMask>, Error> {
        let config = at.config();
        let terminator = config.line_terminator;
        at.send(format_args!("+CIPSTATUS")).await?;

        let mut connected = MuxMask::empty();
        loop {
            let outcome = at
                .wait(
                    config.command_timeout,
                    &["+CIPSTATUS:", terminator.ok(), terminator.error()],
                )
                .await?;
            match outcome.index() {
                1 => {
                    // +CIPSTATUS:<mux>,"TCP","<ip>",<port>,<local port>,<tetype>
                    let mux = read_mux(at.reader(), b',').await?;
                    at.reader().skip_until(b'\n').await?;
                    if let Some(mux) = mux {
                        connected.insert(mux);
                    }
                }
                2 => return Ok(Some(connected)),
                _ => return Ok(None),
            }
        }
    }
}

impl UrcHandler for EspAt {
    async fn handle<S: Transport>(
        &self,
        buf: &[u8],
        reader: &mut Reader<S>,
        sockets: &dyn SocketAccess,
    ) -> Result<bool, Error> {
        if buf.ends_with(b"+IPD,") {
            let mux = read_mux(reader, b',').await?;
            let len = reader.int_until(b':').await?;
            let (Some(mux), Some(len)) = (mux, len) else {
                warn!("Malformed +IPD header");
                return Ok(true);
            };
            let len = len.max(0) as usize;
            trace!("[{}] URC: {} bytes pushed", mux, len);
            drain_payload(reader, sockets, mux, len).await?;
            return Ok(true);
        }
        if buf.ends_with(b",CLOSED\r\n") {
            if let Some(mux) = line_mux(buf, b",CLOSED\r\n") {
                trace!("[{}] URC: closed", mux);
                sockets.set_connected(mux, false);
            }
            return Ok(true);
        }
        if buf.ends_with(b"WIFI DISCONNECT\r\n") {
            trace!("URC: station disconnected");
            sockets.disconnect_all();
            return Ok(true);
        }
        Ok(false)
    }
}

impl Dialect for EspAt {
    fn config(&self) -> Config {
        Config::new()
            .buffering(BufferingMode::Push)
            .mux_capacity(5, 1)
            .max_send_chunk(2048)
    }

    async fn init<S: Transport, U: UrcHandler>(
        &self,
        at: &mut Session<'_, S, U>,
    ) -> Result<bool, Error> {
        Ok(at.command(format_args!("E0")).await?
            && at.command(format_args!("+CIPMUX=1")).await?
            && at.command(format_args!("+CIPDINFO=0")).await?)
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
        let kind = if tls.is_some() { "SSL" } else { "TCP" };
        at.send(format_args!(
            "+CIPSTART={},\"{}\",\"{}\",{},{}",
            mux,
            kind,
            host,
            port,
            Self::KEEP_ALIVE
        ))
        .await?;
        let outcome = at
            .wait(timeout, &["OK\r\n", "ERROR\r\n", "ALREADY CONNECT\r\n"])
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
        len: usize,
    ) -> Result<usize, Error> {
        let outcome = at
            .wait(
                Self::SEND_TIMEOUT,
                &["SEND OK\r\n", "SEND FAIL\r\n", "ERROR\r\n"],
            )
            .await?;
        Ok(if outcome.is(1) { len } else { 0 })
    }

    async fn is_connected<S: Transport, U: UrcHandler>(
        &self,
        at: &mut Session<'_, S, U>,
        mux: u8,
    ) -> Result<bool, Error> {
        Ok(self
            .statuses(at)
            .await?
            .is_some_and(|connected| connected.contains(mux)))
    }

    async fn close<S: Transport, U: UrcHandler>(
        &self,
        at: &mut Session<'_, S, U>,
        mux: u8,
    ) -> Result<bool, Error> {
        let timeout = at.config().close_timeout;
        at.send(format_args!("+CIPCLOSE={}", mux)).await?;
        Ok(at.wait_ok(timeout).await?.is(1))
    }

    async fn refresh<S: Transport, U: UrcHandler>(
        &self,
        at: &mut Session<'_, S, U>,
    ) -> Result<(), Error> {
        let Some(connected) = self.statuses(at).await? else {
            return Ok(());
        };
        let sockets = at.sockets();
        for mux in sockets.active().iter() {
            sockets.set_connected(mux, connected.contains(mux));
        }
        Ok(())
    }

    async fn local_ip<S: Transport, U: UrcHandler>(
        &self,
        at: &mut Session<'_, S, U>,
    ) -> Result<Option<Ipv4Addr>, Error> {
        let timeout = at.config().command_timeout;
        at.send(format_args!("+CIFSR")).await?;
        if !at.expect(timeout, "+CIFSR:STAIP,").await? {
            return Ok(None);
        }
        let mut address: Vec<u8, 24> = Vec::new();
        at.reader().read_until(b'\n', &mut address).await?;
        at.wait_ok(timeout).await?;
        Ok(parse_ipv4(&address))
    }
}
