//! u-blox SARA/LARA/TOBY socket commands (`+USOxx`).
//!
//! The module picks the socket id itself on `+USOCR`, so every connect ends
//! in a mux reconciliation. Received data stays on the module until fetched
//! with `+USORD`.

use embassy_time::{Duration, Timer};
use heapless::Vec;
use no_std_net::Ipv4Addr;

use super::{drain_payload, parse_ipv4, read_mux, Dialect, Received};
use crate::at::{Reader, Session, Transport, UrcHandler};
use crate::config::Config;
use crate::error::Error;
use crate::socket::{ContextId, SocketAccess};
use crate::ssl::{CertificateKind, CertificateNames, Tls, TlsVersion, Validation};

#[derive(Debug, Clone, Copy, Default)]
pub struct Ublox;

impl Ublox {
    /// The module misses the first payload bytes when they follow the `@`
    /// prompt too closely.
    pub const PROMPT_SETTLE: Duration = Duration::from_millis(50);
    /// TCP
    const PROTOCOL: u8 = 6;
    /// `+USOCTL` parameter for the TCP state
    const TCP_STATE: u8 = 10;
}

impl UrcHandler for Ublox {
    async fn handle<S: Transport>(
        &self,
        buf: &[u8],
        reader: &mut Reader<S>,
        sockets: &dyn SocketAccess,
    ) -> Result<bool, Error> {
        if buf.ends_with(b"+UUSORD:") {
            let mux = read_mux(reader, b',').await?;
            let len = reader.int_until(b'\n').await?;
            if let (Some(mux), Some(len)) = (mux, len) {
                trace!("[{}] URC: {} bytes received", mux, len);
                sockets.set_got_data(mux);
                sockets.set_available(mux, len.max(0) as usize);
            }
            return Ok(true);
        }
        if buf.ends_with(b"+UUSOCL:") {
            if let Some(mux) = read_mux(reader, b'\n').await? {
                trace!("[{}] URC: closed", mux);
                sockets.set_connected(mux, false);
            }
            return Ok(true);
        }
        if buf.ends_with(b"+UUPSDD:") {
            reader.skip_until(b'\n').await?;
            trace!("URC: PDP context deactivated");
            sockets.disconnect_all();
            return Ok(true);
        }
        Ok(false)
    }
}

impl Dialect for Ublox {
    fn config(&self) -> Config {
        Config::new()
            .verbose_error("+CME ERROR:")
            .mux_capacity(7, 7)
            .max_send_chunk(1024)
            .max_read_chunk(1024)
            .close_timeout(Duration::from_secs(10))
    }

    async fn open<S: Transport, U: UrcHandler>(
        &self,
        at: &mut Session<'_, S, U>,
        _mux: u8,
        host: &str,
        port: u16,
        tls: Option<ContextId>,
        timeout: Duration,
    ) -> Result<Option<u8>, Error> {
        let command_timeout = at.config().command_timeout;
        at.send(format_args!("+USOCR={}", Self::PROTOCOL)).await?;
        if !at.expect(command_timeout, "+USOCR:").await? {
            return Ok(None);
        }
        let Some(mux) = read_mux(at.reader(), b'\n').await? else {
            return Ok(None);
        };
        at.wait_ok(command_timeout).await?;

        if let Some(ContextId(context)) = tls {
            if !at.command(format_args!("+USOSEC={},1,{}", mux, context)).await? {
                self.close(at, mux).await?;
                return Ok(None);
            }
        }

        at.send(format_args!("+USOCO={},\"{}\",{}", mux, host, port))
            .await?;
        if at.wait_ok(timeout).await?.is(1) {
            return Ok(Some(mux));
        }
        // Free the socket id the module created for us.
        self.close(at, mux).await?;
        Ok(None)
    }

    async fn begin_send<S: Transport, U: UrcHandler>(
        &self,
        at: &mut Session<'_, S, U>,
        mux: u8,
        len: usize,
    ) -> Result<bool, Error> {
        let timeout = at.config().command_timeout;
        at.send(format_args!("+USOWR={},{}", mux, len)).await?;
        if !at.expect(timeout, "@").await? {
            return Ok(false);
        }
        Timer::after(Self::PROMPT_SETTLE).await;
        Ok(true)
    }

    async fn end_send<S: Transport, U: UrcHandler>(
        &self,
        at: &mut Session<'_, S, U>,
        _mux: u8,
        _len: usize,
    ) -> Result<usize, Error> {
        let timeout = at.config().command_timeout;
        if !at.expect(timeout, "+USOWR:").await? {
            return Ok(0);
        }
        at.reader().skip_until(b',').await?;
        let sent = at.reader().int_until(b'\n').await?.unwrap_or(0);
        at.wait_ok(timeout).await?;
        Ok(sent.max(0) as usize)
    }

    async fn available<S: Transport, U: UrcHandler>(
        &self,
        at: &mut Session<'_, S, U>,
        mux: u8,
    ) -> Result<usize, Error> {
        let timeout = at.config().command_timeout;
        at.send(format_args!("+USORD={},0", mux)).await?;
        if !at.expect(timeout, "+USORD:").await? {
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
        at.send(format_args!("+USORD={},{}", mux, len)).await?;
        if !at.expect(timeout, "+USORD:").await? {
            return Ok(Received::default());
        }
        // +USORD: <mux>,<len>,"<data>"
        at.reader().skip_until(b',').await?;
        let len = at.reader().int_until(b',').await?.unwrap_or(0).max(0) as usize;
        at.reader().skip_until(b'"').await?;
        let sockets = at.sockets();
        let moved = drain_payload(at.reader(), sockets, mux, len).await?;
        at.wait_ok(timeout).await?;
        Ok(Received::new(moved, None))
    }

    async fn is_connected<S: Transport, U: UrcHandler>(
        &self,
        at: &mut Session<'_, S, U>,
        mux: u8,
    ) -> Result<bool, Error> {
        let timeout = at.config().command_timeout;
        at.send(format_args!("+USOCTL={},{}", mux, Self::TCP_STATE))
            .await?;
        if !at.expect(timeout, "+USOCTL:").await? {
            return Ok(false);
        }
        at.reader().skip_until(b',').await?;
        at.reader().skip_until(b',').await?;
        // 0 is CLOSED, everything else still holds the socket
        let state = at.reader().int_until(b'\n').await?.unwrap_or(0);
        at.wait_ok(timeout).await?;
        Ok(state != 0)
    }

    async fn close<S: Transport, U: UrcHandler>(
        &self,
        at: &mut Session<'_, S, U>,
        mux: u8,
    ) -> Result<bool, Error> {
        let timeout = at.config().close_timeout;
        at.send(format_args!("+USOCL={}", mux)).await?;
        Ok(at.wait_ok(timeout).await?.is(1))
    }

    async fn local_ip<S: Transport, U: UrcHandler>(
        &self,
        at: &mut Session<'_, S, U>,
    ) -> Result<Option<Ipv4Addr>, Error> {
        let timeout = at.config().command_timeout;
        at.send(format_args!("+UPSND=0,0")).await?;
        if !at.expect(timeout, "+UPSND:").await? {
            return Ok(None);
        }
        at.reader().skip_until(b',').await?;
        at.reader().skip_until(b',').await?;
        let mut address: Vec<u8, 24> = Vec::new();
        at.reader().read_until(b'\n', &mut address).await?;
        at.wait_ok(timeout).await?;
        Ok(parse_ipv4(&address))
    }
}

impl Tls for Ublox {
    async fn load_certificate<S: Transport, U: UrcHandler>(
        &self,
        at: &mut Session<'_, S, U>,
        kind: CertificateKind,
        name: &str,
        data: &[u8],
    ) -> Result<bool, Error> {
        let timeout = at.config().command_timeout;
        at.send(format_args!(
            "+USECMNG=0,{},\"{}\",{}",
            kind as u8,
            name,
            data.len()
        ))
        .await?;
        if !at.expect(timeout, ">").await? {
            return Ok(false);
        }
        at.write_raw(data).await?;
        Ok(at.wait_ok(timeout).await?.is(1))
    }

    async fn delete_certificate<S: Transport, U: UrcHandler>(
        &self,
        at: &mut Session<'_, S, U>,
        kind: CertificateKind,
        name: &str,
    ) -> Result<bool, Error> {
        at.command(format_args!("+USECMNG=2,{},\"{}\"", kind as u8, name))
            .await
    }

    async fn configure_context<S: Transport, U: UrcHandler>(
        &self,
        at: &mut Session<'_, S, U>,
        context: ContextId,
        validation: Validation,
        version: TlsVersion,
        names: &CertificateNames<'_>,
    ) -> Result<bool, Error> {
        let ContextId(profile) = context;
        if !at
            .command(format_args!("+USECPRF={},0,{}", profile, validation as u8))
            .await?
        {
            return Ok(false);
        }
        if !at
            .command(format_args!("+USECPRF={},1,{}", profile, version as u8))
            .await?
        {
            return Ok(false);
        }

        let bindings = [
            (3, names.root_ca),
            (5, names.client_certificate),
            (6, names.client_key),
        ];
        for (op, name) in bindings {
            let Some(name) = name else {
                continue;
            };
            if !at
                .command(format_args!("+USECPRF={},{},\"{}\"", profile, op, name))
                .await?
            {
                return Ok(false);
            }
        }
        Ok(true)
    }
}
