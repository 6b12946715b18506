#![cfg_attr(not(test), no_std)]
#![allow(async_fn_in_trait)]

// This mod MUST go first, so that the others see its macros.
pub(crate) mod fmt;

pub mod at;
pub mod client;
pub mod config;
pub mod error;
pub mod modem;
pub mod modules;
mod send;
pub mod socket;
pub mod ssl;

#[cfg(test)]
mod test_helpers;

pub use at::{Outcome, Session, Transport, UrcHandler};
pub use client::TcpClient;
pub use config::{BufferingMode, Config, LineTerminator};
pub use error::Error;
pub use modem::Modem;
pub use modules::{Dialect, Module, Received};
pub use socket::{ContextId, SocketHandle, State};
