//! ### TLS credentials and security profiles
//!
//! Certificates and keys are stored on the module under a name, then bound
//! to a numbered security profile (a [`ContextId`]). A socket created with
//! [`Modem::secure_socket`](crate::Modem::secure_socket) hands that id to the
//! module when it opens the connection; nothing else about TLS is handled on
//! this side of the link.

use serde::{Deserialize, Serialize};

use crate::at::{Session, Transport, UrcHandler};
use crate::error::Error;
use crate::modules::Dialect;
use crate::socket::ContextId;

/// Type of the security data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CertificateKind {
    /// 0: trusted root CA (certificate authority) certificate
    RootCa = 0,
    /// 1: client certificate
    ClientCertificate = 1,
    /// 2: client private key
    ClientKey = 2,
}

/// Certificate validation level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Validation {
    /// 0: the server certificate is not checked
    #[default]
    None = 0,
    /// 1: root certificate validation without URL integrity check
    RootCertificate = 1,
    /// 2: root certificate validation with URL integrity check
    RootCertificateWithUrl = 2,
    /// 3: level 2 plus a check of the certificate validity date
    RootCertificateWithUrlAndDate = 3,
}

/// Minimum SSL/TLS version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TlsVersion {
    /// 0: any version the server picks
    #[default]
    Any = 0,
    Tls1_0 = 1,
    Tls1_1 = 2,
    Tls1_2 = 3,
    Tls1_3 = 4,
}

/// Names of stored credentials to bind to a security profile.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CertificateNames<'a> {
    pub root_ca: Option<&'a str>,
    pub client_certificate: Option<&'a str>,
    pub client_key: Option<&'a str>,
}

/// Credential storage and security profile configuration.
pub trait Tls: Dialect {
    /// Store `data` under `name`, replacing anything stored there before.
    async fn load_certificate<S: Transport, U: UrcHandler>(
        &self,
        at: &mut Session<'_, S, U>,
        kind: CertificateKind,
        name: &str,
        data: &[u8],
    ) -> Result<bool, Error>;

    async fn delete_certificate<S: Transport, U: UrcHandler>(
        &self,
        at: &mut Session<'_, S, U>,
        kind: CertificateKind,
        name: &str,
    ) -> Result<bool, Error>;

    /// Set the validation level, the minimum version and the credentials of
    /// profile `context`. Names left `None` are not touched.
    async fn configure_context<S: Transport, U: UrcHandler>(
        &self,
        at: &mut Session<'_, S, U>,
        context: ContextId,
        validation: Validation,
        version: TlsVersion,
        names: &CertificateNames<'_>,
    ) -> Result<bool, Error>;
}
