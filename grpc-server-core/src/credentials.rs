//! The credentials boundary consumed by the Bind Engine.
//!
//! `ServerCredentials` decides, per design §4.2, whether a listening
//! socket needs a plaintext or TLS-capable HTTP/2 server; the core never
//! itself parses certificates, it only asks the credentials object for
//! already-built TLS settings.

use std::sync::Arc;

use rustls::ServerConfig;

/// TLS parameters a [`ServerCredentials`] may supply.
#[derive(Clone)]
pub struct TlsSettings {
    pub server_config: Arc<ServerConfig>,
}

/// Supplies the parameters needed to construct either a plaintext or a
/// TLS-capable HTTP/2 server (design §1, "credentials/TLS provider").
pub trait ServerCredentials: Send + Sync {
    fn is_secure(&self) -> bool;
    fn tls_settings(&self) -> Option<&TlsSettings>;
}

/// Plaintext credentials: every listener this crate binds under these
/// credentials speaks h2c (HTTP/2 without TLS).
#[derive(Debug, Clone, Copy, Default)]
pub struct InsecureServerCredentials;

impl ServerCredentials for InsecureServerCredentials {
    fn is_secure(&self) -> bool {
        false
    }

    fn tls_settings(&self) -> Option<&TlsSettings> {
        None
    }
}

/// TLS credentials built from a pre-constructed `rustls::ServerConfig`.
///
/// Building the `ServerConfig` itself (loading PEM files, choosing a
/// cipher suite set) is left to the caller, matching the design's
/// statement that certificate parsing is not the core's job.
pub struct TlsServerCredentials {
    settings: TlsSettings,
}

impl TlsServerCredentials {
    pub fn new(server_config: ServerConfig) -> Self {
        TlsServerCredentials {
            settings: TlsSettings {
                server_config: Arc::new(server_config),
            },
        }
    }

    pub fn from_arc(server_config: Arc<ServerConfig>) -> Self {
        TlsServerCredentials {
            settings: TlsSettings { server_config },
        }
    }
}

impl ServerCredentials for TlsServerCredentials {
    fn is_secure(&self) -> bool {
        true
    }

    fn tls_settings(&self) -> Option<&TlsSettings> {
        Some(&self.settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insecure_credentials_report_plaintext() {
        let creds = InsecureServerCredentials;
        assert!(!creds.is_secure());
        assert!(creds.tls_settings().is_none());
    }
}
