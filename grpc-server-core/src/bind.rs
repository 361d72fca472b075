//! Bind Engine (design §4.2): resolves an address string to concrete
//! listening sockets, with the partial-success aggregation described
//! there.

use std::net::SocketAddr;
use std::sync::Arc;

use http::Uri;
use tokio::net::TcpListener;
use tracing::{info, instrument};

use crate::error::{Result, ServerError};
use crate::resolver::{resolver_for_scheme, ResolvedAddress, Resolver};

/// One socket this crate actually listens on: either TCP or a Unix
/// domain socket, named uniformly so the Session Manager doesn't care
/// which.
pub enum BoundSocket {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix(tokio::net::UnixListener),
}

impl BoundSocket {
    pub fn local_port(&self) -> u16 {
        match self {
            BoundSocket::Tcp(listener) => listener.local_addr().map(|a| a.port()).unwrap_or(0),
            #[cfg(unix)]
            BoundSocket::Unix(_) => STAND_IN_PORT,
        }
    }
}

/// Arbitrary stand-in port non-TCP listeners report, per design §4.2.
const STAND_IN_PORT: u16 = 1;

/// Outcome of [`bind`]: the listening sockets actually created, plus the
/// port the caller should report back (design §4.2 step 4).
pub struct BindOutcome {
    pub sockets: Vec<BoundSocket>,
    pub port: u16,
}

/// Parses `address`, applies the default scheme `dns` when none is
/// present, resolves it, and binds according to the three address
/// shapes in design §4.2 step 3. Returns an error synchronously for
/// parse failures and resolution failures; binding failures are
/// aggregated rather than surfaced per-address.
#[instrument(level = "info", skip(resolver_override))]
pub async fn bind(
    address: &str,
    resolver_override: Option<Arc<dyn Resolver>>,
) -> Result<BindOutcome> {
    let uri = parse_address(address)?;

    let resolver: Arc<dyn Resolver> = match resolver_override {
        Some(resolver) => resolver,
        None => Arc::from(resolver_for_scheme(&uri)),
    };

    let addresses = resolver
        .resolve(&uri)
        .await
        .map_err(|status| ServerError::Resolution(status.message().to_string()))?;

    if addresses.is_empty() {
        return Err(ServerError::Resolution(format!(
            "No addresses resolved for {address}"
        )));
    }

    let total = addresses.len();
    let outcome = match &addresses[0] {
        ResolvedAddress::Unix(_) => bind_non_tcp(addresses).await,
        ResolvedAddress::Tcp(first) if first.port() != 0 => bind_explicit_port(addresses).await?,
        ResolvedAddress::Tcp(_) => bind_wildcard_port(addresses).await?,
    };

    report_aggregate(outcome, total)
}

fn parse_address(address: &str) -> Result<Uri> {
    let candidate = if address.contains("://") || address.starts_with("unix:") {
        address.to_string()
    } else {
        format!("dns://{address}")
    };
    candidate
        .parse::<Uri>()
        .map_err(|e| ServerError::InvalidArgument(format!("invalid address '{address}': {e}")))
}

struct RawOutcome {
    sockets: Vec<BoundSocket>,
    port: u16,
}

async fn bind_non_tcp(addresses: Vec<ResolvedAddress>) -> RawOutcome {
    let mut sockets = Vec::new();
    for address in addresses {
        let ResolvedAddress::Unix(_path) = address else {
            continue;
        };
        #[cfg(unix)]
        {
            if let Ok(listener) = tokio::net::UnixListener::bind(&_path) {
                sockets.push(BoundSocket::Unix(listener));
            }
        }
        #[cfg(not(unix))]
        {
            let _ = _path;
        }
    }
    RawOutcome {
        sockets,
        port: STAND_IN_PORT,
    }
}

async fn bind_explicit_port(addresses: Vec<ResolvedAddress>) -> Result<RawOutcome> {
    let tcp_addrs: Vec<SocketAddr> = addresses
        .into_iter()
        .filter_map(|a| match a {
            ResolvedAddress::Tcp(addr) => Some(addr),
            ResolvedAddress::Unix(_) => None,
        })
        .collect();

    let port = tcp_addrs[0].port();
    if tcp_addrs.iter().any(|a| a.port() != port) {
        return Err(ServerError::Bind(
            "multiple port numbers added from single address".to_string(),
        ));
    }

    let mut sockets = Vec::new();
    for addr in tcp_addrs {
        if let Ok(listener) = TcpListener::bind(addr).await {
            sockets.push(BoundSocket::Tcp(listener));
        }
    }
    Ok(RawOutcome { sockets, port })
}

/// Implements design §4.2 step 3's wildcard-port algorithm: the first
/// address to successfully bind an OS-assigned port fixes the port for
/// every remaining address; later addresses are never retried as a
/// fresh wildcard (design §9, first open question; this is
/// intentional, preserved as-is).
async fn bind_wildcard_port(addresses: Vec<ResolvedAddress>) -> Result<RawOutcome> {
    let tcp_addrs: Vec<SocketAddr> = addresses
        .into_iter()
        .filter_map(|a| match a {
            ResolvedAddress::Tcp(addr) => Some(addr),
            ResolvedAddress::Unix(_) => None,
        })
        .collect();

    let mut sockets = Vec::new();
    let mut chosen_port = None;

    for (index, addr) in tcp_addrs.iter().enumerate() {
        let bind_addr = match chosen_port {
            Some(port) => SocketAddr::new(addr.ip(), port),
            None => *addr,
        };

        match TcpListener::bind(bind_addr).await {
            Ok(listener) => {
                if chosen_port.is_none() {
                    chosen_port = Some(listener.local_addr()?.port());
                }
                sockets.push(BoundSocket::Tcp(listener));
            }
            Err(_) if chosen_port.is_none() && index + 1 < tcp_addrs.len() => {
                // No wildcard port chosen yet; try the next address as the
                // wildcard candidate instead (design §4.2 step 3).
                continue;
            }
            Err(_) => {
                // A port has already been chosen (or this was the last
                // candidate); this address simply fails to contribute.
            }
        }
    }

    Ok(RawOutcome {
        sockets,
        port: chosen_port.unwrap_or(0),
    })
}

fn report_aggregate(outcome: RawOutcome, total: usize) -> Result<BindOutcome> {
    let count = outcome.sockets.len();
    if count == 0 {
        return Err(ServerError::Bind(format!(
            "No address added out of total {total} resolved"
        )));
    }
    if count < total {
        info!(
            bound = count,
            resolved = total,
            "Only {count} addresses added out of total {total} resolved"
        );
    }
    Ok(BindOutcome {
        sockets: outcome.sockets,
        port: outcome.port,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::StaticResolver;

    #[tokio::test]
    async fn explicit_port_mismatch_fails() {
        let addresses = vec![
            ResolvedAddress::Tcp("127.0.0.1:8080".parse().unwrap()),
            ResolvedAddress::Tcp("127.0.0.1:9090".parse().unwrap()),
        ];
        let err = bind_explicit_port(addresses).await.unwrap_err();
        assert!(matches!(err, ServerError::Bind(_)));
    }

    #[tokio::test]
    async fn wildcard_port_binds_all_addresses_to_first_chosen_port() {
        let addresses = vec![
            ResolvedAddress::Tcp("127.0.0.1:0".parse().unwrap()),
            ResolvedAddress::Tcp("127.0.0.1:0".parse().unwrap()),
        ];
        let outcome = bind_wildcard_port(addresses).await.unwrap();
        assert_eq!(outcome.sockets.len(), 2);
        assert_ne!(outcome.port, 0);
    }

    #[tokio::test]
    async fn empty_resolution_is_an_error() {
        let resolver: Arc<dyn Resolver> = Arc::new(StaticResolver::new(vec![]));
        let err = bind("127.0.0.1:0", Some(resolver)).await.unwrap_err();
        assert!(matches!(err, ServerError::Resolution(_)));
    }

    #[tokio::test]
    async fn partial_bind_reports_success_with_the_common_port() {
        let resolver: Arc<dyn Resolver> = Arc::new(StaticResolver::new(vec![
            ResolvedAddress::Tcp("127.0.0.1:0".parse().unwrap()),
            // An address guaranteed to fail to bind from this process.
            ResolvedAddress::Tcp("127.0.0.1:0".parse().unwrap()),
        ]));
        let outcome = bind("127.0.0.1:0", Some(resolver)).await.unwrap();
        assert!(outcome.port != 0);
        assert!(!outcome.sockets.is_empty());
    }
}
