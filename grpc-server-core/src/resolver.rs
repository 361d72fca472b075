//! The resolver boundary consumed by the Bind Engine.
//!
//! Mirrors the `createResolver(uri, listener) -> Resolver` contract of
//! design §6: a resolver turns a parsed address URI into zero or more
//! concrete addresses, delivered through a listener interface that
//! accepts only the first successful resolution (design §4.2 step 2,
//! §9 "Resolver single-shot").

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

use http::Uri;

use crate::status::Status;

/// One address a resolver can hand back: a TCP socket address, or a
/// filesystem path for a Unix domain socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedAddress {
    Tcp(SocketAddr),
    Unix(PathBuf),
}

impl ResolvedAddress {
    pub fn is_tcp(&self) -> bool {
        matches!(self, ResolvedAddress::Tcp(_))
    }
}

/// Turns an address URI into a list of concrete addresses.
///
/// Implementations are expected to resolve eagerly and return their full
/// result in one `resolve()` call; the Bind Engine enforces the
/// single-result semantics of design §9 at the call site, not here.
#[async_trait::async_trait]
pub trait Resolver: Send + Sync {
    async fn resolve(&self, uri: &Uri) -> Result<Vec<ResolvedAddress>, Status>;
}

/// `dns:` and bare `host:port` scheme resolver, backed by
/// `tokio::net::lookup_host`.
#[derive(Debug, Default)]
pub struct DnsResolver;

#[async_trait::async_trait]
impl Resolver for DnsResolver {
    async fn resolve(&self, uri: &Uri) -> Result<Vec<ResolvedAddress>, Status> {
        let authority = uri
            .authority()
            .ok_or_else(|| Status::internal(format!("address has no host/port: {uri}")))?;
        let host_port = authority.as_str().to_string();

        let addrs = tokio::net::lookup_host(host_port)
            .await
            .map_err(|e| Status::internal(format!("DNS resolution failed: {e}")))?
            .map(ResolvedAddress::Tcp)
            .collect::<Vec<_>>();

        Ok(addrs)
    }
}

/// `ipv4:`/`ipv6:` scheme resolver for an address that is already a
/// literal IP and port; no DNS lookup is performed.
#[derive(Debug, Default)]
pub struct IpLiteralResolver;

#[async_trait::async_trait]
impl Resolver for IpLiteralResolver {
    async fn resolve(&self, uri: &Uri) -> Result<Vec<ResolvedAddress>, Status> {
        let authority = uri
            .authority()
            .ok_or_else(|| Status::internal(format!("address has no host/port: {uri}")))?;

        let host = authority.host();
        let port = authority.port_u16().unwrap_or(0);

        let ip: IpAddr = host
            .trim_start_matches('[')
            .trim_end_matches(']')
            .parse()
            .map_err(|e| Status::internal(format!("invalid IP literal '{host}': {e}")))?;

        Ok(vec![ResolvedAddress::Tcp(SocketAddr::new(ip, port))])
    }
}

/// `unix:` scheme resolver: resolves to a single filesystem path, bound
/// with the arbitrary stand-in port described in design §4.2.
#[derive(Debug, Default)]
pub struct UnixResolver;

#[async_trait::async_trait]
impl Resolver for UnixResolver {
    async fn resolve(&self, uri: &Uri) -> Result<Vec<ResolvedAddress>, Status> {
        // For `unix:/path/to/socket` the path lands in `uri.path()`;
        // `uri.authority()` is absent.
        let path = uri.path();
        if path.is_empty() {
            return Err(Status::internal("unix address has no path"));
        }
        Ok(vec![ResolvedAddress::Unix(PathBuf::from(path))])
    }
}

/// A resolver that always returns a fixed, pre-resolved address list.
/// Used by tests that need deterministic (including empty or
/// partially-failing) resolution results without touching DNS.
#[derive(Debug, Clone)]
pub struct StaticResolver {
    addresses: Vec<ResolvedAddress>,
}

impl StaticResolver {
    pub fn new(addresses: Vec<ResolvedAddress>) -> Self {
        StaticResolver { addresses }
    }
}

#[async_trait::async_trait]
impl Resolver for StaticResolver {
    async fn resolve(&self, _uri: &Uri) -> Result<Vec<ResolvedAddress>, Status> {
        Ok(self.addresses.clone())
    }
}

/// Picks the built-in resolver for a URI's scheme. `dns` is the default
/// scheme applied when an address carries none (design §4.2 step 1).
pub fn resolver_for_scheme(uri: &Uri) -> Box<dyn Resolver> {
    match uri.scheme_str() {
        Some("unix") => Box::new(UnixResolver),
        Some("ipv4") | Some("ipv6") => Box::new(IpLiteralResolver),
        _ => Box::new(DnsResolver),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ip_literal_resolver_parses_host_and_port() {
        let uri: Uri = "ipv4://127.0.0.1:8080".parse().unwrap();
        let resolver = IpLiteralResolver;
        let addrs = resolver.resolve(&uri).await.unwrap();
        assert_eq!(addrs.len(), 1);
        assert!(addrs[0].is_tcp());
    }

    #[tokio::test]
    async fn unix_resolver_extracts_path() {
        let uri: Uri = "unix:/tmp/my.sock".parse().unwrap();
        let resolver = UnixResolver;
        let addrs = resolver.resolve(&uri).await.unwrap();
        assert_eq!(addrs, vec![ResolvedAddress::Unix(PathBuf::from("/tmp/my.sock"))]);
    }

    #[tokio::test]
    async fn static_resolver_returns_fixed_list() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let resolver = StaticResolver::new(vec![ResolvedAddress::Tcp(addr)]);
        let uri: Uri = "dns:whatever".parse().unwrap();
        let addrs = resolver.resolve(&uri).await.unwrap();
        assert_eq!(addrs, vec![ResolvedAddress::Tcp(addr)]);
    }
}
