use std::net::IpAddr;
use std::time::Duration;
use anyhow::{anyhow, Result};
use tokio::net::lookup_host;
use tokio::time::timeout;
use crate::data::Destination;

const LOOKUP_TIMEOUT: Duration = Duration::from_secs(5);

/// Resolves the destination host to addresses. Literal IPs resolve to
/// themselves without touching DNS.
pub async fn lookup(destination: &Destination) -> Result<Vec<IpAddr>> {
    let host = destination.destination.trim();
    let host = host.strip_prefix('[').and_then(|h| h.strip_suffix(']')).unwrap_or(host);

    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(vec![ip]);
    }

    let port  = destination.port().unwrap_or(0);
    let addrs = timeout(LOOKUP_TIMEOUT, lookup_host((host, port))).await
        .map_err(|_| anyhow!("lookup of {} timed out", host))??;

    let mut ips = addrs.map(|addr| addr.ip()).collect::<Vec<_>>();
    ips.sort_unstable();
    ips.dedup();

    match ips.is_empty() {
        true  => Err(anyhow!("{} resolved to no addresses", host)),
        false => Ok(ips),
    }
}
