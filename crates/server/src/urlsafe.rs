//! Gate for outbound URLs.
//!
//! Discovery and the metrics proxy both construct URLs partly from
//! upstream-controlled data, so every outbound target is vetted here before a
//! request is built: only http/https, no cloud-metadata endpoints, and no
//! loopback / private / link-local / unspecified addresses, whether the host
//! is a literal IP or resolves to one.

use std::net::IpAddr;

use url::{Host, Url};

/// Well-known cloud metadata endpoints that must never be fetched.
const BLOCKED_HOSTS: &[&str] = &[
    "169.254.169.254",
    "metadata.google.internal",
    "100.100.100.200",
];

/// Returns true when `raw` may be fetched.
///
/// DNS failure is accepted: the subsequent fetch fails safely on its own.
pub async fn is_safe_url(raw: &str) -> bool {
    check_url(raw, false).await
}

/// Like [`is_safe_url`], but `allow_private` waives the private/loopback
/// address rejection. Scheme and metadata-endpoint checks always apply.
/// The flag exists for development setups polling upstreams on private
/// networks; production configs leave it off.
pub async fn check_url(raw: &str, allow_private: bool) -> bool {
    let Ok(parsed) = Url::parse(raw) else {
        return false;
    };
    if parsed.scheme() != "http" && parsed.scheme() != "https" {
        return false;
    }
    let host = match parsed.host() {
        Some(host) => host,
        None => return false,
    };

    match host {
        Host::Ipv4(ip) => {
            if BLOCKED_HOSTS.contains(&ip.to_string().as_str()) {
                return false;
            }
            allow_private || !is_private_ip(IpAddr::V4(ip))
        }
        Host::Ipv6(ip) => allow_private || !is_private_ip(IpAddr::V6(ip)),
        Host::Domain(name) => {
            if BLOCKED_HOSTS.contains(&name) {
                return false;
            }
            if allow_private {
                return true;
            }
            match tokio::net::lookup_host((name, 443)).await {
                Ok(mut addrs) => !addrs.any(|a| is_private_ip(a.ip())),
                Err(_) => true,
            }
        }
    }
}

fn is_private_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback() || v4.is_private() || v4.is_link_local() || v4.is_unspecified()
        }
        IpAddr::V6(v6) => {
            let seg = v6.segments();
            v6.is_loopback()
                || v6.is_unspecified()
                // fc00::/7 unique-local
                || (seg[0] & 0xfe00) == 0xfc00
                // fe80::/10 link-local
                || (seg[0] & 0xffc0) == 0xfe80
        }
    }
}
