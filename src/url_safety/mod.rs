//! Outbound URL policy
//!
//! Two checkpoints share one policy: [`validate_target_url`] gates the URLs a
//! test is configured to open, and [`UrlSafetyFilter::validate_runtime_request_url`]
//! additionally resolves hostnames so a page cannot reach private address
//! space through DNS. Only resolution failures are cached; positive answers
//! are re-resolved every time to keep rebinding attacks from riding a stale
//! cache entry.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use lru::LruCache;
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;

/// Wording surfaced to observers when a request hits the block set.
pub const PRIVATE_ADDRESS_MESSAGE: &str = "Private network addresses are not allowed";

const ALLOWED_SCHEMES: [&str; 2] = ["http", "https"];
const DNS_CACHE_SIZE: usize = 512;
const DEDUP_CACHE_SIZE: usize = 256;

/// Why a URL was rejected.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum UrlPolicyError {
    #[error("Invalid URL: {0}")]
    Malformed(String),

    #[error("URL scheme '{0}' is not allowed")]
    SchemeNotAllowed(String),

    #[error("URL has no hostname")]
    MissingHost,

    /// A literal or resolved address fell inside the block set.
    #[error("{PRIVATE_ADDRESS_MESSAGE}")]
    BlockedAddress {
        host: String,
        reason: &'static str,
    },

    #[error("DNS lookup failed for {host}: {message}")]
    DnsFailure { host: String, message: String },

    #[error("DNS lookup for {0} timed out")]
    DnsTimeout(String),
}

/// Classify an address against the block set. Returns the matching range
/// name, or `None` when the address is routable.
#[must_use]
pub fn blocked_ip_reason(ip: IpAddr) -> Option<&'static str> {
    match ip {
        IpAddr::V4(v4) => blocked_v4_reason(v4),
        IpAddr::V6(v6) => {
            // IPv4-mapped addresses smuggle a v4 literal into a v6 socket.
            if let Some(mapped) = v6.to_ipv4_mapped() {
                return blocked_v4_reason(mapped);
            }
            blocked_v6_reason(v6)
        }
    }
}

fn blocked_v4_reason(ip: Ipv4Addr) -> Option<&'static str> {
    if ip.is_unspecified() {
        Some("unspecified")
    } else if ip.is_loopback() {
        Some("loopback")
    } else if ip.is_private() {
        Some("private (RFC1918)")
    } else if ip.is_link_local() {
        Some("link-local")
    } else if ip.is_multicast() {
        Some("multicast")
    } else if ip.is_broadcast() {
        Some("broadcast")
    } else {
        None
    }
}

fn blocked_v6_reason(ip: Ipv6Addr) -> Option<&'static str> {
    let segments = ip.segments();
    if ip.is_unspecified() {
        Some("unspecified")
    } else if ip.is_loopback() {
        Some("loopback")
    } else if (segments[0] & 0xfe00) == 0xfc00 {
        Some("unique-local")
    } else if (segments[0] & 0xffc0) == 0xfe80 {
        Some("link-local")
    } else if ip.is_multicast() {
        Some("multicast")
    } else {
        None
    }
}

/// Syntactic and literal-address validation of a configured target URL.
///
/// No DNS is performed here; a hostname that merely *resolves* to private
/// space is caught later by the runtime filter.
pub fn validate_target_url(raw: &str) -> Result<Url, UrlPolicyError> {
    let url = Url::parse(raw).map_err(|e| UrlPolicyError::Malformed(e.to_string()))?;

    let scheme = url.scheme();
    if !ALLOWED_SCHEMES.contains(&scheme) {
        return Err(UrlPolicyError::SchemeNotAllowed(scheme.to_string()));
    }

    let host = url.host_str().ok_or(UrlPolicyError::MissingHost)?;
    if host.is_empty() {
        return Err(UrlPolicyError::MissingHost);
    }

    if let Some(ip) = parse_host_literal(&url) {
        if let Some(reason) = blocked_ip_reason(ip) {
            return Err(UrlPolicyError::BlockedAddress {
                host: host.to_string(),
                reason,
            });
        }
    }

    Ok(url)
}

fn parse_host_literal(url: &Url) -> Option<IpAddr> {
    match url.host()? {
        url::Host::Ipv4(ip) => Some(IpAddr::V4(ip)),
        url::Host::Ipv6(ip) => Some(IpAddr::V6(ip)),
        url::Host::Domain(_) => None,
    }
}

struct NegativeEntry {
    expires_at: Instant,
    error: UrlPolicyError,
}

/// Runtime request filter with a negative-only DNS cache and per-host
/// blocked-log deduplication.
pub struct UrlSafetyFilter {
    dns_cache_ttl: Duration,
    dns_lookup_timeout: Duration,
    dedup_window: Duration,
    negative_cache: Mutex<LruCache<String, NegativeEntry>>,
    log_dedup: Mutex<LruCache<String, Instant>>,
}

impl UrlSafetyFilter {
    #[must_use]
    pub fn new(
        dns_cache_ttl: Duration,
        dns_lookup_timeout: Duration,
        dedup_window: Duration,
    ) -> Self {
        Self {
            dns_cache_ttl,
            dns_lookup_timeout,
            dedup_window,
            negative_cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(DNS_CACHE_SIZE).unwrap_or(NonZeroUsize::MIN),
            )),
            log_dedup: Mutex::new(LruCache::new(
                NonZeroUsize::new(DEDUP_CACHE_SIZE).unwrap_or(NonZeroUsize::MIN),
            )),
        }
    }

    #[must_use]
    pub fn from_config(config: &crate::config::OrchestratorConfig) -> Self {
        Self::new(
            config.dns_cache_ttl,
            config.dns_lookup_timeout,
            config.blocked_request_log_dedup,
        )
    }

    /// Validate a URL a page is trying to fetch at runtime.
    ///
    /// Literal addresses are checked directly; domain names are resolved and
    /// every returned address must be outside the block set. A lookup
    /// timeout counts as a failure and is cached like any other failure.
    pub async fn validate_runtime_request_url(&self, raw: &str) -> Result<(), UrlPolicyError> {
        let url = validate_target_url(raw)?;

        let host = match url.host() {
            Some(url::Host::Domain(domain)) => domain.to_ascii_lowercase(),
            // Literal addresses were already checked syntactically.
            _ => return Ok(()),
        };

        if let Some(cached) = self.cached_failure(&host) {
            debug!(host, "DNS negative cache hit");
            return Err(cached);
        }

        let port = url.port_or_known_default().unwrap_or(443);
        let result = self.resolve_and_check(&host, port).await;

        if let Err(error) = &result {
            self.cache_failure(&host, error.clone());
        }
        result
    }

    async fn resolve_and_check(&self, host: &str, port: u16) -> Result<(), UrlPolicyError> {
        let lookup = tokio::net::lookup_host((host, port));
        let addrs = match tokio::time::timeout(self.dns_lookup_timeout, lookup).await {
            Ok(Ok(addrs)) => addrs,
            Ok(Err(e)) => {
                return Err(UrlPolicyError::DnsFailure {
                    host: host.to_string(),
                    message: e.to_string(),
                });
            }
            Err(_) => return Err(UrlPolicyError::DnsTimeout(host.to_string())),
        };

        let mut resolved_any = false;
        for addr in addrs {
            resolved_any = true;
            if let Some(reason) = blocked_ip_reason(addr.ip()) {
                warn!(host, %addr, reason, "blocked runtime request");
                return Err(UrlPolicyError::BlockedAddress {
                    host: host.to_string(),
                    reason,
                });
            }
        }

        if !resolved_any {
            return Err(UrlPolicyError::DnsFailure {
                host: host.to_string(),
                message: "no addresses returned".to_string(),
            });
        }
        Ok(())
    }

    fn cached_failure(&self, host: &str) -> Option<UrlPolicyError> {
        let mut cache = self.negative_cache.lock();
        match cache.get(host) {
            Some(entry) if entry.expires_at > Instant::now() => Some(entry.error.clone()),
            Some(_) => {
                cache.pop(host);
                None
            }
            None => None,
        }
    }

    fn cache_failure(&self, host: &str, error: UrlPolicyError) {
        self.negative_cache.lock().put(
            host.to_string(),
            NegativeEntry {
                expires_at: Instant::now() + self.dns_cache_ttl,
                error,
            },
        );
    }

    /// Number of live negative cache entries (expired entries may linger
    /// until touched).
    #[must_use]
    pub fn negative_cache_len(&self) -> usize {
        self.negative_cache.lock().len()
    }

    /// Whether a blocked-request log line for `host:reason` should be
    /// emitted now. Subsequent calls within the dedup window return false.
    pub fn should_log_blocked(&self, host: &str, reason: &str) -> bool {
        let key = format!("{host}:{reason}");
        let now = Instant::now();
        let mut dedup = self.log_dedup.lock();
        if let Some(last) = dedup.get(&key) {
            if now.duration_since(*last) < self.dedup_window {
                return false;
            }
        }
        dedup.put(key, now);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter_with_ttl(ttl: Duration) -> UrlSafetyFilter {
        UrlSafetyFilter::new(ttl, Duration::from_secs(3), Duration::from_millis(50))
    }

    #[test]
    fn accepts_public_http_url() {
        assert!(validate_target_url("https://example.com/login").is_ok());
    }

    #[test]
    fn rejects_unsupported_scheme() {
        match validate_target_url("file:///etc/passwd") {
            Err(UrlPolicyError::SchemeNotAllowed(scheme)) => assert_eq!(scheme, "file"),
            other => panic!("expected scheme rejection, got {other:?}"),
        }
        assert!(validate_target_url("ftp://example.com").is_err());
    }

    #[test]
    fn rejects_literal_private_addresses() {
        for raw in [
            "http://10.0.0.1/",
            "http://172.16.1.1/",
            "http://192.168.1.10/admin",
            "http://127.0.0.1:8080/",
            "http://169.254.169.254/latest/meta-data",
            "http://0.0.0.0/",
            "http://[::1]/",
            "http://[fc00::1]/",
            "http://[fe80::1]/",
            "http://[::ffff:192.168.0.1]/",
        ] {
            match validate_target_url(raw) {
                Err(UrlPolicyError::BlockedAddress { .. }) => {}
                other => panic!("{raw} should be blocked, got {other:?}"),
            }
        }
    }

    #[test]
    fn accepts_public_literal_address() {
        assert!(validate_target_url("http://93.184.216.34/").is_ok());
    }

    #[test]
    fn rejects_garbage() {
        assert!(matches!(
            validate_target_url("not a url"),
            Err(UrlPolicyError::Malformed(_))
        ));
    }

    #[test]
    fn blocked_reason_names_the_range() {
        assert_eq!(
            blocked_ip_reason("192.168.0.1".parse().unwrap()),
            Some("private (RFC1918)")
        );
        assert_eq!(
            blocked_ip_reason("169.254.169.254".parse().unwrap()),
            Some("link-local")
        );
        assert_eq!(blocked_ip_reason("8.8.8.8".parse().unwrap()), None);
    }

    #[tokio::test]
    async fn runtime_filter_blocks_localhost_by_resolution() {
        let filter = filter_with_ttl(Duration::from_secs(30));
        let result = filter
            .validate_runtime_request_url("http://localhost:9999/")
            .await;
        assert!(matches!(
            result,
            Err(UrlPolicyError::BlockedAddress { .. })
        ));
    }

    #[tokio::test]
    async fn resolution_failures_are_cached_negatively() {
        let filter = filter_with_ttl(Duration::from_secs(30));
        let raw = "http://host.invalid/";

        let first = filter.validate_runtime_request_url(raw).await;
        assert!(first.is_err());
        assert_eq!(filter.negative_cache_len(), 1);

        // Second call is served from the cache with the same error kind.
        let second = filter.validate_runtime_request_url(raw).await;
        assert_eq!(first.err(), second.err());
    }

    #[tokio::test]
    async fn negative_cache_entries_expire() {
        let filter = filter_with_ttl(Duration::from_millis(30));
        let raw = "http://host.invalid/";

        assert!(filter.validate_runtime_request_url(raw).await.is_err());
        tokio::time::sleep(Duration::from_millis(60)).await;

        // The expired entry is dropped on next access and re-resolved.
        assert!(filter.validate_runtime_request_url(raw).await.is_err());
        assert_eq!(filter.negative_cache_len(), 1);
    }

    #[test]
    fn blocked_log_dedup_suppresses_within_window() {
        let filter = filter_with_ttl(Duration::from_secs(30));
        assert!(filter.should_log_blocked("169.254.169.254", "link-local"));
        assert!(!filter.should_log_blocked("169.254.169.254", "link-local"));
        // Distinct reason is a distinct key.
        assert!(filter.should_log_blocked("169.254.169.254", "loopback"));
    }

    #[tokio::test]
    async fn blocked_log_dedup_expires() {
        let filter = filter_with_ttl(Duration::from_secs(30));
        assert!(filter.should_log_blocked("h", "r"));
        tokio::time::sleep(Duration::from_millis(70)).await;
        assert!(filter.should_log_blocked("h", "r"));
    }
}
