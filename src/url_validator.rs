//! URL safety validation
//!
//! Rejects anything that would point the renderer at the host's own network
//! before a browser context is ever allocated.

use std::net::{Ipv4Addr, Ipv6Addr};
use thiserror::Error;
use url::{Host, Url};

pub const DEFAULT_BLACKLIST: &[&str] = &["malicious-site.com", "badsite.example", "scam.test"];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UnsafeUrlError {
    #[error("Invalid URL format")]
    InvalidFormat,

    #[error("Only HTTP and HTTPS protocols are allowed")]
    UnsupportedScheme(String),

    #[error("Access to internal networks is not allowed")]
    PrivateNetwork,

    #[error("Access to localhost is not allowed")]
    Localhost,

    #[error("Domain is blacklisted")]
    Blacklisted(String),
}

#[derive(Debug, Clone)]
pub struct UrlValidator {
    blacklist: Vec<String>,
}

impl Default for UrlValidator {
    fn default() -> Self {
        Self::new(DEFAULT_BLACKLIST.iter().map(|d| d.to_string()))
    }
}

impl UrlValidator {
    pub fn new<I, S>(blacklist: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            blacklist: blacklist
                .into_iter()
                .map(|d| d.into().trim().trim_end_matches('.').to_ascii_lowercase())
                .filter(|d| !d.is_empty())
                .collect(),
        }
    }

    /// Parse `raw` and check it is safe to render.
    ///
    /// Checks run in order: scheme, internal IPv4 ranges, blacklist, then
    /// localhost forms.
    pub fn validate(&self, raw: &str) -> Result<Url, UnsafeUrlError> {
        let url = Url::parse(raw.trim()).map_err(|_| UnsafeUrlError::InvalidFormat)?;

        match url.scheme() {
            "http" | "https" => {}
            other => return Err(UnsafeUrlError::UnsupportedScheme(other.to_string())),
        }

        let host = url.host().ok_or(UnsafeUrlError::InvalidFormat)?;

        if let Host::Ipv4(addr) = host {
            if is_internal_ipv4(addr) {
                return Err(UnsafeUrlError::PrivateNetwork);
            }
        }

        if let Host::Domain(domain) = host {
            let domain = domain.trim_end_matches('.');
            if let Some(hit) = self.blacklisted(domain) {
                return Err(UnsafeUrlError::Blacklisted(hit.to_string()));
            }
        }

        if is_localhost(&host) {
            return Err(UnsafeUrlError::Localhost);
        }

        Ok(url)
    }

    pub fn is_safe(&self, raw: &str) -> bool {
        self.validate(raw).is_ok()
    }

    fn blacklisted(&self, domain: &str) -> Option<&str> {
        self.blacklist
            .iter()
            .find(|blocked| {
                domain == blocked.as_str()
                    || domain
                        .strip_suffix(blocked.as_str())
                        .is_some_and(|prefix| prefix.ends_with('.'))
            })
            .map(String::as_str)
    }
}

fn is_internal_ipv4(addr: Ipv4Addr) -> bool {
    // 10/8, 172.16/12, 192.168/16 and 127/8
    addr.is_private() || addr.is_loopback()
}

fn is_localhost(host: &Host<&str>) -> bool {
    match host {
        Host::Domain(domain) => {
            let domain = domain.trim_end_matches('.');
            domain == "localhost" || domain.ends_with(".localhost")
        }
        Host::Ipv4(addr) => addr.is_unspecified(),
        Host::Ipv6(addr) => {
            addr.is_loopback() || addr.is_unspecified() || is_mapped_internal(*addr)
        }
    }
}

fn is_mapped_internal(addr: Ipv6Addr) -> bool {
    addr.to_ipv4_mapped()
        .is_some_and(|v4| is_internal_ipv4(v4) || v4.is_unspecified())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accepts_public_urls() {
        let validator = UrlValidator::default();
        let url = validator.validate("https://example.com/path?q=1").unwrap();
        assert_eq!(url.host_str(), Some("example.com"));
        assert!(validator.is_safe("http://8.8.8.8/"));
        assert!(validator.is_safe("https://172.32.0.1"));
    }

    #[test]
    fn test_rejects_malformed_input() {
        let validator = UrlValidator::default();
        assert_eq!(
            validator.validate("not a url"),
            Err(UnsafeUrlError::InvalidFormat)
        );
        assert_eq!(
            validator.validate("").unwrap_err().to_string(),
            "Invalid URL format"
        );
    }

    #[test]
    fn test_rejects_non_http_schemes() {
        let validator = UrlValidator::default();
        for raw in ["ftp://example.com", "file:///etc/passwd", "javascript:alert(1)"] {
            assert!(
                matches!(
                    validator.validate(raw),
                    Err(UnsafeUrlError::UnsupportedScheme(_))
                ),
                "{raw}"
            );
        }
    }

    #[test]
    fn test_rejects_internal_ipv4() {
        let validator = UrlValidator::default();
        for raw in [
            "http://10.0.0.1",
            "http://172.16.5.4",
            "http://172.31.255.255",
            "http://192.168.1.1:8080/admin",
            "http://127.0.0.1",
        ] {
            assert_eq!(
                validator.validate(raw),
                Err(UnsafeUrlError::PrivateNetwork),
                "{raw}"
            );
        }
    }

    #[test]
    fn test_rejects_localhost_forms() {
        let validator = UrlValidator::default();
        for raw in [
            "http://localhost:3000",
            "http://LOCALHOST/",
            "http://0.0.0.0",
            "http://[::1]/",
            "http://[::]/",
            "http://[::ffff:127.0.0.1]/",
            "http://app.localhost",
        ] {
            assert_eq!(
                validator.validate(raw),
                Err(UnsafeUrlError::Localhost),
                "{raw}"
            );
        }
    }

    #[test]
    fn test_rejects_blacklisted_domains_and_subdomains() {
        let validator = UrlValidator::default();
        assert!(matches!(
            validator.validate("https://malicious-site.com"),
            Err(UnsafeUrlError::Blacklisted(_))
        ));
        assert!(matches!(
            validator.validate("https://cdn.scam.test/x.png"),
            Err(UnsafeUrlError::Blacklisted(_))
        ));
        assert!(validator.is_safe("https://notscam.test"));

        let custom = UrlValidator::new(["Example.ORG."]);
        assert!(!custom.is_safe("https://www.example.org"));
        assert!(custom.is_safe("https://malicious-site.com"));
    }
}
