use std::future::Future;
use std::time::Duration;

use base64::{Engine, engine::general_purpose::STANDARD};
use sha2::{Digest, Sha256, Sha384, Sha512};

use crate::config::{MonitoringConfig, TrustConfig};

/// Supported SRI digest algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DigestAlgorithm {
    Sha256,
    #[default]
    Sha384,
    Sha512,
}

impl DigestAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            DigestAlgorithm::Sha256 => "sha256",
            DigestAlgorithm::Sha384 => "sha384",
            DigestAlgorithm::Sha512 => "sha512",
        }
    }

    /// Parse an algorithm name, falling back to the SRI default.
    pub fn parse(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "sha256" => DigestAlgorithm::Sha256,
            "sha512" => DigestAlgorithm::Sha512,
            _ => DigestAlgorithm::Sha384,
        }
    }
}

/// Compute an SRI digest string (`"<algo>-<base64>"`) over a byte payload.
pub fn compute_digest(bytes: &[u8], algorithm: DigestAlgorithm) -> String {
    let encoded = match algorithm {
        DigestAlgorithm::Sha256 => STANDARD.encode(Sha256::digest(bytes)),
        DigestAlgorithm::Sha384 => STANDARD.encode(Sha384::digest(bytes)),
        DigestAlgorithm::Sha512 => STANDARD.encode(Sha512::digest(bytes)),
    };
    format!("{}-{}", algorithm.as_str(), encoded)
}

/// SRI digest comparison is case-insensitive throughout.
pub fn digests_match(a: &str, b: &str) -> bool {
    a.eq_ignore_ascii_case(b)
}

/// Source of freshly computed digests for remote script content. Integrity is
/// an optional enhancement, so fetch failures yield `None`, never an error.
pub trait DigestFetcher: Send + Sync {
    fn fetch_digest(
        &self,
        url: &str,
        algorithm: DigestAlgorithm,
    ) -> impl Future<Output = Option<String>> + Send;
}

/// HTTP-backed fetcher with a hard per-request timeout.
pub struct SriClient {
    client: reqwest::Client,
    timeout: Duration,
}

impl SriClient {
    pub fn new(timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            timeout,
        }
    }
}

impl DigestFetcher for SriClient {
    async fn fetch_digest(&self, url: &str, algorithm: DigestAlgorithm) -> Option<String> {
        let response = match self.client.get(url).timeout(self.timeout).send().await {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!("Digest fetch failed for {url}: {e}");
                return None;
            }
        };
        if !response.status().is_success() {
            tracing::warn!("Digest fetch for {url} returned {}", response.status());
            return None;
        }
        match response.bytes().await {
            Ok(bytes) => Some(compute_digest(&bytes, algorithm)),
            Err(e) => {
                tracing::warn!("Digest fetch body read failed for {url}: {e}");
                None
            }
        }
    }
}

fn contains_ignore_case(haystack: &str, needle: &str) -> bool {
    !needle.is_empty()
        && haystack
            .to_ascii_lowercase()
            .contains(&needle.to_ascii_lowercase())
}

/// Whether a script URL counts as local to the store. Rules are evaluated in
/// precedence order: relative path, same origin, localhost/loopback, the
/// monitoring agent's own script, then bundled-library patterns.
pub fn is_local_script(script_url: &str, store_url: &str, monitoring: &MonitoringConfig) -> bool {
    if script_url.starts_with('/') || script_url.starts_with("~/") {
        return true;
    }

    let origin = store_url.trim_end_matches('/');
    if !origin.is_empty()
        && script_url
            .to_ascii_lowercase()
            .starts_with(&origin.to_ascii_lowercase())
    {
        return true;
    }

    if contains_ignore_case(script_url, "localhost")
        || script_url.contains("127.0.0.1")
        || script_url.contains("::1")
    {
        return true;
    }

    if contains_ignore_case(script_url, &monitoring.agent_script_marker) {
        return true;
    }

    monitoring
        .local_library_patterns
        .iter()
        .any(|pattern| contains_ignore_case(script_url, pattern))
}

/// Whether the URL's host is on the operator-configured trusted allowlist.
pub fn is_trusted_domain(script_url: &str, trust: &TrustConfig) -> bool {
    trust
        .trusted_domains
        .iter()
        .any(|domain| contains_ignore_case(script_url, domain))
}

/// Whether the URL looks payment-provider-related.
pub fn is_payment_provider(script_url: &str, trust: &TrustConfig) -> bool {
    trust
        .payment_providers
        .iter()
        .any(|keyword| contains_ignore_case(script_url, keyword))
}

/// Host component of a URL, or empty for relative/unparseable URLs.
pub fn domain_of(url: &str) -> String {
    reqwest::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_string))
        .unwrap_or_default()
}
