use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use reqwest::{header, Client};
use tracing::debug;

use crate::collectors::HttpProber;
use crate::error::Result;
use crate::rate_limit::RateLimiter;
use crate::types::HttpInfo;

/// How much of a device page is kept for title/model scraping.
const MAX_BODY: usize = 64 * 1024;

/// A fetched device page.
#[derive(Debug, Clone, Default)]
pub struct HttpPage {
    pub status: u16,
    pub server: Option<String>,
    pub last_modified: Option<String>,
    pub body: String,
}

impl HttpPage {
    pub fn title(&self) -> Option<String> {
        extract_title(&self.body)
    }

    pub fn info(&self) -> HttpInfo {
        HttpInfo {
            server: self.server.clone(),
            title: self.title(),
            vendor: None,
        }
    }
}

fn title_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?is)<title[^>]*>([^<]+)</title>").expect("title regex"))
}

/// Trimmed contents of the first `<title>` element.
pub fn extract_title(html: &str) -> Option<String> {
    title_re()
        .captures(html)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
        .filter(|t| !t.is_empty())
}

/// HTTP client for device web interfaces. Self-signed certificates are accepted and every
/// request goes through the per-IP HTTP rate limiter.
#[derive(Clone)]
pub struct HttpProbe {
    client: Client,
    limiter: Arc<RateLimiter>,
}

impl HttpProbe {
    pub fn new(timeout: Duration, limiter: Arc<RateLimiter>) -> Result<Self> {
        let client = Client::builder()
            .danger_accept_invalid_certs(true)
            .timeout(timeout)
            .user_agent("HomeGuard/1.0")
            .redirect(reqwest::redirect::Policy::limited(3))
            .build()?;
        Ok(Self { client, limiter })
    }

    /// GET `url`, rate limited by `host`.
    pub async fn fetch(&self, host: &str, url: &str) -> Result<HttpPage> {
        self.limiter.acquire(host).await;
        let resp = self.client.get(url).send().await?;
        let status = resp.status().as_u16();
        let header_str = |name: header::HeaderName| {
            resp.headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        let server = header_str(header::SERVER);
        let last_modified = header_str(header::LAST_MODIFIED);
        let bytes = resp.bytes().await?;
        let body = String::from_utf8_lossy(&bytes[..bytes.len().min(MAX_BODY)]).into_owned();
        Ok(HttpPage {
            status,
            server,
            last_modified,
            body,
        })
    }

    /// Fetch `scheme://ip:port/` with the scheme implied by the port.
    pub async fn fetch_root(&self, ip: &str, port: u16) -> Result<HttpPage> {
        let scheme = if matches!(port, 443 | 8443 | 5001) { "https" } else { "http" };
        self.fetch(ip, &format!("{scheme}://{ip}:{port}/")).await
    }
}

#[async_trait]
impl HttpProber for HttpProbe {
    async fn probe_http(&self, ip: &str, port: u16) -> Option<HttpInfo> {
        match self.fetch_root(ip, port).await {
            Ok(page) => {
                let info = page.info();
                (!info.is_empty()).then_some(info)
            }
            Err(e) => {
                debug!(ip, port, error = %e, "http probe failed");
                None
            }
        }
    }
}
