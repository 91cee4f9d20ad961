use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::{self, Instant};
use tracing::{debug, trace};

use crate::collectors::{PortObservation, PortScanner};
use crate::error::{Error, Result};
use crate::rate_limit::RateLimiter;
use crate::types::truncate_chars;

/// Ports that answer an HTTP HEAD with a `Server:` line worth keeping as banner text.
const HTTP_BANNER_PORTS: &[u16] = &[80, 8080, 8443];

/// TCP connect scanner with a short banner grab on every open port.
///
/// - Limits concurrent socket attempts per device using a `Semaphore`.
/// - Uses `tokio::time::timeout` to bound connect time per socket.
/// - Every connect attempt first takes a slot from the per-IP rate limiter.
#[derive(Debug, Clone)]
pub struct TcpPortScanner {
    concurrency: usize,
    banner_timeout: Duration,
    limiter: Arc<RateLimiter>,
}

impl TcpPortScanner {
    pub fn new(concurrency: usize, banner_timeout: Duration, limiter: Arc<RateLimiter>) -> Self {
        Self {
            concurrency: concurrency.clamp(1, 5_000),
            banner_timeout,
            limiter,
        }
    }
}

#[async_trait]
impl PortScanner for TcpPortScanner {
    async fn scan_ports(
        &self,
        ip: IpAddr,
        ports: &[u16],
        timeout: Duration,
    ) -> Result<Vec<PortObservation>> {
        let sem = Arc::new(Semaphore::new(self.concurrency));
        let mut set = JoinSet::new();
        let key = ip.to_string();
        let started = Instant::now();

        for &port in ports {
            let permit = sem
                .clone()
                .acquire_owned()
                .await
                .map_err(|e| Error::Collector(format!("port scan semaphore closed: {e}")))?;
            self.limiter.acquire(&key).await;
            let banner_timeout = self.banner_timeout;

            set.spawn(async move {
                let _permit = permit;
                let addr = SocketAddr::new(ip, port);
                match time::timeout(timeout, TcpStream::connect(addr)).await {
                    Ok(Ok(mut stream)) => {
                        let banner = grab_banner(&mut stream, port, banner_timeout).await;
                        trace!(%ip, port, banner = banner.as_deref().unwrap_or(""), "open");
                        PortObservation { port, is_open: true, banner }
                    }
                    _ => PortObservation { port, is_open: false, banner: None },
                }
            });
        }

        let mut out = Vec::with_capacity(ports.len());
        while let Some(res) = set.join_next().await {
            match res {
                Ok(obs) => out.push(obs),
                Err(e) => debug!(%ip, error = %e, "port probe task failed"),
            }
        }
        out.sort_by_key(|o| o.port);

        debug!(
            %ip,
            scanned = ports.len(),
            open = out.iter().filter(|o| o.is_open).count(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "port scan finished"
        );
        Ok(out)
    }
}

/// Nudge the service and read up to 256 bytes. SSH talks first, HTTP gets a HEAD.
async fn grab_banner(stream: &mut TcpStream, port: u16, wait: Duration) -> Option<String> {
    let nudge: &[u8] = if HTTP_BANNER_PORTS.contains(&port) {
        b"HEAD / HTTP/1.0\r\n\r\n"
    } else if port == 22 {
        b""
    } else {
        b"\r\n"
    };
    if !nudge.is_empty() && stream.write_all(nudge).await.is_err() {
        return None;
    }
    let mut buf = [0u8; 256];
    match time::timeout(wait, stream.read(&mut buf)).await {
        Ok(Ok(n)) if n > 0 => clean_banner(&buf[..n]),
        _ => None,
    }
}

/// Lossy UTF-8, trimmed, at most 100 chars.
pub fn clean_banner(raw: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(raw);
    let trimmed = text.trim().replace('\u{FFFD}', "");
    if trimmed.is_empty() {
        None
    } else {
        Some(truncate_chars(&trimmed, 100))
    }
}
