//! Shared, connection-pooled HTTP transport for geopipe extract handlers.
//!
//! A single [`HttpTransport`] is constructed once per run and shared (via
//! `Arc`) across every worker; `reqwest::blocking::Client` clones its inner
//! connection pool handle cheaply, and a per-host [`Mutex`]-guarded
//! semaphore gates concurrent requests to any one host across the whole
//! process, regardless of which handler issues them.
//!
//! This crate does not retry; retry is layered above by `geopipe-retry`.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use geopipe_types::CancellationToken;

const CHUNK_SIZE: usize = 64 * 1024;

/// Structured transport failure. Retriability is decided by the caller
/// (the retry policy), not by this crate.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("failed to resolve/connect to host: {0}")]
    Connect(String),
    #[error("TLS handshake failed: {0}")]
    Tls(String),
    #[error("request timed out: {0}")]
    Timeout(String),
    #[error("non-2xx response: {status}")]
    Status {
        status: u16,
        retry_after: Option<Duration>,
    },
    #[error("response body truncated: {0}")]
    TruncatedBody(String),
    #[error("cancelled")]
    Cancelled,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// Classify a [`reqwest::Error`] into a [`TransportError`].
    fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            TransportError::Timeout(err.to_string())
        } else if err.is_connect() {
            TransportError::Connect(err.to_string())
        } else if err.to_string().to_lowercase().contains("tls")
            || err.to_string().to_lowercase().contains("certificate")
        {
            TransportError::Tls(err.to_string())
        } else {
            TransportError::Connect(err.to_string())
        }
    }
}

/// Per-host slot tracking in-flight request count, guarded by a
/// `Mutex<u32>` paired with a `Condvar` for blocking acquisition.
struct HostSlot {
    state: Mutex<u32>,
    cap: u32,
    cvar: Condvar,
}

impl HostSlot {
    fn new(cap: u32) -> Self {
        Self {
            state: Mutex::new(0),
            cap,
            cvar: Condvar::new(),
        }
    }

    fn acquire(&self) {
        let mut in_flight = self.state.lock().unwrap();
        while *in_flight >= self.cap {
            in_flight = self.cvar.wait(in_flight).unwrap();
        }
        *in_flight += 1;
    }

    fn release(&self) {
        let mut in_flight = self.state.lock().unwrap();
        *in_flight = in_flight.saturating_sub(1);
        self.cvar.notify_one();
    }
}

/// Guard that releases a host's semaphore slot on drop.
struct HostPermit<'a> {
    slot: &'a HostSlot,
}

impl<'a> Drop for HostPermit<'a> {
    fn drop(&mut self) {
        self.slot.release();
    }
}

/// Shared HTTP client plus per-host concurrency caps.
pub struct HttpTransport {
    client: reqwest::blocking::Client,
    per_host_cap: u32,
    hosts: Mutex<HashMap<String, Arc<HostSlot>>>,
}

fn host_of(url: &str) -> String {
    url::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(|h| h.to_string()))
        .unwrap_or_else(|| url.to_string())
}

impl HttpTransport {
    pub fn new(timeout: Duration, per_host_cap: u32, user_agent: &str) -> Self {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .user_agent(user_agent.to_string())
            .build()
            .unwrap_or_else(|_| reqwest::blocking::Client::new());

        Self {
            client,
            per_host_cap: per_host_cap.max(1),
            hosts: Mutex::new(HashMap::new()),
        }
    }

    fn slot_for(&self, host: &str) -> Arc<HostSlot> {
        let mut hosts = self.hosts.lock().unwrap();
        hosts
            .entry(host.to_string())
            .or_insert_with(|| Arc::new(HostSlot::new(self.per_host_cap)))
            .clone()
    }

    /// Issue a GET and return the status code, headers, and response.
    /// Params are appended as query pairs. Acquires the per-host slot for
    /// the duration of the call.
    pub fn get(
        &self,
        url: &str,
        params: &[(&str, &str)],
    ) -> Result<reqwest::blocking::Response, TransportError> {
        let host = host_of(url);
        let slot = self.slot_for(&host);
        slot.acquire();
        let _permit = HostPermit { slot: &slot };

        let response = self
            .client
            .get(url)
            .query(params)
            .send()
            .map_err(TransportError::from_reqwest)?;

        classify_status(&response)?;
        Ok(response)
    }

    /// Download `url` to a file under `dest_dir`, checking `cancel` between
    /// chunks. Writes to a `.part` sibling and atomically renames to the
    /// final path on completion; on cancellation the `.part` file is left
    /// in place for the next run to reclaim.
    pub fn download_to_file(
        &self,
        url: &str,
        params: &[(&str, &str)],
        dest_dir: &Path,
        declared_ext: &str,
        cancel: &CancellationToken,
    ) -> Result<PathBuf, TransportError> {
        let host = host_of(url);
        let slot = self.slot_for(&host);
        slot.acquire();
        let _permit = HostPermit { slot: &slot };

        let mut response = self
            .client
            .get(url)
            .query(params)
            .send()
            .map_err(TransportError::from_reqwest)?;
        classify_status(&response)?;

        let filename = infer_filename(url, &response, declared_ext);
        fs::create_dir_all(dest_dir)?;
        let final_path = dest_dir.join(&filename);
        let part_path = dest_dir.join(format!("{filename}.part"));

        let mut file = File::create(&part_path)?;
        let mut buf = vec![0u8; CHUNK_SIZE];
        loop {
            if cancel.is_cancelled() {
                return Err(TransportError::Cancelled);
            }
            let n = response
                .read(&mut buf)
                .map_err(|e| TransportError::TruncatedBody(e.to_string()))?;
            if n == 0 {
                break;
            }
            file.write_all(&buf[..n])?;
        }
        file.flush()?;
        drop(file);

        fs::rename(&part_path, &final_path)?;
        Ok(final_path)
    }
}

fn classify_status(response: &reqwest::blocking::Response) -> Result<(), TransportError> {
    let status = response.status();
    if status.is_success() {
        return Ok(());
    }
    let retry_after = response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse::<u64>().ok())
        .map(Duration::from_secs);

    Err(TransportError::Status {
        status: status.as_u16(),
        retry_after,
    })
}

/// Infer the destination filename: `Content-Disposition` first, URL path
/// second, declared format third, `.data` as last resort.
fn infer_filename(url: &str, response: &reqwest::blocking::Response, declared_ext: &str) -> String {
    if let Some(name) = response
        .headers()
        .get(reqwest::header::CONTENT_DISPOSITION)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_content_disposition_filename)
    {
        return name;
    }

    if let Some(name) = url::Url::parse(url)
        .ok()
        .and_then(|u| u.path_segments().and_then(|mut s| s.next_back().map(str::to_string)))
        .filter(|s| !s.is_empty() && s.contains('.'))
    {
        return name;
    }

    if declared_ext.is_empty() {
        "download.data".to_string()
    } else {
        format!("download.{}", declared_ext.trim_start_matches('.'))
    }
}

fn parse_content_disposition_filename(header: &str) -> Option<String> {
    header.split(';').find_map(|part| {
        let part = part.trim();
        part.strip_prefix("filename=")
            .map(|v| v.trim_matches('"').to_string())
    })
}
