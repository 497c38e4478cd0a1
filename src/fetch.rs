//! Source fetcher.
//!
//! Ensures each versioned upstream download exists at its cache path. A
//! cached file is trusted as-is unless a SHA-256 is pinned in the
//! configuration. Downloads stream into a temp file beside the destination
//! and are renamed into place only once complete, so the cache path never
//! holds a truncated file.
//!
//! The transport is read on a helper thread. The fetcher waits on it in
//! short slices and checks the cancel flag between them, so an interrupt
//! abandons a stalled transfer instead of waiting for the server.

use anyhow::{bail, Context, Result};
use log::{debug, info, warn};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{BufReader, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::Duration;

use crate::config::SourceConfig;
use crate::interrupt::{is_cancelled, CancelFlag};
use crate::layout::BuildLayout;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const TRANSFER_TIMEOUT: Duration = Duration::from_secs(30 * 60);
const CHUNK_SIZE: usize = 64 * 1024;
const CHUNKS_IN_FLIGHT: usize = 4;
const CANCEL_POLL: Duration = Duration::from_millis(100);
const USER_AGENT: &str = concat!("dockerd-msi/", env!("CARGO_PKG_VERSION"));

/// Where a download comes from and where it is cached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveRef {
    pub url: String,
    pub dest: PathBuf,
    pub sha256: Option<String>,
}

impl ArchiveRef {
    pub fn for_source(source: &SourceConfig, layout: &BuildLayout) -> Self {
        Self {
            url: source.url(),
            dest: layout.cache_path(source),
            sha256: source.sha256.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOutcome {
    AlreadyPresent,
    Downloaded,
}

/// Source of remote bytes.
pub trait Transport {
    /// Start a GET for `url`. Non-success statuses must be returned as errors.
    fn open(&self, url: &str) -> Result<Box<dyn Read + Send>>;
}

/// HTTP(S) transport over a blocking `reqwest` client.
pub struct HttpTransport {
    client: reqwest::blocking::Client,
}

impl HttpTransport {
    pub fn new() -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(TRANSFER_TIMEOUT)
            .user_agent(USER_AGENT)
            .build()
            .context("building HTTP client")?;
        Ok(Self::with_client(client))
    }

    pub fn with_client(client: reqwest::blocking::Client) -> Self {
        Self { client }
    }
}

impl Transport for HttpTransport {
    fn open(&self, url: &str) -> Result<Box<dyn Read + Send>> {
        let response = self
            .client
            .get(url)
            .send()
            .with_context(|| format!("requesting '{}'", url))?;
        let status = response.status();
        if !status.is_success() {
            bail!("download of '{}' failed with HTTP status {}", url, status);
        }
        Ok(Box::new(response))
    }
}

/// Fetch stage: one transport, one cancellation flag.
pub struct Fetcher<T> {
    transport: T,
    cancel: CancelFlag,
}

impl<T: Transport> Fetcher<T> {
    pub fn new(transport: T, cancel: CancelFlag) -> Self {
        Self { transport, cancel }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn cancel_flag(&self) -> &CancelFlag {
        &self.cancel
    }

    /// Make sure `archive.dest` holds the archive. At most one download
    /// attempt is made; there are no retries.
    pub fn ensure(&self, archive: &ArchiveRef) -> Result<FetchOutcome> {
        if archive.dest.is_file() {
            match archive.sha256.as_deref() {
                None => {
                    info!("[fetch] reusing cached archive {}", archive.dest.display());
                    return Ok(FetchOutcome::AlreadyPresent);
                }
                Some(expected) => {
                    let actual = sha256_file(&archive.dest)?;
                    if actual == expected {
                        info!(
                            "[fetch] reusing cached archive {} (sha256 verified)",
                            archive.dest.display()
                        );
                        return Ok(FetchOutcome::AlreadyPresent);
                    }
                    warn!(
                        "[fetch] cached archive {} has sha256 {}, expected {}; downloading again",
                        archive.dest.display(),
                        actual,
                        expected
                    );
                }
            }
        }

        let parent = archive.dest.parent().ok_or_else(|| {
            anyhow::anyhow!("archive path '{}' has no parent", archive.dest.display())
        })?;
        fs::create_dir_all(parent)
            .with_context(|| format!("creating downloads directory '{}'", parent.display()))?;

        // Same directory as the destination so the final rename stays on one filesystem.
        let mut partial = tempfile::Builder::new()
            .prefix(".download-")
            .suffix(".part")
            .tempfile_in(parent)
            .with_context(|| format!("creating temp download file in '{}'", parent.display()))?;

        info!("[fetch] downloading {}", archive.url);
        let (digest, size) = self.stream_into(&archive.url, partial.as_file_mut())?;

        if let Some(expected) = archive.sha256.as_deref() {
            if digest != expected {
                bail!(
                    "checksum mismatch for '{}': expected {} but got {}",
                    archive.url,
                    expected,
                    digest
                );
            }
        }

        partial
            .as_file()
            .sync_all()
            .with_context(|| format!("flushing download for '{}'", archive.dest.display()))?;
        partial.persist(&archive.dest).with_context(|| {
            format!(
                "moving completed download into place at '{}'",
                archive.dest.display()
            )
        })?;

        info!(
            "[fetch] stored {} bytes at {} (sha256 {})",
            size,
            archive.dest.display(),
            digest
        );
        Ok(FetchOutcome::Downloaded)
    }

    fn stream_into(&self, url: &str, out: &mut File) -> Result<(String, u64)> {
        if is_cancelled(&self.cancel) {
            bail!("download of '{}' interrupted before it started", url);
        }
        let chunks = spawn_reader(self.transport.open(url)?)?;
        let mut hasher = Sha256::new();
        let mut size = 0u64;
        loop {
            match chunks.recv_timeout(CANCEL_POLL) {
                Ok(Ok(chunk)) => {
                    hasher.update(&chunk);
                    out.write_all(&chunk)
                        .with_context(|| format!("writing download of '{}'", url))?;
                    size += chunk.len() as u64;
                }
                Ok(Err(err)) => {
                    return Err(err)
                        .with_context(|| format!("reading '{}' after {} bytes", url, size))
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
            if is_cancelled(&self.cancel) {
                // The reader thread is left blocked on the socket and exits
                // with its next read.
                bail!("download of '{}' interrupted after {} bytes", url, size);
            }
        }
        debug!("[fetch] transfer of {} finished at {} bytes", url, size);
        Ok((format!("{:x}", hasher.finalize()), size))
    }
}

type Chunks = Receiver<std::io::Result<Vec<u8>>>;

/// Pump `reader` into a bounded channel from a helper thread. The channel
/// disconnects at end of stream; a read error is sent as the last message.
fn spawn_reader(mut reader: Box<dyn Read + Send>) -> Result<Chunks> {
    let (tx, rx) = mpsc::sync_channel(CHUNKS_IN_FLIGHT);
    thread::Builder::new()
        .name("fetch-reader".to_string())
        .spawn(move || {
            let mut buf = vec![0u8; CHUNK_SIZE];
            loop {
                let message = match reader.read(&mut buf) {
                    Ok(0) => return,
                    Ok(n) => Ok(buf[..n].to_vec()),
                    Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                    Err(err) => Err(err),
                };
                let failed = message.is_err();
                if tx.send(message).is_err() || failed {
                    return;
                }
            }
        })
        .context("spawning download reader thread")?;
    Ok(rx)
}

pub(crate) fn sha256_file(path: &Path) -> Result<String> {
    let f = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let mut r = BufReader::new(f);
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = r
            .read(&mut buf)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}
