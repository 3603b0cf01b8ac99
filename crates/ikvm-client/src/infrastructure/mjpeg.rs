//! Reader for the mjpg-streamer `multipart/x-mixed-replace` video stream.
//!
//! Each part on the wire looks like:
//!
//! ```text
//! --boundarydonotcross\r\n
//! Content-Type: image/jpeg\r\n
//! Content-Length: 43210\r\n
//! X-Timestamp: 1234.5678\r\n
//! \r\n
//! <43210 bytes of JPEG>
//! ```
//!
//! [`MjpegParser`] works over any [`AsyncRead`], which keeps it testable with
//! in-memory streams; [`MjpgClient`] feeds it an HTTP response body.

use std::io;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::TryStreamExt;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::time;
use tokio_util::io::StreamReader;
use tracing::{debug, info, trace};

use crate::application::session::FrameSource;
use crate::error::{Categorize, ErrorCategory};

pub const BOUNDARY: &[u8] = b"--boundarydonotcross";
const CONTENT_TYPE: &[u8] = b"Content-Type:";
const CONTENT_LENGTH: &[u8] = b"Content-Length:";
const HEADER_END: &[u8] = b"\r\n\r\n";
const JPEG_CONTENT_TYPE: &str = "image/jpeg";

/// Most bytes a single scan may consume without finding what it looks for.
pub const MAX_SCAN_BYTES: usize = 1024 * 1024;

/// Largest frame body accepted from `Content-Length`.
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// Default bound on every individual read from the stream.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_millis(400);

const SOI: [u8; 2] = [0xFF, 0xD8];
const EOI: [u8; 2] = [0xFF, 0xD9];

/// Which part of the frame header a scan was looking for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanStage {
    Boundary,
    ContentType,
    ContentLength,
    HeaderEnd,
}

impl std::fmt::Display for ScanStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            ScanStage::Boundary => "boundary",
            ScanStage::ContentType => "Content-Type",
            ScanStage::ContentLength => "Content-Length",
            ScanStage::HeaderEnd => "end of headers",
        })
    }
}

#[derive(Debug, Error)]
pub enum MjpegError {
    #[error("stream not opened")]
    NotOpened,

    #[error("cannot open {url}: {reason}")]
    Open { url: String, reason: String },

    /// The stream ended before a whole frame arrived.
    #[error("frame lost: stream ended")]
    FrameLost,

    #[error("unexpected content type {0:?}")]
    WrongContentType(String),

    #[error("invalid content length {0:?}")]
    InvalidContentLength(String),

    #[error("frame is not a JPEG image")]
    NotJpeg,

    #[error("no {stage} within {MAX_SCAN_BYTES} bytes")]
    ScanTimeout { stage: ScanStage },

    #[error("stream read timed out after {0:?}")]
    ReadTimeout(Duration),

    #[error("stream read failed: {0}")]
    Io(#[from] io::Error),
}

impl MjpegError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            MjpegError::NotOpened => ErrorCategory::Usage,
            MjpegError::Open { .. } | MjpegError::Io(_) => ErrorCategory::Transport,
            MjpegError::FrameLost => ErrorCategory::Lost,
            MjpegError::WrongContentType(_) | MjpegError::InvalidContentLength(_) => {
                ErrorCategory::Protocol
            }
            MjpegError::NotJpeg => ErrorCategory::Format,
            MjpegError::ScanTimeout { .. } | MjpegError::ReadTimeout(_) => ErrorCategory::Timing,
        }
    }
}

// ── Parser ────────────────────────────────────────────────────────────────────

/// Pulls JPEG frames out of a multipart byte stream.
pub struct MjpegParser<R> {
    reader: BufReader<R>,
    read_timeout: Duration,
    scan_limit: usize,
}

impl<R: AsyncRead + Unpin> MjpegParser<R> {
    pub fn new(reader: R) -> Self {
        Self::with_timeout(reader, DEFAULT_READ_TIMEOUT)
    }

    pub fn with_timeout(reader: R, read_timeout: Duration) -> Self {
        Self {
            reader: BufReader::new(reader),
            read_timeout,
            scan_limit: MAX_SCAN_BYTES,
        }
    }

    /// Reads the next complete frame and returns its JPEG bytes.
    ///
    /// # Errors
    ///
    /// [`MjpegError::FrameLost`] when the stream ends mid-frame or the body is
    /// empty, [`MjpegError::WrongContentType`] /
    /// [`MjpegError::InvalidContentLength`] for bad headers,
    /// [`MjpegError::NotJpeg`] when the body lacks the JPEG markers, and the
    /// timing errors when a scan or read runs out of budget.
    pub async fn next_frame(&mut self) -> Result<Vec<u8>, MjpegError> {
        if !self.scan(BOUNDARY, b"", ScanStage::Boundary).await? {
            return Err(MjpegError::FrameLost);
        }

        if !self.scan(CONTENT_TYPE, b"", ScanStage::ContentType).await? {
            return Err(MjpegError::FrameLost);
        }
        let content_type = self
            .header_value(ScanStage::ContentType)
            .await?
            .ok_or(MjpegError::FrameLost)?;
        if content_type != JPEG_CONTENT_TYPE {
            return Err(MjpegError::WrongContentType(content_type));
        }

        if !self.scan(CONTENT_LENGTH, b"", ScanStage::ContentLength).await? {
            return Err(MjpegError::FrameLost);
        }
        let raw_length = self
            .header_value(ScanStage::ContentLength)
            .await?
            .ok_or(MjpegError::FrameLost)?;
        let length = match raw_length.parse::<usize>() {
            Ok(n) if n <= MAX_FRAME_BYTES => n,
            _ => return Err(MjpegError::InvalidContentLength(raw_length)),
        };

        // The Content-Length line's own CRLF was consumed with its value, so
        // the blank line may follow immediately.
        if !self.scan(HEADER_END, b"\r\n", ScanStage::HeaderEnd).await? {
            return Err(MjpegError::FrameLost);
        }

        if length == 0 {
            return Err(MjpegError::FrameLost);
        }
        let body = self.body(length).await?;
        if !body.starts_with(&SOI) || !body.ends_with(&EOI) {
            return Err(MjpegError::NotJpeg);
        }
        trace!(bytes = body.len(), "frame");
        Ok(body)
    }

    async fn fill(&mut self) -> Result<&[u8], MjpegError> {
        match time::timeout(self.read_timeout, self.reader.fill_buf()).await {
            Ok(Ok(chunk)) => Ok(chunk),
            Ok(Err(e)) => Err(MjpegError::Io(e)),
            Err(_) => Err(MjpegError::ReadTimeout(self.read_timeout)),
        }
    }

    /// Consumes bytes up to and including `pattern`.
    ///
    /// `primed` counts as already-seen input, so a match may straddle it.
    /// Returns `false` when the stream ends first.
    async fn scan(&mut self, pattern: &[u8], primed: &[u8], stage: ScanStage) -> Result<bool, MjpegError> {
        let mut window: Vec<u8> = primed.to_vec();
        let mut scanned = 0usize;
        loop {
            let chunk = self.fill().await?;
            if chunk.is_empty() {
                return Ok(false);
            }
            let mut used = 0;
            let mut found = false;
            for &b in chunk {
                used += 1;
                window.push(b);
                if window.len() > pattern.len() {
                    window.remove(0);
                }
                if window == pattern {
                    found = true;
                    break;
                }
            }
            self.reader.consume(used);
            if found {
                return Ok(true);
            }
            scanned += used;
            if scanned >= self.scan_limit {
                return Err(MjpegError::ScanTimeout { stage });
            }
        }
    }

    /// Reads the rest of the current header line, trimmed.
    async fn header_value(&mut self, stage: ScanStage) -> Result<Option<String>, MjpegError> {
        let mut line = Vec::new();
        loop {
            let chunk = self.fill().await?;
            if chunk.is_empty() {
                return Ok(None);
            }
            if let Some(pos) = chunk.iter().position(|&b| b == b'\n') {
                line.extend_from_slice(&chunk[..pos]);
                self.reader.consume(pos + 1);
                break;
            }
            let n = chunk.len();
            line.extend_from_slice(chunk);
            self.reader.consume(n);
            if line.len() >= self.scan_limit {
                return Err(MjpegError::ScanTimeout { stage });
            }
        }
        Ok(Some(String::from_utf8_lossy(&line).trim().to_owned()))
    }

    async fn body(&mut self, length: usize) -> Result<Vec<u8>, MjpegError> {
        let mut body = Vec::with_capacity(length);
        while body.len() < length {
            let chunk = self.fill().await?;
            if chunk.is_empty() {
                return Err(MjpegError::FrameLost);
            }
            let n = chunk.len().min(length - body.len());
            body.extend_from_slice(&chunk[..n]);
            self.reader.consume(n);
        }
        Ok(body)
    }
}

// ── HTTP client ───────────────────────────────────────────────────────────────

type BodyReader = Box<dyn AsyncRead + Send + Unpin>;

/// Opens an mjpg-streamer URL and hands out its frames.
pub struct MjpgClient {
    http: reqwest::Client,
    read_timeout: Duration,
    stream: Option<MjpegParser<BodyReader>>,
}

impl Default for MjpgClient {
    fn default() -> Self {
        Self::new()
    }
}

impl MjpgClient {
    pub fn new() -> Self {
        Self::with_read_timeout(DEFAULT_READ_TIMEOUT)
    }

    pub fn with_read_timeout(read_timeout: Duration) -> Self {
        Self {
            http: reqwest::Client::new(),
            read_timeout,
            stream: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    /// Connects to `url`, replacing any stream already open.
    ///
    /// `timeout` bounds the connect and the response headers only; the body
    /// is read frame by frame under the read timeout.
    ///
    /// # Errors
    ///
    /// [`MjpegError::Open`] for connection failures, timeouts and non-success
    /// HTTP statuses.
    pub async fn open(&mut self, url: &str, timeout: Duration) -> Result<(), MjpegError> {
        self.close();

        let open_error = |reason: String| MjpegError::Open {
            url: url.to_owned(),
            reason,
        };
        let response = time::timeout(timeout, self.http.get(url).send())
            .await
            .map_err(|_| open_error(format!("timed out after {timeout:?}")))?
            .map_err(|e| open_error(e.to_string()))?
            .error_for_status()
            .map_err(|e| open_error(e.to_string()))?;

        let body = response.bytes_stream().map_err(io::Error::other);
        let reader: BodyReader = Box::new(StreamReader::new(Box::pin(body)));
        self.stream = Some(MjpegParser::with_timeout(reader, self.read_timeout));
        info!(url, "video stream opened");
        Ok(())
    }

    pub fn close(&mut self) {
        if self.stream.take().is_some() {
            debug!("video stream closed");
        }
    }

    /// Reads the next frame from the open stream.
    ///
    /// # Errors
    ///
    /// [`MjpegError::NotOpened`] without an open stream; otherwise whatever
    /// [`MjpegParser::next_frame`] reports.
    pub async fn next_frame(&mut self) -> Result<Vec<u8>, MjpegError> {
        let stream = self.stream.as_mut().ok_or(MjpegError::NotOpened)?;
        stream.next_frame().await
    }
}

impl Categorize for MjpegError {
    fn category(&self) -> ErrorCategory {
        MjpegError::category(self)
    }
}

#[async_trait]
impl FrameSource for MjpgClient {
    type Error = MjpegError;

    async fn open(&mut self, url: &str, timeout: Duration) -> Result<(), MjpegError> {
        MjpgClient::open(self, url, timeout).await
    }

    async fn next_frame(&mut self) -> Result<Vec<u8>, MjpegError> {
        MjpgClient::next_frame(self).await
    }

    fn close(&mut self) {
        MjpgClient::close(self);
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
