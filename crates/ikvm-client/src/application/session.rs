//! Caller-side session supervision: retrying the steps that can fail for
//! transient reasons.
//!
//! The KVM client never reconnects on its own.  [`SessionSupervisor`] wraps
//! the two halves of a session (control connection and video stream) behind
//! the [`KvmControl`] and [`FrameSource`] traits and retries them according to
//! a [`RetryPolicy`].  Only failures whose [`ErrorCategory`] is transient are
//! retried; a rejection or protocol error is returned straight away.
//!
//! Infrastructure implements the traits for the real clients; tests use
//! hand-written fakes.

use std::error::Error as StdError;
use std::time::Duration;

use async_trait::async_trait;
use ikvm_core::{CaptureChoice, FrameRate, Resolution};
use thiserror::Error;
use tokio::time;
use tracing::{info, warn};

use crate::error::{Categorize, ErrorCategory};

/// Bound on opening the video stream, connect plus response headers.
pub const DEFAULT_STREAM_OPEN_TIMEOUT: Duration = Duration::from_secs(3);

/// How often and how patiently to retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Pause between attempts.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    fn should_retry(&self, attempt: u32, category: ErrorCategory) -> bool {
        attempt < self.max_attempts && category.is_transient()
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("KVM session is not running")]
    NotRunning,

    #[error("{operation} failed after {attempts} attempt(s): {source}")]
    Failed {
        operation: &'static str,
        attempts: u32,
        category: ErrorCategory,
        #[source]
        source: Box<dyn StdError + Send + Sync>,
    },
}

impl SessionError {
    fn failed<E>(operation: &'static str, attempts: u32, err: E) -> Self
    where
        E: Categorize + StdError + Send + Sync + 'static,
    {
        SessionError::Failed {
            operation,
            attempts,
            category: err.category(),
            source: Box::new(err),
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            SessionError::NotRunning => ErrorCategory::Usage,
            SessionError::Failed { category, .. } => *category,
        }
    }
}

/// The control half of a KVM session.
#[async_trait]
pub trait KvmControl: Send {
    type Error: Categorize + StdError + Send + Sync + 'static;

    async fn start(&mut self) -> Result<(), Self::Error>;

    async fn end(&mut self) -> Result<(), Self::Error>;

    fn is_running(&self) -> bool;

    async fn open_serial_device(&mut self, port: Option<&str>) -> Result<String, Self::Error>;

    async fn alt_capture(
        &mut self,
        device: Option<&str>,
        resolution: Option<Resolution>,
        fps: Option<FrameRate>,
    ) -> Result<CaptureChoice, Self::Error>;

    /// Where the server publishes the video stream for this session.
    fn stream_url(&self) -> String;
}

/// The video half of a KVM session.
#[async_trait]
pub trait FrameSource: Send {
    type Error: Categorize + StdError + Send + Sync + 'static;

    async fn open(&mut self, url: &str, timeout: Duration) -> Result<(), Self::Error>;

    async fn next_frame(&mut self) -> Result<Vec<u8>, Self::Error>;

    fn close(&mut self);
}

/// Drives a KVM session and its video stream, retrying transient failures.
pub struct SessionSupervisor<K, F> {
    kvm: K,
    video: F,
    policy: RetryPolicy,
    open_timeout: Duration,
}

impl<K: KvmControl, F: FrameSource> SessionSupervisor<K, F> {
    pub fn new(kvm: K, video: F, policy: RetryPolicy) -> Self {
        Self {
            kvm,
            video,
            policy,
            open_timeout: DEFAULT_STREAM_OPEN_TIMEOUT,
        }
    }

    pub fn with_open_timeout(mut self, timeout: Duration) -> Self {
        self.open_timeout = timeout;
        self
    }

    pub fn kvm(&self) -> &K {
        &self.kvm
    }

    pub fn kvm_mut(&mut self) -> &mut K {
        &mut self.kvm
    }

    pub fn video_mut(&mut self) -> &mut F {
        &mut self.video
    }

    fn ensure_running(&self) -> Result<(), SessionError> {
        if self.kvm.is_running() {
            Ok(())
        } else {
            Err(SessionError::NotRunning)
        }
    }

    /// Starts the KVM session.
    pub async fn establish(&mut self) -> Result<(), SessionError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.kvm.start().await {
                Ok(()) => {
                    info!(attempt, "KVM session established");
                    return Ok(());
                }
                Err(e) if self.policy.should_retry(attempt, e.category()) => {
                    warn!(attempt, "session start failed, retrying: {e}");
                    time::sleep(self.policy.backoff).await;
                }
                Err(e) => return Err(SessionError::failed("session start", attempt, e)),
            }
        }
    }

    /// Re-opens the serial device on a running session.
    pub async fn reopen_serial(&mut self, port: Option<&str>) -> Result<String, SessionError> {
        let mut attempt = 0;
        loop {
            self.ensure_running()?;
            attempt += 1;
            match self.kvm.open_serial_device(port).await {
                Ok(name) => return Ok(name),
                Err(e) if self.policy.should_retry(attempt, e.category()) => {
                    warn!(attempt, "serial open failed, retrying: {e}");
                    time::sleep(self.policy.backoff).await;
                }
                Err(e) => return Err(SessionError::failed("serial open", attempt, e)),
            }
        }
    }

    /// Restarts the video capture on a running session.
    pub async fn reselect_capture(
        &mut self,
        device: Option<&str>,
        resolution: Option<Resolution>,
        fps: Option<FrameRate>,
    ) -> Result<CaptureChoice, SessionError> {
        let mut attempt = 0;
        loop {
            self.ensure_running()?;
            attempt += 1;
            match self.kvm.alt_capture(device, resolution, fps).await {
                Ok(choice) => return Ok(choice),
                Err(e) if self.policy.should_retry(attempt, e.category()) => {
                    warn!(attempt, "capture selection failed, retrying: {e}");
                    time::sleep(self.policy.backoff).await;
                }
                Err(e) => return Err(SessionError::failed("capture selection", attempt, e)),
            }
        }
    }

    /// Opens the video stream the session published.
    pub async fn connect_video(&mut self) -> Result<(), SessionError> {
        let url = self.kvm.stream_url();
        let mut attempt = 0;
        loop {
            self.ensure_running()?;
            attempt += 1;
            match self.video.open(&url, self.open_timeout).await {
                Ok(()) => return Ok(()),
                Err(e) if self.policy.should_retry(attempt, e.category()) => {
                    warn!(attempt, url = %url, "video stream open failed, retrying: {e}");
                    time::sleep(self.policy.backoff).await;
                }
                Err(e) => return Err(SessionError::failed("video stream open", attempt, e)),
            }
        }
    }

    /// Reads the next frame, reconnecting the stream once if it broke.
    pub async fn next_frame(&mut self) -> Result<Vec<u8>, SessionError> {
        match self.video.next_frame().await {
            Ok(frame) => Ok(frame),
            Err(e) if e.category().is_transient() && self.kvm.is_running() => {
                warn!("video stream interrupted, reconnecting: {e}");
                self.connect_video().await?;
                self.video
                    .next_frame()
                    .await
                    .map_err(|e| SessionError::failed("frame read", 2, e))
            }
            Err(e) => Err(SessionError::failed("frame read", 1, e)),
        }
    }

    /// Closes the stream and ends the session.
    pub async fn shutdown(&mut self) -> Result<(), SessionError> {
        self.video.close();
        self.kvm
            .end()
            .await
            .map_err(|e| SessionError::failed("session end", 1, e))
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    #[derive(Debug, Clone, Error)]
    #[error("fake {0} failure")]
    struct FakeError(ErrorCategory);

    impl Categorize for FakeError {
        fn category(&self) -> ErrorCategory {
            self.0
        }
    }

    fn transient() -> FakeError {
        FakeError(ErrorCategory::Transport)
    }

    fn fatal() -> FakeError {
        FakeError(ErrorCategory::Rejected)
    }

    #[derive(Default)]
    struct FakeKvm {
        running: bool,
        starts: VecDeque<Result<(), FakeError>>,
        serial: VecDeque<Result<String, FakeError>>,
        start_calls: u32,
        serial_calls: u32,
        ended: bool,
        /// Session drops after this many serial attempts.
        stop_after_serial: Option<u32>,
    }

    #[async_trait]
    impl KvmControl for FakeKvm {
        type Error = FakeError;

        async fn start(&mut self) -> Result<(), FakeError> {
            self.start_calls += 1;
            let result = self.starts.pop_front().unwrap_or(Ok(()));
            self.running = result.is_ok();
            result
        }

        async fn end(&mut self) -> Result<(), FakeError> {
            self.running = false;
            self.ended = true;
            Ok(())
        }

        fn is_running(&self) -> bool {
            self.running
        }

        async fn open_serial_device(&mut self, port: Option<&str>) -> Result<String, FakeError> {
            self.serial_calls += 1;
            if self.stop_after_serial == Some(self.serial_calls) {
                self.running = false;
            }
            self.serial
                .pop_front()
                .unwrap_or_else(|| Ok(port.unwrap_or("/dev/ttyUSB0").to_string()))
        }

        async fn alt_capture(
            &mut self,
            device: Option<&str>,
            resolution: Option<Resolution>,
            fps: Option<FrameRate>,
        ) -> Result<CaptureChoice, FakeError> {
            Ok(CaptureChoice {
                device: device.unwrap_or("video0").to_string(),
                resolution: resolution.or_else(|| Resolution::new(1280, 720)).ok_or_else(fatal)?,
                fps: fps.or_else(|| FrameRate::new(30)).ok_or_else(fatal)?,
            })
        }

        fn stream_url(&self) -> String {
            "http://kvm.test:8080/?action=stream".to_string()
        }
    }

    #[derive(Default)]
    struct FakeVideo {
        opens: VecDeque<Result<(), FakeError>>,
        frames: VecDeque<Result<Vec<u8>, FakeError>>,
        opened_urls: Vec<String>,
        closed: bool,
    }

    #[async_trait]
    impl FrameSource for FakeVideo {
        type Error = FakeError;

        async fn open(&mut self, url: &str, _timeout: Duration) -> Result<(), FakeError> {
            self.opened_urls.push(url.to_string());
            self.opens.pop_front().unwrap_or(Ok(()))
        }

        async fn next_frame(&mut self) -> Result<Vec<u8>, FakeError> {
            self.frames.pop_front().unwrap_or_else(|| Err(transient()))
        }

        fn close(&mut self) {
            self.closed = true;
        }
    }

    fn quick() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            backoff: Duration::from_millis(1),
        }
    }

    fn supervisor(kvm: FakeKvm, video: FakeVideo) -> SessionSupervisor<FakeKvm, FakeVideo> {
        SessionSupervisor::new(kvm, video, quick())
    }

    #[test]
    fn test_default_policy() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.backoff, Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_establish_retries_transient_failures() {
        // Arrange
        let kvm = FakeKvm {
            starts: VecDeque::from([Err(transient()), Err(transient()), Ok(())]),
            ..FakeKvm::default()
        };
        let mut sup = supervisor(kvm, FakeVideo::default());

        // Act
        let result = sup.establish().await;

        // Assert
        assert!(result.is_ok());
        assert_eq!(sup.kvm().start_calls, 3);
        assert!(sup.kvm().is_running());
    }

    #[tokio::test]
    async fn test_establish_gives_up_after_max_attempts() {
        let kvm = FakeKvm {
            starts: VecDeque::from([Err(transient()), Err(transient()), Err(transient()), Ok(())]),
            ..FakeKvm::default()
        };
        let mut sup = supervisor(kvm, FakeVideo::default());

        let err = sup.establish().await.unwrap_err();

        assert!(matches!(err, SessionError::Failed { attempts: 3, .. }));
        assert_eq!(err.category(), ErrorCategory::Transport);
        assert_eq!(sup.kvm().start_calls, 3);
    }

    #[tokio::test]
    async fn test_establish_does_not_retry_rejection() {
        let kvm = FakeKvm {
            starts: VecDeque::from([Err(fatal()), Ok(())]),
            ..FakeKvm::default()
        };
        let mut sup = supervisor(kvm, FakeVideo::default());

        let err = sup.establish().await.unwrap_err();

        assert_eq!(err.category(), ErrorCategory::Rejected);
        assert_eq!(sup.kvm().start_calls, 1);
    }

    #[tokio::test]
    async fn test_reopen_serial_requires_running_session() {
        let mut sup = supervisor(FakeKvm::default(), FakeVideo::default());

        let err = sup.reopen_serial(None).await.unwrap_err();

        assert!(matches!(err, SessionError::NotRunning));
        assert_eq!(sup.kvm().serial_calls, 0);
    }

    #[tokio::test]
    async fn test_reopen_serial_stops_when_session_drops() {
        // Arrange: the first attempt fails and takes the session down with it.
        let kvm = FakeKvm {
            running: true,
            serial: VecDeque::from([Err(transient())]),
            stop_after_serial: Some(1),
            ..FakeKvm::default()
        };
        let mut sup = supervisor(kvm, FakeVideo::default());

        // Act
        let err = sup.reopen_serial(Some("/dev/ttyACM0")).await.unwrap_err();

        // Assert
        assert!(matches!(err, SessionError::NotRunning));
        assert_eq!(sup.kvm().serial_calls, 1);
    }

    #[tokio::test]
    async fn test_reopen_serial_retries_then_succeeds() {
        let kvm = FakeKvm {
            running: true,
            serial: VecDeque::from([Err(FakeError(ErrorCategory::Timing))]),
            ..FakeKvm::default()
        };
        let mut sup = supervisor(kvm, FakeVideo::default());

        let port = sup.reopen_serial(Some("/dev/ttyACM0")).await.unwrap();

        assert_eq!(port, "/dev/ttyACM0");
        assert_eq!(sup.kvm().serial_calls, 2);
    }

    #[tokio::test]
    async fn test_reselect_capture_passes_arguments_through() {
        let kvm = FakeKvm {
            running: true,
            ..FakeKvm::default()
        };
        let mut sup = supervisor(kvm, FakeVideo::default());

        let choice = sup
            .reselect_capture(Some("HDMI"), Resolution::new(1920, 1080), FrameRate::new(60))
            .await
            .unwrap();

        assert_eq!(choice.device, "HDMI");
        assert_eq!(Some(choice.resolution), Resolution::new(1920, 1080));
        assert_eq!(Some(choice.fps), FrameRate::new(60));
    }

    #[tokio::test]
    async fn test_connect_video_retries_and_uses_session_url() {
        let kvm = FakeKvm {
            running: true,
            ..FakeKvm::default()
        };
        let video = FakeVideo {
            opens: VecDeque::from([Err(transient()), Ok(())]),
            ..FakeVideo::default()
        };
        let mut sup = supervisor(kvm, video);

        sup.connect_video().await.unwrap();

        assert_eq!(
            sup.video_mut().opened_urls,
            vec![
                "http://kvm.test:8080/?action=stream".to_string(),
                "http://kvm.test:8080/?action=stream".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_connect_video_without_session_is_refused() {
        let mut sup = supervisor(FakeKvm::default(), FakeVideo::default());

        assert!(matches!(sup.connect_video().await, Err(SessionError::NotRunning)));
        assert!(sup.video_mut().opened_urls.is_empty());
    }

    #[tokio::test]
    async fn test_next_frame_reconnects_after_lost_stream() {
        // Arrange
        let kvm = FakeKvm {
            running: true,
            ..FakeKvm::default()
        };
        let video = FakeVideo {
            frames: VecDeque::from([Err(FakeError(ErrorCategory::Lost)), Ok(vec![0xFF, 0xD8, 0xFF, 0xD9])]),
            ..FakeVideo::default()
        };
        let mut sup = supervisor(kvm, video);

        // Act
        let frame = sup.next_frame().await.unwrap();

        // Assert
        assert_eq!(frame, vec![0xFF, 0xD8, 0xFF, 0xD9]);
        assert_eq!(sup.video_mut().opened_urls.len(), 1);
    }

    #[tokio::test]
    async fn test_next_frame_format_error_is_not_retried() {
        let kvm = FakeKvm {
            running: true,
            ..FakeKvm::default()
        };
        let video = FakeVideo {
            frames: VecDeque::from([Err(FakeError(ErrorCategory::Format))]),
            ..FakeVideo::default()
        };
        let mut sup = supervisor(kvm, video);

        let err = sup.next_frame().await.unwrap_err();

        assert_eq!(err.category(), ErrorCategory::Format);
        assert!(sup.video_mut().opened_urls.is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_closes_stream_and_ends_session() {
        let kvm = FakeKvm {
            running: true,
            ..FakeKvm::default()
        };
        let mut sup = supervisor(kvm, FakeVideo::default());

        sup.shutdown().await.unwrap();

        assert!(sup.kvm().ended);
        assert!(!sup.kvm().is_running());
        assert!(sup.video_mut().closed);
    }
}
