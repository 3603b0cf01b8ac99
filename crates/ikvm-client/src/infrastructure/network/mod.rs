//! Network infrastructure: the iKVM protocol client.
//!
//! Architecture:
//! - [`KvmClient`] owns at most one session at a time.
//! - A session is a split TCP connection: the read half is driven by the
//!   [`receiver`] task, the write half is shared by callers and the receiver.
//! - Requests that expect a reply go through the per-type [`slots`]: mark
//!   the type in flight, send, wait for the receiver to publish.
//! - Input requests (keys, mouse, ATX) are fire-and-forget; their
//!   acknowledgements stay in the slot until `read_last_*_result` drains them.

pub mod receiver;
pub mod slots;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ikvm_core::domain::devices::{AspectRatio, FrameRate, Resolution, SerialDevice, UsbId, VideoCapture};
use ikvm_core::domain::selection::{
    select_capture, select_serial, CaptureChoice, CapturePreference, Quality, SelectionError,
};
use ikvm_core::protocol::codec::{encode_request, ProtocolError};
use ikvm_core::protocol::messages::{
    AsciiText, AtxSignal, KeyAction, KeyCommand, MessageType, MouseButton, MouseCommand, Reply,
    Request, RunMjpgRequest, StatusReply, WheelDirection, DEFAULT_MJPG_PORT, DEFAULT_SERVER_PORT,
};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tracing::{debug, info, info_span, warn, Instrument, Span};
use uuid::Uuid;

use crate::application::session::KvmControl;
use crate::error::{Categorize, ErrorCategory};
use crate::infrastructure::transport::{self, TransportError, TransportWriter};
use receiver::{HandshakeError, Receiver};
use slots::{BeginError, Slots, WaitError};

/// Default bound on the handshake and on every request/reply round trip.
pub const DEFAULT_LAG_TIMEOUT: Duration = Duration::from_secs(3);

/// Errors returned by [`KvmClient`] operations.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("KVM client is not running")]
    NotRunning,

    #[error("KVM client is already running")]
    AlreadyRunning,

    #[error("cannot resolve {host}: {source}")]
    Resolve {
        host: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{host} resolved to no address")]
    NoAddress { host: String },

    #[error("connection to {addr} refused")]
    ConnectionRefused { addr: SocketAddr },

    #[error("cannot connect to {addr}: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("handshake with {addr} timed out after {timeout:?}")]
    HandshakeTimeout { addr: SocketAddr, timeout: Duration },

    #[error("another client is already connected to {addr}")]
    AlreadyConnected { addr: SocketAddr },

    #[error("{kind:?} request timed out after {timeout:?}")]
    RequestTimeout { kind: MessageType, timeout: Duration },

    #[error("a {0:?} request is already in flight")]
    RequestInFlight(MessageType),

    #[error("session disconnected")]
    Disconnected,

    #[error("send timed out after {0:?}")]
    SendTimeout(Duration),

    #[error("socket error: {0}")]
    Io(std::io::Error),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("server answered {kind:?} with {reply}")]
    Rejected { kind: MessageType, reply: StatusReply },

    #[error(transparent)]
    Selection(#[from] SelectionError),

    /// A step of session setup failed; the session was ended.
    #[error("{stage} failed: {source}")]
    Setup {
        stage: &'static str,
        #[source]
        source: Box<ClientError>,
    },
}

impl ClientError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            ClientError::NotRunning
            | ClientError::AlreadyRunning
            | ClientError::RequestInFlight(_) => ErrorCategory::Usage,
            ClientError::Resolve { .. }
            | ClientError::NoAddress { .. }
            | ClientError::ConnectionRefused { .. }
            | ClientError::Connect { .. }
            | ClientError::AlreadyConnected { .. }
            | ClientError::Disconnected
            | ClientError::Io(_) => ErrorCategory::Transport,
            ClientError::HandshakeTimeout { .. }
            | ClientError::RequestTimeout { .. }
            | ClientError::SendTimeout(_) => ErrorCategory::Timing,
            ClientError::Protocol(_) => ErrorCategory::Protocol,
            ClientError::Rejected { .. } | ClientError::Selection(_) => ErrorCategory::Rejected,
            ClientError::Setup { source, .. } => source.category(),
        }
    }

    fn setup(stage: &'static str) -> impl FnOnce(ClientError) -> ClientError {
        move |source| ClientError::Setup {
            stage,
            source: Box::new(source),
        }
    }
}

impl From<TransportError> for ClientError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Disconnected => ClientError::Disconnected,
            TransportError::SendTimeout(d) => ClientError::SendTimeout(d),
            TransportError::Io(e) => ClientError::Io(e),
        }
    }
}

/// Settings for one [`KvmClient`].
#[derive(Debug, Clone, PartialEq)]
pub struct KvmConfig {
    /// IP literal (v4 or v6) or domain name of the iKVM server.
    pub host: String,
    pub port: u16,
    /// Port mjpg-streamer is asked to listen on.
    pub mjpg_port: u16,
    /// Substring of the capture device to stream; first device when `None`.
    pub capture_name: Option<String>,
    pub capture_scale: Option<AspectRatio>,
    pub quality: Quality,
    /// Serial device to open; chosen from the device list when `None`.
    pub serial_port: Option<String>,
    /// Serial adapter to look for when `serial_port` is `None`.
    pub usb_id: Option<UsbId>,
    /// Bound on the handshake and on every request/reply round trip.
    pub lag_timeout: Duration,
}

impl KvmConfig {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: DEFAULT_SERVER_PORT,
            mjpg_port: DEFAULT_MJPG_PORT,
            capture_name: None,
            capture_scale: None,
            quality: Quality::Best,
            serial_port: None,
            usb_id: None,
            lag_timeout: DEFAULT_LAG_TIMEOUT,
        }
    }

    /// URL of the stream mjpg-streamer serves once the capture is running.
    pub fn stream_url(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("http://[{}]:{}/?action=stream", self.host, self.mjpg_port)
        } else {
            format!("http://{}:{}/?action=stream", self.host, self.mjpg_port)
        }
    }
}

// ── Session ───────────────────────────────────────────────────────────────────

/// State shared by the receiver task and callers for one session.
pub(crate) struct SessionShared {
    pub(crate) writer: TransportWriter,
    pub(crate) slots: Slots,
    running: AtomicBool,
    torn_down: AtomicBool,
}

impl SessionShared {
    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }

    /// Ends the session: clears the running flag, closes the socket and
    /// wakes every waiter.  Only the first call does anything.
    pub(crate) async fn teardown(&self, reason: &str) {
        if self.torn_down.swap(true, Ordering::AcqRel) {
            return;
        }
        self.stop();
        self.writer.close().await;
        self.slots.close();
        info!(reason, "session torn down");
    }

    async fn send(&self, req: &Request) -> Result<(), ClientError> {
        let frame = encode_request(req)?;
        match self.writer.send(&frame).await {
            Ok(()) => {
                debug!(kind = ?req.message_type(), "sent");
                Ok(())
            }
            Err(TransportError::Disconnected) => {
                self.teardown("connection lost while sending").await;
                Err(ClientError::Disconnected)
            }
            Err(e) => Err(e.into()),
        }
    }
}

struct Session {
    id: Uuid,
    span: Span,
    shared: Arc<SessionShared>,
    receiver: JoinHandle<()>,
}

// ── Client ────────────────────────────────────────────────────────────────────

/// Client for one iKVM server.
///
/// # Examples
///
/// ```rust,no_run
/// use ikvm_client::infrastructure::network::{KvmClient, KvmConfig};
/// use ikvm_core::protocol::messages::KeyAction;
///
/// # async fn run() -> Result<(), ikvm_client::infrastructure::network::ClientError> {
/// let mut kvm = KvmClient::new(KvmConfig::new("192.168.1.50"));
/// kvm.start().await?;
/// kvm.send_key(KeyAction::Press, 0x04).await?;
/// kvm.send_key(KeyAction::Release, 0x04).await?;
/// kvm.end().await?;
/// # Ok(())
/// # }
/// ```
pub struct KvmClient {
    config: KvmConfig,
    session: Option<Session>,
}

impl KvmClient {
    pub fn new(config: KvmConfig) -> Self {
        Self {
            config,
            session: None,
        }
    }

    pub fn config(&self) -> &KvmConfig {
        &self.config
    }

    /// `true` while a session is established and has not torn down.
    pub fn is_running(&self) -> bool {
        self.session
            .as_ref()
            .is_some_and(|s| s.shared.is_running())
    }

    /// Id of the current session, used to correlate log lines.
    pub fn session_id(&self) -> Option<Uuid> {
        self.session.as_ref().map(|s| s.id)
    }

    fn shared(&self) -> Result<&Arc<SessionShared>, ClientError> {
        match &self.session {
            Some(s) if s.shared.is_running() => Ok(&s.shared),
            _ => Err(ClientError::NotRunning),
        }
    }

    fn span(&self) -> Span {
        self.session
            .as_ref()
            .map_or_else(Span::none, |s| s.span.clone())
    }

    // ── Lifecycle ────────────────────────────────────────────────────────────

    /// Connects, handshakes, opens the serial device and starts the video
    /// stream on the server.
    ///
    /// # Errors
    ///
    /// Connection and handshake failures are returned as is.  A failure in
    /// serial or video setup ends the session and is wrapped in
    /// [`ClientError::Setup`].
    pub async fn start(&mut self) -> Result<(), ClientError> {
        if self.is_running() {
            return Err(ClientError::AlreadyRunning);
        }
        // A previous session may have died on its own; release it first.
        if let Some(old) = self.session.take() {
            old.receiver.abort();
        }

        let id = Uuid::new_v4();
        let span = info_span!("kvm_session", session = %id, host = %self.config.host);
        let (shared, receiver) = self.connect().instrument(span.clone()).await?;
        let handle = tokio::spawn(receiver.run(Arc::clone(&shared)).instrument(span.clone()));
        self.session = Some(Session {
            id,
            span: span.clone(),
            shared,
            receiver: handle,
        });

        let setup = async {
            self.uart_select(None).await.map_err(ClientError::setup("serial device setup"))?;
            self.capture_select(None, None, None)
                .await
                .map_err(ClientError::setup("mjpg-streamer setup"))?;
            Ok::<_, ClientError>(())
        }
        .instrument(span.clone())
        .await;

        match setup {
            Ok(()) => {
                span.in_scope(|| info!("session started"));
                Ok(())
            }
            Err(e) => {
                span.in_scope(|| warn!("session setup failed: {e}"));
                self.end().await?;
                Err(e)
            }
        }
    }

    async fn connect(&self) -> Result<(Arc<SessionShared>, Receiver), ClientError> {
        let host = self.config.host.as_str();
        let addr = time::timeout(
            self.config.lag_timeout,
            tokio::net::lookup_host((host, self.config.port)),
        )
        .await
        .map_err(|_| ClientError::Resolve {
            host: host.to_string(),
            source: std::io::Error::new(std::io::ErrorKind::TimedOut, "lookup timed out"),
        })?
        .map_err(|source| ClientError::Resolve {
            host: host.to_string(),
            source,
        })?
        .next()
        .ok_or_else(|| ClientError::NoAddress {
            host: host.to_string(),
        })?;

        let timeout = self.config.lag_timeout;
        let deadline = Instant::now() + timeout;
        debug!(%addr, "connecting");
        let stream = match time::timeout_at(deadline, TcpStream::connect(addr)).await {
            Err(_) => return Err(ClientError::HandshakeTimeout { addr, timeout }),
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::ConnectionRefused => {
                return Err(ClientError::ConnectionRefused { addr })
            }
            Ok(Err(source)) => return Err(ClientError::Connect { addr, source }),
            Ok(Ok(stream)) => stream,
        };

        let (reader, writer) = transport::split(stream)?;
        let shared = Arc::new(SessionShared {
            writer,
            slots: Slots::new(),
            running: AtomicBool::new(true),
            torn_down: AtomicBool::new(false),
        });
        let mut receiver = Receiver::new(reader);

        let handshake = async {
            shared.send(&Request::Handshake).await?;
            receiver.await_handshake(deadline).await.map_err(|e| match e {
                HandshakeError::Timeout => ClientError::HandshakeTimeout { addr, timeout },
                HandshakeError::Disconnected => ClientError::AlreadyConnected { addr },
                HandshakeError::Transport(e) => e.into(),
            })
        };
        match handshake.await {
            Ok(()) => {
                info!(%addr, "handshake complete");
                Ok((shared, receiver))
            }
            Err(ClientError::Disconnected) => {
                shared.teardown("handshake rejected").await;
                Err(ClientError::AlreadyConnected { addr })
            }
            Err(e) => {
                shared.teardown("handshake failed").await;
                Err(e)
            }
        }
    }

    /// Stops the receiver, says goodbye and closes the connection.
    ///
    /// Ending a client that is not running succeeds without doing anything.
    /// A goodbye that cannot be delivered is logged and does not fail the call.
    pub async fn end(&mut self) -> Result<(), ClientError> {
        let Some(Session {
            span,
            shared,
            mut receiver,
            ..
        }) = self.session.take()
        else {
            return Ok(());
        };
        let timeout = self.config.lag_timeout;

        async move {
            shared.stop();
            if time::timeout(timeout, &mut receiver).await.is_err() {
                warn!("receiver did not stop within {timeout:?}; aborting it");
                receiver.abort();
            }
            if !shared.writer.is_closed() {
                if let Err(e) = shared.send(&Request::Goodbye).await {
                    debug!("goodbye not delivered: {e}");
                }
            }
            shared.teardown("session ended").await;
        }
        .instrument(span)
        .await;
        Ok(())
    }

    // ── Request/reply ────────────────────────────────────────────────────────

    /// Sends `req` and waits for the reply of the matching type.
    async fn call(&self, req: Request) -> Result<Reply, ClientError> {
        let shared = self.shared()?;
        let kind = req.message_type();
        let reply_kind = kind.response().ok_or(ClientError::Protocol(
            ProtocolError::UnexpectedMessage(kind),
        ))?;

        let _in_flight = shared.slots.begin(reply_kind).map_err(|e| match e {
            BeginError::InFlight(k) => ClientError::RequestInFlight(k),
            BeginError::Closed => ClientError::NotRunning,
        })?;
        shared.send(&req).await?;

        let timeout = self.config.lag_timeout;
        match shared.slots.wait(reply_kind, Instant::now() + timeout).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(e)) => Err(e.into()),
            Err(WaitError::Timeout) => {
                warn!(kind = ?reply_kind, "no reply within {timeout:?}");
                Err(ClientError::RequestTimeout {
                    kind: reply_kind,
                    timeout,
                })
            }
            Err(WaitError::Closed) => Err(ClientError::Disconnected),
        }
    }

    /// Sends `req` without waiting for its acknowledgement.
    async fn fire(&self, req: Request) -> Result<(), ClientError> {
        self.shared()?.send(&req).await
    }

    async fn call_status(&self, req: Request) -> Result<(), ClientError> {
        let reply = self.call(req).await?;
        let kind = reply.message_type();
        match reply.status() {
            Some(StatusReply::Success) => Ok(()),
            Some(other) => Err(ClientError::Rejected {
                kind,
                reply: other.clone(),
            }),
            None => Err(ProtocolError::UnexpectedMessage(kind).into()),
        }
    }

    fn read_last(&self, kind: MessageType) -> Result<Option<StatusReply>, ClientError> {
        match self.shared()?.slots.take(kind) {
            None => Ok(None),
            Some(Ok(reply)) => Ok(reply.status().cloned()),
            Some(Err(e)) => Err(e.into()),
        }
    }

    // ── Devices ──────────────────────────────────────────────────────────────

    /// Lists the serial devices attached to the server.
    pub async fn list_serial_devices(&self) -> Result<Vec<SerialDevice>, ClientError> {
        match self.call(Request::ListUart).instrument(self.span()).await? {
            Reply::ListUart(devices) => Ok(devices),
            other => Err(ProtocolError::UnexpectedMessage(other.message_type()).into()),
        }
    }

    /// Lists the video capture devices attached to the server.
    pub async fn list_captures(&self) -> Result<Vec<VideoCapture>, ClientError> {
        match self.call(Request::ListCap).instrument(self.span()).await? {
            Reply::ListCap(captures) => Ok(captures),
            other => Err(ProtocolError::UnexpectedMessage(other.message_type()).into()),
        }
    }

    /// Opens a serial device on the server and returns its name.
    ///
    /// With `port` unset, uses the configured port, else the first listed
    /// device (or the first matching the configured USB id).  The chosen port
    /// is remembered for later calls.
    pub async fn open_serial_device(&mut self, port: Option<&str>) -> Result<String, ClientError> {
        self.shared()?;
        let span = self.span();
        self.uart_select(port).instrument(span).await
    }

    /// Restarts mjpg-streamer on the server with a new capture device or
    /// mode.  Unset arguments are filled in by the selection policy.
    pub async fn alt_capture(
        &mut self,
        device: Option<&str>,
        resolution: Option<Resolution>,
        fps: Option<FrameRate>,
    ) -> Result<CaptureChoice, ClientError> {
        self.shared()?;
        let span = self.span();
        self.capture_select(device, resolution, fps).instrument(span).await
    }

    async fn uart_select(&mut self, port: Option<&str>) -> Result<String, ClientError> {
        let port = match port.or(self.config.serial_port.as_deref()) {
            Some(p) if !p.is_empty() => p.to_string(),
            _ => {
                let devices = self.list_serial_devices().await?;
                select_serial(&devices, self.config.usb_id)?.name.clone()
            }
        };
        self.call_status(Request::OpenUart { port: port.clone() }).await?;
        info!(port = %port, "serial device opened");
        self.config.serial_port = Some(port.clone());
        Ok(port)
    }

    async fn capture_select(
        &mut self,
        device: Option<&str>,
        resolution: Option<Resolution>,
        fps: Option<FrameRate>,
    ) -> Result<CaptureChoice, ClientError> {
        let captures = self.list_captures().await?;
        let pref = CapturePreference {
            name: device.map(str::to_string).or_else(|| self.config.capture_name.clone()),
            scale: self.config.capture_scale,
            quality: self.config.quality,
            resolution,
            fps,
        };
        let choice = select_capture(&captures, &pref)?;
        self.call_status(Request::RunMjpg(RunMjpgRequest {
            device: choice.device.clone(),
            resolution: choice.resolution,
            fps: choice.fps,
            port: self.config.mjpg_port,
        }))
        .await?;
        info!(capture = %choice, port = self.config.mjpg_port, "mjpg-streamer running");
        self.config.capture_name = Some(choice.device.clone());
        Ok(choice)
    }

    // ── Input ────────────────────────────────────────────────────────────────

    pub async fn send_key(&self, action: KeyAction, code: u8) -> Result<(), ClientError> {
        self.fire(Request::SendKey(KeyCommand::Key { action, code })).await
    }

    /// Types `text` on the remote machine.
    pub async fn send_text(&self, text: &AsciiText) -> Result<(), ClientError> {
        self.fire(Request::SendKey(KeyCommand::Text(text.clone()))).await
    }

    pub async fn release_keys(&self) -> Result<(), ClientError> {
        self.fire(Request::SendKey(KeyCommand::ReleaseAll)).await
    }

    pub async fn click_mouse(&self, action: KeyAction, button: MouseButton) -> Result<(), ClientError> {
        self.fire(Request::SendMouse(MouseCommand::Button { action, button })).await
    }

    /// Moves the pointer by a relative offset.
    pub async fn move_mouse(&self, dx: i16, dy: i16) -> Result<(), ClientError> {
        self.fire(Request::SendMouse(MouseCommand::Move { dx, dy })).await
    }

    pub async fn scroll_wheel(&self, direction: WheelDirection) -> Result<(), ClientError> {
        self.fire(Request::SendMouse(MouseCommand::Scroll(direction))).await
    }

    pub async fn release_mouse_buttons(&self) -> Result<(), ClientError> {
        self.fire(Request::SendMouse(MouseCommand::ReleaseAll)).await
    }

    pub async fn send_atx(&self, signal: AtxSignal) -> Result<(), ClientError> {
        info!(%signal, "sending ATX signal");
        self.fire(Request::SendAtx(signal)).await
    }

    /// Takes the most recent SEND_KEY acknowledgement, if one arrived.
    pub fn read_last_send_key_result(&self) -> Result<Option<StatusReply>, ClientError> {
        self.read_last(MessageType::SendKeyRes)
    }

    /// Takes the most recent SEND_MOUSE acknowledgement, if one arrived.
    pub fn read_last_send_mouse_result(&self) -> Result<Option<StatusReply>, ClientError> {
        self.read_last(MessageType::SendMouseRes)
    }

    /// Takes the most recent SEND_ATX acknowledgement, if one arrived.
    pub fn read_last_send_atx_result(&self) -> Result<Option<StatusReply>, ClientError> {
        self.read_last(MessageType::SendAtxRes)
    }
}

impl Drop for KvmClient {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            session.shared.stop();
            session.shared.slots.close();
            session.receiver.abort();
        }
    }
}

impl Categorize for ClientError {
    fn category(&self) -> ErrorCategory {
        ClientError::category(self)
    }
}

#[async_trait]
impl KvmControl for KvmClient {
    type Error = ClientError;

    async fn start(&mut self) -> Result<(), ClientError> {
        KvmClient::start(self).await
    }

    async fn end(&mut self) -> Result<(), ClientError> {
        KvmClient::end(self).await
    }

    fn is_running(&self) -> bool {
        KvmClient::is_running(self)
    }

    async fn open_serial_device(&mut self, port: Option<&str>) -> Result<String, ClientError> {
        KvmClient::open_serial_device(self, port).await
    }

    async fn alt_capture(
        &mut self,
        device: Option<&str>,
        resolution: Option<Resolution>,
        fps: Option<FrameRate>,
    ) -> Result<CaptureChoice, ClientError> {
        KvmClient::alt_capture(self, device, resolution, fps).await
    }

    fn stream_url(&self) -> String {
        self.config.stream_url()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
