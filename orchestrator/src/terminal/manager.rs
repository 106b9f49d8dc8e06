//! Bridges browser WebSockets to interactive shells inside sandbox containers

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use bollard::container::LogOutput;
use bollard::exec::{CreateExecOptions, StartExecOptions, StartExecResults};
use bollard::models::ContainerInspectResponse;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use futures::{Sink, SinkExt, Stream, StreamExt};
use serde::Serialize;
use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument, Span};
use uuid::Uuid;

use super::protocol::{Message, MessageType, Utf8Decoder};
use crate::config::{AppConfig, TerminalConfig};
use crate::container::{ImagePullProgress, ProgressCallback};
use crate::metrics;
use crate::runtime::{with_timeout, ContainerRuntime};

pub type WsSink = Pin<Box<dyn Sink<WsMessage, Error = axum::Error> + Send>>;
pub type WsStream = Pin<Box<dyn Stream<Item = Result<WsMessage, axum::Error>> + Send>>;

type ShellOutput = Pin<Box<dyn Stream<Item = Result<LogOutput, bollard::errors::Error>> + Send>>;
type ShellInput = Pin<Box<dyn AsyncWrite + Send>>;

/// Pull progress records waiting to be broadcast
const PROGRESS_QUEUE: usize = 64;

#[derive(Debug, Error)]
pub enum TerminalError {
    #[error("Container not found: {0}")]
    NotFound(String),

    #[error("Failed to start shell: {0}")]
    Exec(String),

    #[error("Terminal I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Terminal session is closed")]
    Closed,
}

/// Client side of a session: frames to the browser and frames from it
pub struct Connection {
    sink: WsSink,
    stream: WsStream,
}

impl Connection {
    pub fn new(sink: WsSink, stream: WsStream) -> Self {
        Self { sink, stream }
    }
}

impl From<WebSocket> for Connection {
    fn from(socket: WebSocket) -> Self {
        let (sink, stream) = socket.split();
        Self::new(Box::pin(sink), Box::pin(stream))
    }
}

/// Why a session ended
#[derive(Debug, Clone, PartialEq, Eq)]
enum CloseReason {
    ClientGone,
    SendFailed,
    ShellExited(Option<i64>),
    PtyError(String),
    Replaced,
    Removed,
    Shutdown,
}

impl CloseReason {
    fn as_str(&self) -> &'static str {
        match self {
            Self::ClientGone => "client_gone",
            Self::SendFailed => "send_failed",
            Self::ShellExited(_) => "shell_exited",
            Self::PtyError(_) => "pty_error",
            Self::Replaced => "replaced",
            Self::Removed => "removed",
            Self::Shutdown => "shutdown",
        }
    }

    /// Final `error` message for a client that may still be listening
    fn notice(&self) -> Option<String> {
        match self {
            Self::ShellExited(Some(code)) => Some(format!("Process exited with code {}", code)),
            Self::ShellExited(None) => Some("Process exited".to_string()),
            Self::PtyError(e) => Some(format!("Terminal error: {}", e)),
            Self::Replaced => Some("Session replaced by a new connection".to_string()),
            Self::Shutdown => Some("Server shutting down".to_string()),
            Self::ClientGone | Self::SendFailed | Self::Removed => None,
        }
    }

    fn shell_done(&self) -> bool {
        matches!(self, Self::ShellExited(_))
    }
}

/// One live WebSocket-to-shell bridge
pub struct TerminalSession {
    pub session_id: String,
    pub container_id: String,
    pub exec_id: String,
    pub created_at: DateTime<Utc>,

    /// Distinguishes this session from a later one reusing the same id
    instance: Uuid,
    pidfile: String,
    cancel: CancellationToken,
    closed: AtomicBool,
    sink: Mutex<WsSink>,
    input: Mutex<Option<ShellInput>>,
    span: Span,
}

impl std::fmt::Debug for TerminalSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TerminalSession")
            .field("session_id", &self.session_id)
            .field("container_id", &self.container_id)
            .field("exec_id", &self.exec_id)
            .field("created_at", &self.created_at)
            .field("instance", &self.instance)
            .finish_non_exhaustive()
    }
}

impl TerminalSession {
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Send a message to the client.
    ///
    /// Gives up as soon as the session is cancelled, releasing the sink.
    pub async fn send(&self, message: Message) -> Result<(), TerminalError> {
        if self.is_closed() {
            return Err(TerminalError::Closed);
        }
        let sent = async {
            self.sink
                .lock()
                .await
                .send(WsMessage::Text(message.to_json()))
                .await
                .map_err(|e| TerminalError::Io(std::io::Error::other(e)))
        };
        tokio::select! {
            _ = self.cancel.cancelled() => Err(TerminalError::Closed),
            result = sent => result,
        }
    }

    async fn write_input(&self, bytes: &[u8]) -> Result<(), TerminalError> {
        let written = async {
            let mut input = self.input.lock().await;
            let writer = input.as_mut().ok_or(TerminalError::Closed)?;
            writer.write_all(bytes).await?;
            writer.flush().await?;
            Ok::<(), TerminalError>(())
        };
        tokio::select! {
            _ = self.cancel.cancelled() => Err(TerminalError::Closed),
            result = written => result,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub session_id: String,
    pub container_id: String,
    pub exec_id: String,
    pub created_at: DateTime<Utc>,
}

struct Shared {
    runtime: Arc<dyn ContainerRuntime>,
    sessions: RwLock<HashMap<String, Arc<TerminalSession>>>,
    config: TerminalConfig,
    call_timeout: Duration,
    span: Span,
}

/// Registry of terminal sessions keyed by client-chosen session id
#[derive(Clone)]
pub struct TerminalManager {
    inner: Arc<Shared>,
}

impl TerminalManager {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, config: &AppConfig, span: Span) -> Self {
        Self {
            inner: Arc::new(Shared {
                runtime,
                sessions: RwLock::new(HashMap::new()),
                config: config.terminal.clone(),
                call_timeout: config.runtime.call_timeout(),
                span,
            }),
        }
    }

    /// Attach a shell in `container_id` to the connection and register it under `session_id`.
    ///
    /// A session already registered under the same id is closed first. When
    /// the shell cannot be started the client receives an `error` message and
    /// the connection is closed.
    pub async fn create_session(
        &self,
        session_id: &str,
        container_id: &str,
        connection: Connection,
    ) -> Result<Arc<TerminalSession>, TerminalError> {
        let Connection { mut sink, stream } = connection;

        let existing = self.inner.sessions.read().await.get(session_id).cloned();
        if let Some(previous) = existing {
            self.close_session(&previous, CloseReason::Replaced).await;
        }

        let span = info_span!(
            parent: &self.inner.span,
            "terminal_session",
            session_id = %session_id,
            container_id = %container_id
        );
        let instance = Uuid::new_v4();
        let pidfile = format!("/tmp/.playground-term-{}.pid", instance.simple());

        let (exec_id, output, input) = match self.start_shell(container_id, &pidfile).await {
            Ok(started) => started,
            Err(e) => {
                warn!(parent: &span, error = %e, "Failed to start terminal shell");
                let notice = Message::error(e.to_string()).to_json();
                let farewell = async {
                    sink.send(WsMessage::Text(notice)).await?;
                    sink.send(WsMessage::Close(None)).await?;
                    sink.close().await
                };
                if let Ok(Err(send_err)) = tokio::time::timeout(self.inner.call_timeout, farewell).await {
                    debug!(parent: &span, error = %send_err, "Client gone before the failure was reported");
                }
                return Err(e);
            }
        };

        let session = Arc::new(TerminalSession {
            session_id: session_id.to_string(),
            container_id: container_id.to_string(),
            exec_id: exec_id.clone(),
            created_at: Utc::now(),
            instance,
            pidfile,
            cancel: CancellationToken::new(),
            closed: AtomicBool::new(false),
            sink: Mutex::new(sink),
            input: Mutex::new(Some(input)),
            span,
        });

        // A concurrent create for the same id may have registered in between
        let raced = self
            .inner
            .sessions
            .write()
            .await
            .insert(session_id.to_string(), session.clone());
        if let Some(previous) = raced {
            self.close_session(&previous, CloseReason::Replaced).await;
        }
        metrics::record_terminal_opened();

        // Output is held back until `connected` is out
        let greeted = {
            let mut sink = session.sink.lock().await;

            tokio::spawn(
                self.clone()
                    .pump_input(session.clone(), stream)
                    .instrument(session.span.clone()),
            );
            tokio::spawn(
                self.clone()
                    .pump_output(session.clone(), output)
                    .instrument(session.span.clone()),
            );
            tokio::spawn(
                self.clone()
                    .watch_exit(session.clone())
                    .instrument(session.span.clone()),
            );

            let welcome = Message::connected(self.inner.config.welcome_message.clone());
            let greeting = sink.send(WsMessage::Text(welcome.to_json()));
            let sent = tokio::select! {
                _ = session.cancel.cancelled() => Err(TerminalError::Closed),
                sent = tokio::time::timeout(self.inner.call_timeout, greeting) => match sent {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(e)) => Err(TerminalError::Io(std::io::Error::other(e))),
                    Err(_) => Err(TerminalError::Io(std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        "client did not accept the greeting",
                    ))),
                },
            };
            sent
        };

        if let Err(e) = greeted {
            warn!(parent: &session.span, error = %e, "Failed to greet terminal client");
            self.close_session(&session, CloseReason::SendFailed).await;
            return Err(TerminalError::Closed);
        }

        info!(parent: &session.span, exec_id = %exec_id, "Terminal session opened");
        Ok(session)
    }

    /// Close and deregister a session. Unknown ids are ignored.
    pub async fn remove_session(&self, session_id: &str) {
        let session = self.inner.sessions.read().await.get(session_id).cloned();
        if let Some(session) = session {
            self.close_session(&session, CloseReason::Removed).await;
        }
    }

    pub async fn get_session(&self, session_id: &str) -> Option<Arc<TerminalSession>> {
        self.inner.sessions.read().await.get(session_id).cloned()
    }

    pub async fn active_session_count(&self) -> usize {
        self.inner.sessions.read().await.len()
    }

    pub async fn list_sessions(&self) -> Vec<SessionSummary> {
        let mut summaries: Vec<SessionSummary> = self
            .inner
            .sessions
            .read()
            .await
            .values()
            .map(|s| SessionSummary {
                session_id: s.session_id.clone(),
                container_id: s.container_id.clone(),
                exec_id: s.exec_id.clone(),
                created_at: s.created_at,
            })
            .collect();
        summaries.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        summaries
    }

    /// Push an image pull progress record to every connected terminal.
    ///
    /// Returns how many sessions received it.
    pub async fn broadcast_progress(&self, progress: &ImagePullProgress) -> usize {
        let meta = match serde_json::to_value(progress) {
            Ok(meta) => meta,
            Err(e) => {
                warn!(parent: &self.inner.span, error = %e, "Failed to encode pull progress");
                return 0;
            }
        };

        let sessions: Vec<_> = self.inner.sessions.read().await.values().cloned().collect();
        let timeout = self.inner.call_timeout;
        let deliveries = sessions.iter().map(|session| {
            let message = Message::output("").with_meta(meta.clone());
            async move {
                match tokio::time::timeout(timeout, session.send(message)).await {
                    Ok(Ok(())) => true,
                    Ok(Err(e)) => {
                        debug!(parent: &session.span, error = %e, "Progress not delivered");
                        false
                    }
                    Err(_) => {
                        debug!(parent: &session.span, "Progress delivery timed out");
                        false
                    }
                }
            }
        });
        join_all(deliveries).await.into_iter().filter(|sent| *sent).count()
    }

    /// Pull progress callback feeding [`broadcast_progress`](Self::broadcast_progress).
    ///
    /// Records are queued for a single forwarding task; when the queue is
    /// full the record is dropped. The task ends once the callback is dropped.
    pub fn progress_forwarder(&self) -> ProgressCallback {
        let (tx, mut rx) = mpsc::channel::<ImagePullProgress>(PROGRESS_QUEUE);
        let manager = self.clone();
        tokio::spawn(
            async move {
                while let Some(update) = rx.recv().await {
                    manager.broadcast_progress(&update).await;
                }
            }
            .instrument(self.inner.span.clone()),
        );

        let span = self.inner.span.clone();
        Arc::new(move |update: ImagePullProgress| {
            if let Err(e) = tx.try_send(update) {
                debug!(parent: &span, error = %e, "Dropped pull progress record");
            }
        })
    }

    /// Close every session, used on shutdown
    pub async fn close_all(&self) {
        let sessions: Vec<_> = self.inner.sessions.read().await.values().cloned().collect();
        let count = sessions.len();
        for session in sessions {
            self.close_session(&session, CloseReason::Shutdown).await;
        }
        if count > 0 {
            info!(parent: &self.inner.span, count, "Closed all terminal sessions");
        }
    }

    async fn start_shell(
        &self,
        container_id: &str,
        pidfile: &str,
    ) -> Result<(String, ShellOutput, ShellInput), TerminalError> {
        let runtime = &self.inner.runtime;
        let timeout = self.inner.call_timeout;

        let inspect = with_timeout("inspect_container", timeout, runtime.inspect_container(container_id))
            .await
            .map_err(|e| {
                if e.is_not_found() {
                    TerminalError::NotFound(container_id.to_string())
                } else {
                    TerminalError::Exec(e.to_string())
                }
            })?;
        let running = inspect.state.as_ref().and_then(|s| s.running).unwrap_or(false);
        if !running {
            return Err(TerminalError::Exec(format!(
                "container {} is not running",
                container_id
            )));
        }

        let options = shell_exec_options(&inspect, &self.inner.config.shell, pidfile);
        let exec_id = with_timeout("create_exec", timeout, runtime.create_exec(container_id, options))
            .await
            .map_err(|e| TerminalError::Exec(e.to_string()))?;

        let attach = StartExecOptions {
            tty: true,
            ..Default::default()
        };
        let started = with_timeout("start_exec", timeout, runtime.start_exec(&exec_id, attach))
            .await
            .map_err(|e| TerminalError::Exec(e.to_string()))?;

        let StartExecResults::Attached { output, input } = started else {
            return Err(TerminalError::Exec("runtime detached the shell".to_string()));
        };

        if let Err(e) = with_timeout("resize_exec", timeout, runtime.resize_exec(&exec_id, 24, 80)).await {
            debug!(parent: &self.inner.span, exec_id = %exec_id, error = %e, "Initial resize failed");
        }

        Ok((exec_id, output, input))
    }

    async fn pump_input(self, session: Arc<TerminalSession>, mut stream: WsStream) {
        let reason = loop {
            let next = tokio::select! {
                _ = session.cancel.cancelled() => return,
                next = stream.next() => next,
            };

            match next {
                Some(Ok(WsMessage::Text(text))) => match serde_json::from_str::<Message>(&text) {
                    Ok(message) => {
                        if let Err(reason) = self.handle_client_message(&session, message).await {
                            break reason;
                        }
                    }
                    Err(e) => debug!(error = %e, "Ignoring malformed terminal message"),
                },
                Some(Ok(WsMessage::Binary(bytes))) => {
                    if let Err(e) = session.write_input(&bytes).await {
                        break CloseReason::PtyError(e.to_string());
                    }
                }
                Some(Ok(WsMessage::Close(_))) | None => break CloseReason::ClientGone,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(error = %e, "WebSocket read failed");
                    break CloseReason::ClientGone;
                }
            }
        };

        self.close_session(&session, reason).await;
    }

    async fn handle_client_message(
        &self,
        session: &TerminalSession,
        message: Message,
    ) -> Result<(), CloseReason> {
        match message.kind {
            MessageType::Input => session
                .write_input(message.data.as_bytes())
                .await
                .map_err(|e| CloseReason::PtyError(e.to_string())),
            MessageType::Resize => {
                let Some((rows, cols)) = message.resize_dims() else {
                    debug!("Ignoring resize without dimensions");
                    return Ok(());
                };
                let resize = self.inner.runtime.resize_exec(&session.exec_id, rows, cols);
                if let Err(e) = with_timeout("resize_exec", self.inner.call_timeout, resize).await {
                    warn!(rows, cols, error = %e, "Failed to resize terminal");
                }
                Ok(())
            }
            other => {
                debug!(kind = ?other, "Ignoring terminal message");
                Ok(())
            }
        }
    }

    async fn pump_output(self, session: Arc<TerminalSession>, mut output: ShellOutput) {
        let chunk_size = self.inner.config.read_buffer_bytes.max(1);
        let mut decoder = Utf8Decoder::default();

        let reason = 'pump: loop {
            let frame = tokio::select! {
                _ = session.cancel.cancelled() => return,
                frame = output.next() => frame,
            };

            match frame {
                Some(Ok(frame)) => {
                    for chunk in frame_bytes(frame).chunks(chunk_size) {
                        let text = decoder.decode(chunk);
                        if text.is_empty() {
                            continue;
                        }
                        match session.send(Message::output(text)).await {
                            Ok(()) => {}
                            Err(TerminalError::Closed) => return,
                            Err(e) => {
                                warn!(error = %e, "Failed to forward terminal output");
                                break 'pump CloseReason::SendFailed;
                            }
                        }
                    }
                }
                Some(Err(e)) => break CloseReason::PtyError(e.to_string()),
                None => break CloseReason::ShellExited(self.exit_code(&session).await),
            }
        };

        self.close_session(&session, reason).await;
    }

    /// Polls the exec so a shell that exits without closing its stream is still noticed
    async fn watch_exit(self, session: Arc<TerminalSession>) {
        let mut ticker = tokio::time::interval(self.inner.config.exec_poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let reason = loop {
            tokio::select! {
                _ = session.cancel.cancelled() => return,
                _ = ticker.tick() => {}
            }

            let inspect = self.inner.runtime.inspect_exec(&session.exec_id);
            match with_timeout("inspect_exec", self.inner.call_timeout, inspect).await {
                Ok(inspect) if inspect.running == Some(false) => {
                    break CloseReason::ShellExited(inspect.exit_code)
                }
                Ok(_) => {}
                Err(e) if e.is_not_found() => break CloseReason::ShellExited(None),
                Err(e) => debug!(error = %e, "Exec status check failed"),
            }
        };

        self.close_session(&session, reason).await;
    }

    async fn exit_code(&self, session: &TerminalSession) -> Option<i64> {
        let inspect = self.inner.runtime.inspect_exec(&session.exec_id);
        with_timeout("inspect_exec", self.inner.call_timeout, inspect)
            .await
            .ok()
            .and_then(|i| i.exit_code)
    }

    /// Tear a session down. Only the first call for a session does anything.
    async fn close_session(&self, session: &Arc<TerminalSession>, reason: CloseReason) {
        if session.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        session.cancel.cancel();

        {
            let mut sessions = self.inner.sessions.write().await;
            let current = sessions.get(&session.session_id).map(|s| s.instance);
            if current == Some(session.instance) {
                sessions.remove(&session.session_id);
            }
        }

        if let Some(mut input) = session.input.lock().await.take() {
            if let Err(e) = input.shutdown().await {
                debug!(parent: &session.span, error = %e, "Failed to close shell input");
            }
        }
        if !reason.shell_done() {
            self.hang_up(session).await;
        }

        let farewell = async {
            let mut sink = session.sink.lock().await;
            if let Some(notice) = reason.notice() {
                sink.send(WsMessage::Text(Message::error(notice).to_json()))
                    .await?;
            }
            sink.send(WsMessage::Close(None)).await?;
            sink.close().await
        };
        match tokio::time::timeout(self.inner.call_timeout, farewell).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!(parent: &session.span, error = %e, "Client already gone"),
            Err(_) => debug!(parent: &session.span, "Timed out closing WebSocket"),
        }

        metrics::record_terminal_closed();
        info!(parent: &session.span, reason = reason.as_str(), "Terminal session closed");
    }

    /// Send SIGHUP to a shell that is still running after its input was closed
    async fn hang_up(&self, session: &TerminalSession) {
        let runtime = &self.inner.runtime;
        let timeout = self.inner.call_timeout;

        match with_timeout("inspect_exec", timeout, runtime.inspect_exec(&session.exec_id)).await {
            Ok(inspect) if inspect.running == Some(true) => {}
            _ => return,
        }

        let script = format!(
            "kill -HUP $(cat {pidfile}) 2>/dev/null; rm -f {pidfile}",
            pidfile = session.pidfile
        );
        let options = CreateExecOptions {
            cmd: Some(vec!["/bin/sh".to_string(), "-c".to_string(), script]),
            attach_stdout: Some(false),
            attach_stderr: Some(false),
            user: Some("root".to_string()),
            ..Default::default()
        };
        let detached = StartExecOptions {
            detach: true,
            ..Default::default()
        };

        let killed = async {
            let exec_id = runtime.create_exec(&session.container_id, options).await?;
            runtime.start_exec(&exec_id, detached).await.map(|_| ())
        };
        if let Err(e) = with_timeout("hang_up", timeout, killed).await {
            debug!(parent: &session.span, error = %e, "Failed to hang up shell");
        }
    }
}

fn frame_bytes(frame: LogOutput) -> Bytes {
    match frame {
        LogOutput::StdErr { message }
        | LogOutput::StdOut { message }
        | LogOutput::StdIn { message }
        | LogOutput::Console { message } => message,
    }
}

/// Exec options for an interactive login shell.
///
/// The shell records its pid in `pidfile` so it can be signalled from a
/// second exec, then replaces itself with `shell`, falling back to `/bin/sh`.
fn shell_exec_options(
    inspect: &ContainerInspectResponse,
    shell: &str,
    pidfile: &str,
) -> CreateExecOptions<String> {
    let config = inspect.config.as_ref();
    let container_env = config.and_then(|c| c.env.clone()).unwrap_or_default();

    let env = [
        ("TERM", "xterm-256color"),
        ("COLUMNS", "80"),
        ("LINES", "24"),
        ("PS1", "$ "),
    ]
    .into_iter()
    .filter(|(key, _)| {
        let prefix = format!("{}=", key);
        !container_env.iter().any(|e| e.starts_with(&prefix))
    })
    .map(|(key, value)| format!("{}={}", key, value))
    .collect();

    let user = config
        .and_then(|c| c.user.clone())
        .filter(|u| !u.is_empty())
        .unwrap_or_else(|| "root".to_string());
    let working_dir = config
        .and_then(|c| c.working_dir.clone())
        .filter(|d| !d.is_empty())
        .unwrap_or_else(|| "/".to_string());

    let script = format!(
        "echo $$ > {pidfile}; if command -v {shell} >/dev/null 2>&1; then exec {shell}; else exec /bin/sh; fi"
    );

    CreateExecOptions {
        attach_stdin: Some(true),
        attach_stdout: Some(true),
        attach_stderr: Some(true),
        tty: Some(true),
        env: Some(env),
        cmd: Some(vec!["/bin/sh".to_string(), "-c".to_string(), script]),
        user: Some(user),
        working_dir: Some(working_dir),
        ..Default::default()
    }
}
