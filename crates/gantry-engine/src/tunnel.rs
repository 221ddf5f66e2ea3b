//! Protocol-upgrade tunnel for interactive terminals (exec/attach)
//!
//! The engine's exec and attach endpoints speak a WebSocket-flavored HTTP
//! Upgrade: the client sends the request with `Upgrade: WebSocket`, the
//! engine answers `101`, and from the header/body boundary onward the socket
//! is an opaque bidirectional byte stream carrying the terminal. The generic
//! call/monitor clients cannot express that mid-stream mode switch, so the
//! tunnel drives the handshake by hand.
//!
//! [`Handshake`] is the pure state machine: it accumulates response bytes,
//! locates the `\r\n\r\n` boundary under arbitrary chunk fragmentation, and
//! gates on the status line's second token being exactly `101`. [`Tunnel`]
//! is the handle over a background task that runs the handshake on a live
//! socket and then relays bytes both ways.

use std::sync::{Arc, RwLock};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::sync::mpsc;

use gantry_core::prelude::*;
use gantry_core::EngineError;

use crate::address::Scope;
use crate::framing::find_header_end;
use crate::http::{status_token, READ_CHUNK};
use crate::request::Request;

/// Control byte relayed to prompt the remote shell to redraw (ASCII FF).
pub const REDRAW_BYTE: u8 = 0x0c;

/// Capacity of the caller-input command channel.
const CMD_CHANNEL_CAPACITY: usize = 32;

// ---------------------------------------------------------------------------
// Handshake state machine
// ---------------------------------------------------------------------------

/// Outcome of feeding one chunk to a [`Handshake`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeProgress {
    /// Header terminator not seen yet; nothing consumed.
    Pending,
    /// Upgrade accepted. `remainder` holds every byte past the boundary,
    /// including any bundled in the same chunk as the headers; they are
    /// tunnel payload and must be forwarded.
    Accepted { remainder: Vec<u8> },
    /// The status line's second token was not `101`. Terminal: the tunnel
    /// never streams and no further bytes will be consumed.
    Rejected { status_line: String },
}

/// Accumulates the upgrade response until the header block completes, then
/// decides acceptance on the status line.
///
/// The `\r\n\r\n` search re-runs over the whole buffer on each chunk; header
/// blocks are small and bounded, so the rescan is fine.
#[derive(Debug, Default)]
pub struct Handshake {
    buffer: Vec<u8>,
}

impl Handshake {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one incoming chunk; see [`HandshakeProgress`].
    ///
    /// Once `Accepted` or `Rejected` has been returned the handshake is
    /// finished; callers switch to forwarding (or stop) and must not feed
    /// further chunks.
    pub fn feed(&mut self, chunk: &[u8]) -> HandshakeProgress {
        self.buffer.extend_from_slice(chunk);
        let Some(end) = find_header_end(&self.buffer) else {
            return HandshakeProgress::Pending;
        };

        let head = String::from_utf8_lossy(&self.buffer[..end - 4]);
        let status_line = head.split("\r\n").next().unwrap_or_default().to_string();
        if status_token(&status_line) != Some("101") {
            return HandshakeProgress::Rejected { status_line };
        }
        HandshakeProgress::Accepted {
            remainder: self.buffer.split_off(end),
        }
    }
}

// ---------------------------------------------------------------------------
// Tunnel handle
// ---------------------------------------------------------------------------

/// Current state of a [`Tunnel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    /// Waiting for the upgrade response headers.
    Handshaking,
    /// Upgrade accepted; bytes relay in both directions.
    Streaming,
    /// Upgrade rejected (non-101 status). Terminal: no bytes ever reach the
    /// output callback and no error is raised — callers that care must check
    /// this state themselves.
    Rejected,
    /// The channel closed; the disconnect callback has fired.
    Closed,
}

/// Internal messages from the handle to the background task.
enum TunnelCommand {
    /// Forward caller bytes (keystrokes, control bytes) into the socket.
    Write(Vec<u8>),
    /// Tear the tunnel down.
    Close,
}

/// Handle over an upgraded exec/attach byte relay.
///
/// Created by [`Tunnel::open`], which connects, sends the upgrade request,
/// and spawns a background task that owns the socket. Incoming bytes go to
/// the output callback; [`write`](Tunnel::write) relays caller bytes back.
/// The disconnect callback fires exactly once when the channel closes.
pub struct Tunnel {
    cmd_tx: mpsc::Sender<TunnelCommand>,
    state: Arc<RwLock<TunnelState>>,
}

impl Tunnel {
    /// Connect to `scope`'s engine, send `request` as an Upgrade handshake,
    /// and start relaying.
    ///
    /// Returns as soon as the request is on the wire; the handshake outcome
    /// is observed through [`state`](Tunnel::state) and the callbacks. A
    /// connect or send failure is reported here as a transport error.
    pub async fn open(
        scope: Scope,
        request: Request,
        on_output: impl FnMut(&[u8]) + Send + 'static,
        on_disconnect: impl FnOnce() + Send + 'static,
    ) -> Result<Self> {
        let path = scope.socket_path()?;
        let mut stream = UnixStream::connect(&path)
            .await
            .map_err(|err| Error::engine(EngineError::from_io(&err)))?;
        stream
            .write_all(&request.encode_upgrade())
            .await
            .map_err(|err| Error::engine(EngineError::from_io(&err)))?;
        info!(scope = %scope, path = request.path(), "tunnel handshake sent");

        let (cmd_tx, cmd_rx) = mpsc::channel(CMD_CHANNEL_CAPACITY);
        let state = Arc::new(RwLock::new(TunnelState::Handshaking));
        tokio::spawn(run_tunnel_task(
            stream,
            cmd_rx,
            Arc::clone(&state),
            on_output,
            on_disconnect,
        ));

        Ok(Self { cmd_tx, state })
    }

    pub fn state(&self) -> TunnelState {
        *self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_streaming(&self) -> bool {
        self.state() == TunnelState::Streaming
    }

    /// Relay caller bytes (keystrokes, resize control) into the channel.
    ///
    /// # Errors
    ///
    /// [`Error::ChannelClosed`] when the background task has exited.
    pub async fn write(&self, bytes: impl Into<Vec<u8>>) -> Result<()> {
        self.cmd_tx
            .send(TunnelCommand::Write(bytes.into()))
            .await
            .map_err(|_| Error::ChannelClosed)
    }

    /// Send the single FF control byte that prompts the remote shell to
    /// redraw. Terminal resizing sends this *and* the resize RPC; neither
    /// substitutes for the other.
    pub async fn redraw(&self) -> Result<()> {
        self.write([REDRAW_BYTE]).await
    }

    /// Tear the tunnel down. Returns immediately; the disconnect callback
    /// fires from the background task.
    pub async fn close(&self) {
        // Ignore the send error: if the channel is gone the task already
        // exited.
        let _ = self.cmd_tx.send(TunnelCommand::Close).await;
    }
}

// ---------------------------------------------------------------------------
// Background task
// ---------------------------------------------------------------------------

fn set_state(state: &Arc<RwLock<TunnelState>>, next: TunnelState) {
    let mut guard = state.write().unwrap_or_else(|e| e.into_inner());
    *guard = next;
}

fn get_state(state: &Arc<RwLock<TunnelState>>) -> TunnelState {
    *state.read().unwrap_or_else(|e| e.into_inner())
}

/// Relay loop: handshake, then bidirectional forwarding until close.
///
/// Generic over the stream so tests can drive it with an in-memory duplex.
async fn run_tunnel_task<S>(
    mut stream: S,
    mut cmd_rx: mpsc::Receiver<TunnelCommand>,
    state: Arc<RwLock<TunnelState>>,
    mut on_output: impl FnMut(&[u8]) + Send,
    on_disconnect: impl FnOnce() + Send,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let mut handshake = Handshake::new();
    let mut chunk = [0u8; READ_CHUNK];

    let disconnected = loop {
        tokio::select! {
            command = cmd_rx.recv() => match command {
                Some(TunnelCommand::Write(bytes)) => {
                    if get_state(&state) != TunnelState::Streaming {
                        debug!(len = bytes.len(), "dropping tunnel input before streaming");
                        continue;
                    }
                    if let Err(err) = stream.write_all(&bytes).await {
                        warn!(error = %err, "tunnel write failed");
                        break true;
                    }
                }
                Some(TunnelCommand::Close) | None => {
                    debug!("tunnel closed by owner");
                    break true;
                }
            },
            read = stream.read(&mut chunk) => match read {
                Ok(0) => {
                    debug!("tunnel channel ended");
                    break true;
                }
                Ok(n) if get_state(&state) == TunnelState::Streaming => {
                    on_output(&chunk[..n]);
                }
                Ok(n) => match handshake.feed(&chunk[..n]) {
                    HandshakeProgress::Pending => {}
                    HandshakeProgress::Accepted { remainder } => {
                        set_state(&state, TunnelState::Streaming);
                        info!("tunnel upgrade accepted");
                        if !remainder.is_empty() {
                            on_output(&remainder);
                        }
                    }
                    HandshakeProgress::Rejected { status_line } => {
                        warn!(status_line, "tunnel upgrade rejected");
                        set_state(&state, TunnelState::Rejected);
                        break false;
                    }
                },
                Err(err) => {
                    warn!(error = %err, "tunnel read failed");
                    break true;
                }
            },
        }
    };

    // A rejected handshake parks in Rejected and raises no signal; only a
    // closing channel reaches the disconnect callback.
    if disconnected {
        set_state(&state, TunnelState::Closed);
        on_disconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[test]
    fn test_handshake_pending_until_terminator() {
        let mut handshake = Handshake::new();
        assert_eq!(handshake.feed(b"HTTP/1.0 101"), HandshakeProgress::Pending);
        assert_eq!(handshake.feed(b" UPGRADED\r\n"), HandshakeProgress::Pending);
        assert_eq!(handshake.feed(b"\r"), HandshakeProgress::Pending);
        assert_eq!(
            handshake.feed(b"\n"),
            HandshakeProgress::Accepted { remainder: Vec::new() }
        );
    }

    #[test]
    fn test_handshake_keeps_same_chunk_remainder() {
        let mut handshake = Handshake::new();
        let progress = handshake.feed(b"HTTP/1.0 101 UPGRADED\r\n\r\n$ ls\r\n");
        assert_eq!(
            progress,
            HandshakeProgress::Accepted {
                remainder: b"$ ls\r\n".to_vec()
            }
        );
    }

    #[test]
    fn test_handshake_rejects_non_101() {
        let mut handshake = Handshake::new();
        let progress = handshake.feed(b"HTTP/1.0 200 OK\r\nContent-Length: 0\r\n\r\n");
        assert_eq!(
            progress,
            HandshakeProgress::Rejected {
                status_line: "HTTP/1.0 200 OK".to_string()
            }
        );
    }

    #[test]
    fn test_handshake_rejects_garbage_status_line() {
        let mut handshake = Handshake::new();
        let progress = handshake.feed(b"nonsense\r\n\r\n");
        assert!(matches!(progress, HandshakeProgress::Rejected { .. }));
    }

    #[test]
    fn test_handshake_boundary_split_across_chunks() {
        // Terminator arrives one byte at a time, with payload in the final
        // chunk.
        let mut handshake = Handshake::new();
        assert_eq!(handshake.feed(b"HTTP/1.0 101 UPGRADED\r\n\r"), HandshakeProgress::Pending);
        assert_eq!(
            handshake.feed(b"\ntail"),
            HandshakeProgress::Accepted {
                remainder: b"tail".to_vec()
            }
        );
    }

    // ── Task-level tests over an in-memory duplex ─────────────────────────

    struct TaskHarness {
        remote: tokio::io::DuplexStream,
        cmd_tx: mpsc::Sender<TunnelCommand>,
        state: Arc<RwLock<TunnelState>>,
        output: Arc<Mutex<Vec<u8>>>,
        disconnects: Arc<AtomicUsize>,
    }

    fn spawn_task() -> TaskHarness {
        let (local, remote) = tokio::io::duplex(1024);
        let (cmd_tx, cmd_rx) = mpsc::channel(4);
        let state = Arc::new(RwLock::new(TunnelState::Handshaking));
        let output = Arc::new(Mutex::new(Vec::new()));
        let disconnects = Arc::new(AtomicUsize::new(0));

        let output_clone = Arc::clone(&output);
        let disconnects_clone = Arc::clone(&disconnects);
        tokio::spawn(run_tunnel_task(
            local,
            cmd_rx,
            Arc::clone(&state),
            move |bytes: &[u8]| output_clone.lock().unwrap().extend_from_slice(bytes),
            move || {
                disconnects_clone.fetch_add(1, Ordering::SeqCst);
            },
        ));

        TaskHarness {
            remote,
            cmd_tx,
            state,
            output,
            disconnects,
        }
    }

    async fn settle() {
        // Let the relay task observe what we just wrote.
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_task_streams_after_accept() {
        let mut harness = spawn_task();
        harness
            .remote
            .write_all(b"HTTP/1.0 101 UPGRADED\r\n\r\nwelcome")
            .await
            .unwrap();
        settle().await;

        assert_eq!(get_state(&harness.state), TunnelState::Streaming);
        assert_eq!(harness.output.lock().unwrap().as_slice(), b"welcome");

        harness.remote.write_all(b" home").await.unwrap();
        settle().await;
        assert_eq!(harness.output.lock().unwrap().as_slice(), b"welcome home");
    }

    #[tokio::test]
    async fn test_task_relays_input_once_streaming() {
        let mut harness = spawn_task();

        // Input before the handshake completes is dropped, not buffered.
        harness
            .cmd_tx
            .send(TunnelCommand::Write(b"early".to_vec()))
            .await
            .unwrap();
        settle().await;
        harness
            .remote
            .write_all(b"HTTP/1.0 101 UPGRADED\r\n\r\n")
            .await
            .unwrap();
        settle().await;

        harness
            .cmd_tx
            .send(TunnelCommand::Write(b"ls\n".to_vec()))
            .await
            .unwrap();
        settle().await;

        let mut relayed = vec![0u8; 16];
        let n = harness.remote.read(&mut relayed).await.unwrap();
        assert_eq!(&relayed[..n], b"ls\n");
    }

    #[tokio::test]
    async fn test_task_rejection_never_reaches_output() {
        let mut harness = spawn_task();
        harness
            .remote
            .write_all(b"HTTP/1.0 200 OK\r\n\r\nnot for you")
            .await
            .unwrap();
        settle().await;

        assert_eq!(get_state(&harness.state), TunnelState::Rejected);
        assert!(harness.output.lock().unwrap().is_empty());
        // No disconnect signal either; callers observe the state themselves.
        assert_eq!(harness.disconnects.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_task_disconnect_fires_once_on_channel_end() {
        let mut harness = spawn_task();
        harness
            .remote
            .write_all(b"HTTP/1.0 101 UPGRADED\r\n\r\n")
            .await
            .unwrap();
        settle().await;

        drop(harness.remote);
        settle().await;

        assert_eq!(get_state(&harness.state), TunnelState::Closed);
        assert_eq!(harness.disconnects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_task_close_command_fires_disconnect() {
        let harness = spawn_task();
        harness.cmd_tx.send(TunnelCommand::Close).await.unwrap();
        settle().await;

        assert_eq!(get_state(&harness.state), TunnelState::Closed);
        assert_eq!(harness.disconnects.load(Ordering::SeqCst), 1);
    }
}
