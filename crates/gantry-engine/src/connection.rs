//! Single-shot and streaming exchanges with the engine
//!
//! A [`Connection`] binds one [`Scope`] and serves sequential exchanges
//! against it: buffered request/response calls ([`Connection::call`],
//! [`Connection::call_json`]) and long-lived monitors that hand the response
//! body to a callback ([`Connection::monitor_records`],
//! [`Connection::monitor_raw`]). All methods take `&mut self`, so two
//! in-flight operations on one Connection cannot be expressed; that is the
//! statically checked form of the "never call this in parallel" contract.
//!
//! The owner must close what it opens. The module-level [`call`] and
//! [`call_json`] wrappers are the scoped form: open a fresh Connection, run
//! one exchange, close unconditionally.

use std::sync::{Arc, RwLock};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::sync::watch;

use gantry_core::prelude::*;
use gantry_core::EngineError;

use crate::address::Scope;
use crate::framing::RecordFramer;
use crate::http::{read_body, read_head, READ_CHUNK};
use crate::request::Request;

// ---------------------------------------------------------------------------
// Diagnostics
// ---------------------------------------------------------------------------

/// Per-connection diagnostic state: the call-sequence counter and the
/// repeated-error suppression.
///
/// Sequence ids exist for log correlation only; they have no protocol
/// effect. Error dedup keeps a reconnect loop from flooding the log with the
/// same failure: [`note_error`](Diagnostics::note_error) answers whether a
/// failure differs from the previous one and should be logged, and any
/// success resets the suppression.
#[derive(Debug, Default)]
pub struct Diagnostics {
    last_seq: u64,
    last_error: Option<String>,
}

impl Diagnostics {
    /// Allocate the next call-sequence id.
    pub fn next_seq(&mut self) -> u64 {
        self.last_seq += 1;
        self.last_seq
    }

    /// Record a failure; returns `true` when it differs from the previous
    /// one and deserves a log line.
    pub fn note_error(&mut self, message: &str) -> bool {
        if self.last_error.as_deref() == Some(message) {
            return false;
        }
        self.last_error = Some(message.to_string());
        true
    }

    /// Record a success, re-arming the error dedup.
    pub fn note_success(&mut self) {
        self.last_error = None;
    }
}

// ---------------------------------------------------------------------------
// Connection
// ---------------------------------------------------------------------------

/// Lifecycle state of a [`Connection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Created but no exchange performed yet.
    Unopened,
    /// At least one exchange has run; the Connection is usable.
    Open,
    /// Closed by its owner; every further operation fails with
    /// [`Error::Closed`].
    Closed,
}

/// One client binding to an engine instance.
///
/// The Connection object is the reusable piece: it carries the scope, the
/// diagnostic state, and the close signal across sequential exchanges. Each
/// exchange resolves the socket address fresh (an environment change takes
/// effect on the next call) and opens its own socket, since the engine
/// speaks one HTTP/1.0 exchange per connection.
pub struct Connection {
    scope: Scope,
    diagnostics: Diagnostics,
    state: Arc<RwLock<ConnectionState>>,
    close_tx: Arc<watch::Sender<bool>>,
    close_rx: watch::Receiver<bool>,
}

/// Cloneable handle for cancelling a [`Connection`] that is busy elsewhere.
///
/// A monitor borrows its Connection mutably for its whole lifetime; the
/// handle, taken beforehand, is how the owner closes it mid-stream.
#[derive(Clone)]
pub struct ConnectionHandle {
    state: Arc<RwLock<ConnectionState>>,
    close_tx: Arc<watch::Sender<bool>>,
}

impl ConnectionHandle {
    /// Close the Connection. Returns immediately; a pending call or monitor
    /// observes the signal and settles with [`Error::Closed`]. Idempotent.
    pub fn close(&self) {
        set_state(&self.state, ConnectionState::Closed);
        let _ = self.close_tx.send(true);
    }

    pub fn state(&self) -> ConnectionState {
        get_state(&self.state)
    }
}

fn get_state(state: &Arc<RwLock<ConnectionState>>) -> ConnectionState {
    *state.read().unwrap_or_else(|e| e.into_inner())
}

fn set_state(state: &Arc<RwLock<ConnectionState>>, next: ConnectionState) {
    let mut guard = state.write().unwrap_or_else(|e| e.into_inner());
    *guard = next;
}

impl Connection {
    pub fn new(scope: Scope) -> Self {
        let (close_tx, close_rx) = watch::channel(false);
        Self {
            scope,
            diagnostics: Diagnostics::default(),
            state: Arc::new(RwLock::new(ConnectionState::Unopened)),
            close_tx: Arc::new(close_tx),
            close_rx,
        }
    }

    pub fn scope(&self) -> Scope {
        self.scope
    }

    pub fn state(&self) -> ConnectionState {
        get_state(&self.state)
    }

    /// A handle that can close this Connection while a monitor borrows it.
    pub fn handle(&self) -> ConnectionHandle {
        ConnectionHandle {
            state: Arc::clone(&self.state),
            close_tx: Arc::clone(&self.close_tx),
        }
    }

    /// Close this Connection. Idempotent; see [`ConnectionHandle::close`].
    pub fn close(&mut self) {
        set_state(&self.state, ConnectionState::Closed);
        let _ = self.close_tx.send(true);
    }

    // ── Single-shot calls ─────────────────────────────────────────────────

    /// Perform one request/response exchange and return the body as text.
    ///
    /// The entire response is buffered before anything is handed back. An
    /// error status (>= 400) buffers the body all the same and rejects with
    /// an [`EngineError`] normalized from it; a channel failure mid-body
    /// normalizes whatever partial body was captured.
    pub async fn call(&mut self, request: Request) -> Result<String> {
        let seq = self.diagnostics.next_seq();
        debug!(
            seq,
            scope = %self.scope,
            method = request.method().as_str(),
            path = request.path(),
            "engine call"
        );
        let result = self.perform_call(&request).await;
        match &result {
            Ok(_) => self.diagnostics.note_success(),
            Err(err) => {
                let text = err.to_string();
                if self.diagnostics.note_error(&text) {
                    warn!(seq, scope = %self.scope, path = request.path(), error = %text, "engine call failed");
                }
            }
        }
        result
    }

    /// Perform one exchange and parse the body as JSON.
    ///
    /// A body that is not valid JSON is a protocol or programmer error and
    /// propagates as [`Error::Json`], not as a normalized engine error; the
    /// transport exchange itself succeeded.
    pub async fn call_json(&mut self, request: Request) -> Result<serde_json::Value> {
        let text = self.call(request).await?;
        Ok(serde_json::from_str(&text)?)
    }

    async fn perform_call(&mut self, request: &Request) -> Result<String> {
        let mut stream = self.open_socket().await?;
        stream
            .write_all(&request.encode())
            .await
            .map_err(|err| Error::engine(EngineError::from_io(&err)))?;

        let mut close_rx = self.close_rx.clone();
        let (head, remainder) = tokio::select! {
            biased;
            _ = close_rx.changed() => return Err(Error::Closed),
            result = read_head(&mut stream) => result?,
        };
        let body = tokio::select! {
            biased;
            _ = close_rx.changed() => return Err(Error::Closed),
            result = read_body(&mut stream, &head, remainder) => result,
        };

        match body {
            Ok(body) if head.is_error() => Err(Error::engine(
                EngineError::from_status(head.status, &head.reason).normalize(&body),
            )),
            Ok(body) => String::from_utf8(body)
                .map_err(|_| Error::protocol("response body is not valid UTF-8")),
            Err((partial, err)) => {
                Err(Error::engine(EngineError::from_io(&err).normalize(&partial)))
            }
        }
    }

    // ── Streaming monitors ────────────────────────────────────────────────

    /// Perform a long-lived exchange whose body is a `\n`-delimited stream
    /// of JSON records, invoking `on_record` once per decoded record.
    ///
    /// Records are reassembled across arbitrary chunk boundaries before
    /// decoding. A record that fails to parse indicates a broken server and
    /// terminates the monitor with the parse error; a callback returning an
    /// error terminates it likewise. Clean end-of-stream resolves `Ok(())`;
    /// closing the Connection settles the monitor with [`Error::Closed`] and
    /// no further callback invocations.
    pub async fn monitor_records(
        &mut self,
        request: Request,
        mut on_record: impl FnMut(serde_json::Value) -> Result<()>,
    ) -> Result<()> {
        let seq = self.diagnostics.next_seq();
        debug!(seq, scope = %self.scope, path = request.path(), "monitor records");

        let (mut stream, mut close_rx, remainder) = self.start_stream(&request).await?;
        let mut framer = RecordFramer::lines();
        framer.push(&remainder);
        drain_records(&mut framer, &close_rx, &mut on_record)?;

        let mut chunk = [0u8; READ_CHUNK];
        loop {
            tokio::select! {
                biased;
                _ = close_rx.changed() => return Err(Error::Closed),
                read = stream.read(&mut chunk) => match read {
                    Ok(0) => {
                        // A final record may end at EOF instead of at a
                        // delimiter.
                        let tail = framer.take_remainder();
                        if !tail.iter().all(u8::is_ascii_whitespace) {
                            if *close_rx.borrow() {
                                return Err(Error::Closed);
                            }
                            on_record(serde_json::from_slice(&tail)?)?;
                        }
                        return Ok(());
                    }
                    Ok(n) => {
                        framer.push(&chunk[..n]);
                        drain_records(&mut framer, &close_rx, &mut on_record)?;
                    }
                    Err(err) => return Err(Error::engine(EngineError::from_io(&err))),
                },
            }
        }
    }

    /// Perform a long-lived exchange, invoking `on_chunk` with each incoming
    /// body chunk as-is (log tailing wants the raw bytes, not records).
    ///
    /// Settles the same way as [`monitor_records`](Self::monitor_records).
    pub async fn monitor_raw(
        &mut self,
        request: Request,
        mut on_chunk: impl FnMut(&[u8]) -> Result<()>,
    ) -> Result<()> {
        let seq = self.diagnostics.next_seq();
        debug!(seq, scope = %self.scope, path = request.path(), "monitor raw");

        let (mut stream, mut close_rx, remainder) = self.start_stream(&request).await?;
        if !remainder.is_empty() {
            on_chunk(&remainder)?;
        }

        let mut chunk = [0u8; READ_CHUNK];
        loop {
            tokio::select! {
                biased;
                _ = close_rx.changed() => return Err(Error::Closed),
                read = stream.read(&mut chunk) => match read {
                    Ok(0) => return Ok(()),
                    Ok(n) => on_chunk(&chunk[..n])?,
                    Err(err) => return Err(Error::engine(EngineError::from_io(&err))),
                },
            }
        }
    }

    /// Open the socket, send the request, and validate the response head.
    ///
    /// An error status buffers the body and rejects through the normalizer
    /// exactly like a single-shot call. Returns the socket, the close
    /// signal, and any body bytes that arrived bundled with the head.
    async fn start_stream(
        &mut self,
        request: &Request,
    ) -> Result<(UnixStream, watch::Receiver<bool>, Vec<u8>)> {
        let mut stream = self.open_socket().await?;
        stream
            .write_all(&request.encode())
            .await
            .map_err(|err| Error::engine(EngineError::from_io(&err)))?;

        let mut close_rx = self.close_rx.clone();
        let (head, remainder) = tokio::select! {
            biased;
            _ = close_rx.changed() => return Err(Error::Closed),
            result = read_head(&mut stream) => result?,
        };
        if head.is_error() {
            let body = match read_body(&mut stream, &head, remainder).await {
                Ok(body) => body,
                Err((partial, _)) => partial,
            };
            return Err(Error::engine(
                EngineError::from_status(head.status, &head.reason).normalize(&body),
            ));
        }
        Ok((stream, close_rx, remainder))
    }

    async fn open_socket(&mut self) -> Result<UnixStream> {
        if self.state() == ConnectionState::Closed {
            return Err(Error::Closed);
        }
        // Resolved per exchange, never cached.
        let path = self.scope.socket_path()?;
        let stream = UnixStream::connect(&path)
            .await
            .map_err(|err| Error::engine(EngineError::from_io(&err)))?;
        set_state(&self.state, ConnectionState::Open);
        Ok(stream)
    }
}

fn drain_records(
    framer: &mut RecordFramer,
    close_rx: &watch::Receiver<bool>,
    on_record: &mut impl FnMut(serde_json::Value) -> Result<()>,
) -> Result<()> {
    while let Some(record) = framer.next_record() {
        // Blank separator lines carry no record.
        if record.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        // A close issued from inside the callback stops delivery even for
        // records already buffered from the same chunk.
        if *close_rx.borrow() {
            return Err(Error::Closed);
        }
        on_record(serde_json::from_slice(&record)?)?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Scoped one-shot wrappers
// ---------------------------------------------------------------------------

/// Open a Connection, perform one call, and close it unconditionally.
pub async fn call(scope: Scope, request: Request) -> Result<String> {
    let mut connection = Connection::new(scope);
    let result = connection.call(request).await;
    connection.close();
    result
}

/// Open a Connection, perform one JSON call, and close it unconditionally.
pub async fn call_json(scope: Scope, request: Request) -> Result<serde_json::Value> {
    let mut connection = Connection::new(scope);
    let result = connection.call_json(request).await;
    connection.close();
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_diagnostics_sequence_is_monotonic() {
        let mut diagnostics = Diagnostics::default();
        assert_eq!(diagnostics.next_seq(), 1);
        assert_eq!(diagnostics.next_seq(), 2);
        assert_eq!(diagnostics.next_seq(), 3);
    }

    #[test]
    fn test_diagnostics_suppresses_repeated_errors() {
        let mut diagnostics = Diagnostics::default();
        assert!(diagnostics.note_error("connection refused"));
        assert!(!diagnostics.note_error("connection refused"));
        assert!(!diagnostics.note_error("connection refused"));

        // A different failure logs again.
        assert!(diagnostics.note_error("permission denied"));
        assert!(!diagnostics.note_error("permission denied"));
    }

    #[test]
    fn test_diagnostics_success_resets_suppression() {
        let mut diagnostics = Diagnostics::default();
        assert!(diagnostics.note_error("connection refused"));
        diagnostics.note_success();
        assert!(diagnostics.note_error("connection refused"));
    }

    #[test]
    fn test_connection_starts_unopened() {
        let connection = Connection::new(Scope::System);
        assert_eq!(connection.state(), ConnectionState::Unopened);
        assert_eq!(connection.scope(), Scope::System);
    }

    #[test]
    fn test_close_is_idempotent() {
        let mut connection = Connection::new(Scope::System);
        connection.close();
        connection.close();
        assert_eq!(connection.state(), ConnectionState::Closed);
    }

    #[test]
    fn test_handle_closes_connection() {
        let connection = Connection::new(Scope::System);
        let handle = connection.handle();
        assert_eq!(handle.state(), ConnectionState::Unopened);
        handle.close();
        assert_eq!(connection.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_call_on_closed_connection_fails() {
        let mut connection = Connection::new(Scope::System);
        connection.close();
        let err = connection.call(Request::get("/v1.12/libpod/info")).await.unwrap_err();
        assert!(matches!(err, Error::Closed));
    }

    #[tokio::test]
    async fn test_monitor_on_closed_connection_fails() {
        let mut connection = Connection::new(Scope::System);
        connection.close();
        let err = connection
            .monitor_raw(Request::get("/v1.12/libpod/events"), |_| Ok(()))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Closed));
    }

    #[test]
    fn test_drain_records_skips_blank_lines() {
        let (_close_tx, close_rx) = watch::channel(false);
        let mut framer = RecordFramer::lines();
        framer.push(b"{\"a\":1}\n\n  \n{\"b\":2}\n");
        let mut seen = Vec::new();
        drain_records(&mut framer, &close_rx, &mut |value| {
            seen.push(value);
            Ok(())
        })
        .unwrap();
        assert_eq!(seen, vec![serde_json::json!({"a": 1}), serde_json::json!({"b": 2})]);
    }

    #[test]
    fn test_drain_records_rejects_malformed_record() {
        let (_close_tx, close_rx) = watch::channel(false);
        let mut framer = RecordFramer::lines();
        framer.push(b"{\"ok\":true}\nnot json\n");
        let mut seen = 0;
        let err = drain_records(&mut framer, &close_rx, &mut |_| {
            seen += 1;
            Ok(())
        })
        .unwrap_err();
        assert!(matches!(err, Error::Json(_)));
        assert_eq!(seen, 1);
    }

    #[test]
    fn test_drain_records_stops_after_close() {
        let (close_tx, close_rx) = watch::channel(false);
        let mut framer = RecordFramer::lines();
        framer.push(b"{\"n\":1}\n{\"n\":2}\n{\"n\":3}\n");
        let mut seen = 0;
        let err = drain_records(&mut framer, &close_rx, &mut |_| {
            seen += 1;
            if seen == 2 {
                close_tx.send(true).unwrap();
            }
            Ok(())
        })
        .unwrap_err();
        assert!(matches!(err, Error::Closed));
        assert_eq!(seen, 2);
    }
}
