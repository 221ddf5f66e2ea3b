//! Scripted fake engine for tests
//!
//! [`ScriptedEngine`] binds a real Unix socket laid out like a per-user
//! engine socket (`<runtime dir>/podman/podman.sock`), captures every
//! request it receives, and answers each connection from a queue of
//! [`ScriptedExchange`] entries. Tests point `XDG_RUNTIME_DIR` at
//! [`runtime_dir`](ScriptedEngine::runtime_dir) (under `#[serial]`, the env
//! var is process-global) and talk to it through `Scope::User` exactly like
//! production code.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};

use crate::framing::find_header_end;

/// One scripted answer: response chunks written in order, then either EOF or
/// a held-open socket.
#[derive(Debug, Clone)]
pub struct ScriptedExchange {
    chunks: Vec<Vec<u8>>,
    chunk_delay: Option<Duration>,
    hold_open: bool,
}

impl ScriptedExchange {
    /// Answer with one contiguous response, then EOF.
    pub fn reply(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            chunks: vec![bytes.into()],
            chunk_delay: None,
            hold_open: false,
        }
    }

    /// Answer with the response split into the given chunks, then EOF.
    pub fn chunked(chunks: Vec<Vec<u8>>) -> Self {
        Self {
            chunks,
            chunk_delay: None,
            hold_open: false,
        }
    }

    /// Accept the request and never answer (timeout and cancellation tests).
    pub fn silence() -> Self {
        Self {
            chunks: Vec::new(),
            chunk_delay: None,
            hold_open: true,
        }
    }

    /// Keep the socket open after the scripted chunks instead of EOF,
    /// capturing whatever the client sends (tunnels, mid-stream closes).
    pub fn hold_open(mut self) -> Self {
        self.hold_open = true;
        self
    }

    /// Sleep between chunks so the client observes real fragmentation.
    pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = Some(delay);
        self
    }
}

impl Default for ScriptedExchange {
    fn default() -> Self {
        Self::reply(ok_response(""))
    }
}

/// A fake engine behind a real Unix socket.
pub struct ScriptedEngine {
    // Owns the socket's directory; dropped last.
    _dir: tempfile::TempDir,
    runtime_dir: PathBuf,
    requests: Arc<Mutex<Vec<String>>>,
    scripts: Arc<Mutex<VecDeque<ScriptedExchange>>>,
    tunnel_input: Arc<Mutex<Vec<u8>>>,
}

impl ScriptedEngine {
    /// Bind the socket and start accepting connections. Connections are
    /// matched to scripted exchanges in accept order; an unscripted
    /// connection gets an empty 200.
    pub async fn start() -> Self {
        let dir = tempfile::tempdir().expect("create scripted engine dir");
        let runtime_dir = dir.path().to_path_buf();
        let socket = runtime_dir.join("podman").join("podman.sock");
        std::fs::create_dir_all(socket.parent().expect("socket parent"))
            .expect("create socket dir");
        let listener = UnixListener::bind(&socket).expect("bind scripted engine socket");

        let requests = Arc::new(Mutex::new(Vec::new()));
        let scripts = Arc::new(Mutex::new(VecDeque::new()));
        let tunnel_input = Arc::new(Mutex::new(Vec::new()));
        tokio::spawn(accept_loop(
            listener,
            Arc::clone(&requests),
            Arc::clone(&scripts),
            Arc::clone(&tunnel_input),
        ));

        Self {
            _dir: dir,
            runtime_dir,
            requests,
            scripts,
            tunnel_input,
        }
    }

    /// The directory to use as `XDG_RUNTIME_DIR`.
    pub fn runtime_dir(&self) -> &Path {
        &self.runtime_dir
    }

    /// Point `Scope::User` resolution at this engine.
    pub fn install_runtime_dir(&self) {
        std::env::set_var("XDG_RUNTIME_DIR", &self.runtime_dir);
    }

    /// Queue the answer for the next unmatched connection.
    pub fn expect(&self, exchange: ScriptedExchange) {
        self.scripts.lock().unwrap().push_back(exchange);
    }

    /// Every request received so far, as raw text (head and body).
    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }

    /// Bytes the client sent after its request on held-open sockets
    /// (keystrokes and control bytes relayed through a tunnel).
    pub fn tunnel_input(&self) -> Vec<u8> {
        self.tunnel_input.lock().unwrap().clone()
    }
}

async fn accept_loop(
    listener: UnixListener,
    requests: Arc<Mutex<Vec<String>>>,
    scripts: Arc<Mutex<VecDeque<ScriptedExchange>>>,
    tunnel_input: Arc<Mutex<Vec<u8>>>,
) {
    loop {
        let Ok((stream, _)) = listener.accept().await else {
            return;
        };
        let exchange = scripts.lock().unwrap().pop_front().unwrap_or_default();
        tokio::spawn(serve(
            stream,
            exchange,
            Arc::clone(&requests),
            Arc::clone(&tunnel_input),
        ));
    }
}

async fn serve(
    mut stream: UnixStream,
    exchange: ScriptedExchange,
    requests: Arc<Mutex<Vec<String>>>,
    tunnel_input: Arc<Mutex<Vec<u8>>>,
) {
    let Some(request) = read_request(&mut stream).await else {
        return;
    };
    requests.lock().unwrap().push(request);

    for (index, chunk) in exchange.chunks.iter().enumerate() {
        if index > 0 {
            if let Some(delay) = exchange.chunk_delay {
                tokio::time::sleep(delay).await;
            }
        }
        if stream.write_all(chunk).await.is_err() {
            return;
        }
    }

    if exchange.hold_open {
        let mut chunk = [0u8; 256];
        loop {
            match stream.read(&mut chunk).await {
                Ok(0) | Err(_) => return,
                Ok(n) => tunnel_input.lock().unwrap().extend_from_slice(&chunk[..n]),
            }
        }
    }
}

/// Read one request: headers to `\r\n\r\n`, then `Content-Length` body bytes.
async fn read_request(stream: &mut UnixStream) -> Option<String> {
    let mut buffer = Vec::new();
    let mut chunk = [0u8; 4096];
    let (head_end, content_length) = loop {
        if let Some(end) = find_header_end(&buffer) {
            let head = String::from_utf8_lossy(&buffer[..end]);
            let length = head
                .lines()
                .find_map(|line| {
                    let (name, value) = line.split_once(':')?;
                    if !name.trim().eq_ignore_ascii_case("content-length") {
                        return None;
                    }
                    value.trim().parse::<usize>().ok()
                })
                .unwrap_or(0);
            break (end, length);
        }
        match stream.read(&mut chunk).await {
            Ok(0) | Err(_) => return None,
            Ok(n) => buffer.extend_from_slice(&chunk[..n]),
        }
    };
    while buffer.len() < head_end + content_length {
        match stream.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => buffer.extend_from_slice(&chunk[..n]),
        }
    }
    Some(String::from_utf8_lossy(&buffer).into_owned())
}

// ---------------------------------------------------------------------------
// Canned responses
// ---------------------------------------------------------------------------

/// A complete HTTP/1.0 response with a `Content-Length` body.
pub fn response(status: u16, reason: &str, body: &str) -> Vec<u8> {
    format!(
        "HTTP/1.0 {status} {reason}\r\nContent-Length: {}\r\n\r\n{body}",
        body.len()
    )
    .into_bytes()
}

pub fn ok_response(body: &str) -> Vec<u8> {
    response(200, "OK", body)
}

pub fn error_response(status: u16, reason: &str, body: &str) -> Vec<u8> {
    response(status, reason, body)
}

/// A 200 head without `Content-Length`: the body runs until EOF, which is
/// how the streaming endpoints answer.
pub fn stream_head() -> Vec<u8> {
    b"HTTP/1.0 200 OK\r\n\r\n".to_vec()
}

/// An accepted upgrade head with `remainder` bundled in the same chunk.
pub fn upgrade_response(remainder: &[u8]) -> Vec<u8> {
    let mut bytes = b"HTTP/1.0 101 UPGRADED\r\n\r\n".to_vec();
    bytes.extend_from_slice(remainder);
    bytes
}
