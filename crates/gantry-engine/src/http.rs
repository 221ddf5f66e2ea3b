//! Minimal HTTP/1.0 response handling
//!
//! The engine answers every exchange with a status line, a header block
//! terminated by `\r\n\r\n`, and a body delimited by `Content-Length` or by
//! end-of-stream. That is the entire dialect this client needs: requests go
//! out as HTTP/1.0, so there is no chunked coding and no keep-alive.

use std::collections::HashMap;

use tokio::io::{AsyncRead, AsyncReadExt};

use gantry_core::prelude::*;
use gantry_core::EngineError;

use crate::framing::find_header_end;

/// Read buffer size for response streaming.
pub(crate) const READ_CHUNK: usize = 8192;

/// Parsed response status line and headers.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseHead {
    pub status: u16,
    pub reason: String,
    headers: HashMap<String, String>,
}

impl ResponseHead {
    /// Parse a header block: the bytes before the `\r\n\r\n` terminator.
    pub fn parse(head: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(head)
            .map_err(|_| Error::protocol("response head is not valid UTF-8"))?;
        let mut lines = text.split("\r\n");
        let status_line = lines.next().unwrap_or_default();
        let (status, reason) = parse_status_line(status_line)?;

        let mut headers = HashMap::new();
        for line in lines.filter(|line| !line.is_empty()) {
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| Error::protocol(format!("malformed header line: {line:?}")))?;
            headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
        }

        Ok(Self {
            status,
            reason,
            headers,
        })
    }

    /// Look up a header by case-insensitive name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    /// The declared body length, when the engine sent one.
    pub fn content_length(&self) -> Option<usize> {
        self.header("content-length")?.parse().ok()
    }

    pub fn is_error(&self) -> bool {
        self.status >= 400
    }
}

/// Second whitespace-delimited token of a status line.
///
/// This is the code the upgrade tunnel gates on (`101`) and the code plain
/// exchanges parse the numeric status from.
pub fn status_token(line: &str) -> Option<&str> {
    line.split_ascii_whitespace().nth(1)
}

fn parse_status_line(line: &str) -> Result<(u16, String)> {
    let token = status_token(line)
        .ok_or_else(|| Error::protocol(format!("malformed status line: {line:?}")))?;
    let status = token
        .parse()
        .map_err(|_| Error::protocol(format!("non-numeric status {token:?} in {line:?}")))?;
    let reason = line
        .split_ascii_whitespace()
        .skip(2)
        .collect::<Vec<_>>()
        .join(" ");
    Ok((status, reason))
}

/// Read from `stream` until the header terminator, then parse the head.
///
/// Returns the head and any body bytes that arrived past the boundary in
/// the same reads. IO failures become transport engine errors; an EOF before
/// the terminator is a protocol violation.
pub(crate) async fn read_head<S>(stream: &mut S) -> Result<(ResponseHead, Vec<u8>)>
where
    S: AsyncRead + Unpin,
{
    let mut buffer = Vec::with_capacity(1024);
    let mut chunk = [0u8; READ_CHUNK];
    loop {
        if let Some(end) = find_header_end(&buffer) {
            let head = ResponseHead::parse(&buffer[..end - 4])?;
            let remainder = buffer.split_off(end);
            return Ok((head, remainder));
        }
        let n = stream
            .read(&mut chunk)
            .await
            .map_err(|err| Error::Engine(EngineError::from_io(&err)))?;
        if n == 0 {
            return Err(Error::protocol(
                "connection closed before response headers completed",
            ));
        }
        buffer.extend_from_slice(&chunk[..n]);
    }
}

/// Accumulate the response body: `Content-Length` bytes when declared,
/// otherwise everything until end-of-stream.
///
/// `body` seeds the buffer with bytes already read past the head. On IO
/// failure, or an EOF short of the declared length, the partial body is
/// handed back with the error so the caller can still run it through error
/// normalization.
pub(crate) async fn read_body<S>(
    stream: &mut S,
    head: &ResponseHead,
    mut body: Vec<u8>,
) -> std::result::Result<Vec<u8>, (Vec<u8>, std::io::Error)>
where
    S: AsyncRead + Unpin,
{
    let expected = head.content_length();
    let mut chunk = [0u8; READ_CHUNK];
    loop {
        if let Some(expected) = expected {
            if body.len() >= expected {
                body.truncate(expected);
                return Ok(body);
            }
        }
        match stream.read(&mut chunk).await {
            Ok(0) => {
                // EOF short of the declared length is a broken channel, not
                // a complete body.
                if let Some(expected) = expected {
                    let err = std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        format!("body ended after {} of {expected} declared bytes", body.len()),
                    );
                    return Err((body, err));
                }
                return Ok(body);
            }
            Ok(n) => body.extend_from_slice(&chunk[..n]),
            Err(err) => return Err((body, err)),
        }
    }
}
