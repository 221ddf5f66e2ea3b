//! Request descriptors for the engine REST API

use std::fmt::Write as _;

use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};

/// Query-component escape set: everything but RFC 3986 unreserved characters.
const QUERY: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

/// HTTP method of a [`Request`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Delete,
    Put,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Delete => "DELETE",
            Method::Put => "PUT",
        }
    }
}

/// One REST request: method, path, query params, body.
///
/// Built fresh per call with the by-value builder below and never mutated
/// after dispatch.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    method: Method,
    path: String,
    params: Vec<(String, String)>,
    body: String,
}

impl Request {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            params: Vec::new(),
            body: String::new(),
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::Get, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::Post, path)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::Delete, path)
    }

    /// Append one query parameter.
    pub fn param(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.params.push((key.into(), value.to_string()));
        self
    }

    /// Set the request body.
    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    /// Set a JSON value as the request body.
    pub fn json_body(self, value: &serde_json::Value) -> Self {
        self.body(value.to_string())
    }

    pub fn method(&self) -> Method {
        self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Path plus percent-encoded query string: the request-line target.
    pub fn target(&self) -> String {
        if self.params.is_empty() {
            return self.path.clone();
        }
        let mut target = format!("{}?", self.path);
        for (index, (key, value)) in self.params.iter().enumerate() {
            if index > 0 {
                target.push('&');
            }
            let _ = write!(
                target,
                "{}={}",
                utf8_percent_encode(key, QUERY),
                utf8_percent_encode(value, QUERY)
            );
        }
        target
    }

    /// Encode as a plain HTTP/1.0 exchange.
    pub fn encode(&self) -> Vec<u8> {
        let mut head = format!("{} {} HTTP/1.0\r\n", self.method.as_str(), self.target());
        if !self.body.is_empty() {
            head.push_str("Content-Type: application/json\r\n");
        }
        let _ = write!(head, "Content-Length: {}\r\n\r\n", self.body.len());
        let mut bytes = head.into_bytes();
        bytes.extend_from_slice(self.body.as_bytes());
        bytes
    }

    /// Encode as an Upgrade handshake (the exec/attach tunnels).
    ///
    /// The header block is fixed: `Upgrade: WebSocket`, `Connection:
    /// Upgrade`, then the body length. The engine answers with a status line
    /// whose second token must be `101` before any tunnel bytes flow.
    pub fn encode_upgrade(&self) -> Vec<u8> {
        let head = format!(
            "{} {} HTTP/1.0\r\nUpgrade: WebSocket\r\nConnection: Upgrade\r\nContent-Length: {}\r\n\r\n",
            self.method.as_str(),
            self.target(),
            self.body.len()
        );
        let mut bytes = head.into_bytes();
        bytes.extend_from_slice(self.body.as_bytes());
        bytes
    }
}
