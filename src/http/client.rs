//! Non-blocking HTTP/1.1 client (spec.md §4.2).
//!
//! One [`Client`] owns a small pool of keep-alive connections keyed by
//! `host:port`. Requests are never pipelined: a connection is checked out,
//! used for exactly one request/response, and returned to the pool only if
//! the response permits reuse.

use crate::error::{Error, Result};
use crate::http::parser::{Flags, Parser, ParserType};
use std::collections::HashMap;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use url::Url;

#[derive(Debug, Clone, Default)]
pub struct Response {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Response {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(f, _)| f.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// A request range, mirroring the `Range: bytes=start-end` grammar.
#[derive(Debug, Clone, Copy)]
pub struct ByteRange {
    pub start: u64,
    pub end: Option<u64>,
}

impl ByteRange {
    pub fn header_value(&self) -> String {
        match self.end {
            Some(end) => format!("bytes={}-{}", self.start, end),
            None => format!("bytes={}-", self.start),
        }
    }
}

pub struct Client {
    timeout: Duration,
    pool: Mutex<HashMap<String, TcpStream>>,
}

impl Client {
    pub fn new() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            pool: Mutex::new(HashMap::new()),
        }
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    pub async fn request(
        &self,
        method: &str,
        url: &Url,
        headers: &[(&str, &str)],
        body: Option<&[u8]>,
    ) -> Result<Response> {
        tokio::time::timeout(self.timeout, self.request_inner(method, url, headers, body))
            .await
            .map_err(|_| Error::Timeout)?
    }

    /// Same as [`Client::request`] but streams the response body into
    /// `sink` instead of accumulating it in the returned `Response::body`
    /// (`Response::body` is left empty in that case).
    pub async fn request_streamed(
        &self,
        method: &str,
        url: &Url,
        headers: &[(&str, &str)],
        body: Option<&[u8]>,
        sink: &mut Vec<u8>,
    ) -> Result<Response> {
        tokio::time::timeout(
            self.timeout,
            self.request_inner_streamed(method, url, headers, body, Some(sink)),
        )
        .await
        .map_err(|_| Error::Timeout)?
    }

    async fn request_inner(
        &self,
        method: &str,
        url: &Url,
        headers: &[(&str, &str)],
        body: Option<&[u8]>,
    ) -> Result<Response> {
        self.request_inner_streamed(method, url, headers, body, None)
            .await
    }

    async fn request_inner_streamed(
        &self,
        method: &str,
        url: &Url,
        headers: &[(&str, &str)],
        body: Option<&[u8]>,
        mut sink: Option<&mut Vec<u8>>,
    ) -> Result<Response> {
        let key = authority(url)?;
        let mut stream = self.checkout(&key, url).await?;

        let request = build_request(method, url, headers, body);
        if let Err(err) = stream.write_all(&request).await {
            // A pooled connection might have gone stale; retry once fresh.
            let _ = err;
            stream = connect(url).await?;
            stream.write_all(&request).await?;
        }

        let mut parser = Parser::new(ParserType::Response);
        let mut buf = [0u8; 4096];
        loop {
            let n = stream.read(&mut buf).await?;
            if n == 0 {
                parser.notify_eof();
                break;
            }
            parser.parse(&buf[..n])?;
            if parser.is_completed() {
                break;
            }
        }

        if !parser.is_completed() {
            return Err(Error::InvalidResponse);
        }

        let status = parser.status();
        let response_headers: Vec<(String, String)> = parser
            .headers()
            .iter()
            .map(|h| (h.field.clone(), h.value.clone()))
            .collect();
        let response_body = parser.steal_body();

        if let Some(sink) = sink.as_deref_mut() {
            sink.extend_from_slice(&response_body);
        }

        let keep_alive = parser.flags().contains(Flags::KEEP_ALIVE)
            && !parser.flags().contains(Flags::CONNECTION_CLOSE);
        if keep_alive {
            self.pool.lock().await.insert(key, stream);
        }

        Ok(Response {
            status,
            headers: response_headers,
            body: if sink.is_some() {
                Vec::new()
            } else {
                response_body
            },
        })
    }

    async fn checkout(&self, key: &str, url: &Url) -> Result<TcpStream> {
        if let Some(stream) = self.pool.lock().await.remove(key) {
            return Ok(stream);
        }
        connect(url).await
    }
}

impl Default for Client {
    fn default() -> Self {
        Self::new()
    }
}

fn authority(url: &Url) -> Result<String> {
    let host = url.host_str().ok_or(Error::InvalidResponse)?;
    let port = url.port_or_known_default().unwrap_or(80);
    Ok(format!("{host}:{port}"))
}

async fn connect(url: &Url) -> Result<TcpStream> {
    let addr = authority(url)?;
    Ok(TcpStream::connect(addr).await?)
}

fn build_request(method: &str, url: &Url, headers: &[(&str, &str)], body: Option<&[u8]>) -> Vec<u8> {
    let path = if url.query().is_some() {
        format!("{}?{}", url.path(), url.query().unwrap())
    } else {
        url.path().to_string()
    };
    let host = match url.port() {
        Some(port) => format!("{}:{port}", url.host_str().unwrap_or("")),
        None => url.host_str().unwrap_or("").to_string(),
    };

    let mut out = format!("{method} {path} HTTP/1.1\r\nHOST: {host}\r\n");
    let mut has_content_length = false;
    for (name, value) in headers {
        if name.eq_ignore_ascii_case("content-length") {
            has_content_length = true;
        }
        out.push_str(name);
        out.push_str(": ");
        out.push_str(value);
        out.push_str("\r\n");
    }
    let body = body.unwrap_or(&[]);
    if !has_content_length {
        out.push_str(&format!("CONTENT-LENGTH: {}\r\n", body.len()));
    }
    out.push_str("\r\n");

    let mut bytes = out.into_bytes();
    bytes.extend_from_slice(body);
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_range_header_closed() {
        let r = ByteRange { start: 0, end: Some(499) };
        assert_eq!(r.header_value(), "bytes=0-499");
    }

    #[test]
    fn byte_range_header_open() {
        let r = ByteRange { start: 512, end: None };
        assert_eq!(r.header_value(), "bytes=512-");
    }

    #[test]
    fn build_request_includes_content_length() {
        let url: Url = "http://127.0.0.1:1400/ctrl".parse().unwrap();
        let req = build_request("POST", &url, &[("X-Test", "1")], Some(b"abc"));
        let text = String::from_utf8(req).unwrap();
        assert!(text.starts_with("POST /ctrl HTTP/1.1\r\n"));
        assert!(text.contains("HOST: 127.0.0.1:1400\r\n"));
        assert!(text.contains("X-Test: 1\r\n"));
        assert!(text.contains("CONTENT-LENGTH: 3\r\n"));
        assert!(text.ends_with("abc"));
    }
}
