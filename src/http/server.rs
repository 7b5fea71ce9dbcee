//! Non-blocking HTTP/1.1 server (spec.md §4.2).
//!
//! A cooperative accept loop driven by `tokio`: one task per connection,
//! handlers are plain synchronous closures (CPU-bound XML work is fine per
//! spec.md §5, network I/O never happens inside a handler). Connections are
//! kept open across requests unless the client sends `Connection: close` or
//! the handler asks for it by setting that header in its response.

use crate::error::Result;
use crate::http::parser::{Flags, Method, Parser, ParserType};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;

const MAX_HEADER_BYTES: usize = 16 * 1024;

#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    pub flags: Flags,
}

impl Request {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(f, _)| f.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

pub type Handler = Arc<dyn Fn(&Request) -> Vec<u8> + Send + Sync>;

#[derive(Clone)]
struct HostedFile {
    content_type: String,
    data: Arc<Vec<u8>>,
}

struct Shared {
    handlers: AsyncMutex<HashMap<Method, Handler>>,
    files: AsyncMutex<HashMap<String, HostedFile>>,
}

pub struct Server {
    local_addr: SocketAddr,
    shared: Arc<Shared>,
    accept_task: Option<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
    connections: Arc<AsyncMutex<Vec<JoinHandle<()>>>>,
}

impl Server {
    /// Binds `addr` (port 0 picks an ephemeral port) and starts accepting.
    pub async fn start(addr: SocketAddr) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;

        let shared = Arc::new(Shared {
            handlers: AsyncMutex::new(HashMap::new()),
            files: AsyncMutex::new(HashMap::new()),
        });
        let shutdown = Arc::new(AtomicBool::new(false));
        let connections = Arc::new(AsyncMutex::new(Vec::new()));

        let accept_shared = shared.clone();
        let accept_shutdown = shutdown.clone();
        let accept_connections = connections.clone();
        let accept_task = tokio::spawn(async move {
            loop {
                if accept_shutdown.load(Ordering::SeqCst) {
                    return;
                }
                match listener.accept().await {
                    Ok((stream, _peer)) => {
                        let shared = accept_shared.clone();
                        let handle =
                            tokio::spawn(async move { handle_connection(stream, shared).await });
                        accept_connections.lock().await.push(handle);
                    }
                    Err(_) => return,
                }
            }
        });

        Ok(Self {
            local_addr,
            shared,
            accept_task: Some(accept_task),
            shutdown,
            connections,
        })
    }

    pub fn get_address(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn set_request_handler(&self, method: Method, handler: Handler) {
        self.shared.handlers.lock().await.insert(method, handler);
    }

    pub async fn add_file(&self, path: impl Into<String>, content_type: impl Into<String>, data: Vec<u8>) {
        self.shared.files.lock().await.insert(
            path.into(),
            HostedFile {
                content_type: content_type.into(),
                data: Arc::new(data),
            },
        );
    }

    pub async fn remove_file(&self, path: &str) {
        self.shared.files.lock().await.remove(path);
    }

    /// Closes the listening socket and every in-flight connection, then
    /// runs `cb` once the last handle has been released.
    pub async fn stop(mut self, cb: impl FnOnce() + Send + 'static) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(task) = self.accept_task.take() {
            task.abort();
        }
        let mut conns = self.connections.lock().await;
        for handle in conns.drain(..) {
            handle.abort();
        }
        cb();
    }
}

async fn handle_connection(mut stream: TcpStream, shared: Arc<Shared>) {
    loop {
        let mut parser = Parser::new(ParserType::Request);
        let headers_done = Arc::new(AtomicBool::new(false));
        {
            let flag = headers_done.clone();
            parser.set_headers_complete_callback(move || {
                flag.store(true, Ordering::SeqCst);
            });
        }

        let mut buf = [0u8; 4096];
        let mut total_read = 0usize;
        let mut rejected = false;

        loop {
            let n = match stream.read(&mut buf).await {
                Ok(0) => return,
                Ok(n) => n,
                Err(_) => return,
            };
            total_read += n;

            if !headers_done.load(Ordering::SeqCst) && total_read > MAX_HEADER_BYTES {
                let _ = write_status_only(&mut stream, 431, "Request Header Fields Too Large").await;
                rejected = true;
                break;
            }

            if parser.parse(&buf[..n]).is_err() {
                return;
            }
            if parser.is_completed() {
                break;
            }
        }

        if rejected {
            return;
        }
        if !parser.is_completed() {
            return;
        }

        let request = Request {
            method: parser.method(),
            url: parser.url().to_string(),
            headers: parser
                .headers()
                .iter()
                .map(|h| (h.field.clone(), h.value.clone()))
                .collect(),
            body: parser.steal_body(),
            flags: parser.flags(),
        };

        let response = dispatch(&request, &shared).await;
        let close = request.flags.contains(Flags::CONNECTION_CLOSE);

        if stream.write_all(&response).await.is_err() {
            return;
        }

        if close {
            return;
        }
    }
}

async fn dispatch(request: &Request, shared: &Shared) -> Vec<u8> {
    if matches!(request.method, Method::Get | Method::Head) {
        if let Some(resp) = serve_hosted_file(request, shared).await {
            return resp;
        }
    }

    let handler = shared.handlers.lock().await.get(&request.method).cloned();
    match handler {
        Some(handler) => handler(request),
        None => error_response(404, "Not Found"),
    }
}

async fn serve_hosted_file(request: &Request, shared: &Shared) -> Option<Vec<u8>> {
    let file = shared.files.lock().await.get(&request.url).cloned()?;

    if let Some(range) = request.header("Range") {
        if let Ok(range) = Parser::parse_range(range) {
            let len = file.data.len() as u64;
            let end = range.end.unwrap_or(len.saturating_sub(1)).min(len.saturating_sub(1));
            if range.start <= end {
                let body: Vec<u8> = if request.method == Method::Head {
                    Vec::new()
                } else {
                    file.data[range.start as usize..=end as usize].to_vec()
                };
                let mut out = format!(
                    "HTTP/1.1 206 Partial Content\r\nCONTENT-TYPE: {}\r\nCONTENT-RANGE: bytes {}-{}/{}\r\nCONTENT-LENGTH: {}\r\nACCEPT-RANGES: bytes\r\n\r\n",
                    file.content_type,
                    range.start,
                    end,
                    len,
                    body.len()
                )
                .into_bytes();
                out.extend_from_slice(&body);
                return Some(out);
            }
        }
    }

    let body: Vec<u8> = if request.method == Method::Head {
        Vec::new()
    } else {
        file.data.as_ref().clone()
    };
    let mut out = format!(
        "HTTP/1.1 200 OK\r\nCONTENT-TYPE: {}\r\nCONTENT-LENGTH: {}\r\nACCEPT-RANGES: bytes\r\n\r\n",
        file.content_type,
        file.data.len()
    )
    .into_bytes();
    out.extend_from_slice(&body);
    Some(out)
}

async fn write_status_only(stream: &mut TcpStream, status: u16, reason: &str) -> Result<()> {
    let body = error_response(status, reason);
    stream.write_all(&body).await?;
    Ok(())
}

pub fn error_response(status: u16, reason: &str) -> Vec<u8> {
    let body = format!("<html><body><h1>{status} {reason}</h1></body></html>");
    format!(
        "HTTP/1.1 {status} {reason}\r\nCONTENT-TYPE: text/html\r\nCONTENT-LENGTH: {}\r\n\r\n{body}",
        body.len()
    )
    .into_bytes()
}

pub fn ok_html_response() -> Vec<u8> {
    let body = "<html><body><h1>200 OK</h1></body></html>";
    format!(
        "HTTP/1.1 200 OK\r\nCONTENT-LENGTH: {}\r\nCONTENT-TYPE: text/html\r\n\r\n{body}",
        body.len()
    )
    .into_bytes()
}
