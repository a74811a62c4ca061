use std::collections::VecDeque;
use std::io::{self, IoSlice};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use log::info;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{sleep_until, timeout, Instant};

use crate::cache::{CacheEntry, LruCache};
use crate::config::Config;
use crate::fs::{make_etag, map_url_to_fs, read_file};
use crate::http::parser::{HttpParser, HttpRequest, ParseResult};
use crate::http::response::{http_date, HttpResponse};
use crate::metrics::metrics;
use crate::mime::mime_type_for;

const READ_BUF_SIZE: usize = 8192;

const HEALTH_BODY: &[u8] = br#"{"status":"healthy"}"#;
const READY_BODY: &[u8] = br#"{"status":"ready"}"#;

/// One accepted TCP connection: read -> parse -> dispatch -> write, with
/// pipelining. The whole lifecycle runs inside a single task, so responses
/// are emitted strictly in the order their requests finished parsing.
pub struct Session {
    stream: TcpStream,
    cfg: Arc<Config>,
    cache: Arc<LruCache>,
    parser: HttpParser,
    pending: VecDeque<HttpRequest>,
    closing_after: bool,
}

impl Session {
    pub fn new(stream: TcpStream, cfg: Arc<Config>, cache: Arc<LruCache>) -> Self {
        let parser = HttpParser::new(cfg.max_request_line, cfg.max_header_bytes);
        Self {
            stream,
            cfg,
            cache,
            parser,
            pending: VecDeque::new(),
            closing_after: false,
        }
    }

    pub async fn run(mut self) {
        let read_timeout = Duration::from_millis(self.cfg.read_timeout_ms);
        let keepalive = Duration::from_millis(self.cfg.keepalive_timeout_ms);
        let mut idle_deadline = Instant::now() + keepalive;
        let mut inbuf = vec![0u8; READ_BUF_SIZE];

        'conn: loop {
            // Pipelined queue drains before the next read; a write error
            // tears the whole session down.
            while let Some(req) = self.pending.pop_front() {
                if self.handle_request(req).await.is_err() {
                    break 'conn;
                }
                if self.closing_after {
                    break 'conn;
                }
            }

            let read = tokio::select! {
                r = timeout(read_timeout, self.stream.read(&mut inbuf)) => r,
                _ = sleep_until(idle_deadline) => {
                    info!("idle timeout, closing connection");
                    break 'conn;
                }
            };
            let n = match read {
                Err(_) => {
                    info!("read timeout, closing connection");
                    break 'conn;
                }
                Ok(Ok(0)) | Ok(Err(_)) => break 'conn,
                Ok(Ok(n)) => n,
            };
            idle_deadline = Instant::now() + keepalive;

            let mut res = self.parser.parse(&inbuf[..n]);
            loop {
                match res {
                    ParseResult::BadRequest => {
                        self.pending.clear();
                        self.closing_after = true;
                        let _ = self.respond_error(400, "Bad Request", false).await;
                        break 'conn;
                    }
                    ParseResult::Incomplete => break,
                    ParseResult::Done(req) => {
                        self.pending.push_back(req);
                        res = self.parser.parse(&[]);
                    }
                }
            }
        }

        let _ = self.stream.shutdown().await;
    }

    async fn handle_request(&mut self, req: HttpRequest) -> io::Result<()> {
        let keep_alive = req.keep_alive;
        if !keep_alive {
            self.closing_after = true;
            self.pending.clear();
        }

        if req.method == "GET" && req.target == "/metrics" {
            let body: Arc<[u8]> = metrics().render_text().into_bytes().into();
            let resp = HttpResponse::new(200)
                .header("Content-Type", "text/plain; charset=utf-8".to_string())
                .header("Content-Length", body.len().to_string())
                .header("Connection", connection_token(keep_alive).to_string());
            return self.write_response(resp.serialize_headers(), body).await;
        }

        if req.method != "GET" && req.method != "HEAD" {
            return self.respond_error(405, "Method Not Allowed", keep_alive).await;
        }
        let is_head = req.method == "HEAD";

        if req.target == "/health" || req.target == "/ready" {
            let full: &[u8] = if req.target == "/health" {
                HEALTH_BODY
            } else {
                READY_BODY
            };
            let resp = HttpResponse::new(200)
                .header("Content-Type", "application/json".to_string())
                .header("Content-Length", full.len().to_string())
                .header("Connection", connection_token(keep_alive).to_string());
            let body: Arc<[u8]> = if is_head { Arc::from(vec![]) } else { full.into() };
            return self.write_response(resp.serialize_headers(), body).await;
        }

        let mapped = match map_url_to_fs(&self.cfg.doc_root, &req.target) {
            Ok(m) => m,
            Err(e) => return self.respond_error(400, &e.to_string(), keep_alive).await,
        };
        if !mapped.exists {
            return self.respond_error(404, "Not Found", keep_alive).await;
        }

        let entry = match self.cache.get(&mapped.cache_key) {
            Some(entry) => {
                metrics().cache_hits.fetch_add(1, Ordering::Relaxed);
                entry
            }
            None => {
                metrics().cache_misses.fetch_add(1, Ordering::Relaxed);
                let path = mapped.fs_path.clone();
                let read = tokio::task::spawn_blocking(move || read_file(&path)).await;
                let contents = match read {
                    Ok(Ok(contents)) => contents,
                    Ok(Err(e)) => {
                        return self.respond_error(500, &e.to_string(), keep_alive).await
                    }
                    Err(_) => return self.respond_error(500, "Read failed", keep_alive).await,
                };
                let body: Arc<[u8]> = contents.data.into();
                let etag = make_etag(body.len(), contents.last_modified);
                let entry = CacheEntry::new(body, contents.last_modified, etag);
                self.cache.put(mapped.cache_key.clone(), entry.clone());
                entry
            }
        };

        let resp = HttpResponse::new(200)
            .header("Content-Type", mime_type_for(&mapped.fs_path).to_string())
            .header("Content-Length", entry.size.to_string())
            .header("Connection", connection_token(keep_alive).to_string())
            .header("Last-Modified", http_date(entry.last_modified))
            .header("ETag", entry.etag.clone());

        let body: Arc<[u8]> = if is_head {
            Arc::from(vec![])
        } else {
            entry.body.clone()
        };

        metrics().responses_2xx.fetch_add(1, Ordering::Relaxed);
        metrics()
            .bytes_served
            .fetch_add(body.len() as u64, Ordering::Relaxed);
        self.write_response(resp.serialize_headers(), body).await
    }

    async fn respond_error(
        &mut self,
        status: u16,
        message: &str,
        keep_alive: bool,
    ) -> io::Result<()> {
        let payload = format!("{} {}\n", status, message);
        let body: Arc<[u8]> = payload.into_bytes().into();

        if status >= 500 {
            metrics().responses_5xx.fetch_add(1, Ordering::Relaxed);
        } else {
            metrics().responses_4xx.fetch_add(1, Ordering::Relaxed);
        }

        let resp = HttpResponse::new(status)
            .header("Content-Type", "text/plain; charset=utf-8".to_string())
            .header("Content-Length", body.len().to_string())
            .header("Connection", connection_token(keep_alive).to_string());
        self.write_response(resp.serialize_headers(), body).await
    }

    /// Scatter-gather write of (head, body) under one write timeout. Both
    /// buffers stay alive for the full write; the body is the same
    /// allocation the cache holds.
    async fn write_response(&mut self, head: String, body: Arc<[u8]>) -> io::Result<()> {
        let write_timeout = Duration::from_millis(self.cfg.write_timeout_ms);
        let write = write_all_vectored(&mut self.stream, head.as_bytes(), &body);
        match timeout(write_timeout, write).await {
            Ok(res) => res,
            Err(_) => {
                info!("write timeout, closing connection");
                Err(io::Error::new(io::ErrorKind::TimedOut, "write timeout"))
            }
        }
    }
}

/// Gathered write of two buffers in one syscall where the socket allows,
/// resuming across partial writes until every byte of both is on the wire.
async fn write_all_vectored(
    stream: &mut TcpStream,
    head: &[u8],
    body: &[u8],
) -> io::Result<()> {
    let total = head.len() + body.len();
    let mut written = 0;
    while written < total {
        let n = if written < head.len() {
            let bufs = [IoSlice::new(&head[written..]), IoSlice::new(body)];
            stream.write_vectored(&bufs).await?
        } else {
            let bufs = [IoSlice::new(&body[written - head.len()..])];
            stream.write_vectored(&bufs).await?
        };
        if n == 0 {
            return Err(io::ErrorKind::WriteZero.into());
        }
        written += n;
    }
    stream.flush().await
}

fn connection_token(keep_alive: bool) -> &'static str {
    if keep_alive {
        "keep-alive"
    } else {
        "close"
    }
}
