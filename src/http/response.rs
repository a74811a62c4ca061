use std::time::SystemTime;

pub fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        400 => "Bad Request",
        404 => "Not Found",
        405 => "Method Not Allowed",
        _ => "Internal Server Error",
    }
}

/// Formats an epoch-seconds timestamp as an HTTP date.
pub fn http_date(secs: i64) -> String {
    let t = if secs <= 0 {
        SystemTime::UNIX_EPOCH
    } else {
        SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(secs as u64)
    };
    httpdate::fmt_http_date(t)
}

/// Status line plus header block; the body travels separately so cached
/// bodies are never copied into the head.
#[derive(Debug)]
pub struct HttpResponse {
    pub status: u16,
    pub reason: &'static str,
    headers: Vec<(&'static str, String)>,
}

impl HttpResponse {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            reason: reason_phrase(status),
            headers: Vec::with_capacity(8),
        }
    }

    pub fn header(mut self, name: &'static str, value: String) -> Self {
        self.headers.push((name, value));
        self
    }

    /// `HTTP/1.1 <status> <reason>` + `Date` + headers in insertion order.
    pub fn serialize_headers(&self) -> String {
        let mut h = String::with_capacity(256);
        h.push_str("HTTP/1.1 ");
        h.push_str(&self.status.to_string());
        h.push(' ');
        h.push_str(self.reason);
        h.push_str("\r\n");
        h.push_str("Date: ");
        h.push_str(&httpdate::fmt_http_date(SystemTime::now()));
        h.push_str("\r\n");
        for (name, value) in &self.headers {
            h.push_str(name);
            h.push_str(": ");
            h.push_str(value);
            h.push_str("\r\n");
        }
        h.push_str("\r\n");
        h
    }
}
