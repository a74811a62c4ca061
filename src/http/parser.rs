use rustc_hash::FxHashMap;

/// A parsed request head. No body is ever consumed; the server only
/// serves GET and HEAD.
#[derive(Debug, Clone, Default)]
pub struct HttpRequest {
    pub method: String,
    pub target: String,
    pub version: String,
    pub headers: FxHashMap<String, String>,
    pub keep_alive: bool,
}

impl HttpRequest {
    /// Case-insensitive header lookup; names are stored lowercased.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }
}

#[derive(Debug)]
pub enum ParseResult {
    Incomplete,
    Done(HttpRequest),
    BadRequest,
}

/// Incremental HTTP/1.1 request parser over a growing byte buffer.
///
/// Bytes after a parsed head are retained for the next request, so
/// pipelined requests arriving in one read are all recovered by calling
/// `parse` again with an empty slice.
pub struct HttpParser {
    buf: Vec<u8>,
    max_start_line: usize,
    max_header_bytes: usize,
}

const HEAD_TERMINATOR: &[u8] = b"\r\n\r\n";

impl HttpParser {
    pub fn new(max_start_line: usize, max_header_bytes: usize) -> Self {
        Self {
            buf: Vec::with_capacity(1024),
            max_start_line,
            max_header_bytes,
        }
    }

    pub fn reset(&mut self) {
        self.buf.clear();
    }

    pub fn parse(&mut self, data: &[u8]) -> ParseResult {
        self.buf.extend_from_slice(data);

        let pos = match find(&self.buf, HEAD_TERMINATOR) {
            Some(pos) => pos,
            None => {
                if self.buf.len() > self.max_start_line + self.max_header_bytes + 4 {
                    return ParseResult::BadRequest;
                }
                return ParseResult::Incomplete;
            }
        };

        let head: Vec<u8> = self.buf.drain(..pos + HEAD_TERMINATOR.len()).collect();
        let head = &head[..pos];
        match self.parse_head(head) {
            Some(req) => ParseResult::Done(req),
            None => ParseResult::BadRequest,
        }
    }

    fn parse_head(&self, head: &[u8]) -> Option<HttpRequest> {
        let head = std::str::from_utf8(head).ok()?;
        let mut lines = head.split("\r\n");

        let request_line = lines.next()?;
        if request_line.len() > self.max_start_line {
            return None;
        }

        // Exactly three tokens separated by single spaces.
        let mut tokens = request_line.split(' ');
        let method = tokens.next()?;
        let target = tokens.next()?;
        let version = tokens.next()?;
        if tokens.next().is_some() {
            return None;
        }
        if method.is_empty() || target.is_empty() || !version.starts_with("HTTP/") {
            return None;
        }
        if !method.bytes().all(is_token_char) {
            return None;
        }

        let mut headers = FxHashMap::default();
        let mut total_bytes = 0usize;
        for line in lines {
            total_bytes += line.len();
            if total_bytes > self.max_header_bytes {
                return None;
            }
            if line.is_empty() {
                continue;
            }
            let colon = line.find(':')?;
            let name = line[..colon].to_ascii_lowercase();
            let value = line[colon + 1..].trim().to_string();
            headers.insert(name, value);
        }

        let conn = headers.get("connection").map(String::as_str).unwrap_or("");
        let keep_alive = if version == "HTTP/1.1" {
            !conn.eq_ignore_ascii_case("close")
        } else {
            conn.eq_ignore_ascii_case("keep-alive")
        };

        Some(HttpRequest {
            method: method.to_string(),
            target: target.to_string(),
            version: version.to_string(),
            headers,
            keep_alive,
        })
    }
}

fn is_token_char(c: u8) -> bool {
    const SEPARATORS: &[u8] = b"()<>@,;:\\\"/[]?={} \t";
    c > 31 && c < 127 && !SEPARATORS.contains(&c)
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
