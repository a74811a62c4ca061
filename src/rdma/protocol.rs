//! Wire framing for the verbs transport. Both records are little-endian
//! and packed; a request is one SEND, a response is a header SEND followed
//! by `content_len` bytes split into SENDs of at most `chunk_size`.

pub const OP_GET: u8 = 1;
pub const OP_PING: u8 = 2;

/// `op: u8, path_len: u16`
pub const REQ_HEADER_LEN: usize = 3;
/// `status: u16, content_len: u64, chunk_size: u32`
pub const RESP_HEADER_LEN: usize = 14;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Get,
    Ping,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub op: Op,
    pub path: String,
}

/// Parses one request SEND. `None` is a framing error: short header, a
/// `path_len` past the end of the payload, an unknown op, or a non-UTF-8
/// path.
pub fn parse_request(data: &[u8]) -> Option<Request> {
    if data.len() < REQ_HEADER_LEN {
        return None;
    }
    let path_len = u16::from_le_bytes([data[1], data[2]]) as usize;
    if REQ_HEADER_LEN + path_len > data.len() {
        return None;
    }
    match data[0] {
        OP_GET => {
            let path = std::str::from_utf8(&data[REQ_HEADER_LEN..REQ_HEADER_LEN + path_len]).ok()?;
            Some(Request {
                op: Op::Get,
                path: path.to_string(),
            })
        }
        OP_PING => Some(Request {
            op: Op::Ping,
            path: String::new(),
        }),
        _ => None,
    }
}

pub fn make_request_bytes(req: &Request) -> Vec<u8> {
    let path: &[u8] = match req.op {
        Op::Get => req.path.as_bytes(),
        Op::Ping => &[],
    };
    let mut out = Vec::with_capacity(REQ_HEADER_LEN + path.len());
    out.push(match req.op {
        Op::Get => OP_GET,
        Op::Ping => OP_PING,
    });
    out.extend_from_slice(&(path.len() as u16).to_le_bytes());
    out.extend_from_slice(path);
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RespHeader {
    pub status: u16,
    pub content_len: u64,
    pub chunk_size: u32,
}

pub fn make_resp_header(status: u16, content_len: u64, chunk_size: u32) -> [u8; RESP_HEADER_LEN] {
    let mut out = [0u8; RESP_HEADER_LEN];
    out[0..2].copy_from_slice(&status.to_le_bytes());
    out[2..10].copy_from_slice(&content_len.to_le_bytes());
    out[10..14].copy_from_slice(&chunk_size.to_le_bytes());
    out
}

pub fn parse_resp_header(data: &[u8]) -> Option<RespHeader> {
    if data.len() < RESP_HEADER_LEN {
        return None;
    }
    Some(RespHeader {
        status: u16::from_le_bytes([data[0], data[1]]),
        content_len: u64::from_le_bytes(data[2..10].try_into().ok()?),
        chunk_size: u32::from_le_bytes(data[10..14].try_into().ok()?),
    })
}

/// Body SEND size for a `content_len`-byte body: the configured cap
/// clamped to `[1, content_len]` (1 when the body is empty, in which case
/// no body SENDs follow anyway).
pub fn chunk_for(send_chunk: usize, content_len: u64) -> u32 {
    (send_chunk as u64).min(content_len).max(1) as u32
}
