use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use thiserror::Error;

/// Result of mapping a URL path into the document root.
#[derive(Debug, Clone)]
pub struct PathMap {
    pub fs_path: PathBuf,
    pub cache_key: String,
    pub exists: bool,
}

#[derive(Debug, Error)]
pub enum MapError {
    #[error("Document root not found")]
    DocRootNotFound,
    #[error("Path traversal")]
    Traversal,
}

/// Strips query/fragment, resolves `.` and `..` and rejoins with `/`.
/// Always returns a leading-slash path; `/` stays `/`. The boolean is true
/// when a `..` tried to climb above the root.
fn sanitize(url_path: &str) -> (String, bool) {
    let p = match url_path.find(['?', '#']) {
        Some(pos) => &url_path[..pos],
        None => url_path,
    };

    let mut parts: Vec<&str> = Vec::new();
    let mut escaped = false;
    for part in p.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                if parts.pop().is_none() {
                    escaped = true;
                }
            }
            _ => parts.push(part),
        }
    }

    let mut out = String::with_capacity(p.len() + 1);
    out.push('/');
    out.push_str(&parts.join("/"));
    (out, escaped)
}

/// Maps a request target to a canonical filesystem path confined under
/// `doc_root`, plus the canonical cache key. `exists` is true iff the
/// target is an existing regular file.
pub fn map_url_to_fs(doc_root: &Path, url_path: &str) -> Result<PathMap, MapError> {
    let root = fs::canonicalize(doc_root).map_err(|_| MapError::DocRootNotFound)?;
    if !root.is_dir() {
        return Err(MapError::DocRootNotFound);
    }

    let (sanitized, escaped) = sanitize(url_path);
    if escaped {
        return Err(MapError::Traversal);
    }
    let rel = if sanitized == "/" {
        "index.html"
    } else {
        &sanitized[1..]
    };
    let target = root.join(rel);

    // Resolve symlinks for existing targets; non-existent targets stay
    // lexical, which the sanitizer already confines to the root.
    let canon = fs::canonicalize(&target).unwrap_or(target);
    if !canon.starts_with(&root) {
        return Err(MapError::Traversal);
    }

    let exists = canon.is_file();
    let cache_key = if sanitized == "/" {
        "/index.html".to_string()
    } else {
        sanitized
    };

    Ok(PathMap {
        fs_path: canon,
        cache_key,
        exists,
    })
}

#[derive(Debug, Clone)]
pub struct FileContents {
    pub data: Vec<u8>,
    pub last_modified: i64,
}

#[derive(Debug, Error)]
pub enum FileReadError {
    #[error("File not found")]
    NotFound,
    #[error("Open failed: {0}")]
    Open(io::Error),
    #[error("Read failed: {0}")]
    Read(io::Error),
}

/// Reads a regular file in full, along with its last-modified time as
/// seconds since the epoch. Empty files succeed with an empty buffer.
pub fn read_file(path: &Path) -> Result<FileContents, FileReadError> {
    let meta = match fs::metadata(path) {
        Ok(m) if m.is_file() => m,
        _ => return Err(FileReadError::NotFound),
    };

    let mut file = fs::File::open(path).map_err(FileReadError::Open)?;
    let mut data = Vec::with_capacity(meta.len() as usize);
    file.read_to_end(&mut data).map_err(FileReadError::Read)?;

    let last_modified = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(SystemTime::UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);

    Ok(FileContents {
        data,
        last_modified,
    })
}

/// Weak validator formed from body size and last-modified time.
pub fn make_etag(size: usize, mtime: i64) -> String {
    format!("W/\"{}-{}\"", size, mtime)
}
