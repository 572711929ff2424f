use crate::host::VirtualHost;
use crate::request::Response;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Instant, SystemTime};

/// Cached file entry
struct CachedFile {
    body: Bytes,
    etag: String,
    last_modified: String,
    cached_at: Instant,
}

/// Global file cache (path -> cached entry)
static FILE_CACHE: Lazy<RwLock<HashMap<PathBuf, CachedFile>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

/// Cache TTL, re-check file modification time after this duration
const CACHE_TTL_SECS: u64 = 5;

/// Conditional request headers.
#[derive(Debug, Default, Clone, Copy)]
pub struct Conditions<'a> {
    pub if_modified_since: Option<&'a str>,
    pub if_none_match: Option<&'a str>,
}

/// Resolve a directory request to its index file.
pub fn resolve_index(path: &Path, index: &str) -> PathBuf {
    if path.is_dir() {
        path.join(index)
    } else {
        path.to_path_buf()
    }
}

/// Serve a file under the host's document root with in-memory caching.
///
/// - Refuses anything that resolves outside the document root
/// - Content type comes from the host's mime table
/// - Returns 304 Not Modified if `If-None-Match` or `If-Modified-Since` matches
/// - Returns None if the file does not exist
pub fn serve_static_file(
    host: &VirtualHost,
    file_path: &Path,
    cond: Conditions<'_>,
) -> Option<Response> {
    let root = host.document_root()?;

    // Canonicalize to prevent path traversal
    let canonical = file_path.canonicalize().ok()?;
    let base_canonical = root.canonicalize().ok()?;
    if !canonical.starts_with(&base_canonical) {
        log::warn!(
            "Path traversal attempt: {} resolved to {}",
            file_path.display(),
            canonical.display()
        );
        return None;
    }

    if !canonical.is_file() {
        return None;
    }

    let mime = host.lookup_mime_type(
        canonical
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or(""),
    );

    // Try to serve from cache
    let now = Instant::now();
    {
        let cache = FILE_CACHE.read();
        if let Some(cached) = cache.get(&canonical) {
            if now.duration_since(cached.cached_at).as_secs() < CACHE_TTL_SECS {
                return Some(respond(
                    &cached.body,
                    &mime,
                    &cached.etag,
                    &cached.last_modified,
                    cond,
                ));
            }
        }
    }

    // Cache miss or stale, read from disk
    let metadata = std::fs::metadata(&canonical).ok()?;
    let modified: DateTime<Utc> = metadata
        .modified()
        .unwrap_or(SystemTime::UNIX_EPOCH)
        .into();
    let last_modified = modified.format("%a, %d %b %Y %H:%M:%S GMT").to_string();
    let etag = VirtualHost::entity_tag(&canonical)?;
    let body = Bytes::from(std::fs::read(&canonical).ok()?);

    let resp = respond(&body, &mime, &etag, &last_modified, cond);

    FILE_CACHE.write().insert(
        canonical,
        CachedFile {
            body,
            etag,
            last_modified,
            cached_at: now,
        },
    );
    Some(resp)
}

fn not_modified(etag: &str, last_modified: &str, cond: Conditions<'_>) -> bool {
    if let Some(inm) = cond.if_none_match {
        return inm
            .split(',')
            .map(|t| t.trim().trim_start_matches("W/").trim_matches('"'))
            .any(|t| t == "*" || t == etag);
    }
    cond.if_modified_since == Some(last_modified)
}

fn respond(
    body: &Bytes,
    mime: &str,
    etag: &str,
    last_modified: &str,
    cond: Conditions<'_>,
) -> Response {
    let resp = if not_modified(etag, last_modified, cond) {
        Response::new(304)
    } else {
        Response::new(200).with_body(mime, body.clone())
    };
    resp.with_header("ETag", format!("\"{}\"", etag))
        .with_header("Last-Modified", last_modified)
}
