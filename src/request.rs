//! HTTP/1.x request heads and serialized responses.

use bytes::Bytes;
use http::StatusCode;

pub const MAX_HEADERS: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub method: String,
    pub uri: String,
    /// Minor version: 0 for HTTP/1.0, 1 for HTTP/1.1.
    pub version: u8,
    pub headers: Vec<(String, String)>,
}

impl Request {
    /// Parse a request head. `Ok(None)` means more bytes are needed; on
    /// success the head length is returned with the request.
    pub fn parse(buf: &[u8]) -> Result<Option<(Request, usize)>, httparse::Error> {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut req = httparse::Request::new(&mut headers);
        match req.parse(buf)? {
            httparse::Status::Partial => Ok(None),
            httparse::Status::Complete(len) => {
                let request = Request {
                    method: req.method.unwrap_or("GET").to_string(),
                    uri: req.path.unwrap_or("/").to_string(),
                    version: req.version.unwrap_or(1),
                    headers: req
                        .headers
                        .iter()
                        .map(|h| {
                            (
                                h.name.to_string(),
                                String::from_utf8_lossy(h.value).trim().to_string(),
                            )
                        })
                        .collect(),
                };
                Ok(Some((request, len)))
            }
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn host(&self) -> Option<&str> {
        self.header("host")
    }

    /// `(scheme, details)` from the Authorization header.
    pub fn authorization(&self) -> Option<(&str, &str)> {
        let value = self.header("authorization")?;
        match value.split_once(char::is_whitespace) {
            Some((scheme, details)) => Some((scheme, details.trim())),
            None => Some((value, "")),
        }
    }

    pub fn content_length(&self) -> usize {
        self.header("content-length")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
    }

    /// Whether the client wants the connection kept open after this request.
    pub fn wants_keep_alive(&self) -> bool {
        let connection = self.header("connection").map(str::to_ascii_lowercase);
        match self.version {
            0 => connection.map_or(false, |c| c.contains("keep-alive")),
            _ => connection.map_or(true, |c| !c.contains("close")),
        }
    }

    /// Path part of the URI, still encoded.
    pub fn path(&self) -> &str {
        self.uri.split(['?', '#']).next().unwrap_or("/")
    }

    /// Decoded canonical path used for routing, storage and auth. `None`
    /// when the path cannot be served safely.
    pub fn canonical_path(&self) -> Option<String> {
        normalize_path(self.path())
    }

    pub fn request_line(&self) -> String {
        format!("{} {} HTTP/1.{}", self.method, self.uri, self.version)
    }
}

/// Percent-decode `raw` and collapse empty and `.` segments. Rejects
/// malformed escapes, NUL bytes, invalid UTF-8 and any `..` segment.
pub fn normalize_path(raw: &str) -> Option<String> {
    let bytes = raw.as_bytes();
    let mut decoded = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' => {
                let hex = bytes.get(i + 1..i + 3)?;
                if !hex.iter().all(u8::is_ascii_hexdigit) {
                    return None;
                }
                let hex = std::str::from_utf8(hex).ok()?;
                decoded.push(u8::from_str_radix(hex, 16).ok()?);
                i += 3;
            }
            b => {
                decoded.push(b);
                i += 1;
            }
        }
    }
    if decoded.contains(&0) {
        return None;
    }
    let decoded = String::from_utf8(decoded).ok()?;

    let mut segments = Vec::new();
    for segment in decoded.split(['/', '\\']) {
        match segment {
            "" | "." => {}
            ".." => return None,
            s => segments.push(s),
        }
    }
    let mut path = format!("/{}", segments.join("/"));
    let trailing = decoded.ends_with('/') || decoded.ends_with("/.");
    if trailing && !segments.is_empty() {
        path.push('/');
    }
    Some(path)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
    /// Send headers only (HEAD).
    pub head_only: bool,
}

impl Response {
    pub fn new(status: u16) -> Self {
        Response {
            status,
            headers: Vec::new(),
            body: Bytes::new(),
            head_only: false,
        }
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.set_header(name, value);
        self
    }

    pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        match self
            .headers
            .iter_mut()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
        {
            Some(entry) => entry.1 = value,
            None => self.headers.push((name.to_string(), value)),
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn with_body(mut self, content_type: &str, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self.set_header("Content-Type", content_type);
        self
    }

    pub fn reason(&self) -> &'static str {
        StatusCode::from_u16(self.status)
            .ok()
            .and_then(|s| s.canonical_reason())
            .unwrap_or("Unknown")
    }

    /// Bytes sent as the body, zero for HEAD.
    pub fn body_len(&self) -> usize {
        if self.head_only {
            0
        } else {
            self.body.len()
        }
    }

    /// Status line, headers and body ready for the wire.
    pub fn serialize(&self, server: &str, keep_alive: bool) -> Vec<u8> {
        let mut head = format!("HTTP/1.1 {} {}\r\n", self.status, self.reason());
        head.push_str(&format!("Server: {}\r\n", server));
        head.push_str(&format!(
            "Date: {}\r\n",
            chrono::Utc::now().format("%a, %d %b %Y %H:%M:%S GMT")
        ));
        for (k, v) in &self.headers {
            head.push_str(&format!("{}: {}\r\n", k, v));
        }
        if self.header("content-length").is_none() {
            head.push_str(&format!("Content-Length: {}\r\n", self.body.len()));
        }
        head.push_str(if keep_alive {
            "Connection: keep-alive\r\n"
        } else {
            "Connection: close\r\n"
        });
        head.push_str("\r\n");

        let mut out = head.into_bytes();
        if !self.head_only {
            out.extend_from_slice(&self.body);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_complete_head() {
        let raw = b"GET /a/b?x=1 HTTP/1.1\r\nHost: a.example.com:8443\r\nAuthorization: Basic YWxpY2U6c2VjcmV0\r\n\r\nbody";
        let (req, len) = Request::parse(raw).unwrap().unwrap();
        assert_eq!(len, raw.len() - 4);
        assert_eq!(req.method, "GET");
        assert_eq!(req.path(), "/a/b");
        assert_eq!(req.host(), Some("a.example.com:8443"));
        assert_eq!(req.authorization(), Some(("Basic", "YWxpY2U6c2VjcmV0")));
        assert_eq!(req.request_line(), "GET /a/b?x=1 HTTP/1.1");
    }

    #[test]
    fn test_parse_partial_and_invalid() {
        assert!(Request::parse(b"GET / HTTP/1.1\r\nHost: x").unwrap().is_none());
        assert!(Request::parse(b"\x16\x03\x01\x02\x00garbage\r\n\r\n").is_err());
    }

    #[test]
    fn test_keep_alive_rules() {
        let (req, _) = Request::parse(b"GET / HTTP/1.1\r\n\r\n").unwrap().unwrap();
        assert!(req.wants_keep_alive());
        let (req, _) = Request::parse(b"GET / HTTP/1.1\r\nConnection: close\r\n\r\n")
            .unwrap()
            .unwrap();
        assert!(!req.wants_keep_alive());
        let (req, _) = Request::parse(b"GET / HTTP/1.0\r\n\r\n").unwrap().unwrap();
        assert!(!req.wants_keep_alive());
        let (req, _) = Request::parse(b"GET / HTTP/1.0\r\nConnection: Keep-Alive\r\n\r\n")
            .unwrap()
            .unwrap();
        assert!(req.wants_keep_alive());
    }

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path("/").as_deref(), Some("/"));
        assert_eq!(normalize_path("").as_deref(), Some("/"));
        assert_eq!(normalize_path("//secure/k.txt").as_deref(), Some("/secure/k.txt"));
        assert_eq!(normalize_path("/./secure/./k.txt").as_deref(), Some("/secure/k.txt"));
        assert_eq!(normalize_path("/a%20b.txt").as_deref(), Some("/a b.txt"));
        assert_eq!(normalize_path("/%73ecure/").as_deref(), Some("/secure/"));
        assert_eq!(normalize_path("/docs/.").as_deref(), Some("/docs/"));
        assert_eq!(normalize_path("/%2e%2e/etc/passwd"), None);
        assert_eq!(normalize_path("/secure/../secure/k.txt"), None);
        assert_eq!(normalize_path("/a\\..\\b"), None);
        assert_eq!(normalize_path("/x%00y"), None);
        assert_eq!(normalize_path("/bad%2"), None);
        assert_eq!(normalize_path("/bad%zz"), None);
        assert_eq!(normalize_path("/bad%+1"), None);
        assert_eq!(normalize_path("/%ff"), None);
    }

    #[test]
    fn test_canonical_path_strips_query() {
        let (req, _) = Request::parse(b"GET //a/./b%2Ec?x=/../ HTTP/1.1\r\n\r\n")
            .unwrap()
            .unwrap();
        assert_eq!(req.path(), "//a/./b%2Ec");
        assert_eq!(req.canonical_path().as_deref(), Some("/a/b.c"));
    }

    #[test]
    fn test_serialize_response() {
        let resp = Response::new(401)
            .with_header("WWW-Authenticate", "Basic realm=\"r\"")
            .with_body("text/plain", "denied");
        let text = String::from_utf8(resp.serialize("vhttpd", false)).unwrap();
        assert!(text.starts_with("HTTP/1.1 401 Unauthorized\r\n"));
        assert!(text.contains("\r\nWWW-Authenticate: Basic realm=\"r\"\r\n"));
        assert!(text.contains("\r\nContent-Length: 6\r\n"));
        assert!(text.contains("\r\nConnection: close\r\n"));
        assert!(text.ends_with("\r\n\r\ndenied"));
    }

    #[test]
    fn test_head_only_omits_body() {
        let mut resp = Response::new(200).with_body("text/plain", "hello");
        resp.head_only = true;
        let text = String::from_utf8(resp.serialize("vhttpd", true)).unwrap();
        assert!(text.contains("Content-Length: 5\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
        assert_eq!(resp.body_len(), 0);
    }
}
