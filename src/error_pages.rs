use crate::host::VirtualHost;
use crate::request::Response;
use bytes::Bytes;

/// Resolve and serve an error page:
///   1. the host's ErrorDocument for `status_code`, read from its document root
///   2. Built-in fallback carrying `message`
pub fn serve_error_page(host: &VirtualHost, status_code: u16, message: &str) -> Response {
    if let Some(uri) = host.error_document(status_code) {
        if let Some(resp) = try_serve_error_file(host, uri, status_code) {
            return resp;
        }
        log::debug!(
            "Error document {} for {} on {} not readable",
            uri,
            status_code,
            host.name()
        );
    }
    builtin_error_page(status_code, message)
}

/// Try to read an error page file from disk and build a response
fn try_serve_error_file(host: &VirtualHost, uri: &str, status_code: u16) -> Option<Response> {
    let path = host.map_to_storage(uri)?;
    if !path.is_file() {
        return None;
    }
    let body = std::fs::read(&path).ok()?;
    let mime = host.lookup_mime_type(path.extension()?.to_str()?);
    Some(Response::new(status_code).with_body(&mime, Bytes::from(body)))
}

fn escape_html(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// Generate a minimal built-in error page
pub fn builtin_error_page(status_code: u16, message: &str) -> Response {
    let reason = status_reason(status_code);
    let body = format!(
        "<!DOCTYPE html>\n<html><head><title>{} {}</title></head>\n<body>\n<h2>{} {}</h2>\n<p>{}</p>\n<hr><address>vhttpd</address>\n</body></html>\n",
        status_code,
        reason,
        status_code,
        reason,
        escape_html(message)
    );
    Response::new(status_code).with_body("text/html; charset=utf-8", body)
}

/// Get a human-readable reason for common HTTP status codes
pub fn status_reason(code: u16) -> &'static str {
    match code {
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        408 => "Request Timeout",
        413 => "Payload Too Large",
        431 => "Request Header Fields Too Large",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        503 => "Service Unavailable",
        _ => "Error",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_host(root: &std::path::Path) -> VirtualHost {
        let mut host = VirtualHost::new("a.example.com", "*:80");
        host.set_document_root(root).unwrap();
        host
    }

    #[test]
    fn test_status_reason_known_codes() {
        assert_eq!(status_reason(404), "Not Found");
        assert_eq!(status_reason(401), "Unauthorized");
        assert_eq!(status_reason(418), "Error");
    }

    #[test]
    fn test_builtin_page_contains_code_and_message() {
        let resp = builtin_error_page(403, "Access denied");
        assert_eq!(resp.status, 403);
        let body = String::from_utf8(resp.body.to_vec()).unwrap();
        assert!(body.starts_with("<!DOCTYPE html>"));
        assert!(body.contains("403 Forbidden"));
        assert!(body.contains("Access denied"));
        assert_eq!(resp.header("content-type"), Some("text/html; charset=utf-8"));
    }

    #[test]
    fn test_builtin_page_escapes_message() {
        let resp = builtin_error_page(404, "<script>alert(1)</script>");
        let body = String::from_utf8(resp.body.to_vec()).unwrap();
        assert!(!body.contains("<script>"));
        assert!(body.contains("&lt;script&gt;"));
    }

    #[test]
    fn test_error_document_served_from_root() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("missing.html"), "<p>custom</p>").unwrap();
        let mut host = make_host(dir.path());
        host.add_error_document(404, "/missing.html");
        let resp = serve_error_page(&host, 404, "Not here");
        assert_eq!(resp.status, 404);
        assert_eq!(&resp.body[..], b"<p>custom</p>");
        assert_eq!(resp.header("content-type"), Some("text/html"));
    }

    #[test]
    fn test_unreadable_error_document_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let mut host = make_host(dir.path());
        host.add_error_document(500, "/gone.html");
        let resp = serve_error_page(&host, 500, "boom");
        let body = String::from_utf8(resp.body.to_vec()).unwrap();
        assert!(body.contains("500 Internal Server Error"));
    }
}
