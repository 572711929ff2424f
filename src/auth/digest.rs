//! RFC 2617 Digest credentials: header parsing, response computation and
//! host-scoped nonces.

use md5::{Digest, Md5};
use std::collections::HashMap;

pub fn md5_hex(input: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(input.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Fields a client sends in `Authorization: Digest ...`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DigestCredentials {
    pub username: String,
    pub realm: String,
    pub nonce: String,
    pub uri: String,
    pub response: String,
    pub qop: Option<String>,
    pub nc: Option<String>,
    pub cnonce: Option<String>,
    pub opaque: Option<String>,
    pub algorithm: Option<String>,
}

/// Split a comma separated `key=value` list. Values may be quoted, and a
/// backslash inside quotes escapes the next character. Keys are lowercased.
pub fn parse_params(details: &str) -> HashMap<String, String> {
    let mut params = HashMap::new();
    let mut chars = details.chars().peekable();

    loop {
        while matches!(chars.peek(), Some(c) if c.is_whitespace() || *c == ',') {
            chars.next();
        }
        let mut key = String::new();
        while let Some(&c) = chars.peek() {
            if c == '=' || c == ',' {
                break;
            }
            key.push(c);
            chars.next();
        }
        if key.trim().is_empty() && chars.peek().is_none() {
            break;
        }
        let key = key.trim().to_ascii_lowercase();

        let mut value = String::new();
        if chars.peek() == Some(&'=') {
            chars.next();
            while matches!(chars.peek(), Some(c) if c.is_whitespace()) {
                chars.next();
            }
            if chars.peek() == Some(&'"') {
                chars.next();
                while let Some(c) = chars.next() {
                    match c {
                        '\\' => {
                            if let Some(escaped) = chars.next() {
                                value.push(escaped);
                            }
                        }
                        '"' => break,
                        _ => value.push(c),
                    }
                }
                // Skip anything up to the next separator.
                while matches!(chars.peek(), Some(c) if *c != ',') {
                    chars.next();
                }
            } else {
                while let Some(&c) = chars.peek() {
                    if c == ',' {
                        break;
                    }
                    value.push(c);
                    chars.next();
                }
                value = value.trim().to_string();
            }
        }
        if !key.is_empty() {
            params.insert(key, value);
        }
        if chars.peek().is_none() {
            break;
        }
    }
    params
}

/// Parse the details of a Digest authorization header. Returns `None` when a
/// required field is missing or empty.
pub fn parse_credentials(details: &str) -> Option<DigestCredentials> {
    let mut params = parse_params(details);
    let mut required = |name: &str| params.remove(name).filter(|v| !v.is_empty());

    let username = required("username")?;
    let realm = required("realm")?;
    let nonce = required("nonce")?;
    let uri = required("uri")?;
    let response = required("response")?;
    let qop = required("qop");
    let (nc, cnonce) = if qop.is_some() {
        (Some(required("nc")?), Some(required("cnonce")?))
    } else {
        (required("nc"), required("cnonce"))
    };

    Some(DigestCredentials {
        username,
        realm,
        nonce,
        uri,
        response,
        qop,
        nc,
        cnonce,
        opaque: params.remove("opaque"),
        algorithm: params.remove("algorithm"),
    })
}

/// The expected `response` value for `creds`, given the user's HA1.
pub fn expected_response(ha1: &str, method: &str, creds: &DigestCredentials) -> String {
    let ha2 = md5_hex(&format!("{}:{}", method, creds.uri));
    match (&creds.qop, &creds.nc, &creds.cnonce) {
        (Some(qop), Some(nc), Some(cnonce)) => md5_hex(&format!(
            "{}:{}:{}:{}:{}:{}",
            ha1, creds.nonce, nc, cnonce, qop, ha2
        )),
        _ => md5_hex(&format!("{}:{}:{}", ha1, creds.nonce, ha2)),
    }
}

/// Nonce bound to a host secret, a resource entity tag, a realm and a time.
pub fn make_nonce(secret: &str, etag: &str, realm: &str, now: i64) -> String {
    md5_hex(&format!("{}:{}:{}:{:x}", secret, etag, realm, now))
}

/// `WWW-Authenticate` value for a Digest challenge.
pub fn challenge(realm: &str, domain: &str, nonce: &str, etag: &str, qop: Option<&str>) -> String {
    match qop {
        Some("auth") | Some("auth-int") => format!(
            "Digest realm=\"{}\", domain=\"{}\", qop=\"auth\", nonce=\"{}\", opaque=\"{}\", algorithm=\"MD5\", stale=\"FALSE\"",
            realm, domain, nonce, etag
        ),
        _ => format!("Digest realm=\"{}\", nonce=\"{}\"", realm, nonce),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ─── Parsing ────────────────────────────────────────────

    #[test]
    fn test_parse_quoted_and_unquoted() {
        let params = parse_params(
            r#"username="alice", realm="example.com", nc=00000001, qop=auth, uri="/a,b""#,
        );
        assert_eq!(params["username"], "alice");
        assert_eq!(params["nc"], "00000001");
        assert_eq!(params["qop"], "auth");
        assert_eq!(params["uri"], "/a,b");
    }

    #[test]
    fn test_parse_backslash_escape() {
        let params = parse_params(r#"realm="say \"hi\"", username="a\\b""#);
        assert_eq!(params["realm"], r#"say "hi""#);
        assert_eq!(params["username"], r"a\b");
    }

    #[test]
    fn test_parse_keys_case_insensitive() {
        let params = parse_params("UserName=bob ,  Realm = r");
        assert_eq!(params["username"], "bob");
        assert_eq!(params["realm"], "r");
    }

    #[test]
    fn test_credentials_require_core_fields() {
        assert!(parse_credentials(r#"username="a", realm="r", nonce="n", uri="/""#).is_none());
        let creds =
            parse_credentials(r#"username="a", realm="r", nonce="n", uri="/", response="x""#)
                .unwrap();
        assert_eq!(creds.qop, None);
    }

    #[test]
    fn test_qop_requires_cnonce_and_nc() {
        let base = r#"username="a", realm="r", nonce="n", uri="/", response="x", qop=auth"#;
        assert!(parse_credentials(base).is_none());
        assert!(parse_credentials(&format!("{}, nc=00000001", base)).is_none());
        let creds = parse_credentials(&format!("{}, nc=00000001, cnonce=\"c\"", base)).unwrap();
        assert_eq!(creds.cnonce.as_deref(), Some("c"));
    }

    // ─── Computation ────────────────────────────────────────

    #[test]
    fn test_rfc2617_example() {
        // Worked example from RFC 2617 section 3.5.
        let ha1 = md5_hex("Mufasa:testrealm@host.com:Circle Of Life");
        let creds = DigestCredentials {
            username: "Mufasa".into(),
            realm: "testrealm@host.com".into(),
            nonce: "dcd98b7102dd2f0e8b11d0f600bfb0c093".into(),
            uri: "/dir/index.html".into(),
            response: String::new(),
            qop: Some("auth".into()),
            nc: Some("00000001".into()),
            cnonce: Some("0a4f113b".into()),
            opaque: None,
            algorithm: None,
        };
        assert_eq!(
            expected_response(&ha1, "GET", &creds),
            "6629fae49393a05397450978507c4ef1"
        );
    }

    #[test]
    fn test_nonce_is_host_and_resource_scoped() {
        let a = make_nonce("s1", "etag", "realm", 100);
        assert_ne!(a, make_nonce("s2", "etag", "realm", 100));
        assert_ne!(a, make_nonce("s1", "other", "realm", 100));
        assert_eq!(a, make_nonce("s1", "etag", "realm", 100));
        assert_eq!(a.len(), 32);
    }

    #[test]
    fn test_challenge_formats() {
        assert_eq!(
            challenge("r", "h", "n", "e", Some("auth-int")),
            "Digest realm=\"r\", domain=\"h\", qop=\"auth\", nonce=\"n\", opaque=\"e\", algorithm=\"MD5\", stale=\"FALSE\""
        );
        assert_eq!(
            challenge("r", "h", "n", "e", None),
            "Digest realm=\"r\", nonce=\"n\""
        );
    }
}
