use crate::error::ConfigError;
use rustls::SupportedProtocolVersion;
use std::path::{Path, PathBuf};

pub const PROTO_SSL_V2: u32 = 0x01;
pub const PROTO_SSL_V3: u32 = 0x02;
pub const PROTO_TLS_V1: u32 = 0x04;
pub const PROTO_TLS_V1_1: u32 = 0x08;
pub const PROTO_TLS_V1_2: u32 = 0x10;
pub const PROTO_TLS_V1_3: u32 = 0x20;
pub const PROTO_ALL: u32 = 0x3f;

/// Versions this build can actually negotiate.
const PROTO_SUPPORTED: u32 = PROTO_TLS_V1_2 | PROTO_TLS_V1_3;

pub const DEFAULT_VERIFY_DEPTH: usize = 10;

/// Per-host TLS settings, filled in by the config loader before start.
#[derive(Debug, Clone)]
pub struct TlsSettings {
    key_file: Option<PathBuf>,
    cert_file: Option<PathBuf>,
    ca_file: Option<PathBuf>,
    ca_path: Option<PathBuf>,
    cipher_suite: Option<String>,
    protocol_mask: u32,
    verify_client: bool,
    verify_depth: usize,
}

impl Default for TlsSettings {
    fn default() -> Self {
        TlsSettings {
            key_file: None,
            cert_file: None,
            ca_file: None,
            ca_path: None,
            cipher_suite: None,
            protocol_mask: PROTO_ALL,
            verify_client: false,
            verify_depth: DEFAULT_VERIFY_DEPTH,
        }
    }
}

impl TlsSettings {
    pub fn set_key_file(&mut self, path: impl Into<PathBuf>) -> &mut Self {
        self.key_file = Some(path.into());
        self
    }

    pub fn set_cert_file(&mut self, path: impl Into<PathBuf>) -> &mut Self {
        self.cert_file = Some(path.into());
        self
    }

    pub fn set_ca_file(&mut self, path: impl Into<PathBuf>) -> &mut Self {
        self.ca_file = Some(path.into());
        self
    }

    pub fn set_ca_path(&mut self, path: impl Into<PathBuf>) -> &mut Self {
        self.ca_path = Some(path.into());
        self
    }

    pub fn set_cipher_suite(&mut self, ciphers: &str) -> &mut Self {
        self.cipher_suite = Some(ciphers.to_string());
        self
    }

    pub fn set_protocol_mask(&mut self, mask: u32) -> &mut Self {
        self.protocol_mask = mask;
        self
    }

    pub fn set_verify_client(&mut self, on: bool) -> &mut Self {
        self.verify_client = on;
        self
    }

    pub fn set_verify_depth(&mut self, depth: usize) -> &mut Self {
        self.verify_depth = depth;
        self
    }

    pub fn key_file(&self) -> Option<&Path> {
        self.key_file.as_deref()
    }

    pub fn cert_file(&self) -> Option<&Path> {
        self.cert_file.as_deref()
    }

    pub fn ca_file(&self) -> Option<&Path> {
        self.ca_file.as_deref()
    }

    pub fn ca_path(&self) -> Option<&Path> {
        self.ca_path.as_deref()
    }

    pub fn cipher_suite(&self) -> Option<&str> {
        self.cipher_suite.as_deref()
    }

    pub fn protocol_mask(&self) -> u32 {
        self.protocol_mask
    }

    pub fn verify_client(&self) -> bool {
        self.verify_client
    }

    pub fn verify_depth(&self) -> usize {
        self.verify_depth
    }
}

/// Parse a protocol list such as `"ALL -SSLv2 -SSLv3"` into a mask.
///
/// A leading bare name replaces the mask, `+name` adds and `-name` removes.
pub fn parse_protocol_mask(spec: &str) -> Result<u32, ConfigError> {
    let mut mask = 0u32;
    for token in spec.split(|c: char| c.is_whitespace() || c == ',') {
        if token.is_empty() {
            continue;
        }
        let (op, name) = match token.as_bytes()[0] {
            b'+' => ('+', &token[1..]),
            b'-' => ('-', &token[1..]),
            _ => ('=', token),
        };
        let bits = protocol_bits(name).ok_or_else(|| ConfigError::BadProtocol(token.to_string()))?;
        match op {
            '+' => mask |= bits,
            '-' => mask &= !bits,
            _ => mask = bits,
        }
    }
    Ok(mask)
}

fn protocol_bits(name: &str) -> Option<u32> {
    match name.to_ascii_uppercase().as_str() {
        "ALL" => Some(PROTO_ALL),
        "SSLV2" => Some(PROTO_SSL_V2),
        "SSLV3" => Some(PROTO_SSL_V3),
        "TLSV1" | "TLSV1.0" => Some(PROTO_TLS_V1),
        "TLSV1.1" => Some(PROTO_TLS_V1_1),
        "TLSV1.2" => Some(PROTO_TLS_V1_2),
        "TLSV1.3" => Some(PROTO_TLS_V1_3),
        _ => None,
    }
}

/// Maps a mask onto the versions rustls can speak. Legacy bits are dropped
/// with a warning; an empty result is a configuration error.
pub fn enabled_versions(
    mask: u32,
) -> Result<Vec<&'static SupportedProtocolVersion>, ConfigError> {
    let legacy = mask & !PROTO_SUPPORTED & PROTO_ALL;
    if legacy != 0 {
        log::debug!("Ignoring unsupported legacy protocol bits {:#x}", legacy);
    }
    let mut versions = Vec::new();
    if mask & PROTO_TLS_V1_3 != 0 {
        versions.push(&rustls::version::TLS13);
    }
    if mask & PROTO_TLS_V1_2 != 0 {
        versions.push(&rustls::version::TLS12);
    }
    if versions.is_empty() {
        return Err(ConfigError::NoProtocols(mask));
    }
    Ok(versions)
}

/// Cipher names from a colon, comma or space separated list.
pub fn cipher_names(list: &str) -> Vec<String> {
    list.split(|c: char| c == ':' || c == ',' || c.is_whitespace())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_ascii_uppercase())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_all_minus_legacy() {
        let mask = parse_protocol_mask("ALL -SSLv2 -SSLv3").unwrap();
        assert_eq!(mask & PROTO_SSL_V2, 0);
        assert_eq!(mask & PROTO_SSL_V3, 0);
        assert_ne!(mask & PROTO_TLS_V1_2, 0);
    }

    #[test]
    fn test_parse_single_and_plus() {
        let mask = parse_protocol_mask("TLSv1.2 +TLSv1.3").unwrap();
        assert_eq!(mask, PROTO_TLS_V1_2 | PROTO_TLS_V1_3);
    }

    #[test]
    fn test_parse_rejects_unknown_token() {
        assert!(matches!(
            parse_protocol_mask("ALL -QUIC"),
            Err(ConfigError::BadProtocol(_))
        ));
    }

    #[test]
    fn test_legacy_only_mask_has_no_versions() {
        let mask = PROTO_SSL_V2 | PROTO_SSL_V3 | PROTO_TLS_V1;
        assert!(matches!(
            enabled_versions(mask),
            Err(ConfigError::NoProtocols(_))
        ));
    }

    #[test]
    fn test_default_mask_enables_both_versions() {
        let versions = enabled_versions(TlsSettings::default().protocol_mask()).unwrap();
        assert_eq!(versions.len(), 2);
    }

    #[test]
    fn test_cipher_names_split() {
        assert_eq!(
            cipher_names("tls13_aes_128_gcm_sha256: TLS13_CHACHA20_POLY1305_SHA256"),
            vec!["TLS13_AES_128_GCM_SHA256", "TLS13_CHACHA20_POLY1305_SHA256"]
        );
    }

    #[test]
    fn test_setters_chain() {
        let mut s = TlsSettings::default();
        s.set_cert_file("/tmp/c.pem").set_key_file("/tmp/k.pem").set_verify_depth(2);
        assert_eq!(s.cert_file().unwrap(), Path::new("/tmp/c.pem"));
        assert_eq!(s.verify_depth(), 2);
    }
}
