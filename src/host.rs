//! Virtual hosts: a named server identity with its own document tree,
//! auth rules, TLS settings and counters.

use crate::address::AddressSpec;
use crate::auth::store::{update_user_acls, GroupStore, UserStore};
use crate::auth::AuthPolicy;
use crate::error::ConfigError;
use crate::tls::{ProviderKind, TlsHostConfig, TlsSettings};
use std::collections::HashMap;
use std::os::unix::fs::MetadataExt;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Directory {
    pub path: PathBuf,
    pub index: String,
    pub auth: AuthPolicy,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Location {
    pub prefix: String,
    /// Handler forced for everything under the prefix.
    pub handler: Option<String>,
    pub auth: AuthPolicy,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostLimits {
    /// Idle timeout while waiting for a request.
    pub timeout: Duration,
    pub keep_alive: bool,
    pub keep_alive_timeout: Duration,
    pub max_keep_alive: u32,
    pub max_body: usize,
    pub http_version: String,
}

impl Default for HostLimits {
    fn default() -> Self {
        HostLimits {
            timeout: Duration::from_secs(60),
            keep_alive: true,
            keep_alive_timeout: Duration::from_secs(15),
            max_keep_alive: 100,
            max_body: 1024 * 1024,
            http_version: "1.1".to_string(),
        }
    }
}

#[derive(Debug, Default)]
pub struct HostStats {
    pub requests: AtomicU64,
    pub access_errors: AtomicU64,
    pub errors: AtomicU64,
    pub kept_alive: AtomicU64,
    pub timeouts: AtomicU64,
}

impl HostStats {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Debug)]
pub struct VirtualHost {
    name: String,
    address: AddressSpec,
    document_root: Option<PathBuf>,
    directories: Vec<Directory>,
    locations: Vec<Location>,
    mime_types: HashMap<String, String>,
    error_documents: HashMap<u16, String>,
    tls: Option<Arc<TlsHostConfig>>,
    users: UserStore,
    groups: GroupStore,
    limits: HostLimits,
    secret: String,
    stats: HostStats,
    access_log: Option<PathBuf>,
}

fn make_secret() -> String {
    rand::random::<[u8; 16]>()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

impl VirtualHost {
    /// A host named `name` bound to `address` (`*:80` when unparseable).
    pub fn new(name: &str, address: &str) -> Self {
        let address = AddressSpec::parse(address).unwrap_or_else(|e| {
            log::warn!("Host {}: {}, binding to *:80", name, e);
            AddressSpec::wildcard(crate::address::DEFAULT_HTTP_PORT)
        });
        VirtualHost {
            name: name.to_string(),
            address,
            document_root: None,
            directories: Vec::new(),
            locations: Vec::new(),
            mime_types: HashMap::new(),
            error_documents: HashMap::new(),
            tls: None,
            users: UserStore::new(),
            groups: GroupStore::new(),
            limits: HostLimits::default(),
            secret: make_secret(),
            stats: HostStats::default(),
            access_log: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: &str) {
        self.name = name.to_string();
    }

    pub fn address(&self) -> &AddressSpec {
        &self.address
    }

    pub fn secret(&self) -> &str {
        &self.secret
    }

    pub fn stats(&self) -> &HostStats {
        &self.stats
    }

    pub fn limits(&self) -> &HostLimits {
        &self.limits
    }

    pub fn limits_mut(&mut self) -> &mut HostLimits {
        &mut self.limits
    }

    pub fn access_log(&self) -> Option<&Path> {
        self.access_log.as_deref()
    }

    pub fn set_access_log(&mut self, path: impl Into<PathBuf>) {
        self.access_log = Some(path.into());
    }

    // ─── Document tree ──────────────────────────────────────

    pub fn document_root(&self) -> Option<&Path> {
        self.document_root.as_deref()
    }

    /// Set the document root once. The root also becomes a directory entry.
    pub fn set_document_root(&mut self, root: impl Into<PathBuf>) -> Result<(), ConfigError> {
        let root = root.into();
        if let Some(existing) = &self.document_root {
            if existing == &root {
                return Ok(());
            }
            return Err(ConfigError::DuplicateDocumentRoot {
                host: self.name.clone(),
                existing: existing.clone(),
            });
        }
        self.document_root = Some(root.clone());
        self.add_directory(root, None);
        Ok(())
    }

    fn resolve_dir(&self, path: &Path) -> PathBuf {
        match (&self.document_root, path.is_relative()) {
            (Some(root), true) => root.join(path),
            _ => path.to_path_buf(),
        }
    }

    /// Add (or return) the directory at `path`. Its auth policy starts as a
    /// copy of `parent`'s, or of the closest enclosing directory.
    pub fn add_directory(&mut self, path: impl AsRef<Path>, parent: Option<&Path>) -> &mut Directory {
        let path = self.resolve_dir(path.as_ref());
        if let Some(idx) = self.directories.iter().position(|d| d.path == path) {
            return &mut self.directories[idx];
        }
        let inherited = match parent {
            Some(p) => {
                let p = self.resolve_dir(p);
                self.directories.iter().find(|d| d.path == p)
            }
            None => self.find_best_dir(&path),
        };
        let dir = Directory {
            path,
            index: inherited
                .map(|d| d.index.clone())
                .unwrap_or_else(|| "index.html".to_string()),
            auth: inherited
                .map(|d| AuthPolicy::inherit_from(&d.auth))
                .unwrap_or_default(),
        };
        self.directories.push(dir);
        let last = self.directories.len() - 1;
        &mut self.directories[last]
    }

    /// Add (or return) the location for `prefix`. Its auth policy starts as
    /// a copy of `parent_dir`'s, or of the directory the prefix maps into.
    pub fn add_location(&mut self, prefix: &str, parent_dir: Option<&Path>) -> &mut Location {
        if let Some(idx) = self.locations.iter().position(|l| l.prefix == prefix) {
            return &mut self.locations[idx];
        }
        let auth = {
            let dir = match parent_dir {
                Some(p) => {
                    let p = self.resolve_dir(p);
                    self.directories.iter().find(|d| d.path == p)
                }
                None => self
                    .map_to_storage(prefix)
                    .and_then(|path| self.find_best_dir(&path)),
            };
            dir.map(|d| AuthPolicy::inherit_from(&d.auth))
                .unwrap_or_default()
        };
        self.locations.push(Location {
            prefix: prefix.to_string(),
            handler: None,
            auth,
        });
        let last = self.locations.len() - 1;
        &mut self.locations[last]
    }

    pub fn directories(&self) -> &[Directory] {
        &self.directories
    }

    pub fn locations(&self) -> &[Location] {
        &self.locations
    }

    /// The directory with the longest path enclosing `path`.
    pub fn find_best_dir(&self, path: &Path) -> Option<&Directory> {
        self.directories
            .iter()
            .filter(|d| path.starts_with(&d.path))
            .max_by_key(|d| d.path.components().count())
    }

    /// The location with the longest prefix of `uri`.
    pub fn find_location(&self, uri: &str) -> Option<&Location> {
        self.locations
            .iter()
            .filter(|l| uri.starts_with(&l.prefix))
            .max_by_key(|l| l.prefix.len())
    }

    /// Filesystem path for a request URI, or `None` if there is no document
    /// root or the URI climbs out of it.
    pub fn map_to_storage(&self, uri: &str) -> Option<PathBuf> {
        let root = self.document_root.as_ref()?;
        let path = uri.split(['?', '#']).next().unwrap_or("");
        let relative = Path::new(path.trim_start_matches('/'));
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
        {
            log::warn!("Rejected URI {} on {}", uri, self.name);
            return None;
        }
        Some(root.join(relative))
    }

    /// `inode-size-mtime` in hex, for ETag headers and Digest nonces.
    pub fn entity_tag(path: &Path) -> Option<String> {
        let meta = std::fs::metadata(path).ok()?;
        Some(format!("{:x}-{:x}-{:x}", meta.ino(), meta.len(), meta.mtime()))
    }

    // ─── Content types and error pages ──────────────────────

    pub fn add_mime_type(&mut self, ext: &str, mime: &str) {
        self.mime_types.insert(
            ext.trim_start_matches('.').to_ascii_lowercase(),
            mime.to_string(),
        );
    }

    pub fn lookup_mime_type(&self, ext: &str) -> String {
        let ext = ext.trim_start_matches('.').to_ascii_lowercase();
        if let Some(mime) = self.mime_types.get(&ext) {
            return mime.clone();
        }
        mime_guess::from_ext(&ext)
            .first_or_octet_stream()
            .to_string()
    }

    pub fn add_error_document(&mut self, code: u16, uri: &str) {
        self.error_documents.insert(code, uri.to_string());
    }

    pub fn error_document(&self, code: u16) -> Option<&str> {
        self.error_documents.get(&code).map(String::as_str)
    }

    // ─── TLS ────────────────────────────────────────────────

    /// Create this host's TLS config on first call and return its settings.
    pub fn enable_tls(&mut self, provider: &ProviderKind) -> Result<&mut TlsSettings, ConfigError> {
        let name = self.name.clone();
        let config = self
            .tls
            .get_or_insert_with(|| Arc::new(provider.new_config(&name)));
        Arc::get_mut(config)
            .map(|c| c.settings_mut())
            .ok_or(ConfigError::TlsInUse(name))
    }

    pub fn tls(&self) -> Option<&Arc<TlsHostConfig>> {
        self.tls.as_ref()
    }

    pub fn is_secure(&self) -> bool {
        self.tls.is_some()
    }

    /// Serve plaintext only. Returns the detached config.
    pub fn disable_tls(&mut self) -> Option<Arc<TlsHostConfig>> {
        self.tls.take()
    }

    // ─── Users and groups ───────────────────────────────────

    pub fn users(&self) -> &UserStore {
        &self.users
    }

    pub fn users_mut(&mut self) -> &mut UserStore {
        &mut self.users
    }

    pub fn groups(&self) -> &GroupStore {
        &self.groups
    }

    pub fn groups_mut(&mut self) -> &mut GroupStore {
        &mut self.groups
    }

    pub fn load_user_file(&mut self, path: &Path) -> Result<usize, ConfigError> {
        let n = self.users.load(path)?;
        self.update_user_acls();
        Ok(n)
    }

    pub fn load_group_file(&mut self, path: &Path) -> Result<usize, ConfigError> {
        let n = self.groups.load(path)?;
        self.update_user_acls();
        Ok(n)
    }

    pub fn update_user_acls(&mut self) {
        update_user_acls(&mut self.users, &self.groups);
    }

    /// Start from the default host's directories, locations, content types,
    /// error pages, auth stores and limits. The document root and TLS stay
    /// per host.
    pub fn inherit_from(&mut self, default: &VirtualHost) {
        for dir in &default.directories {
            if !self.directories.iter().any(|d| d.path == dir.path) {
                self.directories.push(Directory {
                    auth: AuthPolicy::inherit_from(&dir.auth),
                    ..dir.clone()
                });
            }
        }
        for loc in &default.locations {
            if !self.locations.iter().any(|l| l.prefix == loc.prefix) {
                self.locations.push(Location {
                    auth: AuthPolicy::inherit_from(&loc.auth),
                    ..loc.clone()
                });
            }
        }
        for (ext, mime) in &default.mime_types {
            self.mime_types
                .entry(ext.clone())
                .or_insert_with(|| mime.clone());
        }
        for (code, uri) in &default.error_documents {
            self.error_documents
                .entry(*code)
                .or_insert_with(|| uri.clone());
        }
        if self.users.is_empty() {
            self.users = default.users.clone();
        }
        if self.groups.iter().next().is_none() {
            self.groups = default.groups.clone();
        }
        self.limits = default.limits.clone();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AuthScheme;
    use crate::tls::{RecordLimits, TlsRuntime};

    fn make_host() -> VirtualHost {
        let mut host = VirtualHost::new("a.example.com", "*:8080");
        host.set_document_root("/srv/www").unwrap();
        host
    }

    // ─── Document tree ──────────────────────────────────────

    #[test]
    fn test_duplicate_document_root() {
        let mut host = make_host();
        host.set_document_root("/srv/www").unwrap();
        assert!(matches!(
            host.set_document_root("/srv/other"),
            Err(ConfigError::DuplicateDocumentRoot { .. })
        ));
        assert_eq!(host.document_root(), Some(Path::new("/srv/www")));
    }

    #[test]
    fn test_directory_inherits_parent_auth() {
        let mut host = make_host();
        host.add_directory("/srv/www", None)
            .auth
            .set_scheme(AuthScheme::Basic)
            .set_realm("site");
        let sub = host.add_directory("private", None);
        assert_eq!(sub.path, PathBuf::from("/srv/www/private"));
        assert_eq!(sub.auth.realm(), "site");
        assert!(sub.auth.is_inherited());

        let best = host.find_best_dir(Path::new("/srv/www/private/a/b.html")).unwrap();
        assert_eq!(best.path, PathBuf::from("/srv/www/private"));
        assert!(host.find_best_dir(Path::new("/etc/passwd")).is_none());
    }

    #[test]
    fn test_location_inherits_directory_auth() {
        let mut host = make_host();
        host.add_directory("admin", None)
            .auth
            .set_scheme(AuthScheme::Digest)
            .set_realm("ops");
        let loc = host.add_location("/admin/tools", None);
        assert_eq!(loc.auth.scheme(), AuthScheme::Digest);
        host.add_location("/admin", Some(Path::new("/srv/www")));
        assert_eq!(host.find_location("/admin/tools/x").unwrap().prefix, "/admin/tools");
        assert_eq!(host.find_location("/admin/other").unwrap().auth.scheme(), AuthScheme::None);
        assert!(host.find_location("/public").is_none());
    }

    #[test]
    fn test_map_to_storage_guards_traversal() {
        let host = make_host();
        assert_eq!(
            host.map_to_storage("/docs/a.html?x=1"),
            Some(PathBuf::from("/srv/www/docs/a.html"))
        );
        assert_eq!(host.map_to_storage("/"), Some(PathBuf::from("/srv/www")));
        assert!(host.map_to_storage("/../etc/passwd").is_none());
        assert!(host.map_to_storage("/docs/../../x").is_none());
        assert!(VirtualHost::new("bare", "*").map_to_storage("/").is_none());
    }

    #[test]
    fn test_entity_tag_changes_with_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.txt");
        std::fs::write(&path, "one").unwrap();
        let first = VirtualHost::entity_tag(&path).unwrap();
        std::fs::write(&path, "three").unwrap();
        let second = VirtualHost::entity_tag(&path).unwrap();
        assert_ne!(first, second);
        assert_eq!(first.split('-').count(), 3);
        assert!(VirtualHost::entity_tag(&dir.path().join("missing")).is_none());
    }

    // ─── Content types ──────────────────────────────────────

    #[test]
    fn test_mime_table_overrides_guess() {
        let mut host = make_host();
        assert_eq!(host.lookup_mime_type("html"), "text/html");
        host.add_mime_type(".HTML", "application/x-custom");
        assert_eq!(host.lookup_mime_type("html"), "application/x-custom");
        assert_eq!(host.lookup_mime_type("nope-ext"), "application/octet-stream");
    }

    // ─── TLS ────────────────────────────────────────────────

    #[test]
    fn test_enable_tls_returns_same_settings() {
        let provider =
            ProviderKind::by_name("session", TlsRuntime::new(), RecordLimits::default()).unwrap();
        let mut host = make_host();
        host.enable_tls(&provider).unwrap().set_cert_file("/x/cert.pem");
        let settings = host.enable_tls(&provider).unwrap();
        assert_eq!(settings.cert_file(), Some(Path::new("/x/cert.pem")));
        assert!(host.is_secure());

        let shared = host.tls().unwrap().clone();
        assert!(matches!(host.enable_tls(&provider), Err(ConfigError::TlsInUse(_))));
        drop(shared);
        assert!(host.disable_tls().is_some());
        assert!(!host.is_secure());
    }

    // ─── Inheritance ────────────────────────────────────────

    #[test]
    fn test_inherit_from_default() {
        let mut default = make_host();
        default.add_mime_type("md", "text/markdown");
        default.add_error_document(404, "/404.html");
        default.users_mut().add_user("alice", "r", "p", true).unwrap();
        default.limits_mut().max_keep_alive = 7;

        let mut host = VirtualHost::new("b.example.com", "*:8080");
        host.add_mime_type("md", "text/plain");
        host.inherit_from(&default);
        assert_eq!(host.lookup_mime_type("md"), "text/plain");
        assert_eq!(host.error_document(404), Some("/404.html"));
        assert!(host.users().lookup("alice", "r").is_some());
        assert_eq!(host.limits().max_keep_alive, 7);
        assert!(host.document_root().is_none());
        assert!(host.directories()[0].auth.is_inherited());
        assert_ne!(host.secret(), default.secret());
    }
}
