use crate::access_control::AccessOrder;
use crate::auth::store::parse_acl;
use crate::auth::{AuthPolicy, AuthScheme};
use crate::error::ConfigError;
use crate::host::VirtualHost;
use crate::listen::{DEFAULT_PORT, WILD_PORT};
use crate::server::Server;
use crate::tls::settings::parse_protocol_mask;
use crate::tls::{ProviderKind, RecordLimits, TlsRuntime};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Global server configuration from server.yaml
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_server_name")]
    pub name: String,
    /// `session` or `record`
    #[serde(default = "default_tls_provider")]
    pub tls_provider: String,
    #[serde(default = "default_listens")]
    pub listen: Vec<ListenConfig>,
    /// Addresses that serve name-based virtual hosts.
    #[serde(default)]
    pub name_virtual_hosts: Vec<String>,
    #[serde(default)]
    pub record_buffer: RecordBufferConfig,
    /// Settings for the default host, which every other host starts from.
    #[serde(default)]
    pub default_host: HostConfig,
}

fn default_server_name() -> String {
    "vhttpd".to_string()
}
fn default_tls_provider() -> String {
    "session".to_string()
}
fn default_listens() -> Vec<ListenConfig> {
    vec![ListenConfig {
        address: "*".to_string(),
        port: None,
        any_port: false,
    }]
}

#[derive(Debug, Clone, Deserialize)]
pub struct ListenConfig {
    #[serde(default = "default_listen_address")]
    pub address: String,
    pub port: Option<u16>,
    /// Serve hosts bound to any port through this endpoint.
    #[serde(default)]
    pub any_port: bool,
}

fn default_listen_address() -> String {
    "*".to_string()
}

impl ListenConfig {
    /// Port and listen flags for `Server::add_listen`.
    pub fn port_and_flags(&self) -> (u16, u32) {
        let mut flags = 0;
        if self.any_port {
            flags |= WILD_PORT;
        }
        let port = match self.port {
            Some(p) => p,
            None => {
                flags |= DEFAULT_PORT;
                crate::address::DEFAULT_HTTP_PORT
            }
        };
        (port, flags)
    }
}

/// Buffer sizing for the `record` TLS provider.
#[derive(Debug, Clone, Deserialize)]
pub struct RecordBufferConfig {
    #[serde(default = "default_initial_buffer")]
    pub initial: usize,
    #[serde(default = "default_buffer_ceiling")]
    pub ceiling: usize,
    #[serde(default = "default_flush_timeout")]
    pub flush_timeout_secs: u64,
}

impl Default for RecordBufferConfig {
    fn default() -> Self {
        RecordBufferConfig {
            initial: default_initial_buffer(),
            ceiling: default_buffer_ceiling(),
            flush_timeout_secs: default_flush_timeout(),
        }
    }
}

fn default_initial_buffer() -> usize {
    4096
}
fn default_buffer_ceiling() -> usize {
    64 * 1024
}
fn default_flush_timeout() -> u64 {
    30
}

impl RecordBufferConfig {
    pub fn limits(&self) -> RecordLimits {
        RecordLimits {
            initial: self.initial.max(512),
            ceiling: self.ceiling.max(self.initial),
            flush_timeout: Duration::from_secs(self.flush_timeout_secs),
        }
    }
}

/// Virtual host configuration from host-*.yaml
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HostConfig {
    pub name: Option<String>,
    /// `[ip][:port]`, `*:80` when absent.
    pub address: Option<String>,
    pub document_root: Option<String>,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub mime_types: HashMap<String, String>,
    #[serde(default)]
    pub error_documents: HashMap<u16, String>,
    pub access_log: Option<String>,
    pub ssl: Option<SslConfig>,
    pub user_file: Option<String>,
    pub group_file: Option<String>,
    #[serde(default)]
    pub users: Vec<UserConfig>,
    #[serde(default)]
    pub groups: Vec<GroupConfig>,
    /// Auth for the document root itself.
    pub auth: Option<AuthConfig>,
    #[serde(default)]
    pub directories: Vec<DirectoryConfig>,
    #[serde(default)]
    pub locations: Vec<LocationConfig>,
}

/// Per-host overrides of the default host's limits.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LimitsConfig {
    pub timeout_secs: Option<u64>,
    pub keep_alive: Option<bool>,
    pub keep_alive_timeout_secs: Option<u64>,
    pub max_keep_alive: Option<u32>,
    pub max_body: Option<usize>,
    pub http_version: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SslConfig {
    pub cert_file: Option<String>,
    pub key_file: Option<String>,
    pub ca_file: Option<String>,
    pub ca_path: Option<String>,
    pub ciphers: Option<String>,
    /// Protocol list such as `"ALL -SSLv2 -SSLv3"`.
    pub protocols: Option<String>,
    #[serde(default)]
    pub verify_client: bool,
    pub verify_depth: Option<usize>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UserConfig {
    pub name: String,
    pub realm: String,
    pub password: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GroupConfig {
    pub name: String,
    #[serde(default = "default_acl")]
    pub acl: String,
    #[serde(default)]
    pub users: Vec<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}
fn default_acl() -> String {
    "0".to_string()
}

/// Authentication and access rules for a directory or location.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthConfig {
    /// `basic`, `digest` or `none`
    #[serde(rename = "type")]
    pub auth_type: Option<String>,
    pub realm: Option<String>,
    pub qop: Option<String>,
    #[serde(default)]
    pub require: RequireConfig,
    /// `allow,deny` or `deny,allow`
    pub order: Option<String>,
    #[serde(default)]
    pub allow: Vec<String>,
    #[serde(default)]
    pub deny: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RequireConfig {
    #[serde(default)]
    pub users: Vec<String>,
    #[serde(default)]
    pub groups: Vec<String>,
    pub acl: Option<String>,
    #[serde(default)]
    pub valid_user: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DirectoryConfig {
    pub path: String,
    /// Directory whose auth this one starts from.
    pub parent: Option<String>,
    pub index: Option<String>,
    pub auth: Option<AuthConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LocationConfig {
    pub prefix: String,
    pub handler: Option<String>,
    /// Directory whose auth this location starts from.
    pub directory: Option<String>,
    pub auth: Option<AuthConfig>,
}

/// Aggregated application config loaded from all YAML files
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub dir: PathBuf,
    pub server: ServerConfig,
    pub hosts: Vec<HostConfig>,
}

impl AppConfig {
    /// Load all configuration from the given directory
    pub fn load(configs_dir: &str) -> Result<Self, ConfigError> {
        let dir = Path::new(configs_dir);

        let server_path = dir.join("server.yaml");
        let server: ServerConfig = if server_path.exists() {
            let content = std::fs::read_to_string(&server_path)
                .map_err(|e| ConfigError::io(&server_path, e))?;
            parse_yaml(&server_path, &content)?
        } else {
            log::warn!("server.yaml not found in {}, using defaults", configs_dir);
            parse_yaml(&server_path, "{}")?
        };

        let hosts = Self::load_glob(configs_dir, "host-*.yaml")?;

        Ok(AppConfig {
            dir: dir.to_path_buf(),
            server,
            hosts,
        })
    }

    /// Load all files matching a glob pattern and deserialize them
    fn load_glob<T: serde::de::DeserializeOwned>(
        configs_dir: &str,
        pattern: &str,
    ) -> Result<Vec<T>, ConfigError> {
        let full_pattern = format!("{}/{}", configs_dir, pattern);
        let mut items = Vec::new();
        for entry in glob::glob(&full_pattern)? {
            match entry {
                Ok(path) => {
                    let content =
                        std::fs::read_to_string(&path).map_err(|e| ConfigError::io(&path, e))?;
                    match serde_yaml::from_str::<T>(&content) {
                        Ok(item) => items.push(item),
                        Err(e) => {
                            log::error!("Failed to parse {}: {}", path.display(), e);
                        }
                    }
                }
                Err(e) => {
                    log::error!("Glob error: {}", e);
                }
            }
        }
        Ok(items)
    }

    /// Build an unstarted server from this configuration.
    pub fn build_server(&self, runtime: Arc<TlsRuntime>) -> Result<Server, ConfigError> {
        let provider = ProviderKind::by_name(
            &self.server.tls_provider,
            runtime.clone(),
            self.server.record_buffer.limits(),
        )?;
        let mut server = Server::new(&self.server.name, runtime, provider.clone());

        for listen in &self.server.listen {
            let (port, flags) = listen.port_and_flags();
            server.add_listen(&listen.address, port, flags)?;
        }

        let default = &self.server.default_host;
        let name = default.name.as_deref().unwrap_or(&self.server.name);
        let address = default.address.as_deref().unwrap_or("*:80");
        let host = server.new_virtual_host(name, address)?;
        self.apply_host(host, default, &provider)?;

        for cfg in &self.hosts {
            let address = cfg.address.as_deref().unwrap_or("*:80");
            let name = cfg.name.as_deref().unwrap_or(address);
            if server.find_host(name).is_some() {
                log::warn!("Host {} defined twice, skipping", name);
                continue;
            }
            let host = server.new_virtual_host(name, address)?;
            if let Err(e) = self.apply_host(host, cfg, &provider) {
                log::error!("Host {}: {}", name, e);
                return Err(e);
            }
        }

        for spec in &self.server.name_virtual_hosts {
            server.set_name_virtual_host(spec)?;
        }
        Ok(server)
    }

    /// Paths in host files are relative to the config directory.
    fn resolve(&self, path: &str) -> PathBuf {
        let p = Path::new(path);
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            self.dir.join(p)
        }
    }

    fn apply_host(
        &self,
        host: &mut VirtualHost,
        cfg: &HostConfig,
        provider: &ProviderKind,
    ) -> Result<(), ConfigError> {
        if let Some(root) = &cfg.document_root {
            host.set_document_root(self.resolve(root))?;
        }
        apply_limits(host, &cfg.limits);
        for (ext, mime) in &cfg.mime_types {
            host.add_mime_type(ext, mime);
        }
        for (code, uri) in &cfg.error_documents {
            host.add_error_document(*code, uri);
        }
        if let Some(log) = &cfg.access_log {
            host.set_access_log(self.resolve(log));
        }

        if let Some(path) = &cfg.user_file {
            let n = host.load_user_file(&self.resolve(path))?;
            log::debug!("Host {}: {} users", host.name(), n);
        }
        if let Some(path) = &cfg.group_file {
            let n = host.load_group_file(&self.resolve(path))?;
            log::debug!("Host {}: {} groups", host.name(), n);
        }
        for user in &cfg.users {
            host.users_mut()
                .add_user(&user.name, &user.realm, &user.password, user.enabled)?;
        }
        for group in &cfg.groups {
            let acl = parse_acl(&group.acl).ok_or_else(|| bad_value("acl", &group.acl))?;
            let members: Vec<&str> = group.users.iter().map(String::as_str).collect();
            host.groups_mut().add_group(&group.name, acl, &members)?;
            host.groups_mut().set_enabled(&group.name, group.enabled);
        }
        if !cfg.groups.is_empty() {
            host.update_user_acls();
        }

        if let (Some(auth), Some(root)) = (&cfg.auth, host.document_root().map(Path::to_path_buf)) {
            apply_auth(&mut host.add_directory(root, None).auth, auth)?;
        }
        for dir in &cfg.directories {
            let parent = dir.parent.as_deref().map(|p| self.resolve_in_root(host, p));
            let path = self.resolve_in_root(host, &dir.path);
            let entry = host.add_directory(path, parent.as_deref());
            if let Some(index) = &dir.index {
                entry.index = index.clone();
            }
            if let Some(auth) = &dir.auth {
                apply_auth(&mut entry.auth, auth)?;
            }
        }
        for loc in &cfg.locations {
            let parent = loc.directory.as_deref().map(|p| self.resolve_in_root(host, p));
            let entry = host.add_location(&loc.prefix, parent.as_deref());
            if let Some(handler) = &loc.handler {
                entry.handler = Some(handler.clone());
            }
            if let Some(auth) = &loc.auth {
                apply_auth(&mut entry.auth, auth)?;
            }
        }

        if let Some(ssl) = &cfg.ssl {
            let settings = host.enable_tls(provider)?;
            if let Some(p) = &ssl.cert_file {
                settings.set_cert_file(self.resolve(p));
            }
            if let Some(p) = &ssl.key_file {
                settings.set_key_file(self.resolve(p));
            }
            if let Some(p) = &ssl.ca_file {
                settings.set_ca_file(self.resolve(p));
            }
            if let Some(p) = &ssl.ca_path {
                settings.set_ca_path(self.resolve(p));
            }
            if let Some(c) = &ssl.ciphers {
                settings.set_cipher_suite(c);
            }
            if let Some(p) = &ssl.protocols {
                settings.set_protocol_mask(parse_protocol_mask(p)?);
            }
            settings.set_verify_client(ssl.verify_client);
            if let Some(depth) = ssl.verify_depth {
                settings.set_verify_depth(depth);
            }
        }
        Ok(())
    }

    /// Directory paths are relative to the document root when one is set.
    fn resolve_in_root(&self, host: &VirtualHost, path: &str) -> PathBuf {
        match host.document_root() {
            Some(root) if Path::new(path).is_relative() => root.join(path),
            _ => self.resolve(path),
        }
    }
}

fn parse_yaml<T: serde::de::DeserializeOwned>(path: &Path, content: &str) -> Result<T, ConfigError> {
    serde_yaml::from_str(content).map_err(|source| ConfigError::Yaml {
        path: path.to_path_buf(),
        source,
    })
}

fn bad_value(key: &str, value: &str) -> ConfigError {
    ConfigError::BadValue {
        key: key.to_string(),
        value: value.to_string(),
    }
}

fn apply_limits(host: &mut VirtualHost, cfg: &LimitsConfig) {
    let limits = host.limits_mut();
    if let Some(secs) = cfg.timeout_secs {
        limits.timeout = Duration::from_secs(secs);
    }
    if let Some(on) = cfg.keep_alive {
        limits.keep_alive = on;
    }
    if let Some(secs) = cfg.keep_alive_timeout_secs {
        limits.keep_alive_timeout = Duration::from_secs(secs);
    }
    if let Some(n) = cfg.max_keep_alive {
        limits.max_keep_alive = n;
    }
    if let Some(n) = cfg.max_body {
        limits.max_body = n;
    }
    if let Some(v) = &cfg.http_version {
        limits.http_version = v.clone();
    }
}

fn apply_auth(policy: &mut AuthPolicy, cfg: &AuthConfig) -> Result<(), ConfigError> {
    if let Some(t) = &cfg.auth_type {
        let scheme = AuthScheme::parse(t).ok_or_else(|| bad_value("auth type", t))?;
        policy.set_scheme(scheme);
    }
    if let Some(realm) = &cfg.realm {
        policy.set_realm(realm);
    }
    if let Some(qop) = &cfg.qop {
        policy.set_qop(qop);
    }
    let require = &cfg.require;
    if !require.users.is_empty() {
        policy.set_required_users(&require.users.join(" "));
    }
    if !require.groups.is_empty() {
        policy.set_required_groups(&require.groups.join(" "));
    }
    if let Some(acl) = &require.acl {
        policy.set_required_acl(parse_acl(acl).ok_or_else(|| bad_value("require acl", acl))?);
    }
    if require.valid_user {
        policy.set_any_valid_user();
    }
    if let Some(order) = &cfg.order {
        policy.set_order(AccessOrder::parse(order).ok_or_else(|| bad_value("order", order))?);
    }
    for pattern in &cfg.allow {
        policy.add_allow(pattern);
    }
    for pattern in &cfg.deny {
        policy.add_deny(pattern);
    }
    Ok(())
}
