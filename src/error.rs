use std::path::PathBuf;
use thiserror::Error;

/// Problems found while loading configuration or starting a host's TLS context.
/// These disable the affected host or endpoint, never the whole process.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot parse {path}: {source}")]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("bad config glob: {0}")]
    Glob(#[from] glob::PatternError),
    #[error("document root for host {host} already set to {existing}")]
    DuplicateDocumentRoot { host: String, existing: PathBuf },
    #[error("listen {0} is already defined")]
    DuplicateListen(String),
    #[error("bad address specification '{0}'")]
    BadAddress(String),
    #[error("unknown TLS provider '{0}'")]
    UnknownProvider(String),
    #[error("TLS configuration for {0} is already in use")]
    TlsInUse(String),
    #[error("no certificate file configured for {0}")]
    MissingCertificate(String),
    #[error("no private key found in {0}")]
    MissingKey(PathBuf),
    #[error("no certificates found in {0}")]
    EmptyCertificate(PathBuf),
    #[error("protocol mask {0:#x} leaves no supported protocol versions")]
    NoProtocols(u32),
    #[error("cipher list '{0}' matches no supported cipher suites")]
    NoCiphers(String),
    #[error("bad protocol token '{0}'")]
    BadProtocol(String),
    #[error("client verification needs a CA file or CA path")]
    NoClientRoots,
    #[error("TLS setup failed: {0}")]
    Tls(String),
    #[error("{path}:{line}: malformed record")]
    BadRecord { path: PathBuf, line: usize },
    #[error("user {0} already exists")]
    DuplicateUser(String),
    #[error("group {0} already exists")]
    DuplicateGroup(String),
    #[error("no such group {0}")]
    UnknownGroup(String),
    #[error("bad value '{value}' for {key}")]
    BadValue { key: String, value: String },
}

impl ConfigError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        ConfigError::Io {
            path: path.into(),
            source,
        }
    }
}

/// Per-connection transport failures. Only the owning connection is affected.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),
    #[error("buffer would exceed its {ceiling} byte ceiling")]
    BufferCeiling { ceiling: usize },
    #[error("TLS decode error: {0}")]
    Decode(String),
    #[error("fatal TLS alert: {0}")]
    Alert(String),
    #[error("write of {got} bytes while a {pending} byte write is pending")]
    WriteMismatch { pending: usize, got: usize },
    #[error("timed out flushing {0} bytes of TLS output")]
    FlushTimeout(usize),
    #[error("client certificate chain of {chain} exceeds verify depth {depth}")]
    VerifyDepth { chain: usize, depth: usize },
    #[error("no host address registered for {0}")]
    NoHostAddress(String),
    #[error("host address {0} has no virtual hosts")]
    NoVirtualHost(String),
    #[error("server is not serving")]
    NotServing,
    #[error("connection closed")]
    Closed,
}

/// Reasons a request failed authentication or authorization.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("wrong authentication protocol")]
    WrongScheme,
    #[error("missing authorization details")]
    MissingDetails,
    #[error("quality of protection mismatch")]
    QopMismatch,
    #[error("realm mismatch")]
    RealmMismatch,
    #[error("unknown user")]
    UnknownUser,
    #[error("wrong password")]
    WrongPassword,
    #[error("access requirement not met")]
    RequirementUnmet,
    #[error("client address denied")]
    AddressDenied,
}

impl AuthError {
    /// The specific reason, for the server log only.
    pub fn log_detail(&self) -> String {
        self.to_string()
    }

    /// Text shown to the client. Does not reveal which check failed.
    pub fn user_message(&self) -> &'static str {
        match self {
            AuthError::AddressDenied => "Access denied",
            _ => "Access denied, authentication required",
        }
    }

    /// Status code to answer with.
    pub fn status(&self) -> u16 {
        match self {
            AuthError::AddressDenied => 403,
            _ => 401,
        }
    }
}

/// Errors that prevent the server from serving at all.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("no listen endpoints configured")]
    NoListens,
    #[error("could not bind any of {0} listen endpoints")]
    NoListeners(usize),
    #[error("no virtual hosts configured")]
    NoHosts,
    #[error("server already started")]
    AlreadyStarted,
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("cannot build runtime: {0}")]
    Runtime(std::io::Error),
}
