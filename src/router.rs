use crate::auth::AuthPolicy;
use crate::host::{Directory, Location, VirtualHost};
use once_cell::sync::Lazy;
use std::path::PathBuf;

/// Policy for requests matched by no directory or location.
static OPEN_POLICY: Lazy<AuthPolicy> = Lazy::new(AuthPolicy::new);

/// Handler names served by the built-in file handler.
const STATIC_HANDLERS: &[&str] = &["static", "file", "copyHandler"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Handler {
    Static,
    /// Named by a location but not built in (answered with 501).
    Unsupported(String),
}

/// Where a request lands inside a host and which rules govern it.
#[derive(Debug)]
pub struct Route<'a> {
    pub location: Option<&'a Location>,
    pub directory: Option<&'a Directory>,
    /// Filesystem path, absent when there is no document root or the URI
    /// escapes it.
    pub storage: Option<PathBuf>,
    pub policy: &'a AuthPolicy,
    pub handler: Handler,
}

/// Resolve a canonical request path (see `request::normalize_path`) on
/// `host`. The longest matching location wins over the directory the path
/// maps into.
pub fn resolve<'a>(host: &'a VirtualHost, path: &str) -> Route<'a> {
    let location = host.find_location(path);
    let storage = host.map_to_storage(path);
    let directory = storage.as_deref().and_then(|p| host.find_best_dir(p));

    let policy = match (location, directory) {
        (Some(loc), _) => &loc.auth,
        (None, Some(dir)) => &dir.auth,
        (None, None) => &*OPEN_POLICY,
    };

    let handler = match location.and_then(|l| l.handler.as_deref()) {
        None => Handler::Static,
        Some(name) if STATIC_HANDLERS.iter().any(|h| h.eq_ignore_ascii_case(name)) => {
            Handler::Static
        }
        Some(name) => Handler::Unsupported(name.to_string()),
    };

    Route {
        location,
        directory,
        storage,
        policy,
        handler,
    }
}
