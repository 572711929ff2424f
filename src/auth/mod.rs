//! Request authentication: Basic and Digest credentials checked against a
//! host's user and group stores, plus the Require rules of a policy.

pub mod digest;
pub mod store;

use crate::access_control::{AccessOrder, AccessRules};
use crate::error::AuthError;
use crate::host::VirtualHost;
use base64::Engine;
use std::sync::atomic::Ordering;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuthScheme {
    #[default]
    None,
    Basic,
    Digest,
}

impl AuthScheme {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "none" => Some(AuthScheme::None),
            "basic" => Some(AuthScheme::Basic),
            "digest" => Some(AuthScheme::Digest),
            _ => None,
        }
    }

    pub fn token(&self) -> &'static str {
        match self {
            AuthScheme::None => "none",
            AuthScheme::Basic => "Basic",
            AuthScheme::Digest => "Digest",
        }
    }
}

/// Who may reach a directory or location, and how they prove it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthPolicy {
    scheme: AuthScheme,
    realm: String,
    required_users: Vec<String>,
    required_groups: Vec<String>,
    required_acl: u64,
    any_valid_user: bool,
    qop: Option<String>,
    inherited: bool,
    access: AccessRules,
}

fn split_names(list: &str) -> Vec<String> {
    list.split(|c: char| c == ',' || c.is_whitespace())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

impl AuthPolicy {
    pub fn new() -> Self {
        AuthPolicy::default()
    }

    /// A copy of `parent` marked as inherited.
    pub fn inherit_from(parent: &AuthPolicy) -> Self {
        AuthPolicy {
            inherited: true,
            ..parent.clone()
        }
    }

    pub fn set_scheme(&mut self, scheme: AuthScheme) -> &mut Self {
        self.scheme = scheme;
        self.inherited = false;
        self
    }

    pub fn set_realm(&mut self, realm: &str) -> &mut Self {
        self.realm = realm.to_string();
        self.inherited = false;
        self
    }

    pub fn set_required_users(&mut self, users: &str) -> &mut Self {
        self.required_users = split_names(users);
        self.inherited = false;
        self
    }

    pub fn set_required_groups(&mut self, groups: &str) -> &mut Self {
        self.required_groups = split_names(groups);
        self.inherited = false;
        self
    }

    pub fn set_required_acl(&mut self, acl: u64) -> &mut Self {
        self.required_acl = acl;
        self.inherited = false;
        self
    }

    pub fn set_any_valid_user(&mut self) -> &mut Self {
        self.any_valid_user = true;
        self.inherited = false;
        self
    }

    pub fn set_qop(&mut self, qop: &str) -> &mut Self {
        let qop = qop.trim();
        self.qop = match qop {
            "" | "none" => None,
            q => Some(q.to_string()),
        };
        self.inherited = false;
        self
    }

    pub fn set_order(&mut self, order: AccessOrder) -> &mut Self {
        self.access.order = order;
        self
    }

    pub fn add_allow(&mut self, pattern: &str) -> &mut Self {
        self.access.allow.push(pattern.to_string());
        self
    }

    pub fn add_deny(&mut self, pattern: &str) -> &mut Self {
        self.access.deny.push(pattern.to_string());
        self
    }

    pub fn scheme(&self) -> AuthScheme {
        self.scheme
    }

    pub fn realm(&self) -> &str {
        &self.realm
    }

    pub fn qop(&self) -> Option<&str> {
        self.qop.as_deref()
    }

    pub fn is_inherited(&self) -> bool {
        self.inherited
    }

    pub fn access(&self) -> &AccessRules {
        &self.access
    }

    pub fn has_requirements(&self) -> bool {
        self.any_valid_user
            || !self.required_users.is_empty()
            || !self.required_groups.is_empty()
            || self.required_acl != 0
    }

    /// True if `user` satisfies at least one configured Require rule.
    fn satisfied_by(&self, user: &store::UserRecord, host: &VirtualHost) -> bool {
        if !self.has_requirements() || self.any_valid_user {
            return true;
        }
        if self.required_users.iter().any(|u| u == &user.name) {
            return true;
        }
        let groups = host.groups();
        if self
            .required_groups
            .iter()
            .any(|g| groups.is_member(g, &user.name))
        {
            return true;
        }
        self.required_acl & user.acl != 0
    }
}

/// What the handler needs from a request to decide on credentials.
#[derive(Debug, Clone)]
pub struct AuthRequest<'a> {
    pub method: &'a str,
    pub uri: &'a str,
    /// Scheme token of the `Authorization` header, if any.
    pub auth_type: Option<&'a str>,
    /// Everything after the scheme token.
    pub auth_details: Option<&'a str>,
    /// Entity tag of the requested resource, used to scope Digest nonces.
    pub etag: &'a str,
    pub access_errors: u32,
}

impl<'a> AuthRequest<'a> {
    pub fn new(method: &'a str, uri: &'a str) -> Self {
        AuthRequest {
            method,
            uri,
            auth_type: None,
            auth_details: None,
            etag: "",
            access_errors: 0,
        }
    }

    pub fn with_authorization(mut self, auth_type: &'a str, details: &'a str) -> Self {
        self.auth_type = Some(auth_type);
        self.auth_details = Some(details);
        self
    }

    pub fn with_etag(mut self, etag: &'a str) -> Self {
        self.etag = etag;
        self
    }
}

/// The authenticated user attached to a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user: String,
    pub realm: String,
    pub scheme: AuthScheme,
    pub acl: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthState {
    NoAuthRequired,
    /// No credentials offered. Answer 401 with the challenge.
    AwaitingCredentials { challenge: String },
    Rejected {
        error: AuthError,
        challenge: Option<String>,
    },
    Accepted(Identity),
}

impl AuthState {
    pub fn is_allowed(&self) -> bool {
        matches!(self, AuthState::NoAuthRequired | AuthState::Accepted(_))
    }
}

/// `WWW-Authenticate` value for `policy` on `host`.
pub fn challenge(policy: &AuthPolicy, host: &VirtualHost, etag: &str) -> Option<String> {
    match policy.scheme {
        AuthScheme::None => None,
        AuthScheme::Basic => Some(format!("Basic realm=\"{}\"", policy.realm)),
        AuthScheme::Digest => {
            let now = chrono::Utc::now().timestamp();
            let nonce = digest::make_nonce(host.secret(), etag, &policy.realm, now);
            Some(digest::challenge(
                &policy.realm,
                host.name(),
                &nonce,
                etag,
                policy.qop(),
            ))
        }
    }
}

enum Credentials {
    Basic { user: String, password: String },
    Digest(digest::DigestCredentials),
}

fn decode(scheme: AuthScheme, details: &str) -> Option<Credentials> {
    match scheme {
        AuthScheme::Basic => {
            let decoded = base64::engine::general_purpose::STANDARD
                .decode(details.trim())
                .ok()?;
            let text = String::from_utf8(decoded).ok()?;
            let (user, password) = text.split_once(':')?;
            if user.is_empty() {
                return None;
            }
            Some(Credentials::Basic {
                user: user.to_string(),
                password: password.to_string(),
            })
        }
        AuthScheme::Digest => digest::parse_credentials(details).map(Credentials::Digest),
        AuthScheme::None => None,
    }
}

fn reject(
    req: &mut AuthRequest<'_>,
    policy: &AuthPolicy,
    host: &VirtualHost,
    error: AuthError,
    detail: &str,
) -> AuthState {
    req.access_errors += 1;
    host.stats().access_errors.fetch_add(1, Ordering::Relaxed);
    log::warn!(
        "{}: {} {} on {} ({})",
        error.user_message(),
        req.method,
        req.uri,
        host.name(),
        if detail.is_empty() { error.log_detail() } else { format!("{}: {}", error.log_detail(), detail) }
    );
    AuthState::Rejected {
        error,
        challenge: challenge(policy, host, req.etag),
    }
}

/// Decide whether `req` may proceed under `policy`.
pub fn authenticate(req: &mut AuthRequest<'_>, policy: &AuthPolicy, host: &VirtualHost) -> AuthState {
    if policy.scheme == AuthScheme::None {
        return AuthState::NoAuthRequired;
    }

    let auth_type = match req.auth_type {
        Some(t) if !t.is_empty() => t,
        _ => {
            log::debug!("Requesting {} credentials for {}", policy.scheme.token(), req.uri);
            return match challenge(policy, host, req.etag) {
                Some(challenge) => AuthState::AwaitingCredentials { challenge },
                None => AuthState::NoAuthRequired,
            };
        }
    };

    if !auth_type.eq_ignore_ascii_case(policy.scheme.token()) {
        return reject(req, policy, host, AuthError::WrongScheme, auth_type);
    }

    let details = req.auth_details.unwrap_or("");
    let credentials = match decode(policy.scheme, details) {
        Some(c) => c,
        None => return reject(req, policy, host, AuthError::MissingDetails, ""),
    };

    let (name, realm) = match &credentials {
        Credentials::Basic { user, .. } => (user.clone(), policy.realm.clone()),
        Credentials::Digest(d) => {
            if let Some(wanted) = policy.qop() {
                let offered = d.qop.as_deref().unwrap_or("");
                if offered != wanted && !(wanted == "auth-int" && offered == "auth") {
                    return reject(req, policy, host, AuthError::QopMismatch, offered);
                }
            }
            if d.realm != policy.realm {
                return reject(req, policy, host, AuthError::RealmMismatch, &d.realm);
            }
            (d.username.clone(), d.realm.clone())
        }
    };

    let user = match host.users().lookup(&name, &realm) {
        Some(u) if u.enabled => u,
        Some(_) => return reject(req, policy, host, AuthError::UnknownUser, "account disabled"),
        None => return reject(req, policy, host, AuthError::UnknownUser, &name),
    };

    let valid = match &credentials {
        Credentials::Basic { password, .. } => {
            digest::md5_hex(&format!("{}:{}:{}", name, realm, password)) == user.ha1()
        }
        Credentials::Digest(d) => digest::expected_response(&user.ha1(), req.method, d)
            .eq_ignore_ascii_case(&d.response),
    };
    if !valid {
        return reject(req, policy, host, AuthError::WrongPassword, &name);
    }

    if !policy.satisfied_by(user, host) {
        return reject(req, policy, host, AuthError::RequirementUnmet, &name);
    }

    log::debug!("User {} authenticated for {}", name, req.uri);
    AuthState::Accepted(Identity {
        user: name,
        realm,
        scheme: policy.scheme,
        acl: user.acl,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use digest::{expected_response, md5_hex, DigestCredentials};

    fn make_host() -> VirtualHost {
        let mut host = VirtualHost::new("a.example.com", "*:8443");
        host.users_mut()
            .add_user("alice", "example.com", "secret", true)
            .unwrap();
        host.users_mut()
            .add_user("bob", "example.com", &md5_hex("bob:example.com:pw"), true)
            .unwrap();
        host.users_mut()
            .add_user("mallory", "example.com", "evil", false)
            .unwrap();
        host.groups_mut().add_group("admins", 0x2, &["bob"]).unwrap();
        host.update_user_acls();
        host
    }

    fn make_policy(scheme: AuthScheme) -> AuthPolicy {
        let mut policy = AuthPolicy::new();
        policy.set_scheme(scheme).set_realm("example.com");
        policy
    }

    fn basic(user: &str, pass: &str) -> String {
        base64::engine::general_purpose::STANDARD.encode(format!("{}:{}", user, pass))
    }

    fn digest_header(user: &str, password: &str, uri: &str, qop: bool) -> String {
        let creds = DigestCredentials {
            username: user.into(),
            realm: "example.com".into(),
            nonce: "abc123".into(),
            uri: uri.into(),
            response: String::new(),
            qop: qop.then(|| "auth".to_string()),
            nc: qop.then(|| "00000001".to_string()),
            cnonce: qop.then(|| "0a4f113b".to_string()),
            opaque: None,
            algorithm: None,
        };
        let ha1 = md5_hex(&format!("{}:example.com:{}", user, password));
        let response = expected_response(&ha1, "GET", &creds);
        let mut header = format!(
            "username=\"{}\", realm=\"example.com\", nonce=\"abc123\", uri=\"{}\", response=\"{}\"",
            user, uri, response
        );
        if qop {
            header.push_str(", qop=auth, nc=00000001, cnonce=\"0a4f113b\"");
        }
        header
    }

    fn run(policy: &AuthPolicy, host: &VirtualHost, auth: Option<(&str, &str)>) -> (AuthState, u32) {
        let mut req = AuthRequest::new("GET", "/private/index.html").with_etag("1a-2b-3c");
        if let Some((t, d)) = auth {
            req = req.with_authorization(t, d);
        }
        let state = authenticate(&mut req, policy, host);
        (state, req.access_errors)
    }

    fn rejected(state: &AuthState) -> Option<AuthError> {
        match state {
            AuthState::Rejected { error, .. } => Some(error.clone()),
            _ => None,
        }
    }

    // ─── State transitions ──────────────────────────────────

    #[test]
    fn test_no_scheme_needs_no_auth() {
        let host = make_host();
        let (state, errors) = run(&AuthPolicy::new(), &host, Some(("Basic", "garbage")));
        assert_eq!(state, AuthState::NoAuthRequired);
        assert_eq!(errors, 0);
    }

    #[test]
    fn test_basic_challenge() {
        let host = make_host();
        let (state, _) = run(&make_policy(AuthScheme::Basic), &host, None);
        assert_eq!(
            state,
            AuthState::AwaitingCredentials {
                challenge: "Basic realm=\"example.com\"".to_string()
            }
        );
    }

    #[test]
    fn test_digest_challenge_with_qop() {
        let host = make_host();
        let mut policy = make_policy(AuthScheme::Digest);
        policy.set_qop("auth");
        let (state, _) = run(&policy, &host, None);
        let challenge = match state {
            AuthState::AwaitingCredentials { challenge } => challenge,
            other => panic!("unexpected {:?}", other),
        };
        assert!(challenge.starts_with(
            "Digest realm=\"example.com\", domain=\"a.example.com\", qop=\"auth\", nonce=\""
        ));
        assert!(challenge.ends_with("opaque=\"1a-2b-3c\", algorithm=\"MD5\", stale=\"FALSE\""));
    }

    #[test]
    fn test_wrong_scheme_rejected() {
        let host = make_host();
        let (state, errors) = run(
            &make_policy(AuthScheme::Digest),
            &host,
            Some(("Basic", &basic("alice", "secret"))),
        );
        assert_eq!(rejected(&state), Some(AuthError::WrongScheme));
        assert_eq!(errors, 1);
        assert_eq!(host.stats().access_errors.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_garbled_basic_rejected() {
        let host = make_host();
        let (state, _) = run(&make_policy(AuthScheme::Basic), &host, Some(("Basic", "!!!")));
        assert_eq!(rejected(&state), Some(AuthError::MissingDetails));
    }

    // ─── Basic ──────────────────────────────────────────────

    #[test]
    fn test_basic_accepts_plain_and_hashed_passwords() {
        let host = make_host();
        let policy = make_policy(AuthScheme::Basic);
        let (state, _) = run(&policy, &host, Some(("Basic", &basic("alice", "secret"))));
        assert!(matches!(state, AuthState::Accepted(ref id) if id.user == "alice"));
        let (state, _) = run(&policy, &host, Some(("basic", &basic("bob", "pw"))));
        assert!(state.is_allowed());
    }

    #[test]
    fn test_unknown_user_and_wrong_password_look_alike() {
        let host = make_host();
        let policy = make_policy(AuthScheme::Basic);
        let (unknown, _) = run(&policy, &host, Some(("Basic", &basic("eve", "secret"))));
        let (wrong, _) = run(&policy, &host, Some(("Basic", &basic("alice", "nope"))));
        let unknown = rejected(&unknown).unwrap();
        let wrong = rejected(&wrong).unwrap();
        assert_eq!(unknown, AuthError::UnknownUser);
        assert_eq!(wrong, AuthError::WrongPassword);
        assert_eq!(unknown.user_message(), wrong.user_message());
    }

    #[test]
    fn test_disabled_user_rejected() {
        let host = make_host();
        let (state, _) = run(
            &make_policy(AuthScheme::Basic),
            &host,
            Some(("Basic", &basic("mallory", "evil"))),
        );
        assert_eq!(rejected(&state), Some(AuthError::UnknownUser));
    }

    // ─── Digest ─────────────────────────────────────────────

    #[test]
    fn test_digest_round_trip() {
        let host = make_host();
        let policy = make_policy(AuthScheme::Digest);
        for qop in [false, true] {
            let header = digest_header("alice", "secret", "/private/index.html", qop);
            let (state, _) = run(&policy, &host, Some(("Digest", &header)));
            assert!(state.is_allowed(), "qop={} gave {:?}", qop, state);
        }
        let header = digest_header("bob", "pw", "/x", true);
        let (state, _) = run(&policy, &host, Some(("Digest", &header)));
        assert!(state.is_allowed());
    }

    #[test]
    fn test_digest_flipped_response_rejected() {
        let host = make_host();
        let policy = make_policy(AuthScheme::Digest);
        let header = digest_header("alice", "secret", "/private/index.html", true);
        let start = header.find("response=\"").unwrap() + "response=\"".len();
        for offset in [0, 13, 31] {
            let mut bytes = header.clone().into_bytes();
            bytes[start + offset] = if bytes[start + offset] == b'0' { b'1' } else { b'0' };
            let tampered = String::from_utf8(bytes).unwrap();
            let (state, _) = run(&policy, &host, Some(("Digest", &tampered)));
            assert_eq!(rejected(&state), Some(AuthError::WrongPassword));
        }
    }

    #[test]
    fn test_digest_missing_fields() {
        let host = make_host();
        let (state, _) = run(
            &make_policy(AuthScheme::Digest),
            &host,
            Some(("Digest", "username=\"alice\", realm=\"example.com\"")),
        );
        assert_eq!(rejected(&state), Some(AuthError::MissingDetails));
    }

    #[test]
    fn test_digest_qop_mismatch() {
        let host = make_host();
        let mut policy = make_policy(AuthScheme::Digest);
        policy.set_qop("auth");
        let header = digest_header("alice", "secret", "/", false);
        let (state, _) = run(&policy, &host, Some(("Digest", &header)));
        assert_eq!(rejected(&state), Some(AuthError::QopMismatch));
    }

    #[test]
    fn test_digest_realm_mismatch() {
        let host = make_host();
        let mut policy = make_policy(AuthScheme::Digest);
        policy.set_realm("elsewhere");
        let header = digest_header("alice", "secret", "/", false);
        let (state, _) = run(&policy, &host, Some(("Digest", &header)));
        assert_eq!(rejected(&state), Some(AuthError::RealmMismatch));
    }

    // ─── Require ────────────────────────────────────────────

    #[test]
    fn test_required_user() {
        let host = make_host();
        let mut policy = make_policy(AuthScheme::Basic);
        policy.set_required_users("bob carol");
        let (state, _) = run(&policy, &host, Some(("Basic", &basic("alice", "secret"))));
        assert_eq!(rejected(&state), Some(AuthError::RequirementUnmet));
        let (state, _) = run(&policy, &host, Some(("Basic", &basic("bob", "pw"))));
        assert!(state.is_allowed());
    }

    #[test]
    fn test_required_group_and_acl() {
        let host = make_host();
        let mut by_group = make_policy(AuthScheme::Basic);
        by_group.set_required_groups("admins");
        let (state, _) = run(&by_group, &host, Some(("Basic", &basic("bob", "pw"))));
        assert!(state.is_allowed());
        let (state, _) = run(&by_group, &host, Some(("Basic", &basic("alice", "secret"))));
        assert_eq!(rejected(&state), Some(AuthError::RequirementUnmet));

        let mut by_acl = make_policy(AuthScheme::Basic);
        by_acl.set_required_acl(0x6);
        let (state, _) = run(&by_acl, &host, Some(("Basic", &basic("bob", "pw"))));
        assert!(matches!(state, AuthState::Accepted(ref id) if id.acl == 0x2));
    }

    #[test]
    fn test_valid_user_accepts_anyone() {
        let host = make_host();
        let mut policy = make_policy(AuthScheme::Basic);
        policy.set_required_users("nobody").set_any_valid_user();
        let (state, _) = run(&policy, &host, Some(("Basic", &basic("alice", "secret"))));
        assert!(state.is_allowed());
    }

    #[test]
    fn test_inherit_marks_policy() {
        let parent = make_policy(AuthScheme::Basic);
        let child = AuthPolicy::inherit_from(&parent);
        assert!(child.is_inherited());
        assert_eq!(child.realm(), "example.com");
        let mut child = child;
        child.set_realm("other");
        assert!(!child.is_inherited());
    }
}
