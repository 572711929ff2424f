use std::net::IpAddr;

/// Evaluation order for Allow/Deny rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AccessOrder {
    /// Default deny. Allowed only if an Allow rule matches and no Deny rule does.
    AllowDeny,
    /// Default allow. Denied only if a Deny rule matches and no Allow rule does.
    #[default]
    DenyAllow,
}

impl AccessOrder {
    pub fn parse(s: &str) -> Option<Self> {
        let normalized: String = s
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect::<String>()
            .to_ascii_lowercase();
        match normalized.as_str() {
            "allow,deny" => Some(AccessOrder::AllowDeny),
            "deny,allow" => Some(AccessOrder::DenyAllow),
            _ => None,
        }
    }
}

/// Client address rules attached to a directory or location.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccessRules {
    pub order: AccessOrder,
    pub allow: Vec<String>,
    pub deny: Vec<String>,
}

impl AccessRules {
    pub fn is_empty(&self) -> bool {
        self.allow.is_empty() && self.deny.is_empty()
    }
}

/// Result of access control check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessResult {
    /// Access is allowed
    Allowed,
    /// Access is denied (403)
    Denied,
}

/// Check a client address against Allow/Deny rules.
///
/// With no rules configured every client is allowed. An unknown client
/// address matches only the `all` keyword.
pub fn check_access(rules: &AccessRules, client_ip: Option<&IpAddr>) -> AccessResult {
    if rules.is_empty() {
        return AccessResult::Allowed;
    }
    let allowed = matches_any(&rules.allow, client_ip);
    let denied = matches_any(&rules.deny, client_ip);

    let ok = match rules.order {
        AccessOrder::AllowDeny => allowed && !denied,
        AccessOrder::DenyAllow => !denied || allowed,
    };
    if ok {
        AccessResult::Allowed
    } else {
        AccessResult::Denied
    }
}

fn matches_any(patterns: &[String], client_ip: Option<&IpAddr>) -> bool {
    patterns.iter().any(|p| match client_ip {
        Some(ip) => ip_matches(ip, p),
        None => p.eq_ignore_ascii_case("all"),
    })
}

/// Match one rule: `all`, a CIDR range, a single address or a dotted prefix
/// such as `192.168.` that matches every address beginning with it.
pub fn ip_matches(ip: &IpAddr, pattern: &str) -> bool {
    let pattern = pattern.trim();
    if pattern.is_empty() {
        return false;
    }
    if pattern.contains('/') || pattern.eq_ignore_ascii_case("all") || pattern.parse::<IpAddr>().is_ok() {
        return ip_matches_cidr(ip, pattern);
    }
    // Partial address prefix.
    if pattern.ends_with('.') && pattern.bytes().all(|b| b.is_ascii_digit() || b == b'.') {
        return matches!(ip, IpAddr::V4(_)) && ip.to_string().starts_with(pattern);
    }
    false
}

/// Check whether a given IP matches a CIDR notation address.
/// Supports single IPs (e.g., "192.168.1.1") and CIDR ranges (e.g., "192.168.1.0/24").
fn ip_matches_cidr(ip: &IpAddr, cidr: &str) -> bool {
    // Handle "all" special keyword
    if cidr.eq_ignore_ascii_case("all") {
        return true;
    }

    if let Some((network_str, prefix_str)) = cidr.split_once('/') {
        let network_ip: IpAddr = match network_str.parse() {
            Ok(ip) => ip,
            Err(_) => return false,
        };
        let prefix_len: u32 = match prefix_str.parse() {
            Ok(p) => p,
            Err(_) => return false,
        };

        match (ip, &network_ip) {
            (IpAddr::V4(client), IpAddr::V4(network)) => {
                if prefix_len > 32 {
                    return false;
                }
                if prefix_len == 0 {
                    return true;
                }
                let mask = u32::MAX.checked_shl(32 - prefix_len).unwrap_or(0);
                (u32::from(*client) & mask) == (u32::from(*network) & mask)
            }
            (IpAddr::V6(client), IpAddr::V6(network)) => {
                if prefix_len > 128 {
                    return false;
                }
                if prefix_len == 0 {
                    return true;
                }
                let mask = u128::MAX.checked_shl(128 - prefix_len).unwrap_or(0);
                (u128::from(*client) & mask) == (u128::from(*network) & mask)
            }
            _ => false, // Mismatched IP versions
        }
    } else {
        match cidr.parse::<IpAddr>() {
            Ok(addr) => ip == &addr,
            Err(_) => false,
        }
    }
}
