//! Flat user and group tables backed by colon-delimited text files.
//!
//! ```text
//! # enabled: user: realm: password-or-md5
//! 1: alice: example.com: 5ebe2294ecd0e0f08eab7690d2a6ee69
//! # enabled: acl: group: members
//! 1: 3: admins: alice bob
//! ```

use crate::error::ConfigError;
use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRecord {
    pub enabled: bool,
    pub name: String,
    pub realm: String,
    pub password: String,
    /// Union of the ACLs of every enabled group the user belongs to.
    pub acl: u64,
}

impl UserRecord {
    /// `MD5(user:realm:password)`, whether stored hashed or in plain text.
    pub fn ha1(&self) -> String {
        if is_md5_hex(&self.password) {
            self.password.to_ascii_lowercase()
        } else {
            super::digest::md5_hex(&format!("{}:{}:{}", self.name, self.realm, self.password))
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupRecord {
    pub enabled: bool,
    pub acl: u64,
    pub name: String,
    pub users: Vec<String>,
}

fn is_md5_hex(s: &str) -> bool {
    s.len() == 32 && s.bytes().all(|b| b.is_ascii_hexdigit())
}

fn user_key(name: &str, realm: &str) -> String {
    format!("{}:{}", name, realm)
}

/// Users keyed by `name:realm`.
#[derive(Debug, Clone, Default)]
pub struct UserStore {
    users: BTreeMap<String, UserRecord>,
}

impl UserStore {
    pub fn new() -> Self {
        UserStore::default()
    }

    /// Load records from `path`, replacing same-named entries.
    pub fn load(&mut self, path: &Path) -> Result<usize, ConfigError> {
        let content = fs::read_to_string(path).map_err(|e| ConfigError::io(path, e))?;
        let mut count = 0;
        for (idx, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let fields: Vec<&str> = line.splitn(4, ':').map(str::trim).collect();
            if fields.len() != 4 || fields[1].is_empty() {
                return Err(ConfigError::BadRecord {
                    path: path.to_path_buf(),
                    line: idx + 1,
                });
            }
            let record = UserRecord {
                enabled: fields[0] != "0",
                name: fields[1].to_string(),
                realm: fields[2].to_string(),
                password: fields[3].to_string(),
                acl: 0,
            };
            self.users.insert(user_key(&record.name, &record.realm), record);
            count += 1;
        }
        log::debug!("Loaded {} users from {}", count, path.display());
        Ok(count)
    }

    pub fn add_user(
        &mut self,
        name: &str,
        realm: &str,
        password: &str,
        enabled: bool,
    ) -> Result<(), ConfigError> {
        let key = user_key(name, realm);
        if self.users.contains_key(&key) {
            return Err(ConfigError::DuplicateUser(key));
        }
        self.users.insert(
            key,
            UserRecord {
                enabled,
                name: name.to_string(),
                realm: realm.to_string(),
                password: password.to_string(),
                acl: 0,
            },
        );
        Ok(())
    }

    pub fn remove_user(&mut self, name: &str, realm: &str) -> Option<UserRecord> {
        self.users.remove(&user_key(name, realm))
    }

    pub fn set_enabled(&mut self, name: &str, realm: &str, enabled: bool) -> bool {
        match self.users.get_mut(&user_key(name, realm)) {
            Some(u) => {
                u.enabled = enabled;
                true
            }
            None => false,
        }
    }

    pub fn lookup(&self, name: &str, realm: &str) -> Option<&UserRecord> {
        self.users.get(&user_key(name, realm))
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &UserRecord> {
        self.users.values()
    }

    fn render(&self) -> String {
        let mut out = String::new();
        for u in self.users.values() {
            out.push_str(&format!(
                "{}: {}: {}: {}\n",
                u8::from(u.enabled),
                u.name,
                u.realm,
                u.password
            ));
        }
        out
    }

    /// Write the table to a temp file beside `path`. Nothing changes at
    /// `path` until the returned write is committed.
    pub fn stage(&self, path: &Path) -> Result<StagedWrite, ConfigError> {
        StagedWrite::create(path, &self.render())
    }

    pub fn write(&self, path: &Path) -> Result<(), ConfigError> {
        self.stage(path)?.commit()
    }
}

/// Groups keyed by name.
#[derive(Debug, Clone, Default)]
pub struct GroupStore {
    groups: BTreeMap<String, GroupRecord>,
}

impl GroupStore {
    pub fn new() -> Self {
        GroupStore::default()
    }

    pub fn load(&mut self, path: &Path) -> Result<usize, ConfigError> {
        let content = fs::read_to_string(path).map_err(|e| ConfigError::io(path, e))?;
        let mut count = 0;
        for (idx, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let bad = || ConfigError::BadRecord {
                path: path.to_path_buf(),
                line: idx + 1,
            };
            let fields: Vec<&str> = line.splitn(4, ':').map(str::trim).collect();
            if fields.len() < 3 || fields[2].is_empty() {
                return Err(bad());
            }
            let acl = parse_acl(fields[1]).ok_or_else(bad)?;
            let users = fields
                .get(3)
                .map(|list| {
                    list.split(|c: char| c == ',' || c.is_whitespace())
                        .filter(|s| !s.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default();
            let record = GroupRecord {
                enabled: fields[0] != "0",
                acl,
                name: fields[2].to_string(),
                users,
            };
            self.groups.insert(record.name.clone(), record);
            count += 1;
        }
        log::debug!("Loaded {} groups from {}", count, path.display());
        Ok(count)
    }

    pub fn add_group(&mut self, name: &str, acl: u64, users: &[&str]) -> Result<(), ConfigError> {
        if self.groups.contains_key(name) {
            return Err(ConfigError::DuplicateGroup(name.to_string()));
        }
        self.groups.insert(
            name.to_string(),
            GroupRecord {
                enabled: true,
                acl,
                name: name.to_string(),
                users: users.iter().map(|u| u.to_string()).collect(),
            },
        );
        Ok(())
    }

    pub fn remove_group(&mut self, name: &str) -> Option<GroupRecord> {
        self.groups.remove(name)
    }

    pub fn add_member(&mut self, group: &str, user: &str) -> Result<(), ConfigError> {
        let g = self
            .groups
            .get_mut(group)
            .ok_or_else(|| ConfigError::UnknownGroup(group.to_string()))?;
        if !g.users.iter().any(|u| u == user) {
            g.users.push(user.to_string());
        }
        Ok(())
    }

    pub fn remove_member(&mut self, group: &str, user: &str) -> Result<(), ConfigError> {
        let g = self
            .groups
            .get_mut(group)
            .ok_or_else(|| ConfigError::UnknownGroup(group.to_string()))?;
        g.users.retain(|u| u != user);
        Ok(())
    }

    pub fn set_enabled(&mut self, name: &str, enabled: bool) -> bool {
        match self.groups.get_mut(name) {
            Some(g) => {
                g.enabled = enabled;
                true
            }
            None => false,
        }
    }

    pub fn set_acl(&mut self, name: &str, acl: u64) -> bool {
        match self.groups.get_mut(name) {
            Some(g) => {
                g.acl = acl;
                true
            }
            None => false,
        }
    }

    pub fn lookup(&self, name: &str) -> Option<&GroupRecord> {
        self.groups.get(name)
    }

    /// True if `user` is listed in the enabled group `group`.
    pub fn is_member(&self, group: &str, user: &str) -> bool {
        self.groups
            .get(group)
            .map(|g| g.enabled && g.users.iter().any(|u| u == user))
            .unwrap_or(false)
    }

    pub fn iter(&self) -> impl Iterator<Item = &GroupRecord> {
        self.groups.values()
    }

    fn render(&self) -> String {
        let mut out = String::new();
        for g in self.groups.values() {
            out.push_str(&format!(
                "{}: {:x}: {}: {}\n",
                u8::from(g.enabled),
                g.acl,
                g.name,
                g.users.join(" ")
            ));
        }
        out
    }

    pub fn stage(&self, path: &Path) -> Result<StagedWrite, ConfigError> {
        StagedWrite::create(path, &self.render())
    }

    pub fn write(&self, path: &Path) -> Result<(), ConfigError> {
        self.stage(path)?.commit()
    }
}

/// Parse a hex ACL mask, with or without a `0x` prefix.
pub fn parse_acl(s: &str) -> Option<u64> {
    let s = s.trim();
    let digits = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s);
    if digits.is_empty() {
        return Some(0);
    }
    u64::from_str_radix(digits, 16).ok()
}

/// Recompute each user's ACL from the enabled groups listing them.
pub fn update_user_acls(users: &mut UserStore, groups: &GroupStore) {
    for user in users.users.values_mut() {
        user.acl = groups
            .groups
            .values()
            .filter(|g| g.enabled && g.users.iter().any(|u| u == &user.name))
            .fold(0, |acl, g| acl | g.acl);
    }
}

/// Distinguishes concurrent stages of one target within a process.
static STAGE_SEQ: AtomicUsize = AtomicUsize::new(0);

/// A fully written temp file waiting to be renamed over its target.
#[derive(Debug)]
pub struct StagedWrite {
    temp: PathBuf,
    target: PathBuf,
    committed: bool,
}

impl StagedWrite {
    fn create(target: &Path, content: &str) -> Result<Self, ConfigError> {
        let dir = target
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let name = target
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "auth".to_string());
        let seq = STAGE_SEQ.fetch_add(1, Ordering::Relaxed);
        let temp = dir.join(format!(".{}.{}.{}.tmp", name, std::process::id(), seq));

        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&temp)
            .map_err(|e| ConfigError::io(&temp, e))?;
        file.write_all(content.as_bytes())
            .and_then(|_| file.sync_all())
            .map_err(|e| ConfigError::io(&temp, e))?;

        Ok(StagedWrite {
            temp,
            target: target.to_path_buf(),
            committed: false,
        })
    }

    pub fn temp_path(&self) -> &Path {
        &self.temp
    }

    /// Atomically replace the target with the staged file.
    pub fn commit(mut self) -> Result<(), ConfigError> {
        fs::rename(&self.temp, &self.target).map_err(|e| ConfigError::io(&self.target, e))?;
        self.committed = true;
        Ok(())
    }
}

impl Drop for StagedWrite {
    fn drop(&mut self) {
        if !self.committed {
            let _ = fs::remove_file(&self.temp);
        }
    }
}
