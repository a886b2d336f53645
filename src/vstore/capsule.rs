//! Permission capsules.
//!
//! A capsule names the OS resources a handler (or a whole shard) may touch.
//! Capsules only ever narrow: a shard capsule must be a strict subset of
//! its parent's, and the scheduler derives shard capsules with network off
//! and filesystem writes off by default.

use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Resource allow-lists for one handler or shard.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionCapsule {
    /// Filesystem subtrees readable by the holder
    pub fs_read: Vec<PathBuf>,
    /// Filesystem subtrees writable by the holder
    pub fs_write: Vec<PathBuf>,
    /// Network domains reachable by the holder (suffix match)
    pub net_domains: Vec<String>,
    /// Executable binaries the holder may spawn (basename match)
    pub exec_binaries: Vec<String>,
    /// Environment variables the holder may read
    pub env_vars: Vec<String>,
}

/// Lexically normalize a path: resolve `.` and `..` without touching the
/// filesystem, so traversal cannot escape an allowed subtree.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for comp in path.components() {
        match comp {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    out
}

fn under_any(path: &Path, roots: &[PathBuf]) -> bool {
    let path = normalize(path);
    roots
        .iter()
        .any(|root| path.starts_with(normalize(root)))
}

impl PermissionCapsule {
    /// A capsule permitting nothing.
    pub fn deny_all() -> Self {
        Self::default()
    }

    /// Allow reads under a subtree.
    pub fn allow_fs_read(mut self, root: impl Into<PathBuf>) -> Self {
        self.fs_read.push(root.into());
        self
    }

    /// Allow writes under a subtree (implies reads there).
    pub fn allow_fs_write(mut self, root: impl Into<PathBuf>) -> Self {
        self.fs_write.push(root.into());
        self
    }

    /// Allow network access to a domain (and its subdomains).
    pub fn allow_net(mut self, domain: impl Into<String>) -> Self {
        self.net_domains.push(domain.into());
        self
    }

    /// Allow spawning a binary.
    pub fn allow_exec(mut self, binary: impl Into<String>) -> Self {
        self.exec_binaries.push(binary.into());
        self
    }

    /// Allow reading an environment variable.
    pub fn allow_env(mut self, var: impl Into<String>) -> Self {
        self.env_vars.push(var.into());
        self
    }

    /// Whether reading `path` is allowed.
    pub fn allows_fs_read(&self, path: &Path) -> bool {
        under_any(path, &self.fs_read) || under_any(path, &self.fs_write)
    }

    /// Whether writing `path` is allowed.
    pub fn allows_fs_write(&self, path: &Path) -> bool {
        under_any(path, &self.fs_write)
    }

    /// Whether `domain` is allowed: exact match or subdomain of an entry.
    pub fn allows_net(&self, domain: &str) -> bool {
        self.net_domains.iter().any(|allowed| {
            domain == allowed || domain.ends_with(&format!(".{}", allowed))
        })
    }

    /// Whether spawning `binary` (by basename) is allowed.
    pub fn allows_exec(&self, binary: &str) -> bool {
        let base = Path::new(binary)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(binary);
        self.exec_binaries.iter().any(|b| b == base)
    }

    /// Whether reading environment variable `var` is allowed.
    pub fn allows_env(&self, var: &str) -> bool {
        self.env_vars.iter().any(|v| v == var)
    }

    /// Whether every grant in `self` is covered by `parent`. Used to reject
    /// any attempt by a shard to widen its capsule.
    pub fn is_subset_of(&self, parent: &Self) -> bool {
        self.fs_read
            .iter()
            .all(|p| parent.allows_fs_read(p))
            && self.fs_write.iter().all(|p| parent.allows_fs_write(p))
            && self.net_domains.iter().all(|d| parent.allows_net(d))
            && self.exec_binaries.iter().all(|b| parent.allows_exec(b))
            && self.env_vars.iter().all(|v| parent.allows_env(v))
    }

    /// Default shard narrowing: reads survive, writes and network are
    /// dropped, exec and env survive only when the parent granted them.
    pub fn narrowed_for_shard(&self) -> Self {
        Self {
            fs_read: self.fs_read.clone(),
            fs_write: Vec::new(),
            net_domains: Vec::new(),
            exec_binaries: self.exec_binaries.clone(),
            env_vars: self.env_vars.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fs_prefix_and_traversal() {
        let capsule = PermissionCapsule::deny_all().allow_fs_read("/repo/src");
        assert!(capsule.allows_fs_read(Path::new("/repo/src/main.rs")));
        assert!(capsule.allows_fs_read(Path::new("/repo/src/./a/../b.rs")));
        assert!(!capsule.allows_fs_read(Path::new("/repo/src/../secrets")));
        assert!(!capsule.allows_fs_read(Path::new("/etc/passwd")));
    }

    #[test]
    fn test_write_implies_read() {
        let capsule = PermissionCapsule::deny_all().allow_fs_write("/repo");
        assert!(capsule.allows_fs_read(Path::new("/repo/a")));
        assert!(capsule.allows_fs_write(Path::new("/repo/a")));
        assert!(!capsule.allows_fs_write(Path::new("/tmp/a")));
    }

    #[test]
    fn test_net_subdomain() {
        let capsule = PermissionCapsule::deny_all().allow_net("example.com");
        assert!(capsule.allows_net("example.com"));
        assert!(capsule.allows_net("api.example.com"));
        assert!(!capsule.allows_net("evil-example.com"));
    }

    #[test]
    fn test_exec_basename() {
        let capsule = PermissionCapsule::deny_all().allow_exec("git");
        assert!(capsule.allows_exec("git"));
        assert!(capsule.allows_exec("/usr/bin/git"));
        assert!(!capsule.allows_exec("rm"));
    }

    #[test]
    fn test_subset() {
        let parent = PermissionCapsule::deny_all()
            .allow_fs_write("/repo")
            .allow_net("example.com")
            .allow_exec("git");
        let child = PermissionCapsule::deny_all().allow_fs_read("/repo/src");
        assert!(child.is_subset_of(&parent));

        let widened = PermissionCapsule::deny_all().allow_net("other.com");
        assert!(!widened.is_subset_of(&parent));
    }

    #[test]
    fn test_shard_narrowing_drops_writes_and_net() {
        let parent = PermissionCapsule::deny_all()
            .allow_fs_write("/repo")
            .allow_fs_read("/docs")
            .allow_net("example.com");
        let shard = parent.narrowed_for_shard();
        assert!(shard.is_subset_of(&parent));
        assert!(!shard.allows_fs_write(Path::new("/repo/a")));
        assert!(shard.allows_fs_read(Path::new("/docs/a")));
        assert!(!shard.allows_net("example.com"));
    }
}
