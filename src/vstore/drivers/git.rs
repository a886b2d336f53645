//! Git drivers: `git_log` (read) and `git_commit` (write).
//!
//! Both shell out to the `git` binary, which must be on the capsule's exec
//! allow-list, and operate only on repositories under readable (resp.
//! writable) subtrees.

use std::path::Path;

use async_trait::async_trait;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::datalog::Const;
use crate::error::{Error, Result};
use crate::vstore::capsule::PermissionCapsule;
use crate::vstore::drivers::exec::run_command;
use crate::vstore::handler::{VirtualHandler, VirtualQuery};

fn repo_arg(query: &VirtualQuery) -> Result<String> {
    let c = query.require(0)?;
    c.as_str()
        .map(String::from)
        .ok_or_else(|| Error::type_mismatch(&query.predicate, 0, "string", c.type_tag().to_string()))
}

fn check_git(capsule: &PermissionCapsule) -> Result<std::path::PathBuf> {
    if !capsule.allows_exec("git") {
        return Err(Error::NotPermitted("git not allow-listed".to_string()));
    }
    which::which("git").map_err(|e| Error::Internal(format!("cannot resolve git: {}", e)))
}

/// One tuple per `%H%x09%s` log line; lines without a tab are skipped.
fn parse_log(repo: &str, stdout: &str) -> Vec<Vec<Const>> {
    stdout
        .lines()
        .filter_map(|line| {
            let (hash, subject) = line.split_once('\t')?;
            Some(vec![
                Const::string(repo),
                Const::string(hash),
                Const::string(subject),
            ])
        })
        .collect()
}

/// `git_log(Repo, Hash, Subject)`: one tuple per recent commit.
pub struct GitLogHandler {
    capsule: PermissionCapsule,
    max_entries: usize,
}

impl GitLogHandler {
    /// Create a handler reading repositories under the capsule's subtrees.
    pub fn new(capsule: PermissionCapsule) -> Self {
        Self {
            capsule,
            max_entries: 50,
        }
    }
}

#[async_trait]
impl VirtualHandler for GitLogHandler {
    fn predicate(&self) -> &str {
        "git_log"
    }

    fn arity(&self) -> usize {
        3
    }

    fn capsule(&self) -> &PermissionCapsule {
        &self.capsule
    }

    fn cache_resource(&self, query: &VirtualQuery) -> Option<String> {
        query.bound(0).and_then(|c| c.as_str()).map(|r| format!("git:{}", r))
    }

    async fn invoke(
        &self,
        query: &VirtualQuery,
        cancel: &CancellationToken,
    ) -> Result<Vec<Vec<Const>>> {
        let repo = repo_arg(query)?;
        if !self.capsule.allows_fs_read(Path::new(&repo)) {
            return Err(Error::NotPermitted(format!("repo outside capsule: {}", repo)));
        }
        let git = check_git(&self.capsule)?;

        let mut command = Command::new(git);
        command
            .arg("-C")
            .arg(&repo)
            .arg("log")
            .arg(format!("-{}", self.max_entries))
            .arg("--pretty=format:%H%x09%s");
        let (stdout, code) = run_command(command, "git log", cancel).await?;
        if code != 0 {
            return Err(Error::Internal(format!("git log failed: {}", stdout.trim())));
        }

        Ok(parse_log(&repo, &stdout))
    }
}

/// `git_commit(Repo, Message, Status)`: stages everything and commits.
/// Write-class: gated.
pub struct GitCommitHandler {
    capsule: PermissionCapsule,
}

impl GitCommitHandler {
    /// Create a handler committing in repositories under writable subtrees.
    pub fn new(capsule: PermissionCapsule) -> Self {
        Self { capsule }
    }
}

#[async_trait]
impl VirtualHandler for GitCommitHandler {
    fn predicate(&self) -> &str {
        "git_commit"
    }

    fn arity(&self) -> usize {
        3
    }

    fn capsule(&self) -> &PermissionCapsule {
        &self.capsule
    }

    fn is_write(&self) -> bool {
        true
    }

    fn invalidates(&self, query: &VirtualQuery) -> Option<String> {
        query.bound(0).and_then(|c| c.as_str()).map(|r| format!("git:{}", r))
    }

    async fn invoke(
        &self,
        query: &VirtualQuery,
        cancel: &CancellationToken,
    ) -> Result<Vec<Vec<Const>>> {
        let repo = repo_arg(query)?;
        let message = query
            .require(1)?
            .as_str()
            .ok_or_else(|| Error::type_mismatch(&query.predicate, 1, "string", "non-string"))?
            .to_string();
        if !self.capsule.allows_fs_write(Path::new(&repo)) {
            return Err(Error::NotPermitted(format!("repo outside capsule: {}", repo)));
        }
        let git = check_git(&self.capsule)?;

        let mut add = Command::new(&git);
        add.arg("-C").arg(&repo).arg("add").arg("-A");
        let (out, code) = run_command(add, "git add", cancel).await?;
        if code != 0 {
            return Err(Error::Internal(format!("git add failed: {}", out.trim())));
        }

        let mut commit = Command::new(&git);
        commit.arg("-C").arg(&repo).arg("commit").arg("-m").arg(&message);
        let (out, code) = run_command(commit, "git commit", cancel).await?;
        if code != 0 {
            return Err(Error::Internal(format!("git commit failed: {}", out.trim())));
        }

        Ok(vec![vec![
            Const::string(repo),
            Const::string(message),
            Const::name("ok"),
        ]])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query_for(pred: &str, args: Vec<Const>, arity: usize) -> VirtualQuery {
        let pattern: Vec<Option<Const>> = args.into_iter().map(Some).collect();
        VirtualQuery::from_pattern(pred, &pattern, arity)
    }

    #[test]
    fn test_parse_log_output() {
        let stdout = "abc123\tfix parser\ndef456\tadd tests\tfor the scanner\n\nnotabhere";
        let tuples = parse_log("/repo", stdout);
        assert_eq!(tuples.len(), 2);
        assert_eq!(tuples[0][0], Const::string("/repo"));
        assert_eq!(tuples[0][1], Const::string("abc123"));
        assert_eq!(tuples[0][2], Const::string("fix parser"));
        // Only the first tab separates hash from subject.
        assert_eq!(tuples[1][2], Const::string("add tests\tfor the scanner"));
        assert!(parse_log("/repo", "").is_empty());
    }

    #[tokio::test]
    async fn test_log_repo_outside_capsule_refused() {
        let handler = GitLogHandler::new(PermissionCapsule::deny_all().allow_exec("git"));
        let cancel = CancellationToken::new();
        let q = query_for("git_log", vec![Const::string("/repo")], 3);
        let err = handler.invoke(&q, &cancel).await.unwrap_err();
        assert!(matches!(err, Error::NotPermitted(_)));
    }

    #[tokio::test]
    async fn test_log_without_git_allowlisted_refused() {
        let handler = GitLogHandler::new(PermissionCapsule::deny_all().allow_fs_read("/repo"));
        let cancel = CancellationToken::new();
        let q = query_for("git_log", vec![Const::string("/repo")], 3);
        let err = handler.invoke(&q, &cancel).await.unwrap_err();
        assert!(matches!(err, Error::NotPermitted(_)));
    }

    #[tokio::test]
    async fn test_log_unbound_repo_is_insufficient() {
        let handler = GitLogHandler::new(PermissionCapsule::deny_all().allow_exec("git"));
        let cancel = CancellationToken::new();
        let q = VirtualQuery::from_pattern("git_log", &vec![], 3);
        let err = handler.invoke(&q, &cancel).await.unwrap_err();
        assert!(matches!(err, Error::InsufficientBindings { position: 0, .. }));
    }

    #[tokio::test]
    async fn test_commit_outside_capsule_refused() {
        let handler = GitCommitHandler::new(PermissionCapsule::deny_all().allow_exec("git"));
        let cancel = CancellationToken::new();
        let q = query_for(
            "git_commit",
            vec![Const::string("/repo"), Const::string("msg")],
            3,
        );
        let err = handler.invoke(&q, &cancel).await.unwrap_err();
        assert!(matches!(err, Error::NotPermitted(_)));
    }

    #[test]
    fn test_commit_is_gated_and_invalidates_repo_cache() {
        let handler = GitCommitHandler::new(PermissionCapsule::deny_all());
        assert!(handler.is_write());

        let q = query_for("git_commit", vec![Const::string("/repo")], 3);
        assert_eq!(handler.invalidates(&q), Some("git:/repo".to_string()));
        // An unbound repo produces no invalidation key.
        let free = VirtualQuery::from_pattern("git_commit", &vec![], 3);
        assert!(handler.invalidates(&free).is_none());

        let log = GitLogHandler::new(PermissionCapsule::deny_all());
        let lq = query_for("git_log", vec![Const::string("/repo")], 3);
        // Read and write handlers agree on the resource key, so a commit
        // busts the cached log entries for the same repo.
        assert_eq!(log.cache_resource(&lq), Some("git:/repo".to_string()));
    }
}
