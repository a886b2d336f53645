//! Shell driver: `exec_cmd(Cmd, Args, Stdout, Exit)`.
//!
//! Binaries resolve through the capsule's exec allow-list before anything
//! is spawned; cancellation kills the child.

use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::datalog::Const;
use crate::error::{Error, Result};
use crate::vstore::capsule::PermissionCapsule;
use crate::vstore::handler::{VirtualHandler, VirtualQuery};

/// `exec_cmd(Cmd, Args, Stdout, Exit)`: runs an allow-listed binary with
/// whitespace-separated arguments. Write-class: gated.
pub struct ExecCmdHandler {
    capsule: PermissionCapsule,
}

impl ExecCmdHandler {
    /// Create a handler spawning only capsule-listed binaries.
    pub fn new(capsule: PermissionCapsule) -> Self {
        Self { capsule }
    }
}

/// Spawn a command, racing completion against cancellation. The child is
/// killed when the race is lost (`kill_on_drop`).
pub(crate) async fn run_command(
    mut command: Command,
    context: &str,
    cancel: &CancellationToken,
) -> Result<(String, i64)> {
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    let child = command
        .spawn()
        .map_err(|e| Error::Internal(format!("failed to spawn {}: {}", context, e)))?;

    let result = tokio::select! {
        _ = cancel.cancelled() => None,
        result = child.wait_with_output() => Some(result),
    };
    match result {
        None => Err(Error::Internal(format!("{} cancelled", context))),
        Some(result) => {
            let output = result
                .map_err(|e| Error::Internal(format!("failed to wait for {}: {}", context, e)))?;
            let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
            if !output.status.success() && text.trim().is_empty() {
                text = String::from_utf8_lossy(&output.stderr).into_owned();
            }
            let code = output.status.code().unwrap_or(-1) as i64;
            Ok((text, code))
        }
    }
}

#[async_trait]
impl VirtualHandler for ExecCmdHandler {
    fn predicate(&self) -> &str {
        "exec_cmd"
    }

    fn arity(&self) -> usize {
        4
    }

    fn capsule(&self) -> &PermissionCapsule {
        &self.capsule
    }

    fn is_write(&self) -> bool {
        true
    }

    async fn invoke(
        &self,
        query: &VirtualQuery,
        cancel: &CancellationToken,
    ) -> Result<Vec<Vec<Const>>> {
        let cmd = query
            .require(0)?
            .as_str()
            .ok_or_else(|| Error::type_mismatch(&query.predicate, 0, "string", "non-string"))?
            .to_string();
        let args = query
            .bound(1)
            .and_then(|c| c.as_str())
            .unwrap_or_default()
            .to_string();

        if !self.capsule.allows_exec(&cmd) {
            return Err(Error::NotPermitted(format!("binary not allow-listed: {}", cmd)));
        }
        let resolved = which::which(&cmd)
            .map_err(|e| Error::Internal(format!("cannot resolve binary {}: {}", cmd, e)))?;

        let mut command = Command::new(resolved);
        command.args(args.split_whitespace());
        let (stdout, code) = run_command(command, &cmd, cancel).await?;
        Ok(vec![vec![
            Const::string(cmd),
            Const::string(args),
            Const::string(stdout),
            Const::Number(code),
        ]])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query_for(args: Vec<Const>) -> VirtualQuery {
        let pattern: Vec<Option<Const>> = args.into_iter().map(Some).collect();
        VirtualQuery::from_pattern("exec_cmd", &pattern, 4)
    }

    #[tokio::test]
    async fn test_disallowed_binary_refused() {
        let handler = ExecCmdHandler::new(PermissionCapsule::deny_all());
        let cancel = CancellationToken::new();
        let q = query_for(vec![Const::string("echo"), Const::string("hi")]);
        let err = handler.invoke(&q, &cancel).await.unwrap_err();
        assert!(matches!(err, Error::NotPermitted(_)));
    }

    #[tokio::test]
    async fn test_echo_runs() {
        let handler = ExecCmdHandler::new(PermissionCapsule::deny_all().allow_exec("echo"));
        let cancel = CancellationToken::new();
        let q = query_for(vec![Const::string("echo"), Const::string("hi there")]);
        let tuples = handler.invoke(&q, &cancel).await.unwrap();
        assert_eq!(tuples[0][3], Const::Number(0));
        assert_eq!(tuples[0][2].as_str().unwrap().trim(), "hi there");
    }
}
