//! Diagnostics driver: `diagnostic(Path, Severity, Message)`.
//!
//! Code-aware parsers and language servers are external collaborators;
//! they publish findings into this handler's shared table and rules read
//! them back as facts.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::datalog::Const;
use crate::error::{Error, Result};
use crate::vstore::capsule::PermissionCapsule;
use crate::vstore::handler::{VirtualHandler, VirtualQuery};

/// One published finding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    /// `/error`, `/warning`, `/hint`
    pub severity: String,
    /// Human-readable message
    pub message: String,
}

/// `diagnostic(Path, Severity, Message)` over a host-populated table.
#[derive(Default)]
pub struct DiagnosticHandler {
    capsule: PermissionCapsule,
    table: Mutex<HashMap<String, Vec<Diagnostic>>>,
}

impl DiagnosticHandler {
    /// Create an empty handler.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_table(&self) -> Result<MutexGuard<'_, HashMap<String, Vec<Diagnostic>>>> {
        self.table
            .lock()
            .map_err(|e| Error::Internal(format!("failed to lock diagnostic table: {}", e)))
    }

    /// Replace the findings for one path.
    pub fn publish(&self, path: impl Into<String>, diagnostics: Vec<Diagnostic>) -> Result<()> {
        self.lock_table()?.insert(path.into(), diagnostics);
        Ok(())
    }

    /// Drop the findings for one path.
    pub fn clear(&self, path: &str) -> Result<()> {
        self.lock_table()?.remove(path);
        Ok(())
    }
}

#[async_trait]
impl VirtualHandler for DiagnosticHandler {
    fn predicate(&self) -> &str {
        "diagnostic"
    }

    fn arity(&self) -> usize {
        3
    }

    fn capsule(&self) -> &PermissionCapsule {
        &self.capsule
    }

    async fn invoke(
        &self,
        query: &VirtualQuery,
        _cancel: &CancellationToken,
    ) -> Result<Vec<Vec<Const>>> {
        let table = self.lock_table()?;
        let wanted_path = query.bound(0).and_then(|c| c.as_str());
        let mut out = Vec::new();
        for (path, diags) in table.iter() {
            if wanted_path.is_some_and(|w| w != path.as_str()) {
                continue;
            }
            for d in diags {
                out.push(vec![
                    Const::string(path.clone()),
                    Const::name(&d.severity),
                    Const::string(d.message.clone()),
                ]);
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_and_query() {
        let handler = DiagnosticHandler::new();
        handler
            .publish(
                "/repo/src/lib.rs",
                vec![Diagnostic {
                    severity: "error".into(),
                    message: "unresolved import".into(),
                }],
            )
            .unwrap();
        handler
            .publish(
                "/repo/src/main.rs",
                vec![Diagnostic {
                    severity: "warning".into(),
                    message: "unused variable".into(),
                }],
            )
            .unwrap();

        let cancel = CancellationToken::new();
        let all = handler
            .invoke(&VirtualQuery::from_pattern("diagnostic", &vec![], 3), &cancel)
            .await
            .unwrap();
        assert_eq!(all.len(), 2);

        let pattern = vec![Some(Const::string("/repo/src/lib.rs"))];
        let one = handler
            .invoke(&VirtualQuery::from_pattern("diagnostic", &pattern, 3), &cancel)
            .await
            .unwrap();
        assert_eq!(one.len(), 1);
        assert_eq!(one[0][1], Const::name("error"));
    }
}
