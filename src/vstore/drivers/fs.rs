//! Filesystem drivers: `file_content` (read) and `write_file` (write).

use std::path::Path;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::datalog::Const;
use crate::error::{Error, Result};
use crate::vstore::capsule::PermissionCapsule;
use crate::vstore::handler::{VirtualHandler, VirtualQuery};

fn path_arg(query: &VirtualQuery, position: usize) -> Result<String> {
    let c = query.require(position)?;
    c.as_str()
        .map(String::from)
        .ok_or_else(|| Error::type_mismatch(&query.predicate, position, "string", c.type_tag().to_string()))
}

/// `file_content(Path, Content)`: reads a file under the capsule's
/// readable subtrees.
pub struct FileContentHandler {
    capsule: PermissionCapsule,
}

impl FileContentHandler {
    /// Create a handler reading under the capsule's subtrees.
    pub fn new(capsule: PermissionCapsule) -> Self {
        Self { capsule }
    }
}

#[async_trait]
impl VirtualHandler for FileContentHandler {
    fn predicate(&self) -> &str {
        "file_content"
    }

    fn arity(&self) -> usize {
        2
    }

    fn capsule(&self) -> &PermissionCapsule {
        &self.capsule
    }

    fn cache_resource(&self, query: &VirtualQuery) -> Option<String> {
        query.bound(0).and_then(|c| c.as_str()).map(|p| format!("fs:{}", p))
    }

    async fn invoke(
        &self,
        query: &VirtualQuery,
        _cancel: &CancellationToken,
    ) -> Result<Vec<Vec<Const>>> {
        let path = path_arg(query, 0)?;
        if !self.capsule.allows_fs_read(Path::new(&path)) {
            return Err(Error::NotPermitted(format!("fs read outside capsule: {}", path)));
        }
        let content = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| Error::filesystem(&path, e.to_string()))?;
        Ok(vec![vec![Const::string(path), Const::string(content)]])
    }
}

/// `write_file(Path, Content, Status)`: writes a file under the capsule's
/// writable subtrees. Write-class: gated.
pub struct WriteFileHandler {
    capsule: PermissionCapsule,
}

impl WriteFileHandler {
    /// Create a handler writing under the capsule's subtrees.
    pub fn new(capsule: PermissionCapsule) -> Self {
        Self { capsule }
    }
}

#[async_trait]
impl VirtualHandler for WriteFileHandler {
    fn predicate(&self) -> &str {
        "write_file"
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
        query.bound(0).and_then(|c| c.as_str()).map(|p| format!("fs:{}", p))
    }

    async fn invoke(
        &self,
        query: &VirtualQuery,
        _cancel: &CancellationToken,
    ) -> Result<Vec<Vec<Const>>> {
        let path = path_arg(query, 0)?;
        let content = path_arg(query, 1)?;
        if !self.capsule.allows_fs_write(Path::new(&path)) {
            return Err(Error::NotPermitted(format!("fs write outside capsule: {}", path)));
        }
        if let Some(parent) = Path::new(&path).parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::filesystem(&path, e.to_string()))?;
        }
        tokio::fs::write(&path, content.as_bytes())
            .await
            .map_err(|e| Error::filesystem(&path, e.to_string()))?;
        Ok(vec![vec![
            Const::string(path),
            Const::string(content),
            Const::name("ok"),
        ]])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn query_for(pred: &str, args: Vec<Const>, arity: usize) -> VirtualQuery {
        let pattern: Vec<Option<Const>> = args.into_iter().map(Some).collect();
        VirtualQuery::from_pattern(pred, &pattern, arity)
    }

    #[tokio::test]
    async fn test_read_write_round_trip() {
        let dir = TempDir::new().unwrap();
        let capsule = PermissionCapsule::deny_all().allow_fs_write(dir.path());
        let path = dir.path().join("note.txt");
        let path_str = path.to_string_lossy().to_string();

        let writer = WriteFileHandler::new(capsule.clone());
        let cancel = CancellationToken::new();
        let wq = query_for(
            "write_file",
            vec![Const::string(&path_str), Const::string("hello")],
            3,
        );
        let tuples = writer.invoke(&wq, &cancel).await.unwrap();
        assert_eq!(tuples[0][2], Const::name("ok"));

        let reader = FileContentHandler::new(capsule);
        let rq = query_for("file_content", vec![Const::string(&path_str)], 2);
        let tuples = reader.invoke(&rq, &cancel).await.unwrap();
        assert_eq!(tuples[0][1], Const::string("hello"));
    }

    #[tokio::test]
    async fn test_read_outside_capsule_refused() {
        let dir = TempDir::new().unwrap();
        let capsule = PermissionCapsule::deny_all().allow_fs_read(dir.path());
        let reader = FileContentHandler::new(capsule);
        let cancel = CancellationToken::new();
        let q = query_for("file_content", vec![Const::string("/etc/hostname")], 2);
        let err = reader.invoke(&q, &cancel).await.unwrap_err();
        assert!(matches!(err, Error::NotPermitted(_)));
    }

    #[tokio::test]
    async fn test_unbound_path_is_insufficient() {
        let dir = TempDir::new().unwrap();
        let capsule = PermissionCapsule::deny_all().allow_fs_read(dir.path());
        let reader = FileContentHandler::new(capsule);
        let cancel = CancellationToken::new();
        let q = VirtualQuery::from_pattern("file_content", &vec![], 2);
        let err = reader.invoke(&q, &cancel).await.unwrap_err();
        assert!(matches!(err, Error::InsufficientBindings { position: 0, .. }));
    }
}
