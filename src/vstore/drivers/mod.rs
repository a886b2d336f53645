//! Built-in side-effect drivers.
//!
//! Read-only: `file_content`, `git_log`, `diagnostic`, `mcp_query`.
//! Write-class (gated): `write_file`, `exec_cmd`, `git_commit`,
//! `http_request`. `symbol_graph` and `dom_node` have no built-in driver;
//! hosts register their own handlers for those predicates.

pub mod diag;
pub mod exec;
pub mod fs;
pub mod git;
pub mod http;
pub mod mcp;

pub use diag::{Diagnostic, DiagnosticHandler};
pub use exec::ExecCmdHandler;
pub use fs::{FileContentHandler, WriteFileHandler};
pub use git::{GitCommitHandler, GitLogHandler};
pub use http::HttpRequestHandler;
pub use mcp::{McpQueryHandler, McpTransport};
