//! HTTP driver: `http_request(Url, Body, Status)`.
//!
//! Side-effectful (guarded by `next_action` derivation, not free-running
//! rules), so the handler is write-class even for GET. Domains resolve
//! against the capsule's allow-list before any connection is made.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::datalog::Const;
use crate::error::{Error, Result};
use crate::vstore::capsule::PermissionCapsule;
use crate::vstore::handler::{VirtualHandler, VirtualQuery};

/// `http_request(Url, Body, Status)`: fetches a URL and yields the
/// response body plus status code.
pub struct HttpRequestHandler {
    capsule: PermissionCapsule,
    client: reqwest::Client,
    max_body_bytes: usize,
}

impl HttpRequestHandler {
    /// Create a handler reaching only capsule-listed domains.
    pub fn new(capsule: PermissionCapsule) -> Self {
        Self {
            capsule,
            client: reqwest::Client::new(),
            max_body_bytes: 1 << 20,
        }
    }

    fn host_of(url: &str) -> Result<String> {
        let parsed = reqwest::Url::parse(url)
            .map_err(|e| Error::NetworkError(format!("bad url {}: {}", url, e)))?;
        parsed
            .host_str()
            .map(String::from)
            .ok_or_else(|| Error::NetworkError(format!("url has no host: {}", url)))
    }
}

#[async_trait]
impl VirtualHandler for HttpRequestHandler {
    fn predicate(&self) -> &str {
        "http_request"
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

    async fn invoke(
        &self,
        query: &VirtualQuery,
        cancel: &CancellationToken,
    ) -> Result<Vec<Vec<Const>>> {
        let url = query
            .require(0)?
            .as_str()
            .ok_or_else(|| Error::type_mismatch(&query.predicate, 0, "string", "non-string"))?
            .to_string();
        let host = Self::host_of(&url)?;
        if !self.capsule.allows_net(&host) {
            return Err(Error::NotPermitted(format!("domain not allow-listed: {}", host)));
        }

        let request = self.client.get(&url).send();
        let response = tokio::select! {
            _ = cancel.cancelled() => {
                return Err(Error::Internal(format!("http_request cancelled: {}", url)));
            }
            r = request => r.map_err(|e| Error::NetworkError(e.to_string()))?,
        };
        let status = response.status().as_u16() as i64;
        let body = response
            .text()
            .await
            .map_err(|e| Error::NetworkError(e.to_string()))?;
        let mut body = body;
        if body.len() > self.max_body_bytes {
            body.truncate(self.max_body_bytes);
        }
        Ok(vec![vec![
            Const::string(url),
            Const::string(body),
            Const::Number(status),
        ]])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_disallowed_domain_refused() {
        let handler = HttpRequestHandler::new(PermissionCapsule::deny_all());
        let cancel = CancellationToken::new();
        let pattern = vec![Some(Const::string("https://example.com/x"))];
        let q = VirtualQuery::from_pattern("http_request", &pattern, 3);
        let err = handler.invoke(&q, &cancel).await.unwrap_err();
        assert!(matches!(err, Error::NotPermitted(_)));
    }

    #[test]
    fn test_host_extraction() {
        assert_eq!(
            HttpRequestHandler::host_of("https://api.example.com/v1").unwrap(),
            "api.example.com"
        );
        assert!(HttpRequestHandler::host_of("not a url").is_err());
    }
}
