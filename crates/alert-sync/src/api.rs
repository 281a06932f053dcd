//! Remote store boundary: identity lookup, alert reads and mutations.
//!
//! The engine only talks to the traits; [`HttpAlertApi`] is the production
//! implementation over the back-office REST API. Tests inject stubs.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use alert_core::{Alert, SubjectId};

use crate::config::SyncConfig;
use crate::errors::{MutationOp, SyncError, SyncResult};

/// Maps a session identity (e.g. an email) to a subject id.
#[async_trait]
pub trait IdentityApi: Send + Sync {
    /// `Ok(None)` means the identity has no subject yet.
    async fn lookup_subject(&self, identity: &str) -> SyncResult<Option<SubjectId>>;
}

/// Read and mutate alerts in the remote store.
#[async_trait]
pub trait AlertApi: Send + Sync {
    /// Alerts scoped to `subject`, most recent first.
    async fn fetch_alerts(&self, subject: &SubjectId) -> SyncResult<Vec<Alert>>;

    async fn mark_read(&self, id: &str) -> SyncResult<()>;

    async fn remove(&self, id: &str) -> SyncResult<()>;
}

#[derive(Debug, Deserialize)]
struct SubjectRow {
    id: SubjectId,
}

#[derive(Debug, Serialize)]
struct MarkReadBody<'a> {
    id: &'a str,
    is_read: bool,
}

/// REST client for the alert endpoints.
#[derive(Debug, Clone)]
pub struct HttpAlertApi {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    unread_only: bool,
}

impl HttpAlertApi {
    /// Build the client. Only the connect phase is time-bounded.
    pub fn new(config: &SyncConfig) -> SyncResult<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()?;
        Ok(Self {
            client,
            base_url: config.api_base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            unread_only: config.unread_only,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        }
    }

    async fn mutate(
        &self,
        op: MutationOp,
        id: &str,
        request: reqwest::RequestBuilder,
    ) -> SyncResult<()> {
        let response = self
            .authorize(request)
            .send()
            .await
            .map_err(|e| SyncError::mutation(op, id, e.to_string()))?;
        if !response.status().is_success() {
            return Err(SyncError::mutation(
                op,
                id,
                format!("HTTP {}", response.status()),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl IdentityApi for HttpAlertApi {
    async fn lookup_subject(&self, identity: &str) -> SyncResult<Option<SubjectId>> {
        let response = self
            .authorize(self.client.get(self.url("subjects")))
            .query(&[("email", identity)])
            .send()
            .await
            .map_err(|e| SyncError::IdentityResolution(e.to_string()))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let row: SubjectRow = response
            .error_for_status()
            .map_err(|e| SyncError::IdentityResolution(e.to_string()))?
            .json()
            .await
            .map_err(|e| SyncError::IdentityResolution(e.to_string()))?;
        Ok(Some(row.id))
    }
}

#[async_trait]
impl AlertApi for HttpAlertApi {
    async fn fetch_alerts(&self, subject: &SubjectId) -> SyncResult<Vec<Alert>> {
        let mut query = vec![("subject_id", subject.as_str())];
        if self.unread_only {
            query.push(("is_read", "false"));
        }
        let response = self
            .authorize(self.client.get(self.url("alerts")))
            .query(&query)
            .send()
            .await
            .map_err(|e| SyncError::Fetch(e.to_string()))?
            .error_for_status()
            .map_err(|e| SyncError::Fetch(e.to_string()))?;
        response
            .json::<Vec<Alert>>()
            .await
            .map_err(|e| SyncError::Fetch(format!("malformed alert list: {e}")))
    }

    async fn mark_read(&self, id: &str) -> SyncResult<()> {
        let request = self
            .client
            .put(self.url("alerts"))
            .json(&MarkReadBody { id, is_read: true });
        self.mutate(MutationOp::MarkRead, id, request).await
    }

    async fn remove(&self, id: &str) -> SyncResult<()> {
        let request = self.client.delete(self.url(&format!("alerts/{id}")));
        self.mutate(MutationOp::Remove, id, request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_trailing_slash_is_trimmed() {
        let config = SyncConfig {
            api_base_url: "http://localhost:9000/api/".into(),
            ..SyncConfig::default()
        };
        let api = HttpAlertApi::new(&config).unwrap();
        assert_eq!(api.url("alerts"), "http://localhost:9000/api/alerts");
    }

    #[test]
    fn mark_read_body_shape() {
        let body = serde_json::to_value(MarkReadBody {
            id: "a1",
            is_read: true,
        })
        .unwrap();
        assert_eq!(body, serde_json::json!({"id": "a1", "is_read": true}));
    }

    #[tokio::test]
    async fn unreachable_host_reports_fetch_error() {
        let config = SyncConfig {
            api_base_url: "http://127.0.0.1:9/api".into(),
            connect_timeout: std::time::Duration::from_millis(200),
            ..SyncConfig::default()
        };
        let api = HttpAlertApi::new(&config).unwrap();
        let err = api
            .fetch_alerts(&SubjectId::new("s1"))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Fetch(_)));
    }
}
