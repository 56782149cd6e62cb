//! Request store seam
//!
//! The external store owns every request record. Daemons only list, read,
//! update status, and open new tickets through [`RequestStore`].
//!
//! Provides:
//! - [`InMemoryRequestStore`] for single-process deployments and tests
//! - [`HttpRequestStore`] speaking JSON over HTTP to a remote store

use crate::config::StoreConfig;
use crate::error::StoreError;
use crate::types::{Assignment, NewRequest, Request, RequestFilter, RequestId, StatusUpdate};
use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Request store boundary
#[async_trait::async_trait]
pub trait RequestStore: Send + Sync {
    /// List requests passing a filter
    async fn list_requests(&self, filter: &RequestFilter) -> Result<Vec<Request>, StoreError>;

    /// Fetch one request; `Ok(None)` if it does not exist
    async fn get_request(&self, id: &RequestId) -> Result<Option<Request>, StoreError>;

    /// Apply a status update and return the stored record
    async fn update_request_status(
        &self,
        id: &RequestId,
        update: StatusUpdate,
    ) -> Result<Request, StoreError>;

    /// Create a new request (ticket)
    async fn create_request(&self, request: NewRequest) -> Result<Request, StoreError>;
}

/// In-process request store
#[derive(Debug, Default)]
pub struct InMemoryRequestStore {
    requests: RwLock<BTreeMap<RequestId, Request>>,
    created: RwLock<Vec<NewRequest>>,
    next_id: AtomicU64,
}

impl InMemoryRequestStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store seeded with requests
    #[must_use]
    pub fn with_requests(requests: impl IntoIterator<Item = Request>) -> Self {
        let store = Self::new();
        for request in requests {
            store.insert(request);
        }
        store
    }

    /// Insert or replace a request
    pub fn insert(&self, request: Request) {
        self.requests.write().insert(request.id.clone(), request);
    }

    /// Remove a request
    pub fn remove(&self, id: &RequestId) -> Option<Request> {
        self.requests.write().remove(id)
    }

    /// Current copy of one request
    #[must_use]
    pub fn get(&self, id: &RequestId) -> Option<Request> {
        self.requests.read().get(id).cloned()
    }

    /// Current copy of every request
    #[must_use]
    pub fn snapshot(&self) -> Vec<Request> {
        self.requests.read().values().cloned().collect()
    }

    /// Tickets created through [`RequestStore::create_request`], in order
    #[must_use]
    pub fn created(&self) -> Vec<NewRequest> {
        self.created.read().clone()
    }
}

#[async_trait::async_trait]
impl RequestStore for InMemoryRequestStore {
    async fn list_requests(&self, filter: &RequestFilter) -> Result<Vec<Request>, StoreError> {
        Ok(self
            .requests
            .read()
            .values()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect())
    }

    async fn get_request(&self, id: &RequestId) -> Result<Option<Request>, StoreError> {
        Ok(self.get(id))
    }

    async fn update_request_status(
        &self,
        id: &RequestId,
        update: StatusUpdate,
    ) -> Result<Request, StoreError> {
        let mut requests = self.requests.write();
        let request = requests
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.clone()))?;
        update.apply(request, Utc::now());
        Ok(request.clone())
    }

    async fn create_request(&self, new: NewRequest) -> Result<Request, StoreError> {
        let n = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let mut request = Request::new(format!("REQ-{n}"), new.title.clone(), new.phase)
            .with_priority(new.priority);
        request.assigned_to.clone_from(&new.assigned_to);
        self.insert(request.clone());
        self.created.write().push(new);
        Ok(request)
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusBody<'a> {
    phase: crate::types::Phase,
    is_blocked: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    blocked_reason: Option<&'a str>,
    /// Absent keeps the assignee, `null` clears it
    #[serde(skip_serializing_if = "Option::is_none")]
    assigned_to: Option<Option<&'a str>>,
}

impl<'a> From<&'a StatusUpdate> for StatusBody<'a> {
    fn from(update: &'a StatusUpdate) -> Self {
        let assigned_to = match &update.assignment {
            Assignment::Keep => None,
            Assignment::Clear => Some(None),
            Assignment::Set(worker) => Some(Some(worker.as_str())),
        };
        Self {
            phase: update.phase,
            is_blocked: update.is_blocked,
            blocked_reason: update.blocked_reason.as_deref(),
            assigned_to,
        }
    }
}

/// Request store reached over HTTP
///
/// Endpoints under `base_url`:
/// - `GET /api/requests?phase=..&assignedTo=..`
/// - `GET /api/requests/{id}` (404 means absent)
/// - `PATCH /api/requests/{id}/status`
/// - `POST /api/requests`
#[derive(Debug, Clone)]
pub struct HttpRequestStore {
    client: reqwest::Client,
    base_url: String,
    api_token: Option<String>,
}

impl HttpRequestStore {
    /// Create a client for `base_url`
    ///
    /// # Errors
    /// - `StoreError::Unavailable` if the HTTP client cannot be built
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, StoreError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_token: None,
        })
    }

    /// Create from configuration; `Ok(None)` when no base URL is configured
    ///
    /// # Errors
    /// - `StoreError::Unavailable` if the HTTP client cannot be built
    pub fn from_config(config: &StoreConfig) -> Result<Option<Self>, StoreError> {
        let Some(base_url) = &config.base_url else {
            return Ok(None);
        };
        let store = Self::new(
            base_url.clone(),
            Duration::from_secs(config.request_timeout_secs),
        )?;
        Ok(Some(match &config.api_token {
            Some(token) => store.with_token(token.clone()),
            None => store,
        }))
    }

    /// With bearer token
    #[inline]
    #[must_use]
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.api_token = Some(token.into());
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/requests{path}", self.base_url)
    }

    fn authorize(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, StoreError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(StoreError::Http {
            status: status.as_u16(),
            body,
        })
    }
}

#[async_trait::async_trait]
impl RequestStore for HttpRequestStore {
    async fn list_requests(&self, filter: &RequestFilter) -> Result<Vec<Request>, StoreError> {
        let mut query: Vec<(&str, &str)> = Vec::new();
        if let Some(phase) = filter.phase {
            query.push(("phase", phase.as_str()));
        }
        if let Some(worker) = &filter.assigned_to {
            query.push(("assignedTo", worker.as_str()));
        }
        let response = self
            .authorize(self.client.get(self.url("")).query(&query))
            .send()
            .await?;
        Ok(Self::check(response).await?.json().await?)
    }

    async fn get_request(&self, id: &RequestId) -> Result<Option<Request>, StoreError> {
        let response = self
            .authorize(self.client.get(self.url(&format!("/{id}"))))
            .send()
            .await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Ok(Some(Self::check(response).await?.json().await?))
    }

    async fn update_request_status(
        &self,
        id: &RequestId,
        update: StatusUpdate,
    ) -> Result<Request, StoreError> {
        let body = StatusBody::from(&update);
        let response = self
            .authorize(self.client.patch(self.url(&format!("/{id}/status"))).json(&body))
            .send()
            .await?;
        match response.status() {
            reqwest::StatusCode::NOT_FOUND => Err(StoreError::NotFound(id.clone())),
            reqwest::StatusCode::CONFLICT | reqwest::StatusCode::UNPROCESSABLE_ENTITY => {
                Err(StoreError::Rejected {
                    id: id.clone(),
                    reason: response.text().await.unwrap_or_default(),
                })
            }
            _ => Ok(Self::check(response).await?.json().await?),
        }
    }

    async fn create_request(&self, request: NewRequest) -> Result<Request, StoreError> {
        let response = self
            .authorize(self.client.post(self.url("")).json(&request))
            .send()
            .await?;
        Ok(Self::check(response).await?.json().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Phase, Priority};

    #[tokio::test]
    async fn update_applies_and_stamps() {
        let store = InMemoryRequestStore::with_requests([
            Request::new("REQ-1", "a", Phase::InProgress).with_assignee("backend-developer"),
        ]);
        let id = RequestId::new("REQ-1");

        let updated = store
            .update_request_status(&id, StatusUpdate::reset(Phase::Backlog))
            .await
            .unwrap();

        assert_eq!(updated.phase, Phase::Backlog);
        assert_eq!(updated.assigned_to, None);
        assert_eq!(store.get(&id).unwrap(), updated);
    }

    #[tokio::test]
    async fn update_missing_request_is_not_found() {
        let store = InMemoryRequestStore::new();
        let err = store
            .update_request_status(&RequestId::new("nope"), StatusUpdate::to_phase(Phase::Done))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn list_filters_by_phase() {
        let store = InMemoryRequestStore::with_requests([
            Request::new("REQ-1", "a", Phase::InProgress),
            Request::new("REQ-2", "b", Phase::Done),
        ]);
        let active = store
            .list_requests(&RequestFilter::phase(Phase::InProgress))
            .await
            .unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id.as_str(), "REQ-1");
    }

    #[tokio::test]
    async fn create_assigns_ids_and_records() {
        let store = InMemoryRequestStore::new();
        let ticket = NewRequest::new("Fix consumer", "details", Priority::Critical)
            .assigned_to("devops-engineer");
        let created = store.create_request(ticket.clone()).await.unwrap();

        assert_eq!(created.id.as_str(), "REQ-1");
        assert_eq!(created.priority, Priority::Critical);
        assert_eq!(created.assigned_to.as_deref(), Some("devops-engineer"));
        assert_eq!(store.created(), vec![ticket]);
    }

    #[test]
    fn status_body_encodes_assignment() {
        let keep = serde_json::to_value(StatusBody::from(&StatusUpdate::to_phase(Phase::Qa))).unwrap();
        assert!(keep.get("assignedTo").is_none());

        let clear = serde_json::to_value(StatusBody::from(&StatusUpdate::reset(Phase::Backlog))).unwrap();
        assert!(clear.get("assignedTo").unwrap().is_null());

        let blocked = serde_json::to_value(StatusBody::from(&StatusUpdate::blocked("why"))).unwrap();
        assert_eq!(blocked["phase"], "blocked");
        assert_eq!(blocked["blockedReason"], "why");
    }

    #[test]
    fn http_store_from_config_requires_url() {
        assert!(HttpRequestStore::from_config(&StoreConfig::default()).unwrap().is_none());
    }
}
