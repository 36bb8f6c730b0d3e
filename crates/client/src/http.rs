//! REST client for the generation API.
//!
//! Wraps both the user routes (`/api/v1/generation`) and the worker callbacks
//! (`/internal/v1`) using [`reqwest`]. Responses are unwrapped from the
//! `{ "data": ... }` envelope; error bodies become [`ClientError::Api`].

use std::time::Duration;

use atelier_core::coverage::Coverage;
use atelier_core::generation::{
    CreateGenerationRequest, GeneratedImage, GenerationRequest, NewGeneratedImage,
    ResourceReference,
};
use atelier_core::scheduling::RequestStatus;
use atelier_core::types::DbId;
use reqwest::{Method, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;

use crate::error::ClientError;
use crate::store::{Reconciliation, ReconciliationStore};

const WORKER_TOKEN_HEADER: &str = "x-worker-token";

#[derive(Deserialize)]
struct DataResponse<T> {
    data: T,
}

#[derive(Deserialize)]
struct ErrorBody {
    error: String,
    code: String,
}

#[derive(Deserialize)]
struct BulkDeleteResult {
    deleted: u64,
}

/// One page of `GET /generation/requests`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RequestPage {
    pub items: Vec<GenerationRequest>,
    /// Pass back as `cursor` to fetch the next page. Absent on the last page.
    pub next_cursor: Option<DbId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CoverageAnswer {
    pub available: bool,
    #[serde(default)]
    pub reason: Option<String>,
}

/// HTTP client for one Atelier API server.
#[derive(Debug, Clone)]
pub struct GenerationClient {
    client: reqwest::Client,
    base_url: String,
    bearer_token: Option<String>,
    worker_token: Option<String>,
}

impl GenerationClient {
    /// * `base_url` - server root, e.g. `http://localhost:3000`.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), base_url)
    }

    /// Reuse an existing [`reqwest::Client`] for connection pooling.
    pub fn with_client(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            bearer_token: None,
            worker_token: None,
        }
    }

    /// Authenticate user routes with a JWT access token.
    pub fn with_bearer_token(mut self, token: impl Into<String>) -> Self {
        self.bearer_token = Some(token.into());
        self
    }

    /// Authenticate worker routes with the shared worker secret.
    pub fn with_worker_token(mut self, token: impl Into<String>) -> Self {
        self.worker_token = Some(token.into());
        self
    }

    // ---- user routes ----

    pub async fn create_request(
        &self,
        input: &CreateGenerationRequest,
    ) -> Result<GenerationRequest, ClientError> {
        let builder = self.user(Method::POST, "/generation/requests").json(input);
        Self::data(builder).await
    }

    /// List the caller's requests, newest first.
    pub async fn list_requests(
        &self,
        cursor: Option<DbId>,
        limit: Option<i64>,
    ) -> Result<RequestPage, ClientError> {
        let mut query: Vec<(&str, i64)> = Vec::new();
        if let Some(cursor) = cursor {
            query.push(("cursor", cursor));
        }
        if let Some(limit) = limit {
            query.push(("limit", limit));
        }
        let builder = self
            .user(Method::GET, "/generation/requests")
            .query(&query);
        Self::data(builder).await
    }

    pub async fn get_request(&self, request_id: DbId) -> Result<GenerationRequest, ClientError> {
        Self::data(self.user(Method::GET, &format!("/generation/requests/{request_id}"))).await
    }

    /// Cancel a request. Cancelling a finished request returns it unchanged.
    pub async fn cancel_request(&self, request_id: DbId) -> Result<GenerationRequest, ClientError> {
        let path = format!("/generation/requests/{request_id}/cancel");
        Self::data(self.user(Method::POST, &path)).await
    }

    pub async fn delete_request(&self, request_id: DbId) -> Result<(), ClientError> {
        let path = format!("/generation/requests/{request_id}");
        Self::no_content(self.user(Method::DELETE, &path)).await
    }

    /// A past request's settings, ready to pass to [`Self::create_request`].
    pub async fn get_generation_data(
        &self,
        request_id: DbId,
    ) -> Result<CreateGenerationRequest, ClientError> {
        let path = format!("/generation/requests/{request_id}/generation-data");
        Self::data(self.user(Method::GET, &path)).await
    }

    /// The settings that produced an image.
    pub async fn get_image_generation_data(
        &self,
        image_id: DbId,
    ) -> Result<CreateGenerationRequest, ClientError> {
        let path = format!("/generation/images/{image_id}/generation-data");
        Self::data(self.user(Method::GET, &path)).await
    }

    pub async fn delete_image(&self, image_id: DbId) -> Result<(), ClientError> {
        let path = format!("/generation/images/{image_id}");
        Self::no_content(self.user(Method::DELETE, &path)).await
    }

    /// Delete several images at once. Returns how many were removed.
    pub async fn bulk_delete_images(&self, image_ids: &[DbId]) -> Result<u64, ClientError> {
        let builder = self
            .user(Method::POST, "/generation/images/bulk-delete")
            .json(&json!({ "ids": image_ids }));
        let result: BulkDeleteResult = Self::data(builder).await?;
        Ok(result.deleted)
    }

    pub async fn check_coverage(
        &self,
        resources: &[ResourceReference],
        sampler: &str,
    ) -> Result<CoverageAnswer, ClientError> {
        let builder = self
            .user(Method::POST, "/generation/coverage/check")
            .json(&json!({ "resources": resources, "sampler": sampler }));
        Self::data(builder).await
    }

    pub async fn get_coverage(&self) -> Result<Coverage, ClientError> {
        Self::data(self.user(Method::GET, "/generation/coverage")).await
    }

    /// Fetch the first page and merge it into `store`.
    ///
    /// Returns `None` when a newer refresh applied while this one was in
    /// flight.
    pub async fn refresh(
        &self,
        store: &mut ReconciliationStore,
        limit: Option<i64>,
    ) -> Result<Option<Reconciliation>, ClientError> {
        let ticket = store.begin_fetch();
        let page = self.list_requests(None, limit).await?;
        Ok(store.apply_fetch(ticket, page.items))
    }

    // ---- worker routes ----

    /// Claim the next queued job, waiting up to `wait` for one to arrive.
    pub async fn claim_job(&self, wait: Duration) -> Result<Option<GenerationRequest>, ClientError> {
        let builder = self
            .worker(Method::POST, "/jobs/claim")
            .query(&[("wait_ms", wait.as_millis() as u64)]);
        let response = Self::ensure_success(builder.send().await?).await?;
        if response.status() == StatusCode::NO_CONTENT {
            return Ok(None);
        }
        let body: DataResponse<GenerationRequest> = response.json().await?;
        Ok(Some(body.data))
    }

    pub async fn update_status(
        &self,
        request_id: DbId,
        status: RequestStatus,
    ) -> Result<GenerationRequest, ClientError> {
        let builder = self
            .worker(Method::PUT, &format!("/requests/{request_id}/status"))
            .json(&json!({ "status": status }));
        Self::data(builder).await
    }

    pub async fn attach_images(
        &self,
        request_id: DbId,
        images: &[NewGeneratedImage],
    ) -> Result<GenerationRequest, ClientError> {
        let builder = self
            .worker(Method::POST, &format!("/requests/{request_id}/images"))
            .json(&json!({ "images": images }));
        Self::data(builder).await
    }

    /// Attach the final images and mark the request `Succeeded`.
    pub async fn complete_request(
        &self,
        request_id: DbId,
        images: &[NewGeneratedImage],
    ) -> Result<GenerationRequest, ClientError> {
        let builder = self
            .worker(Method::POST, &format!("/requests/{request_id}/complete"))
            .json(&json!({ "images": images }));
        Self::data(builder).await
    }

    pub async fn mark_image_available(&self, image_id: DbId) -> Result<GeneratedImage, ClientError> {
        let path = format!("/images/{image_id}/available");
        Self::data(self.worker(Method::POST, &path)).await
    }

    // ---- private helpers ----

    fn user(&self, method: Method, path: &str) -> RequestBuilder {
        let builder = self
            .client
            .request(method, format!("{}/api/v1{path}", self.base_url));
        match &self.bearer_token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    fn worker(&self, method: Method, path: &str) -> RequestBuilder {
        let builder = self
            .client
            .request(method, format!("{}/internal/v1{path}", self.base_url));
        match &self.worker_token {
            Some(token) => builder.header(WORKER_TOKEN_HEADER, token),
            None => builder,
        }
    }

    /// Turn a non-2xx response into [`ClientError::Api`].
    async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response, ClientError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let text = response
            .text()
            .await
            .unwrap_or_else(|_| "<unreadable body>".to_string());
        let (code, message) = match serde_json::from_str::<ErrorBody>(&text) {
            Ok(body) => (body.code, body.error),
            Err(_) => ("UNKNOWN".to_string(), text),
        };
        tracing::debug!(status = status.as_u16(), %code, "API call failed");
        Err(ClientError::Api {
            status: status.as_u16(),
            code,
            message,
        })
    }

    async fn data<T: DeserializeOwned>(builder: RequestBuilder) -> Result<T, ClientError> {
        let response = Self::ensure_success(builder.send().await?).await?;
        let body: DataResponse<T> = response.json().await?;
        Ok(body.data)
    }

    async fn no_content(builder: RequestBuilder) -> Result<(), ClientError> {
        Self::ensure_success(builder.send().await?).await?;
        Ok(())
    }
}
