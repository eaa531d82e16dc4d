//! HTTP implementation of the remote collaborators.
//!
//! Speaks the JSON envelope used by the NestTask API:
//! `{ success, data, revisionId }` on success and
//! `{ success: false, error: { code, message } }` on failure.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::{RemoteApi, RemoteError, RetryPolicy, RoutineRemote};
use crate::config::Config;
use crate::errors::{codes, SyncError};
use crate::models::{CreateSlotRequest, Entity, Routine, RoutineSlot, UpdateSlotRequest};

/// Header carrying the pre-shared API key.
pub const API_KEY_HEADER: &str = "x-api-key";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Envelope<T> {
    #[serde(default = "default_success")]
    success: bool,
    data: Option<T>,
    #[serde(default)]
    error: Option<ErrorBody>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: String,
}

fn default_success() -> bool {
    true
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ActiveBody {
    is_active: bool,
}

/// Remote API over HTTP with retry.
#[derive(Clone)]
pub struct HttpRemote {
    client: Client,
    base_url: String,
    retry: RetryPolicy,
}

impl HttpRemote {
    pub fn new(
        base_url: &str,
        api_key: Option<&str>,
        retry: RetryPolicy,
    ) -> Result<Self, SyncError> {
        let mut headers = reqwest::header::HeaderMap::new();
        if let Some(key) = api_key {
            let value = key
                .parse()
                .map_err(|_| SyncError::Config("API key is not a valid header value".to_string()))?;
            headers.insert(API_KEY_HEADER, value);
        }

        let client = Client::builder()
            .default_headers(headers)
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| SyncError::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            retry,
        })
    }

    pub fn from_config(config: &Config) -> Result<Self, SyncError> {
        Self::new(
            &config.remote_url,
            config.api_key.as_deref(),
            RetryPolicy::from_config(config),
        )
    }

    /// Whether the server answers its health endpoint. Never retried.
    pub async fn health(&self) -> Result<(), RemoteError> {
        let response = self
            .client
            .get(format!("{}/health", self.base_url))
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .map_err(network)?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(RemoteError::Network(format!(
                "health check returned {}",
                response.status()
            )))
        }
    }

    fn collection_url<E: Entity>(&self) -> String {
        format!("{}/api/{}", self.base_url, E::KIND.collection())
    }

    fn routine_url(&self, id: &str) -> String {
        format!("{}/api/routines/{}", self.base_url, id)
    }

    /// Send a request built fresh for every attempt and decode the envelope.
    async fn call<T, F>(&self, op_name: &str, build: F) -> Result<Option<T>, RemoteError>
    where
        T: DeserializeOwned,
        F: Fn() -> RequestBuilder,
    {
        let build = &build;
        self.retry
            .run(op_name, move || async move {
                tracing::debug!("Remote call: {}", op_name);
                let response = build().send().await.map_err(network)?;
                decode(response).await
            })
            .await
    }

    fn request(&self, method: Method, url: &str) -> RequestBuilder {
        self.client.request(method, url)
    }
}

async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<Option<T>, RemoteError> {
    let status = response.status();
    let body = response.text().await.map_err(network)?;

    if status.is_success() {
        if body.trim().is_empty() {
            return Ok(None);
        }
        let envelope: Envelope<T> = serde_json::from_str(&body)
            .map_err(|e| RemoteError::Network(format!("malformed response: {}", e)))?;
        if !envelope.success {
            return Err(classify(status, envelope.error));
        }
        return Ok(envelope.data);
    }

    let error = serde_json::from_str::<Envelope<serde_json::Value>>(&body)
        .ok()
        .and_then(|e| e.error);
    Err(classify(status, error))
}

fn classify(status: StatusCode, error: Option<ErrorBody>) -> RemoteError {
    let (code, message) = match error {
        Some(body) => (body.code, body.message),
        None => (String::new(), status.to_string()),
    };

    if code == codes::NOT_FOUND || status == StatusCode::NOT_FOUND {
        RemoteError::NotFound(message)
    } else if code == codes::VALIDATION_ERROR
        || status == StatusCode::BAD_REQUEST
        || status == StatusCode::UNPROCESSABLE_ENTITY
    {
        RemoteError::Rejected(message)
    } else if status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_success()
    {
        RemoteError::Network(message)
    } else {
        RemoteError::Rejected(message)
    }
}

fn network(err: reqwest::Error) -> RemoteError {
    RemoteError::Network(err.to_string())
}

fn missing_body(what: &str) -> RemoteError {
    RemoteError::Network(format!("{} response had no data", what))
}

#[async_trait]
impl<E: Entity> RemoteApi<E> for HttpRemote {
    async fn fetch_all(&self, scope: Option<&str>) -> Result<Vec<E>, RemoteError> {
        let url = self.collection_url::<E>();
        let records: Option<Vec<E>> = self
            .call("fetch_all", || {
                let req = self.request(Method::GET, &url);
                match scope {
                    Some(user_id) => req.query(&[("userId", user_id)]),
                    None => req,
                }
            })
            .await?;
        Ok(records.unwrap_or_default())
    }

    async fn create(&self, input: &E::New) -> Result<E, RemoteError> {
        let url = self.collection_url::<E>();
        self.call("create", || self.request(Method::POST, &url).json(input))
            .await?
            .ok_or_else(|| missing_body("create"))
    }

    async fn update(&self, id: &str, patch: &E::Patch) -> Result<Option<E>, RemoteError> {
        let url = format!("{}/{}", self.collection_url::<E>(), id);
        self.call("update", || self.request(Method::PATCH, &url).json(patch))
            .await
    }

    async fn delete(&self, id: &str) -> Result<(), RemoteError> {
        let url = format!("{}/{}", self.collection_url::<E>(), id);
        self.call::<serde_json::Value, _>("delete", || self.request(Method::DELETE, &url))
            .await?;
        Ok(())
    }

    async fn bulk_create(&self, inputs: &[E::New]) -> Result<Vec<E>, RemoteError> {
        let url = format!("{}/bulk", self.collection_url::<E>());
        self.call("bulk_create", || self.request(Method::POST, &url).json(inputs))
            .await?
            .ok_or_else(|| missing_body("bulk_create"))
    }
}

#[async_trait]
impl RoutineRemote for HttpRemote {
    async fn deactivate_others(&self, id: &str) -> Result<(), RemoteError> {
        let url = format!("{}/deactivate-others", self.routine_url(id));
        self.call::<serde_json::Value, _>("deactivate_others", || {
            self.request(Method::POST, &url)
        })
        .await?;
        Ok(())
    }

    async fn set_active(&self, id: &str, active: bool) -> Result<(), RemoteError> {
        let url = format!("{}/active", self.routine_url(id));
        let body = ActiveBody { is_active: active };
        self.call::<serde_json::Value, _>("set_active", || {
            self.request(Method::PATCH, &url).json(&body)
        })
        .await?;
        Ok(())
    }

    async fn add_slot(
        &self,
        routine_id: &str,
        slot: &CreateSlotRequest,
    ) -> Result<RoutineSlot, RemoteError> {
        let url = format!("{}/slots", self.routine_url(routine_id));
        self.call("add_slot", || self.request(Method::POST, &url).json(slot))
            .await?
            .ok_or_else(|| missing_body("add_slot"))
    }

    async fn update_slot(
        &self,
        routine_id: &str,
        slot_id: &str,
        patch: &UpdateSlotRequest,
    ) -> Result<Option<RoutineSlot>, RemoteError> {
        let url = format!("{}/slots/{}", self.routine_url(routine_id), slot_id);
        self.call("update_slot", || self.request(Method::PATCH, &url).json(patch))
            .await
    }

    async fn delete_slot(&self, routine_id: &str, slot_id: &str) -> Result<(), RemoteError> {
        let url = format!("{}/slots/{}", self.routine_url(routine_id), slot_id);
        self.call::<serde_json::Value, _>("delete_slot", || self.request(Method::DELETE, &url))
            .await?;
        Ok(())
    }
}
