//! Implements [`ServerApi`] for requests made by [`reqwest`].

use crate::{
    api::{pinned, PinnedFuture, ServerApi},
    error::ClientError,
    wire::{
        ActionRequest, ActionResponse, DataVariableRequest,
        DerivedVariableRequest, DerivedVariableResponse, StoreValue,
        StoreWriteRequest,
    },
};
use or_poisoned::OrPoisoned;
use reqwest::{
    header::{ACCEPT, AUTHORIZATION},
    Client, RequestBuilder, Response,
};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::{Arc, RwLock};
use url::Url;
use var_config::RuntimeOptions;
use var_graph::extras::RequestExtras;

/// Implements [`ServerApi`] over HTTP.
///
/// `base_url` must be absolute (e.g. `http://127.0.0.1:8000/api/core`); every
/// endpoint path is appended to it.
#[derive(Debug, Clone)]
pub struct ReqwestClient {
    client: Client,
    base_url: Arc<str>,
    token: Arc<RwLock<Option<String>>>,
}

impl ReqwestClient {
    /// Creates a client for the server at `base_url`.
    pub fn new(base_url: impl Into<Arc<str>>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into(),
            token: Default::default(),
        }
    }

    /// Creates a client for the endpoints under the configured base URL.
    pub fn from_options(options: &RuntimeOptions) -> Self {
        Self::new(options.api_url())
    }

    /// Sets the session token sent as a bearer token with every request.
    pub fn set_token(&self, token: Option<String>) {
        *self.token.write().or_poisoned() = token;
    }

    /// Builds the URL of an endpoint from its path segments, percent-encoding
    /// each of them.
    pub fn endpoint(&self, segments: &[&str]) -> Result<Url, ClientError> {
        let mut url = Url::parse(&self.base_url).map_err(|e| {
            ClientError::InvalidUrl(format!("{}: {e}", self.base_url))
        })?;
        url.path_segments_mut()
            .map_err(|_| ClientError::InvalidUrl(self.base_url.to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn prepare(
        &self,
        builder: RequestBuilder,
        extras: &RequestExtras,
    ) -> RequestBuilder {
        let mut builder = builder.header(ACCEPT, "application/json");
        if let Some(token) = self.token.read().or_poisoned().as_deref() {
            builder = builder.header(AUTHORIZATION, format!("Bearer {token}"));
        }
        for (name, value) in extras.headers() {
            builder = builder.header(name, value);
        }
        builder
    }

    fn post<B, R>(
        &self,
        segments: &[&str],
        body: &B,
        extras: &RequestExtras,
    ) -> PinnedFuture<Result<R, ClientError>>
    where
        B: serde::Serialize,
        R: DeserializeOwned + Send + 'static,
    {
        let request = self.endpoint(segments).map(|url| {
            self.prepare(self.client.post(url), extras).json(body)
        });
        pinned(async move { receive_json(request?).await })
    }

    fn get<R>(
        &self,
        segments: &[&str],
        extras: &RequestExtras,
    ) -> PinnedFuture<Result<R, ClientError>>
    where
        R: DeserializeOwned + Send + 'static,
    {
        let request = self
            .endpoint(segments)
            .map(|url| self.prepare(self.client.get(url), extras));
        pinned(async move { receive_json(request?).await })
    }
}

async fn send(request: RequestBuilder) -> Result<Response, ClientError> {
    let res = request
        .send()
        .await
        .map_err(|e| ClientError::Request(e.to_string()))?;
    let status = res.status();
    if status.is_success() {
        Ok(res)
    } else {
        let body = res.text().await.unwrap_or_default();
        tracing::warn!(status = status.as_u16(), %body, "request failed");
        Err(ClientError::Status {
            status: status.as_u16(),
            body,
        })
    }
}

async fn receive_json<R: DeserializeOwned>(
    request: RequestBuilder,
) -> Result<R, ClientError> {
    send(request)
        .await?
        .json::<R>()
        .await
        .map_err(|e| ClientError::Deserialization(e.to_string()))
}

impl ServerApi for ReqwestClient {
    fn derived_variable(
        &self,
        uid: &str,
        request: DerivedVariableRequest,
        extras: &RequestExtras,
    ) -> PinnedFuture<Result<DerivedVariableResponse, ClientError>> {
        self.post(&["derived-variable", uid], &request, extras)
    }

    fn data_variable(
        &self,
        uid: &str,
        request: DataVariableRequest,
        extras: &RequestExtras,
    ) -> PinnedFuture<Result<DerivedVariableResponse, ClientError>> {
        self.post(&["data-variable", uid], &request, extras)
    }

    fn action(
        &self,
        uid: &str,
        request: ActionRequest,
        extras: &RequestExtras,
    ) -> PinnedFuture<Result<ActionResponse, ClientError>> {
        self.post(&["action", uid], &request, extras)
    }

    fn task_result(
        &self,
        task_id: &str,
        extras: &RequestExtras,
    ) -> PinnedFuture<Result<Value, ClientError>> {
        self.get(&["tasks", task_id], extras)
    }

    fn get_store(
        &self,
        store_uid: &str,
        extras: &RequestExtras,
    ) -> PinnedFuture<Result<StoreValue, ClientError>> {
        self.get(&["store", store_uid], extras)
    }

    fn write_store(
        &self,
        request: StoreWriteRequest,
        extras: &RequestExtras,
    ) -> PinnedFuture<Result<(), ClientError>> {
        let request = self.endpoint(&["store"]).map(|url| {
            self.prepare(self.client.post(url), extras).json(&request)
        });
        pinned(async move {
            send(request?).await?;
            Ok(())
        })
    }
}
