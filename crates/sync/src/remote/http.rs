use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;

use super::{RemoteAck, RemoteRow, RemoteStore, RemoteUpsert};
use crate::entity::RowQuery;
use crate::error::RemoteError;
use crate::types::EntityKind;

/// REST client for the remote system of record.
///
/// - `POST {api}/sync/{table}` upserts one row
/// - `GET {api}/sync/{table}?since=` lists rows changed after a watermark
/// - `POST {api}/query/{table}` runs a filtered query
#[derive(Debug, Clone)]
pub struct HttpRemoteStore {
    client: reqwest::Client,
    api_url: String,
    token: Option<String>,
    max_retries: u32,
    initial_backoff: Duration,
}

impl HttpRemoteStore {
    pub fn new(api_url: impl Into<String>, timeout: Duration) -> Result<Self, RemoteError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RemoteError::Transient(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            api_url: api_url.into().trim_end_matches('/').to_string(),
            token: None,
            max_retries: 3,
            initial_backoff: Duration::from_millis(500),
        })
    }

    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.token = token;
        self
    }

    pub fn with_retries(mut self, max_retries: u32, initial_backoff: Duration) -> Self {
        self.max_retries = max_retries;
        self.initial_backoff = initial_backoff;
        self
    }

    fn authorized(&self, req: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    /// Send once, classifying the failure.
    async fn send<T: DeserializeOwned>(&self, req: RequestBuilder) -> Result<T, RemoteError> {
        let resp = self
            .authorized(req)
            .send()
            .await
            .map_err(|e| RemoteError::Transient(format!("network error: {e}")))?;

        let status = resp.status();
        if status.is_success() {
            return resp
                .json::<T>()
                .await
                .map_err(|e| RemoteError::Transient(format!("invalid response body: {e}")));
        }

        let body = resp.text().await.unwrap_or_default();
        Err(classify(status, body))
    }
}

/// Statuses that mean "this request will never succeed as sent".
fn classify(status: StatusCode, body: String) -> RemoteError {
    match status {
        StatusCode::BAD_REQUEST | StatusCode::NOT_FOUND | StatusCode::CONFLICT | StatusCode::UNPROCESSABLE_ENTITY => {
            RemoteError::Rejected(format!("{}: {body}", status.as_u16()))
        }
        _ => RemoteError::Transient(format!("{}: {body}", status.as_u16())),
    }
}

#[async_trait]
impl RemoteStore for HttpRemoteStore {
    async fn upsert(&self, kind: EntityKind, row: RemoteUpsert) -> Result<RemoteAck, RemoteError> {
        let url = format!("{}/sync/{}", self.api_url, kind.table());
        let mut delay = self.initial_backoff;

        // Exponential backoff; upserts are keyed so replays are safe.
        for attempt in 0..=self.max_retries {
            match self.send::<RemoteAck>(self.client.post(&url).json(&row)).await {
                Ok(ack) => {
                    tracing::debug!(table = %kind, id = %row.id, attempt = attempt + 1, "upserted remote row");
                    return Ok(ack);
                }
                Err(RemoteError::Transient(reason)) if attempt < self.max_retries => {
                    tracing::warn!(
                        table = %kind,
                        id = %row.id,
                        attempt = attempt + 1,
                        %reason,
                        "transient upsert failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
                Err(err) => return Err(err),
            }
        }

        Err(RemoteError::Transient("max retries exceeded".to_string()))
    }

    async fn fetch_updated_since(
        &self,
        kind: EntityKind,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<RemoteRow>, RemoteError> {
        let url = format!("{}/sync/{}", self.api_url, kind.table());
        let mut req = self.client.get(&url);
        if let Some(since) = since {
            req = req.query(&[("since", since.to_rfc3339_opts(chrono::SecondsFormat::Micros, true))]);
        }
        self.send(req).await
    }

    async fn query(&self, query: &RowQuery) -> Result<Vec<RemoteRow>, RemoteError> {
        let url = format!("{}/query/{}", self.api_url, query.kind.table());
        self.send(self.client.post(&url).json(query)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_errors_are_rejections_and_the_rest_is_transient() {
        for status in [
            StatusCode::BAD_REQUEST,
            StatusCode::NOT_FOUND,
            StatusCode::CONFLICT,
            StatusCode::UNPROCESSABLE_ENTITY,
        ] {
            assert!(!classify(status, String::new()).is_transient());
        }
        for status in [
            StatusCode::INTERNAL_SERVER_ERROR,
            StatusCode::BAD_GATEWAY,
            StatusCode::TOO_MANY_REQUESTS,
            StatusCode::UNAUTHORIZED,
        ] {
            assert!(classify(status, String::new()).is_transient());
        }
    }

    #[test]
    fn trailing_slash_is_trimmed() {
        let store = HttpRemoteStore::new("http://localhost:8080/", Duration::from_secs(1)).unwrap();
        assert_eq!(store.api_url, "http://localhost:8080");
    }

    #[tokio::test]
    async fn unreachable_host_is_transient() {
        let store = HttpRemoteStore::new("http://127.0.0.1:9", Duration::from_millis(200))
            .unwrap()
            .with_retries(0, Duration::from_millis(1));
        let err = store.fetch_updated_since(EntityKind::Sale, None).await.unwrap_err();
        assert!(err.is_transient());
    }
}
