use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One chunk query against the remote service.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryRequest {
    pub dataset_title: String,
    pub variable: String,
    pub time: f64,
    pub temporal_method: String,
    pub spatial_method: String,
    pub spatial_operator: String,
    pub points: Vec<[f64; 3]>,
}

/// Row-major values, `columns.len()` per requested point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResponse {
    pub columns: Vec<String>,
    pub values: Vec<f32>,
}

impl QueryResponse {
    pub fn rows(&self) -> usize {
        if self.columns.is_empty() {
            0
        } else {
            self.values.len() / self.columns.len()
        }
    }

    /// A response is only usable when it carries exactly one full row per point.
    pub fn check_shape(&self, expected_rows: usize) -> Result<(), QueryError> {
        if self.columns.is_empty() {
            return Err(QueryError::Malformed("response has no columns".to_string()));
        }
        if self.values.len() % self.columns.len() != 0 || self.rows() != expected_rows {
            return Err(QueryError::RowCount {
                expected: expected_rows,
                values: self.values.len(),
                columns: self.columns.len(),
            });
        }
        Ok(())
    }
}

/// Every variant is a failed attempt to the loop; none is retried differently.
#[derive(Debug, Error)]
pub enum QueryError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("query service returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("malformed response: {0}")]
    Malformed(String),
    #[error("expected {expected} rows, got {values} values over {columns} columns")]
    RowCount {
        expected: usize,
        values: usize,
        columns: usize,
    },
}

pub trait QueryClient: Send + Sync + 'static {
    fn query(
        &self,
        request: QueryRequest,
    ) -> impl Future<Output = Result<QueryResponse, QueryError>> + Send;
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub endpoint: String,
    /// Sent verbatim as a bearer token when present.
    pub auth_token: Option<String>,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:8080".to_string(),
            auth_token: None,
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Error)]
pub enum ClientBuildError {
    #[error("invalid endpoint {endpoint:?}: {reason}")]
    Endpoint { endpoint: String, reason: String },
    #[error("http client build failed: {0}")]
    Build(#[from] reqwest::Error),
}

/// JSON-over-HTTP client: `POST <endpoint>/query`.
#[derive(Debug, Clone)]
pub struct HttpQueryClient {
    http: reqwest::Client,
    url: reqwest::Url,
    auth_token: Option<String>,
}

impl HttpQueryClient {
    pub fn new(cfg: &HttpClientConfig) -> Result<Self, ClientBuildError> {
        let base = format!("{}/query", cfg.endpoint.trim_end_matches('/'));
        let url = reqwest::Url::parse(&base).map_err(|e| ClientBuildError::Endpoint {
            endpoint: cfg.endpoint.clone(),
            reason: e.to_string(),
        })?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ClientBuildError::Endpoint {
                endpoint: cfg.endpoint.clone(),
                reason: format!("unsupported scheme {:?}", url.scheme()),
            });
        }
        let http = reqwest::Client::builder()
            .connect_timeout(cfg.connect_timeout)
            .timeout(cfg.request_timeout)
            .build()?;
        Ok(Self {
            http,
            url,
            auth_token: cfg.auth_token.clone(),
        })
    }

    pub fn url(&self) -> &reqwest::Url {
        &self.url
    }
}

impl QueryClient for HttpQueryClient {
    async fn query(&self, request: QueryRequest) -> Result<QueryResponse, QueryError> {
        let mut req = self.http.post(self.url.clone()).json(&request);
        if let Some(token) = &self.auth_token {
            req = req.bearer_auth(token);
        }
        let resp = req
            .send()
            .await
            .map_err(|e| QueryError::Transport(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(QueryError::Status {
                status: status.as_u16(),
                body: body.chars().take(512).collect(),
            });
        }
        resp.json::<QueryResponse>()
            .await
            .map_err(|e| QueryError::Malformed(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shape_check_counts_full_rows() {
        let resp = QueryResponse {
            columns: vec!["ux".into(), "uy".into(), "uz".into()],
            values: vec![0.0; 6],
        };
        assert_eq!(resp.rows(), 2);
        assert!(resp.check_shape(2).is_ok());
        assert!(matches!(
            resp.check_shape(3),
            Err(QueryError::RowCount { expected: 3, .. })
        ));

        let ragged = QueryResponse {
            columns: vec!["p".into(), "q".into()],
            values: vec![0.0; 3],
        };
        assert!(ragged.check_shape(1).is_err());
    }

    #[test]
    fn endpoint_is_validated_at_construction() {
        let ok = HttpQueryClient::new(&HttpClientConfig {
            endpoint: "https://turbulence.example.org/api/".to_string(),
            ..HttpClientConfig::default()
        });
        assert_eq!(
            ok.map(|c| c.url().to_string()).ok().as_deref(),
            Some("https://turbulence.example.org/api/query")
        );

        let bad = HttpQueryClient::new(&HttpClientConfig {
            endpoint: "not a url".to_string(),
            ..HttpClientConfig::default()
        });
        assert!(matches!(bad, Err(ClientBuildError::Endpoint { .. })));
    }
}
