//! HTTP client for the Protheus REST API.
//!
//! Tables are read page by page from `GET {base}/tables/{table}` with
//! `page`, `pageSize` and optional `changedSince` query parameters. The body
//! is `{"items": [...], "hasNext": bool}`. The structure endpoint
//! `GET {base}/tables/{table}/structure` lists the fields.

use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use serde::Deserialize;
use serde_json::Value;
use std::env;
use std::time::Duration;
use tracing::{debug, instrument, warn};

use super::{ErpSource, FetchScope, PageRequest, RemotePage, SourceError, SourceResult, TableSchema};
use crate::table::is_valid_identifier;

/// Connection settings of the ERP REST API.
#[derive(Clone)]
pub struct ErpConfig {
    pub base_url: String,
    pub username: String,
    pub password: String,
    pub timeout_secs: u64,
    pub connect_timeout_secs: u64,
    /// Retries after a connectivity failure or 5xx answer.
    pub max_retries: u32,
    /// Base delay of the exponential retry backoff.
    pub retry_backoff_ms: u64,
}

impl std::fmt::Debug for ErpConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ErpConfig")
            .field("base_url", &self.base_url)
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .field("timeout_secs", &self.timeout_secs)
            .field("connect_timeout_secs", &self.connect_timeout_secs)
            .field("max_retries", &self.max_retries)
            .finish()
    }
}

impl ErpConfig {
    /// Create a configuration with default timeouts.
    #[must_use]
    pub fn new(
        base_url: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            base_url: base_url.into(),
            username: username.into(),
            password: password.into(),
            timeout_secs: 60,
            connect_timeout_secs: 10,
            max_retries: 2,
            retry_backoff_ms: 500,
        }
    }

    /// Load configuration from environment variables.
    ///
    /// - `ERP_BASE_URL` (required)
    /// - `ERP_USERNAME` / `ERP_PASSWORD` (required)
    /// - `ERP_TIMEOUT_SECS` (default 60)
    /// - `ERP_CONNECT_TIMEOUT_SECS` (default 10)
    /// - `ERP_MAX_RETRIES` (default 2)
    pub fn from_env() -> SourceResult<Self> {
        let required = |name: &str| {
            env::var(name).map_err(|_| SourceError::InvalidConfiguration {
                message: format!("{name} environment variable is required"),
            })
        };

        let mut config = Self::new(
            required("ERP_BASE_URL")?,
            required("ERP_USERNAME")?,
            required("ERP_PASSWORD")?,
        );

        if let Some(v) = env::var("ERP_TIMEOUT_SECS").ok().and_then(|s| s.parse().ok()) {
            config.timeout_secs = v;
        }
        if let Some(v) = env::var("ERP_CONNECT_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
        {
            config.connect_timeout_secs = v;
        }
        if let Some(v) = env::var("ERP_MAX_RETRIES").ok().and_then(|s| s.parse().ok()) {
            config.max_retries = v;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> SourceResult<()> {
        let url = Url::parse(&self.base_url).map_err(|e| SourceError::InvalidConfiguration {
            message: format!("invalid ERP_BASE_URL '{}': {e}", self.base_url),
        })?;
        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(SourceError::InvalidConfiguration {
                message: format!("unsupported scheme: {}", url.scheme()),
            });
        }
        if self.username.is_empty() {
            return Err(SourceError::InvalidConfiguration {
                message: "ERP username must not be empty".to_string(),
            });
        }
        if self.timeout_secs == 0 {
            return Err(SourceError::InvalidConfiguration {
                message: "ERP timeout must be positive".to_string(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PageBody {
    #[serde(default)]
    items: Option<Vec<Value>>,
    #[serde(default)]
    has_next: bool,
}

/// [`ErpSource`] backed by the Protheus REST API.
pub struct HttpErpSource {
    config: ErpConfig,
    client: Client,
}

impl std::fmt::Debug for HttpErpSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpErpSource")
            .field("config", &self.config)
            .finish()
    }
}

impl HttpErpSource {
    /// Create a client for the given configuration.
    pub fn new(config: ErpConfig) -> SourceResult<Self> {
        config.validate()?;

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .build()
            .map_err(|e| SourceError::InvalidConfiguration {
                message: format!("failed to build HTTP client: {e}"),
            })?;

        Ok(Self { config, client })
    }

    fn table_url(&self, table: &str, suffix: &str) -> SourceResult<String> {
        if !is_valid_identifier(table) {
            return Err(SourceError::InvalidConfiguration {
                message: format!("invalid table name '{table}'"),
            });
        }
        Ok(format!(
            "{}/tables/{table}{suffix}",
            self.config.base_url.trim_end_matches('/')
        ))
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
        Duration::from_millis(self.config.retry_backoff_ms.saturating_mul(factor))
    }

    /// GET a JSON document, retrying connectivity failures and 5xx answers.
    async fn get_json(&self, table: &str, url: &str, query: &[(String, String)]) -> SourceResult<Value> {
        let mut attempt = 0;

        loop {
            attempt += 1;
            let result = self
                .client
                .get(url)
                .basic_auth(&self.config.username, Some(&self.config.password))
                .query(query)
                .send()
                .await;

            let response = match result {
                Ok(resp) => resp,
                Err(e) => {
                    if attempt <= self.config.max_retries {
                        let wait = self.backoff(attempt);
                        warn!(url = %url, error = %e, attempt, wait_ms = wait.as_millis(), "ERP request failed, retrying");
                        tokio::time::sleep(wait).await;
                        continue;
                    }
                    return Err(SourceError::connectivity_with_source(
                        format!("request to {url} failed after {attempt} attempts"),
                        e,
                    ));
                }
            };

            let status = response.status();
            debug!(url = %url, status = %status, attempt, "Received ERP response");

            if status.is_server_error() && attempt <= self.config.max_retries {
                let wait = self.backoff(attempt);
                warn!(url = %url, status = %status, attempt, wait_ms = wait.as_millis(), "ERP server error, retrying");
                tokio::time::sleep(wait).await;
                continue;
            }

            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(map_status(status, table, body));
            }

            return response
                .json::<Value>()
                .await
                .map_err(|e| SourceError::invalid_response(format!("malformed JSON body: {e}")));
        }
    }
}

fn map_status(status: StatusCode, table: &str, body: String) -> SourceError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => SourceError::AuthenticationFailed,
        StatusCode::NOT_FOUND => SourceError::TableNotFound {
            table: table.to_string(),
        },
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => {
            SourceError::connectivity(format!("HTTP {status}: {body}"))
        }
        s if s.is_server_error() => SourceError::connectivity(format!("HTTP {status}: {body}")),
        _ => SourceError::Http {
            status: status.as_u16(),
            message: body,
        },
    }
}

#[async_trait]
impl ErpSource for HttpErpSource {
    #[instrument(skip(self))]
    async fn describe_table(&self, table: &str) -> SourceResult<TableSchema> {
        let url = self.table_url(table, "/structure")?;
        let body = self.get_json(table, &url, &[]).await?;
        serde_json::from_value(body)
            .map_err(|e| SourceError::invalid_response(format!("invalid table structure: {e}")))
    }

    #[instrument(skip(self))]
    async fn fetch_page(
        &self,
        table: &str,
        scope: FetchScope,
        page: PageRequest,
    ) -> SourceResult<RemotePage> {
        let url = self.table_url(table, "")?;

        let mut query = vec![
            ("page".to_string(), page.page.to_string()),
            ("pageSize".to_string(), page.page_size.to_string()),
        ];
        if let FetchScope::ChangedSince(since) = scope {
            query.push(("changedSince".to_string(), since.to_rfc3339()));
        }

        let body = self.get_json(table, &url, &query).await?;
        let parsed: PageBody = serde_json::from_value(body)
            .map_err(|e| SourceError::invalid_response(format!("invalid page body: {e}")))?;

        let items = parsed
            .items
            .ok_or_else(|| SourceError::invalid_response("page body has no 'items' array"))?
            .into_iter()
            .map(|item| match item {
                Value::Object(map) => Ok(map),
                other => Err(SourceError::invalid_response(format!(
                    "expected object item, got {other}"
                ))),
            })
            .collect::<SourceResult<Vec<_>>>()?;

        debug!(table = %table, page = page.page, items = items.len(), has_next = parsed.has_next, "Fetched ERP page");

        Ok(RemotePage {
            items,
            has_next: parsed.has_next,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_debug_redacts_password() {
        let config = ErpConfig::new("https://erp.example.com/rest", "admin", "s3cret");
        let debug = format!("{config:?}");
        assert!(debug.contains("[REDACTED]"));
        assert!(!debug.contains("s3cret"));
    }

    #[test]
    fn test_config_validation() {
        assert!(ErpConfig::new("https://erp.example.com", "admin", "x").validate().is_ok());
        assert!(ErpConfig::new("not a url", "admin", "x").validate().is_err());
        assert!(ErpConfig::new("ftp://erp.example.com", "admin", "x").validate().is_err());
        assert!(ErpConfig::new("https://erp.example.com", "", "x").validate().is_err());
    }

    #[test]
    fn test_table_url_rejects_bad_names() {
        let source = HttpErpSource::new(ErpConfig::new("https://erp.example.com/rest/", "a", "b")).unwrap();
        assert_eq!(
            source.table_url("SA2010", "/structure").unwrap(),
            "https://erp.example.com/rest/tables/SA2010/structure"
        );
        assert!(source.table_url("SA2010/../x", "").is_err());
    }

    #[test]
    fn test_status_mapping() {
        assert!(map_status(StatusCode::BAD_GATEWAY, "SA2010", String::new()).is_connectivity());
        assert!(matches!(
            map_status(StatusCode::NOT_FOUND, "SA2010", String::new()),
            SourceError::TableNotFound { .. }
        ));
        assert!(matches!(
            map_status(StatusCode::UNAUTHORIZED, "SA2010", String::new()),
            SourceError::AuthenticationFailed
        ));
        assert!(matches!(
            map_status(StatusCode::BAD_REQUEST, "SA2010", "bad filter".to_string()),
            SourceError::Http { status: 400, .. }
        ));
    }
}
