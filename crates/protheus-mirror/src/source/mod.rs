//! ERP source abstraction.
//!
//! The engine reads Protheus tables through [`ErpSource`]. The HTTP client in
//! [`http`] is the production implementation; tests provide their own.

pub mod http;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::record::FieldMap;

pub use http::{ErpConfig, HttpErpSource};

/// Errors reported by an ERP source.
#[derive(Debug, Error)]
pub enum SourceError {
    /// The ERP could not be reached or did not answer in time.
    #[error("ERP unreachable: {message}")]
    Connectivity {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// The ERP rejected the credentials.
    #[error("ERP authentication failed")]
    AuthenticationFailed,

    /// The table does not exist on the ERP side.
    #[error("ERP table not found: {table}")]
    TableNotFound { table: String },

    /// The ERP answered with an unexpected payload.
    #[error("invalid ERP response: {message}")]
    InvalidResponse { message: String },

    /// The ERP answered with an error status.
    #[error("ERP request failed with HTTP {status}: {message}")]
    Http { status: u16, message: String },

    /// Source configuration is invalid.
    #[error("invalid ERP configuration: {message}")]
    InvalidConfiguration { message: String },
}

impl SourceError {
    /// Create a connectivity error.
    pub fn connectivity(message: impl Into<String>) -> Self {
        SourceError::Connectivity {
            message: message.into(),
            source: None,
        }
    }

    /// Create a connectivity error with source.
    pub fn connectivity_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        SourceError::Connectivity {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create an invalid response error.
    pub fn invalid_response(message: impl Into<String>) -> Self {
        SourceError::InvalidResponse {
            message: message.into(),
        }
    }

    /// Whether the error means the ERP is unreachable.
    #[must_use]
    pub fn is_connectivity(&self) -> bool {
        matches!(self, SourceError::Connectivity { .. })
    }
}

/// Result type for source operations.
pub type SourceResult<T> = Result<T, SourceError>;

/// One field of an ERP table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDescriptor {
    pub name: String,
    /// ERP field type (`C`, `N`, `D`, `M`, ...).
    #[serde(default, rename = "type")]
    pub field_type: Option<String>,
    /// Binary/blob fields are not fingerprinted.
    #[serde(default)]
    pub binary: bool,
}

/// Structure of an ERP table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    #[serde(default)]
    pub fields: Vec<FieldDescriptor>,
}

impl TableSchema {
    /// Names of binary fields, sorted.
    #[must_use]
    pub fn binary_fields(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .fields
            .iter()
            .filter(|f| f.binary)
            .map(|f| f.name.clone())
            .collect();
        names.sort();
        names
    }
}

/// Which records to fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchScope {
    /// The complete table.
    All,
    /// Records changed at or after the given instant.
    ChangedSince(DateTime<Utc>),
}

/// Page-based request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    /// 1-based page number.
    pub page: u32,
    pub page_size: u32,
}

impl PageRequest {
    /// First page with the given size.
    #[must_use]
    pub fn first(page_size: usize) -> Self {
        Self {
            page: 1,
            page_size: u32::try_from(page_size.max(1)).unwrap_or(u32::MAX),
        }
    }

    /// The following page.
    #[must_use]
    pub fn next(&self) -> Self {
        Self {
            page: self.page + 1,
            page_size: self.page_size,
        }
    }
}

/// One page of remote records.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RemotePage {
    pub items: Vec<FieldMap>,
    pub has_next: bool,
}

/// Read access to ERP tables.
#[async_trait]
pub trait ErpSource: Send + Sync {
    /// Describe a table's fields.
    async fn describe_table(&self, table: &str) -> SourceResult<TableSchema>;

    /// Fetch one page of records, in a stable order.
    async fn fetch_page(
        &self,
        table: &str,
        scope: FetchScope,
        page: PageRequest,
    ) -> SourceResult<RemotePage>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_binary_fields_sorted() {
        let schema: TableSchema = serde_json::from_value(serde_json::json!({
            "fields": [
                {"name": "A2_COD", "type": "C"},
                {"name": "A2_IMG", "type": "M", "binary": true},
                {"name": "A2_DOC", "binary": true}
            ]
        }))
        .unwrap();
        assert_eq!(schema.binary_fields(), vec!["A2_DOC".to_string(), "A2_IMG".to_string()]);
    }

    #[test]
    fn test_page_request_sequence() {
        let first = PageRequest::first(0);
        assert_eq!(first.page, 1);
        assert_eq!(first.page_size, 1);
        assert_eq!(PageRequest::first(500).next().page, 2);
    }

    #[test]
    fn test_connectivity_classification() {
        assert!(SourceError::connectivity("refused").is_connectivity());
        assert!(!SourceError::AuthenticationFailed.is_connectivity());
        assert!(!SourceError::invalid_response("no items").is_connectivity());
    }
}
