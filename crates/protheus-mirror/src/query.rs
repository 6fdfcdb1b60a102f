//! Record listing: filters, sorting and pagination over classified rows.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::str::FromStr;
use uuid::Uuid;

use crate::classifier::ClassifiedRecord;
use crate::record::{value_text, MirroredRecord};
use crate::types::RecordStatus;

/// Default page size.
pub const DEFAULT_PER_PAGE: usize = 50;

/// Maximum page size.
pub const MAX_PER_PAGE: usize = 1000;

/// Field comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterOp {
    Equals,
    /// Case-insensitive substring match.
    Contains,
}

/// Filter on one business field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldFilter {
    pub field: String,
    pub op: FilterOp,
    pub value: String,
}

impl FieldFilter {
    #[must_use]
    pub fn equals(field: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            op: FilterOp::Equals,
            value: value.into(),
        }
    }

    #[must_use]
    pub fn contains(field: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            op: FilterOp::Contains,
            value: value.into(),
        }
    }

    fn matches(&self, record: &MirroredRecord) -> bool {
        let Some(text) = record.field_text(&self.field) else {
            return false;
        };
        match self.op {
            FilterOp::Equals => text == self.value,
            FilterOp::Contains => text.to_lowercase().contains(&self.value.to_lowercase()),
        }
    }
}

impl FromStr for FieldFilter {
    type Err = String;

    /// Parse `FIELD=value` (equals) or `FIELD~value` (contains).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (field, op, value) = match (s.find('='), s.find('~')) {
            (Some(eq), Some(tilde)) if tilde < eq => (&s[..tilde], FilterOp::Contains, &s[tilde + 1..]),
            (Some(eq), _) => (&s[..eq], FilterOp::Equals, &s[eq + 1..]),
            (None, Some(tilde)) => (&s[..tilde], FilterOp::Contains, &s[tilde + 1..]),
            (None, None) => return Err(format!("Invalid filter '{s}', expected FIELD=value or FIELD~value")),
        };
        let field = field.trim();
        if field.is_empty() {
            return Err(format!("Invalid filter '{s}': empty field name"));
        }
        Ok(Self {
            field: field.to_string(),
            op,
            value: value.to_string(),
        })
    }
}

/// Sort direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
}

/// What to sort by.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "by", content = "field")]
pub enum SortKey {
    /// Record key.
    #[default]
    Key,
    /// Business field.
    Field(String),
}

/// Sort specification.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortSpec {
    pub key: SortKey,
    pub direction: SortDirection,
}

impl FromStr for SortSpec {
    type Err = String;

    /// Parse `FIELD`, `-FIELD` (descending) or `key`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (direction, name) = match s.strip_prefix('-') {
            Some(rest) => (SortDirection::Desc, rest),
            None => (SortDirection::Asc, s),
        };
        let key = match name.trim() {
            "" => return Err("Empty sort field".to_string()),
            "key" | "record_key" => SortKey::Key,
            field => SortKey::Field(field.to_string()),
        };
        Ok(Self { key, direction })
    }
}

/// Listing request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordQuery {
    #[serde(default)]
    pub filters: Vec<FieldFilter>,
    #[serde(default)]
    pub status: Option<RecordStatus>,
    #[serde(default)]
    pub sort: SortSpec,
    /// 1-based page.
    #[serde(default = "default_page")]
    pub page: usize,
    #[serde(default = "default_per_page")]
    pub per_page: usize,
}

fn default_page() -> usize {
    1
}

fn default_per_page() -> usize {
    DEFAULT_PER_PAGE
}

impl Default for RecordQuery {
    fn default() -> Self {
        Self {
            filters: Vec::new(),
            status: None,
            sort: SortSpec::default(),
            page: default_page(),
            per_page: default_per_page(),
        }
    }
}

impl RecordQuery {
    #[must_use]
    pub fn with_filter(mut self, filter: FieldFilter) -> Self {
        self.filters.push(filter);
        self
    }

    #[must_use]
    pub fn with_status(mut self, status: RecordStatus) -> Self {
        self.status = Some(status);
        self
    }

    #[must_use]
    pub fn sorted_by(mut self, sort: SortSpec) -> Self {
        self.sort = sort;
        self
    }

    #[must_use]
    pub fn page(mut self, page: usize, per_page: usize) -> Self {
        self.page = page;
        self.per_page = per_page;
        self
    }

    /// Classify, filter and sort every record, without paging.
    #[must_use]
    pub fn select(&self, records: Vec<MirroredRecord>, current_run: Option<Uuid>) -> Vec<ClassifiedRecord> {
        let mut selected: Vec<ClassifiedRecord> = records
            .into_iter()
            .filter(|r| self.filters.iter().all(|f| f.matches(r)))
            .map(|r| ClassifiedRecord::new(r, current_run))
            .filter(|c| self.status.map_or(true, |s| c.status == s))
            .collect();

        selected.sort_by(|a, b| {
            let ordering = match &self.sort.key {
                SortKey::Key => a.record.key.cmp(&b.record.key),
                SortKey::Field(field) => compare_field(&a.record, &b.record, field)
                    .then_with(|| a.record.key.cmp(&b.record.key)),
            };
            match self.sort.direction {
                SortDirection::Asc => ordering,
                SortDirection::Desc => ordering.reverse(),
            }
        });
        selected
    }

    /// Run the query and return the requested page.
    #[must_use]
    pub fn apply(&self, records: Vec<MirroredRecord>, current_run: Option<Uuid>) -> RecordPage {
        let selected = self.select(records, current_run);
        let per_page = self.per_page.clamp(1, MAX_PER_PAGE);
        let page = self.page.max(1);
        let total = selected.len();
        let items = selected
            .into_iter()
            .skip((page - 1).saturating_mul(per_page))
            .take(per_page)
            .collect();

        RecordPage {
            items,
            total,
            page,
            per_page,
        }
    }
}

/// Numbers compare numerically, everything else as text; missing sorts first.
fn compare_field(a: &MirroredRecord, b: &MirroredRecord, field: &str) -> Ordering {
    match (a.data.get(field), b.data.get(field)) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(x), Some(y)) => match (x.as_f64(), y.as_f64()) {
            (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
            _ => value_text(x).cmp(&value_text(y)),
        },
    }
}

/// One page of classified records.
#[derive(Debug, Clone, Serialize)]
pub struct RecordPage {
    pub items: Vec<ClassifiedRecord>,
    /// Matching records across all pages.
    pub total: usize,
    pub page: usize,
    pub per_page: usize,
}

impl RecordPage {
    /// Number of pages for the total.
    #[must_use]
    pub fn total_pages(&self) -> usize {
        self.total.div_ceil(self.per_page.max(1))
    }
}
