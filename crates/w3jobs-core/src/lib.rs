//! Core domain model for the jobs aggregation pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "w3jobs-core";

/// Title bounds applied at extraction time (after whitespace collapsing).
pub const TITLE_MIN_LEN: usize = 3;
pub const TITLE_MAX_LEN: usize = 250;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Api,
    Html,
}

/// Which native payload shape an API source speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApiSchema {
    /// `{"jobs": [{"title", "location": {"name"}, "absolute_url"}]}`
    Greenhouse,
    /// `[{"text", "categories": {"location", "team"}, "hostedUrl"}]`
    Lever,
    /// `[{"title", "company", "location", "url"}]`
    FlatArray,
}

/// One board account behind a multi-tenant API source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiAccount {
    pub slug: String,
    pub company: String,
}

impl ApiAccount {
    pub fn new(slug: impl Into<String>, company: impl Into<String>) -> Self {
        Self {
            slug: slug.into(),
            company: company.into(),
        }
    }
}

/// Static description of one external source. Read-only for the duration
/// of a run; records reference it by display name, never by live handle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceDescriptor {
    pub id: String,
    pub display_name: String,
    pub kind: SourceKind,
    /// Request template. HTML sources may carry a `{page}` placeholder,
    /// API sources a `{slug}` placeholder filled per account.
    pub endpoint: String,
    pub base_url: String,
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<ApiSchema>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub accounts: Vec<ApiAccount>,
    /// Pagination ceiling for HTML sources.
    pub max_pages: u32,
    /// Per-source record ceiling.
    pub max_records: usize,
    /// Company to fall back to when a card carries no company node
    /// (single-company careers pages).
    #[serde(default)]
    pub default_company: String,
    /// Board lists remote roles only; empty locations become "Remote".
    #[serde(default)]
    pub assume_remote: bool,
}

impl SourceDescriptor {
    pub fn html(
        id: impl Into<String>,
        display_name: impl Into<String>,
        endpoint: impl Into<String>,
        base_url: impl Into<String>,
        max_pages: u32,
    ) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            kind: SourceKind::Html,
            endpoint: endpoint.into(),
            base_url: base_url.into(),
            enabled: true,
            schema: None,
            accounts: Vec::new(),
            max_pages,
            max_records: 200,
            default_company: String::new(),
            assume_remote: false,
        }
    }

    pub fn api(
        id: impl Into<String>,
        display_name: impl Into<String>,
        endpoint: impl Into<String>,
        schema: ApiSchema,
        accounts: Vec<ApiAccount>,
    ) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            kind: SourceKind::Api,
            endpoint: endpoint.into(),
            base_url: String::new(),
            enabled: true,
            schema: Some(schema),
            accounts,
            max_pages: 1,
            max_records: 5000,
            default_company: String::new(),
            assume_remote: false,
        }
    }

    pub fn with_default_company(mut self, company: impl Into<String>) -> Self {
        self.default_company = company.into();
        self
    }

    pub fn with_assume_remote(mut self) -> Self {
        self.assume_remote = true;
        self
    }
}

/// A single normalized listing. Created by a fetcher, mutated only by the
/// normalization pass, immutable once it reaches deduplication.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListingRecord {
    pub title: String,
    #[serde(default)]
    pub company: String,
    #[serde(default)]
    pub location: String,
    #[serde(default)]
    pub url: String,
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub team: Option<String>,
    pub fetched_at: DateTime<Utc>,
}

impl ListingRecord {
    /// Lowercased concatenation of the fields keyword filtering runs over.
    pub fn searchable_text(&self) -> String {
        let team = self.team.as_deref().unwrap_or_default();
        format!("{} {} {} {}", self.title, self.company, self.location, team).to_lowercase()
    }
}

/// True when a trimmed title fits the admissible length window.
pub fn title_within_bounds(title: &str) -> bool {
    let len = title.trim().chars().count();
    (TITLE_MIN_LEN..=TITLE_MAX_LEN).contains(&len)
}

/// Per-source record count, kept in descending order by the stats pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceCount {
    pub source: String,
    pub count: usize,
}

/// Final owned output of one `run()` call. Not persisted by the core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregationResult {
    pub records: Vec<ListingRecord>,
    pub counts_by_source: Vec<SourceCount>,
}

impl AggregationResult {
    pub fn total(&self) -> usize {
        self.records.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn title_bounds_reject_short_and_oversized() {
        assert!(!title_within_bounds("Go"));
        assert!(!title_within_bounds("  a  "));
        assert!(title_within_bounds("Senior Solidity Engineer"));
        assert!(!title_within_bounds(&"x".repeat(251)));
        assert!(title_within_bounds(&"x".repeat(250)));
    }

    #[test]
    fn searchable_text_covers_title_company_location_team() {
        let record = ListingRecord {
            title: "Backend Engineer".into(),
            company: "Acme".into(),
            location: "Berlin".into(),
            url: String::new(),
            source: "Test".into(),
            team: Some("Infra".into()),
            fetched_at: Utc::now(),
        };
        let text = record.searchable_text();
        assert!(text.contains("backend engineer"));
        assert!(text.contains("acme"));
        assert!(text.contains("berlin"));
        assert!(text.contains("infra"));
    }
}
