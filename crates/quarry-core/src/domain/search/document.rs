//! Search documents
//!
//! The engine-agnostic record stored in the index. One document exists per
//! `(model, id)` pair.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::entity::ModelKind;
use super::scoring::normalize;

/// Identity of a search document
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DocKey {
    pub model: ModelKind,
    pub id: i64,
}

impl DocKey {
    pub fn new(model: ModelKind, id: i64) -> Self {
        Self { model, id }
    }
}

impl fmt::Display for DocKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.model, self.id)
    }
}

/// A data-permission boundary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DataScope {
    Database { database_id: i64 },
    Table { database_id: i64, table_id: i64 },
}

impl DataScope {
    pub fn database_id(&self) -> i64 {
        match self {
            Self::Database { database_id } | Self::Table { database_id, .. } => *database_id,
        }
    }
}

/// The access-control boundary governing a document's visibility
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PermissionScope {
    /// Governed by read access to a collection; `None` is the root collection
    Collection { collection_id: Option<i64> },
    /// Governed by data access to a database or table
    Data { scope: DataScope },
}

/// Signals that feed the popularity and trust parts of the ranking formula
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RankingSignals {
    pub view_count: i64,
    pub bookmark_count: i64,
    /// Verified card/dashboard or official collection
    pub official: bool,
}

/// A projected, normalized search record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchDocument {
    pub model: ModelKind,
    pub model_id: i64,
    pub name: String,
    pub description: Option<String>,
    /// Secondary text: native query body or snippet content
    pub native_query: Option<String>,
    pub template_tags: Vec<String>,
    pub archived: bool,
    pub collection_id: Option<i64>,
    /// Ancestor collection ids, root first
    pub collection_path: Vec<i64>,
    pub database_id: Option<i64>,
    pub table_id: Option<i64>,
    pub updated_at: DateTime<Utc>,
    pub signals: RankingSignals,
    pub scope: PermissionScope,
    /// Model-specific display metadata (display type, schema, engine, ...)
    pub metadata: serde_json::Value,
}

impl SearchDocument {
    pub fn key(&self) -> DocKey {
        DocKey::new(self.model, self.model_id)
    }

    /// Normalized text used for candidate matching
    pub fn search_text(&self) -> String {
        let mut parts: Vec<&str> = vec![self.name.as_str()];
        if let Some(description) = &self.description {
            parts.push(description);
        }
        if let Some(native) = &self.native_query {
            parts.push(native);
        }
        parts.extend(self.template_tags.iter().map(String::as_str));
        normalize(&parts.join("\n"))
    }

    /// Whether the document lives in `collection_id` or one of its descendants
    pub fn is_within_collection(&self, collection_id: i64) -> bool {
        self.collection_id == Some(collection_id) || self.collection_path.contains(&collection_id)
    }
}
