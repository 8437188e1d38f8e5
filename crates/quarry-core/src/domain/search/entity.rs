//! Searchable entity types
//!
//! The closed set of domain models the search core knows how to index, and
//! the change notifications the CRUD layer sends when one of them mutates.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::document::DocKey;
use crate::error::{Error, Result};

/// Kinds of models that can be searched
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelKind {
    /// Saved questions, models and metrics
    Card,
    Dashboard,
    Collection,
    Table,
    Database,
    Segment,
    Action,
    /// Individual values indexed out of a model
    IndexedEntity,
    /// Native query snippets
    Snippet,
}

impl ModelKind {
    /// Every searchable model kind
    pub const ALL: [ModelKind; 9] = [
        Self::Card,
        Self::Dashboard,
        Self::Collection,
        Self::Table,
        Self::Database,
        Self::Segment,
        Self::Action,
        Self::IndexedEntity,
        Self::Snippet,
    ];

    /// Convert to string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Card => "card",
            Self::Dashboard => "dashboard",
            Self::Collection => "collection",
            Self::Table => "table",
            Self::Database => "database",
            Self::Segment => "segment",
            Self::Action => "action",
            Self::IndexedEntity => "indexed_entity",
            Self::Snippet => "snippet",
        }
    }

    /// Whether visibility is governed by collection permissions (as opposed
    /// to data permissions)
    pub fn is_collection_scoped(&self) -> bool {
        match self {
            Self::Card
            | Self::Dashboard
            | Self::Collection
            | Self::Action
            | Self::IndexedEntity
            | Self::Snippet => true,
            Self::Table | Self::Database | Self::Segment => false,
        }
    }
}

impl FromStr for ModelKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "card" => Ok(Self::Card),
            "dashboard" => Ok(Self::Dashboard),
            "collection" => Ok(Self::Collection),
            "table" => Ok(Self::Table),
            "database" => Ok(Self::Database),
            "segment" => Ok(Self::Segment),
            "action" => Ok(Self::Action),
            "indexed_entity" | "indexed-entity" => Ok(Self::IndexedEntity),
            "snippet" => Ok(Self::Snippet),
            _ => Err(Error::UnsupportedModelKind(s.to_string())),
        }
    }
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The flavour of a saved card
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CardType {
    #[default]
    Question,
    Model,
    Metric,
}

impl CardType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Question => "question",
            Self::Model => "model",
            Self::Metric => "metric",
        }
    }
}

fn default_display() -> String {
    "table".to_string()
}

fn default_active() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CardEntity {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub archived: bool,
    #[serde(default)]
    pub collection_id: Option<i64>,
    /// Ancestor collection ids, root first, excluding `collection_id`
    #[serde(default)]
    pub collection_path: Vec<i64>,
    pub updated_at: DateTime<Utc>,
    #[serde(default = "default_display")]
    pub display: String,
    #[serde(default)]
    pub card_type: CardType,
    pub database_id: i64,
    #[serde(default)]
    pub table_id: Option<i64>,
    /// Query body when the card is written in native SQL
    #[serde(default)]
    pub native_query: Option<String>,
    #[serde(default)]
    pub template_tags: Vec<String>,
    #[serde(default)]
    pub view_count: i64,
    #[serde(default)]
    pub bookmark_count: i64,
    #[serde(default)]
    pub verified: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DashboardEntity {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub archived: bool,
    #[serde(default)]
    pub collection_id: Option<i64>,
    #[serde(default)]
    pub collection_path: Vec<i64>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub view_count: i64,
    #[serde(default)]
    pub bookmark_count: i64,
    #[serde(default)]
    pub verified: bool,
    #[serde(default)]
    pub dashcard_count: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionEntity {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub archived: bool,
    /// Ancestor collection ids, root first
    #[serde(default)]
    pub location: Vec<i64>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub official: bool,
    #[serde(default)]
    pub personal_owner_id: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableEntity {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub schema: Option<String>,
    pub database_id: i64,
    /// Inactive tables are treated as archived
    #[serde(default = "default_active")]
    pub active: bool,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub view_count: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseEntity {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub engine: String,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentEntity {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub archived: bool,
    pub table_id: i64,
    pub database_id: i64,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionEntity {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub archived: bool,
    /// The model card this action belongs to
    pub model_id: i64,
    pub action_type: String,
    #[serde(default)]
    pub collection_id: Option<i64>,
    #[serde(default)]
    pub collection_path: Vec<i64>,
    #[serde(default)]
    pub database_id: Option<i64>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexedValueEntity {
    pub id: i64,
    /// The indexed value, shown as the result name
    pub name: String,
    pub model_id: i64,
    pub model_name: String,
    pub model_pk: String,
    #[serde(default)]
    pub collection_id: Option<i64>,
    #[serde(default)]
    pub collection_path: Vec<i64>,
    pub database_id: i64,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnippetEntity {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub content: String,
    #[serde(default)]
    pub archived: bool,
    #[serde(default)]
    pub collection_id: Option<i64>,
    #[serde(default)]
    pub collection_path: Vec<i64>,
    pub updated_at: DateTime<Utc>,
}

/// A domain entity the search core can project into a document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "model", rename_all = "snake_case")]
pub enum SearchableEntity {
    Card(CardEntity),
    Dashboard(DashboardEntity),
    Collection(CollectionEntity),
    Table(TableEntity),
    Database(DatabaseEntity),
    Segment(SegmentEntity),
    Action(ActionEntity),
    IndexedEntity(IndexedValueEntity),
    Snippet(SnippetEntity),
}

impl SearchableEntity {
    pub fn model(&self) -> ModelKind {
        match self {
            Self::Card(_) => ModelKind::Card,
            Self::Dashboard(_) => ModelKind::Dashboard,
            Self::Collection(_) => ModelKind::Collection,
            Self::Table(_) => ModelKind::Table,
            Self::Database(_) => ModelKind::Database,
            Self::Segment(_) => ModelKind::Segment,
            Self::Action(_) => ModelKind::Action,
            Self::IndexedEntity(_) => ModelKind::IndexedEntity,
            Self::Snippet(_) => ModelKind::Snippet,
        }
    }

    pub fn id(&self) -> i64 {
        match self {
            Self::Card(e) => e.id,
            Self::Dashboard(e) => e.id,
            Self::Collection(e) => e.id,
            Self::Table(e) => e.id,
            Self::Database(e) => e.id,
            Self::Segment(e) => e.id,
            Self::Action(e) => e.id,
            Self::IndexedEntity(e) => e.id,
            Self::Snippet(e) => e.id,
        }
    }

    pub fn key(&self) -> DocKey {
        DocKey::new(self.model(), self.id())
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Card(e) => &e.name,
            Self::Dashboard(e) => &e.name,
            Self::Collection(e) => &e.name,
            Self::Table(e) => e.display_name.as_deref().unwrap_or(&e.name),
            Self::Database(e) => &e.name,
            Self::Segment(e) => &e.name,
            Self::Action(e) => &e.name,
            Self::IndexedEntity(e) => &e.name,
            Self::Snippet(e) => &e.name,
        }
    }

    pub fn archived(&self) -> bool {
        match self {
            Self::Card(e) => e.archived,
            Self::Dashboard(e) => e.archived,
            Self::Collection(e) => e.archived,
            Self::Table(e) => !e.active,
            Self::Database(_) | Self::IndexedEntity(_) => false,
            Self::Segment(e) => e.archived,
            Self::Action(e) => e.archived,
            Self::Snippet(e) => e.archived,
        }
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        match self {
            Self::Card(e) => e.updated_at,
            Self::Dashboard(e) => e.updated_at,
            Self::Collection(e) => e.updated_at,
            Self::Table(e) => e.updated_at,
            Self::Database(e) => e.updated_at,
            Self::Segment(e) => e.updated_at,
            Self::Action(e) => e.updated_at,
            Self::IndexedEntity(e) => e.updated_at,
            Self::Snippet(e) => e.updated_at,
        }
    }
}

/// What happened to an entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Created,
    Updated,
    Deleted,
    Archived,
    Unarchived,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Updated => "updated",
            Self::Deleted => "deleted",
            Self::Archived => "archived",
            Self::Unarchived => "unarchived",
        }
    }

    /// Whether the change removes the document instead of re-projecting it
    pub fn is_removal(&self) -> bool {
        matches!(self, Self::Deleted)
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A change notification from the CRUD layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityChange {
    pub model: ModelKind,
    pub id: i64,
    pub kind: ChangeKind,
}

impl EntityChange {
    pub fn new(model: ModelKind, id: i64, kind: ChangeKind) -> Self {
        Self { model, id, kind }
    }

    pub fn created(model: ModelKind, id: i64) -> Self {
        Self::new(model, id, ChangeKind::Created)
    }

    pub fn updated(model: ModelKind, id: i64) -> Self {
        Self::new(model, id, ChangeKind::Updated)
    }

    pub fn deleted(model: ModelKind, id: i64) -> Self {
        Self::new(model, id, ChangeKind::Deleted)
    }

    pub fn archived(model: ModelKind, id: i64) -> Self {
        Self::new(model, id, ChangeKind::Archived)
    }

    pub fn unarchived(model: ModelKind, id: i64) -> Self {
        Self::new(model, id, ChangeKind::Unarchived)
    }

    pub fn key(&self) -> DocKey {
        DocKey::new(self.model, self.id)
    }
}
