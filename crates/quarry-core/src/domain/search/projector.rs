//! Entity projector
//!
//! Converts domain entities into search documents. Projection is pure: it
//! reads only the entity it is given, never resolves permissions, and is
//! safe to call from any number of tasks at once.

use serde_json::json;

use super::document::{DataScope, PermissionScope, RankingSignals, SearchDocument};
use super::entity::{ModelKind, SearchableEntity};
use crate::error::{Error, Result};

/// Stateless entity-to-document projector
#[derive(Debug, Clone, Copy, Default)]
pub struct EntityProjector;

impl EntityProjector {
    /// Project an entity into its search document
    pub fn project(entity: &SearchableEntity) -> SearchDocument {
        match entity {
            SearchableEntity::Card(card) => SearchDocument {
                model: ModelKind::Card,
                model_id: card.id,
                name: card.name.clone(),
                description: clean(card.description.as_deref()),
                native_query: clean(card.native_query.as_deref()),
                template_tags: tag_names(&card.template_tags),
                archived: card.archived,
                collection_id: card.collection_id,
                collection_path: card.collection_path.clone(),
                database_id: Some(card.database_id),
                table_id: card.table_id,
                updated_at: card.updated_at,
                signals: RankingSignals {
                    view_count: card.view_count,
                    bookmark_count: card.bookmark_count,
                    official: card.verified,
                },
                scope: PermissionScope::Collection {
                    collection_id: card.collection_id,
                },
                metadata: json!({
                    "display": card.display,
                    "card_type": card.card_type.as_str(),
                }),
            },

            SearchableEntity::Dashboard(dashboard) => SearchDocument {
                model: ModelKind::Dashboard,
                model_id: dashboard.id,
                name: dashboard.name.clone(),
                description: clean(dashboard.description.as_deref()),
                native_query: None,
                template_tags: Vec::new(),
                archived: dashboard.archived,
                collection_id: dashboard.collection_id,
                collection_path: dashboard.collection_path.clone(),
                database_id: None,
                table_id: None,
                updated_at: dashboard.updated_at,
                signals: RankingSignals {
                    view_count: dashboard.view_count,
                    bookmark_count: dashboard.bookmark_count,
                    official: dashboard.verified,
                },
                scope: PermissionScope::Collection {
                    collection_id: dashboard.collection_id,
                },
                metadata: json!({ "dashcard_count": dashboard.dashcard_count }),
            },

            // A collection sits inside its parent but is governed by itself
            SearchableEntity::Collection(collection) => {
                let (parent, ancestors) = match collection.location.split_last() {
                    Some((parent, ancestors)) => (Some(*parent), ancestors.to_vec()),
                    None => (None, Vec::new()),
                };
                SearchDocument {
                    model: ModelKind::Collection,
                    model_id: collection.id,
                    name: collection.name.clone(),
                    description: clean(collection.description.as_deref()),
                    native_query: None,
                    template_tags: Vec::new(),
                    archived: collection.archived,
                    collection_id: parent,
                    collection_path: ancestors,
                    database_id: None,
                    table_id: None,
                    updated_at: collection.updated_at,
                    signals: RankingSignals {
                        view_count: 0,
                        bookmark_count: 0,
                        official: collection.official,
                    },
                    scope: PermissionScope::Collection {
                        collection_id: Some(collection.id),
                    },
                    metadata: json!({ "personal_owner_id": collection.personal_owner_id }),
                }
            }

            SearchableEntity::Table(table) => SearchDocument {
                model: ModelKind::Table,
                model_id: table.id,
                name: entity.name().to_string(),
                description: clean(table.description.as_deref()),
                native_query: None,
                template_tags: Vec::new(),
                archived: !table.active,
                collection_id: None,
                collection_path: Vec::new(),
                database_id: Some(table.database_id),
                table_id: Some(table.id),
                updated_at: table.updated_at,
                signals: RankingSignals {
                    view_count: table.view_count,
                    bookmark_count: 0,
                    official: false,
                },
                scope: PermissionScope::Data {
                    scope: DataScope::Table {
                        database_id: table.database_id,
                        table_id: table.id,
                    },
                },
                metadata: json!({
                    "table_name": table.name,
                    "schema": table.schema,
                }),
            },

            SearchableEntity::Database(database) => SearchDocument {
                model: ModelKind::Database,
                model_id: database.id,
                name: database.name.clone(),
                description: clean(database.description.as_deref()),
                native_query: None,
                template_tags: Vec::new(),
                archived: false,
                collection_id: None,
                collection_path: Vec::new(),
                database_id: Some(database.id),
                table_id: None,
                updated_at: database.updated_at,
                signals: RankingSignals::default(),
                scope: PermissionScope::Data {
                    scope: DataScope::Database {
                        database_id: database.id,
                    },
                },
                metadata: json!({ "engine": database.engine }),
            },

            SearchableEntity::Segment(segment) => SearchDocument {
                model: ModelKind::Segment,
                model_id: segment.id,
                name: segment.name.clone(),
                description: clean(segment.description.as_deref()),
                native_query: None,
                template_tags: Vec::new(),
                archived: segment.archived,
                collection_id: None,
                collection_path: Vec::new(),
                database_id: Some(segment.database_id),
                table_id: Some(segment.table_id),
                updated_at: segment.updated_at,
                signals: RankingSignals::default(),
                scope: PermissionScope::Data {
                    scope: DataScope::Table {
                        database_id: segment.database_id,
                        table_id: segment.table_id,
                    },
                },
                metadata: json!({}),
            },

            SearchableEntity::Action(action) => SearchDocument {
                model: ModelKind::Action,
                model_id: action.id,
                name: action.name.clone(),
                description: clean(action.description.as_deref()),
                native_query: None,
                template_tags: Vec::new(),
                archived: action.archived,
                collection_id: action.collection_id,
                collection_path: action.collection_path.clone(),
                database_id: action.database_id,
                table_id: None,
                updated_at: action.updated_at,
                signals: RankingSignals::default(),
                scope: PermissionScope::Collection {
                    collection_id: action.collection_id,
                },
                metadata: json!({
                    "model_id": action.model_id,
                    "action_type": action.action_type,
                }),
            },

            SearchableEntity::IndexedEntity(value) => SearchDocument {
                model: ModelKind::IndexedEntity,
                model_id: value.id,
                name: value.name.clone(),
                description: None,
                native_query: None,
                template_tags: Vec::new(),
                archived: false,
                collection_id: value.collection_id,
                collection_path: value.collection_path.clone(),
                database_id: Some(value.database_id),
                table_id: None,
                updated_at: value.updated_at,
                signals: RankingSignals::default(),
                scope: PermissionScope::Collection {
                    collection_id: value.collection_id,
                },
                metadata: json!({
                    "model_id": value.model_id,
                    "model_name": value.model_name,
                    "model_pk": value.model_pk,
                }),
            },

            SearchableEntity::Snippet(snippet) => SearchDocument {
                model: ModelKind::Snippet,
                model_id: snippet.id,
                name: snippet.name.clone(),
                description: clean(snippet.description.as_deref()),
                native_query: clean(Some(&snippet.content)),
                template_tags: Vec::new(),
                archived: snippet.archived,
                collection_id: snippet.collection_id,
                collection_path: snippet.collection_path.clone(),
                database_id: None,
                table_id: None,
                updated_at: snippet.updated_at,
                signals: RankingSignals::default(),
                scope: PermissionScope::Collection {
                    collection_id: snippet.collection_id,
                },
                metadata: json!({}),
            },
        }
    }

    /// Decode a stored entity row and project it
    pub fn project_record(model: &str, payload: &str) -> Result<SearchDocument> {
        let entity = decode_entity(model, payload)?;
        Ok(Self::project(&entity))
    }
}

/// Decode a JSON entity row whose model tag is stored alongside it
pub fn decode_entity(model: &str, payload: &str) -> Result<SearchableEntity> {
    let kind: ModelKind = model.parse()?;
    let entity: SearchableEntity = serde_json::from_str(payload)?;
    if entity.model() != kind {
        return Err(Error::InvalidInput(format!(
            "entity row tagged '{}' holds a {} payload",
            kind,
            entity.model()
        )));
    }
    Ok(entity)
}

fn clean(text: Option<&str>) -> Option<String> {
    text.map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
}

fn tag_names(tags: &[String]) -> Vec<String> {
    let mut names: Vec<String> = tags
        .iter()
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .collect();
    names.sort();
    names.dedup();
    names
}
