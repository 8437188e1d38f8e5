//! Search specifications
//!
//! Composable specifications for the request filters every engine must
//! honor: model kinds, archived state, collection scope and text match.

use crate::domain::specification::Specification;

use super::context::{ArchivedFilter, SearchContext};
use super::document::SearchDocument;
use super::entity::ModelKind;
use super::scoring::PreparedQuery;

/// Specification for filtering by model kind
pub struct ModelKindSpec {
    allowed: Vec<ModelKind>,
}

impl ModelKindSpec {
    /// Create a new model kind specification; empty allows every kind
    pub fn new(allowed: Vec<ModelKind>) -> Self {
        Self { allowed }
    }

    /// Create a spec that allows all model kinds
    pub fn all() -> Self {
        Self {
            allowed: Vec::new(),
        }
    }
}

impl Specification<SearchDocument> for ModelKindSpec {
    fn is_satisfied_by(&self, doc: &SearchDocument) -> bool {
        self.allowed.is_empty() || self.allowed.contains(&doc.model)
    }
}

/// Specification for the archived filter
pub struct ArchivedSpec {
    filter: ArchivedFilter,
}

impl ArchivedSpec {
    pub fn new(filter: ArchivedFilter) -> Self {
        Self { filter }
    }
}

impl Specification<SearchDocument> for ArchivedSpec {
    fn is_satisfied_by(&self, doc: &SearchDocument) -> bool {
        self.filter.matches(doc.archived)
    }
}

/// Specification for documents inside a collection subtree
pub struct CollectionScopeSpec {
    collection_id: i64,
}

impl CollectionScopeSpec {
    pub fn new(collection_id: i64) -> Self {
        Self { collection_id }
    }
}

impl Specification<SearchDocument> for CollectionScopeSpec {
    fn is_satisfied_by(&self, doc: &SearchDocument) -> bool {
        doc.is_within_collection(self.collection_id)
    }
}

/// Specification for documents whose text contains every query token
pub struct TextMatchSpec {
    query: PreparedQuery,
}

impl TextMatchSpec {
    pub fn new(query: PreparedQuery) -> Self {
        Self { query }
    }
}

impl Specification<SearchDocument> for TextMatchSpec {
    fn is_satisfied_by(&self, doc: &SearchDocument) -> bool {
        self.query.is_empty() || self.query.matches(&doc.search_text())
    }
}

/// Builder for composing search specifications
#[derive(Default)]
pub struct SearchSpecBuilder {
    model_spec: Option<ModelKindSpec>,
    archived_spec: Option<ArchivedSpec>,
    collection_spec: Option<CollectionScopeSpec>,
    text_spec: Option<TextMatchSpec>,
}

impl SearchSpecBuilder {
    /// Create a new builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Every filter a search request carries, without the text match
    pub fn for_context(ctx: &SearchContext) -> Self {
        let mut builder = Self::new()
            .with_models(ctx.requested_models())
            .with_archived(ctx.archived());
        if let Some(collection_id) = ctx.collection() {
            builder = builder.with_collection(collection_id);
        }
        builder
    }

    /// Add model kind filter
    pub fn with_models(mut self, models: Vec<ModelKind>) -> Self {
        self.model_spec = Some(ModelKindSpec::new(models));
        self
    }

    /// Add archived filter
    pub fn with_archived(mut self, filter: ArchivedFilter) -> Self {
        self.archived_spec = Some(ArchivedSpec::new(filter));
        self
    }

    /// Add collection subtree filter
    pub fn with_collection(mut self, collection_id: i64) -> Self {
        self.collection_spec = Some(CollectionScopeSpec::new(collection_id));
        self
    }

    /// Add text match filter
    pub fn with_text(mut self, query: PreparedQuery) -> Self {
        self.text_spec = Some(TextMatchSpec::new(query));
        self
    }

    /// Check if a document satisfies all specifications
    pub fn is_satisfied_by(&self, doc: &SearchDocument) -> bool {
        self.model_spec.as_ref().is_none_or(|s| s.is_satisfied_by(doc))
            && self.archived_spec.as_ref().is_none_or(|s| s.is_satisfied_by(doc))
            && self.collection_spec.as_ref().is_none_or(|s| s.is_satisfied_by(doc))
            && self.text_spec.as_ref().is_none_or(|s| s.is_satisfied_by(doc))
    }
}
