//! Search request context
//!
//! A [`SearchContext`] is built once per request and never mutated while the
//! search runs. It carries the requesting principal so that the permission
//! filter can decide visibility without reaching back into the caller.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;

use super::entity::ModelKind;
use super::scoring::PreparedQuery;
use crate::error::{Error, Result};

/// Default page size
pub const DEFAULT_LIMIT: usize = 50;

/// Largest page a caller may request
pub const MAX_LIMIT: usize = 1000;

/// Access a principal holds on a collection
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessLevel {
    Read,
    Write,
}

impl AccessLevel {
    pub fn can_write(&self) -> bool {
        matches!(self, Self::Write)
    }
}

/// Everything a principal has been granted
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PermissionSet {
    /// Collection grants; `None` is the root collection
    pub collections: HashMap<Option<i64>, AccessLevel>,
    /// Databases with full data access
    pub databases: HashSet<i64>,
    /// Individual tables with data access
    pub tables: HashSet<i64>,
}

impl PermissionSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_collection(mut self, collection_id: Option<i64>, level: AccessLevel) -> Self {
        self.collections
            .entry(collection_id)
            .and_modify(|current| *current = (*current).max(level))
            .or_insert(level);
        self
    }

    pub fn with_database(mut self, database_id: i64) -> Self {
        self.databases.insert(database_id);
        self
    }

    pub fn with_table(mut self, table_id: i64) -> Self {
        self.tables.insert(table_id);
        self
    }
}

/// The user a search runs on behalf of
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub user_id: i64,
    pub is_superuser: bool,
    pub permissions: PermissionSet,
}

impl Principal {
    pub fn user(user_id: i64, permissions: PermissionSet) -> Self {
        Self {
            user_id,
            is_superuser: false,
            permissions,
        }
    }

    pub fn superuser(user_id: i64) -> Self {
        Self {
            user_id,
            is_superuser: true,
            permissions: PermissionSet::default(),
        }
    }
}

/// How archived documents are treated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArchivedFilter {
    /// Only live documents
    #[default]
    Exclude,
    /// Only archived documents
    Only,
    /// Both
    Include,
}

impl ArchivedFilter {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Exclude => "exclude",
            Self::Only => "only",
            Self::Include => "include",
        }
    }

    pub fn matches(&self, archived: bool) -> bool {
        match self {
            Self::Exclude => !archived,
            Self::Only => archived,
            Self::Include => true,
        }
    }

    /// Whether archived documents can appear at all
    pub fn wants_archived(&self) -> bool {
        !matches!(self, Self::Exclude)
    }
}

impl FromStr for ArchivedFilter {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "exclude" | "false" => Ok(Self::Exclude),
            "only" | "true" => Ok(Self::Only),
            "include" | "all" => Ok(Self::Include),
            _ => Err(Error::InvalidInput(format!(
                "Unknown archived filter '{}'. Use exclude, only or include.",
                s
            ))),
        }
    }
}

impl fmt::Display for ArchivedFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Page window applied after ranking and permission filtering
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    pub limit: usize,
    pub offset: usize,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            limit: DEFAULT_LIMIT,
            offset: 0,
        }
    }
}

impl Pagination {
    pub fn new(limit: usize, offset: usize) -> Self {
        Self {
            limit: limit.min(MAX_LIMIT),
            offset,
        }
    }

    /// Slice an ordered sequence down to this page
    pub fn apply<T>(&self, items: Vec<T>) -> Vec<T> {
        items
            .into_iter()
            .skip(self.offset)
            .take(self.limit)
            .collect()
    }
}

/// An immutable search request
#[derive(Debug, Clone)]
pub struct SearchContext {
    query: String,
    prepared: PreparedQuery,
    principal: Principal,
    archived: ArchivedFilter,
    models: Vec<ModelKind>,
    collection: Option<i64>,
    pagination: Pagination,
    now: DateTime<Utc>,
}

impl SearchContext {
    /// Create a request with default filters, capturing the current time
    pub fn new(query: impl Into<String>, principal: Principal) -> Self {
        let query = query.into();
        Self {
            prepared: PreparedQuery::new(&query),
            query,
            principal,
            archived: ArchivedFilter::default(),
            models: Vec::new(),
            collection: None,
            pagination: Pagination::default(),
            now: Utc::now(),
        }
    }

    /// Restrict results to the given model kinds
    pub fn with_models(mut self, models: impl IntoIterator<Item = ModelKind>) -> Self {
        self.models = models.into_iter().collect();
        self.models.sort();
        self.models.dedup();
        self
    }

    pub fn with_archived(mut self, archived: ArchivedFilter) -> Self {
        self.archived = archived;
        self
    }

    /// Restrict results to a collection and its descendants
    pub fn with_collection(mut self, collection_id: i64) -> Self {
        self.collection = Some(collection_id);
        self
    }

    pub fn with_pagination(mut self, limit: usize, offset: usize) -> Self {
        self.pagination = Pagination::new(limit, offset);
        self
    }

    /// Pin the clock used for recency scoring
    pub fn with_now(mut self, now: DateTime<Utc>) -> Self {
        self.now = now;
        self
    }

    pub fn query(&self) -> &str {
        &self.query
    }

    pub fn prepared(&self) -> &PreparedQuery {
        &self.prepared
    }

    pub fn principal(&self) -> &Principal {
        &self.principal
    }

    pub fn archived(&self) -> ArchivedFilter {
        self.archived
    }

    pub fn collection(&self) -> Option<i64> {
        self.collection
    }

    pub fn pagination(&self) -> Pagination {
        self.pagination
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.now
    }

    /// The model kinds this request covers; an empty filter means all
    pub fn requested_models(&self) -> Vec<ModelKind> {
        if self.models.is_empty() {
            ModelKind::ALL.to_vec()
        } else {
            self.models.clone()
        }
    }

    pub fn wants_model(&self, model: ModelKind) -> bool {
        self.models.is_empty() || self.models.contains(&model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_archived_filter() {
        assert!(ArchivedFilter::Exclude.matches(false));
        assert!(!ArchivedFilter::Exclude.matches(true));
        assert!(ArchivedFilter::Only.matches(true));
        assert!(!ArchivedFilter::Only.matches(false));
        assert!(ArchivedFilter::Include.matches(true));

        assert_eq!("ONLY".parse::<ArchivedFilter>().unwrap(), ArchivedFilter::Only);
        assert!("maybe".parse::<ArchivedFilter>().is_err());
    }

    #[test]
    fn test_pagination() {
        let page = Pagination::new(2, 1);
        assert_eq!(page.apply(vec![1, 2, 3, 4]), vec![2, 3]);
        assert_eq!(Pagination::new(5, 10).apply(vec![1, 2]), Vec::<i32>::new());
        assert_eq!(Pagination::new(usize::MAX, 0).limit, MAX_LIMIT);
    }

    #[test]
    fn test_context_builder() {
        let ctx = SearchContext::new("Sales", Principal::superuser(1))
            .with_models([ModelKind::Dashboard, ModelKind::Card, ModelKind::Card])
            .with_archived(ArchivedFilter::Include)
            .with_collection(4)
            .with_pagination(10, 20);

        assert_eq!(ctx.requested_models(), vec![ModelKind::Card, ModelKind::Dashboard]);
        assert!(ctx.wants_model(ModelKind::Card));
        assert!(!ctx.wants_model(ModelKind::Table));
        assert_eq!(ctx.collection(), Some(4));
        assert_eq!(ctx.pagination(), Pagination::new(10, 20));
        assert_eq!(ctx.prepared().tokens(), ["sales".to_string()]);
    }

    #[test]
    fn test_empty_model_filter_means_all() {
        let ctx = SearchContext::new("", Principal::superuser(1));
        assert_eq!(ctx.requested_models().len(), ModelKind::ALL.len());
    }

    #[test]
    fn test_permission_set_keeps_strongest_grant() {
        let set = PermissionSet::new()
            .with_collection(Some(1), AccessLevel::Write)
            .with_collection(Some(1), AccessLevel::Read);
        assert_eq!(set.collections[&Some(1)], AccessLevel::Write);
    }
}
