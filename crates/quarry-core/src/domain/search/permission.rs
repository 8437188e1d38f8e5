//! Permission filtering
//!
//! Engines are not trusted to pre-filter by permission. The facade runs every
//! ranked result through [`PermissionFilter`], which resolves all governing
//! scopes for a result set in one batched call per scope kind.

use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use super::context::{AccessLevel, Principal, SearchContext};
use super::document::{DataScope, PermissionScope, SearchDocument};
use super::scoring::ScoredDocument;
use crate::error::{Error, Result};

/// Resolves what a principal may see
#[async_trait]
pub trait PermissionService: Send + Sync {
    /// Access level on each requested collection; missing entries mean none
    async fn collection_access(
        &self,
        principal: &Principal,
        collections: &[Option<i64>],
    ) -> Result<HashMap<Option<i64>, AccessLevel>>;

    /// The subset of `scopes` the principal may read data from
    async fn data_access(
        &self,
        principal: &Principal,
        scopes: &[DataScope],
    ) -> Result<HashSet<DataScope>>;
}

/// Permission service backed by the grants carried on the principal
#[derive(Debug, Clone, Copy, Default)]
pub struct PrincipalPermissions;

#[async_trait]
impl PermissionService for PrincipalPermissions {
    async fn collection_access(
        &self,
        principal: &Principal,
        collections: &[Option<i64>],
    ) -> Result<HashMap<Option<i64>, AccessLevel>> {
        Ok(collections
            .iter()
            .filter_map(|id| {
                if principal.is_superuser {
                    Some((*id, AccessLevel::Write))
                } else {
                    principal
                        .permissions
                        .collections
                        .get(id)
                        .map(|level| (*id, *level))
                }
            })
            .collect())
    }

    async fn data_access(
        &self,
        principal: &Principal,
        scopes: &[DataScope],
    ) -> Result<HashSet<DataScope>> {
        let granted = &principal.permissions;
        Ok(scopes
            .iter()
            .filter(|scope| {
                principal.is_superuser
                    || granted.databases.contains(&scope.database_id())
                    || matches!(scope, DataScope::Table { table_id, .. } if granted.tables.contains(table_id))
            })
            .copied()
            .collect())
    }
}

/// Drops results the requesting principal may not see
#[derive(Clone)]
pub struct PermissionFilter {
    service: Arc<dyn PermissionService>,
}

impl PermissionFilter {
    pub fn new(service: Arc<dyn PermissionService>) -> Self {
        Self { service }
    }

    /// Keep only the results visible to the context's principal
    ///
    /// Order is preserved. When a scope kind cannot be resolved, every item
    /// governed by that kind is excluded and the failure is logged.
    pub async fn filter(
        &self,
        ctx: &SearchContext,
        results: Vec<ScoredDocument>,
    ) -> Vec<ScoredDocument> {
        if results.is_empty() {
            return results;
        }

        let principal = ctx.principal();
        let mut collections = BTreeSet::new();
        let mut data_scopes = Vec::new();
        let mut seen_data = HashSet::new();
        for result in &results {
            match result.document.scope {
                PermissionScope::Collection { collection_id } => {
                    collections.insert(collection_id);
                }
                PermissionScope::Data { scope } => {
                    if seen_data.insert(scope) {
                        data_scopes.push(scope);
                    }
                }
            }
        }
        let collections: Vec<Option<i64>> = collections.into_iter().collect();

        let (collection_access, data_access) = tokio::join!(
            async {
                if collections.is_empty() {
                    Ok(HashMap::new())
                } else {
                    self.service.collection_access(principal, &collections).await
                }
            },
            async {
                if data_scopes.is_empty() {
                    Ok(HashSet::new())
                } else {
                    self.service.data_access(principal, &data_scopes).await
                }
            }
        );

        let collection_access = collection_access
            .map_err(|e| report_failure("collection", principal, e))
            .ok();
        let data_access = data_access
            .map_err(|e| report_failure("data", principal, e))
            .ok();

        let before = results.len();
        let visible: Vec<ScoredDocument> = results
            .into_iter()
            .filter(|result| {
                is_visible(
                    ctx,
                    &result.document,
                    collection_access.as_ref(),
                    data_access.as_ref(),
                )
            })
            .collect();

        tracing::debug!(
            user_id = principal.user_id,
            candidates = before,
            visible = visible.len(),
            "Applied permission filter"
        );
        visible
    }
}

fn report_failure(kind: &str, principal: &Principal, source: Error) -> Error {
    let error = Error::PermissionResolutionFailed(format!("{} scopes: {}", kind, source));
    tracing::warn!(
        user_id = principal.user_id,
        error = %error,
        "Excluding results whose permissions could not be resolved"
    );
    error
}

fn is_visible(
    ctx: &SearchContext,
    doc: &SearchDocument,
    collection_access: Option<&HashMap<Option<i64>, AccessLevel>>,
    data_access: Option<&HashSet<DataScope>>,
) -> bool {
    if !ctx.archived().matches(doc.archived) {
        return false;
    }

    match doc.scope {
        PermissionScope::Collection { collection_id } => {
            let Some(level) = collection_access.and_then(|access| access.get(&collection_id))
            else {
                return false;
            };
            !doc.archived || level.can_write()
        }
        PermissionScope::Data { scope } => {
            let readable = data_access.is_some_and(|granted| granted.contains(&scope));
            readable && (!doc.archived || ctx.principal().is_superuser)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::search::context::{ArchivedFilter, PermissionSet};
    use crate::domain::search::document::RankingSignals;
    use crate::domain::search::entity::ModelKind;
    use chrono::Utc;

    fn result(model: ModelKind, id: i64, scope: PermissionScope, archived: bool) -> ScoredDocument {
        ScoredDocument {
            document: SearchDocument {
                model,
                model_id: id,
                name: format!("{} {}", model, id),
                description: None,
                native_query: None,
                template_tags: Vec::new(),
                archived,
                collection_id: None,
                collection_path: Vec::new(),
                database_id: None,
                table_id: None,
                updated_at: Utc::now(),
                signals: RankingSignals::default(),
                scope,
                metadata: serde_json::json!({}),
            },
            score: 1.0,
        }
    }

    fn in_collection(id: i64, collection_id: Option<i64>, archived: bool) -> ScoredDocument {
        result(
            ModelKind::Card,
            id,
            PermissionScope::Collection { collection_id },
            archived,
        )
    }

    fn in_table(id: i64, table_id: i64, archived: bool) -> ScoredDocument {
        result(
            ModelKind::Segment,
            id,
            PermissionScope::Data {
                scope: DataScope::Table {
                    database_id: 1,
                    table_id,
                },
            },
            archived,
        )
    }

    fn ids(results: &[ScoredDocument]) -> Vec<i64> {
        results.iter().map(|r| r.document.model_id).collect()
    }

    struct FailingCollections;

    #[async_trait]
    impl PermissionService for FailingCollections {
        async fn collection_access(
            &self,
            _principal: &Principal,
            _collections: &[Option<i64>],
        ) -> Result<HashMap<Option<i64>, AccessLevel>> {
            Err(Error::Other("permission store offline".to_string()))
        }

        async fn data_access(
            &self,
            principal: &Principal,
            scopes: &[DataScope],
        ) -> Result<HashSet<DataScope>> {
            PrincipalPermissions.data_access(principal, scopes).await
        }
    }

    #[tokio::test]
    async fn test_collection_read_required() {
        let principal = Principal::user(
            7,
            PermissionSet::new().with_collection(Some(1), AccessLevel::Read),
        );
        let ctx = SearchContext::new("", principal);
        let filter = PermissionFilter::new(Arc::new(PrincipalPermissions));

        let visible = filter
            .filter(
                &ctx,
                vec![
                    in_collection(1, Some(1), false),
                    in_collection(2, Some(2), false),
                    in_collection(3, None, false),
                ],
            )
            .await;
        assert_eq!(ids(&visible), vec![1]);
    }

    #[tokio::test]
    async fn test_archived_requires_write_and_request() {
        let principal = Principal::user(
            7,
            PermissionSet::new()
                .with_collection(Some(1), AccessLevel::Read)
                .with_collection(Some(2), AccessLevel::Write),
        );
        let filter = PermissionFilter::new(Arc::new(PrincipalPermissions));
        let results = vec![in_collection(1, Some(1), true), in_collection(2, Some(2), true)];

        let default_ctx = SearchContext::new("", principal.clone());
        assert!(filter.filter(&default_ctx, results.clone()).await.is_empty());

        let archived_ctx = SearchContext::new("", principal).with_archived(ArchivedFilter::Only);
        assert_eq!(ids(&filter.filter(&archived_ctx, results).await), vec![2]);
    }

    #[tokio::test]
    async fn test_data_scopes() {
        let principal = Principal::user(7, PermissionSet::new().with_table(30));
        let ctx = SearchContext::new("", principal).with_archived(ArchivedFilter::Include);
        let filter = PermissionFilter::new(Arc::new(PrincipalPermissions));

        let visible = filter
            .filter(
                &ctx,
                vec![in_table(1, 30, false), in_table(2, 31, false), in_table(3, 30, true)],
            )
            .await;
        assert_eq!(ids(&visible), vec![1], "archived data items need a superuser");

        let admin = SearchContext::new("", Principal::superuser(1)).with_archived(ArchivedFilter::Include);
        let visible = filter
            .filter(&admin, vec![in_table(1, 30, false), in_table(3, 30, true)])
            .await;
        assert_eq!(ids(&visible), vec![1, 3]);
    }

    #[tokio::test]
    async fn test_resolution_failure_excludes_affected_items() {
        let principal = Principal::user(
            7,
            PermissionSet::new()
                .with_collection(Some(1), AccessLevel::Write)
                .with_database(1),
        );
        let ctx = SearchContext::new("", principal);
        let filter = PermissionFilter::new(Arc::new(FailingCollections));

        let visible = filter
            .filter(&ctx, vec![in_collection(1, Some(1), false), in_table(2, 30, false)])
            .await;
        assert_eq!(ids(&visible), vec![2]);
    }
}
