//! Relevance scoring
//!
//! The ranking formula shared by every engine. Both the persistent index and
//! the in-place scan call into [`Ranker`] so that the same document scores the
//! same way regardless of where it was found.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

use super::document::SearchDocument;
use crate::config::RankingConfig;

/// Lowercase `text` and collapse everything except letters, digits and
/// underscores into single spaces
pub fn normalize(text: &str) -> String {
    tokenize(text).join(" ")
}

/// Split text into normalized search tokens
pub fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

/// A search string prepared once per request
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PreparedQuery {
    normalized: String,
    tokens: Vec<String>,
}

impl PreparedQuery {
    pub fn new(raw: &str) -> Self {
        let tokens = tokenize(raw);
        Self {
            normalized: tokens.join(" "),
            tokens,
        }
    }

    pub fn tokens(&self) -> &[String] {
        &self.tokens
    }

    /// An empty query matches every document
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Whether every token occurs in the normalized `search_text`
    pub fn matches(&self, search_text: &str) -> bool {
        self.tokens.iter().all(|t| search_text.contains(t.as_str()))
    }
}

/// A document together with its relevance score
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredDocument {
    pub document: SearchDocument,
    pub score: f64,
}

/// Applies [`RankingConfig`] weights to documents
#[derive(Debug, Clone, Default)]
pub struct Ranker {
    config: RankingConfig,
}

impl Ranker {
    pub fn new(config: RankingConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RankingConfig {
        &self.config
    }

    /// Score a document, or `None` when it does not match the query
    pub fn score(
        &self,
        query: &PreparedQuery,
        doc: &SearchDocument,
        now: DateTime<Utc>,
    ) -> Option<f64> {
        let text = self.text_score(query, doc)?;
        let mut score = text * self.recency_factor(doc.updated_at, now) * self.popularity(doc);
        if doc.signals.official {
            score *= self.config.official_boost;
        }
        if doc.archived {
            score *= self.config.archived_penalty;
        }
        Some(score)
    }

    /// Score and order a set of candidates, dropping non-matches
    pub fn rank<I>(&self, query: &PreparedQuery, docs: I, now: DateTime<Utc>) -> Vec<ScoredDocument>
    where
        I: IntoIterator<Item = SearchDocument>,
    {
        let mut ranked: Vec<ScoredDocument> = docs
            .into_iter()
            .filter_map(|document| {
                self.score(query, &document, now)
                    .map(|score| ScoredDocument { document, score })
            })
            .collect();
        ranked.sort_by(compare_ranked);
        ranked
    }

    fn text_score(&self, query: &PreparedQuery, doc: &SearchDocument) -> Option<f64> {
        if query.is_empty() {
            return Some(1.0);
        }

        let name = normalize(&doc.name);
        let description = doc.description.as_deref().map(normalize).unwrap_or_default();
        let haystack = doc.search_text();

        let mut total = 0.0;
        for token in query.tokens() {
            if name.contains(token.as_str()) {
                total += self.config.name_weight;
            } else if description.contains(token.as_str()) {
                total += self.config.description_weight;
            } else if haystack.contains(token.as_str()) {
                total += self.config.native_query_weight;
            } else {
                return None;
            }
        }

        let mut score = total / query.tokens().len() as f64;
        if name == query.normalized {
            score += self.config.exact_name_bonus;
        }
        Some(score)
    }

    fn recency_factor(&self, updated_at: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
        let half_life = self.config.recency_half_life_days;
        if half_life <= 0.0 {
            return 1.0;
        }
        let age_days = ((now - updated_at).num_seconds().max(0) as f64) / 86_400.0;
        0.5 + 0.5 * 0.5_f64.powf(age_days / half_life)
    }

    fn popularity(&self, doc: &SearchDocument) -> f64 {
        let views = doc.signals.view_count.max(0) as f64;
        let bookmarks = doc.signals.bookmark_count.max(0) as f64;
        1.0 + views.ln_1p() * self.config.view_weight + bookmarks.ln_1p() * self.config.bookmark_weight
    }
}

/// Total order over ranked results
///
/// Score descending, live before archived, newer first, then name
/// (case-insensitive) and finally `(model, id)`.
pub fn compare_ranked(a: &ScoredDocument, b: &ScoredDocument) -> Ordering {
    b.score
        .total_cmp(&a.score)
        .then_with(|| a.document.archived.cmp(&b.document.archived))
        .then_with(|| b.document.updated_at.cmp(&a.document.updated_at))
        .then_with(|| {
            a.document
                .name
                .to_lowercase()
                .cmp(&b.document.name.to_lowercase())
        })
        .then_with(|| a.document.key().cmp(&b.document.key()))
}
