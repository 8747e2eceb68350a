use std::cmp::Ordering;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::RwLock;

use steward_core::domain::message::SessionId;
use steward_core::domain::summary::{Provenance, RetrievedContext, Summary};

#[derive(Clone, Debug, PartialEq)]
pub struct SearchHit {
    pub text: String,
    pub session_id: Option<SessionId>,
    pub score: f64,
}

/// Search over persisted summaries, optionally scoped to one session.
#[async_trait]
pub trait RelevanceIndex: Send + Sync {
    async fn search(
        &self,
        query: &str,
        session_filter: Option<&SessionId>,
        top_k: usize,
    ) -> Result<Vec<SearchHit>>;

    async fn index_summary(&self, summary: &Summary) -> Result<()>;
}

/// Keyword-overlap index held in memory. Score is the share of query
/// keywords found in the summary text.
#[derive(Default)]
pub struct KeywordRelevanceIndex {
    entries: RwLock<Vec<(SessionId, String)>>,
}

#[async_trait]
impl RelevanceIndex for KeywordRelevanceIndex {
    async fn search(
        &self,
        query: &str,
        session_filter: Option<&SessionId>,
        top_k: usize,
    ) -> Result<Vec<SearchHit>> {
        let query_lower = query.to_lowercase();
        let keywords: Vec<&str> = query_lower.split_whitespace().collect();
        if keywords.is_empty() {
            return Ok(Vec::new());
        }

        let entries = self.entries.read().await;
        let mut hits: Vec<SearchHit> = entries
            .iter()
            .filter(|(session_id, _)| session_filter.map_or(true, |filter| filter == session_id))
            .filter_map(|(session_id, text)| {
                let text_lower = text.to_lowercase();
                let matched =
                    keywords.iter().filter(|keyword| text_lower.contains(**keyword)).count();
                (matched > 0).then(|| SearchHit {
                    text: text.clone(),
                    session_id: Some(session_id.clone()),
                    score: matched as f64 / keywords.len() as f64,
                })
            })
            .collect();

        hits.sort_by(by_score_desc);
        hits.truncate(top_k);
        Ok(hits)
    }

    async fn index_summary(&self, summary: &Summary) -> Result<()> {
        let mut entries = self.entries.write().await;
        entries.push((summary.session_id.clone(), summary.content.clone()));
        Ok(())
    }
}

fn by_score_desc(left: &SearchHit, right: &SearchHit) -> Ordering {
    right.score.partial_cmp(&left.score).unwrap_or(Ordering::Equal)
}

/// Combines the session-scoped and unscoped result sets.
///
/// Unscoped hits from the current session are dropped so the same summary is
/// never surfaced twice, then everything under `min_score` is filtered out
/// and the best `max_results` survive, tagged with where they came from.
pub fn merge_hits(
    current_session: &SessionId,
    scoped: Vec<SearchHit>,
    unscoped: Vec<SearchHit>,
    min_score: f64,
    max_results: usize,
) -> Vec<RetrievedContext> {
    let mut merged: Vec<(SearchHit, Provenance)> = scoped
        .into_iter()
        .map(|hit| (hit, Provenance::CurrentSession))
        .chain(
            unscoped
                .into_iter()
                .filter(|hit| hit.session_id.as_ref() != Some(current_session))
                .map(|hit| (hit, Provenance::CrossSession)),
        )
        .filter(|(hit, _)| hit.score >= min_score)
        .collect();

    merged.sort_by(|(left, _), (right, _)| by_score_desc(left, right));
    merged.truncate(max_results);

    merged
        .into_iter()
        .map(|(hit, provenance)| RetrievedContext {
            text: hit.text,
            session_id: hit.session_id,
            score: hit.score,
            provenance,
        })
        .collect()
}
