//! In-memory reference engine
//!
//! A deliberately simple engine used by tests and embedded deployments:
//! documents live in a map, queries score by token overlap. It exists to
//! exercise the routing layer, not to rank well.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use dashmap::DashMap;

use crate::types::{
    FacetCount, FieldValue, IndexSettings, ScoredResult, SearchQuery, ShardQueryResult,
    SortField, StoredDocument, TermCount, TermsRequest,
};
use crate::{Error, Result};

use super::{EngineShard, EngineSnapshot, SearchEngine};

/// Engine factory. Opening the same (index, shard) twice yields the same
/// underlying state, so a factory shared between a primary and a replica
/// behaves like shared storage: replica snapshots observe the primary's
/// commits without a separate replication mechanism.
#[derive(Default)]
pub struct MemoryEngine {
    shards: DashMap<(String, u32), Arc<MemoryShard>>,
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SearchEngine for MemoryEngine {
    fn open_shard(
        &self,
        settings: &IndexSettings,
        shard_number: u32,
    ) -> Result<Arc<dyn EngineShard>> {
        let key = (settings.index_name.clone(), shard_number);
        let shard = self
            .shards
            .entry(key)
            .or_insert_with(|| {
                Arc::new(MemoryShard {
                    index_name: settings.index_name.clone(),
                    shard_number,
                    live: RwLock::new(HashMap::new()),
                    committed: RwLock::new(Arc::new(CommittedState {
                        version: 0,
                        docs: HashMap::new(),
                    })),
                    version: AtomicU64::new(0),
                })
            })
            .clone();
        Ok(shard)
    }
}

/// Committed state shared by snapshots built from the same commit.
struct CommittedState {
    version: u64,
    docs: HashMap<String, StoredDocument>,
}

struct MemoryShard {
    index_name: String,
    shard_number: u32,
    /// Writer state: mutations land here and become visible on commit
    live: RwLock<HashMap<String, StoredDocument>>,
    committed: RwLock<Arc<CommittedState>>,
    version: AtomicU64,
}

impl EngineShard for MemoryShard {
    fn index_document(&self, doc: StoredDocument) -> Result<()> {
        let mut live = self.live.write().expect("live map poisoned");
        live.insert(doc.unique_id.clone(), doc);
        Ok(())
    }

    fn delete_document(&self, unique_id: &str) -> Result<()> {
        let mut live = self.live.write().expect("live map poisoned");
        live.remove(unique_id);
        Ok(())
    }

    fn commit(&self) -> Result<()> {
        let live = self.live.read().expect("live map poisoned");
        let version = self.version.fetch_add(1, Ordering::SeqCst) + 1;
        let state = Arc::new(CommittedState {
            version,
            docs: live.clone(),
        });
        drop(live);

        let mut committed = self.committed.write().expect("committed state poisoned");
        *committed = state;
        Ok(())
    }

    fn force_merge(&self, _max_segments: u32) -> Result<()> {
        // Nothing to compact in a single map.
        Ok(())
    }

    fn delete_all(&self) -> Result<()> {
        let mut live = self.live.write().expect("live map poisoned");
        live.clear();
        Ok(())
    }

    fn committed_version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }

    fn open_snapshot(&self) -> Result<Arc<dyn EngineSnapshot>> {
        let committed = self.committed.read().expect("committed state poisoned");
        Ok(Arc::new(MemorySnapshot {
            index_name: self.index_name.clone(),
            shard_number: self.shard_number,
            state: committed.clone(),
        }))
    }

    fn close(&self) -> Result<()> {
        Ok(())
    }
}

struct MemorySnapshot {
    index_name: String,
    shard_number: u32,
    state: Arc<CommittedState>,
}

fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .collect()
}

fn field_tokens(value: &FieldValue) -> Vec<String> {
    match value {
        FieldValue::String(s) => tokenize(s),
        FieldValue::StringArray(values) => values.iter().flat_map(|s| tokenize(s)).collect(),
        FieldValue::Integer(i) => vec![i.to_string()],
        FieldValue::Float(f) => vec![f.to_string()],
        FieldValue::Boolean(b) => vec![b.to_string()],
    }
}

fn doc_tokens(doc: &StoredDocument, fields: &[String]) -> Vec<String> {
    doc.document
        .fields
        .iter()
        .filter(|(name, _)| fields.is_empty() || fields.contains(name))
        .flat_map(|(_, value)| field_tokens(value))
        .collect()
}

/// Token-overlap score of a query against one document; 0 means no match.
/// An empty query matches everything with a neutral score.
fn score(query: &str, doc: &StoredDocument, fields: &[String]) -> f32 {
    let query_tokens = tokenize(query);
    if query_tokens.is_empty() {
        return 1.0;
    }

    let tokens = doc_tokens(doc, fields);
    let mut matched = 0usize;
    for q in &query_tokens {
        if tokens.iter().any(|t| t == q) {
            matched += 1;
        }
    }

    if matched == query_tokens.len() {
        matched as f32
    } else {
        0.0
    }
}

fn apply_sort(results: &mut [(StoredDocument, f32)], sort: &[SortField]) {
    results.sort_by(|(a, score_a), (b, score_b)| {
        for sort_field in sort {
            let ka = a.document.fields.get(&sort_field.field);
            let kb = b.document.fields.get(&sort_field.field);
            let mut ord = crate::types::compare_field_values(ka, kb);
            if sort_field.descending {
                ord = ord.reverse();
            }
            if ord != std::cmp::Ordering::Equal {
                return ord;
            }
        }
        // Fall back to score descending, then id for a stable total order.
        score_b
            .total_cmp(score_a)
            .then_with(|| a.unique_id.cmp(&b.unique_id))
    });
}

impl EngineSnapshot for MemorySnapshot {
    fn version(&self) -> u64 {
        self.state.version
    }

    fn search(&self, query: &SearchQuery, amount: usize) -> Result<ShardQueryResult> {
        let mut matched: Vec<(StoredDocument, f32)> = Vec::new();

        'docs: for doc in self.state.docs.values() {
            let doc_score = score(&query.query, doc, &query.query_fields);
            if doc_score <= 0.0 {
                continue;
            }
            for filter in &query.filter_queries {
                if score(filter, doc, &[]) <= 0.0 {
                    continue 'docs;
                }
            }
            matched.push((doc.clone(), doc_score));
        }

        let total_hits = matched.len() as u64;

        apply_sort(&mut matched, &query.sort);

        let mut facet_counts: HashMap<String, Vec<FacetCount>> = HashMap::new();
        for facet in &query.facets {
            let mut counts: BTreeMap<String, u64> = BTreeMap::new();
            for (doc, _) in &matched {
                match doc.document.fields.get(&facet.field) {
                    Some(FieldValue::String(value)) => {
                        *counts.entry(value.clone()).or_default() += 1;
                    }
                    Some(FieldValue::StringArray(values)) => {
                        for value in values {
                            *counts.entry(value.clone()).or_default() += 1;
                        }
                    }
                    _ => {}
                }
            }

            let mut counts: Vec<FacetCount> = counts
                .into_iter()
                .map(|(facet, count)| FacetCount { facet, count })
                .collect();
            counts.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.facet.cmp(&b.facet)));
            if facet.max_facets > 0 {
                counts.truncate(facet.max_facets as usize);
            }
            facet_counts.insert(facet.field.clone(), counts);
        }

        let results = matched
            .into_iter()
            .take(amount)
            .map(|(doc, doc_score)| ScoredResult {
                unique_id: doc.unique_id.clone(),
                score: doc_score,
                index_name: self.index_name.clone(),
                shard: self.shard_number,
                timestamp: doc.timestamp,
                document: Some(doc.document),
            })
            .collect();

        Ok(ShardQueryResult {
            index_name: self.index_name.clone(),
            shard: self.shard_number,
            total_hits,
            results,
            facet_counts,
        })
    }

    fn fetch(&self, unique_id: &str) -> Result<Option<StoredDocument>> {
        Ok(self.state.docs.get(unique_id).cloned())
    }

    fn field_names(&self) -> Result<Vec<String>> {
        let mut fields: Vec<String> = self
            .state
            .docs
            .values()
            .flat_map(|doc| doc.document.fields.keys().cloned())
            .collect();
        fields.sort();
        fields.dedup();
        Ok(fields)
    }

    fn terms(&self, request: &TermsRequest) -> Result<Vec<TermCount>> {
        if request.field.is_empty() {
            return Err(Error::InvalidRequest(
                "terms request requires a field".to_string(),
            ));
        }

        // term -> (doc freq, term freq)
        let mut counts: BTreeMap<String, (u64, u64)> = BTreeMap::new();

        for doc in self.state.docs.values() {
            let Some(value) = doc.document.fields.get(&request.field) else {
                continue;
            };

            let tokens = field_tokens(value);
            let mut seen_in_doc: Vec<&str> = Vec::new();
            for token in &tokens {
                let entry = counts.entry(token.clone()).or_default();
                entry.1 += 1;
                if !seen_in_doc.contains(&token.as_str()) {
                    entry.0 += 1;
                    seen_in_doc.push(token);
                }
            }
        }

        let mut terms: Vec<TermCount> = counts
            .into_iter()
            .filter(|(term, (doc_freq, _))| {
                if *doc_freq < request.min_doc_freq {
                    return false;
                }
                if let Some(start) = &request.start_term {
                    if term.as_str() < start.as_str() {
                        return false;
                    }
                }
                if let Some(end) = &request.end_term {
                    if term.as_str() > end.as_str() {
                        return false;
                    }
                }
                if let Some(prefix) = &request.prefix {
                    if !term.starts_with(prefix.as_str()) {
                        return false;
                    }
                }
                true
            })
            .map(|(term, (doc_freq, term_freq))| TermCount {
                term,
                doc_freq,
                term_freq,
            })
            .collect();

        if request.amount > 0 {
            terms.truncate(request.amount);
        }

        Ok(terms)
    }

    fn doc_count(&self) -> Result<u64> {
        Ok(self.state.docs.len() as u64)
    }

    fn document_ids(&self) -> Result<Vec<String>> {
        let mut ids: Vec<String> = self.state.docs.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Document;

    fn shard() -> Arc<dyn EngineShard> {
        MemoryEngine::new()
            .open_shard(&IndexSettings::new("articles", 1), 0)
            .unwrap()
    }

    fn doc(id: &str, title: &str) -> StoredDocument {
        StoredDocument {
            unique_id: id.to_string(),
            timestamp: 1,
            document: Document::new()
                .with_field("title", FieldValue::String(title.to_string())),
            metadata: Metadata::default(),
        }
    }

    use crate::types::Metadata;

    #[test]
    fn test_mutations_invisible_until_commit() {
        let shard = shard();
        shard.index_document(doc("1", "rust search engine")).unwrap();

        let before = shard.open_snapshot().unwrap();
        assert_eq!(before.doc_count().unwrap(), 0);

        shard.commit().unwrap();

        // The old snapshot is unchanged; a new one sees the commit.
        assert_eq!(before.doc_count().unwrap(), 0);
        let after = shard.open_snapshot().unwrap();
        assert_eq!(after.doc_count().unwrap(), 1);
        assert!(after.version() > before.version());
    }

    #[test]
    fn test_search_matches_all_query_tokens() {
        let shard = shard();
        shard.index_document(doc("1", "rust search engine")).unwrap();
        shard.index_document(doc("2", "java search engine")).unwrap();
        shard.commit().unwrap();

        let snapshot = shard.open_snapshot().unwrap();
        let result = snapshot
            .search(&SearchQuery::new("rust search"), 10)
            .unwrap();
        assert_eq!(result.total_hits, 1);
        assert_eq!(result.results[0].unique_id, "1");
    }

    #[test]
    fn test_terms_enumeration() {
        let shard = shard();
        shard.index_document(doc("1", "alpha beta")).unwrap();
        shard.index_document(doc("2", "beta gamma beta")).unwrap();
        shard.commit().unwrap();

        let snapshot = shard.open_snapshot().unwrap();
        let terms = snapshot.terms(&TermsRequest::new("articles", "title")).unwrap();

        let beta = terms.iter().find(|t| t.term == "beta").unwrap();
        assert_eq!(beta.doc_freq, 2);
        assert_eq!(beta.term_freq, 3);
    }

    #[test]
    fn test_delete_all_then_commit_empties_shard() {
        let shard = shard();
        shard.index_document(doc("1", "a")).unwrap();
        shard.commit().unwrap();

        shard.delete_all().unwrap();
        shard.commit().unwrap();

        let snapshot = shard.open_snapshot().unwrap();
        assert_eq!(snapshot.doc_count().unwrap(), 0);
    }
}
