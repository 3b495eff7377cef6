//! Core types for fathom

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Field value types stored in a document
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum FieldValue {
    String(String),
    Integer(i64),
    Float(f64),
    Boolean(bool),
    StringArray(Vec<String>),
}

/// Total order over optional field values used for sorting results.
/// Missing values sort last; values of incomparable types compare equal.
pub fn compare_field_values(a: Option<&FieldValue>, b: Option<&FieldValue>) -> std::cmp::Ordering {
    use std::cmp::Ordering::*;
    match (a, b) {
        (None, None) => Equal,
        (None, Some(_)) => Greater,
        (Some(_), None) => Less,
        (Some(a), Some(b)) => match (a, b) {
            (FieldValue::String(a), FieldValue::String(b)) => a.cmp(b),
            (FieldValue::Integer(a), FieldValue::Integer(b)) => a.cmp(b),
            (FieldValue::Float(a), FieldValue::Float(b)) => a.total_cmp(b),
            (FieldValue::Integer(a), FieldValue::Float(b)) => (*a as f64).total_cmp(b),
            (FieldValue::Float(a), FieldValue::Integer(b)) => a.total_cmp(&(*b as f64)),
            (FieldValue::Boolean(a), FieldValue::Boolean(b)) => a.cmp(b),
            _ => Equal,
        },
    }
}

/// Document represents a single record in an index
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Document {
    #[serde(default)]
    pub fields: HashMap<String, FieldValue>,
}

impl Document {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_field(mut self, name: impl Into<String>, value: FieldValue) -> Self {
        self.fields.insert(name.into(), value);
        self
    }
}

/// Opaque key/value metadata attached to a stored document
pub type Metadata = HashMap<String, String>;

/// A document as it exists in a shard: identity, version timestamp,
/// the stored fields, and its metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredDocument {
    pub unique_id: String,
    pub timestamp: i64,
    pub document: Document,
    #[serde(default)]
    pub metadata: Metadata,
}

/// Identity of a cluster member.
///
/// Equality and hashing use server address + service port only; the rest
/// port and heartbeat are informational.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub server_address: String,
    pub service_port: u16,
    #[serde(default)]
    pub rest_port: u16,
    #[serde(default)]
    pub heartbeat: Option<chrono::DateTime<chrono::Utc>>,
}

impl Node {
    pub fn new(server_address: impl Into<String>, service_port: u16) -> Self {
        Self {
            server_address: server_address.into(),
            service_port,
            rest_port: 0,
            heartbeat: None,
        }
    }
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        self.server_address == other.server_address && self.service_port == other.service_port
    }
}

impl Eq for Node {}

impl std::hash::Hash for Node {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.server_address.hash(state);
        self.service_port.hash(state);
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.server_address, self.service_port)
    }
}

/// One shard's placement: the primary node and the ordered replica list.
/// Replica order defines failover preference.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardMapping {
    pub shard_number: u32,
    pub primary: Node,
    #[serde(default)]
    pub replicas: Vec<Node>,
}

/// Placement of every shard of one index.
///
/// Invariant: exactly one ShardMapping per shard number in
/// `0..number_of_shards`, no gaps, no duplicates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexMapping {
    pub index_name: String,
    pub number_of_shards: u32,
    pub shard_mappings: Vec<ShardMapping>,
}

impl IndexMapping {
    pub fn mapping_for_shard(&self, shard_number: u32) -> Option<&ShardMapping> {
        self.shard_mappings
            .iter()
            .find(|m| m.shard_number == shard_number)
    }
}

/// Per-request consistency/availability preference controlling which copy
/// of a shard may answer.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MasterSlaveSettings {
    MasterOnly,
    SlaveOnly,
    #[default]
    MasterIfAvailable,
}

/// Index configuration read from the topology source
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexSettings {
    pub index_name: String,
    pub number_of_shards: u32,
    /// Relative load weight of this index for placement; 0 is treated as 1
    pub index_weight: u32,
    /// Force a commit every N mutations on a shard
    pub shard_commit_interval: u64,
    /// Commit after this many seconds of write inactivity; 0 disables
    pub idle_time_without_commit_secs: u64,
    pub ram_buffer_mb: u32,
    /// Max cached query results per shard; 0 disables the cache
    pub shard_query_cache_size: u64,
    /// Requests asking for more results than this bypass the cache; 0 means no limit
    pub shard_query_cache_max_amount: u32,
    /// Searches run against a freshly loaded shard and pinned in its cache
    pub warming_searches: Vec<WarmingSearch>,
}

/// A known-hot search executed at shard load to pre-populate the query
/// cache before the shard serves traffic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WarmingSearch {
    pub query: SearchQuery,
    pub amount: usize,
}

impl Default for IndexSettings {
    fn default() -> Self {
        Self {
            index_name: String::new(),
            number_of_shards: 1,
            index_weight: 1,
            shard_commit_interval: 3200,
            idle_time_without_commit_secs: 30,
            ram_buffer_mb: 128,
            shard_query_cache_size: 512,
            shard_query_cache_max_amount: 256,
            warming_searches: Vec::new(),
        }
    }
}

impl IndexSettings {
    pub fn new(index_name: impl Into<String>, number_of_shards: u32) -> Self {
        Self {
            index_name: index_name.into(),
            number_of_shards,
            ..Default::default()
        }
    }

    /// Effective placement weight; an unset/zero weight counts as 1
    pub fn effective_weight(&self) -> u32 {
        if self.index_weight == 0 {
            1
        } else {
            self.index_weight
        }
    }
}

/// Sort directive applied to query results
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct SortField {
    pub field: String,
    #[serde(default)]
    pub descending: bool,
}

/// Facet count request over one field
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct FacetRequest {
    pub field: String,
    #[serde(default)]
    pub max_facets: u32,
}

/// The normalized query a shard evaluates.
///
/// Everything that affects the result set lives here; the query cache
/// fingerprints this struct, so a field missing from it would cause
/// false cache hits.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SearchQuery {
    pub query: String,
    /// Fields searched when the query does not name one; empty means all
    #[serde(default)]
    pub query_fields: Vec<String>,
    /// Additional filter queries, all of which must match
    #[serde(default)]
    pub filter_queries: Vec<String>,
    #[serde(default)]
    pub sort: Vec<SortField>,
    #[serde(default)]
    pub facets: Vec<FacetRequest>,
}

impl SearchQuery {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            ..Default::default()
        }
    }
}

/// A cross-index search request as issued by a caller
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryRequest {
    pub indexes: Vec<String>,
    pub query: SearchQuery,
    pub amount: usize,
    #[serde(default)]
    pub master_slave_settings: MasterSlaveSettings,
    /// Skip the query result cache for this request
    #[serde(default)]
    pub dont_cache: bool,
    /// Pin the per-shard results in the cache (never evicted)
    #[serde(default)]
    pub pin_to_cache: bool,
}

impl QueryRequest {
    pub fn new(index: impl Into<String>, query: SearchQuery, amount: usize) -> Self {
        Self {
            indexes: vec![index.into()],
            query,
            amount,
            master_slave_settings: MasterSlaveSettings::default(),
            dont_cache: false,
            pin_to_cache: false,
        }
    }
}

/// One ranked hit from one shard
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoredResult {
    pub unique_id: String,
    pub score: f32,
    pub index_name: String,
    pub shard: u32,
    pub timestamp: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub document: Option<Document>,
}

/// Facet value count
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FacetCount {
    pub facet: String,
    pub count: u64,
}

/// One shard's partial answer to a query
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardQueryResult {
    pub index_name: String,
    pub shard: u32,
    pub total_hits: u64,
    pub results: Vec<ScoredResult>,
    #[serde(default)]
    pub facet_counts: HashMap<String, Vec<FacetCount>>,
}

/// The merged, re-ranked answer to a cross-shard query
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResult {
    pub total_hits: u64,
    pub results: Vec<ScoredResult>,
    #[serde(default)]
    pub facet_counts: HashMap<String, Vec<FacetCount>>,
}

/// Term enumeration request over one field of one index
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TermsRequest {
    pub index_name: String,
    pub field: String,
    #[serde(default)]
    pub start_term: Option<String>,
    #[serde(default)]
    pub end_term: Option<String>,
    #[serde(default)]
    pub prefix: Option<String>,
    #[serde(default)]
    pub min_doc_freq: u64,
    /// Max terms returned; 0 means unbounded
    #[serde(default)]
    pub amount: usize,
    #[serde(default)]
    pub master_slave_settings: MasterSlaveSettings,
}

impl TermsRequest {
    pub fn new(index_name: impl Into<String>, field: impl Into<String>) -> Self {
        Self {
            index_name: index_name.into(),
            field: field.into(),
            start_term: None,
            end_term: None,
            prefix: None,
            min_doc_freq: 0,
            amount: 0,
            master_slave_settings: MasterSlaveSettings::default(),
        }
    }
}

/// A term with its aggregated frequencies
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TermCount {
    pub term: String,
    pub doc_freq: u64,
    pub term_freq: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_equality_ignores_rest_port_and_heartbeat() {
        let a = Node {
            server_address: "10.0.0.1".to_string(),
            service_port: 32191,
            rest_port: 32192,
            heartbeat: Some(chrono::Utc::now()),
        };
        let b = Node::new("10.0.0.1", 32191);

        assert_eq!(a, b);

        let mut set = std::collections::HashSet::new();
        set.insert(a);
        assert!(set.contains(&b));
    }

    #[test]
    fn test_node_inequality_on_port() {
        let a = Node::new("10.0.0.1", 32191);
        let b = Node::new("10.0.0.1", 32291);
        assert_ne!(a, b);
    }

    #[test]
    fn test_index_mapping_lookup() {
        let mapping = IndexMapping {
            index_name: "articles".to_string(),
            number_of_shards: 2,
            shard_mappings: vec![
                ShardMapping {
                    shard_number: 0,
                    primary: Node::new("a", 1),
                    replicas: vec![],
                },
                ShardMapping {
                    shard_number: 1,
                    primary: Node::new("b", 1),
                    replicas: vec![],
                },
            ],
        };

        assert_eq!(mapping.mapping_for_shard(1).unwrap().primary.server_address, "b");
        assert!(mapping.mapping_for_shard(2).is_none());
    }

    #[test]
    fn test_effective_weight_defaults_to_one() {
        let mut settings = IndexSettings::new("articles", 2);
        settings.index_weight = 0;
        assert_eq!(settings.effective_weight(), 1);

        settings.index_weight = 4;
        assert_eq!(settings.effective_weight(), 4);
    }
}
