use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of one stored object (a file path relative to the sample root).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(pub String);

impl ObjectId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ObjectId {
    fn from(raw: &str) -> Self {
        Self(raw.to_string())
    }
}

impl From<String> for ObjectId {
    fn from(raw: String) -> Self {
        Self(raw)
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A partition of the storage engine's index, as reported by its topology.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct DatasetId(pub String);

impl From<&str> for DatasetId {
    fn from(raw: &str) -> Self {
        Self(raw.to_string())
    }
}

impl fmt::Display for DatasetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A dataset as listed by the engine's topology.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dataset {
    pub id: DatasetId,
    /// Tags of the dataset; a query naming a taint only searches datasets carrying it.
    pub taints: Vec<String>,
    /// Indexed files, when the engine reports it.
    pub file_count: Option<u64>,
}

impl Dataset {
    pub fn new(id: &str) -> Self {
        Self {
            id: DatasetId::from(id),
            taints: Vec::new(),
            file_count: None,
        }
    }

    /// True when the dataset carries every one of `taints`.
    pub fn carries(&self, taints: &[String]) -> bool {
        taints.iter().all(|t| self.taints.contains(t))
    }
}

/// What a compiled query asks of the index.
///
/// The index only narrows the search: every candidate still goes through the
/// matcher on a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexQuery {
    /// No usable constraint, every indexed object is a candidate.
    All,
    /// Objects containing this byte sequence.
    Contains(Vec<u8>),
}

impl IndexQuery {
    /// Renders the query in the engine's hex-string syntax, `None` meaning
    /// "select everything".
    pub fn to_ursadb(&self) -> Option<String> {
        match self {
            IndexQuery::All => None,
            IndexQuery::Contains(bytes) => Some(format!("{{{}}}", hex::encode(bytes))),
        }
    }
}

/// One candidate lookup against the storage engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageQuery {
    pub index: IndexQuery,
    /// Only datasets carrying every one of these tags are searched.
    pub taints: Vec<String>,
}

impl StorageQuery {
    pub fn new(index: IndexQuery, taints: Vec<String>) -> Self {
        Self { index, taints }
    }
}

/// Deduplicated candidates of a job, in engine order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CandidateSet {
    pub objects: Vec<ObjectId>,
    /// Datasets that were queried, in topology order.
    pub datasets: Vec<DatasetId>,
}

impl CandidateSet {
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}
