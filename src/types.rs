//! Memory records: elements, actions, consolidations and imaginations

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Embedding vector
pub type Embedding = Vec<f32>;

/// Free-form metadata stored next to every record
pub type Extra = Map<String, Value>;

/// Composite session identity; all memory is partitioned by it
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionKey {
    pub user_id: String,
    pub session_id: String,
}

impl SessionKey {
    pub fn new(user_id: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            session_id: session_id.into(),
        }
    }

    /// Partition key of the session document
    pub fn doc_id(&self) -> String {
        format!("{}_{}", self.user_id, self.session_id)
    }
}

impl std::fmt::Display for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.doc_id())
    }
}

/// Index and write time assigned by the store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stamp {
    pub index: i64,
    pub timestamp: DateTime<Utc>,
}

/// Payload of one element: an exchange, or an internal reflection
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ElementPayload {
    pub query: String,
    pub reply: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query_embedding: Option<Embedding>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_embedding: Option<Embedding>,
}

impl ElementPayload {
    pub fn exchange(query: impl Into<String>, reply: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            reply: reply.into(),
            ..Default::default()
        }
    }

    pub fn with_embeddings(mut self, query: Option<Embedding>, reply: Option<Embedding>) -> Self {
        self.query_embedding = query;
        self.reply_embedding = reply;
        self
    }
}

/// One persisted query/reply or introspection record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Element {
    pub index: i64,
    pub timestamp: DateTime<Utc>,
    pub is_internal: bool,
    pub payload: ElementPayload,
    #[serde(default)]
    pub extra: Extra,
}

impl Element {
    /// Prompt rendering of the element
    pub fn render(&self) -> String {
        if self.is_internal {
            format!("(reflection) {}", self.payload.reply)
        } else {
            format!("User: {}\nAssistant: {}", self.payload.query, self.payload.reply)
        }
    }

    /// Embedding used for similarity: the reply's, falling back to the query's
    pub fn embedding(&self) -> Option<&[f32]> {
        self.payload
            .reply_embedding
            .as_deref()
            .or(self.payload.query_embedding.as_deref())
    }
}

/// Kind of recursive sub-action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    /// Recurse into the query loop one level deeper
    Think,
    /// Delegate to the research subsystem
    Research,
    /// Use the call's note as the final reply
    Reply,
}

impl ActionKind {
    pub const ALL: &'static [ActionKind] = &[ActionKind::Think, ActionKind::Research, ActionKind::Reply];

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "think" => Some(ActionKind::Think),
            "research" => Some(ActionKind::Research),
            "reply" => Some(ActionKind::Reply),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::Think => "think",
            ActionKind::Research => "research",
            ActionKind::Reply => "reply",
        }
    }
}

impl std::fmt::Display for ActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a sub-action asked for and what it produced
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionPayload {
    pub kind: ActionKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    pub result: String,
}

/// A persisted recursive sub-step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    pub index: i64,
    pub timestamp: DateTime<Utc>,
    pub lvl: u32,
    pub payload: ActionPayload,
    #[serde(default)]
    pub extra: Extra,
}

/// Content of a long-term memory node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConsolidationBody {
    Summary {
        summary: String,
        #[serde(default)]
        summary_embedding: Option<Embedding>,
    },
    Imagination {
        imagination: String,
        #[serde(default)]
        imagination_embedding: Option<Embedding>,
    },
}

impl ConsolidationBody {
    pub fn summary(summary: impl Into<String>, embedding: Option<Embedding>) -> Self {
        ConsolidationBody::Summary {
            summary: summary.into(),
            summary_embedding: embedding,
        }
    }

    pub fn imagination(imagination: impl Into<String>, embedding: Option<Embedding>) -> Self {
        ConsolidationBody::Imagination {
            imagination: imagination.into(),
            imagination_embedding: embedding,
        }
    }

    pub fn text(&self) -> &str {
        match self {
            ConsolidationBody::Summary { summary, .. } => summary,
            ConsolidationBody::Imagination { imagination, .. } => imagination,
        }
    }

    pub fn embedding(&self) -> Option<&[f32]> {
        match self {
            ConsolidationBody::Summary {
                summary_embedding, ..
            } => summary_embedding.as_deref(),
            ConsolidationBody::Imagination {
                imagination_embedding,
                ..
            } => imagination_embedding.as_deref(),
        }
    }
}

/// Which long-term stream a node belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LongTermStream {
    Level(u32),
    Imagination,
}

impl std::fmt::Display for LongTermStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LongTermStream::Level(lvl) => write!(f, "level {lvl}"),
            LongTermStream::Imagination => f.write_str("imagination"),
        }
    }
}

/// A consolidation or imagination node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Consolidation {
    pub stream: LongTermStream,
    pub index: i64,
    pub timestamp: DateTime<Utc>,
    pub consolidation: ConsolidationBody,
    #[serde(default)]
    pub extra: Extra,
}

/// Record of one consolidation written by `MemoryStore::consolidate`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsolidationStamp {
    pub lvl: u32,
    pub index: i64,
    pub timestamp: DateTime<Utc>,
    pub extra: Extra,
}

/// Item of a consolidation window: elements feed level 0, consolidations feed the rest
#[derive(Debug, Clone, PartialEq)]
pub enum WindowItem {
    Element(Element),
    Consolidation(Consolidation),
}

impl WindowItem {
    pub fn index(&self) -> i64 {
        match self {
            WindowItem::Element(e) => e.index,
            WindowItem::Consolidation(c) => c.index,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            WindowItem::Element(e) => e.timestamp,
            WindowItem::Consolidation(c) => c.timestamp,
        }
    }

    pub fn render(&self) -> String {
        match self {
            WindowItem::Element(e) => e.render(),
            WindowItem::Consolidation(c) => c.consolidation.text().to_string(),
        }
    }
}

/// Most recent elements plus the current max index
#[derive(Debug, Clone, Default)]
pub struct Latest {
    pub elements: Vec<Element>,
    pub latest_index: Option<i64>,
}

/// Point lookup condition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pinpoint {
    /// External element by offset from the newest (0 = newest)
    Element { offset: i64 },
    /// Action by its index within a level
    Action { lvl: u32, index: i64 },
}

/// Point lookup result
#[derive(Debug, Clone, PartialEq)]
pub enum Pinpointed {
    Element(Element),
    Action(Action),
}
