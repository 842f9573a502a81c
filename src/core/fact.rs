//! The immutable, signed fact record.
//!
//! A [`Fact`] is sealed once: its signature is a SHA-256 digest over a
//! canonical, key-sorted JSON rendering of every other field. Fields are only
//! reachable through accessors, and a fact read back from storage keeps the
//! signature it was stored with, so any tampering shows up in [`Fact::verify`].

use crate::core::time;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use sha2::{Digest, Sha256};
use std::fmt;

pub type JsonMap = Map<String, JsonValue>;

pub const PROJECT_CREATED: &str = "ProjectCreated";
pub const PROJECT_UPDATED: &str = "ProjectUpdated";
pub const TASK_CREATED: &str = "TaskCreated";
pub const TASK_UPDATED: &str = "TaskUpdated";
pub const TASK_STATUS_CHANGED: &str = "TaskStatusChanged";
pub const DEPENDENCY_ADDED: &str = "DependencyAdded";
pub const INSIGHT_RAISED: &str = "InsightRaised";
pub const PROJECT_PROGRESS_CALCULATED: &str = "ProjectProgressCalculated";

/// The well-known fact kinds. `kind` on a [`Fact`] stays an open string; this
/// enum only names the kinds the built-in consumers understand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FactKind {
    ProjectCreated,
    ProjectUpdated,
    TaskCreated,
    TaskUpdated,
    TaskStatusChanged,
    DependencyAdded,
    InsightRaised,
    ProjectProgressCalculated,
}

impl FactKind {
    pub const ALL: [FactKind; 8] = [
        FactKind::ProjectCreated,
        FactKind::ProjectUpdated,
        FactKind::TaskCreated,
        FactKind::TaskUpdated,
        FactKind::TaskStatusChanged,
        FactKind::DependencyAdded,
        FactKind::InsightRaised,
        FactKind::ProjectProgressCalculated,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            FactKind::ProjectCreated => PROJECT_CREATED,
            FactKind::ProjectUpdated => PROJECT_UPDATED,
            FactKind::TaskCreated => TASK_CREATED,
            FactKind::TaskUpdated => TASK_UPDATED,
            FactKind::TaskStatusChanged => TASK_STATUS_CHANGED,
            FactKind::DependencyAdded => DEPENDENCY_ADDED,
            FactKind::InsightRaised => INSIGHT_RAISED,
            FactKind::ProjectProgressCalculated => PROJECT_PROGRESS_CALCULATED,
        }
    }

    pub fn parse(kind: &str) -> Option<FactKind> {
        FactKind::ALL.into_iter().find(|k| k.as_str() == kind)
    }
}

impl fmt::Display for FactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unsealed input for [`Fact::seal`]. `id` and `timestamp` are assigned when absent.
#[derive(Debug, Clone, Default)]
pub struct NewFact {
    pub id: Option<String>,
    pub timestamp: Option<i64>,
    pub source: String,
    pub kind: String,
    pub subject: JsonMap,
    pub payload: JsonMap,
    pub caused_by: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fact {
    id: String,
    ts: i64,
    source: String,
    kind: String,
    subject: JsonMap,
    payload: JsonMap,
    #[serde(rename = "causedBy", default)]
    caused_by: Option<String>,
    sig: String,
}

impl Fact {
    /// Seal a fact with a fresh id and the current time.
    pub fn new(
        source: impl Into<String>,
        kind: impl Into<String>,
        subject: JsonMap,
        payload: JsonMap,
        caused_by: Option<String>,
    ) -> Self {
        Self::seal(NewFact {
            source: source.into(),
            kind: kind.into(),
            subject,
            payload,
            caused_by,
            ..NewFact::default()
        })
    }

    pub fn seal(input: NewFact) -> Self {
        let mut fact = Fact {
            id: input.id.unwrap_or_else(time::new_fact_id),
            ts: input.timestamp.unwrap_or_else(time::now_epoch_ms),
            source: input.source,
            kind: input.kind,
            subject: input.subject,
            payload: input.payload,
            caused_by: input.caused_by,
            sig: String::new(),
        };
        fact.sig = fact.compute_signature();
        fact
    }

    /// Rehydrate a stored fact without resealing it.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn from_stored(
        id: String,
        ts: i64,
        source: String,
        kind: String,
        subject: JsonMap,
        payload: JsonMap,
        caused_by: Option<String>,
        sig: String,
    ) -> Self {
        Fact {
            id,
            ts,
            source,
            kind,
            subject,
            payload,
            caused_by,
            sig,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn timestamp(&self) -> i64 {
        self.ts
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn subject(&self) -> &JsonMap {
        &self.subject
    }

    pub fn payload(&self) -> &JsonMap {
        &self.payload
    }

    pub fn caused_by(&self) -> Option<&str> {
        self.caused_by.as_deref()
    }

    pub fn signature(&self) -> &str {
        &self.sig
    }

    pub fn well_known_kind(&self) -> Option<FactKind> {
        FactKind::parse(&self.kind)
    }

    pub fn subject_str(&self, key: &str) -> Option<&str> {
        self.subject.get(key).and_then(|v| v.as_str())
    }

    pub fn payload_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(|v| v.as_str())
    }

    pub fn payload_f64(&self, key: &str) -> Option<f64> {
        self.payload.get(key).and_then(|v| v.as_f64())
    }

    pub fn payload_object(&self, key: &str) -> Option<&JsonMap> {
        self.payload.get(key).and_then(|v| v.as_object())
    }

    /// The project this fact is scoped to, when its subject names one.
    pub fn project_id(&self) -> Option<&str> {
        self.subject_str("projectId")
    }

    /// Recompute the digest from current field values and compare.
    pub fn verify(&self) -> bool {
        self.compute_signature() == self.sig
    }

    /// Canonical serialization of every field except the signature.
    pub fn canonical_json(&self) -> String {
        let body = serde_json::json!({
            "caused_by": self.caused_by,
            "id": self.id,
            "kind": self.kind,
            "payload": self.payload,
            "source": self.source,
            "subject": self.subject,
            "ts": self.ts,
        });
        let mut out = String::new();
        write_canonical(&body, &mut out);
        out
    }

    fn compute_signature(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.canonical_json().as_bytes());
        format!("{:x}", hasher.finalize())
    }
}

/// Render JSON with object keys in byte order at every depth, no whitespace.
fn write_canonical(value: &JsonValue, out: &mut String) {
    match value {
        JsonValue::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&JsonValue::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key.as_str()], out);
            }
            out.push('}');
        }
        JsonValue::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// Build a [`JsonMap`] from `"key" => value` pairs. Values are `json!` token
/// trees, so wrap method calls in parentheses.
#[macro_export]
macro_rules! json_map {
    () => { $crate::core::fact::JsonMap::new() };
    ($($key:literal => $value:tt),+ $(,)?) => {{
        let mut m = $crate::core::fact::JsonMap::new();
        $( m.insert(($key).to_string(), ::serde_json::json!($value)); )+
        m
    }};
}
