use core::future::Future;
use core::pin::Pin;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub type StageFuture<'a> = Pin<Box<dyn Future<Output = StageResult> + Send + 'a>>;

/// Facts reported by a successful stage, merged into the run's [`KnownData`].
pub type StageResult = Result<KnownData, StageError>;

pub mod facts {
    //! Fact names the default catalog predicates read.
    pub const HAS_LOCATION: &str = "has_location";
    pub const HAS_ADDRESS: &str = "has_address";
    pub const HAS_ENROLLMENT: &str = "has_enrollment";
    pub const TEAM_NAME: &str = "team_name";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityType {
    School,
    Location,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::School => "school",
            EntityType::Location => "location",
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = UnknownName;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "school" => Ok(EntityType::School),
            "location" => Ok(EntityType::Location),
            other => Err(UnknownName::EntityType(other.to_owned())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(pub u64);

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Reference to a school or location point held in external storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityRef {
    pub id: EntityId,
    pub entity_type: EntityType,
}

impl EntityRef {
    pub fn new(id: u64, entity_type: EntityType) -> Self {
        Self {
            id: EntityId(id),
            entity_type,
        }
    }

    pub fn school(id: u64) -> Self {
        Self::new(id, EntityType::School)
    }

    pub fn location(id: u64) -> Self {
        Self::new(id, EntityType::Location)
    }
}

/// Renders as the status document key, e.g. `school_42`.
impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.entity_type, self.id)
    }
}

/// The fixed stage catalog. Declaration order is the default catalog order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageKind {
    Location,
    Demographics,
    Enrollment,
    Projections,
    Metrics,
    Team,
}

impl StageKind {
    pub const ALL: [StageKind; 6] = [
        StageKind::Location,
        StageKind::Demographics,
        StageKind::Enrollment,
        StageKind::Projections,
        StageKind::Metrics,
        StageKind::Team,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StageKind::Location => "location",
            StageKind::Demographics => "demographics",
            StageKind::Enrollment => "enrollment",
            StageKind::Projections => "projections",
            StageKind::Metrics => "metrics",
            StageKind::Team => "team",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            StageKind::Location => "Validate and geocode location data",
            StageKind::Demographics => "Collect ESRI demographic data",
            StageKind::Enrollment => "Process enrollment data",
            StageKind::Projections => "Generate enrollment projections",
            StageKind::Metrics => "Calculate district metrics",
            StageKind::Team => "Assign the school to its team",
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StageKind {
    type Err = UnknownName;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_ascii_lowercase();
        StageKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == normalized)
            .ok_or(UnknownName::Stage(normalized))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UnknownName {
    #[error("unknown entity type `{0}`")]
    EntityType(String),
    #[error("unknown stage `{0}`")]
    Stage(String),
}

/// Read-only snapshot of entity facts used by stage predicates.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KnownData {
    facts: BTreeMap<String, Value>,
}

impl KnownData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.facts.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.facts.get(name)
    }

    /// A fact is set when present and truthy: `true`, a non-zero number, a
    /// non-empty string, array or object.
    pub fn is_set(&self, name: &str) -> bool {
        match self.facts.get(name) {
            None | Some(Value::Null) => false,
            Some(Value::Bool(flag)) => *flag,
            Some(Value::Number(number)) => number.as_f64().map_or(true, |n| n != 0.0),
            Some(Value::String(text)) => !text.is_empty(),
            Some(Value::Array(items)) => !items.is_empty(),
            Some(Value::Object(map)) => !map.is_empty(),
        }
    }

    /// Later values win.
    pub fn merge(&mut self, updates: KnownData) {
        self.facts.extend(updates.facts);
    }

    pub fn len(&self) -> usize {
        self.facts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.facts.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.facts.iter().map(|(name, value)| (name.as_str(), value))
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for KnownData {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut data = KnownData::new();
        for (name, value) in iter {
            data.insert(name, value);
        }
        data
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageErrorKind {
    /// External dependency timed out or was unavailable; resubmission may succeed.
    Transient,
    /// Missing or invalid precondition; resubmission fails until the data changes.
    Permanent,
}

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{kind:?} stage error: {message}")]
pub struct StageError {
    pub kind: StageErrorKind,
    pub message: String,
}

impl StageError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: StageErrorKind::Transient,
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            kind: StageErrorKind::Permanent,
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind == StageErrorKind::Transient
    }
}

/// Arguments handed to a stage invocation.
#[derive(Debug, Clone)]
pub struct StageRequest {
    pub entity: EntityRef,
    pub stage: StageKind,
    pub known_data: KnownData,
    pub data_year: Option<i32>,
}

/// Implemented by every processing stage (geocoding, ESRI fetch, projections, ...).
///
/// Stages are treated as atomic by the scheduler: once invoked they run to
/// completion or until the configured stage timeout elapses.
pub trait Stage: Send + Sync + 'static {
    fn invoke(&self, request: StageRequest) -> StageFuture<'_>;
}

/// Adapts an async closure into a [`Stage`].
pub struct FnStage<F> {
    func: F,
}

impl<F> FnStage<F> {
    pub fn new(func: F) -> Self {
        Self { func }
    }
}

impl<F, Fut> Stage for FnStage<F>
where
    F: Fn(StageRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = StageResult> + Send + 'static,
{
    fn invoke(&self, request: StageRequest) -> StageFuture<'_> {
        Box::pin((self.func)(request))
    }
}
