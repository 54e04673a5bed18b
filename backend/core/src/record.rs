//! Persisted record types and the filter capability shared by every collection.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ForgeError;
use crate::id::RecordId;

/// A record type that lives in a named collection of the document store.
pub trait Document: Serialize + DeserializeOwned + Send + Sync + 'static {
    const COLLECTION: &'static str;
}

/// A record together with the identifier the store assigned to it.
#[derive(Debug, Clone, PartialEq)]
pub struct Stored<T> {
    pub id: RecordId,
    pub record: T,
}

/// Intersection of field-equality clauses over a collection.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    clauses: Vec<(String, Value)>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eq(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.clauses.push((field.into(), value.into()));
        self
    }

    pub fn clauses(&self) -> &[(String, Value)] {
        &self.clauses
    }

    pub fn is_empty(&self) -> bool {
        self.clauses.is_empty()
    }

    /// Build a filter from every non-null top-level field of a partial record.
    pub fn from_partial<T: Serialize + ?Sized>(partial: &T) -> Result<Self, ForgeError> {
        match serde_json::to_value(partial).map_err(ForgeError::codec)? {
            Value::Object(map) => Ok(Self {
                clauses: map.into_iter().filter(|(_, v)| !v.is_null()).collect(),
            }),
            other => Err(ForgeError::codec(format!(
                "filter source must be an object, got {other}"
            ))),
        }
    }
}

/// A partial record usable as a query against its collection.
pub trait Queryable: Serialize {
    type Target: Document;

    fn as_filter(&self) -> Result<Filter, ForgeError> {
        Filter::from_partial(self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OriginType {
    Digital,
    Handwritten,
}

impl fmt::Display for OriginType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Digital => f.write_str("digital"),
            Self::Handwritten => f.write_str("handwritten"),
        }
    }
}

impl FromStr for OriginType {
    type Err = ForgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "digital" => Ok(Self::Digital),
            "handwritten" => Ok(Self::Handwritten),
            other => Err(ForgeError::Config(format!("unknown origin type '{other}'"))),
        }
    }
}

/// Reference to a binary object in the blob store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BlobRef(pub RecordId);

impl fmt::Display for BlobRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// An uploaded equation image and its training state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageRecord {
    pub blob: BlobRef,
    pub filename: String,
    pub width: u32,
    pub height: u32,
    pub color_mode: String,
    pub origin: OriginType,
    pub equation_name: String,
    pub section: String,
    pub author: String,
    pub needs_train: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub train_label: Option<String>,
    /// Set while a training run holds this image in its batch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub training_claim: Option<TrainingClaim>,
}

impl Document for ImageRecord {
    const COLLECTION: &'static str = "images";
}

/// Reservation of a pending image by one training run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrainingClaim {
    pub token: String,
    pub claimed_at: DateTime<Utc>,
}

impl TrainingClaim {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            claimed_at: Utc::now(),
        }
    }

    /// A claim older than `ttl` belongs to a run that is presumed dead.
    pub fn is_stale(&self, ttl: std::time::Duration, now: DateTime<Utc>) -> bool {
        (now - self.claimed_at)
            .to_std()
            .map_or(false, |age| age >= ttl)
    }
}

/// One inference outcome. Never mutated after insert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRecord {
    pub image_id: RecordId,
    pub predicted_text: String,
    pub is_correct: bool,
}

impl Document for ResultRecord {
    const COLLECTION: &'static str = "results";
}

/// Trained weights plus the image ids the model was fit to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub weights: BlobRef,
    pub weights_filename: String,
    pub created_at: DateTime<Utc>,
    pub training_ids: Vec<RecordId>,
}

impl Document for CheckpointRecord {
    const COLLECTION: &'static str = "checkpoints";
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ImageQuery {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub needs_train: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub origin: Option<OriginType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub equation_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub section: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blob: Option<BlobRef>,
}

impl ImageQuery {
    pub fn pending_training() -> Self {
        Self {
            needs_train: Some(true),
            ..Default::default()
        }
    }
}

impl Queryable for ImageQuery {
    type Target = ImageRecord;
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ResultQuery {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_id: Option<RecordId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_correct: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub predicted_text: Option<String>,
}

impl ResultQuery {
    pub fn for_image(image_id: RecordId) -> Self {
        Self {
            image_id: Some(image_id),
            ..Default::default()
        }
    }
}

impl Queryable for ResultQuery {
    type Target = ResultRecord;
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CheckpointQuery {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub weights_filename: Option<String>,
}

impl Queryable for CheckpointQuery {
    type Target = CheckpointRecord;
}
