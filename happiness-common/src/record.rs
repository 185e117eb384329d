//! Happiness records as they travel through the pipeline.
//!
//! A [`RawRecord`] is one row of the source dataset. On the wire it is a UTF-8
//! JSON object keyed by the canonical column names, numbers unquoted and
//! categorical values as strings. Decoding happens in two steps so the
//! consumer can tell a payload that is not a record at all apart from a record
//! that lacks a field the model needs:
//!
//! 1. [`decode_object`] parses the payload into a JSON object.
//! 2. [`RawRecord::try_from`] validates every required field.
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

pub const GDP_PER_CAPITA: &str = "GDP_per_capita";
pub const LIFE_EXPECTANCY: &str = "life_expectancy";
pub const FREEDOM: &str = "freedom";
pub const PERCEPTIONS_CORRUPTION: &str = "perceptions_corruption";
pub const GENEROSITY: &str = "generosity";
pub const CONTINENT_NUMERIC: &str = "continent_numeric";
pub const COUNTRY_NUMERIC: &str = "country_numeric";
pub const HAPPINESS_SCORE: &str = "happiness_score";
pub const HAPPINESS_PREDICTION: &str = "happiness_prediction";
pub const COUNTRY: &str = "country";
pub const CONTINENT: &str = "continent";

/// Columns the scoring model reads, in the order it expects them.
pub const FEATURE_COLUMNS: [&str; 6] = [
    GDP_PER_CAPITA,
    LIFE_EXPECTANCY,
    FREEDOM,
    PERCEPTIONS_CORRUPTION,
    GENEROSITY,
    CONTINENT_NUMERIC,
];

#[derive(Error, Debug)]
pub enum RecordError {
    #[error("payload is not valid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("payload is empty")]
    EmptyPayload,
    #[error("payload is a JSON {0}, not an object")]
    NotAnObject(&'static str),
    #[error("required field {0} is missing")]
    MissingField(&'static str),
    #[error("field {field} must be a number, got {value}")]
    NotNumeric { field: &'static str, value: Value },
    #[error("field {field} must be an integer code, got {value}")]
    NotAnIntegerCode { field: &'static str, value: Value },
    #[error("field {field} must be a string, got {value}")]
    NotAString { field: &'static str, value: Value },
}

impl RecordError {
    /// Whether the payload failed to parse at all, as opposed to parsing into
    /// an object that fails validation.
    pub fn is_malformed(&self) -> bool {
        matches!(
            self,
            RecordError::InvalidJson(_) | RecordError::EmptyPayload | RecordError::NotAnObject(_)
        )
    }
}

/// Parse a wire payload into its JSON object, without validating any field.
pub fn decode_object(payload: &[u8]) -> Result<Map<String, Value>, RecordError> {
    if payload.is_empty() {
        return Err(RecordError::EmptyPayload);
    }

    match serde_json::from_slice(payload)? {
        Value::Object(fields) => Ok(fields),
        Value::Array(_) => Err(RecordError::NotAnObject("array")),
        Value::String(_) => Err(RecordError::NotAnObject("string")),
        Value::Number(_) => Err(RecordError::NotAnObject("number")),
        Value::Bool(_) => Err(RecordError::NotAnObject("boolean")),
        Value::Null => Err(RecordError::NotAnObject("null")),
    }
}

/// One row of the happiness dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    #[serde(rename = "GDP_per_capita")]
    pub gdp_per_capita: f64,
    pub life_expectancy: f64,
    pub freedom: f64,
    pub perceptions_corruption: f64,
    pub generosity: f64,
    pub continent_numeric: i32,
    pub country_numeric: i32,
    pub happiness_score: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub continent: Option<String>,
}

impl RawRecord {
    /// Decode and validate a wire payload.
    pub fn from_wire(payload: &[u8]) -> Result<Self, RecordError> {
        RawRecord::try_from(decode_object(payload)?)
    }

    /// Encode this record for the wire.
    pub fn to_wire(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Partition key: records of the same country keep their relative order.
    pub fn key(&self) -> String {
        self.country_numeric.to_string()
    }

    pub fn features(&self) -> FeatureVector {
        FeatureVector([
            self.gdp_per_capita,
            self.life_expectancy,
            self.freedom,
            self.perceptions_corruption,
            self.generosity,
            f64::from(self.continent_numeric),
        ])
    }
}

impl TryFrom<Map<String, Value>> for RawRecord {
    type Error = RecordError;

    /// Validate a decoded object. Fields outside the canonical set are ignored,
    /// so a producer may send the full source row.
    fn try_from(fields: Map<String, Value>) -> Result<Self, Self::Error> {
        Ok(RawRecord {
            gdp_per_capita: number(&fields, GDP_PER_CAPITA)?,
            life_expectancy: number(&fields, LIFE_EXPECTANCY)?,
            freedom: number(&fields, FREEDOM)?,
            perceptions_corruption: number(&fields, PERCEPTIONS_CORRUPTION)?,
            generosity: number(&fields, GENEROSITY)?,
            continent_numeric: integer_code(&fields, CONTINENT_NUMERIC)?,
            country_numeric: integer_code(&fields, COUNTRY_NUMERIC)?,
            happiness_score: number(&fields, HAPPINESS_SCORE)?,
            country: label(&fields, COUNTRY)?,
            continent: label(&fields, CONTINENT)?,
        })
    }
}

fn number(fields: &Map<String, Value>, field: &'static str) -> Result<f64, RecordError> {
    let value = fields.get(field).ok_or(RecordError::MissingField(field))?;

    value.as_f64().ok_or_else(|| RecordError::NotNumeric {
        field,
        value: value.clone(),
    })
}

fn integer_code(fields: &Map<String, Value>, field: &'static str) -> Result<i32, RecordError> {
    let value = fields.get(field).ok_or(RecordError::MissingField(field))?;
    let invalid = || RecordError::NotAnIntegerCode {
        field,
        value: value.clone(),
    };

    // Dataframe exports sometimes write integer codes as `2.0`.
    let code = match (value.as_i64(), value.as_f64()) {
        (Some(code), _) => code,
        (None, Some(float)) if float.fract() == 0.0 => float as i64,
        _ => return Err(invalid()),
    };

    i32::try_from(code).map_err(|_| invalid())
}

fn label(fields: &Map<String, Value>, field: &'static str) -> Result<Option<String>, RecordError> {
    match fields.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(label)) => Ok(Some(label.to_owned())),
        Some(value) => Err(RecordError::NotAString {
            field,
            value: value.clone(),
        }),
    }
}

/// The model inputs of one record, ordered as in [`FEATURE_COLUMNS`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FeatureVector(pub [f64; 6]);

impl FeatureVector {
    pub fn values(&self) -> &[f64; 6] {
        &self.0
    }

    /// Pair every value with its column name.
    pub fn named(&self) -> impl Iterator<Item = (&'static str, f64)> + '_ {
        FEATURE_COLUMNS.iter().copied().zip(self.0.iter().copied())
    }
}

/// A record together with the model's prediction for it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichedRecord {
    #[serde(flatten)]
    pub record: RawRecord,
    pub happiness_prediction: f64,
}

#[derive(Error, Debug, PartialEq)]
#[error("prediction {0} is not a finite number")]
pub struct InvalidPrediction(pub f64);

impl EnrichedRecord {
    /// Attach a prediction. A non-finite prediction cannot be stored in a
    /// non-nullable numeric column and is rejected here.
    pub fn new(record: RawRecord, happiness_prediction: f64) -> Result<Self, InvalidPrediction> {
        if !happiness_prediction.is_finite() {
            return Err(InvalidPrediction(happiness_prediction));
        }

        Ok(Self {
            record,
            happiness_prediction,
        })
    }
}
