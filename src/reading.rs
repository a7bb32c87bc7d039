//! Reading and batch types shared by the sampling and delivery paths.
//!
//! These structs define the delivery wire contract: a batch serializes to
//! `{ "batchId", "source"?, "readings": [{ "sensorId", "value", "unit", "capturedAt" }] }`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One sensor sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reading {
    /// Stable identifier of the originating sensor channel (e.g. "temperature")
    pub sensor_id: String,

    /// Measured value
    pub value: f64,

    /// Informational unit tag (°C, %, lux, ...)
    pub unit: String,

    /// Time of capture, set by the source when the value was read
    pub captured_at: DateTime<Utc>,
}

impl Reading {
    /// Create a reading captured now.
    pub fn new(sensor_id: impl Into<String>, value: f64, unit: impl Into<String>) -> Self {
        Self::captured(sensor_id, value, unit, Utc::now())
    }

    /// Create a reading with an explicit capture time.
    pub fn captured(
        sensor_id: impl Into<String>,
        value: f64,
        unit: impl Into<String>,
        captured_at: DateTime<Utc>,
    ) -> Self {
        Self {
            sensor_id: sensor_id.into(),
            value,
            unit: unit.into(),
            captured_at,
        }
    }
}

/// An ordered group of readings delivered together.
///
/// `batch_id` lets the receiving side deduplicate retried deliveries.
/// `attempt` is local bookkeeping and never leaves the process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Batch {
    /// Locally unique batch identifier
    pub batch_id: String,

    /// Identifier of the collector that produced the batch
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,

    /// Readings in capture order
    pub readings: Vec<Reading>,

    /// Number of delivery attempts made so far
    #[serde(skip)]
    pub attempt: u32,
}

impl Batch {
    /// Create a batch with a fresh id and no attempts.
    pub fn new(readings: Vec<Reading>) -> Self {
        Self {
            batch_id: Uuid::new_v4().to_string(),
            source: None,
            readings,
            attempt: 0,
        }
    }

    /// Tag the batch with the collector id.
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Number of readings in the batch.
    pub fn len(&self) -> usize {
        self.readings.len()
    }

    /// Check if the batch holds no readings.
    pub fn is_empty(&self) -> bool {
        self.readings.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_reading_serializes_camel_case() {
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let reading = Reading::captured("temperature", 21.5, "°C", at);
        let json = serde_json::to_value(&reading).unwrap();

        assert_eq!(json["sensorId"], "temperature");
        assert_eq!(json["value"], 21.5);
        assert_eq!(json["unit"], "°C");
        assert_eq!(json["capturedAt"], "2024-05-01T12:00:00Z");
    }

    #[test]
    fn test_batch_wire_shape() {
        let batch = Batch::new(vec![Reading::new("humidity", 62.0, "%")]).with_source("gh-1");
        let json = serde_json::to_value(&batch).unwrap();

        assert_eq!(json["batchId"], batch.batch_id.as_str());
        assert_eq!(json["source"], "gh-1");
        assert_eq!(json["readings"].as_array().unwrap().len(), 1);
        // attempt is process-local
        assert!(json.get("attempt").is_none());
    }

    #[test]
    fn test_batch_without_source_omits_field() {
        let batch = Batch::new(vec![Reading::new("light", 400.0, "lux")]);
        let json = serde_json::to_string(&batch).unwrap();
        assert!(!json.contains("source"));
    }

    #[test]
    fn test_batch_ids_are_unique() {
        let a = Batch::new(Vec::new());
        let b = Batch::new(Vec::new());
        assert_ne!(a.batch_id, b.batch_id);
        assert!(a.is_empty());
        assert_eq!(a.attempt, 0);
    }
}
