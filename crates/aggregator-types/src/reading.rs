//! Device readings submitted to the aggregation pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{DeviceId, ReadingId};

/// A single data point reported by a device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reading {
    /// Device type code (e.g. `TEMP`).
    pub device_type: String,
    /// The reporting device.
    pub device_id: DeviceId,
    /// Unique ID of this data point.
    pub reading_id: ReadingId,
    /// Measured value.
    pub value: f64,
    /// When the value was recorded.
    pub timestamp: DateTime<Utc>,
}

impl Reading {
    /// Build a reading stamped with the current time.
    pub fn now(
        device_type: impl Into<String>,
        device_id: DeviceId,
        reading_id: ReadingId,
        value: f64,
    ) -> Self {
        Self {
            device_type: device_type.into(),
            device_id,
            reading_id,
            value,
            timestamp: Utc::now(),
        }
    }
}
