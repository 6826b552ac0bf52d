//! End-of-run summary of a technique run.

use crate::device::{ChannelInfo, DeviceInfo};
use crate::runner::RunState;
use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};

/// Timestamp format of the structured form, e.g. `2024/03/01 14:05:09+0100`.
pub const DATETIME_FORMAT: &str = "%Y/%m/%d %H:%M:%S%z";

mod timestamp {
    use super::DATETIME_FORMAT;
    use chrono::{DateTime, FixedOffset};
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<DateTime<FixedOffset>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(time) => serializer.serialize_str(&time.format(DATETIME_FORMAT).to_string()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<DateTime<FixedOffset>>, D::Error> {
        Option::<String>::deserialize(deserializer)?
            .map(|text| DateTime::parse_from_str(&text, DATETIME_FORMAT).map_err(de::Error::custom))
            .transpose()
    }
}

/// Snapshot of a run: who ran it, where, when, and how it ended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TechniqueMetadata {
    /// Version of the vendor library driving the instrument.
    pub library_version: String,
    pub device_info: DeviceInfo,
    /// Channel status when the snapshot was taken.
    pub channel_info: ChannelInfo,
    pub channel: u8,
    #[serde(with = "timestamp", default)]
    pub start_time: Option<DateTime<FixedOffset>>,
    #[serde(with = "timestamp", default)]
    pub stop_time: Option<DateTime<FixedOffset>>,
    pub status: RunState,
}
