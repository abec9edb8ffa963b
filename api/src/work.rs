use derive_more::Display;
use serde::{Deserialize, Serialize};

#[derive(Copy, Clone, Debug, PartialEq, Eq, Display, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    #[display(fmt = "text")]
    Text,
    #[display(fmt = "voice")]
    Voice,
}

/// Unit of work handed to the downstream queue
///
/// Delivery is at-least-once: the same `update_id` can be emitted again
/// after a failover, so consumers must handle it idempotently.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkRecord {
    pub content_type: ContentType,
    pub update_id: u64,
    pub user_id: String,
    /// Unix seconds, as reported by the upstream source
    pub source_timestamp: i64,
    /// Unix milliseconds, when this instance received it
    pub received_timestamp_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_link: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class_id: Option<String>,
}
