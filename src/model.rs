use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::SchedulerError;

/// Statistic carried by a quick and dirty update.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum QaduType {
    Likes,
    Dislikes,
    Views,
}

impl QaduType {
    pub fn as_str(&self) -> &'static str {
        match self {
            QaduType::Likes => "likes",
            QaduType::Dislikes => "dislikes",
            QaduType::Views => "views",
        }
    }
}

impl fmt::Display for QaduType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QaduType {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "likes" => Ok(QaduType::Likes),
            "dislikes" => Ok(QaduType::Dislikes),
            "views" => Ok(QaduType::Views),
            other => Err(SchedulerError::UnknownRequestType(other.to_string())),
        }
    }
}

/// A known remote node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Pod {
    pub id: i64,
    pub host: String,
}

/// One not-yet-sent request row. `kind` stays raw text so rows written by a
/// newer schema still load.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PendingRequest {
    pub id: i64,
    pub kind: String,
    pub video_id: String,
    pub pod_id: i64,
    pub created_at: DateTime<Utc>,
}

/// Current counters of a local video.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VideoStats {
    pub id: String,
    pub likes: i64,
    pub dislikes: i64,
    pub views: i64,
}

/// Merged statistics for one video inside one batch. Missing fields mean
/// "unchanged" on the receiving side.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct VideoStatSnapshot {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub likes: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dislikes: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub views: Option<i64>,
    pub remote_id: String,
}

/// Wire wrapper around a single payload entry: `{"data": {...}}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RequestData<D> {
    pub data: D,
}

/// Everything one pod receives in one cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundBatch<D> {
    pub to_pod: Pod,
    pub endpoint: &'static str,
    /// Pending request ids retired once the batch is delivered.
    pub ids: Vec<i64>,
    pub datas: Vec<RequestData<D>>,
}

#[derive(Serialize)]
struct WirePayload<'a, D> {
    endpoint: &'a str,
    data: &'a [RequestData<D>],
}

impl<D: Serialize> OutboundBatch<D> {
    pub fn new(to_pod: Pod, endpoint: &'static str) -> Self {
        Self {
            to_pod,
            endpoint,
            ids: Vec::new(),
            datas: Vec::new(),
        }
    }

    /// JSON body sent to the remote pod.
    pub fn payload(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::to_value(WirePayload {
            endpoint: self.endpoint,
            data: &self.datas,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn qadu_type_parses_known_and_rejects_unknown() {
        assert_eq!("views".parse::<QaduType>().unwrap(), QaduType::Views);
        assert_eq!(QaduType::Dislikes.as_str(), "dislikes");
        let err = "shares".parse::<QaduType>().unwrap_err();
        assert!(matches!(err, SchedulerError::UnknownRequestType(ref t) if t == "shares"));
    }

    #[test]
    fn payload_omits_unchanged_fields() {
        let mut batch = OutboundBatch::new(
            Pod {
                id: 1,
                host: "pod-a.example".into(),
            },
            "videos/qadu",
        );
        batch.datas.push(RequestData {
            data: VideoStatSnapshot {
                views: Some(42),
                likes: Some(10),
                remote_id: "v5".into(),
                ..Default::default()
            },
        });
        let body = batch.payload().unwrap();
        assert_eq!(
            body,
            json!({
                "endpoint": "videos/qadu",
                "data": [{ "data": { "likes": 10, "views": 42, "remoteId": "v5" } }]
            })
        );
    }
}
