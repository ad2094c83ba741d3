use crate::settings::Settings;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Declarative description of one storage location.
///
/// The protocol is kept as a free-form tag so that unknown protocols survive
/// deserialization and are rejected (by name) when a client is created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageDescriptor {
    pub id: String,
    pub name: String,
    pub protocol: String,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    /// Maximum traversal depth for consumers that walk the tree (0 = unlimited).
    #[serde(default)]
    pub max_depth: u32,
    #[serde(default)]
    pub settings: Settings,
    #[serde(with = "time::serde::rfc3339", default = "OffsetDateTime::now_utc")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339", default = "OffsetDateTime::now_utc")]
    pub updated_at: OffsetDateTime,
}
impl StorageDescriptor {
    pub fn new(id: impl Into<String>, name: impl Into<String>, protocol: impl Into<String>) -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            id: id.into(),
            name: name.into(),
            protocol: protocol.into(),
            enabled: true,
            max_depth: 0,
            settings: Settings::default(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_setting(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.settings.insert(key, value);
        self
    }
}

fn enabled_by_default() -> bool {
    true
}
