//! Core data model for legacy news content and its asset catalog.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

pub const CRATE_NAME: &str = "newsmig-core";

/// Metadata key the pipeline owns; every other key is passed through untouched.
pub const VIDEO_LINKS_KEY: &str = "video_links";
pub const IMAGE_INTRO_KEY: &str = "image_intro";
pub const MAIN_IMAGE_URL_KEY: &str = "main_image_url";

pub const DEFAULT_AUDIT_USER_ID: i64 = 1;

pub type ContentId = i64;
pub type AssetId = i64;

/// Opaque key/value blob stored alongside a content record.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentMetadata(Map<String, JsonValue>);

impl ContentMetadata {
    pub fn new() -> Self {
        Self(Map::new())
    }

    /// Anything other than a JSON object is treated as absent metadata.
    pub fn from_json(value: Option<JsonValue>) -> Self {
        match value {
            Some(JsonValue::Object(map)) => Self(map),
            _ => Self::new(),
        }
    }

    /// Always an object, `{}` when every key has been removed.
    pub fn to_json(&self) -> JsonValue {
        JsonValue::Object(self.0.clone())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(JsonValue::as_str)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: JsonValue) -> Option<JsonValue> {
        self.0.insert(key.into(), value)
    }

    pub fn remove(&mut self, key: &str) -> Option<JsonValue> {
        self.0.remove(key)
    }

    /// Lead image URL from the legacy layout, `image_intro` first.
    pub fn primary_image_url(&self) -> Option<&str> {
        [IMAGE_INTRO_KEY, MAIN_IMAGE_URL_KEY]
            .into_iter()
            .filter_map(|key| self.get_str(key))
            .map(str::trim)
            .find(|url| !url.is_empty())
    }

    pub fn video_links(&self) -> Vec<String> {
        self.0
            .get(VIDEO_LINKS_KEY)
            .and_then(JsonValue::as_array)
            .map(|links| {
                links
                    .iter()
                    .filter_map(|v| v.as_str().map(ToString::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn set_video_links(&mut self, links: Vec<String>) {
        let links = links.into_iter().map(JsonValue::String).collect();
        self.0
            .insert(VIDEO_LINKS_KEY.to_string(), JsonValue::Array(links));
    }
}

/// Working copy of one news record as loaded from persistence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentRecord {
    pub id: ContentId,
    pub title: String,
    pub text: String,
    pub metadata: ContentMetadata,
    pub primary_asset_id: Option<AssetId>,
    /// Assets already linked to this record, in link order.
    pub asset_ids: Vec<AssetId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub updated_by_id: Option<i64>,
}

impl ContentRecord {
    pub fn new(id: ContentId, title: impl Into<String>, text: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id,
            title: title.into(),
            text: text.into(),
            metadata: ContentMetadata::new(),
            primary_asset_id: None,
            asset_ids: Vec::new(),
            created_at: now,
            updated_at: now,
            updated_by_id: None,
        }
    }

    pub fn with_metadata(mut self, metadata: ContentMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn has_linked_assets(&self) -> bool {
        !self.asset_ids.is_empty()
    }

    pub fn is_linked_to(&self, asset_id: AssetId) -> bool {
        self.asset_ids.contains(&asset_id)
    }

    pub fn touch(&mut self, audit_user_id: i64) {
        self.updated_at = Utc::now();
        self.updated_by_id = Some(audit_user_id);
    }
}

/// Catalog row for one uploaded file; `file_name` is unique.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Asset {
    pub id: AssetId,
    pub file_name: String,
    pub created_at: DateTime<Utc>,
    pub created_by_id: i64,
    pub updated_at: DateTime<Utc>,
    pub updated_by_id: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentAssetLink {
    pub content_id: ContentId,
    pub asset_id: AssetId,
}

/// Percent-decode `input`, replacing invalid UTF-8 sequences.
pub fn percent_decode(input: &str) -> String {
    String::from_utf8_lossy(&urlencoding::decode_binary(input.as_bytes())).into_owned()
}

/// Deduplication key for a media URL or path: its final `/` segment, percent-decoded.
pub fn file_name_from_path(path: &str) -> String {
    let last = path.rsplit('/').next().unwrap_or(path);
    percent_decode(last)
}
