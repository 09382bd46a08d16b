use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::blob::BlobId;
use crate::error::TypeError;

/// Identifier of a logical media resource within a partition.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MediaId(String);

impl MediaId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for MediaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MediaId({})", self.0)
    }
}

impl fmt::Display for MediaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// MIME-style `type/subtype` pair used for decoder lookup.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MediaType {
    #[serde(rename = "type", default)]
    pub type_name: String,
    #[serde(default)]
    pub subtype: String,
}

impl MediaType {
    pub fn new(type_name: impl Into<String>, subtype: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            subtype: subtype.into(),
        }
    }
}

impl fmt::Display for MediaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.type_name, self.subtype)
    }
}

/// Descriptive state of a media: which blob holds its content and how to
/// interpret it.
///
/// Field names follow the object-graph wire form (`content`, `mediaType`,
/// `sourceURL`), so a Media action body deserializes directly into it.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaInfo {
    #[serde(rename = "content", default, skip_serializing_if = "Option::is_none")]
    pub blob_id: Option<BlobId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<MediaType>,
    #[serde(rename = "sourceURL", default, skip_serializing_if = "Option::is_none")]
    pub source_url: Option<String>,
}

impl MediaInfo {
    /// Parse the media-relevant fields out of an action body.
    ///
    /// Unrelated fields of the body are ignored; a `null` body is an empty
    /// update.
    pub fn from_action_body(media_id: &MediaId, body: &Value) -> Result<Self, TypeError> {
        if body.is_null() {
            return Ok(Self::default());
        }
        serde_json::from_value(body.clone()).map_err(|e| TypeError::InvalidMediaBody {
            media_id: media_id.to_string(),
            reason: e.to_string(),
        })
    }

    /// Overlay the fields present in `update` onto `self`.
    pub fn overlay(&mut self, update: &MediaInfo) {
        if update.blob_id.is_some() {
            self.blob_id = update.blob_id;
        }
        if update.name.is_some() {
            self.name.clone_from(&update.name);
        }
        if update.media_type.is_some() {
            self.media_type.clone_from(&update.media_type);
        }
        if update.source_url.is_some() {
            self.source_url.clone_from(&update.source_url);
        }
    }
}

/// Whether a media sub-action creates or modifies its media.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MediaUpdateKind {
    Created,
    Modified,
}

/// A Media create/modify sub-action extracted from an event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MediaUpdate {
    pub media_id: MediaId,
    pub kind: MediaUpdateKind,
    pub info: MediaInfo,
}

/// Association between a media and its current blob and decoded cache.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MediaEntry {
    pub media_id: MediaId,
    pub media_info: MediaInfo,
    /// The entry row has been written to local storage.
    pub is_persisted: bool,
    /// The entry holds an in-memory reference on its blob.
    pub is_in_memory: bool,
    #[serde(skip)]
    pub native_content: Option<Value>,
}

impl MediaEntry {
    /// A fresh entry with no content yet.
    pub fn empty(media_id: MediaId) -> Self {
        Self {
            media_id,
            media_info: MediaInfo::default(),
            is_persisted: false,
            is_in_memory: false,
            native_content: None,
        }
    }

    pub fn blob_id(&self) -> Option<BlobId> {
        self.media_info.blob_id
    }
}
