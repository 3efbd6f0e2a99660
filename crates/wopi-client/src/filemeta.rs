//! The subset of `CheckFileInfo` the bridge reads.

use serde::Deserialize;

/// Fields read from a WOPI `GetFileInfo` response. Storage servers return a
/// much larger document; we only deserialize what we use.
#[derive(Debug, Clone, Deserialize)]
pub struct FileMeta {
    #[serde(rename = "BaseFileName")]
    pub base_file_name: String,
    #[serde(rename = "FileName")]
    pub file_name: String,
    #[serde(rename = "UserCanWrite")]
    pub user_can_write: bool,
    #[serde(rename = "UserFriendlyName")]
    pub user_friendly_name: String,
}

impl FileMeta {
    /// The file extension (without the dot), lowercased, or empty if none.
    pub fn extension(&self) -> &str {
        match self.base_file_name.rsplit_once('.') {
            Some((_, ext)) => ext,
            None => "",
        }
    }
}
