use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::sync::Arc;

/// Raw image payload of one page, shared between the cache and page states.
pub type PageBytes = Arc<[u8]>;

pub const DEFAULT_READER_MODE: &str = "default";

/// Identity of a chapter on the server: its manga and its index in that manga.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChapterKey {
    pub manga_id: i64,
    pub index: u32,
}

impl fmt::Display for ChapterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.manga_id, self.index)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manga {
    pub id: i64,
    pub title: String,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub meta: MangaMeta,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct MangaMeta {
    #[serde(rename = "juiReaderMode", default = "default_reader_mode")]
    pub reader_mode: String,
}

impl Default for MangaMeta {
    fn default() -> Self {
        Self {
            reader_mode: default_reader_mode(),
        }
    }
}

fn default_reader_mode() -> String {
    DEFAULT_READER_MODE.to_string()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chapter {
    pub id: i64,
    pub name: String,
    pub manga_id: i64,
    pub index: u32,
    #[serde(default)]
    pub read: bool,
    #[serde(default)]
    pub last_page_read: u32,
    #[serde(default)]
    pub page_count: Option<i32>,
    #[serde(default)]
    pub meta: ChapterMeta,
}

impl Chapter {
    pub fn key(&self) -> ChapterKey {
        ChapterKey {
            manga_id: self.manga_id,
            index: self.index,
        }
    }

    /// The server reports `-1` (or nothing) until the page list has been fetched.
    pub fn page_count(&self) -> Option<usize> {
        self.page_count
            .filter(|count| *count > 0)
            .map(|count| count as usize)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ChapterMeta {
    #[serde(rename = "juiPageOffset", default, deserialize_with = "number_string")]
    pub page_offset: i32,
}

/// Meta values travel as strings on the wire.
fn number_string<'de, D>(deserializer: D) -> Result<i32, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    Ok(raw.trim().parse().unwrap_or(0))
}

/// Partial update of a chapter's reading flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChapterFlags {
    pub read: Option<bool>,
    pub last_page_read: Option<u32>,
}

impl ChapterFlags {
    pub fn read() -> Self {
        Self {
            read: Some(true),
            ..Self::default()
        }
    }

    pub fn last_page_read(page: u32) -> Self {
        Self {
            last_page_read: Some(page),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chapter_parses_server_json() {
        let json = r#"{
            "id": 42,
            "name": "Chapter 3",
            "mangaId": 7,
            "index": 3,
            "read": false,
            "lastPageRead": 5,
            "pageCount": 18,
            "meta": { "juiPageOffset": "120" }
        }"#;
        let chapter: Chapter = serde_json::from_str(json).unwrap();
        assert_eq!(chapter.key(), ChapterKey { manga_id: 7, index: 3 });
        assert_eq!(chapter.page_count(), Some(18));
        assert_eq!(chapter.last_page_read, 5);
        assert_eq!(chapter.meta.page_offset, 120);
    }

    #[test]
    fn unknown_page_count_is_none() {
        let json = r#"{"id": 1, "name": "x", "mangaId": 1, "index": 1, "pageCount": -1}"#;
        let chapter: Chapter = serde_json::from_str(json).unwrap();
        assert_eq!(chapter.page_count(), None);
        assert_eq!(chapter.meta, ChapterMeta::default());
    }

    #[test]
    fn manga_meta_defaults_reader_mode() {
        let json = r#"{"id": 9, "title": "Berserk", "meta": {}}"#;
        let manga: Manga = serde_json::from_str(json).unwrap();
        assert_eq!(manga.meta.reader_mode, DEFAULT_READER_MODE);

        let json = r#"{"id": 9, "title": "Berserk", "meta": {"juiReaderMode": "LTR"}}"#;
        let manga: Manga = serde_json::from_str(json).unwrap();
        assert_eq!(manga.meta.reader_mode, "LTR");
    }
}
