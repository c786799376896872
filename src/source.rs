use std::fmt;

use anyhow::{bail, Result};
use serde_json::Value;

use crate::feed::FeedItem;

/// Opaque, forward-only pagination token handed out by a [`MediaSource`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Cursor(String);

impl Cursor {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Storage reference for a piece of media. Either a bucket-relative object
/// path or an already absolute URL; only the source knows how to resolve it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MediaRef(String);

impl MediaRef {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_absolute(&self) -> bool {
        let lower = self.0.trim_start().to_ascii_lowercase();
        lower.starts_with("http://") || lower.starts_with("https://") || lower.starts_with("file://")
    }
}

impl fmt::Display for MediaRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Default)]
pub struct Page {
    pub items: Vec<FeedItem>,
    pub next_cursor: Option<Cursor>,
    pub has_more: bool,
    /// Rows the backend returned before normalisation dropped malformed ones.
    pub fetched: usize,
}

pub trait MediaSource: Send + Sync {
    /// Items come back newest first; `cursor` is `None` for the first page.
    fn fetch_page(&self, cursor: Option<&Cursor>, page_size: usize) -> Result<Page>;
    fn resolve_url(&self, media: &MediaRef) -> Result<String>;
}

/// Maps one loosely typed backend row onto the strict [`FeedItem`] shape.
/// Rows missing an id, a video reference or a poster are rejected.
pub fn normalize_row(row: &Value) -> Option<FeedItem> {
    let id = scalar_string(row.get("id")?)?;
    let media = ["video_path", "video_url", "url"]
        .iter()
        .find_map(|key| row.get(*key).and_then(non_empty_str))?;

    let artist = row.get("artist").or_else(|| row.get("Artist"));
    let poster_id = artist
        .and_then(|artist| artist.get("id"))
        .and_then(scalar_string)
        .or_else(|| row.get("artist_id").and_then(scalar_string))?;
    let avatar = artist
        .and_then(|artist| artist.get("profile_picture_url"))
        .and_then(non_empty_str)
        .or_else(|| row.get("avatar_url").and_then(non_empty_str));

    Some(FeedItem {
        id,
        media_ref: MediaRef::new(media),
        poster_id,
        poster_avatar_ref: avatar.map(MediaRef::new),
    })
}

pub fn normalize_rows(rows: &[Value]) -> Vec<FeedItem> {
    rows.iter()
        .filter_map(|row| {
            let item = normalize_row(row);
            if item.is_none() {
                log::debug!("source: dropping malformed feed row {row}");
            }
            item
        })
        .collect()
}

fn scalar_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn non_empty_str(value: &Value) -> Option<String> {
    value
        .as_str()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// In-memory source paginated by offset. Backs the offline demo feed.
pub struct MemorySource {
    items: Vec<FeedItem>,
    base_url: Option<String>,
}

impl MemorySource {
    pub fn new(items: Vec<FeedItem>) -> Self {
        Self {
            items,
            base_url: None,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    pub fn demo() -> Self {
        let items = (1..=6)
            .map(|n| FeedItem {
                id: n.to_string(),
                media_ref: MediaRef::new(format!("videos/sample_{n}.mp4")),
                poster_id: format!("artist-{}", (n + 1) / 2),
                poster_avatar_ref: None,
            })
            .collect();
        Self::new(items)
    }
}

impl MediaSource for MemorySource {
    fn fetch_page(&self, cursor: Option<&Cursor>, page_size: usize) -> Result<Page> {
        let start = match cursor {
            Some(cursor) => match cursor.as_str().parse::<usize>() {
                Ok(offset) => offset,
                Err(_) => bail!("memory source: invalid cursor {:?}", cursor.as_str()),
            },
            None => 0,
        };
        let start = start.min(self.items.len());
        let end = start.saturating_add(page_size).min(self.items.len());
        let items = self.items[start..end].to_vec();
        let has_more = end < self.items.len();
        Ok(Page {
            fetched: items.len(),
            items,
            next_cursor: has_more.then(|| Cursor::new(end.to_string())),
            has_more,
        })
    }

    fn resolve_url(&self, media: &MediaRef) -> Result<String> {
        if media.is_absolute() {
            return Ok(media.as_str().trim().to_string());
        }
        match &self.base_url {
            Some(base) => Ok(format!(
                "{}/{}",
                base.trim_end_matches('/'),
                media.as_str().trim_start_matches('/')
            )),
            None => bail!("memory source: cannot resolve relative media {media}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn normalizes_joined_artist_rows() {
        let row = json!({
            "id": 42,
            "video_path": "videos/clip.mp4",
            "created_at": "2024-05-01T10:00:00Z",
            "artist": { "id": "a-1", "profile_picture_url": "https://cdn.test/a.jpg" }
        });
        let item = normalize_row(&row).unwrap();
        assert_eq!(item.id, "42");
        assert_eq!(item.media_ref.as_str(), "videos/clip.mp4");
        assert_eq!(item.poster_id, "a-1");
        assert_eq!(
            item.poster_avatar_ref.as_ref().map(MediaRef::as_str),
            Some("https://cdn.test/a.jpg")
        );
    }

    #[test]
    fn falls_back_to_flat_artist_columns() {
        let row = json!({
            "id": "v-1",
            "url": "https://cdn.test/v.mp4",
            "artist_id": 7,
            "avatar_url": ""
        });
        let item = normalize_row(&row).unwrap();
        assert_eq!(item.poster_id, "7");
        assert!(item.poster_avatar_ref.is_none());
        assert!(item.media_ref.is_absolute());
    }

    #[test]
    fn rejects_rows_without_media_or_poster() {
        assert!(normalize_row(&json!({ "id": "1", "artist_id": "a" })).is_none());
        assert!(normalize_row(&json!({ "id": "1", "url": "x.mp4" })).is_none());
        assert!(normalize_row(&json!({ "url": "x.mp4", "artist_id": "a" })).is_none());
        let rows = vec![
            json!({ "id": "1", "url": "x.mp4", "artist_id": "a" }),
            json!({ "id": null, "url": "y.mp4", "artist_id": "a" }),
        ];
        assert_eq!(normalize_rows(&rows).len(), 1);
    }

    #[test]
    fn memory_source_pages_forward() {
        let source = MemorySource::demo();
        let first = source.fetch_page(None, 4).unwrap();
        assert_eq!(first.items.len(), 4);
        assert!(first.has_more);
        let second = source.fetch_page(first.next_cursor.as_ref(), 4).unwrap();
        assert_eq!(second.items.len(), 2);
        assert!(!second.has_more);
        assert!(second.next_cursor.is_none());
        assert_eq!(second.items[0].id, "5");
    }

    #[test]
    fn memory_source_resolves_against_base() {
        let source = MemorySource::new(Vec::new()).with_base_url("https://cdn.test/media/");
        let url = source.resolve_url(&MediaRef::new("/videos/a.mp4")).unwrap();
        assert_eq!(url, "https://cdn.test/media/videos/a.mp4");
        assert!(MemorySource::new(Vec::new())
            .resolve_url(&MediaRef::new("videos/a.mp4"))
            .is_err());
    }
}
