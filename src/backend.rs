use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use reqwest::blocking::{Client as HttpClient, RequestBuilder, Response};
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, USER_AGENT};
use reqwest::Method;
use serde::Deserialize;
use serde_json::{json, Value};
use url::Url;

use crate::source::{normalize_rows, Cursor, MediaRef, MediaSource, Page};
use crate::upload::{ArtistRecords, UploadService, UploadTarget};

pub const DEFAULT_FEED_TABLE: &str = "Video";
pub const DEFAULT_ARTIST_TABLE: &str = "Artist";
pub const DEFAULT_BUCKET: &str = "artist-media";

/// Characters escaped inside a single storage path segment.
const SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'`')
    .add(b'{')
    .add(b'}')
    .add(b'/');

#[derive(Debug, Clone, Default)]
pub struct ClientConfig {
    pub base_url: String,
    pub anon_key: String,
    pub feed_table: String,
    pub artist_table: String,
    pub bucket: String,
    pub user_agent: String,
    pub http_client: Option<HttpClient>,
}

/// Client for the hosted backend: PostgREST tables under `/rest/v1` and
/// object storage under `/storage/v1`.
pub struct Client {
    http: HttpClient,
    base_url: Url,
    anon_key: String,
    user_agent: String,
    feed_table: String,
    artist_table: String,
    bucket: String,
}

#[derive(Debug, Deserialize)]
struct SignedUpload {
    url: String,
}

#[derive(Debug, Deserialize)]
struct AvatarRow {
    profile_picture_url: Option<String>,
}

impl Client {
    pub fn new(config: ClientConfig) -> Result<Self> {
        if config.base_url.trim().is_empty() {
            bail!("backend: base url required");
        }
        if config.anon_key.trim().is_empty() {
            bail!("backend: anon key required");
        }
        let mut base = config.base_url.trim().to_string();
        if !base.ends_with('/') {
            base.push('/');
        }
        let base_url = Url::parse(&base).with_context(|| format!("backend: parse url {base}"))?;
        let http = match config.http_client {
            Some(client) => client,
            None => HttpClient::builder()
                .timeout(Duration::from_secs(20))
                .build()?,
        };

        Ok(Client {
            http,
            base_url,
            anon_key: config.anon_key,
            user_agent: if config.user_agent.is_empty() {
                format!("artfeed/{}", crate::VERSION)
            } else {
                config.user_agent
            },
            feed_table: non_empty_or(config.feed_table, DEFAULT_FEED_TABLE),
            artist_table: non_empty_or(config.artist_table, DEFAULT_ARTIST_TABLE),
            bucket: non_empty_or(config.bucket, DEFAULT_BUCKET),
        })
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    fn feed_url(&self, offset: usize, limit: usize) -> Result<Url> {
        let mut url = self.base_url.join(&format!("rest/v1/{}", self.feed_table))?;
        let select = format!(
            "id,video_path,created_at,artist:{}(id,profile_picture_url)",
            self.artist_table
        );
        url.query_pairs_mut()
            .append_pair("select", &select)
            .append_pair("order", "created_at.desc")
            .append_pair("offset", &offset.to_string())
            .append_pair("limit", &limit.to_string());
        Ok(url)
    }

    fn artist_url(&self, artist_id: &str) -> Result<Url> {
        let mut url = self
            .base_url
            .join(&format!("rest/v1/{}", self.artist_table))?;
        url.query_pairs_mut()
            .append_pair("id", &format!("eq.{artist_id}"));
        Ok(url)
    }

    fn object_path(&self, key: &str) -> String {
        key.trim_start_matches('/')
            .split('/')
            .map(|segment| utf8_percent_encode(segment, SEGMENT).to_string())
            .collect::<Vec<_>>()
            .join("/")
    }

    fn storage_url(&self, path: &str) -> Result<Url> {
        self.base_url
            .join(&format!("storage/v1/{path}"))
            .with_context(|| format!("backend: build storage url for {path}"))
    }

    pub fn public_object_url(&self, key: &str) -> Result<String> {
        let path = format!("object/public/{}/{}", self.bucket, self.object_path(key));
        Ok(self.storage_url(&path)?.to_string())
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        self.http
            .request(method, url)
            .header(USER_AGENT, self.user_agent.clone())
            .header("apikey", self.anon_key.clone())
            .header(AUTHORIZATION, format!("Bearer {}", self.anon_key))
    }

    fn send(&self, req: RequestBuilder, what: &str) -> Result<Response> {
        let resp = req.send().with_context(|| format!("backend: {what}"))?;
        if resp.status().is_success() {
            return Ok(resp);
        }
        let status = resp.status();
        let body = resp.text().unwrap_or_default();
        match status.as_u16() {
            401 => Err(anyhow!("backend: {what}: unauthorized")),
            403 => Err(anyhow!("backend: {what}: forbidden")),
            404 => Err(anyhow!("backend: {what}: not found")),
            _ => Err(anyhow!("backend: {what}: {status}: {}", body.trim())),
        }
    }
}

fn non_empty_or(value: String, fallback: &str) -> String {
    if value.trim().is_empty() {
        fallback.to_string()
    } else {
        value
    }
}

fn parse_offset(cursor: Option<&Cursor>) -> Result<usize> {
    match cursor {
        None => Ok(0),
        Some(cursor) => cursor
            .as_str()
            .parse()
            .with_context(|| format!("backend: invalid cursor {:?}", cursor.as_str())),
    }
}

impl MediaSource for Client {
    fn fetch_page(&self, cursor: Option<&Cursor>, page_size: usize) -> Result<Page> {
        let offset = parse_offset(cursor)?;
        let url = self.feed_url(offset, page_size)?;
        log::debug!("backend: GET {url}");
        let rows: Vec<Value> = self
            .send(self.request(Method::GET, url), "fetch feed page")?
            .json()
            .context("backend: decode feed page")?;
        let fetched = rows.len();
        let items = normalize_rows(&rows);
        let has_more = page_size > 0 && fetched >= page_size;
        Ok(Page {
            items,
            next_cursor: has_more.then(|| Cursor::new((offset + fetched).to_string())),
            has_more,
            fetched,
        })
    }

    fn resolve_url(&self, media: &MediaRef) -> Result<String> {
        if media.is_absolute() {
            return Ok(media.as_str().trim().to_string());
        }
        if media.as_str().trim().is_empty() {
            bail!("backend: empty media reference");
        }
        self.public_object_url(media.as_str())
    }
}

impl UploadService for Client {
    fn create_target(&self, key: &str) -> Result<UploadTarget> {
        let path = format!("object/upload/sign/{}/{}", self.bucket, self.object_path(key));
        let url = self.storage_url(&path)?;
        let signed: SignedUpload = self
            .send(self.request(Method::POST, url).json(&json!({})), "sign upload")?
            .json()
            .context("backend: decode signed upload")?;
        let signed_url = self.storage_url(signed.url.trim_start_matches('/'))?;
        Ok(UploadTarget {
            key: key.to_string(),
            signed_url: signed_url.to_string(),
        })
    }

    fn put(&self, target: &UploadTarget, bytes: &[u8], content_type: &str) -> Result<()> {
        let url = Url::parse(&target.signed_url).context("backend: parse signed url")?;
        let req = self
            .request(Method::PUT, url)
            .header(CONTENT_TYPE, content_type)
            .header("x-upsert", "false")
            .body(bytes.to_vec());
        self.send(req, &format!("upload {}", target.key))?;
        Ok(())
    }

    fn remove(&self, keys: &[String]) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }
        let url = self.storage_url(&format!("object/{}", self.bucket))?;
        let req = self
            .request(Method::DELETE, url)
            .json(&json!({ "prefixes": keys }));
        self.send(req, "remove objects")?;
        Ok(())
    }

    fn public_url(&self, key: &str) -> Result<String> {
        self.public_object_url(key)
    }
}

impl ArtistRecords for Client {
    fn avatar_url(&self, artist_id: &str) -> Result<Option<String>> {
        let mut url = self.artist_url(artist_id)?;
        url.query_pairs_mut()
            .append_pair("select", "profile_picture_url");
        let rows: Vec<AvatarRow> = self
            .send(self.request(Method::GET, url), "read artist")?
            .json()
            .context("backend: decode artist row")?;
        Ok(rows
            .into_iter()
            .next()
            .and_then(|row| row.profile_picture_url)
            .filter(|url| !url.trim().is_empty()))
    }

    fn set_avatar_url(&self, artist_id: &str, url: Option<&str>) -> Result<()> {
        let target = self.artist_url(artist_id)?;
        let req = self
            .request(Method::PATCH, target)
            .header("Prefer", "return=minimal")
            .json(&json!({ "profile_picture_url": url }));
        self.send(req, "update artist")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> Client {
        Client::new(ClientConfig {
            base_url: "https://proj.supabase.co".into(),
            anon_key: "anon".into(),
            ..ClientConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn requires_url_and_key() {
        assert!(Client::new(ClientConfig::default()).is_err());
        assert!(Client::new(ClientConfig {
            base_url: "https://proj.supabase.co".into(),
            ..ClientConfig::default()
        })
        .is_err());
    }

    #[test]
    fn feed_url_orders_newest_first() {
        let url = client().feed_url(20, 10).unwrap();
        assert_eq!(url.path(), "/rest/v1/Video");
        let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        assert!(pairs.contains(&("order".into(), "created_at.desc".into())));
        assert!(pairs.contains(&("offset".into(), "20".into())));
        assert!(pairs.contains(&("limit".into(), "10".into())));
        assert!(pairs.contains(&(
            "select".into(),
            "id,video_path,created_at,artist:Artist(id,profile_picture_url)".into()
        )));
    }

    #[test]
    fn resolves_relative_media_to_public_objects() {
        let client = client();
        assert_eq!(
            client
                .resolve_url(&MediaRef::new("videos/my clip.mp4"))
                .unwrap(),
            "https://proj.supabase.co/storage/v1/object/public/artist-media/videos/my%20clip.mp4"
        );
        assert_eq!(
            client
                .resolve_url(&MediaRef::new("https://cdn.test/a.mp4"))
                .unwrap(),
            "https://cdn.test/a.mp4"
        );
        assert!(client.resolve_url(&MediaRef::new("  ")).is_err());
    }

    #[test]
    fn artist_filter_uses_equality_operator() {
        let url = client().artist_url("a-1").unwrap();
        assert_eq!(url.query(), Some("id=eq.a-1"));
    }

    #[test]
    fn cursors_are_offsets() {
        assert_eq!(parse_offset(None).unwrap(), 0);
        assert_eq!(parse_offset(Some(&Cursor::new("30"))).unwrap(), 30);
        assert!(parse_offset(Some(&Cursor::new("next"))).is_err());
    }
}
