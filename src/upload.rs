use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use image::ImageFormat;
use once_cell::sync::Lazy;
use rand::Rng;
use regex::Regex;

use crate::error::UploadError;

/// Write target handed out by the storage backend for one object key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadTarget {
    pub key: String,
    pub signed_url: String,
}

/// Object storage the uploader writes to.
pub trait UploadService: Send + Sync {
    fn create_target(&self, key: &str) -> Result<UploadTarget>;
    fn put(&self, target: &UploadTarget, bytes: &[u8], content_type: &str) -> Result<()>;
    fn remove(&self, keys: &[String]) -> Result<()>;
    fn public_url(&self, key: &str) -> Result<String>;
}

/// The artist record an avatar upload is linked to.
pub trait ArtistRecords: Send + Sync {
    fn avatar_url(&self, artist_id: &str) -> Result<Option<String>>;
    fn set_avatar_url(&self, artist_id: &str, url: Option<&str>) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(8),
        }
    }
}

impl RetryPolicy {
    /// Wait before retrying after failed attempt `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        self.initial_backoff
            .saturating_mul(1u32 << exp)
            .min(self.max_backoff)
    }
}

pub struct Uploader<'a> {
    service: &'a dyn UploadService,
    policy: RetryPolicy,
}

impl<'a> Uploader<'a> {
    pub fn new(service: &'a dyn UploadService, policy: RetryPolicy) -> Self {
        let max_attempts = policy.max_attempts.max(1);
        Self {
            service,
            policy: RetryPolicy {
                max_attempts,
                ..policy
            },
        }
    }

    /// Writes `bytes` under `key`, retrying with exponential backoff.
    pub fn upload(&self, key: &str, bytes: &[u8], content_type: &str) -> Result<(), UploadError> {
        if key.trim().is_empty() {
            return Err(UploadError::Invalid("object key required".into()));
        }
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = self
                .service
                .create_target(key)
                .and_then(|target| self.service.put(&target, bytes, content_type));
            match result {
                Ok(()) => {
                    log::info!("upload: stored {key} ({} bytes)", bytes.len());
                    return Ok(());
                }
                Err(err) if attempt >= self.policy.max_attempts => {
                    log::warn!("upload: giving up on {key} after {attempt} attempt(s): {err:#}");
                    return Err(UploadError::Exhausted {
                        key: key.to_string(),
                        attempts: attempt,
                        source: err,
                    });
                }
                Err(err) => {
                    let delay = jittered(self.policy.delay_for(attempt));
                    log::warn!("upload: attempt {attempt} for {key} failed, retrying in {delay:?}: {err:#}");
                    thread::sleep(delay);
                }
            }
        }
    }

    /// Uploads, then runs `link` with the object's public URL. If `link`
    /// fails the object is removed again so nothing is left orphaned.
    pub fn upload_and_link<T, F>(
        &self,
        key: &str,
        bytes: &[u8],
        content_type: &str,
        link: F,
    ) -> Result<T, UploadError>
    where
        F: FnOnce(&str) -> Result<T>,
    {
        self.upload(key, bytes, content_type)?;
        let linked = self
            .service
            .public_url(key)
            .and_then(|public_url| link(&public_url));
        match linked {
            Ok(value) => Ok(value),
            Err(err) => {
                log::warn!("upload: linking {key} failed, removing object: {err:#}");
                if let Err(cleanup) = self.service.remove(&[key.to_string()]) {
                    log::warn!("upload: could not remove orphaned {key}: {cleanup:#}");
                }
                Err(UploadError::Link {
                    key: key.to_string(),
                    source: err,
                })
            }
        }
    }

    /// Replaces an artist's profile picture and returns the new public URL.
    ///
    /// `input` may be raw image bytes or a base64 data URL. Non-JPEG images
    /// are re-encoded. The previous picture is removed only after the record
    /// points at the new one.
    pub fn replace_avatar(
        &self,
        records: &dyn ArtistRecords,
        bucket: &str,
        artist_id: &str,
        input: &[u8],
    ) -> Result<String, UploadError> {
        if artist_id.trim().is_empty() {
            return Err(UploadError::Invalid("artist id required".into()));
        }
        let jpeg = to_jpeg(&decode_image_input(input)?)?;
        let previous = match records.avatar_url(artist_id) {
            Ok(url) => url,
            Err(err) => {
                log::debug!("upload: could not read current avatar of {artist_id}: {err:#}");
                None
            }
        };

        let key = avatar_key(artist_id, now_millis());
        let public_url = self.upload_and_link(&key, &jpeg, "image/jpeg", |url| {
            records
                .set_avatar_url(artist_id, Some(url))
                .with_context(|| format!("update avatar of artist {artist_id}"))?;
            Ok(url.to_string())
        })?;

        if let Some(old_key) = previous.as_deref().and_then(|url| storage_key_from_url(url, bucket)) {
            if old_key != key {
                if let Err(err) = self.service.remove(&[old_key.clone()]) {
                    log::warn!("upload: could not remove previous avatar {old_key}: {err:#}");
                }
            }
        }
        Ok(public_url)
    }
}

fn jittered(delay: Duration) -> Duration {
    let spread = (delay.as_millis() / 4) as u64;
    delay + Duration::from_millis(rand::thread_rng().gen_range(0..=spread))
}

fn now_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0)
}

pub fn avatar_key(artist_id: &str, millis: u128) -> String {
    format!("images/{artist_id}-{millis}.jpg")
}

/// Object key inside `bucket` for a public storage URL, if it points at an
/// avatar image there.
pub fn storage_key_from_url(url: &str, bucket: &str) -> Option<String> {
    static AVATAR_OBJECT_RE: Lazy<Regex> = Lazy::new(|| {
        Regex::new(r"([^/?#]+)/(images/[^/?#][^?#]*)").expect("valid avatar object regex")
    });
    AVATAR_OBJECT_RE
        .captures_iter(url)
        .find(|caps| caps.get(1).map(|m| m.as_str()) == Some(bucket))
        .and_then(|caps| caps.get(2))
        .map(|m| m.as_str().to_string())
}

/// Accepts raw bytes or a `data:...;base64,` URL.
pub fn decode_image_input(input: &[u8]) -> Result<Vec<u8>, UploadError> {
    const MARKER: &[u8] = b"base64,";
    let trimmed = trim_ascii(input);
    let payload = if trimmed.starts_with(b"data:") {
        let Some(pos) = find(trimmed, MARKER) else {
            return Err(UploadError::Invalid("data URL is not base64 encoded".into()));
        };
        &trimmed[pos + MARKER.len()..]
    } else {
        return Ok(input.to_vec());
    };
    let text: String = payload
        .iter()
        .filter(|b| !b.is_ascii_whitespace())
        .map(|b| *b as char)
        .collect();
    BASE64
        .decode(text)
        .map_err(|err| UploadError::Invalid(format!("invalid base64 image: {err}")))
}

fn to_jpeg(bytes: &[u8]) -> Result<Vec<u8>, UploadError> {
    match image::guess_format(bytes) {
        Ok(ImageFormat::Jpeg) => Ok(bytes.to_vec()),
        Ok(_) => {
            let decoded = image::load_from_memory(bytes)
                .map_err(|err| UploadError::Invalid(format!("unreadable image: {err}")))?;
            let mut out = std::io::Cursor::new(Vec::new());
            decoded
                .to_rgb8()
                .write_to(&mut out, ImageFormat::Jpeg)
                .map_err(|err| UploadError::Invalid(format!("encode jpeg: {err}")))?;
            Ok(out.into_inner())
        }
        Err(_) => Err(UploadError::Invalid("not an image".into())),
    }
}

fn trim_ascii(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    let end = bytes
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(start, |i| i + 1);
    &bytes[start..end]
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
