use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use indicatif::{ProgressBar, ProgressStyle};

use crate::backend;
use crate::config::{self, Config, PlayerBackend};
use crate::feed::{self, FeedController, NavigationHost};
use crate::gesture::GestureRecognizer;
use crate::media;
use crate::playback::{HeadlessPlayer, Player};
use crate::prefetch::{WarmJob, Warmer};
use crate::source::{MediaSource, MemorySource};
use crate::storage;
use crate::ui;
use crate::upload::Uploader;
use crate::video::{MpvOptions, MpvPlayer};

pub fn run() -> Result<()> {
    let cfg = load_config()?;
    let display_path = friendly_path(config::default_path().as_ref());

    let source: Arc<dyn MediaSource>;
    let source_label: String;
    if cfg.backend.is_configured() {
        source = Arc::new(backend_client(&cfg)?);
        source_label = host_label(&cfg.backend.url);
    } else {
        log::info!("app: no backend configured, using demo feed");
        source = Arc::new(MemorySource::demo().with_base_url(demo_base_url(&cfg)));
        source_label = "demo".to_string();
    }

    let player = select_player(&cfg);

    let store = storage::Store::open(storage::Options::default()).context("open storage")?;
    let media_cfg = media::Config {
        cache_dir: cfg.media.cache_dir.clone(),
        max_size_bytes: cfg.media.max_size_bytes,
        default_ttl: cfg.media.default_ttl,
        workers: cfg.media.workers,
        ..media::Config::default()
    };
    let media_manager = match media::Manager::new(store, media_cfg) {
        Ok(manager) => Some(manager),
        Err(err) => {
            log::warn!("app: media cache disabled: {err:#}");
            None
        }
    };
    let warmer: Arc<dyn Warmer> = match &media_manager {
        Some(manager) => Arc::new(manager.handle()),
        None => Arc::new(NoopWarmer),
    };

    let navigation: Option<Box<dyn NavigationHost>> = if cfg.backend.site_url.trim().is_empty() {
        None
    } else {
        Some(Box::new(BrowserNavigation {
            site_url: cfg.backend.site_url.clone(),
        }))
    };

    let controller = FeedController::new(feed::Options {
        config: cfg.feed_config(),
        viewport: cfg.viewport_config(),
        source,
        player,
        warmer,
        navigation,
    });

    let options = ui::Options {
        feed: controller,
        gestures: GestureRecognizer::new(cfg.gesture_config()),
        status_message: "Loading feed… Enter toggles sound, q quits.".to_string(),
        source_label,
        config_path: display_path,
    };

    let mut model = ui::Model::new(options);
    let result = model.run();
    drop(model);
    drop(media_manager);
    result
}

/// Uploads `file` as the artist's new profile picture and prints its URL.
pub fn upload_avatar(artist_id: &str, file: &Path) -> Result<()> {
    let cfg = load_config()?;
    if !cfg.backend.is_configured() {
        bail!("uploading requires backend.url and backend.anon_key in the config");
    }
    let client = backend_client(&cfg)?;
    let input = fs::read(file).with_context(|| format!("read {}", file.display()))?;

    let spinner = ProgressBar::new_spinner();
    spinner.set_style(
        ProgressStyle::with_template("{spinner} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    spinner.enable_steady_tick(Duration::from_millis(120));
    spinner.set_message(format!("Uploading avatar for {artist_id}"));

    let uploader = Uploader::new(&client, cfg.retry_policy());
    let result = uploader.replace_avatar(&client, client.bucket(), artist_id, &input);
    spinner.finish_and_clear();

    let url = result?;
    println!("{url}");
    Ok(())
}

pub fn check_config() -> Result<String> {
    let cfg = load_config()?;
    config::to_yaml(&cfg)
}

fn load_config() -> Result<Config> {
    let cfg = config::load(config::LoadOptions::default()).context("load config")?;
    cfg.validate()?;
    Ok(cfg)
}

fn backend_client(cfg: &Config) -> Result<backend::Client> {
    backend::Client::new(backend::ClientConfig {
        base_url: cfg.backend.url.clone(),
        anon_key: cfg.backend.anon_key.clone(),
        feed_table: cfg.backend.feed_table.clone(),
        artist_table: cfg.backend.artist_table.clone(),
        bucket: cfg.backend.bucket.clone(),
        user_agent: String::new(),
        http_client: None,
    })
    .context("create backend client")
}

fn select_player(cfg: &Config) -> Arc<dyn Player> {
    match cfg.player.backend {
        PlayerBackend::Headless => Arc::new(HeadlessPlayer),
        PlayerBackend::Mpv => {
            let mpv = MpvPlayer::new(MpvOptions {
                mpv_path: cfg.player.mpv_path.clone(),
                load_timeout: cfg.player.load_timeout,
            });
            if mpv.is_available() {
                Arc::new(mpv)
            } else {
                log::warn!(
                    "app: {} not found, falling back to headless playback",
                    cfg.player.mpv_path
                );
                Arc::new(HeadlessPlayer)
            }
        }
    }
}

fn demo_base_url(cfg: &Config) -> String {
    if cfg.backend.site_url.trim().is_empty() {
        "https://example.com/media".to_string()
    } else {
        format!("{}/media", cfg.backend.site_url.trim_end_matches('/'))
    }
}

fn host_label(url: &str) -> String {
    url::Url::parse(url)
        .ok()
        .and_then(|parsed| parsed.host_str().map(str::to_string))
        .unwrap_or_else(|| url.to_string())
}

/// Opens artist pages of the web front-end in the system browser.
struct BrowserNavigation {
    site_url: String,
}

impl BrowserNavigation {
    fn artist_url(&self, poster_id: &str) -> String {
        format!("{}/artist/{}", self.site_url.trim_end_matches('/'), poster_id)
    }
}

impl NavigationHost for BrowserNavigation {
    fn open_artist(&self, poster_id: &str) -> Result<()> {
        let url = self.artist_url(poster_id);
        log::debug!("app: opening {url}");
        webbrowser::open(&url).with_context(|| format!("open {url}"))
    }
}

struct NoopWarmer;

struct DoneJob;

impl WarmJob for DoneJob {
    fn poll(&mut self) -> Option<Result<(), String>> {
        Some(Ok(()))
    }

    fn cancel(&self) {}
}

impl Warmer for NoopWarmer {
    fn warm(&self, _url: &str) -> Box<dyn WarmJob> {
        Box::new(DoneJob)
    }
}

fn friendly_path(path: Option<&PathBuf>) -> String {
    if let Some(path) = path {
        if let Some(home) = dirs::home_dir() {
            if let Ok(stripped) = path.strip_prefix(&home) {
                let mut display = String::from("~");
                if !stripped.as_os_str().is_empty() {
                    display.push_str(&format!("/{}", stripped.display()));
                }
                return display;
            }
        }
        path.display().to_string()
    } else {
        "~/.config/artfeed/config.yaml".to_string()
    }
}
