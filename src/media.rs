use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Utc};
use crossbeam_channel::{bounded, unbounded, Receiver, Sender, TryRecvError};
use image::ImageFormat;
use parking_lot::Mutex;
use reqwest::blocking::Client;
use sha1::{Digest, Sha1};

use crate::prefetch::{WarmJob, Warmer};
use crate::storage::{self, CachedPoster};

#[derive(Debug, Clone)]
pub struct Config {
    pub cache_dir: Option<PathBuf>,
    pub max_size_bytes: i64,
    /// How long a downloaded poster is served from disk.
    pub default_ttl: Duration,
    pub workers: usize,
    pub max_queue_depth: usize,
    pub http_client: Option<Client>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cache_dir: None,
            max_size_bytes: 200 * 1024 * 1024,
            default_ttl: Duration::from_secs(6 * 60 * 60),
            workers: 2,
            max_queue_depth: 64,
            http_client: None,
        }
    }
}

/// A queued warm request. Once cancelled, the worker skips the download if
/// it has not started, stops reading the body if it has, and never reports
/// a late result.
pub struct Pending {
    rx: Receiver<Result<CachedPoster>>,
    cancel: Arc<AtomicBool>,
}

impl Pending {
    fn failed(err: anyhow::Error) -> Self {
        let (tx, rx) = bounded(1);
        let _ = tx.send(Err(err));
        Self {
            rx,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    pub fn try_result(&self) -> Option<Result<CachedPoster>> {
        if self.cancel.load(Ordering::SeqCst) {
            return None;
        }
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(Err(anyhow!("media: worker dropped request"))),
        }
    }
}

impl WarmJob for Pending {
    fn poll(&mut self) -> Option<Result<(), String>> {
        self.try_result()
            .map(|result| result.map(|_| ()).map_err(|err| format!("{err:#}")))
    }

    fn cancel(&self) {
        Pending::cancel(self);
    }
}

struct Job {
    url: String,
    cancel: Arc<AtomicBool>,
    tx: Sender<Result<CachedPoster>>,
}

struct Inner {
    store: storage::Store,
    cfg: Config,
    cache_dir: PathBuf,
    client: Client,
    jobs: Sender<Job>,
    evicting: Mutex<()>,
}

/// Cloneable submission handle; this is the feed's [`Warmer`].
#[derive(Clone)]
pub struct Handle {
    inner: Arc<Inner>,
}

/// Owns the download workers. Dropping it stops and joins them.
pub struct Manager {
    inner: Arc<Inner>,
    stop: Sender<()>,
    workers: Vec<thread::JoinHandle<()>>,
}

impl Manager {
    pub fn new(store: storage::Store, mut cfg: Config) -> Result<Self> {
        if cfg.workers == 0 {
            cfg.workers = 1;
        }
        let cache_dir = cfg
            .cache_dir
            .clone()
            .or_else(default_cache_dir)
            .context("media: cache dir not configured")?;
        fs::create_dir_all(&cache_dir)
            .with_context(|| format!("media: create cache dir {}", cache_dir.display()))?;
        let client = match cfg.http_client.clone() {
            Some(client) => client,
            None => Client::builder()
                .timeout(Duration::from_secs(30))
                .user_agent(format!("artfeed/{}", crate::VERSION))
                .build()
                .context("media: build http client")?,
        };

        let (job_tx, job_rx) = unbounded::<Job>();
        let (stop_tx, stop_rx) = unbounded::<()>();
        let inner = Arc::new(Inner {
            store,
            cfg,
            cache_dir,
            client,
            jobs: job_tx,
            evicting: Mutex::new(()),
        });

        let workers = (0..inner.cfg.workers)
            .map(|_| {
                let jobs = job_rx.clone();
                let stop = stop_rx.clone();
                let inner = inner.clone();
                thread::spawn(move || inner.run_worker(jobs, stop))
            })
            .collect::<Vec<_>>();
        log::debug!(
            "media: {} poster worker(s) caching into {}",
            workers.len(),
            inner.cache_dir.display()
        );

        Ok(Self {
            inner,
            stop: stop_tx,
            workers,
        })
    }

    pub fn handle(&self) -> Handle {
        Handle {
            inner: self.inner.clone(),
        }
    }
}

impl Drop for Manager {
    fn drop(&mut self) {
        for _ in &self.workers {
            let _ = self.stop.send(());
        }
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

impl Handle {
    pub fn enqueue(&self, url: &str) -> Pending {
        let depth = self.inner.jobs.len();
        if self.inner.cfg.max_queue_depth > 0 && depth >= self.inner.cfg.max_queue_depth {
            return Pending::failed(anyhow!("media: queue full ({depth} pending)"));
        }
        let (tx, rx) = bounded(1);
        let cancel = Arc::new(AtomicBool::new(false));
        let job = Job {
            url: url.to_string(),
            cancel: cancel.clone(),
            tx,
        };
        if self.inner.jobs.send(job).is_err() {
            return Pending::failed(anyhow!("media: worker pool stopped"));
        }
        Pending { rx, cancel }
    }
}

impl Warmer for Handle {
    fn warm(&self, url: &str) -> Box<dyn WarmJob> {
        Box::new(self.enqueue(url))
    }
}

impl Inner {
    fn run_worker(&self, jobs: Receiver<Job>, stop: Receiver<()>) {
        loop {
            crossbeam_channel::select! {
                recv(stop) -> _ => break,
                recv(jobs) -> msg => match msg {
                    Ok(job) => self.process(job),
                    Err(_) => break,
                },
            }
        }
    }

    fn process(&self, job: Job) {
        if job.cancel.load(Ordering::SeqCst) {
            log::debug!("media: skipping cancelled warm of {}", job.url);
            return;
        }
        let result = self.warm(&job.url, &job.cancel);
        if job.cancel.load(Ordering::SeqCst) {
            log::debug!("media: dropping result of cancelled warm of {}", job.url);
            return;
        }
        if let Err(err) = &result {
            log::debug!("media: warming {} failed: {err:#}", job.url);
        }
        let _ = job.tx.send(result);
    }

    fn warm(&self, url: &str, cancel: &AtomicBool) -> Result<CachedPoster> {
        if url.trim().is_empty() {
            bail!("media: url required");
        }
        let now = Utc::now();
        if let Some(poster) = self.store.get(url)? {
            if self.is_usable(&poster, now) {
                self.store.touch(poster.id, now)?;
                return Ok(CachedPoster {
                    last_used_at: now,
                    ..poster
                });
            }
        }
        self.download(url, now, cancel)
    }

    /// Reads the body in chunks so a cancelled warm stops mid-transfer and
    /// leaves nothing on disk or in the index.
    fn download(
        &self,
        url: &str,
        now: DateTime<Utc>,
        cancel: &AtomicBool,
    ) -> Result<CachedPoster> {
        let mut response = self
            .client
            .get(url)
            .send()
            .with_context(|| format!("media: download {url}"))?;
        let status = response.status();
        if !status.is_success() {
            bail!("media: download {url}: {status}");
        }
        let header_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let mut bytes = Vec::new();
        let mut chunk = [0u8; BODY_CHUNK];
        loop {
            ensure_live(url, cancel)?;
            let read = response.read(&mut chunk).context("media: read body")?;
            if read == 0 {
                break;
            }
            bytes.extend_from_slice(&chunk[..read]);
        }
        ensure_live(url, cancel)?;

        let checksum = sha1_hex(&bytes);
        let path = self.cache_dir.join(format!("{checksum}.bin"));
        fs::write(&path, &bytes).with_context(|| format!("media: write {}", path.display()))?;

        let mut poster = CachedPoster {
            id: 0,
            url: url.to_string(),
            content_type: header_type.unwrap_or_else(|| sniff_content_type(&bytes)),
            file_path: path.to_string_lossy().into_owned(),
            size_bytes: bytes.len() as i64,
            fetched_at: now,
            last_used_at: now,
            checksum,
        };
        self.evict_for(poster.size_bytes, now)?;
        poster.id = self.store.put(&poster)?;
        Ok(poster)
    }

    fn is_usable(&self, poster: &CachedPoster, now: DateTime<Utc>) -> bool {
        is_fresh(poster, self.cfg.default_ttl, now) && Path::new(&poster.file_path).exists()
    }

    /// Drops stale posters, then least recently used ones until `incoming`
    /// more bytes fit under the size budget.
    fn evict_for(&self, incoming: i64, now: DateTime<Utc>) -> Result<()> {
        let _guard = self.evicting.lock();

        if let Some(cutoff) = chrono::Duration::from_std(self.cfg.default_ttl)
            .ok()
            .and_then(|ttl| now.checked_sub_signed(ttl))
        {
            self.discard(self.store.stale(cutoff, 100)?)?;
        }

        let mut total = self.store.total_size()? + incoming;
        if total <= self.cfg.max_size_bytes {
            return Ok(());
        }
        let mut victims = Vec::new();
        for poster in self.store.least_recently_used(100)? {
            if total <= self.cfg.max_size_bytes {
                break;
            }
            total -= poster.size_bytes;
            victims.push(poster);
        }
        log::debug!("media: evicting {} poster(s) over budget", victims.len());
        self.discard(victims)
    }

    fn discard(&self, posters: Vec<CachedPoster>) -> Result<()> {
        if posters.is_empty() {
            return Ok(());
        }
        let ids: Vec<i64> = posters.iter().map(|poster| poster.id).collect();
        self.store.remove(&ids)?;
        for poster in posters {
            if let Err(err) = fs::remove_file(&poster.file_path) {
                log::debug!("media: remove {}: {err}", poster.file_path);
            }
        }
        Ok(())
    }
}

const BODY_CHUNK: usize = 16 * 1024;

fn ensure_live(url: &str, cancel: &AtomicBool) -> Result<()> {
    if cancel.load(Ordering::SeqCst) {
        bail!("media: warm of {url} cancelled");
    }
    Ok(())
}

fn is_fresh(poster: &CachedPoster, ttl: Duration, now: DateTime<Utc>) -> bool {
    !ttl.is_zero()
        && chrono::Duration::from_std(ttl)
            .ok()
            .and_then(|ttl| poster.fetched_at.checked_add_signed(ttl))
            .is_some_and(|expiry| now < expiry)
}

pub fn default_cache_dir() -> Option<PathBuf> {
    dirs::cache_dir().map(|dir| dir.join("artfeed").join("posters"))
}

fn sha1_hex(data: &[u8]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Used when the server sends no content type.
fn sniff_content_type(bytes: &[u8]) -> String {
    match image::guess_format(bytes) {
        Ok(ImageFormat::Jpeg) => "image/jpeg".into(),
        Ok(ImageFormat::Png) => "image/png".into(),
        Ok(ImageFormat::Gif) => "image/gif".into(),
        Ok(ImageFormat::WebP) => "image/webp".into(),
        _ => tree_magic_mini::from_u8(&bytes[..bytes.len().min(512)]).to_string(),
    }
}
