use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use crossbeam_channel::{bounded, Receiver, Sender};
use serde_json::{json, Value};

#[cfg(any(unix, target_os = "windows"))]
use rand::{distributions::Alphanumeric, Rng};
#[cfg(unix)]
use std::os::unix::net::UnixStream;

use crate::playback::{OpenRequest, Player, PlayerEvents, PlayerSession};

const POLL_INTERVAL: Duration = Duration::from_millis(30);
const QUERY_INTERVAL: Duration = Duration::from_millis(150);
const IPC_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
pub struct MpvOptions {
    pub mpv_path: String,
    /// Give up on a file that has not become playable in this long.
    pub load_timeout: Duration,
}

impl Default for MpvOptions {
    fn default() -> Self {
        Self {
            mpv_path: "mpv".to_string(),
            load_timeout: Duration::from_secs(20),
        }
    }
}

/// Plays each mounted item in its own paused, looping mpv process driven over
/// the JSON IPC socket.
#[derive(Debug, Clone, Default)]
pub struct MpvPlayer {
    opts: MpvOptions,
}

impl MpvPlayer {
    pub fn new(opts: MpvOptions) -> Self {
        Self { opts }
    }

    /// Whether the configured binary can be started at all.
    pub fn is_available(&self) -> bool {
        Command::new(&self.opts.mpv_path)
            .arg("--version")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|status| status.success())
            .unwrap_or(false)
    }
}

pub struct MpvSession {
    kill_tx: Sender<()>,
    done_rx: Receiver<()>,
    handle: Option<thread::JoinHandle<()>>,
    ipc_path: Option<String>,
}

impl MpvSession {
    fn command(&self, args: Value) -> Result<()> {
        let Some(path) = &self.ipc_path else {
            bail!("mpv controls are not supported on this platform");
        };
        ipc_request(path, &args).map(|_| ())
    }
}

impl PlayerSession for MpvSession {
    fn set_paused(&mut self, paused: bool) -> Result<()> {
        self.command(json!(["set_property", "pause", paused]))
    }

    fn set_muted(&mut self, muted: bool) -> Result<()> {
        self.command(json!(["set_property", "mute", muted]))
    }
}

impl Drop for MpvSession {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = self.kill_tx.send(());
            let _ = self.done_rx.recv();
            let _ = handle.join();
        }
    }
}

impl Player for MpvPlayer {
    fn open(&self, request: OpenRequest<'_>, events: PlayerEvents) -> Result<Box<dyn PlayerSession>> {
        if request.url.trim().is_empty() {
            bail!("video URL missing");
        }
        let ipc_path = unique_ipc_path();
        #[cfg(unix)]
        if let Some(path) = &ipc_path {
            if let Err(err) = fs::remove_file(path) {
                if err.kind() != std::io::ErrorKind::NotFound {
                    log::debug!("mpv: failed to remove stale ipc path {path}: {err}");
                }
            }
        }

        let args = mpv_args(&request, ipc_path.as_deref());
        log::debug!("mpv: spawning {} {:?}", self.opts.mpv_path, args);
        let debug_enabled = log::log_enabled!(log::Level::Debug);
        let mut command = Command::new(&self.opts.mpv_path);
        command
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(if debug_enabled {
                Stdio::piped()
            } else {
                Stdio::null()
            });
        let mut child = command
            .spawn()
            .with_context(|| format!("launch mpv to play {}", request.url))?;

        if let Some(stderr) = child.stderr.take() {
            let label = request.label.to_string();
            thread::spawn(move || {
                for line in BufReader::new(stderr).lines().map_while(Result::ok) {
                    log::debug!("mpv[{label}]: {line}");
                }
            });
        }

        let (kill_tx, kill_rx) = bounded::<()>(1);
        let (done_tx, done_rx) = bounded::<()>(1);
        let watch = Watch {
            child,
            ipc_path: ipc_path.clone(),
            events,
            load_timeout: self.opts.load_timeout,
        };
        let handle = thread::spawn(move || {
            watch.run(kill_rx);
            let _ = done_tx.send(());
        });

        Ok(Box::new(MpvSession {
            kill_tx,
            done_rx,
            handle: Some(handle),
            ipc_path,
        }))
    }
}

fn mpv_args(request: &OpenRequest<'_>, ipc_path: Option<&str>) -> Vec<String> {
    let mut args = vec![
        request.url.to_string(),
        "--pause".to_string(),
        format!("--mute={}", if request.muted { "yes" } else { "no" }),
        "--loop-file=inf".to_string(),
        "--force-window=yes".to_string(),
        "--keep-open=yes".to_string(),
        "--idle=no".to_string(),
        "--really-quiet".to_string(),
        "--terminal=no".to_string(),
        "--input-terminal=no".to_string(),
        "--no-config".to_string(),
        "--ytdl=no".to_string(),
    ];
    if let Some(path) = ipc_path {
        args.push(format!("--input-ipc-server={path}"));
    }
    if !request.label.is_empty() {
        args.push(format!("--force-media-title={}", request.label));
    }
    args
}

/// Owns the mpv child: reports readiness once the file is loaded and
/// failure if the process dies first.
struct Watch {
    child: Child,
    ipc_path: Option<String>,
    events: PlayerEvents,
    load_timeout: Duration,
}

impl Watch {
    fn run(mut self, kill_rx: Receiver<()>) {
        let started = Instant::now();
        let mut last_query: Option<Instant> = None;
        let mut ready = false;
        loop {
            if kill_rx.try_recv().is_ok() {
                let _ = self.child.kill();
                let _ = self.child.wait();
                log::debug!("mpv: mount {} stopped", self.events.mount_id());
                break;
            }

            match self.child.try_wait() {
                Ok(Some(status)) => {
                    log::debug!("mpv: mount {} exited with {status}", self.events.mount_id());
                    self.events.failed(format!("player exited ({status})"));
                    break;
                }
                Ok(None) => {}
                Err(err) => {
                    self.events.failed(format!("poll player: {err}"));
                    break;
                }
            }

            if !ready {
                let due = last_query.map_or(true, |at| at.elapsed() >= QUERY_INTERVAL);
                if due {
                    last_query = Some(Instant::now());
                    ready = match &self.ipc_path {
                        Some(path) => media_loaded(path),
                        // Without IPC there is nothing to wait on.
                        None => true,
                    };
                    if ready {
                        self.events.ready();
                    } else if started.elapsed() >= self.load_timeout {
                        self.events.failed("timed out waiting for media");
                        let _ = self.child.kill();
                        let _ = self.child.wait();
                        break;
                    }
                }
            }
            thread::sleep(POLL_INTERVAL);
        }
        if let Some(path) = &self.ipc_path {
            cleanup_ipc_path(path);
        }
    }
}

/// mpv only knows the duration once the demuxer opened the file.
fn media_loaded(path: &str) -> bool {
    match ipc_request(path, &json!(["get_property", "duration"])) {
        Ok(value) => value.get("data").map_or(false, |data| !data.is_null()),
        Err(_) => false,
    }
}

fn ipc_request(path: &str, command: &Value) -> Result<Value> {
    let payload = json!({ "command": command, "request_id": 1 });
    let serialized = serde_json::to_string(&payload).context("serialize mpv command")?;
    let reply = ipc_roundtrip(path, &serialized)?;
    let value: Value = serde_json::from_str(&reply).context("decode mpv reply")?;
    match value.get("error").and_then(Value::as_str) {
        Some("success") => Ok(value),
        Some(other) => Err(anyhow!("mpv: {other}")),
        None => Err(anyhow!("mpv: malformed reply")),
    }
}

/// Reads lines until the reply to our request shows up; mpv interleaves
/// unsolicited event lines.
fn read_reply(reader: impl BufRead) -> Result<String> {
    for line in reader.lines() {
        let line = line.context("read mpv IPC reply")?;
        let is_reply = line.contains("\"request_id\"") || line.contains("\"error\"");
        if is_reply && !line.contains("\"event\"") {
            return Ok(line);
        }
    }
    Err(anyhow!("mpv IPC closed without a reply"))
}

#[cfg(unix)]
fn ipc_roundtrip(path: &str, serialized: &str) -> Result<String> {
    let mut stream =
        UnixStream::connect(path).with_context(|| format!("connect to mpv IPC socket {path}"))?;
    stream.set_read_timeout(Some(IPC_TIMEOUT)).ok();
    stream.set_write_timeout(Some(IPC_TIMEOUT)).ok();
    stream
        .write_all(serialized.as_bytes())
        .context("write mpv IPC command")?;
    stream
        .write_all(b"\n")
        .context("write mpv IPC command terminator")?;
    read_reply(BufReader::new(stream))
}

#[cfg(target_os = "windows")]
fn ipc_roundtrip(path: &str, serialized: &str) -> Result<String> {
    use std::fs::OpenOptions;
    use std::io::ErrorKind;

    const PIPE_RETRIES: usize = 5;
    const PIPE_RETRY_DELAY: Duration = Duration::from_millis(100);

    for attempt in 0..PIPE_RETRIES {
        match OpenOptions::new().read(true).write(true).open(path) {
            Ok(mut pipe) => {
                pipe.write_all(serialized.as_bytes())
                    .with_context(|| format!("write mpv IPC command to {path}"))?;
                pipe.write_all(b"\n")
                    .with_context(|| format!("write mpv IPC command terminator to {path}"))?;
                pipe.flush().ok();
                return read_reply(BufReader::new(pipe));
            }
            Err(err) if err.kind() == ErrorKind::NotFound && attempt + 1 < PIPE_RETRIES => {
                thread::sleep(PIPE_RETRY_DELAY);
            }
            Err(err) => {
                return Err(anyhow!(err)).context(format!("connect to mpv IPC named pipe {path}"));
            }
        }
    }

    Err(anyhow!("connect to mpv IPC named pipe {}", path))
}

#[cfg(all(not(unix), not(target_os = "windows")))]
fn ipc_roundtrip(_path: &str, _serialized: &str) -> Result<String> {
    Err(anyhow!("mpv controls are not supported on this platform"))
}

#[cfg(unix)]
fn unique_ipc_path() -> Option<String> {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(10)
        .map(char::from)
        .collect();
    let mut path = std::env::temp_dir();
    path.push(format!("artfeed-mpv-{}-{suffix}.sock", std::process::id()));
    Some(path.to_string_lossy().to_string())
}

#[cfg(target_os = "windows")]
fn unique_ipc_path() -> Option<String> {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(10)
        .map(char::from)
        .collect();
    Some(format!(
        r"\\.\pipe\artfeed-mpv-{}-{suffix}",
        std::process::id()
    ))
}

#[cfg(all(not(unix), not(target_os = "windows")))]
fn unique_ipc_path() -> Option<String> {
    None
}

#[cfg(unix)]
fn cleanup_ipc_path(path: &str) {
    if let Err(err) = fs::remove_file(path) {
        if err.kind() != std::io::ErrorKind::NotFound {
            log::debug!("mpv: failed to remove ipc path {path}: {err}");
        }
    }
}

#[cfg(not(unix))]
fn cleanup_ipc_path(_path: &str) {}
