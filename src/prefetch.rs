use std::collections::{BTreeSet, HashMap};
use std::ops::Range;

use crate::error::FeedError;
use crate::feed::FeedItem;
use crate::source::MediaSource;

/// An in-flight warm request.
pub trait WarmJob: Send {
    /// `None` while still running.
    fn poll(&mut self) -> Option<Result<(), String>>;
    fn cancel(&self);
}

pub trait Warmer: Send + Sync {
    fn warm(&self, url: &str) -> Box<dyn WarmJob>;
}

/// `[active - radius, active + radius]` clamped to `[0, len)`. Empty when
/// nothing is active.
pub fn window(active: Option<usize>, len: usize, radius: usize) -> Range<usize> {
    match active {
        Some(active) if active < len => {
            let start = active.saturating_sub(radius);
            let end = active.saturating_add(radius).saturating_add(1).min(len);
            start..end
        }
        _ => 0..0,
    }
}

enum WarmState {
    InFlight(Box<dyn WarmJob>),
    Warm,
    /// Nothing to fetch for this item.
    Empty,
    Failed(FeedError),
}

/// The warm set: ids of items around the active one whose poster has been
/// (or is being) prefetched. Membership is a pure sliding-window diff.
pub struct PrefetchCache {
    radius: usize,
    entries: HashMap<String, WarmState>,
}

impl PrefetchCache {
    pub fn new(radius: usize) -> Self {
        Self {
            radius,
            entries: HashMap::new(),
        }
    }

    /// Recomputes the window around `active`: evicts (and cancels) entries
    /// that fell out, issues warm requests for items that entered.
    pub fn shift(
        &mut self,
        items: &[FeedItem],
        active: Option<usize>,
        source: &dyn MediaSource,
        warmer: &dyn Warmer,
    ) {
        let range = window(active, items.len(), self.radius);
        let in_window = &items[range];

        self.entries.retain(|id, state| {
            let keep = in_window.iter().any(|item| item.id == *id);
            if !keep {
                match state {
                    WarmState::InFlight(job) => {
                        job.cancel();
                        log::debug!("prefetch: cancelled in-flight warm of {id}");
                    }
                    WarmState::Failed(err) => {
                        log::debug!("prefetch: {id} left the window, dropping failure ({err})");
                    }
                    WarmState::Warm | WarmState::Empty => {}
                }
            }
            keep
        });

        for item in in_window {
            if self.entries.contains_key(&item.id) {
                continue;
            }
            let state = match &item.poster_avatar_ref {
                None => WarmState::Empty,
                Some(avatar) => match source.resolve_url(avatar) {
                    Ok(url) => WarmState::InFlight(warmer.warm(&url)),
                    Err(err) => failed(&item.id, format!("cannot resolve poster: {err:#}")),
                },
            };
            self.entries.insert(item.id.clone(), state);
        }
    }

    /// Collects finished warm requests. Failures are only logged.
    pub fn poll(&mut self) -> bool {
        let mut changed = false;
        for (id, state) in self.entries.iter_mut() {
            let WarmState::InFlight(job) = state else {
                continue;
            };
            match job.poll() {
                None => {}
                Some(Ok(())) => {
                    *state = WarmState::Warm;
                    changed = true;
                }
                Some(Err(message)) => {
                    *state = failed(id, message);
                    changed = true;
                }
            }
        }
        changed
    }

    pub fn ids(&self) -> BTreeSet<String> {
        self.entries.keys().cloned().collect()
    }

    pub fn is_warm(&self, id: &str) -> bool {
        matches!(self.entries.get(id), Some(WarmState::Warm))
    }

    /// Cancels everything, e.g. on teardown or when the list is replaced.
    pub fn clear(&mut self) {
        for state in self.entries.values() {
            if let WarmState::InFlight(job) = state {
                job.cancel();
            }
        }
        self.entries.clear();
    }
}

fn failed(item_id: &str, message: String) -> WarmState {
    let err = FeedError::Prefetch {
        item_id: item_id.to_string(),
        message,
    };
    log::debug!("prefetch: {err}");
    WarmState::Failed(err)
}

impl Drop for PrefetchCache {
    fn drop(&mut self) {
        self.clear();
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    use crossbeam_channel::{unbounded, Receiver, Sender};
    use parking_lot::Mutex;

    use super::*;

    pub struct ManualJob {
        rx: Receiver<Result<(), String>>,
        cancelled: Arc<AtomicBool>,
    }

    impl WarmJob for ManualJob {
        fn poll(&mut self) -> Option<Result<(), String>> {
            if self.cancelled.load(Ordering::SeqCst) {
                return None;
            }
            self.rx.try_recv().ok()
        }

        fn cancel(&self) {
            self.cancelled.store(true, Ordering::SeqCst);
        }
    }

    pub struct Issued {
        pub url: String,
        pub done: Sender<Result<(), String>>,
        pub cancelled: Arc<AtomicBool>,
    }

    /// Warmer whose jobs complete only when the test says so.
    #[derive(Clone, Default)]
    pub struct ManualWarmer {
        pub issued: Arc<Mutex<Vec<Issued>>>,
    }

    impl ManualWarmer {
        pub fn urls(&self) -> Vec<String> {
            self.issued.lock().iter().map(|i| i.url.clone()).collect()
        }

        pub fn cancelled_urls(&self) -> Vec<String> {
            self.issued
                .lock()
                .iter()
                .filter(|i| i.cancelled.load(Ordering::SeqCst))
                .map(|i| i.url.clone())
                .collect()
        }

        pub fn complete(&self, url: &str, result: Result<(), String>) {
            for issued in self.issued.lock().iter().filter(|i| i.url == url) {
                let _ = issued.done.send(result.clone());
            }
        }
    }

    impl Warmer for ManualWarmer {
        fn warm(&self, url: &str) -> Box<dyn WarmJob> {
            let (tx, rx) = unbounded();
            let cancelled = Arc::new(AtomicBool::new(false));
            self.issued.lock().push(Issued {
                url: url.to_string(),
                done: tx,
                cancelled: cancelled.clone(),
            });
            Box::new(ManualJob { rx, cancelled })
        }
    }
}
