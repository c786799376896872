use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use crossbeam_channel::{unbounded, Receiver, Sender};

use crate::error::FeedError;
use crate::gesture::Gesture;
use crate::playback::{
    PlaybackStatus, PlaybackUnit, Player, PlayerEvents, PlayerNotice, PlayerSignal, Transition,
    UnitFlags,
};
use crate::prefetch::{self, PrefetchCache, Warmer};
use crate::source::{Cursor, MediaRef, MediaSource, Page};
use crate::viewport::{ViewportConfig, ViewportTracker, Visibility};

/// One video in the feed. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedItem {
    pub id: String,
    pub media_ref: MediaRef,
    pub poster_id: String,
    pub poster_avatar_ref: Option<MediaRef>,
}

/// Everything the feed knows. Only [`FeedController`] writes it.
#[derive(Debug, Clone)]
pub struct FeedState {
    /// Display order, newest first.
    pub items: Vec<FeedItem>,
    /// `None` when nothing is active (empty or not yet loaded).
    pub active_index: Option<usize>,
    pub is_muted: bool,
    pub is_focused: bool,
    pub page_cursor: Option<Cursor>,
    pub is_loading_more: bool,
    pub is_refreshing: bool,
    pub has_more: bool,
    pub last_error: Option<FeedError>,
    /// Bumped on every active-index change.
    pub transition: u64,
}

impl Default for FeedState {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            active_index: None,
            is_muted: true,
            is_focused: true,
            page_cursor: None,
            is_loading_more: false,
            is_refreshing: false,
            has_more: true,
            last_error: None,
            transition: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeedConfig {
    pub page_size: usize,
    /// Ask for the next page once the active item is this close to the end.
    pub preload_threshold: usize,
    pub render_radius: usize,
    pub prefetch_radius: usize,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            page_size: 10,
            preload_threshold: 2,
            render_radius: 1,
            prefetch_radius: 1,
        }
    }
}

/// Host-side navigation the feed can trigger.
pub trait NavigationHost {
    fn open_artist(&self, poster_id: &str) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedNotice {
    PageFailed(FeedError),
    PlaybackFailed(FeedError),
    DoubleTapped { item_id: String },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum LoadMode {
    Replace,
    Append,
}

struct PendingPage {
    request_id: u64,
    mode: LoadMode,
    cancel_flag: Arc<AtomicBool>,
}

struct PageResponse {
    request_id: u64,
    result: Result<Page>,
}

pub struct Options {
    pub config: FeedConfig,
    pub viewport: ViewportConfig,
    pub source: Arc<dyn MediaSource>,
    pub player: Arc<dyn Player>,
    pub warmer: Arc<dyn Warmer>,
    pub navigation: Option<Box<dyn NavigationHost>>,
}

/// Owns the ordered items, the active index, the global mute flag and
/// pagination, and drives the mounted playback units and the warm set.
///
/// Asynchronous work (page fetches, player readiness, poster downloads) runs
/// off-thread and is applied only from [`FeedController::poll`], so every
/// mutation happens on the thread that owns the controller.
pub struct FeedController {
    state: FeedState,
    config: FeedConfig,
    source: Arc<dyn MediaSource>,
    player: Arc<dyn Player>,
    warmer: Arc<dyn Warmer>,
    navigation: Option<Box<dyn NavigationHost>>,
    tracker: ViewportTracker,
    prefetch: PrefetchCache,
    units: HashMap<String, PlaybackUnit>,
    pending: Option<PendingPage>,
    next_request_id: u64,
    next_mount_id: u64,
    page_tx: Sender<PageResponse>,
    page_rx: Receiver<PageResponse>,
    player_tx: Sender<PlayerNotice>,
    player_rx: Receiver<PlayerNotice>,
    notices: Vec<FeedNotice>,
}

impl FeedController {
    pub fn new(opts: Options) -> Self {
        let (page_tx, page_rx) = unbounded();
        let (player_tx, player_rx) = unbounded();
        let mut config = opts.config;
        if config.page_size == 0 {
            config.page_size = FeedConfig::default().page_size;
        }
        Self {
            state: FeedState::default(),
            prefetch: PrefetchCache::new(config.prefetch_radius),
            config,
            source: opts.source,
            player: opts.player,
            warmer: opts.warmer,
            navigation: opts.navigation,
            tracker: ViewportTracker::new(opts.viewport),
            units: HashMap::new(),
            pending: None,
            next_request_id: 1,
            next_mount_id: 1,
            page_tx,
            page_rx,
            player_tx,
            player_rx,
            notices: Vec::new(),
        }
    }

    pub fn state(&self) -> &FeedState {
        &self.state
    }

    /// Requests the page at `cursor` and appends it. Ignored while another
    /// page request is in flight.
    pub fn load_page(&mut self, cursor: Option<Cursor>) -> bool {
        if self.state.is_loading_more || self.state.is_refreshing {
            log::debug!("feed: load_page ignored, a page request is already in flight");
            return false;
        }
        self.state.is_loading_more = true;
        self.spawn_fetch(LoadMode::Append, cursor);
        true
    }

    /// Replaces the whole sequence with a fresh first page. A refresh in
    /// flight makes further calls no-ops; an in-flight append is abandoned.
    pub fn refresh(&mut self) -> bool {
        if self.state.is_refreshing {
            log::debug!("feed: refresh ignored, one is already in flight");
            return false;
        }
        if let Some(pending) = self.pending.take() {
            pending.cancel_flag.store(true, Ordering::SeqCst);
            log::debug!("feed: refresh supersedes request {}", pending.request_id);
        }
        self.state.is_loading_more = false;
        self.state.is_refreshing = true;
        self.spawn_fetch(LoadMode::Replace, None);
        true
    }

    pub fn request_next_page(&mut self) -> bool {
        if !self.state.has_more || self.state.is_loading_more || self.state.is_refreshing {
            return false;
        }
        let cursor = self.state.page_cursor.clone();
        if cursor.is_none() && !self.state.items.is_empty() {
            return false;
        }
        self.load_page(cursor)
    }

    /// Clears a surfaced page-load error.
    pub fn dismiss_error(&mut self) {
        self.state.last_error = None;
    }

    fn spawn_fetch(&mut self, mode: LoadMode, cursor: Option<Cursor>) {
        let request_id = self.next_request_id;
        self.next_request_id = self.next_request_id.wrapping_add(1);
        let cancel_flag = Arc::new(AtomicBool::new(false));
        self.pending = Some(PendingPage {
            request_id,
            mode,
            cancel_flag: cancel_flag.clone(),
        });
        log::debug!("feed: request {request_id} ({mode:?}) cursor={cursor:?}");

        let tx = self.page_tx.clone();
        let source = self.source.clone();
        let page_size = self.config.page_size;
        thread::spawn(move || {
            if cancel_flag.load(Ordering::SeqCst) {
                return;
            }
            let result = source
                .fetch_page(cursor.as_ref(), page_size)
                .context("fetch feed page");
            if cancel_flag.load(Ordering::SeqCst) {
                return;
            }
            let _ = tx.send(PageResponse { request_id, result });
        });
    }

    /// Sets the active item. Pauses the previous unit before the new one
    /// may start, re-centres the render and warm windows, and asks for more
    /// items when close to the end.
    pub fn set_active_index(&mut self, index: Option<usize>) -> Result<bool> {
        if let Some(index) = index {
            if index >= self.state.items.len() {
                bail!(
                    "feed: active index {index} out of range ({} items)",
                    self.state.items.len()
                );
            }
        }
        self.tracker.acknowledge(index);
        if index == self.state.active_index {
            return Ok(false);
        }

        self.state.transition = self.state.transition.wrapping_add(1);
        let previous = self.state.active_index.and_then(|i| self.item_id(i));
        self.state.active_index = index;
        log::debug!(
            "feed: active index -> {index:?} (transition {})",
            self.state.transition
        );

        if let Some(previous) = previous {
            let step = self
                .units
                .get_mut(&previous)
                .map(|unit| unit.set_active(false));
            self.absorb(step);
        }

        self.sync_render_window();

        if let Some(current) = index.and_then(|i| self.item_id(i)) {
            let step = self
                .units
                .get_mut(&current)
                .map(|unit| unit.set_active(true));
            self.absorb(step);
        }

        self.prefetch.shift(
            &self.state.items,
            self.state.active_index,
            self.source.as_ref(),
            self.warmer.as_ref(),
        );
        self.maybe_request_more();
        Ok(true)
    }

    /// Feeds a visibility snapshot through the viewport tracker.
    pub fn on_visibility(&mut self, visible: &[Visibility], now: Instant) -> Option<usize> {
        let index = self.tracker.update(visible, now)?;
        self.apply_reported(index)
    }

    /// Lets a pending dwell complete without new scroll input.
    pub fn tick(&mut self, now: Instant) -> Option<usize> {
        let index = self.tracker.tick(now)?;
        self.apply_reported(index)
    }

    fn apply_reported(&mut self, index: usize) -> Option<usize> {
        match self.set_active_index(Some(index)) {
            Ok(true) => Some(index),
            Ok(false) => None,
            Err(err) => {
                log::debug!("feed: ignoring viewport report: {err:#}");
                None
            }
        }
    }

    pub fn toggle_mute(&mut self) -> bool {
        let muted = !self.state.is_muted;
        self.set_muted(muted);
        muted
    }

    pub fn set_muted(&mut self, muted: bool) {
        self.state.is_muted = muted;
        let mut failures = Vec::new();
        for unit in self.units.values_mut() {
            if let Err(err) = unit.set_muted(muted) {
                failures.push(err);
            }
        }
        for err in failures {
            self.report_playback(err);
        }
    }

    /// Screen focus from the navigation host. Losing focus pauses every unit
    /// and drops any long-press override.
    pub fn set_focused(&mut self, focused: bool) {
        if self.state.is_focused == focused {
            return;
        }
        self.state.is_focused = focused;
        log::debug!("feed: focus -> {focused}");
        let mut failures = Vec::new();
        for unit in self.units.values_mut() {
            if let Err(err) = unit.set_focused(focused) {
                failures.push(err);
            }
        }
        for err in failures {
            self.report_playback(err);
        }
    }

    /// Long-press override on the item at `index`.
    pub fn set_user_override(&mut self, index: usize, pressed: bool) -> Option<Transition> {
        let id = self.item_id(index)?;
        let step = self
            .units
            .get_mut(&id)
            .map(|unit| unit.set_user_override(pressed));
        self.absorb(step)
    }

    pub fn apply_gesture(&mut self, index: usize, gesture: Gesture) {
        match gesture {
            Gesture::Tap => {
                self.toggle_mute();
            }
            Gesture::DoubleTap => {
                if let Some(item_id) = self.item_id(index) {
                    self.notices.push(FeedNotice::DoubleTapped { item_id });
                }
            }
            Gesture::LongPressStart => {
                self.set_user_override(index, true);
            }
            Gesture::LongPressEnd => {
                self.set_user_override(index, false);
            }
        }
    }

    /// Opens the artist who posted the item at `index`.
    pub fn open_poster(&self, index: usize) -> Result<()> {
        let Some(item) = self.state.items.get(index) else {
            bail!("feed: no item at index {index}");
        };
        let Some(navigation) = self.navigation.as_ref() else {
            bail!("feed: no navigation host attached");
        };
        navigation.open_artist(&item.poster_id)
    }

    /// Applies every completion that has arrived. Returns whether anything
    /// changed.
    pub fn poll(&mut self) -> bool {
        let mut changed = false;
        while let Ok(response) = self.page_rx.try_recv() {
            changed |= self.handle_page(response);
        }
        while let Ok(notice) = self.player_rx.try_recv() {
            changed |= self.handle_player(notice);
        }
        changed |= self.prefetch.poll();
        changed
    }

    /// Blocks up to `timeout` for the next completion, then drains the rest.
    pub fn poll_timeout(&mut self, timeout: Duration) -> bool {
        enum Incoming {
            Page(PageResponse),
            Player(PlayerNotice),
        }
        let incoming = crossbeam_channel::select! {
            recv(self.page_rx) -> msg => msg.ok().map(Incoming::Page),
            recv(self.player_rx) -> msg => msg.ok().map(Incoming::Player),
            default(timeout) => None,
        };
        let first = match incoming {
            Some(Incoming::Page(response)) => self.handle_page(response),
            Some(Incoming::Player(notice)) => self.handle_player(notice),
            None => false,
        };
        self.poll() || first
    }

    fn handle_page(&mut self, response: PageResponse) -> bool {
        let Some(pending) = &self.pending else {
            return false;
        };
        if pending.request_id != response.request_id || pending.cancel_flag.load(Ordering::SeqCst) {
            log::debug!("feed: discarding stale page response {}", response.request_id);
            return false;
        }
        let mode = pending.mode;
        self.pending = None;
        match mode {
            LoadMode::Replace => self.state.is_refreshing = false,
            LoadMode::Append => self.state.is_loading_more = false,
        }

        match response.result {
            Ok(page) => self.apply_page(mode, page),
            Err(err) => {
                log::warn!("feed: page load failed: {err:#}");
                let error = FeedError::page_load(&err);
                self.state.last_error = Some(error.clone());
                self.notices.push(FeedNotice::PageFailed(error));
            }
        }
        true
    }

    fn apply_page(&mut self, mode: LoadMode, page: Page) {
        let Page {
            items,
            next_cursor,
            has_more,
            fetched,
        } = page;
        self.state.has_more = has_more && fetched >= self.config.page_size;
        self.state.page_cursor = next_cursor;
        self.state.last_error = None;

        match mode {
            LoadMode::Replace => {
                let mut seen = HashSet::new();
                let items: Vec<FeedItem> = items
                    .into_iter()
                    .filter(|item| seen.insert(item.id.clone()))
                    .collect();
                log::info!("feed: refreshed with {} item(s)", items.len());
                // Release every unit of the old sequence before swapping it out.
                if let Err(err) = self.set_active_index(None) {
                    log::debug!("feed: {err:#}");
                }
                self.state.items = items;
                self.tracker.reset();
            }
            LoadMode::Append => {
                let mut seen: HashSet<String> =
                    self.state.items.iter().map(|item| item.id.clone()).collect();
                let before = self.state.items.len();
                for item in items {
                    if seen.insert(item.id.clone()) {
                        self.state.items.push(item);
                    } else {
                        log::debug!("feed: dropping duplicate item {}", item.id);
                    }
                }
                log::debug!(
                    "feed: appended {} item(s)",
                    self.state.items.len() - before
                );
            }
        }

        if self.state.active_index.is_none() && !self.state.items.is_empty() {
            // Fresh sequence: the first item becomes active.
            let _ = self.set_active_index(Some(0));
        } else {
            self.sync_render_window();
            self.prefetch.shift(
                &self.state.items,
                self.state.active_index,
                self.source.as_ref(),
                self.warmer.as_ref(),
            );
        }
    }

    fn handle_player(&mut self, notice: PlayerNotice) -> bool {
        let Some(unit) = self
            .units
            .values_mut()
            .find(|unit| unit.mount_id() == notice.mount_id)
        else {
            log::debug!("feed: ignoring event for unmounted player {}", notice.mount_id);
            return false;
        };
        let step = match notice.signal {
            PlayerSignal::Ready => unit.on_ready(),
            PlayerSignal::Failed(message) => Err(unit.fail(message)),
        };
        self.absorb(Some(step));
        true
    }

    fn maybe_request_more(&mut self) {
        let Some(active) = self.state.active_index else {
            return;
        };
        let remaining = self
            .state
            .items
            .len()
            .saturating_sub(active.saturating_add(1));
        if remaining > self.config.preload_threshold {
            return;
        }
        if self.request_next_page() {
            log::debug!("feed: {remaining} item(s) left, requesting next page");
        }
    }

    /// Mounts units for items entering the render window and drops the ones
    /// that left it.
    fn sync_render_window(&mut self) {
        let range = prefetch::window(
            self.state.active_index,
            self.state.items.len(),
            self.config.render_radius,
        );
        let wanted: HashSet<String> = self.state.items[range.clone()]
            .iter()
            .map(|item| item.id.clone())
            .collect();
        self.units.retain(|id, _| wanted.contains(id));

        for index in range {
            let id = self.state.items[index].id.clone();
            if self.units.contains_key(&id) {
                continue;
            }
            self.mount(index);
        }
    }

    fn mount(&mut self, index: usize) {
        let item = self.state.items[index].clone();
        let mount_id = self.next_mount_id;
        self.next_mount_id = self.next_mount_id.wrapping_add(1);
        let active = self.state.active_index == Some(index);
        let mut unit = PlaybackUnit::new(
            item.id.clone(),
            mount_id,
            UnitFlags {
                active,
                muted: self.state.is_muted,
                focused: self.state.is_focused,
            },
        );
        let step = match self.source.resolve_url(&item.media_ref) {
            Ok(url) => {
                let events = PlayerEvents::new(mount_id, self.player_tx.clone());
                unit.load(self.player.as_ref(), &url, events)
            }
            Err(err) => Err(unit.fail(format!("{err:#}"))),
        };
        log::debug!("feed: mounted {} as {mount_id}", item.id);
        self.units.insert(item.id, unit);
        self.absorb(Some(step));
    }

    fn absorb(
        &mut self,
        step: Option<Result<Option<Transition>, FeedError>>,
    ) -> Option<Transition> {
        match step {
            Some(Ok(transition)) => transition,
            Some(Err(err)) => {
                self.report_playback(err);
                None
            }
            None => None,
        }
    }

    fn report_playback(&mut self, err: FeedError) {
        log::warn!("feed: {err}");
        self.notices.push(FeedNotice::PlaybackFailed(err));
    }

    fn item_id(&self, index: usize) -> Option<String> {
        self.state.items.get(index).map(|item| item.id.clone())
    }

    pub fn drain_notices(&mut self) -> Vec<FeedNotice> {
        std::mem::take(&mut self.notices)
    }

    pub fn unit_status(&self, item_id: &str) -> Option<PlaybackStatus> {
        self.units.get(item_id).map(PlaybackUnit::status)
    }

    pub fn unit(&self, item_id: &str) -> Option<&PlaybackUnit> {
        self.units.get(item_id)
    }

    pub fn mounted_ids(&self) -> BTreeSet<String> {
        self.units.keys().cloned().collect()
    }

    pub fn playing_count(&self) -> usize {
        self.units
            .values()
            .filter(|unit| unit.status() == PlaybackStatus::Playing)
            .count()
    }

    pub fn warm_ids(&self) -> BTreeSet<String> {
        self.prefetch.ids()
    }

    pub fn is_warm(&self, item_id: &str) -> bool {
        self.prefetch.is_warm(item_id)
    }
}

impl Drop for FeedController {
    fn drop(&mut self) {
        if let Some(pending) = self.pending.take() {
            pending.cancel_flag.store(true, Ordering::SeqCst);
        }
        self.prefetch.clear();
        self.units.clear();
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use anyhow::anyhow;
    use crossbeam_channel::{unbounded, Receiver, Sender};
    use parking_lot::Mutex;

    use super::*;
    use crate::playback::testing::{Call, ScriptedPlayer};
    use crate::playback::HeadlessPlayer;
    use crate::prefetch::testing::ManualWarmer;

    const WAIT: Duration = Duration::from_secs(5);

    /// Source whose fetches block until the test supplies a reply.
    struct StepSource {
        calls: Mutex<Vec<Option<String>>>,
        replies: Receiver<Result<Page, String>>,
    }

    impl MediaSource for StepSource {
        fn fetch_page(&self, cursor: Option<&Cursor>, _page_size: usize) -> Result<Page> {
            self.calls
                .lock()
                .push(cursor.map(|c| c.as_str().to_string()));
            match self.replies.recv_timeout(WAIT) {
                Ok(Ok(page)) => Ok(page),
                Ok(Err(message)) => Err(anyhow!(message)),
                Err(_) => Err(anyhow!("no scripted reply")),
            }
        }

        fn resolve_url(&self, media: &MediaRef) -> Result<String> {
            if media.as_str().starts_with("broken") {
                return Err(anyhow!("object not found"));
            }
            Ok(format!("https://cdn.test/{media}"))
        }
    }

    fn item(id: &str) -> FeedItem {
        FeedItem {
            id: id.into(),
            media_ref: MediaRef::new(format!("videos/{id}.mp4")),
            poster_id: format!("artist-{id}"),
            poster_avatar_ref: Some(MediaRef::new(format!("images/{id}.jpg"))),
        }
    }

    fn page(ids: &[&str], next: Option<&str>, has_more: bool) -> Page {
        Page {
            items: ids.iter().map(|id| item(id)).collect(),
            next_cursor: next.map(Cursor::new),
            has_more,
            fetched: ids.len(),
        }
    }

    struct Harness {
        feed: FeedController,
        source: Arc<StepSource>,
        replies: Sender<Result<Page, String>>,
        warmer: ManualWarmer,
    }

    fn harness_with(player: Arc<dyn Player>, config: FeedConfig) -> Harness {
        let (replies, rx) = unbounded();
        let source = Arc::new(StepSource {
            calls: Mutex::new(Vec::new()),
            replies: rx,
        });
        let warmer = ManualWarmer::default();
        let feed = FeedController::new(Options {
            config,
            viewport: ViewportConfig::default(),
            source: source.clone(),
            player,
            warmer: Arc::new(warmer.clone()),
            navigation: None,
        });
        Harness {
            feed,
            source,
            replies,
            warmer,
        }
    }

    fn harness(page_size: usize) -> Harness {
        harness_with(
            Arc::new(HeadlessPlayer),
            FeedConfig {
                page_size,
                ..FeedConfig::default()
            },
        )
    }

    impl Harness {
        /// Answers the blocked fetch and waits until the controller applied it.
        fn reply(&mut self, page: Result<Page, String>) {
            let refreshing = self.feed.state().is_refreshing;
            self.replies.send(page).unwrap();
            let deadline = Instant::now() + WAIT;
            while Instant::now() < deadline {
                let state = self.feed.state();
                let waiting = if refreshing {
                    state.is_refreshing
                } else {
                    state.is_loading_more
                };
                if !waiting {
                    break;
                }
                self.feed.poll_timeout(Duration::from_millis(20));
            }
            // Drain the player readiness produced by any new mounts.
            self.feed.poll();
        }

        fn wait_for_calls(&self, n: usize) {
            let deadline = Instant::now() + WAIT;
            while self.source.calls.lock().len() < n && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(5));
            }
            assert_eq!(self.source.calls.lock().len(), n);
        }

        fn ids(&self) -> Vec<String> {
            self.feed.state().items.iter().map(|i| i.id.clone()).collect()
        }

        fn calls(&self) -> Vec<Option<String>> {
            self.source.calls.lock().clone()
        }
    }

    fn set(list: &[&str]) -> BTreeSet<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn first_page_activates_first_item() {
        let mut h = harness(3);
        assert!(h.feed.refresh());
        h.reply(Ok(page(&["a", "b", "c"], Some("3"), true)));
        let state = h.feed.state();
        assert_eq!(state.active_index, Some(0));
        assert!(state.has_more);
        assert_eq!(state.page_cursor, Some(Cursor::new("3")));
        assert_eq!(h.feed.unit_status("a"), Some(PlaybackStatus::Playing));
        assert_eq!(h.feed.unit_status("b"), Some(PlaybackStatus::Paused));
        assert_eq!(h.feed.unit_status("c"), None);
        assert_eq!(h.feed.warm_ids(), set(&["a", "b"]));
    }

    #[test]
    fn refresh_twice_issues_one_fetch() {
        let mut h = harness(2);
        assert!(h.feed.refresh());
        assert!(!h.feed.refresh());
        assert!(h.feed.state().is_refreshing);
        h.reply(Ok(page(&["a", "b"], None, false)));
        assert_eq!(h.calls(), vec![None]);
        assert!(!h.feed.state().is_refreshing);
        assert!(h.feed.refresh());
    }

    #[test]
    fn refresh_replaces_rather_than_merges() {
        let mut h = harness(2);
        h.feed.refresh();
        h.reply(Ok(page(&["a", "b"], None, false)));
        h.feed.set_active_index(Some(1)).unwrap();
        h.feed.refresh();
        h.reply(Ok(page(&["z", "a"], None, false)));
        assert_eq!(h.ids(), vec!["z", "a"]);
        assert_eq!(h.feed.state().active_index, Some(0));
        assert_eq!(h.feed.unit_status("z"), Some(PlaybackStatus::Playing));
        assert_eq!(h.feed.playing_count(), 1);
    }

    #[test]
    fn refresh_to_empty_clears_active() {
        let mut h = harness(2);
        h.feed.refresh();
        h.reply(Ok(page(&["a", "b"], None, false)));
        h.feed.refresh();
        h.reply(Ok(page(&[], None, false)));
        assert_eq!(h.feed.state().active_index, None);
        assert!(h.feed.mounted_ids().is_empty());
        assert!(h.feed.warm_ids().is_empty());
    }

    #[test]
    fn next_page_is_guarded_while_loading() {
        let mut h = harness(2);
        h.feed.refresh();
        h.reply(Ok(page(&["a", "b"], Some("2"), true)));
        // Active index 0 with two items is already inside the preload threshold.
        assert!(h.feed.state().is_loading_more);
        assert!(!h.feed.request_next_page());
        assert!(!h.feed.load_page(Some(Cursor::new("2"))));
        h.reply(Ok(page(&["c", "d"], Some("4"), true)));
        assert_eq!(h.ids(), vec!["a", "b", "c", "d"]);
        assert_eq!(h.calls(), vec![None, Some("2".to_string())]);
    }

    #[test]
    fn short_page_ends_pagination() {
        let mut h = harness(3);
        h.feed.refresh();
        h.reply(Ok(page(&["a", "b"], Some("2"), true)));
        assert!(!h.feed.state().has_more);
        assert!(!h.feed.request_next_page());
        assert_eq!(h.calls().len(), 1);
    }

    #[test]
    fn appended_duplicates_are_dropped() {
        let mut h = harness_with(
            Arc::new(HeadlessPlayer),
            FeedConfig {
                page_size: 2,
                preload_threshold: 0,
                ..FeedConfig::default()
            },
        );
        h.feed.refresh();
        h.reply(Ok(page(&["a", "b"], Some("2"), true)));
        assert!(h.feed.request_next_page());
        h.reply(Ok(page(&["b", "c"], Some("4"), true)));
        assert_eq!(h.ids(), vec!["a", "b", "c"]);
    }

    #[test]
    fn page_failure_keeps_items_and_is_dismissible() {
        let mut h = harness_with(
            Arc::new(HeadlessPlayer),
            FeedConfig {
                page_size: 2,
                preload_threshold: 0,
                ..FeedConfig::default()
            },
        );
        h.feed.refresh();
        h.reply(Ok(page(&["a", "b"], Some("2"), true)));
        h.feed.request_next_page();
        h.reply(Err("gateway timeout".into()));
        let state = h.feed.state();
        assert_eq!(h.ids(), vec!["a", "b"]);
        assert!(!state.is_loading_more);
        assert!(matches!(state.last_error, Some(FeedError::PageLoad(ref m)) if m.contains("gateway timeout")));
        assert_eq!(state.active_index, Some(0));
        let notices = h.feed.drain_notices();
        assert!(matches!(notices.as_slice(), [FeedNotice::PageFailed(_)]));
        h.feed.dismiss_error();
        assert!(h.feed.state().last_error.is_none());
        // No automatic retry happened.
        assert_eq!(h.calls().len(), 2);
    }

    #[test]
    fn refresh_abandons_inflight_append() {
        let mut h = harness(2);
        h.feed.refresh();
        h.reply(Ok(page(&["a", "b"], Some("2"), true)));
        assert!(h.feed.state().is_loading_more);
        h.wait_for_calls(2);
        // The append fetch gets its answer, but the refresh supersedes it.
        h.replies.send(Ok(page(&["c", "d"], Some("4"), true))).unwrap();
        let deadline = Instant::now() + WAIT;
        while !h.replies.is_empty() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(h.feed.refresh());
        assert!(!h.feed.state().is_loading_more);
        h.reply(Ok(page(&["x", "y"], None, false)));
        h.feed.poll();
        assert_eq!(h.ids(), vec!["x", "y"]);
        assert_eq!(h.feed.playing_count(), 1);
    }

    #[test]
    fn switching_active_pauses_old_before_playing_new() {
        let player = ScriptedPlayer::default();
        let mut h = harness_with(Arc::new(player.clone()), FeedConfig::default());
        h.feed.refresh();
        h.reply(Ok(page(&["a", "b", "c"], None, false)));
        for events in player.events.lock().iter() {
            events.ready();
        }
        h.feed.poll();
        assert_eq!(h.feed.unit_status("a"), Some(PlaybackStatus::Playing));
        player.calls.lock().clear();

        h.feed.set_active_index(Some(1)).unwrap();
        assert_eq!(
            player.calls.lock().clone(),
            vec![Call::Paused(true), Call::Open {
                url: "https://cdn.test/videos/c.mp4".into(),
                muted: true
            }, Call::Paused(false)]
        );
        assert_eq!(h.feed.unit_status("a"), Some(PlaybackStatus::Paused));
        assert_eq!(h.feed.unit_status("b"), Some(PlaybackStatus::Playing));
        assert_eq!(h.feed.playing_count(), 1);
    }

    #[test]
    fn at_most_one_unit_plays_through_rapid_switching() {
        let mut h = harness(10);
        h.feed.refresh();
        let ids: Vec<String> = (0..10).map(|i| format!("v{i}")).collect();
        let refs: Vec<&str> = ids.iter().map(String::as_str).collect();
        h.reply(Ok(page(&refs, None, false)));
        for index in [3, 4, 2, 9, 0, 1, 8, 7] {
            h.feed.set_active_index(Some(index)).unwrap();
            assert!(h.feed.playing_count() <= 1);
            h.feed.poll();
            assert!(h.feed.playing_count() <= 1);
            assert_eq!(h.feed.unit_status(&ids[index]), Some(PlaybackStatus::Playing));
        }
    }

    #[test]
    fn stale_ready_does_not_play_deactivated_unit() {
        let player = ScriptedPlayer::default();
        let mut h = harness_with(Arc::new(player.clone()), FeedConfig::default());
        h.feed.refresh();
        h.reply(Ok(page(&["a", "b", "c"], None, false)));
        // "a" is still loading when the user moves on.
        h.feed.set_active_index(Some(1)).unwrap();
        for events in player.events.lock().iter() {
            events.ready();
        }
        h.feed.poll();
        assert_eq!(h.feed.unit_status("a"), Some(PlaybackStatus::Paused));
        assert_eq!(h.feed.unit_status("b"), Some(PlaybackStatus::Playing));
        assert_eq!(h.feed.playing_count(), 1);
    }

    #[test]
    fn events_for_unmounted_units_are_ignored() {
        let player = ScriptedPlayer::default();
        let mut h = harness_with(Arc::new(player.clone()), FeedConfig::default());
        h.feed.refresh();
        h.reply(Ok(page(&["a", "b", "c", "d"], None, false)));
        let first_a = player.events.lock()[0].clone();
        h.feed.set_active_index(Some(3)).unwrap();
        assert!(!h.feed.mounted_ids().contains("a"));
        first_a.failed("late failure");
        assert!(!h.feed.poll());
        assert!(h.feed.drain_notices().is_empty());
    }

    #[test]
    fn invalid_index_is_rejected() {
        let mut h = harness(2);
        h.feed.refresh();
        h.reply(Ok(page(&["a", "b"], None, false)));
        assert!(h.feed.set_active_index(Some(2)).is_err());
        assert_eq!(h.feed.state().active_index, Some(0));
        assert!(!h.feed.set_active_index(Some(0)).unwrap());
        assert!(h.feed.set_active_index(None).unwrap());
        assert_eq!(h.feed.playing_count(), 0);
    }

    #[test]
    fn mute_is_global_and_applies_to_new_mounts() {
        let player = ScriptedPlayer::default();
        let mut h = harness_with(Arc::new(player.clone()), FeedConfig::default());
        h.feed.refresh();
        h.reply(Ok(page(&["a", "b", "c", "d"], None, false)));
        assert!(h.feed.state().is_muted);
        assert!(!h.feed.toggle_mute());
        let muted_calls = player
            .calls
            .lock()
            .iter()
            .filter(|call| **call == Call::Muted(false))
            .count();
        assert_eq!(muted_calls, 2);
        assert!(h.feed.mounted_ids().iter().all(|id| !h.feed.unit(id).unwrap().is_muted()));

        h.feed.set_active_index(Some(2)).unwrap();
        let opened_d = player.calls.lock().iter().any(|call| {
            *call
                == Call::Open {
                    url: "https://cdn.test/videos/d.mp4".into(),
                    muted: false,
                }
        });
        assert!(opened_d);
    }

    #[test]
    fn long_press_overrides_without_changing_active() {
        let mut h = harness(3);
        h.feed.refresh();
        h.reply(Ok(page(&["a", "b", "c"], None, false)));
        h.feed.apply_gesture(0, Gesture::LongPressStart);
        assert_eq!(h.feed.unit_status("a"), Some(PlaybackStatus::Paused));
        assert_eq!(h.feed.state().active_index, Some(0));
        assert!(h.feed.unit("a").unwrap().is_user_overridden());
        h.feed.apply_gesture(0, Gesture::LongPressEnd);
        assert_eq!(h.feed.unit_status("a"), Some(PlaybackStatus::Playing));
    }

    #[test]
    fn release_after_moving_on_does_not_resume() {
        let mut h = harness(3);
        h.feed.refresh();
        h.reply(Ok(page(&["a", "b", "c"], None, false)));
        h.feed.apply_gesture(0, Gesture::LongPressStart);
        h.feed.set_active_index(Some(1)).unwrap();
        h.feed.apply_gesture(0, Gesture::LongPressEnd);
        assert_eq!(h.feed.unit_status("a"), Some(PlaybackStatus::Paused));
        assert_eq!(h.feed.unit_status("b"), Some(PlaybackStatus::Playing));
    }

    #[test]
    fn taps_toggle_mute_and_double_taps_notify() {
        let mut h = harness(3);
        h.feed.refresh();
        h.reply(Ok(page(&["a", "b", "c"], None, false)));
        h.feed.apply_gesture(0, Gesture::Tap);
        assert!(!h.feed.state().is_muted);
        h.feed.apply_gesture(0, Gesture::DoubleTap);
        assert!(!h.feed.state().is_muted);
        assert_eq!(
            h.feed.drain_notices(),
            vec![FeedNotice::DoubleTapped {
                item_id: "a".into()
            }]
        );
    }

    #[test]
    fn blur_pauses_everything_until_focus_returns() {
        let mut h = harness(3);
        h.feed.refresh();
        h.reply(Ok(page(&["a", "b", "c"], None, false)));
        h.feed.set_focused(false);
        assert_eq!(h.feed.playing_count(), 0);
        assert_eq!(h.feed.state().active_index, Some(0));
        h.feed.set_focused(true);
        assert_eq!(h.feed.unit_status("a"), Some(PlaybackStatus::Playing));
    }

    #[test]
    fn playback_errors_stay_with_their_item() {
        let mut h = harness(3);
        h.feed.refresh();
        let mut broken = page(&["a", "b", "c"], None, false);
        broken.items[1].media_ref = MediaRef::new("broken/b.mp4");
        h.reply(Ok(broken));
        assert_eq!(h.feed.unit_status("b"), Some(PlaybackStatus::Errored));
        assert_eq!(h.feed.unit_status("a"), Some(PlaybackStatus::Playing));
        assert!(h.feed.state().last_error.is_none());
        let notices = h.feed.drain_notices();
        assert!(matches!(
            notices.as_slice(),
            [FeedNotice::PlaybackFailed(FeedError::Playback { item_id, .. })] if item_id == "b"
        ));

        // Activating the errored item leaves it errored and nothing plays.
        h.feed.set_active_index(Some(1)).unwrap();
        assert_eq!(h.feed.unit_status("b"), Some(PlaybackStatus::Errored));
        assert_eq!(h.feed.playing_count(), 0);
        assert_eq!(h.feed.state().active_index, Some(1));
    }

    #[test]
    fn errored_unit_is_fresh_after_remount() {
        let player = ScriptedPlayer::default();
        let mut h = harness_with(Arc::new(player.clone()), FeedConfig::default());
        h.feed.refresh();
        h.reply(Ok(page(&["a", "b", "c", "d"], None, false)));
        player.events.lock()[0].failed("decode error");
        h.feed.poll();
        assert_eq!(h.feed.unit_status("a"), Some(PlaybackStatus::Errored));
        h.feed.set_active_index(Some(3)).unwrap();
        h.feed.set_active_index(Some(0)).unwrap();
        assert_eq!(h.feed.unit_status("a"), Some(PlaybackStatus::Loading));
    }

    #[test]
    fn viewport_dwell_drives_activation() {
        let mut h = harness(3);
        h.feed.refresh();
        h.reply(Ok(page(&["a", "b", "c"], None, false)));
        let t0 = Instant::now();
        assert_eq!(h.feed.on_visibility(&[Visibility::new(1, 0.9)], t0), None);
        assert_eq!(h.feed.tick(t0 + Duration::from_millis(100)), None);
        assert_eq!(h.feed.tick(t0 + Duration::from_millis(300)), Some(1));
        h.feed.poll();
        assert_eq!(h.feed.state().active_index, Some(1));
        assert_eq!(h.feed.unit_status("a"), Some(PlaybackStatus::Paused));
        assert_eq!(h.feed.unit_status("b"), Some(PlaybackStatus::Playing));
        assert_eq!(h.feed.warm_ids(), set(&["a", "b", "c"]));
        assert_eq!(h.feed.tick(t0 + Duration::from_millis(900)), None);
    }

    #[test]
    fn warm_set_follows_active_window() {
        let mut h = harness(5);
        h.feed.refresh();
        h.reply(Ok(page(&["i0", "i1", "i2", "i3", "i4"], None, false)));
        h.feed.set_active_index(Some(1)).unwrap();
        assert_eq!(h.feed.warm_ids(), set(&["i0", "i1", "i2"]));
        let urls = h.warmer.urls();
        assert!(!urls.iter().any(|u| u.contains("i3") || u.contains("i4")));
        h.warmer.complete("https://cdn.test/images/i1.jpg", Ok(()));
        h.warmer
            .complete("https://cdn.test/images/i2.jpg", Err("connection reset".into()));
        h.feed.poll();
        assert!(h.feed.is_warm("i1"));
        assert!(!h.feed.is_warm("i2"));
        assert!(h.feed.warm_ids().contains("i2"));
        // Failed posters never reach the page-level error.
        assert_eq!(h.feed.state().last_error, None);
    }

    #[test]
    fn open_poster_uses_navigation_host() {
        struct Recorder(Rc<RefCell<Vec<String>>>);
        impl NavigationHost for Recorder {
            fn open_artist(&self, poster_id: &str) -> Result<()> {
                self.0.borrow_mut().push(poster_id.to_string());
                Ok(())
            }
        }

        let opened = Rc::new(RefCell::new(Vec::new()));
        let (replies, rx) = unbounded();
        let source = Arc::new(StepSource {
            calls: Mutex::new(Vec::new()),
            replies: rx,
        });
        let mut feed = FeedController::new(Options {
            config: FeedConfig::default(),
            viewport: ViewportConfig::default(),
            source,
            player: Arc::new(HeadlessPlayer),
            warmer: Arc::new(ManualWarmer::default()),
            navigation: Some(Box::new(Recorder(opened.clone()))),
        });
        feed.refresh();
        replies.send(Ok(page(&["a", "b"], None, false))).unwrap();
        feed.poll_timeout(WAIT);
        feed.open_poster(1).unwrap();
        assert_eq!(opened.borrow().clone(), vec!["artist-b".to_string()]);
        assert!(feed.open_poster(5).is_err());
    }
}
