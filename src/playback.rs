use anyhow::Result;
use crossbeam_channel::Sender;

use crate::error::FeedError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PlaybackStatus {
    Idle,
    Loading,
    Playing,
    Paused,
    /// Terminal for this handle; the item has to be remounted to retry.
    Errored,
}

impl PlaybackStatus {
    pub fn label(&self) -> &'static str {
        match self {
            PlaybackStatus::Idle => "idle",
            PlaybackStatus::Loading => "loading",
            PlaybackStatus::Playing => "playing",
            PlaybackStatus::Paused => "paused",
            PlaybackStatus::Errored => "error",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: PlaybackStatus,
    pub to: PlaybackStatus,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlayerSignal {
    Ready,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayerNotice {
    pub mount_id: u64,
    pub signal: PlayerSignal,
}

/// Reporting handle given to a player for a single mount.
#[derive(Debug, Clone)]
pub struct PlayerEvents {
    mount_id: u64,
    tx: Sender<PlayerNotice>,
}

impl PlayerEvents {
    pub fn new(mount_id: u64, tx: Sender<PlayerNotice>) -> Self {
        Self { mount_id, tx }
    }

    pub fn mount_id(&self) -> u64 {
        self.mount_id
    }

    pub fn ready(&self) {
        self.send(PlayerSignal::Ready);
    }

    pub fn failed(&self, message: impl Into<String>) {
        self.send(PlayerSignal::Failed(message.into()));
    }

    fn send(&self, signal: PlayerSignal) {
        let _ = self.tx.send(PlayerNotice {
            mount_id: self.mount_id,
            signal,
        });
    }
}

#[derive(Debug, Clone, Copy)]
pub struct OpenRequest<'a> {
    pub url: &'a str,
    pub label: &'a str,
    pub muted: bool,
}

/// Media backend. Sessions open paused, loop forever and report readiness or
/// failure through the supplied [`PlayerEvents`].
pub trait Player: Send + Sync {
    fn open(&self, request: OpenRequest<'_>, events: PlayerEvents)
        -> Result<Box<dyn PlayerSession>>;
}

/// A single open media session; dropping it releases the media.
pub trait PlayerSession: Send {
    fn set_paused(&mut self, paused: bool) -> Result<()>;
    fn set_muted(&mut self, muted: bool) -> Result<()>;
}

/// Player that presents nothing and is ready immediately.
#[derive(Debug, Default, Clone, Copy)]
pub struct HeadlessPlayer;

struct HeadlessSession;

impl Player for HeadlessPlayer {
    fn open(
        &self,
        request: OpenRequest<'_>,
        events: PlayerEvents,
    ) -> Result<Box<dyn PlayerSession>> {
        log::debug!("headless player: open {} (mount {})", request.url, events.mount_id());
        events.ready();
        Ok(Box::new(HeadlessSession))
    }
}

impl PlayerSession for HeadlessSession {
    fn set_paused(&mut self, _paused: bool) -> Result<()> {
        Ok(())
    }

    fn set_muted(&mut self, _muted: bool) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnitFlags {
    pub active: bool,
    pub muted: bool,
    pub focused: bool,
}

/// Playback state for one mounted feed item.
///
/// The unit never decides on its own whether it is active: the controller
/// pushes `active`, `muted` and `focused` in, and the unit reconciles its
/// player against them. The long-press override sits on top of the activity
/// signal and only ever holds playback back.
pub struct PlaybackUnit {
    item_id: String,
    mount_id: u64,
    status: PlaybackStatus,
    active: bool,
    muted: bool,
    focused: bool,
    user_overridden: bool,
    session: Option<Box<dyn PlayerSession>>,
    error: Option<String>,
}

impl PlaybackUnit {
    pub fn new(item_id: impl Into<String>, mount_id: u64, flags: UnitFlags) -> Self {
        Self {
            item_id: item_id.into(),
            mount_id,
            status: PlaybackStatus::Idle,
            active: flags.active,
            muted: flags.muted,
            focused: flags.focused,
            user_overridden: false,
            session: None,
            error: None,
        }
    }

    pub fn item_id(&self) -> &str {
        &self.item_id
    }

    pub fn mount_id(&self) -> u64 {
        self.mount_id
    }

    pub fn status(&self) -> PlaybackStatus {
        self.status
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn is_muted(&self) -> bool {
        self.muted
    }

    pub fn is_user_overridden(&self) -> bool {
        self.user_overridden
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    fn should_play(&self) -> bool {
        self.active && self.focused && !self.user_overridden
    }

    /// `Idle -> Loading`: hands the resolved source to the player.
    pub fn load(
        &mut self,
        player: &dyn Player,
        url: &str,
        events: PlayerEvents,
    ) -> Result<Option<Transition>, FeedError> {
        if self.status != PlaybackStatus::Idle {
            return Ok(None);
        }
        let request = OpenRequest {
            url,
            label: &self.item_id,
            muted: self.muted,
        };
        match player.open(request, events) {
            Ok(session) => {
                self.session = Some(session);
                Ok(Some(self.move_to(PlaybackStatus::Loading)))
            }
            Err(err) => Err(self.fail(format!("{err:#}"))),
        }
    }

    /// Media became presentable.
    pub fn on_ready(&mut self) -> Result<Option<Transition>, FeedError> {
        if self.status != PlaybackStatus::Loading {
            return Ok(None);
        }
        if self.should_play() {
            self.command_paused(false)?;
            Ok(Some(self.move_to(PlaybackStatus::Playing)))
        } else {
            Ok(Some(self.move_to(PlaybackStatus::Paused)))
        }
    }

    pub fn set_active(&mut self, active: bool) -> Result<Option<Transition>, FeedError> {
        self.active = active;
        self.reconcile()
    }

    pub fn set_focused(&mut self, focused: bool) -> Result<Option<Transition>, FeedError> {
        self.focused = focused;
        if !focused {
            self.user_overridden = false;
        }
        self.reconcile()
    }

    pub fn set_user_override(&mut self, overridden: bool) -> Result<Option<Transition>, FeedError> {
        self.user_overridden = overridden;
        self.reconcile()
    }

    /// Mute is orthogonal to the state machine and never changes `status`.
    pub fn set_muted(&mut self, muted: bool) -> Result<(), FeedError> {
        self.muted = muted;
        if self.status == PlaybackStatus::Errored {
            return Ok(());
        }
        if let Some(session) = self.session.as_mut() {
            if let Err(err) = session.set_muted(muted) {
                return Err(self.fail(format!("{err:#}")));
            }
        }
        Ok(())
    }

    /// `* -> Errored`. Releases the player session.
    pub fn fail(&mut self, message: impl Into<String>) -> FeedError {
        let message = message.into();
        self.session = None;
        self.status = PlaybackStatus::Errored;
        self.error = Some(message.clone());
        FeedError::Playback {
            item_id: self.item_id.clone(),
            message,
        }
    }

    fn reconcile(&mut self) -> Result<Option<Transition>, FeedError> {
        match self.status {
            PlaybackStatus::Playing if !self.should_play() => {
                self.command_paused(true)?;
                Ok(Some(self.move_to(PlaybackStatus::Paused)))
            }
            PlaybackStatus::Paused if self.should_play() => {
                self.command_paused(false)?;
                Ok(Some(self.move_to(PlaybackStatus::Playing)))
            }
            _ => Ok(None),
        }
    }

    fn command_paused(&mut self, paused: bool) -> Result<(), FeedError> {
        let Some(session) = self.session.as_mut() else {
            return Err(self.fail("player session missing"));
        };
        if let Err(err) = session.set_paused(paused) {
            let verb = if paused { "pause" } else { "play" };
            return Err(self.fail(format!("failed to {verb} video: {err:#}")));
        }
        Ok(())
    }

    fn move_to(&mut self, to: PlaybackStatus) -> Transition {
        let from = self.status;
        self.status = to;
        log::debug!(
            "playback: {} {} -> {}",
            self.item_id,
            from.label(),
            to.label()
        );
        Transition { from, to }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Arc;

    use anyhow::{anyhow, Result};
    use parking_lot::Mutex;

    use super::*;

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Call {
        Open { url: String, muted: bool },
        Paused(bool),
        Muted(bool),
    }

    /// Records every call; readiness is left to the test.
    #[derive(Clone, Default)]
    pub struct ScriptedPlayer {
        pub calls: Arc<Mutex<Vec<Call>>>,
        pub events: Arc<Mutex<Vec<PlayerEvents>>>,
        pub fail_open: Arc<Mutex<bool>>,
        pub fail_commands: Arc<Mutex<bool>>,
    }

    struct ScriptedSession {
        calls: Arc<Mutex<Vec<Call>>>,
        fail: Arc<Mutex<bool>>,
    }

    impl Player for ScriptedPlayer {
        fn open(
            &self,
            request: OpenRequest<'_>,
            events: PlayerEvents,
        ) -> Result<Box<dyn PlayerSession>> {
            if *self.fail_open.lock() {
                return Err(anyhow!("decoder unavailable"));
            }
            self.calls.lock().push(Call::Open {
                url: request.url.to_string(),
                muted: request.muted,
            });
            self.events.lock().push(events);
            Ok(Box::new(ScriptedSession {
                calls: self.calls.clone(),
                fail: self.fail_commands.clone(),
            }))
        }
    }

    impl PlayerSession for ScriptedSession {
        fn set_paused(&mut self, paused: bool) -> Result<()> {
            if *self.fail.lock() {
                return Err(anyhow!("ipc closed"));
            }
            self.calls.lock().push(Call::Paused(paused));
            Ok(())
        }

        fn set_muted(&mut self, muted: bool) -> Result<()> {
            if *self.fail.lock() {
                return Err(anyhow!("ipc closed"));
            }
            self.calls.lock().push(Call::Muted(muted));
            Ok(())
        }
    }
}
