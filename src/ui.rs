use std::io::{self, Stdout};
use std::time::{Duration, Instant};

use anyhow::Result;
use crossterm::event::{self, Event, KeyCode, KeyEventKind};
use crossterm::terminal::{
    disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen,
};
use crossterm::ExecutableCommand;
use ratatui::backend::CrosstermBackend;
use ratatui::layout::{Alignment, Constraint, Direction, Layout, Rect};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span, Text};
use ratatui::widgets::{Block, Borders, List, ListItem, ListState, Padding, Paragraph, Wrap};
use ratatui::{Frame, Terminal};

use crate::feed::{FeedController, FeedNotice};
use crate::gesture::{Gesture, GestureRecognizer};
use crate::playback::PlaybackStatus;
use crate::viewport::Visibility;

const COLOR_BG: Color = Color::Rgb(30, 30, 46);
const COLOR_PANEL_BG: Color = Color::Rgb(24, 24, 36);
const COLOR_PANEL_FOCUSED_BG: Color = Color::Rgb(49, 50, 68);
const COLOR_PANEL_SELECTED_BG: Color = Color::Rgb(69, 71, 90);
const COLOR_BORDER_IDLE: Color = Color::Rgb(49, 50, 68);
const COLOR_BORDER_FOCUSED: Color = Color::Rgb(137, 180, 250);
const COLOR_TEXT_PRIMARY: Color = Color::Rgb(205, 214, 244);
const COLOR_TEXT_SECONDARY: Color = Color::Rgb(166, 173, 200);
const COLOR_ACCENT: Color = Color::Rgb(137, 180, 250);
const COLOR_SUCCESS: Color = Color::Rgb(166, 227, 161);
const COLOR_WARNING: Color = Color::Rgb(249, 226, 175);
const COLOR_ERROR: Color = Color::Rgb(243, 139, 168);

const SPINNER_FRAMES: [&str; 10] = ["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"];
const TICK_RATE: Duration = Duration::from_millis(50);

pub struct Options {
    pub feed: FeedController,
    pub gestures: GestureRecognizer,
    pub status_message: String,
    pub source_label: String,
    pub config_path: String,
}

struct Spinner {
    index: usize,
    last_tick: Instant,
}

impl Spinner {
    fn new() -> Self {
        Self {
            index: 0,
            last_tick: Instant::now(),
        }
    }

    fn frame(&self) -> &'static str {
        SPINNER_FRAMES[self.index % SPINNER_FRAMES.len()]
    }

    fn advance(&mut self) -> bool {
        let now = Instant::now();
        if now.duration_since(self.last_tick) >= Duration::from_millis(120) {
            self.index = (self.index + 1) % SPINNER_FRAMES.len();
            self.last_tick = now;
            true
        } else {
            false
        }
    }

    fn reset(&mut self) {
        self.index = 0;
        self.last_tick = Instant::now();
    }
}

/// Terminal front-end. The list cursor plays the role of the scroll
/// position: the item under it is fully visible and the viewport tracker
/// decides when it becomes active.
pub struct Model {
    feed: FeedController,
    gestures: GestureRecognizer,
    holding: bool,
    scroll: usize,
    status_message: String,
    source_label: String,
    config_path: String,
    spinner: Spinner,
    needs_redraw: bool,
}

impl Model {
    pub fn new(opts: Options) -> Self {
        Self {
            feed: opts.feed,
            gestures: opts.gestures,
            holding: false,
            scroll: 0,
            status_message: opts.status_message,
            source_label: opts.source_label,
            config_path: opts.config_path,
            spinner: Spinner::new(),
            needs_redraw: true,
        }
    }

    pub fn run(&mut self) -> Result<()> {
        let mut stdout = io::stdout();
        enable_raw_mode()?;
        stdout.execute(EnterAlternateScreen)?;
        let backend = CrosstermBackend::new(stdout);
        let mut terminal = Terminal::new(backend)?;
        terminal.clear()?;

        self.feed.refresh();
        let result = self.event_loop(&mut terminal);

        disable_raw_mode()?;
        terminal.backend_mut().execute(LeaveAlternateScreen)?;
        terminal.show_cursor()?;

        result
    }

    fn event_loop(&mut self, terminal: &mut Terminal<CrosstermBackend<Stdout>>) -> Result<()> {
        loop {
            if self.step(Instant::now()) {
                self.mark_dirty();
            }

            if self.needs_redraw {
                terminal.draw(|frame| self.draw(frame))?;
                self.needs_redraw = false;
            }

            if event::poll(TICK_RATE)? {
                if let Event::Key(key) = event::read()? {
                    if key.kind == KeyEventKind::Press {
                        match self.handle_key(key.code, Instant::now()) {
                            Ok(true) => break,
                            Ok(false) => {}
                            Err(err) => {
                                self.status_message = format!("Error: {err:#}");
                            }
                        }
                        self.mark_dirty();
                    }
                }
            } else {
                // Idle poll period: let the controller wait for completions.
                if self.feed.poll_timeout(Duration::from_millis(1)) {
                    self.mark_dirty();
                }
            }

            if self.is_loading() {
                if self.spinner.advance() {
                    self.mark_dirty();
                }
            } else {
                self.spinner.reset();
            }
        }
        Ok(())
    }

    fn mark_dirty(&mut self) {
        self.needs_redraw = true;
    }

    fn is_loading(&self) -> bool {
        let state = self.feed.state();
        state.is_refreshing || state.is_loading_more
    }

    /// Drives everything that depends on the clock: completions, the
    /// viewport dwell and the long-press timer.
    fn step(&mut self, now: Instant) -> bool {
        let mut changed = self.feed.poll();
        let len = self.feed.state().items.len();
        if len > 0 {
            self.scroll = self.scroll.min(len - 1);
            let visible = [Visibility::new(self.scroll, 1.0)];
            if let Some(index) = self.feed.on_visibility(&visible, now) {
                log::debug!("ui: item {index} became active");
                changed = true;
            }
        } else {
            self.scroll = 0;
        }
        if let Some(gesture) = self.gestures.tick(now) {
            self.apply_gesture(gesture);
            changed = true;
        }
        for notice in self.feed.drain_notices() {
            self.status_message = notice_message(&notice);
            changed = true;
        }
        changed
    }

    fn handle_key(&mut self, code: KeyCode, now: Instant) -> Result<bool> {
        let len = self.feed.state().items.len();
        match code {
            KeyCode::Char('q') => return Ok(true),
            KeyCode::Char('j') | KeyCode::Down => {
                if len > 0 && self.scroll + 1 < len {
                    self.scroll += 1;
                } else if self.feed.request_next_page() {
                    self.status_message = "Loading more videos…".into();
                }
            }
            KeyCode::Char('k') | KeyCode::Up => {
                self.scroll = self.scroll.saturating_sub(1);
            }
            KeyCode::Enter => {
                if let Some(gesture) = self.gestures.tap(now) {
                    self.apply_gesture(gesture);
                }
            }
            KeyCode::Char(' ') => {
                if self.holding {
                    self.holding = false;
                    if let Some(gesture) = self.gestures.release(now) {
                        self.apply_gesture(gesture);
                    }
                } else {
                    self.holding = true;
                    self.gestures.press(now);
                    self.status_message = "Holding… press Space again to release.".into();
                }
            }
            KeyCode::Tab => {
                let focused = !self.feed.state().is_focused;
                self.feed.set_focused(focused);
                self.status_message = if focused {
                    "Feed focused.".into()
                } else {
                    "Feed in background; playback paused.".into()
                };
            }
            KeyCode::Char('a') => {
                if len > 0 {
                    self.feed.open_poster(self.scroll)?;
                    if let Some(item) = self.feed.state().items.get(self.scroll) {
                        self.status_message = format!("Opened artist {}.", item.poster_id);
                    }
                }
            }
            KeyCode::Char('r') => {
                if self.feed.refresh() {
                    self.scroll = 0;
                    self.status_message = "Refreshing…".into();
                }
            }
            KeyCode::Esc => {
                self.feed.dismiss_error();
            }
            _ => {}
        }
        Ok(false)
    }

    fn apply_gesture(&mut self, gesture: Gesture) {
        if self.feed.state().items.is_empty() {
            return;
        }
        self.feed.apply_gesture(self.scroll, gesture);
        self.status_message = match gesture {
            Gesture::Tap if self.feed.state().is_muted => "Muted.".into(),
            Gesture::Tap => "Sound on.".into(),
            Gesture::DoubleTap => return,
            Gesture::LongPressStart => "Paused while held.".into(),
            Gesture::LongPressEnd => "Released.".into(),
        };
    }

    fn draw(&mut self, frame: &mut Frame<'_>) {
        let full = frame.size();
        frame.render_widget(Block::default().style(Style::default().bg(COLOR_BG)), full);

        let layout = Layout::default()
            .direction(Direction::Vertical)
            .constraints([
                Constraint::Length(1),
                Constraint::Min(0),
                Constraint::Length(1),
            ])
            .split(full);

        let status_text = if self.is_loading() {
            format!("{} {}", self.spinner.frame(), self.status_message)
                .trim()
                .to_string()
        } else {
            self.status_message.clone()
        };
        let status_line = Paragraph::new(status_text).style(
            Style::default()
                .fg(COLOR_TEXT_PRIMARY)
                .bg(COLOR_PANEL_FOCUSED_BG)
                .add_modifier(Modifier::BOLD),
        );
        frame.render_widget(status_line, layout[0]);

        let main = Layout::default()
            .direction(Direction::Horizontal)
            .constraints([Constraint::Percentage(35), Constraint::Percentage(65)])
            .split(layout[1]);
        self.draw_list(frame, main[0]);
        self.draw_player(frame, main[1]);

        let footer = Paragraph::new(
            "j/k scroll · Enter tap · Space hold · Tab focus · a artist · r refresh · q quit",
        )
        .style(
            Style::default()
                .fg(COLOR_TEXT_SECONDARY)
                .bg(COLOR_PANEL_BG)
                .add_modifier(Modifier::ITALIC),
        )
        .alignment(Alignment::Center)
        .wrap(Wrap { trim: true });
        frame.render_widget(footer, layout[2]);
    }

    fn draw_list(&self, frame: &mut Frame<'_>, area: Rect) {
        let state = self.feed.state();
        let items: Vec<ListItem> = state
            .items
            .iter()
            .enumerate()
            .map(|(index, item)| {
                let marker = if state.active_index == Some(index) {
                    "▶ "
                } else {
                    "  "
                };
                let status = self
                    .feed
                    .unit_status(&item.id)
                    .map(|status| status.label())
                    .unwrap_or("");
                let warm = if self.feed.is_warm(&item.id) { " ·" } else { "" };
                ListItem::new(Line::from(vec![
                    Span::styled(marker, Style::default().fg(COLOR_ACCENT)),
                    Span::styled(
                        format!("#{} ", item.id),
                        Style::default().fg(COLOR_TEXT_PRIMARY),
                    ),
                    Span::styled(
                        item.poster_id.clone(),
                        Style::default().fg(COLOR_TEXT_SECONDARY),
                    ),
                    Span::styled(format!(" {status}{warm}"), Style::default().fg(COLOR_SUCCESS)),
                ]))
            })
            .collect();

        let title = format!(" {} · {} videos ", self.source_label, state.items.len());
        let list = List::new(items)
            .block(
                Block::default()
                    .title(title)
                    .borders(Borders::ALL)
                    .border_style(Style::default().fg(COLOR_BORDER_IDLE))
                    .style(Style::default().bg(COLOR_PANEL_BG)),
            )
            .highlight_style(
                Style::default()
                    .bg(COLOR_PANEL_SELECTED_BG)
                    .add_modifier(Modifier::BOLD),
            );
        let mut list_state = ListState::default();
        if !state.items.is_empty() {
            list_state.select(Some(self.scroll));
        }
        frame.render_stateful_widget(list, area, &mut list_state);
    }

    fn draw_player(&self, frame: &mut Frame<'_>, area: Rect) {
        let state = self.feed.state();
        let border = if state.is_focused {
            COLOR_BORDER_FOCUSED
        } else {
            COLOR_BORDER_IDLE
        };
        let block = Block::default()
            .title(" Now showing ")
            .borders(Borders::ALL)
            .border_style(Style::default().fg(border))
            .padding(Padding::uniform(1))
            .style(Style::default().bg(COLOR_PANEL_BG));

        let mut lines: Vec<Line> = Vec::new();
        if let Some(error) = &state.last_error {
            lines.push(Line::from(Span::styled(
                format!("{error} (r to retry, Esc to dismiss)"),
                Style::default().fg(COLOR_ERROR),
            )));
            lines.push(Line::default());
        }

        match state.items.get(self.scroll) {
            None if self.is_loading() => lines.push(Line::from("Loading videos…")),
            None => lines.push(Line::from(format!(
                "No videos yet. Press r to refresh. Config: {}",
                self.config_path
            ))),
            Some(item) => {
                let status = self.feed.unit_status(&item.id);
                let (label, color) = match status {
                    Some(PlaybackStatus::Playing) => ("playing", COLOR_SUCCESS),
                    Some(PlaybackStatus::Paused) => ("paused", COLOR_TEXT_SECONDARY),
                    Some(PlaybackStatus::Loading) | Some(PlaybackStatus::Idle) => {
                        ("loading", COLOR_WARNING)
                    }
                    Some(PlaybackStatus::Errored) => ("failed to play", COLOR_ERROR),
                    None => ("not mounted", COLOR_TEXT_SECONDARY),
                };
                lines.push(Line::from(vec![
                    Span::styled("Video ", Style::default().fg(COLOR_TEXT_SECONDARY)),
                    Span::styled(
                        item.id.clone(),
                        Style::default()
                            .fg(COLOR_TEXT_PRIMARY)
                            .add_modifier(Modifier::BOLD),
                    ),
                ]));
                lines.push(Line::from(vec![
                    Span::styled("Artist ", Style::default().fg(COLOR_TEXT_SECONDARY)),
                    Span::styled(item.poster_id.clone(), Style::default().fg(COLOR_ACCENT)),
                ]));
                lines.push(Line::from(Span::styled(
                    item.media_ref.to_string(),
                    Style::default().fg(COLOR_TEXT_SECONDARY),
                )));
                lines.push(Line::default());
                lines.push(Line::from(Span::styled(label, Style::default().fg(color))));
                if let Some(message) = self.feed.unit(&item.id).and_then(|unit| unit.error()) {
                    lines.push(Line::from(Span::styled(
                        message.to_string(),
                        Style::default().fg(COLOR_ERROR),
                    )));
                }
                let sound = if state.is_muted { "🔇 muted" } else { "🔊 sound on" };
                lines.push(Line::from(Span::styled(
                    sound,
                    Style::default().fg(COLOR_TEXT_PRIMARY),
                )));
                if self.gestures.is_long_pressing() {
                    lines.push(Line::from(Span::styled(
                        "held",
                        Style::default().fg(COLOR_WARNING),
                    )));
                }
                if !state.is_focused {
                    lines.push(Line::from(Span::styled(
                        "in background",
                        Style::default().fg(COLOR_WARNING),
                    )));
                }
            }
        }
        if !state.has_more && !state.items.is_empty() && self.scroll + 1 == state.items.len() {
            lines.push(Line::default());
            lines.push(Line::from(Span::styled(
                "You're all caught up.",
                Style::default().fg(COLOR_TEXT_SECONDARY),
            )));
        }

        let paragraph = Paragraph::new(Text::from(lines))
            .block(block)
            .wrap(Wrap { trim: false });
        frame.render_widget(paragraph, area);
    }
}

fn notice_message(notice: &FeedNotice) -> String {
    match notice {
        FeedNotice::PageFailed(err) => format!("{err}"),
        FeedNotice::PlaybackFailed(err) => format!("{err}"),
        FeedNotice::DoubleTapped { item_id } => format!("♥ Double tapped video {item_id}"),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::feed::{FeedConfig, Options as FeedOptions};
    use crate::playback::HeadlessPlayer;
    use crate::prefetch::testing::ManualWarmer;
    use crate::source::MemorySource;
    use crate::viewport::ViewportConfig;

    fn model() -> Model {
        let feed = FeedController::new(FeedOptions {
            config: FeedConfig::default(),
            viewport: ViewportConfig::default(),
            source: Arc::new(MemorySource::demo().with_base_url("file:///demo")),
            player: Arc::new(HeadlessPlayer),
            warmer: Arc::new(ManualWarmer::default()),
            navigation: None,
        });
        Model::new(Options {
            feed,
            gestures: GestureRecognizer::default(),
            status_message: String::new(),
            source_label: "demo".into(),
            config_path: "~/.config/artfeed/config.yaml".into(),
        })
    }

    fn loaded() -> Model {
        let mut model = model();
        model.feed.refresh();
        let deadline = Instant::now() + Duration::from_secs(5);
        while model.feed.state().is_refreshing && Instant::now() < deadline {
            model.feed.poll_timeout(Duration::from_millis(20));
        }
        model.step(Instant::now());
        model
    }

    #[test]
    fn scrolling_activates_after_dwell() {
        let mut model = loaded();
        let t0 = Instant::now();
        assert_eq!(model.feed.state().active_index, Some(0));
        model.handle_key(KeyCode::Char('j'), t0).unwrap();
        model.step(t0);
        assert_eq!(model.feed.state().active_index, Some(0));
        model.step(t0 + Duration::from_millis(350));
        assert_eq!(model.feed.state().active_index, Some(1));
    }

    #[test]
    fn enter_toggles_mute_and_q_quits() {
        let mut model = loaded();
        let t0 = Instant::now();
        assert!(model.feed.state().is_muted);
        model.handle_key(KeyCode::Enter, t0).unwrap();
        assert!(!model.feed.state().is_muted);
        assert_eq!(model.status_message, "Sound on.");
        assert!(model.handle_key(KeyCode::Char('q'), t0).unwrap());
    }

    #[test]
    fn space_hold_becomes_long_press() {
        let mut model = loaded();
        let t0 = Instant::now();
        model.handle_key(KeyCode::Char(' '), t0).unwrap();
        model.step(t0 + Duration::from_millis(600));
        assert!(model.feed.unit("1").unwrap().is_user_overridden());
        model
            .handle_key(KeyCode::Char(' '), t0 + Duration::from_millis(700))
            .unwrap();
        assert!(!model.feed.unit("1").unwrap().is_user_overridden());
        assert!(model.feed.state().is_muted);
    }

    #[test]
    fn opening_artist_without_host_reports_error() {
        let mut model = loaded();
        assert!(model.handle_key(KeyCode::Char('a'), Instant::now()).is_err());
    }
}
