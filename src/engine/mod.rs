// SPDX-License-Identifier: MPL-2.0

//! Playback lifecycle coordinator.
//!
//! One [`WallpaperEngine`] exists per wallpaper surface. It owns the
//! [`Renderer`] for the lifetime of the surface and at most one media engine,
//! and reacts to surface, visibility and configuration events on the event
//! loop thread. Everything that happens elsewhere (waiting for the render
//! surface, media callbacks, timers) comes back as a message tagged with the
//! generation it was started for, and is dropped when that generation is
//! no longer current.

mod recovery;
mod state;
#[cfg(test)]
mod tests;
mod watchdog;

pub use state::Phase;

use std::rc::Rc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use sctk::reexports::calloop::{
    LoopHandle, RegistrationToken, channel,
    timer::{TimeoutAction, Timer},
};
use tracing::{debug, debug_span, error, info, warn};
use vidpaper_config::{ConfigStore, Entry, PlaybackMode};

use crate::gpu::{GpuBackendFactory, PlatformSurface};
use crate::media::{self, MediaBackend, MediaError, MediaEvent, MediaEventSink, PlaybackState};
use crate::renderer::Renderer;
use crate::signals::Signal;
use crate::status_color::{ColorHint, color_hint};
use recovery::{Recovery, RetryBudget};
use state::{EngineState, StartPhase};
use watchdog::{Sample, Verdict, Watchdog};

pub type EngineId = u64;

/// Timing and retry tunables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineConfig {
    /// How long startup waits for the renderer's decode target.
    pub surface_wait: Duration,
    /// Delay before a recovery attempt.
    pub retry_backoff: Duration,
    /// Recovery attempts before the wallpaper is disabled.
    pub max_retries: u32,
    pub watchdog_interval: Duration,
    /// Videos this short are never considered stalled.
    pub watchdog_min_duration: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            surface_wait: Duration::from_secs(8),
            retry_backoff: Duration::from_secs(2),
            max_retries: 3,
            watchdog_interval: Duration::from_secs(2),
            watchdog_min_duration: Duration::from_millis(2000),
        }
    }
}

/// Delivers the rare messages a user should actually see.
pub trait Notifier {
    fn notice(&self, message: &str);
}

/// Notices end up in the log when there is nobody to show them to.
#[derive(Debug, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notice(&self, message: &str) {
        warn!(notice = true, "{message}");
    }
}

/// Event loop data that owns the engines.
pub trait EngineHost: Sized + 'static {
    fn engine_mut(&mut self, id: EngineId) -> Option<&mut WallpaperEngine<Self>>;
}

/// Collaborators shared by every engine.
#[derive(Clone)]
pub struct Services {
    pub gpu: Arc<dyn GpuBackendFactory>,
    pub media: Rc<dyn MediaBackend>,
    pub notifier: Rc<dyn Notifier>,
    pub store: ConfigStore,
}

#[derive(Debug)]
pub enum EngineMessage {
    /// The off-thread wait for the render surface finished.
    SurfaceWait { generation: u64, ready: bool },
    Media { generation: u64, event: MediaEvent },
}

pub struct WallpaperEngine<H: EngineHost> {
    id: EngineId,
    handle: LoopHandle<'static, H>,
    services: Services,
    config: EngineConfig,
    messages: channel::Sender<EngineMessage>,
    channel_token: Option<RegistrationToken>,

    entry: Entry,
    renderer: Option<Renderer>,
    state: EngineState,
    generation: u64,
    visible: bool,
    playhead: Duration,
    /// One-shot playback reached the end and is holding the last frame.
    completed: bool,
    budget: RetryBudget,
    watchdog: Watchdog,
    watchdog_armed: bool,
    watchdog_epoch: u64,
}

impl<H: EngineHost> WallpaperEngine<H> {
    pub fn new(
        id: EngineId,
        handle: LoopHandle<'static, H>,
        services: Services,
        config: EngineConfig,
    ) -> eyre::Result<Self> {
        let (messages, receiver) = channel::channel::<EngineMessage>();

        let channel_token = handle
            .insert_source(receiver, move |event, _, host: &mut H| {
                if let channel::Event::Msg(message) = event {
                    if let Some(engine) = host.engine_mut(id) {
                        engine.handle_message(message);
                    }
                }
            })
            .map_err(|err| eyre::eyre!("{}", err))?;

        let entry = services.store.load();

        Ok(Self {
            id,
            handle,
            services,
            config,
            messages,
            channel_token: Some(channel_token),
            entry,
            renderer: None,
            state: EngineState::Idle,
            generation: 0,
            visible: false,
            playhead: Duration::ZERO,
            completed: false,
            budget: RetryBudget::new(config.max_retries),
            watchdog: Watchdog::new(config.watchdog_min_duration),
            watchdog_armed: false,
            watchdog_epoch: 0,
        })
    }

    #[must_use]
    pub fn id(&self) -> EngineId {
        self.id
    }

    #[must_use]
    pub fn phase(&self) -> Phase {
        self.state.phase()
    }

    #[must_use]
    pub fn playhead(&self) -> Duration {
        self.playhead
    }

    #[must_use]
    pub fn status_bar_hint(&self) -> Option<ColorHint> {
        color_hint(self.entry.status_bar_color)
    }

    /// The platform created the wallpaper surface.
    pub fn surface_created(&mut self, surface: PlatformSurface) {
        if self.renderer.is_some() {
            warn!(id = self.id, "surface created twice, replacing renderer");
            self.surface_destroyed();
        }

        let mut renderer = Renderer::new(Arc::clone(&self.services.gpu));
        push_render_params(&renderer, &self.entry);
        renderer.on_surface_ready(surface);
        self.renderer = Some(renderer);

        if matches!(self.state, EngineState::Idle) {
            self.start("surface ready");
        }
    }

    pub fn surface_resized(&mut self, width: u32, height: u32) {
        if let Some(renderer) = &self.renderer {
            renderer.on_viewport_changed(width, height);
        }
    }

    /// The surface is gone: tear down both the media engine and the renderer.
    pub fn surface_destroyed(&mut self) {
        self.capture_playhead();
        self.stop_media();
        self.generation += 1;

        if let Some(mut renderer) = self.renderer.take() {
            renderer.teardown();
        }

        self.state = EngineState::Idle;
        debug!(id = self.id, "surface destroyed");
    }

    /// Final teardown. The engine does nothing after this.
    pub fn engine_destroyed(&mut self) {
        self.surface_destroyed();
        if let Some(token) = self.channel_token.take() {
            self.handle.remove(token);
        }
    }

    pub fn visibility_changed(&mut self, visible: bool) {
        if self.visible == visible {
            return;
        }
        self.visible = visible;
        debug!(id = self.id, visible, state = ?self.state, "visibility changed");

        if visible {
            self.on_visible();
        } else {
            self.on_hidden();
        }
    }

    /// React to a configuration change. The configuration is re-read every time.
    pub fn on_signal(&mut self, signal: Signal) {
        let previous = std::mem::replace(&mut self.entry, self.services.store.load());

        match signal {
            Signal::StatusBarColorChanged => {
                debug!(id = self.id, hint = ?self.status_bar_hint(), "status bar color changed");
            }
            Signal::SourceChanged => {
                if let Some(renderer) = &self.renderer {
                    push_render_params(renderer, &self.entry);
                }
                if matches!(self.state, EngineState::Disabled) && self.entry.source_uri().is_none()
                {
                    return;
                }

                self.playhead = Duration::ZERO;
                self.completed = false;
                self.budget.reset();
                self.watchdog.reset();
                self.start("source changed");
            }
            Signal::SettingsChanged => {
                if let Some(renderer) = &self.renderer {
                    push_render_params(renderer, &self.entry);
                }
                if matches!(self.state, EngineState::Disabled) {
                    return;
                }
                if previous.playback_mode != self.entry.playback_mode {
                    self.completed = false;
                }

                self.capture_playhead();
                self.start("settings changed");
            }
        }
    }

    pub fn handle_message(&mut self, message: EngineMessage) {
        match message {
            EngineMessage::SurfaceWait { generation, ready } => {
                if generation == self.generation {
                    self.on_surface_wait(ready);
                } else {
                    debug!(id = self.id, generation, "ignoring stale surface wait");
                }
            }
            EngineMessage::Media { generation, event } => {
                if generation == self.generation {
                    self.on_media_event(event);
                } else {
                    debug!(id = self.id, generation, ?event, "ignoring stale media event");
                }
            }
        }
    }

    fn take_state(&mut self) -> EngineState {
        std::mem::replace(&mut self.state, EngineState::Idle)
    }

    fn capture_playhead(&mut self) {
        if let Some(position) = self.state.media().and_then(|media| media.position()) {
            self.playhead = position;
        }
    }

    /// Release the media engine, if any, and take back the decode target.
    /// Leaves the state as `Idle` unless it holds no media engine.
    fn stop_media(&mut self) {
        self.disarm_watchdog();

        match self.take_state() {
            EngineState::Starting(StartPhase::AwaitingReady(mut media))
            | EngineState::Playing(mut media)
            | EngineState::Paused(mut media) => media.release(),
            other => self.state = other,
        }

        if let Some(renderer) = &self.renderer {
            renderer.revoke_decode_target();
        }
    }

    /// Tear down whatever runs and begin a fresh startup from `self.playhead`.
    fn start(&mut self, reason: &'static str) {
        self.stop_media();
        self.generation += 1;
        let generation = self.generation;
        self.state = EngineState::Idle;

        let Some(renderer) = &self.renderer else {
            debug!(id = self.id, reason, "no surface yet, deferring start");
            return;
        };

        let Some(source) = self.entry.source_uri() else {
            info!(id = self.id, "no video source configured");
            return;
        };

        let Some(uri) = media::resolve_source(source) else {
            warn!(id = self.id, %source, "video source unavailable, not starting");
            return;
        };

        debug!(id = self.id, generation, reason, %uri, "starting playback engine");

        let waiter = renderer.waiter();
        let messages = self.messages.clone();
        let timeout = self.config.surface_wait;
        let spawned = std::thread::Builder::new()
            .name("vidpaper-surface-wait".to_string())
            .spawn(move || {
                let ready = waiter.wait_ready(timeout);
                let _ = messages.send(EngineMessage::SurfaceWait { generation, ready });
            });

        match spawned {
            Ok(_) => self.state = EngineState::Starting(StartPhase::AwaitingSurface { uri }),
            Err(why) => error!(id = self.id, ?why, "failed to spawn surface wait"),
        }
    }

    fn on_surface_wait(&mut self, ready: bool) {
        let uri = match self.take_state() {
            EngineState::Starting(StartPhase::AwaitingSurface { uri }) => uri,
            other => {
                self.state = other;
                return;
            }
        };

        let target = if ready {
            self.renderer.as_ref().and_then(Renderer::decode_target)
        } else {
            None
        };

        let Some(target) = target else {
            error!(
                id = self.id,
                timeout = ?self.config.surface_wait,
                "decode target unavailable, startup aborted"
            );
            return;
        };

        let generation = self.generation;
        let messages = Mutex::new(self.messages.clone());
        let sink = MediaEventSink::new(move |event| {
            if let Ok(messages) = messages.lock() {
                let _ = messages.send(EngineMessage::Media { generation, event });
            }
        });

        let mut media = match self.services.media.create(target, sink) {
            Ok(media) => media,
            Err(why) => {
                self.on_media_error(why);
                return;
            }
        };

        media.set_volume(if self.entry.audio { 1.0 } else { 0.0 });
        media.set_repeat(self.entry.playback_mode == PlaybackMode::Loop);

        if let Err(why) = media.load(&uri) {
            media.release();
            self.on_media_error(why);
            return;
        }

        self.state = EngineState::Starting(StartPhase::AwaitingReady(media));
    }

    fn on_media_event(&mut self, event: MediaEvent) {
        match event {
            MediaEvent::VideoSize { width, height } => {
                if let Some(renderer) = &self.renderer {
                    renderer.on_video_dimensions_changed(width, height);
                }
            }
            MediaEvent::State(PlaybackState::Ready) => self.on_ready(),
            MediaEvent::State(PlaybackState::Ended) => self.on_ended(),
            MediaEvent::State(state) => {
                debug!(id = self.id, ?state, "playback state");
            }
            MediaEvent::Error(why) => self.on_media_error(why),
        }
    }

    fn on_ready(&mut self) {
        let mut media = match self.take_state() {
            EngineState::Starting(StartPhase::AwaitingReady(media)) => media,
            other => {
                self.state = other;
                return;
            }
        };

        if self.playhead > Duration::ZERO {
            media.seek(self.playhead);
        }

        if !self.visible || self.completed {
            debug!(id = self.id, "media ready, holding paused");
            self.state = EngineState::Paused(media);
            return;
        }

        match media.play() {
            Ok(()) => {
                info!(id = self.id, generation = self.generation, "playback started");
                self.state = EngineState::Playing(media);
                self.arm_watchdog();
            }
            Err(why) => {
                // Held paused, the next time it becomes visible retries play.
                self.state = EngineState::Paused(media);
                self.on_media_error(why);
            }
        }
    }

    fn on_ended(&mut self) {
        let mut media = match self.take_state() {
            EngineState::Playing(media) => media,
            other => {
                self.state = other;
                return;
            }
        };

        match self.entry.playback_mode {
            PlaybackMode::OneShot => {
                if let Some(position) = media.position() {
                    self.playhead = position;
                }
                media.pause();
                self.completed = true;
                self.disarm_watchdog();
                debug!(id = self.id, "one-shot playback completed");
                self.state = EngineState::Paused(media);
            }
            PlaybackMode::Loop => {
                media.seek(Duration::ZERO);
                self.state = EngineState::Playing(media);
            }
        }
    }

    fn on_hidden(&mut self) {
        match self.take_state() {
            EngineState::Playing(mut media) => {
                if let Some(position) = media.position() {
                    self.playhead = position;
                }
                media.pause();
                self.disarm_watchdog();
                self.state = EngineState::Paused(media);
            }
            other => self.state = other,
        }
    }

    fn on_visible(&mut self) {
        match self.take_state() {
            EngineState::Paused(mut media) => {
                if self.completed {
                    if self.entry.preview {
                        self.state = EngineState::Paused(media);
                        return;
                    }
                    media.seek(Duration::ZERO);
                    self.playhead = Duration::ZERO;
                    self.completed = false;
                }

                match media.play() {
                    Ok(()) => {
                        self.state = EngineState::Playing(media);
                        self.arm_watchdog();
                    }
                    Err(why) => {
                        self.state = EngineState::Paused(media);
                        self.on_media_error(why);
                    }
                }
            }
            EngineState::Idle => {
                if self.renderer.is_some() {
                    self.start("became visible");
                }
            }
            EngineState::Recovering { attempt, due: true } => {
                info!(id = self.id, attempt, "retrying playback");
                self.start("recovery");
            }
            other => self.state = other,
        }
    }

    fn on_media_error(&mut self, error: MediaError) {
        match recovery::decide(media::classify(&error), &mut self.budget) {
            Recovery::Retry { attempt } => {
                warn!(id = self.id, attempt, %error, "transient playback failure");
                self.capture_playhead();
                self.stop_media();
                self.generation += 1;
                self.state = EngineState::Recovering {
                    attempt,
                    due: false,
                };
                self.arm_backoff();
            }
            Recovery::Disable => self.disable(&error),
            Recovery::Abort => {
                warn!(id = self.id, %error, "video source unavailable, stopping");
                self.stop_media();
                self.generation += 1;
                self.state = EngineState::Idle;
            }
            Recovery::Notify => {
                warn!(id = self.id, %error, "playback error");
                self.services
                    .notifier
                    .notice(&format!("Video wallpaper playback error: {}", error.message));
            }
        }
    }

    fn disable(&mut self, error: &MediaError) {
        error!(id = self.id, %error, retries = self.budget.used(), "disabling video wallpaper");

        self.stop_media();
        self.generation += 1;
        self.state = EngineState::Disabled;
        self.entry.source = None;

        if let Err(why) = self.services.store.clear_source() {
            error!(?why, "failed to clear the video source");
        }

        self.services
            .notifier
            .notice("The video could not be played and the wallpaper was disabled");
    }

    fn arm_backoff(&mut self) {
        let id = self.id;
        let generation = self.generation;
        let inserted = self.handle.insert_source(
            Timer::from_duration(self.config.retry_backoff),
            move |_, _, host: &mut H| {
                if let Some(engine) = host.engine_mut(id) {
                    engine.backoff_elapsed(generation);
                }
                TimeoutAction::Drop
            },
        );

        if let Err(why) = inserted {
            error!(id, %why, "failed to schedule recovery");
        }
    }

    fn backoff_elapsed(&mut self, generation: u64) {
        if generation != self.generation {
            return;
        }

        let EngineState::Recovering { attempt, .. } = self.state else {
            return;
        };

        if self.visible {
            info!(id = self.id, attempt, "retrying playback");
            self.start("recovery");
        } else {
            debug!(id = self.id, attempt, "retry deferred until visible");
            self.state = EngineState::Recovering { attempt, due: true };
        }
    }

    fn arm_watchdog(&mut self) {
        if self.watchdog_armed {
            return;
        }

        self.watchdog_armed = true;
        self.watchdog_epoch += 1;

        let id = self.id;
        let epoch = self.watchdog_epoch;
        let interval = self.config.watchdog_interval;
        let inserted = self.handle.insert_source(
            Timer::from_duration(interval),
            move |_, _, host: &mut H| {
                let Some(engine) = host.engine_mut(id) else {
                    return TimeoutAction::Drop;
                };
                if engine.watchdog_epoch != epoch {
                    return TimeoutAction::Drop;
                }

                engine.watchdog_tick();

                if engine.watchdog_epoch == epoch {
                    TimeoutAction::ToDuration(interval)
                } else {
                    TimeoutAction::Drop
                }
            },
        );

        if let Err(why) = inserted {
            self.watchdog_armed = false;
            error!(id, %why, "failed to start stall watchdog");
        }
    }

    /// The running timer notices the new epoch on its next tick and removes itself.
    fn disarm_watchdog(&mut self) {
        if self.watchdog_armed {
            self.watchdog_armed = false;
            self.watchdog_epoch += 1;
        }
        self.watchdog.suspend();
    }

    fn watchdog_tick(&mut self) {
        let _span = debug_span!("WallpaperEngine::watchdog", id = self.id).entered();

        let EngineState::Playing(media) = &self.state else {
            self.watchdog.suspend();
            return;
        };
        if !self.visible {
            return;
        }

        let sample = Sample {
            position: media.position(),
            duration: media.duration(),
            is_playing: media.is_playing(),
        };

        match self.watchdog.check(sample) {
            Verdict::Stalled => {
                warn!(position = ?sample.position, "playback stalled, restarting");
                self.capture_playhead();
                self.start("stalled");
            }
            Verdict::Advancing(position) => self.playhead = position,
            Verdict::Inconclusive => {}
        }
    }
}

fn push_render_params(renderer: &Renderer, entry: &Entry) {
    renderer.set_scaling_mode(entry.scaling_mode);
    renderer.set_transform(&entry.transform);
    renderer.set_brightness(entry.transform.brightness);
}
