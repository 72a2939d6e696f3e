// SPDX-License-Identifier: MPL-2.0

use std::cell::RefCell;
use std::path::Path;
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use sctk::reexports::calloop::EventLoop;
use tempfile::TempDir;
use vidpaper_config::{ConfigStore, Entry, PlaybackMode, ScalingMode, StatusBarColor};

use super::*;
use crate::gpu::fake::{FakeGpuFactory, GpuCounters, test_surface};
use crate::media::fake::{Call, FakeMediaBackend, MediaRecorder, OnLoad};
use crate::media::MediaErrorKind;

struct Host {
    engine: Option<WallpaperEngine<Host>>,
}

impl EngineHost for Host {
    fn engine_mut(&mut self, id: EngineId) -> Option<&mut WallpaperEngine<Self>> {
        self.engine.as_mut().filter(|engine| engine.id() == id)
    }
}

#[derive(Default)]
struct RecordingNotifier {
    notices: RefCell<Vec<String>>,
}

impl Notifier for RecordingNotifier {
    fn notice(&self, message: &str) {
        self.notices.borrow_mut().push(message.to_string());
    }
}

const FAST: EngineConfig = EngineConfig {
    surface_wait: Duration::from_secs(1),
    retry_backoff: Duration::from_millis(20),
    max_retries: 3,
    watchdog_interval: Duration::from_millis(30),
    watchdog_min_duration: Duration::from_millis(2000),
};

struct Harness {
    event_loop: EventLoop<'static, Host>,
    host: Host,
    media: Rc<MediaRecorder>,
    gpu: Arc<GpuCounters>,
    notifier: Rc<RecordingNotifier>,
    store: ConfigStore,
    dir: TempDir,
}

impl Harness {
    fn new(configure: impl FnOnce(Entry) -> Entry) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let video = write_video(dir.path(), "clip.mp4");
        let store = ConfigStore::open(dir.path().join("config.ron"));
        store.save(&configure(Entry::default().source(video))).unwrap();

        let event_loop = EventLoop::<Host>::try_new().unwrap();
        let (gpu_factory, gpu) = FakeGpuFactory::new();
        let (media_backend, media) = FakeMediaBackend::new();
        let notifier = Rc::new(RecordingNotifier::default());

        let services = Services {
            gpu: gpu_factory,
            media: media_backend,
            notifier: notifier.clone(),
            store: store.clone(),
        };

        let engine = WallpaperEngine::new(1, event_loop.handle(), services, FAST).unwrap();

        Self {
            event_loop,
            host: Host {
                engine: Some(engine),
            },
            media,
            gpu,
            notifier,
            store,
            dir,
        }
    }

    fn engine(&mut self) -> &mut WallpaperEngine<Host> {
        self.host.engine.as_mut().unwrap()
    }

    fn phase(&self) -> Phase {
        self.host.engine.as_ref().unwrap().phase()
    }

    fn pump_until(&mut self, mut done: impl FnMut(&Self) -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !done(self) {
            if Instant::now() > deadline {
                return false;
            }
            self.event_loop
                .dispatch(Some(Duration::from_millis(5)), &mut self.host)
                .unwrap();
        }
        true
    }

    fn pump_for(&mut self, duration: Duration) {
        let deadline = Instant::now() + duration;
        while Instant::now() < deadline {
            self.event_loop
                .dispatch(Some(Duration::from_millis(5)), &mut self.host)
                .unwrap();
        }
    }

    fn wait_for_phase(&mut self, phase: Phase) {
        assert!(
            self.pump_until(|h| h.phase() == phase),
            "never reached {phase:?}, stuck in {:?}",
            self.phase()
        );
    }

    fn start_playing(&mut self) {
        self.engine().surface_created(test_surface(1920, 1080));
        self.engine().visibility_changed(true);
        self.wait_for_phase(Phase::Playing);
    }

    fn update_config(&self, change: impl FnOnce(Entry) -> Entry) {
        let entry = change(self.store.load());
        self.store.save(&entry).unwrap();
    }

    fn creates(&self) -> usize {
        self.media.count(&Call::Create)
    }
}

fn write_video(dir: &Path, name: &str) -> String {
    let path = dir.join(name);
    std::fs::write(&path, b"\0\0\0\x18ftypmp42").unwrap();
    path.to_str().unwrap().to_string()
}

#[test]
fn starts_playing_once_surface_and_visibility_arrive() {
    let mut h = Harness::new(|entry| entry);
    h.start_playing();

    let calls = h.media.calls();
    assert_eq!(calls[0], Call::Create);
    assert!(calls.contains(&Call::Volume(0.0)));
    assert!(calls.contains(&Call::Repeat(true)));
    assert!(
        calls
            .iter()
            .any(|call| matches!(call, Call::Load(uri) if uri.starts_with("file://") && uri.ends_with("clip.mp4")))
    );
    assert_eq!(calls.last(), Some(&Call::Play));
    assert_eq!(h.gpu.inits.load(Ordering::SeqCst), 1);
}

#[test]
fn audio_setting_unmutes() {
    let mut h = Harness::new(|entry| entry.audio(true));
    h.start_playing();
    assert!(h.media.calls().contains(&Call::Volume(1.0)));
}

#[test]
fn ready_while_hidden_holds_paused() {
    let mut h = Harness::new(|entry| entry);
    h.engine().surface_created(test_surface(1920, 1080));
    h.wait_for_phase(Phase::Paused);
    assert_eq!(h.media.count(&Call::Play), 0);

    h.engine().visibility_changed(true);
    assert_eq!(h.phase(), Phase::Playing);
}

#[test]
fn hiding_pauses_and_showing_resumes() {
    let mut h = Harness::new(|entry| entry);
    h.start_playing();
    h.media.position.set(Some(Duration::from_secs(5)));

    h.engine().visibility_changed(false);
    assert_eq!(h.phase(), Phase::Paused);
    assert_eq!(h.engine().playhead(), Duration::from_secs(5));
    assert_eq!(h.media.calls().last(), Some(&Call::Pause));

    h.engine().visibility_changed(true);
    assert_eq!(h.phase(), Phase::Playing);
    assert_eq!(h.media.calls().last(), Some(&Call::Play));
    assert_eq!(h.creates(), 1);
}

#[test]
fn settings_change_restarts_at_the_same_position() {
    let mut h = Harness::new(|entry| entry);
    h.start_playing();
    h.media.position.set(Some(Duration::from_secs(7)));

    h.update_config(|entry| entry.scaling_mode(ScalingMode::Fit));
    h.engine().on_signal(Signal::SettingsChanged);
    assert!(h.pump_until(|h| h.creates() == 2 && h.phase() == Phase::Playing));

    let calls = h.media.calls_since_create();
    assert!(calls.contains(&Call::Seek(Duration::from_secs(7))), "{calls:?}");
    assert_eq!(h.media.count(&Call::Release), 1);
}

#[test]
fn source_change_starts_from_the_beginning() {
    let mut h = Harness::new(|entry| entry);
    h.start_playing();
    h.media.position.set(Some(Duration::from_secs(7)));

    let other = write_video(h.dir.path(), "other.webm");
    h.update_config(|entry| entry.source(other));
    h.engine().on_signal(Signal::SourceChanged);
    assert!(h.pump_until(|h| h.creates() == 2 && h.phase() == Phase::Playing));

    let calls = h.media.calls_since_create();
    assert!(!calls.iter().any(|call| matches!(call, Call::Seek(_))), "{calls:?}");
    assert!(
        calls
            .iter()
            .any(|call| matches!(call, Call::Load(uri) if uri.ends_with("other.webm")))
    );
    assert_eq!(h.engine().playhead(), Duration::ZERO);
}

#[test]
fn status_bar_color_does_not_touch_playback() {
    let mut h = Harness::new(|entry| entry);
    h.start_playing();
    assert_eq!(h.engine().status_bar_hint(), None);

    h.update_config(|entry| entry.status_bar_color(StatusBarColor::Dark));
    h.engine().on_signal(Signal::StatusBarColorChanged);
    h.pump_for(Duration::from_millis(50));

    assert_eq!(h.creates(), 1);
    assert_eq!(h.phase(), Phase::Playing);
    assert!(h.engine().status_bar_hint().is_some());
}

#[test]
fn one_shot_holds_the_last_frame_then_restarts_on_return() {
    let mut h = Harness::new(|entry| entry.playback_mode(PlaybackMode::OneShot));
    h.start_playing();
    assert!(h.media.calls().contains(&Call::Repeat(false)));

    h.media.position.set(Some(Duration::from_secs(10)));
    h.media.emit(MediaEvent::State(PlaybackState::Ended));
    h.wait_for_phase(Phase::Paused);
    assert_eq!(h.engine().playhead(), Duration::from_secs(10));

    // Nothing happens on its own while the last frame is held.
    h.pump_for(Duration::from_millis(100));
    assert_eq!(h.media.calls().last(), Some(&Call::Pause));
    assert_eq!(h.phase(), Phase::Paused);

    h.engine().visibility_changed(false);
    h.engine().visibility_changed(true);

    assert_eq!(h.phase(), Phase::Playing);
    let calls = h.media.calls();
    let tail = &calls[calls.len() - 2..];
    assert_eq!(tail, [Call::Seek(Duration::ZERO), Call::Play]);
    assert_eq!(h.engine().playhead(), Duration::ZERO);
    assert_eq!(h.creates(), 1);
}

#[test]
fn one_shot_preview_stays_on_the_last_frame() {
    let mut h = Harness::new(|entry| entry.playback_mode(PlaybackMode::OneShot).preview(true));
    h.start_playing();

    h.media.emit(MediaEvent::State(PlaybackState::Ended));
    h.wait_for_phase(Phase::Paused);

    h.engine().visibility_changed(false);
    h.engine().visibility_changed(true);
    assert_eq!(h.phase(), Phase::Paused);
    assert_eq!(h.media.count(&Call::Play), 1);
}

#[test]
fn looping_restarts_on_end() {
    let mut h = Harness::new(|entry| entry);
    h.start_playing();

    h.media.emit(MediaEvent::State(PlaybackState::Ended));
    assert!(h.pump_until(|h| h.media.calls().last() == Some(&Call::Seek(Duration::ZERO))));
    assert_eq!(h.phase(), Phase::Playing);
}

#[test]
fn transient_failures_exhaust_the_budget_then_disable() {
    let mut h = Harness::new(|entry| entry);
    for _ in 0..4 {
        h.media.script(OnLoad::Fail(MediaError::new(
            MediaErrorKind::DecoderInit,
            "decoder failed to initialize",
        )));
    }

    h.engine().surface_created(test_surface(1920, 1080));
    h.engine().visibility_changed(true);
    h.wait_for_phase(Phase::Disabled);
    h.pump_for(Duration::from_millis(100));

    assert_eq!(h.creates(), 4);
    assert_eq!(h.phase(), Phase::Disabled);
    assert_eq!(h.store.load().source, None);
    assert_eq!(h.notifier.notices.borrow().len(), 1);
}

#[test]
fn recurring_failures_after_playback_advanced_still_disable() {
    let mut h = Harness::new(|entry| entry);
    h.media.duration.set(Some(Duration::from_secs(30)));
    h.media.auto_advance.set(true);
    h.start_playing();

    for round in 0..3 {
        h.pump_for(Duration::from_millis(100));
        h.media.emit(MediaEvent::Error(MediaError::new(
            MediaErrorKind::DecoderInit,
            "decoder failed to initialize",
        )));
        assert!(
            h.pump_until(|h| h.creates() == round + 2 && h.phase() == Phase::Playing),
            "round {round} stuck in {:?}",
            h.phase()
        );
    }

    h.pump_for(Duration::from_millis(100));
    h.media.emit(MediaEvent::Error(MediaError::new(
        MediaErrorKind::DecoderInit,
        "decoder failed to initialize",
    )));
    h.wait_for_phase(Phase::Disabled);

    assert_eq!(h.creates(), 4);
    assert_eq!(h.store.load().source, None);
    assert_eq!(h.notifier.notices.borrow().len(), 1);
}

#[test]
fn recovery_succeeds_within_budget() {
    let mut h = Harness::new(|entry| entry);
    h.media.script(OnLoad::Fail(MediaError::new(
        MediaErrorKind::ResourcesReclaimed,
        "decoder reclaimed",
    )));

    h.start_playing();
    assert_eq!(h.creates(), 2);
    assert!(h.store.load().source.is_some());
    assert!(h.notifier.notices.borrow().is_empty());
}

#[test]
fn recovery_waits_for_visibility() {
    let mut h = Harness::new(|entry| entry);
    h.media.script(OnLoad::Fail(MediaError::new(
        MediaErrorKind::DecoderInit,
        "decoder failed to initialize",
    )));

    h.engine().surface_created(test_surface(1920, 1080));
    h.wait_for_phase(Phase::Recovering);
    h.pump_for(Duration::from_millis(80));
    assert_eq!(h.creates(), 1);
    assert_eq!(h.phase(), Phase::Recovering);

    h.engine().visibility_changed(true);
    h.wait_for_phase(Phase::Playing);
    assert_eq!(h.creates(), 2);
}

#[test]
fn out_of_memory_disables_immediately() {
    let mut h = Harness::new(|entry| entry);
    h.media.script(OnLoad::Fail(MediaError::new(
        MediaErrorKind::DecoderInit,
        "codec allocation: out of memory",
    )));

    h.engine().surface_created(test_surface(1920, 1080));
    h.engine().visibility_changed(true);
    h.wait_for_phase(Phase::Disabled);

    assert_eq!(h.creates(), 1);
    assert_eq!(h.store.load().source, None);
    assert_eq!(h.notifier.notices.borrow().len(), 1);
}

#[test]
fn disabled_wallpaper_waits_for_a_new_source() {
    let mut h = Harness::new(|entry| entry);
    h.media.script(OnLoad::Fail(MediaError::new(MediaErrorKind::OutOfMemory, "")));
    h.start_playing_or(Phase::Disabled);

    h.update_config(|entry| entry.scaling_mode(ScalingMode::Stretch));
    h.engine().on_signal(Signal::SettingsChanged);
    h.engine().on_signal(Signal::SourceChanged);
    h.pump_for(Duration::from_millis(50));
    assert_eq!(h.phase(), Phase::Disabled);
    assert_eq!(h.creates(), 1);

    let video = write_video(h.dir.path(), "fresh.mkv");
    h.update_config(|entry| entry.source(video));
    h.engine().on_signal(Signal::SourceChanged);
    h.wait_for_phase(Phase::Playing);
    assert_eq!(h.creates(), 2);
}

#[test]
fn missing_source_aborts_quietly() {
    let mut h = Harness::new(|entry| entry);
    h.media.script(OnLoad::Fail(MediaError::new(
        MediaErrorKind::SourceNotFound,
        "file vanished",
    )));
    h.start_playing_or(Phase::Idle);

    assert_eq!(h.creates(), 1);
    assert!(h.store.load().source.is_some());
    assert!(h.notifier.notices.borrow().is_empty());
}

#[test]
fn unplayable_source_never_creates_an_engine() {
    let mut h = Harness::new(|entry| entry.source("/nonexistent/clip.mp4".to_string()));
    h.engine().surface_created(test_surface(1920, 1080));
    h.engine().visibility_changed(true);
    h.pump_for(Duration::from_millis(50));

    assert_eq!(h.phase(), Phase::Idle);
    assert_eq!(h.creates(), 0);
}

#[test]
fn other_errors_only_notify() {
    let mut h = Harness::new(|entry| entry);
    h.start_playing();

    h.media.emit(MediaEvent::Error(MediaError::new(MediaErrorKind::Other, "odd")));
    assert!(h.pump_until(|h| !h.notifier.notices.borrow().is_empty()));
    assert_eq!(h.phase(), Phase::Playing);
    assert_eq!(h.creates(), 1);
}

#[test]
fn failed_play_holds_paused_until_shown_again() {
    let mut h = Harness::new(|entry| entry);
    *h.media.fail_play.borrow_mut() = Some(MediaError::new(MediaErrorKind::Other, "sink busy"));
    h.start_playing_or(Phase::Paused);

    assert_eq!(h.notifier.notices.borrow().len(), 1);
    assert_eq!(h.creates(), 1);

    h.engine().visibility_changed(false);
    h.engine().visibility_changed(true);
    assert_eq!(h.phase(), Phase::Playing);
    assert_eq!(h.media.count(&Call::Play), 2);
}

#[test]
fn stall_restarts_exactly_once() {
    let mut h = Harness::new(|entry| entry);
    h.media.duration.set(Some(Duration::from_secs(30)));
    h.media.position.set(Some(Duration::from_secs(3)));
    h.start_playing();

    assert!(h.pump_until(|h| h.creates() == 2 && h.phase() == Phase::Playing));
    h.pump_for(Duration::from_millis(300));

    assert_eq!(h.creates(), 2);
    let calls = h.media.calls_since_create();
    assert!(calls.contains(&Call::Seek(Duration::from_secs(3))), "{calls:?}");
}

#[test]
fn restarted_engine_stalling_elsewhere_restarts_again() {
    let mut h = Harness::new(|entry| entry);
    h.media.duration.set(Some(Duration::from_secs(30)));
    h.media.position.set(Some(Duration::from_secs(3)));
    h.start_playing();
    assert!(h.pump_until(|h| h.creates() == 2 && h.phase() == Phase::Playing));

    h.media.position.set(Some(Duration::from_secs(9)));
    assert!(h.pump_until(|h| h.creates() == 3 && h.phase() == Phase::Playing));
    h.pump_for(Duration::from_millis(300));

    assert_eq!(h.creates(), 3);
    let calls = h.media.calls_since_create();
    assert!(calls.contains(&Call::Seek(Duration::from_secs(9))), "{calls:?}");
}

#[test]
fn advancing_playback_is_left_alone() {
    let mut h = Harness::new(|entry| entry);
    h.media.duration.set(Some(Duration::from_secs(30)));
    h.start_playing();

    for second in 1..8 {
        h.media.position.set(Some(Duration::from_secs(second)));
        h.pump_for(Duration::from_millis(40));
    }

    assert_eq!(h.creates(), 1);
    assert!(h.engine().playhead() > Duration::ZERO);
}

#[test]
fn short_videos_are_not_watched() {
    let mut h = Harness::new(|entry| entry);
    h.media.duration.set(Some(Duration::from_millis(1500)));
    h.media.position.set(Some(Duration::from_millis(200)));
    h.start_playing();

    h.pump_for(Duration::from_millis(200));
    assert_eq!(h.creates(), 1);
}

#[test]
fn stale_generations_are_ignored() {
    let mut h = Harness::new(|entry| entry);
    h.start_playing();

    let stale = h.engine().generation - 1;
    h.engine().handle_message(EngineMessage::Media {
        generation: stale,
        event: MediaEvent::Error(MediaError::new(MediaErrorKind::OutOfMemory, "")),
    });
    h.engine().handle_message(EngineMessage::SurfaceWait {
        generation: stale,
        ready: false,
    });

    assert_eq!(h.phase(), Phase::Playing);
    assert!(h.store.load().source.is_some());
}

#[test]
fn events_from_a_replaced_engine_are_dropped() {
    let mut h = Harness::new(|entry| entry);
    h.media.script(OnLoad::Silent);
    h.engine().surface_created(test_surface(1920, 1080));
    h.engine().visibility_changed(true);
    assert!(h.pump_until(|h| h.media.calls().iter().any(|call| matches!(call, Call::Load(_)))));
    assert_eq!(h.phase(), Phase::Starting);

    // The first engine never became ready; replace it before it does.
    h.engine().on_signal(Signal::SettingsChanged);
    h.wait_for_phase(Phase::Playing);
    assert_eq!(h.creates(), 2);

    // A late error from the first engine is tagged with its generation.
    let current = h.engine().generation;
    h.engine().handle_message(EngineMessage::Media {
        generation: current - 1,
        event: MediaEvent::Error(MediaError::new(MediaErrorKind::DecoderInit, "late")),
    });
    h.pump_for(Duration::from_millis(50));
    assert_eq!(h.phase(), Phase::Playing);
    assert_eq!(h.creates(), 2);
}

#[test]
fn surface_loss_releases_everything() {
    let mut h = Harness::new(|entry| entry);
    h.start_playing();
    h.media.position.set(Some(Duration::from_secs(4)));

    h.engine().surface_destroyed();
    assert_eq!(h.phase(), Phase::Idle);
    assert_eq!(h.media.calls().last(), Some(&Call::Release));
    assert_eq!(h.gpu.teardowns.load(Ordering::SeqCst), 1);
    assert_eq!(h.engine().playhead(), Duration::from_secs(4));

    // A new surface resumes where playback left off.
    h.engine().surface_created(test_surface(1280, 720));
    assert!(h.pump_until(|h| h.creates() == 2 && h.phase() == Phase::Playing));
    assert!(h.media.calls_since_create().contains(&Call::Seek(Duration::from_secs(4))));
}

#[test]
fn destroyed_engine_ignores_later_messages() {
    let mut h = Harness::new(|entry| entry);
    h.start_playing();

    h.engine().engine_destroyed();
    h.media.emit(MediaEvent::State(PlaybackState::Ended));
    h.pump_for(Duration::from_millis(30));

    assert_eq!(h.phase(), Phase::Idle);
    assert_eq!(h.media.count(&Call::Release), 1);
}

impl Harness {
    /// Create the surface, become visible and wait until startup settles in `phase`.
    fn start_playing_or(&mut self, phase: Phase) {
        self.engine().surface_created(test_surface(1920, 1080));
        self.engine().visibility_changed(true);
        self.wait_for_phase(phase);
    }
}
