// SPDX-License-Identifier: MPL-2.0

//! Scripted media backend for tests. Records every call and answers `load`
//! with whatever the test queued up.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;
use std::time::Duration;

use super::{MediaBackend, MediaEngine, MediaError, MediaEvent, MediaEventSink, PlaybackState};
use crate::decode_target::DecodeTarget;

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Create,
    Load(String),
    Play,
    Pause,
    Seek(Duration),
    Volume(f64),
    Repeat(bool),
    Release,
}

/// Reaction of the next engine to `load`.
#[derive(Debug, Clone)]
pub enum OnLoad {
    Ready,
    Fail(MediaError),
    Silent,
}

#[derive(Default)]
pub struct MediaRecorder {
    calls: RefCell<Vec<Call>>,
    script: RefCell<VecDeque<OnLoad>>,
    sink: RefCell<Option<MediaEventSink>>,
    pub position: Cell<Option<Duration>>,
    pub duration: Cell<Option<Duration>>,
    pub playing: Cell<bool>,
    /// Move the playhead 100 ms forward on every position query while playing.
    pub auto_advance: Cell<bool>,
    /// Error returned by the next `play`.
    pub fail_play: RefCell<Option<MediaError>>,
}

impl MediaRecorder {
    /// Queue the reaction of one future engine. Unscripted engines become ready.
    pub fn script(&self, reaction: OnLoad) {
        self.script.borrow_mut().push_back(reaction);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.borrow().clone()
    }

    pub fn count(&self, call: &Call) -> usize {
        self.calls.borrow().iter().filter(|c| *c == call).count()
    }

    /// Calls made since the most recent engine was created.
    pub fn calls_since_create(&self) -> Vec<Call> {
        let calls = self.calls.borrow();
        let start = calls.iter().rposition(|c| *c == Call::Create).unwrap_or(0);
        calls[start..].to_vec()
    }

    /// Send an event as the most recent engine.
    pub fn emit(&self, event: MediaEvent) {
        if let Some(sink) = self.sink.borrow().as_ref() {
            sink.send(event);
        }
    }

    fn record(&self, call: Call) {
        self.calls.borrow_mut().push(call);
    }
}

pub struct FakeMediaBackend {
    recorder: Rc<MediaRecorder>,
}

impl FakeMediaBackend {
    pub fn new() -> (Rc<Self>, Rc<MediaRecorder>) {
        let recorder = Rc::new(MediaRecorder::default());
        (
            Rc::new(Self {
                recorder: Rc::clone(&recorder),
            }),
            recorder,
        )
    }
}

impl MediaBackend for FakeMediaBackend {
    fn create(
        &self,
        target: DecodeTarget,
        events: MediaEventSink,
    ) -> Result<Box<dyn MediaEngine>, MediaError> {
        self.recorder.record(Call::Create);
        *self.recorder.sink.borrow_mut() = Some(events.clone());
        Ok(Box::new(FakeMedia {
            recorder: Rc::clone(&self.recorder),
            target,
            events,
        }))
    }
}

struct FakeMedia {
    recorder: Rc<MediaRecorder>,
    target: DecodeTarget,
    events: MediaEventSink,
}

impl MediaEngine for FakeMedia {
    fn load(&mut self, uri: &str) -> Result<(), MediaError> {
        self.recorder.record(Call::Load(uri.to_string()));
        let reaction = self.recorder.script.borrow_mut().pop_front().unwrap_or(OnLoad::Ready);
        match reaction {
            OnLoad::Ready => {
                self.events.send(MediaEvent::VideoSize {
                    width: 1920,
                    height: 1080,
                });
                self.events.send(MediaEvent::State(PlaybackState::Ready));
            }
            OnLoad::Fail(error) => self.events.send(MediaEvent::Error(error)),
            OnLoad::Silent => {}
        }
        Ok(())
    }

    fn play(&mut self) -> Result<(), MediaError> {
        self.recorder.record(Call::Play);
        if let Some(error) = self.recorder.fail_play.borrow_mut().take() {
            return Err(error);
        }
        self.recorder.playing.set(true);
        Ok(())
    }

    fn pause(&mut self) {
        self.recorder.record(Call::Pause);
        self.recorder.playing.set(false);
    }

    fn seek(&mut self, position: Duration) {
        self.recorder.record(Call::Seek(position));
        self.recorder.position.set(Some(position));
    }

    fn position(&self) -> Option<Duration> {
        let position = self.recorder.position.get();
        if self.recorder.auto_advance.get() && self.recorder.playing.get() {
            let next = position.unwrap_or_default() + Duration::from_millis(100);
            self.recorder.position.set(Some(next));
            return Some(next);
        }
        position
    }

    fn duration(&self) -> Option<Duration> {
        self.recorder.duration.get()
    }

    fn is_playing(&self) -> bool {
        self.recorder.playing.get()
    }

    fn set_volume(&mut self, volume: f64) {
        self.recorder.record(Call::Volume(volume));
    }

    fn set_repeat(&mut self, repeat: bool) {
        self.recorder.record(Call::Repeat(repeat));
    }

    fn release(&mut self) {
        self.recorder.record(Call::Release);
        self.recorder.playing.set(false);
        self.target.release();
    }
}
