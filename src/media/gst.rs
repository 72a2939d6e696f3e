// SPDX-License-Identifier: MPL-2.0

//! GStreamer playback engine.
//!
//! ```text
//! uridecodebin ─┬─ videoconvert ! video/x-raw,format=BGRx ! appsink → DecodeTarget
//!               └─ queue ! audioconvert ! audioresample ! volume ! autoaudiosink
//! ```
//!
//! The audio branch is only attached when the engine is not muted. Bus
//! messages are translated on the streaming thread that posts them and
//! forwarded through the [`MediaEventSink`].

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;
use tracing::{debug, info, warn};

use super::{
    MediaBackend, MediaEngine, MediaError, MediaErrorKind, MediaEvent, MediaEventSink,
    PlaybackState,
};
use crate::decode_target::{DecodeTarget, DecodedFrame, PixelFormat};

/// Creates [`GstEngine`]s. Initializes GStreamer once.
#[derive(Debug)]
pub struct GstBackend;

impl GstBackend {
    pub fn new() -> eyre::Result<Self> {
        gst::init()?;
        demote_broken_nvidia_decoders();
        Ok(Self)
    }
}

impl MediaBackend for GstBackend {
    fn create(
        &self,
        target: DecodeTarget,
        events: MediaEventSink,
    ) -> Result<Box<dyn MediaEngine>, MediaError> {
        Ok(Box::new(GstEngine {
            target,
            events,
            pipeline: None,
            volume: Arc::new(AtomicU64::new(0.0f64.to_bits())),
            repeat: Arc::new(AtomicBool::new(true)),
        }))
    }
}

/// Demote NVIDIA decoders if CUDA is not actually functional.
///
/// With the plugins installed but no usable CUDA device the nv*dec elements
/// are registered yet fail to instantiate, and decodebin would still prefer
/// them over working software decoders.
fn demote_broken_nvidia_decoders() {
    static DEMOTED: std::sync::Once = std::sync::Once::new();

    DEMOTED.call_once(|| {
        let nvidia_decoders = [
            "nvh264dec",
            "nvh265dec",
            "nvvp9dec",
            "nvav1dec",
            "nvmpegvideodec",
            "nvmpeg4videodec",
        ];

        for decoder_name in nvidia_decoders {
            if let Some(factory) = gst::ElementFactory::find(decoder_name) {
                if factory.create().build().is_err() {
                    warn!(
                        decoder = decoder_name,
                        "NVIDIA decoder failed to instantiate (CUDA unavailable?), demoting"
                    );
                    factory.set_rank(gst::Rank::NONE);
                }
            }
        }
    });
}

pub struct GstEngine {
    target: DecodeTarget,
    events: MediaEventSink,
    pipeline: Option<gst::Pipeline>,
    volume: Arc<AtomicU64>,
    repeat: Arc<AtomicBool>,
}

fn init_error(why: impl std::fmt::Display) -> MediaError {
    MediaError::new(MediaErrorKind::DecoderInit, why.to_string())
}

fn classify_gst_error(error: &gst::glib::Error, details: Option<&str>) -> MediaError {
    let message = match details {
        Some(details) => format!("{error} ({details})"),
        None => error.to_string(),
    };

    let kind = if let Some(resource) = error.kind::<gst::ResourceError>() {
        match resource {
            gst::ResourceError::NotFound | gst::ResourceError::OpenRead => {
                MediaErrorKind::SourceNotFound
            }
            gst::ResourceError::Busy => MediaErrorKind::ResourcesReclaimed,
            _ => MediaErrorKind::Other,
        }
    } else if let Some(stream) = error.kind::<gst::StreamError>() {
        match stream {
            gst::StreamError::CodecNotFound
            | gst::StreamError::TypeNotFound
            | gst::StreamError::WrongType
            | gst::StreamError::Decode => MediaErrorKind::DecoderInit,
            gst::StreamError::NotImplemented | gst::StreamError::Format => {
                MediaErrorKind::DecoderQuery
            }
            _ => MediaErrorKind::Other,
        }
    } else if let Some(core) = error.kind::<gst::CoreError>() {
        match core {
            gst::CoreError::MissingPlugin | gst::CoreError::Negotiation => {
                MediaErrorKind::DecoderInit
            }
            gst::CoreError::Caps => MediaErrorKind::DecoderQuery,
            _ => MediaErrorKind::Other,
        }
    } else if let Some(gst::LibraryError::Init) = error.kind::<gst::LibraryError>() {
        MediaErrorKind::DecoderInit
    } else {
        MediaErrorKind::Other
    };

    MediaError::new(kind, message)
}

/// `queue ! audioconvert ! audioresample ! volume ! autoaudiosink` fed by `src`.
fn attach_audio(pipeline: &gst::Pipeline, src: &gst::Pad, volume: f64) -> eyre::Result<()> {
    let queue = gst::ElementFactory::make("queue").build()?;
    let convert = gst::ElementFactory::make("audioconvert").build()?;
    let resample = gst::ElementFactory::make("audioresample").build()?;
    let gain = gst::ElementFactory::make("volume")
        .name("volume")
        .property("volume", volume)
        .build()?;
    let sink = gst::ElementFactory::make("autoaudiosink").build()?;

    let elements = [&queue, &convert, &resample, &gain, &sink];
    pipeline.add_many(elements)?;
    gst::Element::link_many(elements)?;
    for element in elements {
        element.sync_state_with_parent()?;
    }

    let sink_pad = queue
        .static_pad("sink")
        .ok_or_else(|| eyre::eyre!("queue has no sink pad"))?;
    src.link(&sink_pad)?;
    Ok(())
}

impl GstEngine {
    fn build_pipeline(&self, uri: &str) -> Result<gst::Pipeline, MediaError> {
        let pipeline = gst::Pipeline::new();

        let decode = gst::ElementFactory::make("uridecodebin")
            .property("uri", uri)
            .build()
            .map_err(init_error)?;
        let convert = gst::ElementFactory::make("videoconvert")
            .build()
            .map_err(init_error)?;
        let appsink = gst_app::AppSink::builder()
            .caps(
                &gst_video::VideoCapsBuilder::new()
                    .format(gst_video::VideoFormat::Bgrx)
                    .build(),
            )
            .max_buffers(2)
            .drop(true)
            .build();

        pipeline
            .add_many([&decode, &convert, appsink.upcast_ref()])
            .map_err(init_error)?;
        convert.link(&appsink).map_err(init_error)?;

        let convert_weak = convert.downgrade();
        let pipeline_weak = pipeline.downgrade();
        let volume = Arc::clone(&self.volume);
        decode.connect_pad_added(move |_, pad| {
            let caps = pad.current_caps().unwrap_or_else(|| pad.query_caps(None));
            let Some(structure) = caps.structure(0) else {
                return;
            };
            let name = structure.name();

            if name.starts_with("video/") {
                let Some(sink_pad) = convert_weak
                    .upgrade()
                    .and_then(|convert| convert.static_pad("sink"))
                else {
                    return;
                };
                if sink_pad.is_linked() {
                    debug!("ignoring additional video stream");
                    return;
                }
                if let Err(why) = pad.link(&sink_pad) {
                    warn!(?why, "failed to link video stream");
                }
            } else if name.starts_with("audio/") {
                let volume = f64::from_bits(volume.load(Ordering::Acquire));
                if volume <= 0.0 {
                    return;
                }
                let Some(pipeline) = pipeline_weak.upgrade() else {
                    return;
                };
                if let Err(why) = attach_audio(&pipeline, pad, volume) {
                    warn!(?why, "audio output unavailable, playing muted");
                }
            }
        });

        let target = self.target.clone();
        let events = self.events.clone();
        let last_size = AtomicU64::new(0);
        appsink.set_callbacks(
            gst_app::AppSinkCallbacks::builder()
                .new_sample(move |appsink| {
                    let sample = match appsink.pull_sample() {
                        Ok(sample) => sample,
                        Err(why) => {
                            warn!(?why, "appsink pull_sample failed");
                            return Ok(gst::FlowSuccess::Ok);
                        }
                    };

                    let (Some(buffer), Some(caps)) = (sample.buffer(), sample.caps()) else {
                        return Ok(gst::FlowSuccess::Ok);
                    };
                    let Ok(info) = gst_video::VideoInfo::from_caps(caps) else {
                        return Ok(gst::FlowSuccess::Ok);
                    };

                    let (width, height) = (info.width(), info.height());
                    let packed = (u64::from(width) << 32) | u64::from(height);
                    if last_size.swap(packed, Ordering::AcqRel) != packed {
                        events.send(MediaEvent::VideoSize { width, height });
                    }

                    let Ok(map) = buffer.map_readable() else {
                        tracing::trace!("skipped frame: buffer map failed");
                        return Ok(gst::FlowSuccess::Ok);
                    };

                    let stride = info.stride().first().copied().unwrap_or(0).max(0) as u32;
                    let pts = buffer.pts().map(|pts| Duration::from_nanos(pts.nseconds()));
                    let frame = DecodedFrame::new(
                        map.as_slice().to_vec(),
                        width,
                        height,
                        stride,
                        PixelFormat::Bgrx,
                    )
                    .with_pts(pts);

                    if !target.push(frame) {
                        tracing::trace!("decode target revoked, dropping frame");
                    }
                    Ok(gst::FlowSuccess::Ok)
                })
                .build(),
        );

        let bus = pipeline
            .bus()
            .ok_or_else(|| init_error("pipeline without a bus"))?;
        let events = self.events.clone();
        let repeat = Arc::clone(&self.repeat);
        let pipeline_weak = pipeline.downgrade();
        bus.set_sync_handler(move |_, msg| {
            use gst::MessageView;

            match msg.view() {
                MessageView::Eos(_) => {
                    if repeat.load(Ordering::Acquire) {
                        if let Some(pipeline) = pipeline_weak.upgrade() {
                            debug!("video EOS, seeking to start");
                            pipeline.call_async(|pipeline| {
                                let flags = gst::SeekFlags::FLUSH | gst::SeekFlags::KEY_UNIT;
                                if let Err(why) = pipeline.seek_simple(flags, gst::ClockTime::ZERO)
                                {
                                    warn!(?why, "failed to seek to start for loop");
                                }
                            });
                        }
                    } else {
                        events.send(MediaEvent::State(PlaybackState::Ended));
                    }
                }
                MessageView::Error(err) => {
                    let details = err.debug();
                    let error = classify_gst_error(&err.error(), details.as_ref().map(|d| d.as_str()));
                    warn!(
                        src = ?err.src().map(|s| s.path_string()),
                        %error,
                        "GStreamer pipeline error"
                    );
                    events.send(MediaEvent::Error(error));
                }
                MessageView::Warning(warning) => {
                    warn!(
                        src = ?warning.src().map(|s| s.path_string()),
                        error = %warning.error(),
                        "GStreamer pipeline warning"
                    );
                }
                MessageView::Buffering(buffering) => {
                    if buffering.percent() < 100 {
                        events.send(MediaEvent::State(PlaybackState::Buffering));
                    }
                }
                MessageView::StateChanged(state) => {
                    let from_pipeline = msg
                        .src()
                        .is_some_and(|src| src.downcast_ref::<gst::Pipeline>().is_some());
                    if from_pipeline {
                        debug!(old = ?state.old(), new = ?state.current(), "pipeline state changed");
                        match (state.old(), state.current()) {
                            (gst::State::Ready, gst::State::Paused) => {
                                events.send(MediaEvent::State(PlaybackState::Ready));
                            }
                            (_, gst::State::Null) => {
                                events.send(MediaEvent::State(PlaybackState::Idle));
                            }
                            _ => {}
                        }
                    }
                }
                _ => {}
            }

            gst::BusSyncReply::Drop
        });

        Ok(pipeline)
    }
}

impl MediaEngine for GstEngine {
    fn load(&mut self, uri: &str) -> Result<(), MediaError> {
        self.release();

        info!(%uri, "loading video");
        let pipeline = self.build_pipeline(uri)?;

        if let Err(why) = pipeline.set_state(gst::State::Paused) {
            let _ = pipeline.set_state(gst::State::Null);
            return Err(init_error(format!("failed to preroll pipeline: {why:?}")));
        }

        self.pipeline = Some(pipeline);
        Ok(())
    }

    fn play(&mut self) -> Result<(), MediaError> {
        let pipeline = self
            .pipeline
            .as_ref()
            .ok_or_else(|| MediaError::new(MediaErrorKind::Other, "nothing loaded"))?;

        pipeline.set_state(gst::State::Playing).map_err(|why| {
            MediaError::new(
                MediaErrorKind::Other,
                format!("failed to start pipeline: {why:?}"),
            )
        })?;
        Ok(())
    }

    fn pause(&mut self) {
        if let Some(pipeline) = &self.pipeline {
            if let Err(why) = pipeline.set_state(gst::State::Paused) {
                warn!(?why, "failed to pause pipeline");
            }
        }
    }

    fn seek(&mut self, position: Duration) {
        let Some(pipeline) = &self.pipeline else {
            return;
        };

        let target = gst::ClockTime::from_nseconds(position.as_nanos() as u64);
        let flags = gst::SeekFlags::FLUSH | gst::SeekFlags::KEY_UNIT;
        if let Err(why) = pipeline.seek_simple(flags, target) {
            warn!(?why, ?position, "seek failed");
        }
    }

    fn position(&self) -> Option<Duration> {
        let position = self
            .pipeline
            .as_ref()?
            .query_position::<gst::ClockTime>()?;
        Some(Duration::from_nanos(position.nseconds()))
    }

    fn duration(&self) -> Option<Duration> {
        let duration = self
            .pipeline
            .as_ref()?
            .query_duration::<gst::ClockTime>()?;
        Some(Duration::from_nanos(duration.nseconds()))
    }

    fn is_playing(&self) -> bool {
        self.pipeline
            .as_ref()
            .is_some_and(|pipeline| pipeline.current_state() == gst::State::Playing)
    }

    fn set_volume(&mut self, volume: f64) {
        let volume = volume.clamp(0.0, 1.0);
        self.volume.store(volume.to_bits(), Ordering::Release);

        if let Some(gain) = self
            .pipeline
            .as_ref()
            .and_then(|pipeline| pipeline.by_name("volume"))
        {
            gain.set_property("volume", volume);
        }
    }

    fn set_repeat(&mut self, repeat: bool) {
        self.repeat.store(repeat, Ordering::Release);
    }

    fn release(&mut self) {
        if let Some(pipeline) = self.pipeline.take() {
            if let Some(bus) = pipeline.bus() {
                bus.unset_sync_handler();
            }
            if let Err(why) = pipeline.set_state(gst::State::Null) {
                warn!(?why, "failed to stop video pipeline");
            }
            debug!("video pipeline released");
        }
    }
}

impl Drop for GstEngine {
    fn drop(&mut self) {
        self.release();
    }
}
