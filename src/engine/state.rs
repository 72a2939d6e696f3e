// SPDX-License-Identifier: MPL-2.0

//! Lifecycle states. Each variant carries exactly the data valid in it, so a
//! media engine handle can only be reached in states that have one.

use std::fmt;

use crate::media::MediaEngine;

pub enum StartPhase {
    /// Waiting off-thread for the renderer to lend a decode target.
    AwaitingSurface { uri: String },
    /// Media engine created and loading; waiting for it to report ready.
    AwaitingReady(Box<dyn MediaEngine>),
}

pub enum EngineState {
    Idle,
    Starting(StartPhase),
    Playing(Box<dyn MediaEngine>),
    Paused(Box<dyn MediaEngine>),
    /// Backing off before retry number `attempt`. `due` once the backoff
    /// elapsed while hidden.
    Recovering { attempt: u32, due: bool },
    Disabled,
}

/// Data-less view of [`EngineState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Starting,
    Playing,
    Paused,
    Recovering,
    Disabled,
}

impl EngineState {
    #[must_use]
    pub fn phase(&self) -> Phase {
        match self {
            Self::Idle => Phase::Idle,
            Self::Starting(_) => Phase::Starting,
            Self::Playing(_) => Phase::Playing,
            Self::Paused(_) => Phase::Paused,
            Self::Recovering { .. } => Phase::Recovering,
            Self::Disabled => Phase::Disabled,
        }
    }

    /// The live media engine, if this state has one.
    pub fn media(&self) -> Option<&dyn MediaEngine> {
        match self {
            Self::Starting(StartPhase::AwaitingReady(media))
            | Self::Playing(media)
            | Self::Paused(media) => Some(media.as_ref()),
            _ => None,
        }
    }
}

impl fmt::Debug for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Starting(StartPhase::AwaitingSurface { uri }) => f
                .debug_struct("Starting")
                .field("awaiting", &"surface")
                .field("uri", uri)
                .finish(),
            Self::Starting(StartPhase::AwaitingReady(_)) => f
                .debug_struct("Starting")
                .field("awaiting", &"ready")
                .finish(),
            Self::Recovering { attempt, due } => f
                .debug_struct("Recovering")
                .field("attempt", attempt)
                .field("due", due)
                .finish(),
            other => fmt::Debug::fmt(&other.phase(), f),
        }
    }
}
