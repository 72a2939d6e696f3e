// SPDX-License-Identifier: MPL-2.0

//! Error recovery policy: bounded retries for transient decoder failures.

use crate::media::ErrorClass;

/// Counts recovery attempts for the current video.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryBudget {
    max: u32,
    used: u32,
}

impl RetryBudget {
    pub fn new(max: u32) -> Self {
        Self { max, used: 0 }
    }

    /// Use up one attempt. Returns its 1-based number, or `None` when exhausted.
    pub fn consume(&mut self) -> Option<u32> {
        if self.used >= self.max {
            return None;
        }
        self.used += 1;
        Some(self.used)
    }

    pub fn reset(&mut self) {
        self.used = 0;
    }

    #[must_use]
    pub fn used(&self) -> u32 {
        self.used
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
    /// Tear down, back off, then start again.
    Retry { attempt: u32 },
    /// Clear the source and stop for good.
    Disable,
    /// Stop quietly without touching the configuration.
    Abort,
    /// Tell the user, leave playback as it is.
    Notify,
}

#[must_use]
pub fn decide(class: ErrorClass, budget: &mut RetryBudget) -> Recovery {
    match class {
        ErrorClass::Transient => match budget.consume() {
            Some(attempt) => Recovery::Retry { attempt },
            None => Recovery::Disable,
        },
        ErrorClass::Exhausted => Recovery::Disable,
        ErrorClass::MissingSource => Recovery::Abort,
        ErrorClass::Other => Recovery::Notify,
    }
}
