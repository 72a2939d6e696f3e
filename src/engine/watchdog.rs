// SPDX-License-Identifier: MPL-2.0

//! Stall detection: the engine says it is playing but the playhead does not move.

use std::time::Duration;

/// What the media engine reported at one watchdog check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sample {
    pub position: Option<Duration>,
    pub duration: Option<Duration>,
    pub is_playing: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Nothing to judge: not playing, too short, or first sample.
    Inconclusive,
    /// The playhead moved since the previous check.
    Advancing(Duration),
    /// The playhead did not move across two consecutive checks.
    Stalled,
}

#[derive(Debug, Clone)]
pub struct Watchdog {
    min_duration: Duration,
    last: Option<Duration>,
    /// Position of the last reported stall, cleared once the playhead moves again.
    reported: Option<Duration>,
}

impl Watchdog {
    pub fn new(min_duration: Duration) -> Self {
        Self {
            min_duration,
            last: None,
            reported: None,
        }
    }

    /// Compare against the previous check. Reports each stall once: a playhead
    /// stuck again at the position of the last reported stall is not reported
    /// a second time.
    pub fn check(&mut self, sample: Sample) -> Verdict {
        let (true, Some(position), Some(duration)) =
            (sample.is_playing, sample.position, sample.duration)
        else {
            self.last = None;
            return Verdict::Inconclusive;
        };

        if duration <= self.min_duration {
            self.last = None;
            return Verdict::Inconclusive;
        }

        match self.last.replace(position) {
            Some(previous) if previous == position => {
                if self.reported == Some(position) {
                    Verdict::Inconclusive
                } else {
                    self.reported = Some(position);
                    Verdict::Stalled
                }
            }
            Some(_) => {
                self.reported = None;
                Verdict::Advancing(position)
            }
            None => Verdict::Inconclusive,
        }
    }

    /// Forget the previous sample, e.g. while paused or across a restart.
    /// A reported stall stays reported.
    pub fn suspend(&mut self) {
        self.last = None;
    }

    /// Start over for a new video.
    pub fn reset(&mut self) {
        self.last = None;
        self.reported = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIN: Duration = Duration::from_millis(2000);

    fn playing(position_ms: u64) -> Sample {
        Sample {
            position: Some(Duration::from_millis(position_ms)),
            duration: Some(Duration::from_secs(30)),
            is_playing: true,
        }
    }

    #[test]
    fn stall_is_reported_exactly_once() {
        let mut watchdog = Watchdog::new(MIN);

        assert_eq!(watchdog.check(playing(1000)), Verdict::Inconclusive);
        assert_eq!(watchdog.check(playing(1000)), Verdict::Stalled);
        for _ in 0..10 {
            assert_eq!(watchdog.check(playing(1000)), Verdict::Inconclusive);
        }

        // Moving again re-arms it.
        assert_eq!(
            watchdog.check(playing(1500)),
            Verdict::Advancing(Duration::from_millis(1500))
        );
        assert_eq!(watchdog.check(playing(1500)), Verdict::Stalled);
    }

    #[test]
    fn restarted_playback_stalling_elsewhere_is_reported() {
        let mut watchdog = Watchdog::new(MIN);
        watchdog.check(playing(3000));
        assert_eq!(watchdog.check(playing(3000)), Verdict::Stalled);

        // Restart: the new engine never moves, but sits at another position.
        watchdog.suspend();
        let verdicts: Vec<_> = (0..6).map(|_| watchdog.check(playing(9000))).collect();
        assert_eq!(verdicts.iter().filter(|v| **v == Verdict::Stalled).count(), 1);

        // Stuck at the same place again after the next restart: already reported.
        watchdog.suspend();
        for _ in 0..6 {
            assert_eq!(watchdog.check(playing(9000)), Verdict::Inconclusive);
        }
    }

    #[test]
    fn advancing_playhead_is_healthy() {
        let mut watchdog = Watchdog::new(MIN);
        watchdog.check(playing(0));
        for step in 1..20 {
            assert_eq!(
                watchdog.check(playing(step * 2000)),
                Verdict::Advancing(Duration::from_millis(step * 2000))
            );
        }
    }

    #[test]
    fn short_videos_are_ignored() {
        let mut watchdog = Watchdog::new(MIN);
        let short = Sample {
            duration: Some(Duration::from_millis(1500)),
            ..playing(700)
        };
        for _ in 0..5 {
            assert_eq!(watchdog.check(short), Verdict::Inconclusive);
        }

        let exactly_min = Sample {
            duration: Some(MIN),
            ..playing(700)
        };
        for _ in 0..5 {
            assert_eq!(watchdog.check(exactly_min), Verdict::Inconclusive);
        }
    }

    #[test]
    fn not_playing_is_never_a_stall() {
        let mut watchdog = Watchdog::new(MIN);
        let paused = Sample {
            is_playing: false,
            ..playing(4000)
        };
        for _ in 0..5 {
            assert_eq!(watchdog.check(paused), Verdict::Inconclusive);
        }
    }

    #[test]
    fn suspend_requires_two_fresh_samples() {
        let mut watchdog = Watchdog::new(MIN);
        watchdog.check(playing(3000));
        watchdog.suspend();
        assert_eq!(watchdog.check(playing(3000)), Verdict::Inconclusive);
        assert_eq!(watchdog.check(playing(3000)), Verdict::Stalled);
    }
}
