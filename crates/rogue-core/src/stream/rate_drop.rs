//! Rate limiter that drops frames by count or by time.

use std::time::{Duration, Instant};

use parking_lot::Mutex;

use super::{
    frame::FramePtr,
    master::{AsMaster, Master},
    slave::Slave,
};
use crate::error::Result;

#[derive(Debug)]
enum Mode {
    /// Keep one frame out of every `n`
    Count { n: u32, seen: u32 },
    /// Keep the first frame after each period
    Period { period: Duration, last: Option<Instant> },
}

/// Thins a stream, keeping one frame per count or per time period.
#[derive(Debug)]
pub struct RateDrop {
    master: Master,
    mode: Mutex<Mode>,
}

impl RateDrop {
    /// With `period` set, `value` is a period in seconds; otherwise it is a
    /// frame count and one frame in every `value` is kept. An infinite
    /// period keeps only the first frame; NaN keeps every frame.
    pub fn new(period: bool, value: f64) -> Self {
        let mode = if period {
            let period = Duration::try_from_secs_f64(value.max(0.0)).unwrap_or(Duration::MAX);
            Mode::Period { period, last: None }
        } else {
            Mode::Count { n: (value as u32).max(1), seen: 0 }
        };
        Self { master: Master::new(), mode: Mutex::new(mode) }
    }

    fn keep(&self, now: Instant) -> bool {
        match &mut *self.mode.lock() {
            Mode::Count { n, seen } => {
                let keep = *seen == 0;
                *seen = (*seen + 1) % *n;
                keep
            }
            Mode::Period { period, last } => match last {
                Some(at) if now.saturating_duration_since(*at) < *period => false,
                _ => {
                    *last = Some(now);
                    true
                }
            },
        }
    }
}

impl AsMaster for RateDrop {
    fn master(&self) -> &Master {
        &self.master
    }
}

impl Slave for RateDrop {
    fn accept_frame(&self, frame: FramePtr) -> Result<()> {
        if self.keep(Instant::now()) {
            self.master.send_frame(frame);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn count_mode_keeps_every_nth() {
        let rate = RateDrop::new(false, 3.0);
        let now = Instant::now();
        let kept: Vec<bool> = (0..7).map(|_| rate.keep(now)).collect();
        assert_eq!(kept, vec![true, false, false, true, false, false, true]);
    }

    #[test]
    fn period_mode_keeps_first_after_period() {
        let rate = RateDrop::new(true, 1.0);
        let start = Instant::now();
        assert!(rate.keep(start));
        assert!(!rate.keep(start + Duration::from_millis(500)));
        assert!(rate.keep(start + Duration::from_millis(1000)));
        assert!(!rate.keep(start + Duration::from_millis(1999)));
        assert!(rate.keep(start + Duration::from_millis(2500)));
    }

    #[test]
    fn non_finite_periods_do_not_panic() {
        let start = Instant::now();
        let forever = RateDrop::new(true, f64::INFINITY);
        assert!(forever.keep(start));
        assert!(!forever.keep(start + Duration::from_secs(86_400)));

        let nan = RateDrop::new(true, f64::NAN);
        assert!(nan.keep(start));
        assert!(nan.keep(start));
    }
}
