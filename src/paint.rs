//! The paint scheduler.
//!
//! Painting is driven by a periodic timer whose period adapts to how long
//! painting actually takes: the next period is the screen refresh interval
//! minus the running average paint time, floored at
//! [`MINIMUM_REPAINT_INTERVAL`]. A tick that overshoots the frame budget
//! does not schedule a hurried follow-up; the next tick gets the full
//! frame again.

use std::time::{Duration, Instant};

use tracing::trace;

use crate::{compositor::Compositor, plugin::PluginHost, render::Renderer};

/// Repaint interval used when the refresh rate could not be obtained from
/// RandR (50 Hz).
pub const DEFAULT_REPAINT_INTERVAL: f64 = 0.02;

/// Floor of the repaint interval (100 Hz).
pub const MINIMUM_REPAINT_INTERVAL: f64 = 0.01;

/// Adaptive repaint timing state.
#[derive(Debug, Clone)]
pub struct PaintClock {
    refresh_rate_interval: f64,
    repaint_interval: f64,
    paint_time_sum: f64,
    paint_counter: u32,
}

impl PaintClock {
    pub fn new(refresh_rate_interval: f64) -> Self {
        PaintClock {
            refresh_rate_interval,
            repaint_interval: refresh_rate_interval.max(MINIMUM_REPAINT_INTERVAL),
            paint_time_sum: 0.0,
            paint_counter: 0,
        }
    }

    /// The ceiling of the repaint interval, in seconds per frame.
    pub fn refresh_rate_interval(&self) -> f64 {
        self.refresh_rate_interval
    }

    /// Adopts a new refresh interval after a screen configuration change.
    pub fn set_refresh_rate_interval(&mut self, interval: f64) {
        self.refresh_rate_interval = interval;
        self.repaint_interval = self.repaint_interval.min(interval).max(MINIMUM_REPAINT_INTERVAL);
    }

    /// The current repaint period in seconds.
    pub fn repaint_interval(&self) -> f64 {
        self.repaint_interval
    }

    /// The current repaint period as a timer duration, never below the
    /// contractual floor.
    pub fn interval(&self) -> Duration {
        Duration::from_secs_f64(self.repaint_interval.max(MINIMUM_REPAINT_INTERVAL))
    }

    /// Folds the duration of a finished paint into the running average and
    /// derives the next repaint period from it.
    pub fn record_paint(&mut self, seconds: f64) {
        self.paint_time_sum += seconds;
        self.paint_counter += 1;
        let average = self.paint_time_sum / f64::from(self.paint_counter);

        let interval = self.refresh_rate_interval - average;
        self.repaint_interval = if interval < MINIMUM_REPAINT_INTERVAL {
            // The paint overshot the frame budget; give the next tick the
            // whole frame instead of scheduling a hurried one.
            self.refresh_rate_interval.max(MINIMUM_REPAINT_INTERVAL)
        } else {
            interval
        };
    }
}

/// One tick of the paint timer. Returns the period to rearm the timer with.
///
/// The caller is expected to drain queued events once after this returns:
/// events keep arriving while painting and must not wait a full period.
#[profiling::function]
pub fn paint_tick(comp: &mut Compositor, backend: &mut dyn Renderer, plugins: &mut PluginHost) -> Duration {
    let started = Instant::now();

    // Pre-paint hooks may grow or shrink the damaged region and thereby
    // trigger or suppress the repaint below.
    plugins.pre_paint(comp);

    if !comp.damage.is_damaged() && !comp.damage.force_repaint {
        return comp.clock.interval();
    }

    let force = comp.damage.force_repaint;
    if force {
        // Paint-everything semantics: drop the clip before painting.
        comp.damage.reset();
    }

    trace!(force, "Repainting");

    if comp.background_reset {
        backend.paint_background(comp);
        comp.background_reset = false;
    }
    backend.paint_all(comp);

    if !force {
        comp.damage.reset();
    }

    // Every painted window returns to its post-paint damage baseline so the
    // saturation fast paths count from this paint onwards.
    for window in comp.windows.windows() {
        if window.is_damaged() {
            window.state().reset_damage_accounting();
        }
    }

    if !force {
        comp.clock.record_paint(started.elapsed().as_secs_f64());
    }

    plugins.post_paint(comp);

    comp.damage.force_repaint = false;
    comp.clock.interval()
}

#[cfg(test)]
mod tests {
    use super::*;

    const VERTICAL_REFRESH_60: f64 = 0.0167;

    #[test]
    fn starts_at_the_refresh_interval() {
        let clock = PaintClock::new(VERTICAL_REFRESH_60);
        assert_eq!(clock.repaint_interval(), VERTICAL_REFRESH_60);
    }

    #[test]
    fn fast_paints_shorten_the_interval() {
        let mut clock = PaintClock::new(VERTICAL_REFRESH_60);
        clock.record_paint(0.002);
        assert!((clock.repaint_interval() - 0.0147).abs() < 1e-9);
    }

    #[test]
    fn average_is_cumulative() {
        let mut clock = PaintClock::new(VERTICAL_REFRESH_60);
        clock.record_paint(0.002);
        clock.record_paint(0.004);
        // Average paint time is 3ms.
        assert!((clock.repaint_interval() - (VERTICAL_REFRESH_60 - 0.003)).abs() < 1e-9);
    }

    #[test]
    fn overshoot_snaps_to_the_full_frame() {
        let mut clock = PaintClock::new(0.02);
        clock.record_paint(0.015);
        assert_eq!(clock.repaint_interval(), 0.02);
    }

    #[test]
    fn interval_never_goes_below_the_floor() {
        // A 120 Hz screen: the frame interval itself is below the floor.
        let mut clock = PaintClock::new(VERTICAL_REFRESH_60);
        clock.set_refresh_rate_interval(1.0 / 120.0);
        assert!((clock.refresh_rate_interval() - 0.00833).abs() < 1e-4);

        clock.record_paint(0.001);
        assert!(clock.repaint_interval() >= MINIMUM_REPAINT_INTERVAL);
        assert!(clock.interval() >= Duration::from_secs_f64(MINIMUM_REPAINT_INTERVAL));
    }

    #[test]
    fn refresh_change_clamps_the_current_interval() {
        let mut clock = PaintClock::new(0.02);
        clock.set_refresh_rate_interval(0.0167);
        assert!(clock.repaint_interval() <= 0.0167);
    }
}
