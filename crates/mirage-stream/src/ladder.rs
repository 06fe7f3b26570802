//! Windowed degradation logic: render-scale ladder and recovery stability.
//!
//! The render loop samples its own performance in fixed windows and feeds
//! each window here. Both trackers are plain state machines over those
//! observations; they take `now` as a parameter so every transition is
//! reproducible in tests.

use std::time::{Duration, Instant};

use mirage_protocol::types::TargetFrameRate;

/// Rungs of the render-scale ladder, full resolution first.
pub const SCALE_STEPS: [f32; 5] = [1.0, 0.9, 0.8, 0.7, 0.6];

/// Minimum time between ladder steps in the upward direction.
const STEP_UP_HOLD: Duration = Duration::from_secs(2);

/// Hold time inside recovery before an exit is considered.
const RECOVERY_HOLD: Duration = Duration::from_secs(2);

/// Cooldown after a recovery exit before re-entry is permitted.
const RECOVERY_COOLDOWN: Duration = Duration::from_secs(2);

/// One measurement window from the render loop.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindowMetrics {
    pub rendered_fps: f32,
    pub drawable_wait_avg: Duration,
    pub cap_skips: u32,
}

fn fps_margin(target: TargetFrameRate) -> f32 {
    target.as_u16() as f32 / 10.0
}

fn frame_budget(target: TargetFrameRate) -> Duration {
    target.frame_interval()
}

/// A window counts as degraded when rendering falls below target minus
/// margin, or drawable waits exceed 1.5x the frame budget.
pub fn is_degraded(metrics: &WindowMetrics, target: TargetFrameRate) -> bool {
    let target_fps = target.as_u16() as f32;
    metrics.rendered_fps < target_fps - fps_margin(target)
        || metrics.drawable_wait_avg > frame_budget(target).mul_f32(1.5)
}

/// Cap pressure is the stronger signal gating recovery entry.
fn cap_pressure(metrics: &WindowMetrics, target: TargetFrameRate) -> bool {
    let target_fps = target.as_u16() as f32;
    (metrics.rendered_fps <= 0.7 * target_fps && metrics.cap_skips > 0)
        || metrics.drawable_wait_avg >= frame_budget(target).mul_f32(1.5)
}

/// Steps render scale down under sustained degradation and back up once
/// performance holds.
pub struct RenderScaleLadder {
    gate_enabled: bool,
    step: usize,
    consecutive_degraded: u32,
    consecutive_healthy: u32,
    last_step_at: Option<Instant>,
}

impl RenderScaleLadder {
    pub fn new(gate_enabled: bool) -> Self {
        Self {
            gate_enabled,
            step: 0,
            consecutive_degraded: 0,
            consecutive_healthy: 0,
            last_step_at: None,
        }
    }

    /// Enable or disable the degradation gate. Disabling snaps back to
    /// full resolution.
    pub fn set_gate(&mut self, enabled: bool) {
        if self.gate_enabled != enabled {
            self.gate_enabled = enabled;
            self.step = 0;
            self.consecutive_degraded = 0;
            self.consecutive_healthy = 0;
        }
    }

    pub fn gate_enabled(&self) -> bool {
        self.gate_enabled
    }

    /// Current render scale.
    pub fn current(&self) -> f32 {
        if self.gate_enabled {
            SCALE_STEPS[self.step]
        } else {
            1.0
        }
    }

    /// Feed one window. Typing bursts block upward steps but never block
    /// downward ones: resolution drops must stay available while the user
    /// types.
    pub fn observe_window(
        &mut self,
        metrics: &WindowMetrics,
        target: TargetFrameRate,
        typing_burst: bool,
        now: Instant,
    ) {
        if !self.gate_enabled {
            return;
        }

        if is_degraded(metrics, target) {
            self.consecutive_degraded += 1;
            self.consecutive_healthy = 0;
        } else {
            self.consecutive_healthy += 1;
            self.consecutive_degraded = 0;
        }

        if self.consecutive_degraded >= 2 && self.step + 1 < SCALE_STEPS.len() {
            self.step += 1;
            self.last_step_at = Some(now);
            self.consecutive_degraded = 0;
        } else if self.consecutive_healthy >= 2
            && self.step > 0
            && !typing_burst
            && self
                .last_step_at
                .is_none_or(|at| now.duration_since(at) >= STEP_UP_HOLD)
        {
            self.step -= 1;
            self.last_step_at = Some(now);
            self.consecutive_healthy = 0;
        }
    }
}

/// Recovery entry/exit with hold and cooldown.
pub struct RecoveryTracker {
    active: bool,
    consecutive_pressured: u32,
    consecutive_healthy: u32,
    entered_at: Option<Instant>,
    exited_at: Option<Instant>,
}

impl RecoveryTracker {
    pub fn new() -> Self {
        Self {
            active: false,
            consecutive_pressured: 0,
            consecutive_healthy: 0,
            entered_at: None,
            exited_at: None,
        }
    }

    pub fn active(&self) -> bool {
        self.active
    }

    /// Feed one window; returns whether recovery is active afterwards.
    pub fn observe_window(
        &mut self,
        metrics: &WindowMetrics,
        target: TargetFrameRate,
        typing_burst: bool,
        now: Instant,
    ) -> bool {
        if self.active {
            if is_degraded(metrics, target) {
                self.consecutive_healthy = 0;
            } else {
                self.consecutive_healthy += 1;
            }

            let held_long_enough = self
                .entered_at
                .is_some_and(|at| now.duration_since(at) >= RECOVERY_HOLD);
            if self.consecutive_healthy >= 2 && held_long_enough {
                self.active = false;
                self.exited_at = Some(now);
                self.consecutive_healthy = 0;
                self.consecutive_pressured = 0;
            }
        } else {
            if typing_burst {
                // Typing suppresses entry; a burst of keystrokes makes
                // frame pacing look worse than it is.
                self.consecutive_pressured = 0;
            } else if cap_pressure(metrics, target) {
                self.consecutive_pressured += 1;
            } else {
                self.consecutive_pressured = 0;
            }

            let cooled_down = self
                .exited_at
                .is_none_or(|at| now.duration_since(at) >= RECOVERY_COOLDOWN);
            if self.consecutive_pressured >= 2 && cooled_down {
                self.active = true;
                self.entered_at = Some(now);
                self.consecutive_pressured = 0;
                self.consecutive_healthy = 0;
            }
        }
        self.active
    }
}

impl Default for RecoveryTracker {
    fn default() -> Self {
        Self::new()
    }
}
