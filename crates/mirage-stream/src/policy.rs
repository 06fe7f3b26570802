//! Presentation policy: pure decision functions.
//!
//! Everything here is deterministic and side-effect free. The render loop
//! re-evaluates the decision every tick from current inputs; tests pin the
//! exact output for each input combination.

use mirage_protocol::types::{LatencyMode, TargetFrameRate};

/// How the render loop picks a frame from the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentationPolicy {
    /// Present the newest frame, discarding older ones.
    Latest,
    /// Keep up to `depth` frames queued for even pacing.
    Buffered(u32),
}

/// When an in-flight admission slot is given back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseMode {
    /// Release when the GPU accepts the draw. Frees the slot earlier,
    /// favoured under latency pressure.
    OnScheduled,
    /// Release when the draw completes on screen.
    OnCompleted,
}

/// Inputs to one policy evaluation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PolicyInputs {
    pub latency_mode: LatencyMode,
    pub target_fps: TargetFrameRate,
    pub typing_burst_active: bool,
    pub recovery_active: bool,
    pub smoothest_promotion_active: bool,
    pub pressure_active: bool,
    /// Current rung of the render-scale ladder, `1.0` when the gate is off.
    pub ladder_scale: f32,
}

/// Immutable outcome of one policy evaluation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PolicyDecision {
    pub in_flight_cap: u32,
    /// Frames the cache should retain beyond the one being presented.
    pub max_cache_depth: u32,
    pub presentation: PresentationPolicy,
    pub render_scale: f32,
    pub release_mode: ReleaseMode,
    pub allows_secondary_catch_up_draw: bool,
    /// Whether a failed in-flight acquisition may micro-retry ~1 ms later.
    pub allows_micro_retry: bool,
    /// Whether late display pulses may be backfilled by decode arrivals.
    pub allows_decode_driven_tick: bool,
    pub max_drawables: u32,
    pub reason: &'static str,
}

/// Steady-state buffering depth for the smoothing modes.
const BUFFER_DEPTH: u32 = 3;

/// Evaluate the presentation policy.
pub fn decide(inputs: &PolicyInputs) -> PolicyDecision {
    let render_scale = inputs.ladder_scale.clamp(0.6, 1.0);

    match inputs.latency_mode {
        LatencyMode::LowestLatency => PolicyDecision {
            in_flight_cap: 1,
            max_cache_depth: 1,
            presentation: PresentationPolicy::Latest,
            render_scale,
            release_mode: ReleaseMode::OnScheduled,
            allows_secondary_catch_up_draw: false,
            allows_micro_retry: false,
            allows_decode_driven_tick: false,
            max_drawables: 2,
            reason: "lowest-latency",
        },

        LatencyMode::Auto if inputs.typing_burst_active => PolicyDecision {
            in_flight_cap: 1,
            max_cache_depth: 1,
            presentation: PresentationPolicy::Latest,
            render_scale,
            release_mode: ReleaseMode::OnScheduled,
            allows_secondary_catch_up_draw: false,
            allows_micro_retry: false,
            allows_decode_driven_tick: true,
            max_drawables: 2,
            reason: "typing",
        },

        LatencyMode::Auto if inputs.recovery_active => PolicyDecision {
            in_flight_cap: 2,
            max_cache_depth: 2,
            presentation: PresentationPolicy::Buffered(1),
            render_scale,
            release_mode: ReleaseMode::OnScheduled,
            allows_secondary_catch_up_draw: false,
            allows_micro_retry: true,
            allows_decode_driven_tick: true,
            max_drawables: 3,
            reason: "recovery",
        },

        LatencyMode::Auto => PolicyDecision {
            in_flight_cap: 2,
            max_cache_depth: BUFFER_DEPTH + 1,
            presentation: PresentationPolicy::Buffered(BUFFER_DEPTH),
            render_scale,
            release_mode: if inputs.pressure_active {
                ReleaseMode::OnScheduled
            } else {
                ReleaseMode::OnCompleted
            },
            allows_secondary_catch_up_draw: true,
            allows_micro_retry: true,
            allows_decode_driven_tick: true,
            max_drawables: 3,
            reason: "auto-steady",
        },

        LatencyMode::Smoothest if inputs.recovery_active => PolicyDecision {
            in_flight_cap: 2,
            max_cache_depth: 2,
            presentation: PresentationPolicy::Buffered(1),
            render_scale,
            release_mode: ReleaseMode::OnScheduled,
            allows_secondary_catch_up_draw: false,
            allows_micro_retry: true,
            allows_decode_driven_tick: true,
            max_drawables: 3,
            reason: "recovery",
        },

        LatencyMode::Smoothest => {
            let promoted = inputs.smoothest_promotion_active;
            PolicyDecision {
                in_flight_cap: if promoted { 3 } else { 2 },
                max_cache_depth: BUFFER_DEPTH + 1,
                presentation: PresentationPolicy::Buffered(BUFFER_DEPTH),
                render_scale,
                release_mode: ReleaseMode::OnCompleted,
                allows_secondary_catch_up_draw: true,
                allows_micro_retry: true,
                allows_decode_driven_tick: true,
                max_drawables: 3,
                reason: if promoted {
                    "smoothest-promoted"
                } else {
                    "smoothest"
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inputs(mode: LatencyMode) -> PolicyInputs {
        PolicyInputs {
            latency_mode: mode,
            target_fps: TargetFrameRate::Fps60,
            typing_burst_active: false,
            recovery_active: false,
            smoothest_promotion_active: false,
            pressure_active: false,
            ladder_scale: 1.0,
        }
    }

    #[test]
    fn auto_steady_at_60() {
        // Ladder + cap for Auto@60.
        let d = decide(&inputs(LatencyMode::Auto));
        assert_eq!(d.in_flight_cap, 2);
        assert_eq!(d.max_drawables, 3);
        assert_eq!(d.presentation, PresentationPolicy::Buffered(3));
        assert!(d.allows_secondary_catch_up_draw);
        assert_eq!(d.release_mode, ReleaseMode::OnCompleted);
    }

    #[test]
    fn typing_burst_cap() {
        let d = decide(&PolicyInputs {
            typing_burst_active: true,
            pressure_active: true,
            ..inputs(LatencyMode::Auto)
        });
        assert_eq!(d.in_flight_cap, 1);
        assert_eq!(d.presentation, PresentationPolicy::Latest);
        assert_eq!(d.max_cache_depth, 1);
        assert_eq!(d.reason, "typing");
    }

    #[test]
    fn smoothest_promotion() {
        let d = decide(&PolicyInputs {
            smoothest_promotion_active: true,
            ..inputs(LatencyMode::Smoothest)
        });
        assert_eq!(d.in_flight_cap, 3);
        assert_eq!(d.max_drawables, 3);
        assert_eq!(d.presentation, PresentationPolicy::Buffered(3));
        assert!(d.allows_secondary_catch_up_draw);
    }

    #[test]
    fn lowest_latency_never_buffers() {
        let d = decide(&PolicyInputs {
            pressure_active: true,
            recovery_active: true,
            ..inputs(LatencyMode::LowestLatency)
        });
        assert_eq!(d.presentation, PresentationPolicy::Latest);
        assert_eq!(d.in_flight_cap, 1);
        assert_eq!(d.max_drawables, 2);
        assert!(!d.allows_secondary_catch_up_draw);
        assert!(!d.allows_decode_driven_tick);
        assert!(!d.allows_micro_retry);
    }

    #[test]
    fn auto_recovery_holds_cap_and_depth() {
        let d = decide(&PolicyInputs {
            recovery_active: true,
            ..inputs(LatencyMode::Auto)
        });
        assert_eq!(d.in_flight_cap, 2);
        assert_eq!(d.presentation, PresentationPolicy::Buffered(1));
        assert_eq!(d.reason, "recovery");
    }

    #[test]
    fn decisions_are_referentially_transparent() {
        let i = PolicyInputs {
            typing_burst_active: true,
            pressure_active: true,
            ..inputs(LatencyMode::Smoothest)
        };
        assert_eq!(decide(&i), decide(&i));
    }

    #[test]
    fn ladder_scale_is_clamped() {
        let d = decide(&PolicyInputs {
            ladder_scale: 0.3,
            ..inputs(LatencyMode::Auto)
        });
        assert_eq!(d.render_scale, 0.6);

        let d = decide(&PolicyInputs {
            ladder_scale: 1.4,
            ..inputs(LatencyMode::Auto)
        });
        assert_eq!(d.render_scale, 1.0);
    }
}
