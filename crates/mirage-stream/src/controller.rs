//! Per-stream controller: reassembly → decode → recovery coordination.
//!
//! The controller is a synchronous state machine; callers feed it events
//! and execute the actions it returns (submit to the decoder, send a
//! keyframe request over the control plane, flush the cache). Keeping the
//! I/O outside makes every recovery path testable with plain calls.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use mirage_protocol::reassembler::{AssembledFrame, ReassemblyEvent};
use tracing::{debug, info, warn};

/// Baseline decoder in-flight submissions at a 60 Hz stream target.
pub const BASE_SUBMISSION_LIMIT: u32 = 2;

/// Elevated limit under sustained decode stress.
pub const STRESS_SUBMISSION_LIMIT: u32 = 3;

/// Minimum spacing between keyframe requests per stream.
pub const KEYFRAME_COOLDOWN: Duration = Duration::from_millis(250);

/// Sliding window for counting decode errors as one storm.
const STORM_WINDOW: Duration = Duration::from_secs(1);

/// Consecutive measurement windows at or below this decoded FPS escalate
/// the submission limit.
const STRESS_FPS_CEILING: f32 = 45.0;
const STRESS_WINDOWS: u32 = 3;

/// Consecutive windows at or above this decoded FPS revert the limit.
const HEALTHY_FPS_FLOOR: f32 = 58.0;
const HEALTHY_WINDOWS: u32 = 5;

/// Repeated storm flushes within this window escalate to host-side
/// adaptive fallback.
const FALLBACK_WINDOW: Duration = Duration::from_secs(5);
const FALLBACK_STORM_COUNT: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    /// No frame decoded yet; losses here need a keyframe to bootstrap.
    Starting,
    Running,
    /// Decode errors observed recently.
    Recovering,
    Stopped,
}

/// Side effects the caller must carry out, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum ControllerAction {
    SubmitDecode(AssembledFrame),
    RequestKeyframe,
    FlushCache,
    ClearInFlight,
    SetSubmissionLimit(u32),
    RequestAdaptiveFallback,
    /// Wake the render loop's decode-driven tick.
    NotifyFrameReady,
}

/// Counters surfaced in decode-health reports to the host.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ControllerMetrics {
    pub frames_submitted: u64,
    pub frames_decoded: u64,
    pub frames_lost: u64,
    pub decode_errors: u64,
    pub keyframe_requests: u64,
}

pub struct StreamController {
    stream_id: u32,
    state: ControllerState,
    last_keyframe_request: Option<Instant>,
    /// Recent decode-error timestamps within [`STORM_WINDOW`].
    recent_errors: VecDeque<Instant>,
    last_error_at: Option<Instant>,
    /// Storm flushes feeding the adaptive-fallback escalation.
    recent_storm_flushes: VecDeque<Instant>,
    stress_windows: u32,
    healthy_windows: u32,
    submission_limit: u32,
    metrics: ControllerMetrics,
}

impl StreamController {
    pub fn new(stream_id: u32) -> Self {
        Self {
            stream_id,
            state: ControllerState::Starting,
            last_keyframe_request: None,
            recent_errors: VecDeque::new(),
            last_error_at: None,
            recent_storm_flushes: VecDeque::new(),
            stress_windows: 0,
            healthy_windows: 0,
            submission_limit: BASE_SUBMISSION_LIMIT,
            metrics: ControllerMetrics::default(),
        }
    }

    pub fn state(&self) -> ControllerState {
        self.state
    }

    pub fn metrics(&self) -> ControllerMetrics {
        self.metrics
    }

    pub fn submission_limit(&self) -> u32 {
        self.submission_limit
    }

    pub fn stop(&mut self) {
        self.state = ControllerState::Stopped;
    }

    /// Handle one reassembler event.
    pub fn on_reassembly_event(
        &mut self,
        event: ReassemblyEvent,
        now: Instant,
    ) -> Vec<ControllerAction> {
        if self.state == ControllerState::Stopped {
            return Vec::new();
        }

        match event {
            ReassemblyEvent::Frame(frame) => {
                self.metrics.frames_submitted += 1;
                vec![ControllerAction::SubmitDecode(frame)]
            }

            ReassemblyEvent::Loss { frame_number } => {
                self.metrics.frames_lost += 1;
                if self.state == ControllerState::Starting {
                    // Nothing decoded yet: without a keyframe the decoder
                    // can never start.
                    debug!(
                        stream_id = self.stream_id,
                        frame_number, "loss before first decode, requesting keyframe"
                    );
                    self.keyframe_request(now).into_iter().collect()
                } else {
                    // P-frame gaps are tolerated; the codec is fed
                    // best-effort reference attempts.
                    Vec::new()
                }
            }

            ReassemblyEvent::TokenMismatch { token } => {
                info!(
                    stream_id = self.stream_id,
                    token, "dimension token changed, resetting stream"
                );
                self.state = ControllerState::Starting;
                let mut actions = vec![
                    ControllerAction::ClearInFlight,
                    ControllerAction::FlushCache,
                ];
                actions.extend(self.keyframe_request(now));
                actions
            }
        }
    }

    /// Handle a decode outcome from the façade.
    pub fn on_decode_outcome(&mut self, decoded: bool, now: Instant) -> Vec<ControllerAction> {
        if self.state == ControllerState::Stopped {
            return Vec::new();
        }

        if decoded {
            self.metrics.frames_decoded += 1;
            if self.state == ControllerState::Starting {
                self.state = ControllerState::Running;
            } else if self.state == ControllerState::Recovering
                && self
                    .last_error_at
                    .is_none_or(|at| now.duration_since(at) >= STORM_WINDOW)
            {
                debug!(stream_id = self.stream_id, "decode storm over");
                self.state = ControllerState::Running;
            }
            return vec![ControllerAction::NotifyFrameReady];
        }

        // Decode error path.
        self.metrics.decode_errors += 1;
        self.last_error_at = Some(now);
        self.recent_errors.push_back(now);
        while self
            .recent_errors
            .front()
            .is_some_and(|&t| now.duration_since(t) > STORM_WINDOW)
        {
            self.recent_errors.pop_front();
        }

        if self.state != ControllerState::Recovering {
            self.state = ControllerState::Recovering;
        }

        if self.recent_errors.len() < 2 {
            // First error in the window: soft recovery only.
            return vec![ControllerAction::ClearInFlight];
        }

        // Sustained storm: flush and resynchronise, at most once per
        // keyframe cooldown.
        let Some(request) = self.keyframe_request(now) else {
            return Vec::new();
        };

        warn!(
            stream_id = self.stream_id,
            errors = self.recent_errors.len(),
            "decode storm, flushing cache and requesting keyframe"
        );

        self.recent_storm_flushes.push_back(now);
        while self
            .recent_storm_flushes
            .front()
            .is_some_and(|&t| now.duration_since(t) > FALLBACK_WINDOW)
        {
            self.recent_storm_flushes.pop_front();
        }

        let mut actions = vec![ControllerAction::FlushCache, request];
        if self.recent_storm_flushes.len() >= FALLBACK_STORM_COUNT {
            info!(
                stream_id = self.stream_id,
                "repeated decode storms, asking host for adaptive fallback"
            );
            self.recent_storm_flushes.clear();
            actions.push(ControllerAction::RequestAdaptiveFallback);
        }
        actions
    }

    /// Feed one decoded-FPS measurement window to the submission-limit
    /// scheduler.
    pub fn on_window_tick(&mut self, decoded_fps: f32, _now: Instant) -> Vec<ControllerAction> {
        if self.state == ControllerState::Stopped {
            return Vec::new();
        }

        if decoded_fps <= STRESS_FPS_CEILING {
            self.stress_windows += 1;
            self.healthy_windows = 0;
        } else if decoded_fps >= HEALTHY_FPS_FLOOR {
            self.healthy_windows += 1;
            self.stress_windows = 0;
        } else {
            // Mid-band: hold the current limit.
            self.stress_windows = 0;
            self.healthy_windows = 0;
        }

        if self.stress_windows >= STRESS_WINDOWS
            && self.submission_limit == BASE_SUBMISSION_LIMIT
        {
            self.submission_limit = STRESS_SUBMISSION_LIMIT;
            self.stress_windows = 0;
            info!(
                stream_id = self.stream_id,
                "sustained decode stress, raising submission limit"
            );
            return vec![ControllerAction::SetSubmissionLimit(STRESS_SUBMISSION_LIMIT)];
        }
        if self.healthy_windows >= HEALTHY_WINDOWS
            && self.submission_limit == STRESS_SUBMISSION_LIMIT
        {
            self.submission_limit = BASE_SUBMISSION_LIMIT;
            self.healthy_windows = 0;
            return vec![ControllerAction::SetSubmissionLimit(BASE_SUBMISSION_LIMIT)];
        }
        Vec::new()
    }

    /// Backpressure drops never request keyframes.
    pub fn on_queue_dropped(&mut self, dropped: u32) {
        debug!(
            stream_id = self.stream_id,
            dropped, "presentation queue dropped frames"
        );
    }

    fn keyframe_request(&mut self, now: Instant) -> Option<ControllerAction> {
        let allowed = self
            .last_keyframe_request
            .is_none_or(|at| now.duration_since(at) >= KEYFRAME_COOLDOWN);
        if !allowed {
            return None;
        }
        self.last_keyframe_request = Some(now);
        self.metrics.keyframe_requests += 1;
        Some(ControllerAction::RequestKeyframe)
    }
}
