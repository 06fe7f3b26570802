//! Adaptive encoder control, one instance per outgoing stream.
//!
//! Maps the configured bitrate to an encoder quality target, applies the
//! typing-burst latency override, and walks the adaptive fallback ladder
//! when the client reports sustained decode stress. The quality math is
//! pure; the stateful parts (burst deadline, fallback stage) take `now`
//! explicitly.

use std::time::{Duration, Instant};

use mirage_protocol::types::{BitDepth, ChromaFormat, EncoderSettings, LatencyMode};
use tracing::{debug, info};

/// Piecewise-linear bits-per-pixel → quality curve.
const BPP_CURVE: [(f32, f32); 7] = [
    (0.015, 0.08),
    (0.030, 0.18),
    (0.060, 0.30),
    (0.100, 0.45),
    (0.150, 0.58),
    (0.200, 0.70),
    (0.250, 0.80),
];

/// Quality never exceeds this, applied after every other adjustment.
pub const DEFAULT_QUALITY_CEILING: f32 = 0.94;

/// Quality cap while a typing burst is active.
const TYPING_BURST_QUALITY_CAP: f32 = 0.35;

/// How long one keystroke keeps the burst alive.
const TYPING_BURST_DEADLINE: Duration = Duration::from_millis(150);

/// Minimum spacing between adaptive fallback steps.
const FALLBACK_COOLDOWN: Duration = Duration::from_secs(15);

/// Quiet time after the last reported storm before restoration begins.
const FALLBACK_QUIET_WINDOW: Duration = Duration::from_secs(30);

/// Stream-scale floor for the geometric fallback stages.
const FALLBACK_SCALE_FLOOR: f32 = 0.6;
const FALLBACK_SCALE_STEP: f32 = 0.9;

/// Interpolate the bpp curve, clamping at both ends.
fn quality_from_bpp(bpp: f32) -> f32 {
    if bpp <= BPP_CURVE[0].0 {
        return BPP_CURVE[0].1;
    }
    if bpp >= BPP_CURVE[BPP_CURVE.len() - 1].0 {
        return BPP_CURVE[BPP_CURVE.len() - 1].1;
    }
    for pair in BPP_CURVE.windows(2) {
        let (x0, y0) = pair[0];
        let (x1, y1) = pair[1];
        if bpp <= x1 {
            let t = (bpp - x0) / (x1 - x0);
            return y0 + t * (y1 - y0);
        }
    }
    BPP_CURVE[BPP_CURVE.len() - 1].1
}

/// Derive the frame quality target for a stream shape.
pub fn derived_quality(bitrate_bps: u64, width: u32, height: u32, fps: u16) -> f32 {
    let pixels_per_second = width as f64 * height as f64 * fps as f64;
    let bpp = if pixels_per_second > 0.0 {
        (bitrate_bps as f64 / pixels_per_second) as f32
    } else {
        0.0
    };

    let mut quality = quality_from_bpp(bpp);

    if fps >= 120 {
        quality *= 0.85;
    } else if fps >= 90 {
        quality *= 0.90;
    }

    // Very high bitrates buy quality beyond the curve, up to a 0.94
    // ceiling at 700 Mbps.
    if bitrate_bps > 400_000_000 {
        let t = ((bitrate_bps - 400_000_000) as f32 / 300_000_000.0).min(1.0);
        quality += (0.94 - quality) * t;
    }

    quality
}

/// Keyframes get a lower quality target: they are large already, and a
/// cheaper keyframe keeps the burst within one frame interval.
pub fn keyframe_quality(frame_quality: f32) -> f32 {
    (frame_quality * 0.72).min(frame_quality).max(0.05)
}

/// Snapshot of all encoder directives for the next frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EncoderDirectives {
    pub quality: f32,
    pub keyframe_quality: f32,
    pub in_flight_cap: u32,
    pub prefer_scheduled_release: bool,
    pub chroma: ChromaFormat,
    pub stream_scale: f32,
}

pub struct EncoderControl {
    stream_id: u32,
    settings: EncoderSettings,
    latency_mode: LatencyMode,
    width: u32,
    height: u32,
    fps: u16,
    quality_ceiling: f32,
    typing_deadline: Option<Instant>,
    /// 0 = full fidelity; 1 = P010; 2 = NV12; 3+ = NV12 with shrinking
    /// stream scale.
    fallback_stage: u32,
    last_fallback_step: Option<Instant>,
    last_storm: Option<Instant>,
}

impl EncoderControl {
    pub fn new(
        stream_id: u32,
        settings: EncoderSettings,
        latency_mode: LatencyMode,
        width: u32,
        height: u32,
        fps: u16,
    ) -> Self {
        Self {
            stream_id,
            settings,
            latency_mode,
            width,
            height,
            fps,
            quality_ceiling: DEFAULT_QUALITY_CEILING,
            typing_deadline: None,
            fallback_stage: 0,
            last_fallback_step: None,
            last_storm: None,
        }
    }

    pub fn settings(&self) -> EncoderSettings {
        self.settings
    }

    pub fn update_settings(&mut self, settings: EncoderSettings) {
        debug!(stream_id = self.stream_id, ?settings, "encoder settings updated");
        self.settings = settings;
    }

    pub fn update_shape(&mut self, width: u32, height: u32, fps: u16) {
        self.width = width;
        self.height = height;
        self.fps = fps;
    }

    pub fn set_latency_mode(&mut self, mode: LatencyMode) {
        self.latency_mode = mode;
    }

    /// Extend the typing-burst deadline. Only Auto mode trades quality for
    /// input latency.
    pub fn note_typing_input(&mut self, now: Instant) {
        if self.latency_mode == LatencyMode::Auto {
            self.typing_deadline = Some(now + TYPING_BURST_DEADLINE);
        }
    }

    pub fn typing_burst_active(&self, now: Instant) -> bool {
        self.typing_deadline.is_some_and(|d| now < d)
    }

    /// Client reported a decode storm. Advance the fallback ladder, at
    /// most once per cooldown.
    pub fn note_decode_storm(&mut self, now: Instant) {
        if !self.settings.allow_runtime_quality_adjustment {
            return;
        }
        self.last_storm = Some(now);

        let cooled = self
            .last_fallback_step
            .is_none_or(|at| now.duration_since(at) >= FALLBACK_COOLDOWN);
        if !cooled {
            return;
        }
        if self.stream_scale_for_stage(self.fallback_stage + 1) < FALLBACK_SCALE_FLOOR {
            return;
        }

        self.fallback_stage += 1;
        self.last_fallback_step = Some(now);
        info!(
            stream_id = self.stream_id,
            stage = self.fallback_stage,
            "adaptive fallback stepping down"
        );
    }

    /// Called periodically; steps back toward full fidelity once the
    /// client has been quiet long enough.
    pub fn maybe_restore(&mut self, now: Instant) {
        if self.fallback_stage == 0 {
            return;
        }
        let quiet = self
            .last_storm
            .is_none_or(|at| now.duration_since(at) >= FALLBACK_QUIET_WINDOW);
        let cooled = self
            .last_fallback_step
            .is_none_or(|at| now.duration_since(at) >= FALLBACK_COOLDOWN);
        if quiet && cooled {
            self.fallback_stage -= 1;
            self.last_fallback_step = Some(now);
            info!(
                stream_id = self.stream_id,
                stage = self.fallback_stage,
                "adaptive fallback restoring"
            );
        }
    }

    pub fn fallback_stage(&self) -> u32 {
        self.fallback_stage
    }

    fn chroma_for_stage(&self, stage: u32) -> ChromaFormat {
        match (self.settings.bit_depth, stage) {
            (BitDepth::Ten, 0) => ChromaFormat::TenBit420,
            (BitDepth::Ten, 1) => ChromaFormat::P010,
            (BitDepth::Eight, 0 | 1) => ChromaFormat::Nv12,
            _ => ChromaFormat::Nv12,
        }
    }

    fn stream_scale_for_stage(&self, stage: u32) -> f32 {
        let scale_steps = stage.saturating_sub(2);
        FALLBACK_SCALE_STEP.powi(scale_steps as i32)
    }

    /// Compute the directives for the next frame. Burst expiry restores
    /// baseline quality and in-flight settings in the same evaluation.
    pub fn directives(&self, now: Instant) -> EncoderDirectives {
        let scale = self
            .stream_scale_for_stage(self.fallback_stage)
            .max(FALLBACK_SCALE_FLOOR);
        let scaled_width = (self.width as f32 * scale) as u32;
        let scaled_height = (self.height as f32 * scale) as u32;

        let mut quality = derived_quality(
            self.settings.bitrate_bps,
            scaled_width,
            scaled_height,
            self.fps,
        );

        let typing = self.typing_burst_active(now);
        if typing {
            quality = quality.min(TYPING_BURST_QUALITY_CAP);
        }

        // Compression ceiling applies last.
        quality = quality.min(self.quality_ceiling);

        EncoderDirectives {
            quality,
            keyframe_quality: keyframe_quality(quality),
            in_flight_cap: if typing { 1 } else { 2 },
            prefer_scheduled_release: typing,
            chroma: self.chroma_for_stage(self.fallback_stage),
            stream_scale: scale,
        }
    }
}
