//! Display-clock-pulsed presenter.
//!
//! Each tick evaluates the current [`PolicyDecision`], gates itself on the
//! in-flight cap and the bounded drawable pool, pops a frame from the
//! cache and hands it to the [`Renderer`]. GPU specifics stay behind the
//! trait; draw completion comes back over oneshot channels so slot release
//! and presentation marking never block the tick path.

use std::sync::Arc;
use std::time::{Duration, Instant};

use mirage_protocol::types::{LatencyMode, TargetFrameRate};
use tokio::sync::{mpsc, oneshot, watch, Notify};
use tracing::trace;

use crate::admission::{AdmissionGate, SequenceGate};
use crate::cache::{FrameCache, FrameEntry};
use crate::ladder::{is_degraded, RecoveryTracker, RenderScaleLadder, WindowMetrics};
use crate::policy::{decide, PolicyDecision, PolicyInputs, ReleaseMode};

/// Length of one performance-measurement window.
const METRICS_WINDOW: Duration = Duration::from_millis(500);

/// A display pulse later than this factor of the frame interval lets a
/// decode arrival drive the tick instead.
const LATE_PULSE_FACTOR: f32 = 1.1;

/// Single retry delay after a failed in-flight acquisition.
const MICRO_RETRY: Duration = Duration::from_millis(1);

/// Single retry delay after a failed drawable acquisition.
const DRAWABLE_RETRY: Duration = Duration::from_millis(4);

/// Queue depth that justifies a secondary catch-up draw.
const SECONDARY_DRAW_MIN_DEPTH: usize = 3;

/// Healthy windows required to promote Smoothest mode.
const PROMOTION_HEALTHY_WINDOWS: u32 = 4;

/// Completion signals for one submitted draw. The renderer resolves
/// `scheduled` when the GPU accepts the work and `completed` when the
/// frame is on glass; dropping a sender marks the draw abandoned.
pub struct DrawHandle {
    pub scheduled: oneshot::Receiver<()>,
    pub completed: oneshot::Receiver<()>,
}

/// GPU boundary for one view.
///
/// Implementations own the real drawable pool and draw submission;
/// acquisition must be non-blocking (the loop retries once, briefly).
pub trait Renderer: Send + Sync + 'static {
    /// Try to take a presentation surface, bounded by `max`.
    fn try_acquire_drawable(&self, max: u32) -> bool;
    /// Return a surface after its draw finished or was abandoned.
    fn release_drawable(&self);
    /// Submit a draw of `entry` at `scale`.
    fn draw(&self, entry: FrameEntry, scale: f32) -> DrawHandle;
}

pub struct RenderLoop<R: Renderer> {
    mode: LatencyMode,
    target: TargetFrameRate,
    cache: Arc<FrameCache>,
    renderer: Arc<R>,
    in_flight: Arc<AdmissionGate>,
    sequence_gate: Arc<SequenceGate>,
    frame_ready: Arc<Notify>,

    ladder: RenderScaleLadder,
    recovery: RecoveryTracker,
    promotion_active: bool,
    promotion_healthy: u32,
    pressure_active: bool,
    /// Consecutive windows of drawable-wait pressure in LowestLatency.
    wait_pressure_windows: u32,

    frames_rendered: u32,
    cap_skips: u32,
    drawable_wait_total: Duration,
    drawable_waits: u32,
    window_started: Instant,
    last_display_pulse: Instant,
}

impl<R: Renderer> RenderLoop<R> {
    pub fn new(
        mode: LatencyMode,
        target: TargetFrameRate,
        cache: Arc<FrameCache>,
        renderer: Arc<R>,
    ) -> Self {
        let now = Instant::now();
        let gate_on = mode != LatencyMode::LowestLatency;
        Self {
            mode,
            target,
            cache,
            renderer,
            in_flight: Arc::new(AdmissionGate::new(2)),
            sequence_gate: Arc::new(SequenceGate::new()),
            frame_ready: Arc::new(Notify::new()),
            ladder: RenderScaleLadder::new(gate_on),
            recovery: RecoveryTracker::new(),
            promotion_active: false,
            promotion_healthy: 0,
            pressure_active: false,
            wait_pressure_windows: 0,
            frames_rendered: 0,
            cap_skips: 0,
            drawable_wait_total: Duration::ZERO,
            drawable_waits: 0,
            window_started: now,
            last_display_pulse: now,
        }
    }

    /// Notify handle the decode path signals when a frame lands in the
    /// cache; late display pulses are backfilled from it.
    pub fn frame_ready_handle(&self) -> Arc<Notify> {
        self.frame_ready.clone()
    }

    /// Drive the loop until shutdown.
    ///
    /// `pulses` carries hardware display-clock callbacks when the platform
    /// has them; without one, a monotonic timer at the target rate paces
    /// presentation.
    pub async fn run(
        mut self,
        mut pulses: Option<mpsc::Receiver<()>>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let interval = self.target.frame_interval();
        let mut timer = tokio::time::interval(interval);
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let use_timer = pulses.is_none();

        loop {
            let frame_ready = self.frame_ready.clone();
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                pulse = async { pulses.as_mut().expect("guarded").recv().await }, if !use_timer => {
                    match pulse {
                        Some(()) => {
                            let now = Instant::now();
                            self.last_display_pulse = now;
                            self.tick(now).await;
                        }
                        None => break,
                    }
                }
                _ = timer.tick(), if use_timer => {
                    let now = Instant::now();
                    self.last_display_pulse = now;
                    self.tick(now).await;
                }
                _ = frame_ready.notified(), if self.mode != LatencyMode::LowestLatency => {
                    // Decode-driven fallback only when the display pulse is
                    // demonstrably late.
                    let now = Instant::now();
                    if now.duration_since(self.last_display_pulse)
                        > interval.mul_f32(LATE_PULSE_FACTOR)
                    {
                        self.tick(now).await;
                    }
                }
            }
            self.maybe_roll_window(Instant::now());
        }
    }

    fn evaluate_policy(&self, now: Instant) -> PolicyDecision {
        decide(&PolicyInputs {
            latency_mode: self.mode,
            target_fps: self.target,
            typing_burst_active: self.cache.is_typing_burst_active(now),
            recovery_active: self.recovery.active(),
            smoothest_promotion_active: self.promotion_active,
            pressure_active: self.pressure_active,
            ladder_scale: self.ladder.current(),
        })
    }

    async fn tick(&mut self, now: Instant) {
        let decision = self.evaluate_policy(now);
        self.in_flight.set_limit(decision.in_flight_cap);

        if !self.in_flight.try_acquire() {
            self.cap_skips += 1;
            if !decision.allows_micro_retry {
                return;
            }
            tokio::time::sleep(MICRO_RETRY).await;
            if !self.in_flight.try_acquire() {
                return;
            }
        }

        let wait_start = Instant::now();
        let mut have_drawable = self.renderer.try_acquire_drawable(decision.max_drawables);
        if !have_drawable {
            tokio::time::sleep(DRAWABLE_RETRY).await;
            have_drawable = self.renderer.try_acquire_drawable(decision.max_drawables);
        }
        self.drawable_wait_total += wait_start.elapsed();
        self.drawable_waits += 1;
        if !have_drawable {
            self.in_flight.release();
            return;
        }

        if !self.draw_one(&decision, now) {
            return;
        }

        if decision.allows_secondary_catch_up_draw
            && self.cache.queue_depth() >= SECONDARY_DRAW_MIN_DEPTH
        {
            self.secondary_draw(&decision, now);
        }
    }

    /// Pop and draw one entry; the in-flight slot and a drawable are
    /// already held. Returns false if nothing was drawn (and the slot and
    /// drawable were given back).
    fn draw_one(&mut self, decision: &PolicyDecision, now: Instant) -> bool {
        let Some(entry) = self
            .cache
            .dequeue_for_presentation(decision.presentation, now)
        else {
            self.in_flight.release();
            self.renderer.release_drawable();
            return false;
        };

        // A concurrent path already presented something newer; showing
        // this entry would step backwards.
        if self.sequence_gate.is_stale(entry.sequence) {
            trace!(sequence = entry.sequence, "dropping stale frame entry");
            self.in_flight.release();
            self.renderer.release_drawable();
            return false;
        }

        let sequence = entry.sequence;
        let handle = self.renderer.draw(entry, decision.render_scale);
        self.frames_rendered += 1;

        let gate = self.in_flight.clone();
        let seq_gate = self.sequence_gate.clone();
        let cache = self.cache.clone();
        let renderer = self.renderer.clone();
        let release_mode = decision.release_mode;
        tokio::spawn(async move {
            let DrawHandle {
                scheduled,
                completed,
            } = handle;
            let presented = match release_mode {
                ReleaseMode::OnScheduled => {
                    let _ = scheduled.await;
                    gate.release();
                    completed.await.is_ok()
                }
                ReleaseMode::OnCompleted => {
                    let _ = scheduled.await;
                    let ok = completed.await.is_ok();
                    gate.release();
                    ok
                }
            };
            renderer.release_drawable();
            if presented {
                cache.mark_presented(sequence, Instant::now());
                seq_gate.note_presented(sequence);
            }
        });
        true
    }

    fn secondary_draw(&mut self, decision: &PolicyDecision, now: Instant) {
        if !self.in_flight.try_acquire() {
            return;
        }
        if !self.renderer.try_acquire_drawable(decision.max_drawables) {
            self.in_flight.release();
            return;
        }
        self.draw_one(decision, now);
    }

    fn maybe_roll_window(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.window_started);
        if elapsed < METRICS_WINDOW {
            return;
        }

        let metrics = WindowMetrics {
            rendered_fps: self.frames_rendered as f32 / elapsed.as_secs_f32(),
            drawable_wait_avg: if self.drawable_waits > 0 {
                self.drawable_wait_total / self.drawable_waits
            } else {
                Duration::ZERO
            },
            cap_skips: self.cap_skips,
        };
        let typing = self.cache.is_typing_burst_active(now);

        if self.mode == LatencyMode::LowestLatency {
            // The degradation gate stays off here unless drawable waits
            // (not FPS) show sustained pressure.
            let budget = self.target.frame_interval().mul_f32(1.5);
            if metrics.drawable_wait_avg >= budget {
                self.wait_pressure_windows += 1;
            } else {
                self.wait_pressure_windows = 0;
            }
            self.ladder.set_gate(self.wait_pressure_windows >= 2);
        }

        self.ladder
            .observe_window(&metrics, self.target, typing, now);
        self.recovery
            .observe_window(&metrics, self.target, typing, now);

        if self.mode == LatencyMode::Smoothest {
            if is_degraded(&metrics, self.target) {
                self.promotion_healthy = 0;
                self.promotion_active = false;
            } else {
                self.promotion_healthy += 1;
                if self.promotion_healthy >= PROMOTION_HEALTHY_WINDOWS {
                    self.promotion_active = true;
                }
            }
        }

        self.pressure_active =
            metrics.cap_skips > 0 || metrics.drawable_wait_avg > self.target.frame_interval();

        self.frames_rendered = 0;
        self.cap_skips = 0;
        self.drawable_wait_total = Duration::ZERO;
        self.drawable_waits = 0;
        self.window_started = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::{DecodedBuffer, PixelFormat};
    use mirage_protocol::fragment::ContentRect;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct MockRenderer {
        drawables_in_use: AtomicU32,
        draws: AtomicU32,
    }

    impl MockRenderer {
        fn new() -> Self {
            Self {
                drawables_in_use: AtomicU32::new(0),
                draws: AtomicU32::new(0),
            }
        }

        fn draw_count(&self) -> u32 {
            self.draws.load(Ordering::SeqCst)
        }
    }

    impl Renderer for MockRenderer {
        fn try_acquire_drawable(&self, max: u32) -> bool {
            self.drawables_in_use
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                    (n < max).then_some(n + 1)
                })
                .is_ok()
        }

        fn release_drawable(&self) {
            self.drawables_in_use.fetch_sub(1, Ordering::SeqCst);
        }

        fn draw(&self, _entry: FrameEntry, _scale: f32) -> DrawHandle {
            self.draws.fetch_add(1, Ordering::SeqCst);
            let (sched_tx, scheduled) = oneshot::channel();
            let (done_tx, completed) = oneshot::channel();
            let _ = sched_tx.send(());
            let _ = done_tx.send(());
            DrawHandle {
                scheduled,
                completed,
            }
        }
    }

    fn fill(cache: &FrameCache, n: usize) {
        for _ in 0..n {
            cache.enqueue(
                DecodedBuffer {
                    width: 2,
                    height: 2,
                    pixel_format: PixelFormat::Nv12,
                    data: vec![0; 6],
                },
                ContentRect::default(),
                Instant::now(),
            );
        }
    }

    fn render_loop(mode: LatencyMode) -> (RenderLoop<MockRenderer>, Arc<FrameCache>, Arc<MockRenderer>) {
        let cache = Arc::new(FrameCache::new(1));
        let renderer = Arc::new(MockRenderer::new());
        let rl = RenderLoop::new(mode, TargetFrameRate::Fps60, cache.clone(), renderer.clone());
        (rl, cache, renderer)
    }

    #[tokio::test]
    async fn tick_presents_and_marks() {
        let (mut rl, cache, renderer) = render_loop(LatencyMode::Auto);
        fill(&cache, 2);

        rl.tick(Instant::now()).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(renderer.draw_count(), 1);
        let (seq, _) = cache.presentation_snapshot().unwrap();
        assert_eq!(seq, 1); // Buffered FIFO: oldest first
        assert_eq!(rl.in_flight.in_flight(), 0);
    }

    #[tokio::test]
    async fn lowest_latency_presents_newest() {
        let (mut rl, cache, renderer) = render_loop(LatencyMode::LowestLatency);
        fill(&cache, 4);

        rl.tick(Instant::now()).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(renderer.draw_count(), 1);
        let (seq, _) = cache.presentation_snapshot().unwrap();
        assert_eq!(seq, 4);
        assert_eq!(cache.queue_depth(), 0);
    }

    #[tokio::test]
    async fn empty_cache_releases_slot_and_drawable() {
        let (mut rl, _cache, renderer) = render_loop(LatencyMode::Auto);
        rl.tick(Instant::now()).await;
        assert_eq!(renderer.draw_count(), 0);
        assert_eq!(rl.in_flight.in_flight(), 0);
        assert_eq!(renderer.drawables_in_use.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn stale_entries_are_dropped() {
        let (mut rl, cache, renderer) = render_loop(LatencyMode::Auto);
        fill(&cache, 1);
        // Something newer already reached the screen.
        rl.sequence_gate.note_presented(10);

        rl.tick(Instant::now()).await;
        assert_eq!(renderer.draw_count(), 0);
        assert_eq!(rl.in_flight.in_flight(), 0);
    }

    #[tokio::test]
    async fn saturated_gate_counts_cap_skip() {
        let (mut rl, cache, _renderer) = render_loop(LatencyMode::Auto);
        fill(&cache, 1);

        // Fill both Auto slots so the tick cannot admit a draw.
        rl.in_flight.set_limit(2);
        assert!(rl.in_flight.try_acquire());
        assert!(rl.in_flight.try_acquire());

        rl.tick(Instant::now()).await;
        assert_eq!(rl.cap_skips, 1);
    }

    #[tokio::test]
    async fn secondary_catch_up_draw_fires_at_depth() {
        let (mut rl, cache, renderer) = render_loop(LatencyMode::Auto);
        fill(&cache, 8);

        rl.tick(Instant::now()).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        // Primary draw plus one catch-up draw.
        assert_eq!(renderer.draw_count(), 2);
    }

    #[tokio::test]
    async fn run_loop_with_internal_timer_presents() {
        let (rl, cache, renderer) = render_loop(LatencyMode::Auto);
        fill(&cache, 3);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(rl.run(None, shutdown_rx));

        tokio::time::sleep(Duration::from_millis(120)).await;
        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();

        assert!(renderer.draw_count() >= 1);
        assert!(cache.presentation_snapshot().is_some());
    }
}
