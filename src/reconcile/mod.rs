//! Duration reconciliation.
//!
//! Each synthesized clip is fitted to its source window independently:
//! accept within slack, otherwise compress up to the ceiling, otherwise
//! re-synthesize faster once and plan again, otherwise record the overflow.
//! Placement conflicts left by overflowing clips are resolved afterwards by
//! the ordered [`cascade`] pass.
//!
//! Decisions are made on sample-frame counts with ratios quantised to
//! 1/1000, so identical inputs always yield identical plans.

pub mod cascade;
pub mod stretch;

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub use cascade::*;
pub use stretch::*;
use crate::audio::{frames_to_ms, ms_to_frames, PcmAudio};
use crate::config::{ReconcileConfig, UnderDurationPolicy};
use crate::error::{Result, RedubError};
use crate::pool::{TaskOutcome, WorkerPool};
use crate::snapshot::Stage;
use crate::synthesize::{synthesize_clip, SynthesisRequest, Synthesizer};
use crate::utterance::{Adjustment, FlagEntry, ReconciledClip, SynthesizedClip, UtteranceFlag};

const RATIO_SCALE: f64 = 1000.0;

/// Round a ratio up to the next 1/1000 step
pub fn quantize_up(ratio: f64) -> f64 {
    (ratio * RATIO_SCALE - 1e-9).ceil() / RATIO_SCALE
}

/// Round a ratio down to the previous 1/1000 step
pub fn quantize_down(ratio: f64) -> f64 {
    (ratio * RATIO_SCALE + 1e-9).floor() / RATIO_SCALE
}

/// Frames produced by playing `frames` at tempo `ratio`
pub fn stretched_frames(frames: u64, ratio: f64) -> u64 {
    (frames as f64 / ratio).round() as u64
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FitDecision {
    /// Within slack, left untouched
    Accept,
    /// Compressed to exactly fill the window
    Compress { ratio: f64 },
    /// Compressed at the ceiling and still longer than the window
    Overflow { ratio: f64 },
    /// Slowed down toward the window length
    SlowDown { ratio: f64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct FitPlan {
    pub decision: FitDecision,
    pub target_frames: u64,
}

impl FitPlan {
    pub fn fits(&self, available_frames: u64) -> bool {
        self.target_frames <= available_frames || matches!(self.decision, FitDecision::Accept)
    }
}

/// Pure planning step over frame counts.
pub fn plan(native_frames: u64, available_frames: u64, config: &ReconcileConfig) -> FitPlan {
    let native = native_frames as f64;
    let available = available_frames as f64;

    if native_frames <= available_frames || native <= available * (1.0 + config.slack) {
        let padding = available_frames.saturating_sub(native_frames) as f64;
        let slow_down = config.under_duration_policy == UnderDurationPolicy::SlowDown
            && native_frames > 0
            && padding > config.slowdown_threshold * available;
        if slow_down {
            let ratio = quantize_up((native / available).max(config.min_slowdown_ratio));
            if ratio < 1.0 {
                return FitPlan {
                    decision: FitDecision::SlowDown { ratio },
                    target_frames: stretched_frames(native_frames, ratio).min(available_frames),
                };
            }
        }
        return FitPlan {
            decision: FitDecision::Accept,
            target_frames: native_frames,
        };
    }

    if available_frames > 0 {
        let ratio = quantize_up(native / available);
        if ratio <= config.max_compression {
            return FitPlan {
                decision: FitDecision::Compress { ratio },
                target_frames: available_frames,
            };
        }
    }

    let ratio = quantize_down(config.max_compression).max(1.0);
    FitPlan {
        decision: FitDecision::Overflow { ratio },
        target_frames: stretched_frames(native_frames, ratio),
    }
}

/// Speed directive for re-synthesis of a clip that cannot be compressed to fit
pub fn resynthesis_rate(native_frames: u64, available_frames: u64, config: &ReconcileConfig) -> Option<f64> {
    if available_frames == 0 || config.max_speech_rate <= 1.0 {
        return None;
    }
    let wanted = (native_frames as f64 / config.max_compression) / available_frames as f64;
    let rate = quantize_up(wanted.clamp(1.0, config.max_speech_rate)).min(config.max_speech_rate);
    (rate > 1.0).then_some(rate)
}

/// Everything the reconciler needs for one utterance.
#[derive(Debug, Clone)]
pub struct ReconcileJob {
    pub clip: SynthesizedClip,
    pub start_ms: u64,
    pub end_ms: u64,
    /// Request the clip was synthesized from, reused for re-synthesis
    pub request: SynthesisRequest,
}

#[derive(Debug, Default)]
pub struct ReconcileOutput {
    pub clips: Vec<ReconciledClip>,
    pub failures: Vec<FlagEntry>,
}

#[derive(Clone)]
pub struct Reconciler {
    config: ReconcileConfig,
    synthesizer: Arc<dyn Synthesizer>,
    sample_rate: u32,
    synthesis_timeout: Duration,
}

impl Reconciler {
    pub fn new(
        config: ReconcileConfig,
        synthesizer: Arc<dyn Synthesizer>,
        sample_rate: u32,
        synthesis_timeout: Duration,
    ) -> Self {
        Self {
            config,
            synthesizer,
            sample_rate,
            synthesis_timeout,
        }
    }

    async fn apply(&self, audio: PcmAudio, plan: FitPlan) -> Result<PcmAudio> {
        if matches!(plan.decision, FitDecision::Accept) {
            return Ok(audio);
        }
        let target = plan.target_frames as usize;
        tokio::task::spawn_blocking(move || time_stretch(&audio, target))
            .await
            .map_err(|e| RedubError::Synthesis(format!("Time stretch failed: {}", e)))
    }

    async fn resynthesize(&self, request: &SynthesisRequest, rate: f64) -> Option<PcmAudio> {
        let mut request = request.clone();
        request.rate = Some(rate);
        let call = synthesize_clip(self.synthesizer.as_ref(), request, self.sample_rate);
        match tokio::time::timeout(self.synthesis_timeout, call).await {
            Ok(Ok(audio)) => Some(audio),
            Ok(Err(e)) => {
                warn!("Re-synthesis at rate {:.3} failed: {}", rate, e);
                None
            }
            Err(_) => {
                warn!("Re-synthesis at rate {:.3} timed out", rate);
                None
            }
        }
    }

    /// Fit one clip into its window.
    pub async fn reconcile_clip(&self, job: ReconcileJob) -> Result<ReconciledClip> {
        let available_ms = job.end_ms.saturating_sub(job.start_ms);
        let available = ms_to_frames(available_ms, self.sample_rate);
        let mut audio = job.clip.audio;
        let mut native = audio.frames() as u64;
        let mut flags = Vec::new();

        let mut fit = plan(native, available, &self.config);
        let mut resynthesized_at = None;

        if !fit.fits(available) && self.synthesizer.supports_rate() {
            if let Some(rate) = resynthesis_rate(native, available, &self.config) {
                debug!("Utterance {}: re-synthesizing at rate {:.3}", job.clip.utterance_id, rate);
                if let Some(faster) = self.resynthesize(&job.request, rate).await {
                    audio = faster;
                    native = audio.frames() as u64;
                    fit = plan(native, available, &self.config);
                    resynthesized_at = Some(rate);
                    flags.push(UtteranceFlag::Resynthesized { rate });
                }
            }
        }

        let audio = self.apply(audio, fit).await?;
        let final_frames = audio.frames() as u64;
        let overflow_frames = final_frames.saturating_sub(available);
        let overflow_ms = frames_to_ms(overflow_frames, self.sample_rate);

        // slack-accepted overruns are flagged too
        if overflow_frames > 0 {
            warn!(
                "Utterance {} overflows its window by {} ms",
                job.clip.utterance_id, overflow_ms
            );
            flags.push(UtteranceFlag::Overflow { ms: overflow_ms });
        }

        let ratio = match fit.decision {
            FitDecision::Accept => 1.0,
            FitDecision::Compress { ratio } | FitDecision::Overflow { ratio } | FitDecision::SlowDown { ratio } => ratio,
        };
        let adjustment = match (resynthesized_at, fit.decision) {
            (Some(rate), _) => Adjustment::Resynthesized { rate, ratio },
            (None, FitDecision::Accept) => Adjustment::None,
            (None, FitDecision::Compress { ratio } | FitDecision::Overflow { ratio }) => {
                Adjustment::Compressed { ratio }
            }
            (None, FitDecision::SlowDown { ratio }) => Adjustment::SlowedDown { ratio },
        };

        Ok(ReconciledClip {
            utterance_id: job.clip.utterance_id,
            final_duration_ms: frames_to_ms(final_frames, self.sample_rate),
            padding_ms: frames_to_ms(available.saturating_sub(final_frames), self.sample_rate),
            overflow_ms,
            adjustment,
            audio,
            flags,
        })
    }

    /// Reconcile every clip on the worker pool, preserving input order.
    pub async fn run(&self, pool: &WorkerPool, jobs: Vec<ReconcileJob>) -> Result<ReconcileOutput> {
        info!("Reconciling {} clips", jobs.len());
        let ids: Vec<_> = jobs.iter().map(|j| j.clip.utterance_id).collect();
        let reconciler = self.clone();
        let timeout = self.synthesis_timeout * 2 + Duration::from_secs(60);

        let outcomes = pool
            .run("Reconciling", jobs, timeout, move |job| {
                let reconciler = reconciler.clone();
                async move { reconciler.reconcile_clip(job).await }
            })
            .await?;

        let mut output = ReconcileOutput::default();
        for (utterance_id, outcome) in ids.into_iter().zip(outcomes) {
            match outcome {
                TaskOutcome::Completed { value, .. } => output.clips.push(value),
                TaskOutcome::Failed { error, .. } => {
                    warn!("Utterance {} could not be reconciled: {}", utterance_id, error);
                    output.failures.push(FlagEntry {
                        utterance_id,
                        stage: Stage::Reconciliation,
                        flags: vec![UtteranceFlag::SynthesisFailed {
                            reason: error.to_string(),
                        }],
                    });
                }
            }
        }
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::synthesize::MockSynthesizer;
    use crate::utterance::VoiceDescriptor;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use tokio_util::sync::CancellationToken;

    const SR: u32 = 16_000;

    fn frames(ms: u64) -> u64 {
        ms_to_frames(ms, SR)
    }

    fn tone(ms: u64) -> PcmAudio {
        let n = frames(ms) as usize;
        PcmAudio::new(
            (0..n)
                .map(|i| 0.4 * (std::f32::consts::TAU * 180.0 * i as f32 / SR as f32).sin())
                .collect(),
            SR,
        )
    }

    fn job(id: u32, start_ms: u64, end_ms: u64, native_ms: u64) -> ReconcileJob {
        let audio = tone(native_ms);
        ReconcileJob {
            clip: SynthesizedClip {
                utterance_id: id,
                native_duration_ms: audio.duration_ms(),
                audio,
            },
            start_ms,
            end_ms,
            request: SynthesisRequest {
                text: "texto".to_string(),
                language: "es".to_string(),
                voice: VoiceDescriptor::Preset {
                    name: "nova".to_string(),
                },
                rate: None,
            },
        }
    }

    fn fixed_rate_synth(supports_rate: bool) -> MockSynthesizer {
        let mut mock = MockSynthesizer::new();
        mock.expect_supports_rate().return_const(supports_rate);
        mock
    }

    #[test]
    fn test_quantization_rounds_in_the_fitting_direction() {
        assert_eq!(quantize_up(1.5), 1.5);
        assert_eq!(quantize_up(1.50001), 1.501);
        assert_eq!(quantize_down(1.5009), 1.5);
        assert_eq!(quantize_up(4500.0 / 3000.0), 1.5);
    }

    #[test]
    fn test_plan_within_slack_is_accepted() {
        let config = ReconcileConfig::default();
        let fit = plan(frames(1200), frames(2000), &config);
        assert_eq!(fit.decision, FitDecision::Accept);
        let fit = plan(frames(2150), frames(2000), &config);
        assert_eq!(fit.decision, FitDecision::Accept);
    }

    #[test]
    fn test_plan_compresses_to_the_window() {
        let config = ReconcileConfig::default();
        let fit = plan(frames(4500), frames(2000), &config);
        assert!(matches!(fit.decision, FitDecision::Overflow { ratio } if ratio == 1.5));
        assert_eq!(fit.target_frames, frames(3000));

        let fit = plan(frames(2500), frames(2000), &config);
        assert_eq!(fit.decision, FitDecision::Compress { ratio: 1.25 });
        assert_eq!(fit.target_frames, frames(2000));
    }

    #[test]
    fn test_plan_slow_down_policy() {
        let mut config = ReconcileConfig::default();
        config.under_duration_policy = UnderDurationPolicy::SlowDown;

        let fit = plan(frames(1200), frames(2000), &config);
        assert_eq!(fit.decision, FitDecision::SlowDown { ratio: 0.9 });
        assert_eq!(fit.target_frames, stretched_frames(frames(1200), 0.9));
        assert!(fit.target_frames <= frames(2000));

        // padding below the threshold keeps the clip as it is
        let fit = plan(frames(1800), frames(2000), &config);
        assert_eq!(fit.decision, FitDecision::Accept);
    }

    #[test]
    fn test_plan_is_deterministic_and_monotone_in_the_ceiling() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..500 {
            let native = rng.gen_range(1..200_000u64);
            let available = rng.gen_range(1..200_000u64);
            let mut previous = u64::MAX;
            for step in 0..20 {
                let config = ReconcileConfig {
                    max_compression: 1.0 + step as f64 * 0.1,
                    ..ReconcileConfig::default()
                };
                let a = plan(native, available, &config);
                let b = plan(native, available, &config);
                assert_eq!(a, b);
                assert!(a.target_frames <= previous);
                if matches!(a.decision, FitDecision::Compress { .. } | FitDecision::SlowDown { .. }) {
                    assert!(a.target_frames <= available);
                }
                previous = a.target_frames;
            }
        }
    }

    #[test]
    fn test_resynthesis_rate_is_clamped() {
        let config = ReconcileConfig::default();
        // 6000 ms into 3000 ms with ceiling 1.5 wants rate 1.333, clamped to 1.25
        assert_eq!(resynthesis_rate(frames(6000), frames(3000), &config), Some(1.25));
        assert_eq!(resynthesis_rate(frames(4800), frames(3000), &config), Some(1.067));
        assert_eq!(resynthesis_rate(frames(4000), frames(3000), &config), None);
    }

    #[tokio::test]
    async fn test_long_clip_is_compressed_at_the_ceiling() {
        // window 1000-3000 ms, 4500 ms native, ceiling 1.5
        let reconciler = Reconciler::new(
            ReconcileConfig::default(),
            Arc::new(fixed_rate_synth(false)),
            SR,
            Duration::from_secs(5),
        );
        let clip = reconciler.reconcile_clip(job(0, 1000, 3000, 4500)).await.unwrap();

        assert!(clip.final_duration_ms <= 3000);
        assert_eq!(clip.adjustment, Adjustment::Compressed { ratio: 1.5 });
    }

    #[tokio::test]
    async fn test_compressed_clip_fits_its_window() {
        let reconciler = Reconciler::new(
            ReconcileConfig::default(),
            Arc::new(fixed_rate_synth(false)),
            SR,
            Duration::from_secs(5),
        );
        let clip = reconciler.reconcile_clip(job(0, 1000, 4000, 4500)).await.unwrap();

        assert_eq!(clip.final_duration_ms, 3000);
        assert_eq!(clip.adjustment, Adjustment::Compressed { ratio: 1.5 });
        assert_eq!(clip.overflow_ms, 0);
        assert_eq!(clip.padding_ms, 0);
        assert!(clip.flags.is_empty());
    }

    #[tokio::test]
    async fn test_short_clip_is_padded_unmodified() {
        let reconciler = Reconciler::new(
            ReconcileConfig::default(),
            Arc::new(fixed_rate_synth(true)),
            SR,
            Duration::from_secs(5),
        );
        let input = job(0, 0, 2000, 1200);
        let original = input.clip.audio.clone();
        let clip = reconciler.reconcile_clip(input).await.unwrap();

        assert_eq!(clip.adjustment, Adjustment::None);
        assert_eq!(clip.padding_ms, 800);
        assert_eq!(clip.audio, original);
    }

    #[tokio::test]
    async fn test_overflow_is_recorded_without_rate_control() {
        let reconciler = Reconciler::new(
            ReconcileConfig::default(),
            Arc::new(fixed_rate_synth(false)),
            SR,
            Duration::from_secs(5),
        );
        let clip = reconciler.reconcile_clip(job(0, 0, 2000, 4500)).await.unwrap();

        assert_eq!(clip.final_duration_ms, 3000);
        assert_eq!(clip.overflow_ms, 1000);
        assert_eq!(clip.flags, vec![UtteranceFlag::Overflow { ms: 1000 }]);
    }

    #[tokio::test]
    async fn test_overrun_within_slack_is_flagged_unmodified() {
        let reconciler = Reconciler::new(
            ReconcileConfig::default(),
            Arc::new(fixed_rate_synth(true)),
            SR,
            Duration::from_secs(5),
        );
        let clip = reconciler.reconcile_clip(job(0, 0, 2000, 2150)).await.unwrap();

        assert_eq!(clip.adjustment, Adjustment::None);
        assert_eq!(clip.final_duration_ms, 2150);
        assert_eq!(clip.overflow_ms, 150);
        assert_eq!(clip.flags, vec![UtteranceFlag::Overflow { ms: 150 }]);
    }

    #[tokio::test]
    async fn test_slow_down_stretches_short_clip_within_window() {
        let config = ReconcileConfig {
            under_duration_policy: UnderDurationPolicy::SlowDown,
            ..ReconcileConfig::default()
        };
        let reconciler = Reconciler::new(config, Arc::new(fixed_rate_synth(false)), SR, Duration::from_secs(5));
        let clip = reconciler.reconcile_clip(job(0, 0, 2000, 1200)).await.unwrap();

        let expected = stretched_frames(frames(1200), 0.9);
        assert_eq!(clip.adjustment, Adjustment::SlowedDown { ratio: 0.9 });
        assert_eq!(clip.audio.frames() as u64, expected);
        assert_eq!(clip.final_duration_ms, frames_to_ms(expected, SR));
        assert_eq!(clip.padding_ms, frames_to_ms(frames(2000) - expected, SR));
        assert_eq!(clip.overflow_ms, 0);
        assert!(clip.flags.is_empty());
    }

    #[tokio::test]
    async fn test_resynthesis_brings_clip_into_window() {
        let mut mock = fixed_rate_synth(true);
        mock.expect_synthesize().times(1).returning(|request| {
            let rate = request.rate.unwrap_or(1.0);
            Ok(tone((6000.0 / rate).round() as u64))
        });
        let reconciler = Reconciler::new(ReconcileConfig::default(), Arc::new(mock), SR, Duration::from_secs(5));

        // 6000 ms into 3000 ms: rate 1.25 gives 4800 ms, still needs 1.6 > 1.5
        let clip = reconciler.reconcile_clip(job(0, 0, 3000, 6000)).await.unwrap();
        assert_eq!(clip.adjustment, Adjustment::Resynthesized { rate: 1.25, ratio: 1.5 });
        assert_eq!(clip.final_duration_ms, 3200);
        assert!(clip.flags.contains(&UtteranceFlag::Resynthesized { rate: 1.25 }));
        assert!(clip.flags.contains(&UtteranceFlag::Overflow { ms: 200 }));

        let mut mock = fixed_rate_synth(true);
        mock.expect_synthesize().times(1).returning(|request| {
            let rate = request.rate.unwrap_or(1.0);
            Ok(tone((4000.0 / rate).round() as u64))
        });
        let reconciler = Reconciler::new(
            ReconcileConfig {
                max_compression: 1.2,
                ..ReconcileConfig::default()
            },
            Arc::new(mock),
            SR,
            Duration::from_secs(5),
        );
        // 4000 ms into 3000 ms with ceiling 1.2: rate 1.112 then compression fits
        let clip = reconciler.reconcile_clip(job(1, 0, 3000, 4000)).await.unwrap();
        assert_eq!(clip.final_duration_ms, 3000);
        assert!(matches!(clip.adjustment, Adjustment::Resynthesized { .. }));
        assert_eq!(clip.overflow_ms, 0);
    }

    #[tokio::test]
    async fn test_pool_run_keeps_utterance_order() {
        let reconciler = Reconciler::new(
            ReconcileConfig::default(),
            Arc::new(fixed_rate_synth(false)),
            SR,
            Duration::from_secs(5),
        );
        let pool = WorkerPool::new(3, 1, CancellationToken::new());
        let jobs = vec![job(0, 0, 1000, 1400), job(1, 1000, 2000, 500), job(2, 2000, 3000, 900)];

        let output = reconciler.run(&pool, jobs).await.unwrap();
        let ids: Vec<u32> = output.clips.iter().map(|c| c.utterance_id).collect();
        assert_eq!(ids, vec![0, 1, 2]);
        assert!(output.failures.is_empty());
        assert!(output.clips[0].final_duration_ms <= 1000);
    }
}
