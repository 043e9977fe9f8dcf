//! End-to-end dubbing run.
//!
//! [`Dubber`] validates the request, then drives the stages in order:
//! demux, segmentation, voice profiling, translation, synthesis,
//! reconciliation, collision cascade, assembly and mux. Each stage's output is
//! handed to the [`StageArtifactRecorder`]. The output file only appears once
//! the mux has succeeded.

use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tracing::{info, warn};

use crate::audio::{ms_to_frames, read_wav, PcmAudio};
use crate::config::Config;
use crate::error::{Result, RedubError};
use crate::language::{display_name, normalize_code};
use crate::media::{MediaInfo, MediaProcessor, MediaProcessorFactory};
use crate::pool::WorkerPool;
use crate::reconcile::{cascade, CascadeInput, ReconcileJob, Reconciler, Timeline};
use crate::run::RunContext;
use crate::snapshot::{Stage, StageArtifactRecorder};
use crate::subtitle::{dubbed_cues, source_cues, write_srt};
use crate::synthesize::{supports_language, SynthesisRequest, SynthesisStage, Synthesizer, SynthesizerFactory};
use crate::timeline::{load_background, TimelineAssembler};
use crate::transcribe::{Segmenter, Transcriber, TranscriberFactory};
use crate::translate::{TranslationStage, Translator, TranslatorFactory};
use crate::utterance::{
    build_flag_report, FlagEntry, SpeakerProfile, Utterance, UtteranceId, VoiceDescriptor,
};
use crate::voice::VoiceProfiler;

/// External services a run talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub media: Arc<dyn MediaProcessor>,
    pub transcriber: Arc<dyn Transcriber>,
    pub translator: Arc<dyn Translator>,
    pub synthesizer: Arc<dyn Synthesizer>,
}

impl Collaborators {
    /// Backends selected in the configuration
    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self {
            media: MediaProcessorFactory::create_processor(config.media.clone()),
            transcriber: TranscriberFactory::create_transcriber(config.transcriber.clone()),
            translator: TranslatorFactory::create_translator(config.translate.clone())?,
            synthesizer: SynthesizerFactory::create_synthesizer(config.synthesis.clone())?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct DubRequest {
    pub output: PathBuf,
    /// Detected from the audio when absent
    pub source_language: Option<String>,
    pub target_language: String,
}

/// What a completed run produced.
#[derive(Debug, Clone)]
pub struct DubOutcome {
    pub output: PathBuf,
    pub flags_path: PathBuf,
    pub flags: Vec<FlagEntry>,
    pub source_language: String,
    pub utterances: usize,
    pub placed_clips: usize,
    pub subtitles: Vec<PathBuf>,
    pub snapshot_dir: Option<PathBuf>,
}

#[derive(Serialize)]
struct ClipSnapshot<'a, T: Serialize> {
    clips: &'a [T],
    failures: &'a [FlagEntry],
}

/// `<output><suffix>`, e.g. `movie.mp4.flags.json`
fn sibling(output: &Path, suffix: &str) -> PathBuf {
    let mut name = output.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

/// Hidden path next to `output` keeping its extension so the muxer picks the same container.
fn partial_path(output: &Path) -> PathBuf {
    let stem = output
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "output".to_string());
    let name = match output.extension() {
        Some(ext) => format!(".{}.partial.{}", stem, ext.to_string_lossy()),
        None => format!(".{}.partial", stem),
    };
    output.with_file_name(name)
}

/// Move staged files to their final names in order, undoing on failure.
///
/// The dubbed output comes last, so a run that fails here publishes nothing.
async fn publish(staged: &[(PathBuf, PathBuf)]) -> Result<()> {
    let mut published: Vec<&Path> = Vec::with_capacity(staged.len());
    for (from, to) in staged {
        if let Err(e) = fs::rename(from, to).await {
            for path in published {
                if let Err(remove_error) = fs::remove_file(path).await {
                    warn!("Failed to remove {}: {}", path.display(), remove_error);
                }
            }
            return Err(e.into());
        }
        published.push(to);
    }
    Ok(())
}

/// Reject inputs that do not exist or whose extension is not accepted.
pub fn validate_input(input: &Path, accepted_formats: &[String]) -> Result<()> {
    if !input.is_file() {
        return Err(RedubError::FileNotFound(input.display().to_string()));
    }
    let extension = input
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    if !accepted_formats.iter().any(|f| f.eq_ignore_ascii_case(&extension)) {
        return Err(RedubError::UnsupportedFormat(format!(
            "{} (accepted: {})",
            input.display(),
            accepted_formats.join(", ")
        )));
    }
    Ok(())
}

/// Voice reference paths relative to the work directory, so snapshots do not depend on it.
fn portable_profiles(profiles: &[SpeakerProfile], work_dir: &Path) -> Vec<SpeakerProfile> {
    profiles
        .iter()
        .cloned()
        .map(|mut profile| {
            if let VoiceDescriptor::Embedding { reference_audio, .. } = &mut profile.voice {
                if let Some(relative) = pathdiff::diff_paths(&*reference_audio, work_dir) {
                    *reference_audio = relative;
                }
            }
            profile
        })
        .collect()
}

pub struct Dubber {
    config: Config,
    collaborators: Collaborators,
    recorder: StageArtifactRecorder,
    show_progress: bool,
}

impl Dubber {
    pub fn new(config: Config, collaborators: Collaborators) -> Self {
        let recorder = if config.snapshot.enabled {
            StageArtifactRecorder::new(&config.snapshot.directory)
        } else {
            StageArtifactRecorder::disabled()
        };
        Self {
            config,
            collaborators,
            recorder,
            show_progress: false,
        }
    }

    pub fn with_recorder(mut self, recorder: StageArtifactRecorder) -> Self {
        self.recorder = recorder;
        self
    }

    pub fn with_progress(mut self, show: bool) -> Self {
        self.show_progress = show;
        self
    }

    /// Check that every external service is reachable
    pub async fn check_collaborators(&self) -> Result<()> {
        self.collaborators.media.check_availability().await?;
        self.collaborators.translator.check_availability().await?;
        self.collaborators.synthesizer.check_availability().await?;
        Ok(())
    }

    fn check_source_language(&self, source: &str, target: &str) -> Result<()> {
        if !self.collaborators.transcriber.supports_language(source) {
            return Err(RedubError::UnsupportedLanguage {
                stage: "transcription".to_string(),
                language: source.to_string(),
            });
        }
        if !self.collaborators.translator.supports_pair(source, target) {
            return Err(RedubError::UnsupportedLanguage {
                stage: "translation".to_string(),
                language: format!("{}-{}", source, target),
            });
        }
        Ok(())
    }

    /// Dub `ctx.input` into `request.output`.
    ///
    /// The output, its flag report and subtitles are staged under hidden
    /// names and published together. On any error none of them is left
    /// behind; a cancelled run also removes its snapshots.
    pub async fn run(&self, ctx: &RunContext, request: &DubRequest) -> Result<DubOutcome> {
        let partial = partial_path(&request.output);
        let mut staged = Vec::new();
        let result = self.run_inner(ctx, request, &partial, &mut staged).await;

        if let Err(e) = &result {
            let mut leftovers = vec![partial.clone()];
            leftovers.extend(staged.iter().map(|(from, _)| from.clone()));
            for path in &leftovers {
                if path.exists() {
                    if let Err(remove_error) = fs::remove_file(path).await {
                        warn!("Failed to remove {}: {}", path.display(), remove_error);
                    }
                }
            }
            if matches!(e, RedubError::Cancelled) {
                info!("Run {} cancelled", ctx.run_id);
                self.recorder.discard(ctx);
            }
        }
        result
    }

    async fn run_inner(
        &self,
        ctx: &RunContext,
        request: &DubRequest,
        partial: &Path,
        staged: &mut Vec<(PathBuf, PathBuf)>,
    ) -> Result<DubOutcome> {
        let input = ctx.input.as_path();
        let sample_rate = self.config.media.sample_rate;
        let target = normalize_code(&request.target_language);

        validate_input(input, &self.config.media.accepted_formats)?;
        if !supports_language(self.collaborators.synthesizer.as_ref(), &target) {
            return Err(RedubError::UnsupportedLanguage {
                stage: "synthesis".to_string(),
                language: target,
            });
        }
        if let Some(source) = &request.source_language {
            self.check_source_language(&normalize_code(source), &target)?;
        }

        let work = match &self.config.pipeline.work_dir {
            Some(dir) => {
                fs::create_dir_all(dir).await?;
                tempfile::Builder::new().prefix("redub-").tempdir_in(dir)?
            }
            None => tempfile::Builder::new().prefix("redub-").tempdir()?,
        };
        let work_dir = work.path().to_path_buf();
        info!("Run {}: working in {}", ctx.run_id, work_dir.display());

        let outcome = self
            .dub(ctx, request, &target, &work_dir, partial, staged, sample_rate)
            .await;

        if self.config.pipeline.clean_intermediate_files {
            if let Err(e) = work.close() {
                warn!("Failed to remove working directory: {}", e);
            }
        } else {
            let kept = work.keep();
            info!("Intermediate files kept in {}", kept.display());
        }
        outcome
    }

    async fn dub(
        &self,
        ctx: &RunContext,
        request: &DubRequest,
        target: &str,
        work_dir: &Path,
        partial: &Path,
        staged: &mut Vec<(PathBuf, PathBuf)>,
        sample_rate: u32,
    ) -> Result<DubOutcome> {
        let input = ctx.input.as_path();
        let config = &self.config;
        let c = &self.collaborators;

        // Demux
        ctx.ensure_active()?;
        let info: MediaInfo = c.media.probe(input).await?;
        let extracted = work_dir.join("source.wav");
        c.media.extract_audio(input, &extracted, sample_rate).await?;

        let source = match &request.source_language {
            Some(source) => normalize_code(source),
            None => {
                let detected = normalize_code(&c.transcriber.detect_language(&extracted).await?);
                info!("Detected source language: {}", display_name(&detected));
                self.check_source_language(&detected, target)?;
                detected
            }
        };
        info!(
            "Dubbing {} from {} to {}",
            input.display(),
            display_name(&source),
            display_name(target)
        );

        ctx.ensure_active()?;
        let background = match c.media.separate_background(&extracted, work_dir).await? {
            Some(path) => Some(load_background(path, sample_rate)?),
            None => None,
        };

        // Segmentation
        ctx.ensure_active()?;
        let segmenter = Segmenter::new(c.transcriber.as_ref(), &config.transcriber);
        let utterances = segmenter
            .segment(ctx, &extracted, &source, target, config.pipeline.max_attempts)
            .await?;
        self.recorder.record(ctx, Stage::Segmentation, &utterances)?;

        // Voice profiles
        ctx.ensure_active()?;
        let cloning = config.pipeline.voice_cloning;
        let source_audio = if cloning {
            read_wav(&extracted)?
        } else {
            PcmAudio::new(Vec::new(), sample_rate)
        };
        let profiler = VoiceProfiler::new(
            &config.synthesis.speaker_voices,
            c.synthesizer.preset_voices(target),
            config.synthesis.reference_max_ms,
        );
        let profiles = profiler.profile(&utterances, &source_audio, cloning, &work_dir.join("voices"))?;
        self.recorder
            .record(ctx, Stage::VoiceProfiles, &portable_profiles(&profiles, work_dir))?;

        let pool = WorkerPool::new(
            config.pipeline.worker_count(),
            config.pipeline.max_attempts,
            ctx.cancellation_token(),
        )
        .with_progress(self.show_progress);

        // Translation
        let translated = TranslationStage::new(c.translator.clone(), &config.translate)
            .run(&pool, &utterances)
            .await?;
        self.recorder.record(ctx, Stage::Translation, &translated)?;

        // Synthesis
        let synthesis = SynthesisStage::new(c.synthesizer.clone(), &config.synthesis, sample_rate)
            .run(&pool, &translated, &profiles)
            .await?;
        self.recorder.record(
            ctx,
            Stage::Synthesis,
            &ClipSnapshot {
                clips: &synthesis.clips,
                failures: &synthesis.failures,
            },
        )?;

        // Reconciliation
        let windows: HashMap<UtteranceId, &Utterance> =
            translated.iter().map(|t| (t.id(), &t.utterance)).collect();
        let voices: HashMap<&str, &VoiceDescriptor> = profiles
            .iter()
            .map(|p| (p.speaker_id.as_str(), &p.voice))
            .collect();
        let texts: HashMap<UtteranceId, &str> = translated
            .iter()
            .map(|t| (t.id(), t.target_text.as_str()))
            .collect();

        let mut jobs = Vec::with_capacity(synthesis.clips.len());
        for clip in synthesis.clips {
            let Some(utterance) = windows.get(&clip.utterance_id) else {
                continue;
            };
            let Some(voice) = voices.get(utterance.speaker_id.as_str()) else {
                continue;
            };
            jobs.push(ReconcileJob {
                start_ms: utterance.start_ms,
                end_ms: utterance.end_ms,
                request: SynthesisRequest {
                    text: texts.get(&clip.utterance_id).copied().unwrap_or_default().to_string(),
                    language: utterance.target_language.clone(),
                    voice: (*voice).clone(),
                    rate: None,
                },
                clip,
            });
        }

        let reconciler = Reconciler::new(
            config.reconcile.clone(),
            c.synthesizer.clone(),
            sample_rate,
            Duration::from_secs(config.synthesis.timeout_secs),
        );
        let reconciled = reconciler.run(&pool, jobs).await?;
        self.recorder.record(
            ctx,
            Stage::Reconciliation,
            &ClipSnapshot {
                clips: &reconciled.clips,
                failures: &reconciled.failures,
            },
        )?;

        // Collision cascade
        ctx.ensure_active()?;
        let inputs: Vec<CascadeInput> = reconciled
            .clips
            .iter()
            .filter_map(|clip| {
                windows.get(&clip.utterance_id).map(|u| CascadeInput {
                    utterance_id: clip.utterance_id,
                    start_ms: u.start_ms,
                    frames: clip.audio.frames() as u64,
                })
            })
            .collect();
        let timeline: Timeline = cascade(&inputs, sample_rate, ms_to_frames(info.duration_ms, sample_rate));
        self.recorder.record(ctx, Stage::Timeline, &timeline)?;

        // Assembly and mux
        ctx.ensure_active()?;
        let master = work_dir.join("master.wav");
        let clips: HashMap<UtteranceId, &PcmAudio> = reconciled
            .clips
            .iter()
            .map(|clip| (clip.utterance_id, &clip.audio))
            .collect();
        TimelineAssembler::new(sample_rate, config.media.background_gain).assemble(
            &master,
            info.duration_ms,
            &timeline,
            &clips,
            background.as_ref(),
        )?;

        ctx.ensure_active()?;
        c.media.mux(input, &master, partial, &info).await?;

        // Reports
        let flags = build_flag_report(
            translated
                .iter()
                .flat_map(|t| t.utterance.flags.iter().map(move |f| (t.id(), f)))
                .chain(
                    synthesis
                        .failures
                        .iter()
                        .chain(reconciled.failures.iter())
                        .flat_map(|e| e.flags.iter().map(move |f| (e.utterance_id, f))),
                )
                .chain(
                    reconciled
                        .clips
                        .iter()
                        .flat_map(|clip| clip.flags.iter().map(move |f| (clip.utterance_id, f))),
                )
                .chain(timeline.flags()),
        );
        let flags_path = sibling(&request.output, ".flags.json");
        let staged_flags = sibling(partial, ".flags.json");
        staged.push((staged_flags.clone(), flags_path.clone()));
        fs::write(&staged_flags, serde_json::to_string_pretty(&flags)?).await?;

        let mut subtitles = Vec::new();
        if config.pipeline.original_subtitles {
            let suffix = format!(".{}.srt", source);
            let path = sibling(partial, &suffix);
            staged.push((path.clone(), sibling(&request.output, &suffix)));
            write_srt(&source_cues(&utterances), &path).await?;
            subtitles.push(sibling(&request.output, &suffix));
        }
        if config.pipeline.dubbed_subtitles {
            let suffix = format!(".{}.srt", target);
            let path = sibling(partial, &suffix);
            staged.push((path.clone(), sibling(&request.output, &suffix)));
            write_srt(&dubbed_cues(&translated, &timeline), &path).await?;
            subtitles.push(sibling(&request.output, &suffix));
        }

        self.recorder.finish(ctx)?;
        ctx.ensure_active()?;

        staged.push((partial.to_path_buf(), request.output.clone()));
        publish(staged).await?;
        info!("Dubbed output written: {}", request.output.display());
        if !flags.is_empty() {
            warn!("{} utterances carry flags, see {}", flags.len(), flags_path.display());
        }

        Ok(DubOutcome {
            output: request.output.clone(),
            flags_path,
            flags,
            source_language: source,
            utterances: utterances.len(),
            placed_clips: timeline.entries.len(),
            subtitles,
            snapshot_dir: self.recorder.run_dir(ctx),
        })
    }
}
