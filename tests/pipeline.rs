use assert_fs::prelude::*;
use assert_fs::TempDir;
use async_trait::async_trait;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use redub::audio::{ms_to_frames, read_wav, write_wav, PcmAudio};
use redub::config::Config;
use redub::error::{RedubError, Result};
use redub::media::{MediaInfo, MediaProcessor};
use redub::run::RunContext;
use redub::snapshot::{diff_runs, Stage};
use redub::synthesize::{SynthesisRequest, Synthesizer};
use redub::transcribe::{RawSegment, RawTranscription, TimeWindow, Transcriber};
use redub::translate::{TranslationRequest, Translator};
use redub::utterance::{FlagEntry, UtteranceFlag};
use redub::workflow::{Collaborators, DubRequest, Dubber};

const SR: u32 = 16_000;
const DURATION_MS: u64 = 5_000;
/// Synthesized speech length per character of target text
const MS_PER_CHAR: u64 = 60;

struct FakeMedia;

#[async_trait]
impl MediaProcessor for FakeMedia {
    async fn probe(&self, _input: &Path) -> Result<MediaInfo> {
        Ok(MediaInfo {
            duration_ms: DURATION_MS,
            has_video: true,
            frame_rate: Some(25.0),
            audio_streams: 1,
        })
    }

    async fn extract_audio(&self, _input: &Path, output: &Path, sample_rate: u32) -> Result<()> {
        let frames = ms_to_frames(DURATION_MS, sample_rate) as usize;
        let samples = (0..frames)
            .map(|i| 0.3 * (std::f32::consts::TAU * 220.0 * i as f32 / sample_rate as f32).sin())
            .collect();
        write_wav(output, &PcmAudio::new(samples, sample_rate))
    }

    async fn separate_background(&self, _audio: &Path, _work_dir: &Path) -> Result<Option<PathBuf>> {
        Ok(None)
    }

    async fn mux(&self, _input: &Path, dubbed_audio: &Path, output: &Path, _info: &MediaInfo) -> Result<()> {
        tokio::fs::copy(dubbed_audio, output).await?;
        Ok(())
    }

    async fn check_availability(&self) -> Result<()> {
        Ok(())
    }
}

struct FakeTranscriber {
    segments: Vec<RawSegment>,
}

#[async_trait]
impl Transcriber for FakeTranscriber {
    fn name(&self) -> &str {
        "fake-stt"
    }

    fn supported_languages(&self) -> Vec<String> {
        vec!["en".to_string()]
    }

    async fn detect_language(&self, _audio: &Path) -> Result<String> {
        Ok("EN".to_string())
    }

    async fn transcribe(&self, _audio: &Path, language: &str) -> Result<RawTranscription> {
        Ok(RawTranscription {
            language: language.to_string(),
            segments: self.segments.clone(),
        })
    }

    async fn transcribe_region(&self, _audio: &Path, _window: TimeWindow, _language: &str) -> Result<String> {
        Ok("fine".to_string())
    }
}

#[derive(Default)]
struct FakeTranslator {
    cancel_on_call: Option<CancellationToken>,
}

#[async_trait]
impl Translator for FakeTranslator {
    fn name(&self) -> &str {
        "fake-mt"
    }

    fn supports_pair(&self, source: &str, _target: &str) -> bool {
        source == "en"
    }

    async fn translate(&self, request: TranslationRequest) -> Result<String> {
        if let Some(token) = &self.cancel_on_call {
            token.cancel();
        }
        Ok(format!("[{}] {}", request.target_language, request.text))
    }

    async fn check_availability(&self) -> Result<()> {
        Ok(())
    }
}

struct FakeSynthesizer;

#[async_trait]
impl Synthesizer for FakeSynthesizer {
    fn name(&self) -> &str {
        "fake-tts"
    }

    fn supported_languages(&self) -> Vec<String> {
        vec!["es".to_string()]
    }

    fn supports_rate(&self) -> bool {
        true
    }

    fn preset_voices(&self, _language: &str) -> Vec<String> {
        vec!["alpha".to_string(), "beta".to_string()]
    }

    async fn synthesize(&self, request: SynthesisRequest) -> Result<PcmAudio> {
        let native = ms_to_frames(request.text.chars().count() as u64 * MS_PER_CHAR, SR) as f64;
        let frames = (native / request.rate.unwrap_or(1.0)).round() as usize;
        Ok(PcmAudio::new(vec![0.2; frames], SR))
    }

    async fn check_availability(&self) -> Result<()> {
        Ok(())
    }
}

fn segment(start_ms: u64, end_ms: u64, speaker: &str, text: Option<&str>) -> RawSegment {
    RawSegment {
        start_ms,
        end_ms,
        speaker: speaker.to_string(),
        text: text.map(str::to_string),
        confidence: 0.9,
    }
}

/// Second utterance cannot fit its 500 ms window and spills into the third.
fn speech() -> Vec<RawSegment> {
    vec![
        segment(0, 1000, "A", Some("hello there")),
        segment(2000, 2500, "B", Some("a much longer sentence")),
        segment(2600, 3400, "A", Some("ok")),
        segment(4000, 4600, "B", None),
    ]
}

fn collaborators(segments: Vec<RawSegment>, translator: FakeTranslator) -> Collaborators {
    Collaborators {
        media: Arc::new(FakeMedia),
        transcriber: Arc::new(FakeTranscriber { segments }),
        translator: Arc::new(translator),
        synthesizer: Arc::new(FakeSynthesizer),
    }
}

fn config(temp: &TempDir) -> Config {
    let mut config = Config::default();
    config.media.sample_rate = SR;
    config.pipeline.workers = 2;
    config.snapshot.enabled = true;
    config.snapshot.directory = temp.path().join("snapshots");
    config
}

fn input(temp: &TempDir) -> PathBuf {
    let input = temp.child("in.mp4");
    input.write_str("not really a video").unwrap();
    input.path().to_path_buf()
}

fn request(output: PathBuf) -> DubRequest {
    DubRequest {
        output,
        source_language: None,
        target_language: "es".to_string(),
    }
}

fn has_flag(report: &[FlagEntry], id: u32, predicate: impl Fn(&UtteranceFlag) -> bool) -> bool {
    report
        .iter()
        .filter(|e| e.utterance_id == id)
        .any(|e| e.flags.iter().any(&predicate))
}

#[tokio::test]
async fn test_end_to_end_dub_writes_output_report_and_snapshots() {
    let temp = TempDir::new().unwrap();
    let input = input(&temp);
    let output = temp.path().join("out.wav");
    let ctx = RunContext::with_run_id(&input, "e2e");

    let mut config = config(&temp);
    config.pipeline.original_subtitles = true;
    config.pipeline.dubbed_subtitles = true;
    let dubber = Dubber::new(config, collaborators(speech(), FakeTranslator::default()));
    let outcome = dubber.run(&ctx, &request(output.clone())).await.unwrap();

    assert_eq!(outcome.source_language, "en");
    assert_eq!(
        outcome.subtitles,
        vec![temp.path().join("out.wav.en.srt"), temp.path().join("out.wav.es.srt")]
    );
    for path in &outcome.subtitles {
        assert!(path.is_file(), "missing {}", path.display());
    }
    assert!(!temp.path().join(".out.partial.wav.flags.json").exists());
    assert_eq!(outcome.utterances, 4);
    assert_eq!(outcome.placed_clips, 4);

    let master = read_wav(&output).unwrap();
    assert_eq!(master.frames() as u64, ms_to_frames(DURATION_MS, SR));
    assert!(!temp.path().join(".out.partial.wav").exists());

    let report: Vec<FlagEntry> =
        serde_json::from_str(&std::fs::read_to_string(&outcome.flags_path).unwrap()).unwrap();
    assert_eq!(report, outcome.flags);
    assert!(has_flag(&report, 1, |f| matches!(f, UtteranceFlag::Resynthesized { .. })));
    assert!(has_flag(&report, 1, |f| matches!(f, UtteranceFlag::Overflow { .. })));
    assert!(has_flag(&report, 1, |f| *f == UtteranceFlag::Collision { with: 2 }));
    assert!(has_flag(&report, 2, |f| matches!(f, UtteranceFlag::Shifted { .. })));
    assert!(has_flag(&report, 3, |f| *f == UtteranceFlag::TranscriptionRetried));
    assert!(!report.iter().any(|e| e.utterance_id == 0));

    let run_dir = outcome.snapshot_dir.unwrap();
    for stage in Stage::ALL {
        assert!(run_dir.join(stage.file_name()).is_file(), "missing {}", stage.name());
    }
    assert!(run_dir.join("manifest.json").is_file());
}

#[tokio::test]
async fn test_no_speech_yields_silent_track_of_source_length() {
    let temp = TempDir::new().unwrap();
    let input = input(&temp);
    let output = temp.path().join("silent.wav");
    let ctx = RunContext::with_run_id(&input, "quiet");

    let dubber = Dubber::new(config(&temp), collaborators(Vec::new(), FakeTranslator::default()));
    let outcome = dubber.run(&ctx, &request(output.clone())).await.unwrap();

    assert_eq!(outcome.utterances, 0);
    assert!(outcome.flags.is_empty());

    let master = read_wav(&output).unwrap();
    assert_eq!(master.frames() as u64, ms_to_frames(DURATION_MS, SR));
    assert_eq!(master.peak(), 0.0);

    let segmentation: Value = serde_json::from_str(
        &std::fs::read_to_string(outcome.snapshot_dir.unwrap().join(Stage::Segmentation.file_name())).unwrap(),
    )
    .unwrap();
    assert_eq!(segmentation["items"], Value::Array(Vec::new()));
}

#[tokio::test]
async fn test_identical_runs_produce_identical_snapshots() {
    let temp = TempDir::new().unwrap();
    let input = input(&temp);
    let mut config = config(&temp);
    config.pipeline.voice_cloning = true;

    for run_id in ["first", "second"] {
        let ctx = RunContext::with_run_id(&input, run_id);
        let dubber = Dubber::new(config.clone(), collaborators(speech(), FakeTranslator::default()));
        dubber
            .run(&ctx, &request(temp.path().join(format!("{}.wav", run_id))))
            .await
            .unwrap();
    }

    let snapshots = temp.path().join("snapshots");
    let differences = diff_runs(snapshots.join("first"), snapshots.join("second")).unwrap();
    assert!(differences.is_empty(), "{:?}", differences);

    for stage in Stage::ALL {
        let a = std::fs::read(snapshots.join("first").join(stage.file_name())).unwrap();
        let b = std::fs::read(snapshots.join("second").join(stage.file_name())).unwrap();
        assert_eq!(a, b, "{} differs", stage.name());
    }
}

#[tokio::test]
async fn test_cancelled_run_leaves_no_output() {
    let temp = TempDir::new().unwrap();
    let input = input(&temp);
    let output = temp.path().join("cancelled.wav");
    let ctx = RunContext::with_run_id(&input, "stopped");

    let translator = FakeTranslator {
        cancel_on_call: Some(ctx.cancellation_token()),
    };
    let dubber = Dubber::new(config(&temp), collaborators(speech(), translator));
    let result = dubber.run(&ctx, &request(output.clone())).await;

    assert!(matches!(result, Err(RedubError::Cancelled)));
    assert!(!output.exists());
    assert!(!temp.path().join(".cancelled.partial.wav").exists());
    assert!(!temp.path().join("snapshots").join("stopped").exists());
}

#[tokio::test]
async fn test_failed_report_publish_leaves_no_output() {
    let temp = TempDir::new().unwrap();
    let input = input(&temp);
    let output = temp.path().join("blocked.wav");
    // a directory where the flag report belongs cannot be replaced by a file
    temp.child("blocked.wav.flags.json").create_dir_all().unwrap();
    let ctx = RunContext::with_run_id(&input, "blocked");

    let mut config = config(&temp);
    config.pipeline.dubbed_subtitles = true;
    let dubber = Dubber::new(config, collaborators(speech(), FakeTranslator::default()));
    let result = dubber.run(&ctx, &request(output.clone())).await;

    assert!(result.is_err());
    assert!(!output.exists());
    assert!(!temp.path().join("blocked.wav.es.srt").exists());
    let leftovers: Vec<_> = std::fs::read_dir(temp.path())
        .unwrap()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_name().to_string_lossy().contains(".partial"))
        .collect();
    assert!(leftovers.is_empty(), "{:?}", leftovers);
}

#[tokio::test]
async fn test_input_errors_are_fatal_before_the_pipeline() {
    let temp = TempDir::new().unwrap();
    let input = input(&temp);
    let dubber = Dubber::new(config(&temp), collaborators(speech(), FakeTranslator::default()));

    let missing = RunContext::with_run_id(temp.path().join("missing.mp4"), "missing");
    let err = dubber
        .run(&missing, &request(temp.path().join("a.wav")))
        .await
        .unwrap_err();
    assert_eq!(err.exit_code(), 100);

    let ctx = RunContext::with_run_id(&input, "lang");
    let mut french = request(temp.path().join("b.wav"));
    french.target_language = "fr".to_string();
    let err = dubber.run(&ctx, &french).await.unwrap_err();
    assert!(matches!(err, RedubError::UnsupportedLanguage { ref stage, .. } if stage == "synthesis"));

    let mut german_source = request(temp.path().join("c.wav"));
    german_source.source_language = Some("de".to_string());
    let err = dubber.run(&ctx, &german_source).await.unwrap_err();
    assert_eq!(err.exit_code(), 102);

    assert!(!temp.path().join("snapshots").join("lang").exists());
}
