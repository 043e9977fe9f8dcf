use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use crate::error::{Result, RedubError};

// Default values for fields older config files may not carry
fn default_min_region_ms() -> u64 {
    400
}

fn default_reference_max_ms() -> u64 {
    30_000
}

fn default_background_gain() -> f32 {
    1.0
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub transcriber: TranscriberConfig,
    pub translate: TranslateConfig,
    pub synthesis: SynthesisConfig,
    pub reconcile: ReconcileConfig,
    pub pipeline: PipelineConfig,
    pub media: MediaConfig,
    pub snapshot: SnapshotConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TranscriberConfig {
    /// Transcription backend implementation
    pub backend: TranscriberBackend,
    /// Path to the transcription + diarization binary
    pub binary_path: String,
    /// Model passed to the binary
    pub model: String,
    /// Per-call timeout in seconds
    pub timeout_secs: u64,
    /// Milliseconds trimmed from each edge of a failed region before the retry
    pub subwindow_trim_ms: u64,
    /// Regions are never retried below this length
    #[serde(default = "default_min_region_ms")]
    pub min_region_ms: u64,
    /// Supported source languages (empty = any)
    pub languages: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum TranscriberBackend {
    /// External whisper-style CLI emitting diarized JSON
    Command,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TranslateConfig {
    /// Translation backend implementation
    pub backend: TranslatorBackend,
    /// Ollama endpoint URL
    pub endpoint: String,
    /// LLM model to use for translation
    pub model: String,
    /// Number of neighbouring utterances on each side passed as context
    pub context_window_size: usize,
    /// Per-request timeout in seconds
    pub timeout_secs: u64,
    /// Supported language pairs as "src-tgt" (empty = any)
    pub language_pairs: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum TranslatorBackend {
    Ollama,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SynthesisConfig {
    /// Speech synthesis backend implementation
    pub backend: SynthesizerBackend,
    /// Speech API endpoint for the HTTP backend
    pub endpoint: String,
    /// Environment variable holding the API key for the HTTP backend
    pub api_key_env: String,
    /// Synthesis model name
    pub model: String,
    /// Binary for the command backend (e.g. piper, espeak-ng wrapper)
    pub binary_path: String,
    /// Preset voice pool assigned round-robin to speakers
    pub voices: Vec<String>,
    /// Fixed speaker -> voice assignments that take precedence over the pool
    pub speaker_voices: BTreeMap<String, String>,
    /// Whether the backend honours a speaking-rate directive
    pub supports_rate: bool,
    /// Per-call timeout in seconds
    pub timeout_secs: u64,
    /// Supported target languages (empty = any)
    pub languages: Vec<String>,
    /// Upper bound of source audio gathered per speaker for voice cloning
    #[serde(default = "default_reference_max_ms")]
    pub reference_max_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum SynthesizerBackend {
    /// OpenAI-compatible `/v1/audio/speech` endpoint returning WAV
    Http,
    /// External command writing a WAV file
    Command,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcileConfig {
    /// Fraction a clip may exceed its window before it is adjusted
    pub slack: f64,
    /// Ceiling for pitch-preserving time compression
    pub max_compression: f64,
    /// Ceiling for the speed directive sent on re-synthesis
    pub max_speech_rate: f64,
    /// What to do with clips shorter than their window
    pub under_duration_policy: UnderDurationPolicy,
    /// Padding share of the window above which slow-down applies
    pub slowdown_threshold: f64,
    /// Lowest tempo ratio used when slowing speech down
    pub min_slowdown_ratio: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum UnderDurationPolicy {
    /// Leave the clip untouched and fill the window with silence
    Pad,
    /// Slightly slow the clip down toward the window length
    SlowDown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Worker pool size for per-utterance stages (0 = available parallelism)
    pub workers: usize,
    /// Attempts per collaborator call before the utterance is flagged
    pub max_attempts: u32,
    /// Derive voices from each speaker's source audio
    pub voice_cloning: bool,
    /// Remove the working directory after the run
    pub clean_intermediate_files: bool,
    /// Write an SRT with the source transcription next to the output
    pub original_subtitles: bool,
    /// Write an SRT with the dubbed text next to the output
    pub dubbed_subtitles: bool,
    /// Working directory for intermediate files (default: system temp)
    pub work_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaConfig {
    /// Path to ffmpeg binary
    pub binary_path: String,
    /// Path to ffprobe binary
    pub probe_path: String,
    /// Sample rate of the extracted audio and the master track
    pub sample_rate: u32,
    /// Accepted input file extensions
    pub accepted_formats: Vec<String>,
    /// Audio codec used for the dubbed stream
    pub audio_codec: String,
    /// Additional options appended to the mux command
    pub mux_options: Vec<String>,
    /// Optional background/music separation
    pub separator: Option<SeparatorConfig>,
    /// Gain applied to the background bed under the dubbed speech
    #[serde(default = "default_background_gain")]
    pub background_gain: f32,
    /// Timeout in seconds for each media command
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeparatorConfig {
    /// Path to the separation binary (demucs-compatible CLI)
    pub binary_path: String,
    /// Separation model name
    pub model: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotConfig {
    /// Record per-stage JSON snapshots
    pub enabled: bool,
    /// Root directory for snapshot runs
    pub directory: PathBuf,
}

impl Default for TranscriberConfig {
    fn default() -> Self {
        Self {
            backend: TranscriberBackend::Command,
            binary_path: "whisper-diarize".to_string(),
            model: "medium".to_string(),
            timeout_secs: 1800,
            subwindow_trim_ms: 150,
            min_region_ms: default_min_region_ms(),
            languages: Vec::new(),
        }
    }
}

impl Default for TranslateConfig {
    fn default() -> Self {
        Self {
            backend: TranslatorBackend::Ollama,
            endpoint: "http://localhost:11434".to_string(),
            model: "llama3.2:3b".to_string(),
            context_window_size: 2,
            timeout_secs: 120,
            language_pairs: Vec::new(),
        }
    }
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self {
            backend: SynthesizerBackend::Http,
            endpoint: "https://api.openai.com/v1/audio/speech".to_string(),
            api_key_env: "OPENAI_API_KEY".to_string(),
            model: "tts-1".to_string(),
            binary_path: "piper".to_string(),
            voices: vec![
                "alloy".to_string(),
                "echo".to_string(),
                "fable".to_string(),
                "onyx".to_string(),
                "nova".to_string(),
                "shimmer".to_string(),
            ],
            speaker_voices: BTreeMap::new(),
            supports_rate: true,
            timeout_secs: 120,
            languages: Vec::new(),
            reference_max_ms: default_reference_max_ms(),
        }
    }
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            slack: 0.10,
            max_compression: 1.5,
            max_speech_rate: 1.25,
            under_duration_policy: UnderDurationPolicy::Pad,
            slowdown_threshold: 0.25,
            min_slowdown_ratio: 0.9,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workers: 0,
            max_attempts: 2,
            voice_cloning: false,
            clean_intermediate_files: true,
            original_subtitles: false,
            dubbed_subtitles: false,
            work_dir: None,
        }
    }
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            binary_path: "ffmpeg".to_string(),
            probe_path: "ffprobe".to_string(),
            sample_rate: 24_000,
            accepted_formats: ["mp4", "mkv", "mov", "webm", "avi", "wav", "mp3", "flac", "m4a"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            audio_codec: "aac".to_string(),
            mux_options: Vec::new(),
            separator: None,
            background_gain: default_background_gain(),
            timeout_secs: 1800,
        }
    }
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            directory: PathBuf::from(".redub/snapshots"),
        }
    }
}

impl PipelineConfig {
    /// Effective worker pool size
    pub fn worker_count(&self) -> usize {
        if self.workers > 0 {
            return self.workers;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| RedubError::Config(format!("Failed to read config file: {}", e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| RedubError::Config(format!("Failed to parse config file: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| RedubError::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, content)
            .map_err(|e| RedubError::Config(format!("Failed to write config file: {}", e)))?;

        Ok(())
    }

    /// Reject values the reconciler and worker pool cannot operate with
    pub fn validate(&self) -> Result<()> {
        let r = &self.reconcile;
        if !(r.slack >= 0.0) {
            return Err(RedubError::Config(format!("slack must be >= 0, got {}", r.slack)));
        }
        if !(r.max_compression >= 1.0) {
            return Err(RedubError::Config(format!(
                "max_compression must be >= 1.0, got {}",
                r.max_compression
            )));
        }
        if !(r.max_speech_rate >= 1.0) {
            return Err(RedubError::Config(format!(
                "max_speech_rate must be >= 1.0, got {}",
                r.max_speech_rate
            )));
        }
        if !(r.min_slowdown_ratio > 0.0 && r.min_slowdown_ratio <= 1.0) {
            return Err(RedubError::Config(format!(
                "min_slowdown_ratio must be in (0, 1], got {}",
                r.min_slowdown_ratio
            )));
        }
        if self.pipeline.max_attempts == 0 {
            return Err(RedubError::Config("max_attempts must be at least 1".to_string()));
        }
        if self.media.sample_rate == 0 {
            return Err(RedubError::Config("sample_rate must be positive".to_string()));
        }
        Ok(())
    }
}
