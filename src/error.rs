use thiserror::Error;

#[derive(Error, Debug)]
pub enum RedubError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parsing error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("WAV error: {0}")]
    Wav(#[from] hound::Error),

    #[error("Transcription error: {0}")]
    Transcription(String),

    #[error("Translation error: {0}")]
    Translation(String),

    #[error("Synthesis error: {0}")]
    Synthesis(String),

    #[error("Media processing error: {0}")]
    Media(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("Language '{language}' is not supported by the {stage} backend")]
    UnsupportedLanguage { stage: String, language: String },

    #[error("Operation timed out after {0} seconds")]
    Timeout(u64),

    #[error("Run cancelled")]
    Cancelled,

    #[error("Snapshot error: {0}")]
    Snapshot(String),
}

impl RedubError {
    /// Process exit code reported by the CLI when this error aborts a run.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::FileNotFound(_) => 100,
            Self::UnsupportedFormat(_) => 101,
            Self::UnsupportedLanguage { stage, .. } => match stage.as_str() {
                "transcription" => 102,
                "translation" => 103,
                _ => 104,
            },
            Self::Config(_) | Self::Toml(_) => 105,
            Self::Media(_) => 106,
            Self::Io(_) | Self::Wav(_) => 107,
            Self::Snapshot(_) | Self::Json(_) => 108,
            Self::Cancelled => 130,
            _ => 1,
        }
    }

    /// Errors that only affect a single utterance and may be retried.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Timeout(_)
                | Self::Http(_)
                | Self::Transcription(_)
                | Self::Translation(_)
                | Self::Synthesis(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, RedubError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes_are_distinct_for_language_stages() {
        let stt = RedubError::UnsupportedLanguage {
            stage: "transcription".to_string(),
            language: "xx".to_string(),
        };
        let mt = RedubError::UnsupportedLanguage {
            stage: "translation".to_string(),
            language: "xx".to_string(),
        };
        let tts = RedubError::UnsupportedLanguage {
            stage: "synthesis".to_string(),
            language: "xx".to_string(),
        };
        assert_eq!(stt.exit_code(), 102);
        assert_eq!(mt.exit_code(), 103);
        assert_eq!(tts.exit_code(), 104);
        assert_eq!(RedubError::Cancelled.exit_code(), 130);
    }

    #[test]
    fn test_transient_classification() {
        assert!(RedubError::Timeout(5).is_transient());
        assert!(RedubError::Synthesis("boom".into()).is_transient());
        assert!(!RedubError::Cancelled.is_transient());
        assert!(!RedubError::Media("mux".into()).is_transient());
    }
}
