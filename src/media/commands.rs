use std::path::Path;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

use crate::error::{Result, RedubError};

/// Abstract external command representation
#[derive(Debug, Clone)]
pub struct MediaCommand {
    pub binary_path: String,
    pub args: Vec<String>,
    pub description: String,
    pub timeout: Option<Duration>,
}

impl MediaCommand {
    /// Create a new command
    pub fn new<S1: Into<String>, S2: Into<String>>(binary_path: S1, description: S2) -> Self {
        Self {
            binary_path: binary_path.into(),
            args: Vec::new(),
            description: description.into(),
            timeout: None,
        }
    }

    /// Add an argument
    pub fn arg<S: Into<String>>(mut self, arg: S) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Add multiple arguments
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(|s| s.into()));
        self
    }

    /// Add a path argument
    pub fn path<P: AsRef<Path>>(self, path: P) -> Self {
        self.arg(path.as_ref().to_string_lossy().to_string())
    }

    /// Add input file
    pub fn input<P: AsRef<Path>>(self, path: P) -> Self {
        self.arg("-i").path(path)
    }

    /// Add output file
    pub fn output<P: AsRef<Path>>(self, path: P) -> Self {
        self.path(path)
    }

    /// Force overwrite output
    pub fn overwrite(self) -> Self {
        self.arg("-y")
    }

    /// Select a stream for the output
    pub fn map<S: Into<String>>(self, selector: S) -> Self {
        self.arg("-map").arg(selector)
    }

    /// Set video codec
    pub fn video_codec<S: Into<String>>(self, codec: S) -> Self {
        self.arg("-c:v").arg(codec)
    }

    /// Set audio codec
    pub fn audio_codec<S: Into<String>>(self, codec: S) -> Self {
        self.arg("-c:a").arg(codec)
    }

    /// Copy video stream
    pub fn copy_video(self) -> Self {
        self.video_codec("copy")
    }

    /// Disable video
    pub fn no_video(self) -> Self {
        self.arg("-vn")
    }

    /// Set audio sample rate
    pub fn audio_sample_rate(self, rate: u32) -> Self {
        self.arg("-ar").arg(rate.to_string())
    }

    /// Set audio channels
    pub fn audio_channels(self, channels: u32) -> Self {
        self.arg("-ac").arg(channels.to_string())
    }

    /// Abort the command if it runs longer than `timeout`
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Execute the command, returning its stdout
    pub async fn execute(&self) -> Result<Vec<u8>> {
        debug!("Executing command: {} {:?}", self.binary_path, self.args);
        debug!("Description: {}", self.description);

        let mut cmd = Command::new(&self.binary_path);
        cmd.args(&self.args).kill_on_drop(true);

        let output = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, cmd.output())
                .await
                .map_err(|_| RedubError::Timeout(limit.as_secs()))?,
            None => cmd.output().await,
        }
        .map_err(|e| RedubError::Media(format!("Failed to execute {}: {}", self.binary_path, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(RedubError::Media(format!("{} failed: {}", self.description, stderr.trim())));
        }

        Ok(output.stdout)
    }
}

/// Builder for the demux/mux operations the pipeline needs
pub struct MediaCommandBuilder {
    binary_path: String,
    probe_path: String,
}

impl MediaCommandBuilder {
    /// Create a new command builder
    pub fn new<S1: Into<String>, S2: Into<String>>(binary_path: S1, probe_path: S2) -> Self {
        Self {
            binary_path: binary_path.into(),
            probe_path: probe_path.into(),
        }
    }

    /// Build container probe command (JSON on stdout)
    pub fn probe<P: AsRef<Path>>(&self, input: P) -> MediaCommand {
        MediaCommand::new(&self.probe_path, "Media probe")
            .args(["-v", "error", "-print_format", "json", "-show_format", "-show_streams"])
            .path(input)
    }

    /// Build audio extraction command
    pub fn extract_audio<P: AsRef<Path>, Q: AsRef<Path>>(
        &self,
        input: P,
        audio_path: Q,
        sample_rate: u32,
    ) -> MediaCommand {
        MediaCommand::new(&self.binary_path, "Audio extraction")
            .overwrite()
            .input(input)
            .no_video()
            .audio_codec("pcm_s16le")
            .audio_sample_rate(sample_rate)
            .audio_channels(1)
            .output(audio_path)
    }

    /// Build the command replacing the input's audio stream with the dubbed track
    pub fn mux_dubbed_audio<P: AsRef<Path>, Q: AsRef<Path>, R: AsRef<Path>>(
        &self,
        input: P,
        dubbed_audio: Q,
        output: R,
        audio_codec: &str,
        additional_options: &[String],
    ) -> MediaCommand {
        MediaCommand::new(&self.binary_path, "Dubbed audio muxing")
            .overwrite()
            .input(input)
            .input(dubbed_audio)
            .map("0:v:0")
            .map("1:a:0")
            .copy_video()
            .audio_codec(audio_codec)
            .args(additional_options.iter().cloned())
            .output(output)
    }

    /// Build the command encoding an audio-only output from the dubbed track
    pub fn encode_audio<P: AsRef<Path>, Q: AsRef<Path>>(
        &self,
        dubbed_audio: P,
        output: Q,
        audio_codec: &str,
    ) -> MediaCommand {
        MediaCommand::new(&self.binary_path, "Dubbed audio encoding")
            .overwrite()
            .input(dubbed_audio)
            .no_video()
            .audio_codec(audio_codec)
            .output(output)
    }

    /// Build version check command
    pub fn version_check(&self) -> MediaCommand {
        MediaCommand::new(&self.binary_path, "Version check").arg("-version")
    }
}
