use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::config::Config;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Configuration file path
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Dub the speech of a media file into another language
    Dub {
        /// Input video or audio file
        #[arg(short, long)]
        input: PathBuf,

        /// Output media file
        #[arg(short, long)]
        output: PathBuf,

        /// Source language (detected when omitted)
        #[arg(short, long)]
        source_lang: Option<String>,

        /// Target language
        #[arg(short, long)]
        target_lang: String,

        /// Derive voices from each speaker's own audio
        #[arg(long)]
        voice_cloning: bool,

        /// Fraction a clip may exceed its window before it is adjusted
        #[arg(long)]
        slack: Option<f64>,

        /// Ceiling for pitch-preserving time compression
        #[arg(long)]
        max_compression: Option<f64>,

        /// Worker pool size for per-utterance stages
        #[arg(short, long)]
        workers: Option<usize>,

        /// Root directory for stage snapshots
        #[arg(long)]
        snapshot_dir: Option<PathBuf>,

        /// Identifier of this run (random when omitted)
        #[arg(long)]
        run_id: Option<String>,

        /// Keep the working directory after the run
        #[arg(long)]
        keep_intermediate: bool,

        /// Write subtitles with the source and dubbed text next to the output
        #[arg(long)]
        subtitles: bool,
    },

    /// Compare the stage snapshots of two runs
    Diff {
        /// Snapshot directory of the first run
        left: PathBuf,

        /// Snapshot directory of the second run
        right: PathBuf,
    },

    /// List the languages each configured backend accepts
    Languages,

    /// Write the default configuration file
    InitConfig {
        /// Destination of the configuration file
        #[arg(short, long, default_value = "redub.toml")]
        output: PathBuf,
    },
}

/// Values from the `dub` flags that take precedence over the configuration file.
#[derive(Debug, Clone, Default)]
pub struct DubOverrides {
    pub voice_cloning: bool,
    pub slack: Option<f64>,
    pub max_compression: Option<f64>,
    pub workers: Option<usize>,
    pub snapshot_dir: Option<PathBuf>,
    pub keep_intermediate: bool,
    pub subtitles: bool,
}

impl DubOverrides {
    pub fn apply(&self, config: &mut Config) {
        if self.voice_cloning {
            config.pipeline.voice_cloning = true;
        }
        if let Some(slack) = self.slack {
            config.reconcile.slack = slack;
        }
        if let Some(max_compression) = self.max_compression {
            config.reconcile.max_compression = max_compression;
        }
        if let Some(workers) = self.workers {
            config.pipeline.workers = workers;
        }
        if let Some(dir) = &self.snapshot_dir {
            config.snapshot.enabled = true;
            config.snapshot.directory = dir.clone();
        }
        if self.keep_intermediate {
            config.pipeline.clean_intermediate_files = false;
        }
        if self.subtitles {
            config.pipeline.original_subtitles = true;
            config.pipeline.dubbed_subtitles = true;
        }
    }
}
