//! redub - Automated Speech Re-dubbing Workflow
//!
//! Re-dubs the spoken audio of a media file into another language while
//! keeping speaker timing and identity, using an external transcriber,
//! an LLM translator, a speech synthesizer and ffmpeg.

pub mod audio;
pub mod cli;
pub mod config;
pub mod error;
pub mod language;
pub mod media;
pub mod pool;
pub mod reconcile;
pub mod run;
pub mod snapshot;
pub mod subtitle;
pub mod synthesize;
pub mod timeline;
pub mod transcribe;
pub mod translate;
pub mod utterance;
pub mod voice;
pub mod workflow;
