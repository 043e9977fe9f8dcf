//! redub - Automated Speech Re-dubbing Workflow
//!
//! Command line entry point: parses arguments, sets up logging and the
//! configuration, then runs the requested subcommand.

use anyhow::Result;
use clap::Parser;
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn, Level};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::{non_blocking, rolling};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use redub::cli::{Args, Commands, DubOverrides};
use redub::config::Config;
use redub::error::RedubError;
use redub::language::{display_name, LANGUAGES};
use redub::run::RunContext;
use redub::snapshot::diff_runs;
use redub::synthesize::SynthesizerFactory;
use redub::transcribe::TranscriberFactory;
use redub::workflow::{Collaborators, DubRequest, Dubber};

const DEFAULT_CONFIG: &str = "redub.toml";

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let guard = match setup_logging(args.verbose) {
        Ok(guard) => Some(guard),
        Err(e) => {
            eprintln!("{:#}", e);
            None
        }
    };

    let code = match run(args).await {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            e.downcast_ref::<RedubError>().map(RedubError::exit_code).unwrap_or(1)
        }
    };

    drop(guard);
    std::process::exit(code);
}

async fn run(args: Args) -> Result<i32> {
    match args.command {
        Commands::Dub {
            input,
            output,
            source_lang,
            target_lang,
            voice_cloning,
            slack,
            max_compression,
            workers,
            snapshot_dir,
            run_id,
            keep_intermediate,
            subtitles,
        } => {
            let mut config = load_config(args.config.as_deref())?;
            DubOverrides {
                voice_cloning,
                slack,
                max_compression,
                workers,
                snapshot_dir,
                keep_intermediate,
                subtitles,
            }
            .apply(&mut config);
            config.validate()?;

            let collaborators = Collaborators::from_config(&config)?;
            let dubber = Dubber::new(config, collaborators).with_progress(std::io::stderr().is_terminal());
            dubber.check_collaborators().await?;

            let ctx = match run_id {
                Some(run_id) => RunContext::with_run_id(&input, run_id),
                None => RunContext::new(&input),
            };
            let signal_ctx = ctx.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("Interrupted, cancelling run {}", signal_ctx.run_id);
                    signal_ctx.cancel();
                }
            });

            info!("Starting run {}", ctx.run_id);
            let outcome = dubber
                .run(
                    &ctx,
                    &DubRequest {
                        output,
                        source_language: source_lang,
                        target_language: target_lang,
                    },
                )
                .await?;

            println!("Dubbed: {}", outcome.output.display());
            println!(
                "Utterances: {} ({} placed), flagged: {}",
                outcome.utterances,
                outcome.placed_clips,
                outcome.flags.len()
            );
            println!("Flag report: {}", outcome.flags_path.display());
            for path in &outcome.subtitles {
                println!("Subtitles: {}", path.display());
            }
            if let Some(dir) = &outcome.snapshot_dir {
                println!("Snapshots: {}", dir.display());
            }
            Ok(0)
        }
        Commands::Diff { left, right } => {
            let differences = diff_runs(&left, &right)?;
            if differences.is_empty() {
                println!("Runs are identical");
                return Ok(0);
            }
            for difference in &differences {
                println!("{}", difference);
            }
            Ok(1)
        }
        Commands::Languages => {
            let config = load_config(args.config.as_deref())?;
            let transcriber = TranscriberFactory::create_transcriber(config.transcriber.clone());
            let synthesizer = SynthesizerFactory::create_synthesizer(config.synthesis.clone())?;

            print_languages(&format!("Transcription ({})", transcriber.name()), &transcriber.supported_languages());
            print_languages("Translation pairs", &config.translate.language_pairs);
            print_languages(&format!("Synthesis ({})", synthesizer.name()), &synthesizer.supported_languages());

            println!("\nKnown language codes:");
            for (code, name) in LANGUAGES {
                println!("  {:<4} {}", code, name);
            }
            Ok(0)
        }
        Commands::InitConfig { output } => {
            if output.exists() {
                return Err(RedubError::Config(format!("{} already exists", output.display())).into());
            }
            Config::default().save_to_file(&output)?;
            println!("Default configuration written to {}", output.display());
            Ok(0)
        }
    }
}

/// `--config`, else `./redub.toml` when present, else defaults
fn load_config(path: Option<&Path>) -> Result<Config> {
    let config = match path {
        Some(path) => Config::from_file(path)?,
        None if Path::new(DEFAULT_CONFIG).exists() => {
            info!("Found {} in current directory, loading...", DEFAULT_CONFIG);
            Config::from_file(DEFAULT_CONFIG)?
        }
        None => Config::default(),
    };
    Ok(config)
}

fn print_languages(title: &str, languages: &[String]) {
    println!("{}:", title);
    if languages.is_empty() {
        println!("  any");
        return;
    }
    for code in languages {
        println!("  {:<6} {}", code, display_name(code));
    }
}

/// Setup logging to both console and file
fn setup_logging(verbose: bool) -> Result<WorkerGuard> {
    let log_dir: PathBuf = std::env::current_dir()?.join(".redub").join("log");
    std::fs::create_dir_all(&log_dir)?;

    // Daily rotation; the guard flushes the file writer when dropped
    let file_appender = rolling::daily(&log_dir, "redub.log");
    let (non_blocking_file, guard) = non_blocking(file_appender);

    let log_level = if verbose { Level::DEBUG } else { Level::INFO };

    let console_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    let file_layer = fmt::layer()
        .with_writer(non_blocking_file)
        .with_target(false)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_file(true)
        .with_line_number(true)
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env().add_directive(log_level.into()))
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;

    info!(
        "Logging initialized - console: {}, file: {}",
        log_level,
        log_dir.join("redub.log").display()
    );

    Ok(guard)
}
