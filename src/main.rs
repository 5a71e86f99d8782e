// src/main.rs
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::{error, info, warn};
use tokio_util::sync::CancellationToken;

use technique_coach::coach::{
    AnalysisContext, AnalysisRequest, AudioState, AudioTask, Pipeline, PipelineSettings,
    StructuredReport,
};
use technique_coach::config::Config;
use technique_coach::progress::{LogProgress, ProgressTracker};
use technique_coach::services::{build_synthesizer, ServiceManager, VoiceCatalog};
use technique_coach::storage::{self, AnalysisRecord, MediaAsset};
use technique_coach::FingerprintCache;

#[derive(Parser)]
#[command(name = "technique-coach")]
#[command(about = "AI coaching analysis for sports technique videos")]
struct Cli {
    /// Configuration file (defaults to ./config.toml, then the user config dir)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Analyze one or more videos or images
    Analyze {
        /// Media file; repeat for several
        #[arg(short, long, required = true)]
        file: Vec<PathBuf>,
        /// Question for the coach
        #[arg(short, long)]
        query: Option<String>,
        #[arg(long)]
        focus: Option<String>,
        #[arg(long)]
        age: Option<u32>,
        #[arg(long)]
        level: Option<String>,
        /// Skip the structured metrics stage
        #[arg(long)]
        no_extract: bool,
        /// Also produce spoken feedback with this voice (name or id)
        #[arg(long)]
        voice: Option<String>,
        /// Where to write the audio (defaults to the results directory)
        #[arg(long)]
        audio_out: Option<PathBuf>,
        /// Save the run to the results directory
        #[arg(long)]
        save: bool,
    },
    /// List available voices
    Voices,
    /// List saved analyses
    History,
    /// Show a saved analysis
    Show {
        #[arg(short, long)]
        id: String,
    },
    /// Print the effective configuration, or write it to a file
    Config {
        #[arg(short, long)]
        write: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(config.logging.level.as_str()),
    )
    .init();

    match cli.command {
        Commands::Analyze {
            file,
            query,
            focus,
            age,
            level,
            no_extract,
            voice,
            audio_out,
            save,
        } => {
            let context = AnalysisContext { focus, age, level };
            let options = AnalyzeOptions {
                no_extract,
                voice,
                audio_out,
                save,
            };
            analyze(&config, file, query.unwrap_or_default(), context, options).await?;
        }
        Commands::Voices => {
            let catalog = VoiceCatalog::new(
                build_synthesizer(&config.voice)?,
                config.voice.default_voice_id.clone(),
            );
            for voice in catalog.voices().await {
                println!("{:<28} {}", voice.name, voice.voice_id);
            }
        }
        Commands::History => {
            let records = storage::list_records(&config.storage.results_directory).await?;
            if records.is_empty() {
                println!("No saved analyses in {}", config.storage.results_directory.display());
            }
            for record in records {
                println!(
                    "{}  {}  {}  {}",
                    record.id,
                    record.timestamp.format("%Y-%m-%d %H:%M"),
                    record.media.join(", "),
                    if record.query.is_empty() { "-" } else { record.query.as_str() }
                );
            }
        }
        Commands::Show { id } => {
            match storage::get_record(&config.storage.results_directory, &id).await? {
                Some(record) => {
                    println!("{}", record.report.markdown);
                    if let Some(structured) = &record.structured {
                        print_structured(structured);
                    }
                }
                None => warn!("Analysis with ID {} not found.", id),
            }
        }
        Commands::Config { write } => match write {
            Some(path) => {
                config.save_to_file(&path)?;
                info!("Configuration written to {}", path.display());
            }
            None => {
                let mut shown = config.clone();
                mask(&mut shown.gemini.api_key);
                mask(&mut shown.voice.api_key);
                print!("{}", toml::to_string_pretty(&shown)?);
            }
        },
    }

    Ok(())
}

struct AnalyzeOptions {
    no_extract: bool,
    voice: Option<String>,
    audio_out: Option<PathBuf>,
    save: bool,
}

async fn analyze(
    config: &Config,
    files: Vec<PathBuf>,
    query: String,
    context: AnalysisContext,
    options: AnalyzeOptions,
) -> Result<()> {
    config.require_gemini_key()?;

    let services = ServiceManager::from_config(config)?;
    let mut settings = PipelineSettings::from_config(config)?;
    if options.no_extract {
        settings.extract_structured = false;
    }
    let retry = settings.retry.clone();
    let pipeline = Pipeline::new(
        services.media(),
        services.generation(),
        Arc::new(FingerprintCache::new()),
        settings,
    );

    let mut assets = Vec::with_capacity(files.len());
    for path in &files {
        let asset = MediaAsset::load(path, config.storage.max_file_size_bytes()).await?;
        info!("Loaded {} ({}, {:.1}MB)", asset.file_name, asset.mime_type, asset.size_mb());
        assets.push(asset);
    }
    let request = AnalysisRequest::new(assets, query, context);

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        let forced = handle_interrupts(tokio::signal::ctrl_c, &on_interrupt).await;
        if forced {
            std::process::exit(130);
        }
    });

    let progress = ProgressTracker::new(Arc::new(LogProgress));
    let outcome = match pipeline.run(&request, &progress, &cancel).await {
        Ok(outcome) => outcome,
        Err(e) => {
            error!("Analysis failed: {}", e);
            return Err(anyhow::anyhow!(e.user_message()));
        }
    };

    for skipped in &outcome.skipped {
        warn!("{} was not analyzed: {}", skipped.file_name, skipped.reason);
    }

    println!("{}", outcome.report.markdown);
    match &outcome.structured {
        Some(structured) => print_structured(structured),
        None if config.pipeline.extract_structured && !options.no_extract => {
            warn!("Structured metrics unavailable, showing the text report only");
        }
        None => {}
    }

    if let Some(voice) = &options.voice {
        if !config.is_voice_configured() {
            warn!("Voice output requested but no voice provider is configured");
        } else {
            let catalog = VoiceCatalog::new(services.voice(), config.voice.default_voice_id.clone());
            let voice_id = catalog.resolve(voice).await;
            let task = AudioTask::spawn(
                services.voice(),
                services.generation(),
                retry,
                outcome.report.markdown.clone(),
                voice_id,
                cancel.clone(),
            );

            match task.wait().await {
                AudioState::Completed(audio) => {
                    let path = match &options.audio_out {
                        Some(path) => path.clone(),
                        None => {
                            tokio::fs::create_dir_all(&config.storage.results_directory).await?;
                            config
                                .storage
                                .results_directory
                                .join(format!("{}.mp3", outcome.fingerprint.short()))
                        }
                    };
                    tokio::fs::write(&path, audio)
                        .await
                        .with_context(|| format!("Failed to write {}", path.display()))?;
                    println!("\nAudio feedback saved to {}", path.display());
                }
                AudioState::Failed(reason) => warn!("Audio feedback unavailable: {}", reason),
                AudioState::Running => {}
            }
        }
    }

    if options.save {
        let record = AnalysisRecord::new(
            outcome.fingerprint.to_string(),
            request.query.clone(),
            request.context.clone(),
            request.assets.iter().map(|a| a.file_name.clone()).collect(),
            outcome.report.clone(),
            outcome.structured.clone(),
            outcome.elapsed.as_secs_f64(),
        );
        let path = storage::save_record(&config.storage.results_directory, &record).await?;
        println!("\nSaved analysis {} to {}", record.id, path.display());
    }

    Ok(())
}

/// First interrupt cancels cooperatively. Returns `true` on a second one,
/// when the caller should exit without waiting for in-flight calls.
async fn handle_interrupts<F, Fut>(mut interrupt: F, cancel: &CancellationToken) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = std::io::Result<()>>,
{
    if interrupt().await.is_err() {
        return false;
    }
    warn!("Interrupted, cancelling analysis (press Ctrl-C again to exit now)...");
    cancel.cancel();

    if interrupt().await.is_err() {
        return false;
    }
    error!("Interrupted again, exiting");
    true
}

fn mask(secret: &mut String) {
    if !secret.is_empty() {
        *secret = "********".to_string();
    }
}

fn print_structured(report: &StructuredReport) {
    println!("\n---\n");
    if !report.summary.is_empty() {
        println!("Summary: {}\n", report.summary);
    }

    for group in &report.groups {
        let (labels, values) = group.normalized();
        let note = if group.estimated { " (estimated)" } else { "" };
        println!("{}{}", group.title, note);
        for (label, value) in labels.iter().zip(values) {
            let bar = "#".repeat((value / 5.0).round() as usize);
            println!("  {:<18} {:>5.1} {}", label, value, bar);
        }
        println!();
    }

    if !report.predictions.is_empty() {
        println!("Risks and development:");
        for item in &report.predictions {
            println!("  - {}", item);
        }
    }
    if !report.roadmap.is_empty() {
        println!("Roadmap:");
        for item in &report.roadmap {
            println!("  - {}", item);
        }
    }
}
