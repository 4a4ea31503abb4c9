use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand};

use herbvision::config::{self, AppConfig};
use herbvision::description::{resolve_subject, Provenance};
use herbvision::feature_store::FeatureStore;
use herbvision::gemini::GeminiClient;
use herbvision::logging::{init_logging, LogSink};

#[derive(Parser)]
#[command(name = "herbvision", version)]
#[command(about = "Find a named medicinal plant through the camera — local gate + Gemini verification")]
struct Cli {
    /// Raise log verbosity (-v debug, -vv trace)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Resolve a plant name to its category and visual features
    Describe {
        name: String,
    },

    /// Describe the plant, then scan the camera for it until Ctrl-C
    Scan {
        name: String,
        #[arg(long)] camera: Option<i32>,
        #[arg(long)] no_speech: bool,
        #[arg(long)] no_tone: bool,
    },

    /// Inspect or clear the feature cache
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },

    /// Print where log files are written
    Logs,
}

#[derive(Subcommand)]
enum CacheAction {
    /// List cached plant names
    List,
    /// Forget one plant
    Remove { name: String },
    /// Forget every plant
    Clear,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let sink = init_logging(cli.verbose);
    if let LogSink::ConsoleOnly(reason) = sink {
        eprintln!("Log files disabled ({}); logging to the console only.", reason);
    }

    if let Command::Logs = cli.command {
        match sink {
            LogSink::File(dir) => println!("{}", dir.display()),
            LogSink::ConsoleOnly(_) => println!("(console only)"),
        }
        return Ok(());
    }

    let mut cfg = config::load_config().context("loading configuration")?;

    match cli.command {
        Command::Describe { name } => {
            let store = open_store(&cfg)?;
            let client = GeminiClient::from_config(&cfg.gemini)?;
            let (subject, provenance) = resolve_subject(&store, &client, name.trim()).await?;
            let source = match provenance {
                Provenance::Cache => "cache",
                Provenance::Remote => "Gemini",
            };
            println!("【{}】 类别：{}  (from {})", subject.name, subject.category, source);
            println!("视觉特征：\n{}", subject.features);
        }

        Command::Scan { name, camera, no_speech, no_tone } => {
            if let Some(index) = camera {
                cfg.camera.environment_index = index;
            }
            if no_speech {
                cfg.feedback.speech_enabled = false;
            }
            if no_tone {
                cfg.feedback.tone_enabled = false;
            }
            if let LogSink::File(dir) = sink {
                eprintln!("Logs: {}", dir.display());
            }
            scan::run(cfg, &name).await?;
        }

        Command::Cache { action } => {
            let store = open_store(&cfg)?;
            match action {
                CacheAction::List => {
                    let entries = store.list()?;
                    if entries.is_empty() {
                        println!("Feature cache is empty.");
                    }
                    for e in entries {
                        let category = e.category.map(|c| c.label()).unwrap_or("?");
                        println!(
                            "{:<16} {:<4} {}",
                            e.name,
                            category,
                            e.stored_at.format("%Y-%m-%d %H:%M")
                        );
                    }
                }
                CacheAction::Remove { name } => {
                    if store.remove(&name)? {
                        println!("Removed '{}'.", name);
                    } else {
                        println!("'{}' was not cached.", name);
                    }
                }
                CacheAction::Clear => {
                    let n = store.clear()?;
                    println!("Removed {} cached entr{}.", n, if n == 1 { "y" } else { "ies" });
                }
            }
        }

        Command::Logs => {}
    }

    Ok(())
}

fn open_store(cfg: &AppConfig) -> Result<FeatureStore> {
    let store = FeatureStore::open(&cfg.store.path, &cfg.store.namespace)
        .with_context(|| format!("opening feature store '{}'", cfg.store.path))?;
    Ok(store)
}

#[cfg(feature = "vision")]
mod scan {
    use super::*;
    use std::sync::Arc;
    use tracing::{info, warn};

    use herbvision::camera::OpenCvCameraProvider;
    use herbvision::detection_loop::LoopSettings;
    use herbvision::detector::Detector;
    use herbvision::error::ModelLoadError;
    use herbvision::feedback::{FeedbackRenderer, Silent, Speaker, StatusLine, ToneSink};
    use herbvision::overlay::OpenCvWindow;
    use herbvision::session::{SessionController, SessionParts};
    use herbvision::tone::WavTonePlayer;
    use herbvision::tts::EspeakSpeaker;

    pub async fn run(cfg: AppConfig, name: &str) -> Result<()> {
        let client = Arc::new(GeminiClient::from_config(&cfg.gemini)?);

        let detector = Detector::new(
            &cfg.detector.model_path,
            cfg.detector.input_size,
            cfg.detector.score_floor,
        )
        .map_err(|e| {
            eprintln!("{}", ModelLoadError::USER_MESSAGE);
            e
        })?;

        let tone: Box<dyn ToneSink> = if cfg.feedback.tone_enabled {
            Box::new(WavTonePlayer::new(cfg.feedback.tone_volume))
        } else {
            Box::new(Silent)
        };
        let speaker: Box<dyn Speaker> = match EspeakSpeaker::detect() {
            Some(s) if cfg.feedback.speech_enabled => Box::new(s),
            _ => Box::new(Silent),
        };

        let status = StatusLine::new("");
        let mut feedback = FeedbackRenderer::new(
            &cfg.feedback,
            tone,
            speaker,
            Box::new(OpenCvWindow::new("HerbVision")),
            status.clone(),
        );
        if let (Some(w), Some(h)) = (cfg.camera.display_width, cfg.camera.display_height) {
            feedback = feedback.with_display_size(w, h);
        }

        let mut session = SessionController::new(SessionParts {
            store: open_store(&cfg)?,
            description: client.clone(),
            vision: client,
            camera: Box::new(OpenCvCameraProvider {
                environment_index: cfg.camera.environment_index,
                fallback_index: cfg.camera.fallback_index,
            }),
            gate: Box::new(detector),
            feedback,
            status: status.clone(),
            settings: LoopSettings::from(&cfg.detection),
        });

        let mut updates = status.subscribe();
        tokio::spawn(async move {
            while updates.changed().await.is_ok() {
                let line = updates.borrow_and_update().clone();
                println!("» {}", line);
            }
        });

        session.submit_name(name).await?;
        if let Some(subject) = session.subject() {
            println!("类别：{}\n视觉特征：\n{}", subject.category, subject.features);
        }
        session.start_streaming()?;

        info!("Scanning for '{}'; press Ctrl-C to stop", name);
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Ctrl-C handler failed: {}", e);
        }
        session.stop().await;
        if let Some(message) = session.error_message() {
            eprintln!("{}", message);
        }
        Ok(())
    }
}

#[cfg(not(feature = "vision"))]
mod scan {
    use super::*;

    pub async fn run(_cfg: AppConfig, _name: &str) -> Result<()> {
        anyhow::bail!("`scan` needs camera and detector support; rebuild with `--features vision`")
    }
}
