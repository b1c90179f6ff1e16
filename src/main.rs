//! plate-ocr - Short alphanumeric code recognition
//!
//! Trains a CRNN under CTC loss on labeled plate crops and reads codes from
//! single images or a live stream of captured frames.

mod app;
mod capture;
mod config;
mod dataset;
mod error;
mod recognition;
mod storage;
mod training;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use crate::app::{timed, LiveLoop, Recognizer};
use crate::capture::{DirectoryFrameSource, FrameConditioner};
use crate::config::AppConfig;
use crate::dataset::samples::SampleStore;
use crate::recognition::alphabet::BLANK;
use crate::training::Trainer;

/// plate-ocr - CRNN/CTC code recognition
#[derive(Parser, Debug)]
#[command(name = "plate-ocr")]
#[command(about = "Train and run a CRNN recognizer for short alphanumeric codes")]
struct Args {
    /// Configuration file (defaults to config.toml in the platform config directory)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Train on the labeled samples and save the weights
    Train {
        /// Override the configured number of epochs
        #[arg(long)]
        epochs: Option<usize>,
    },
    /// Recognize one or more image files
    Recognize {
        #[arg(required = true)]
        images: Vec<PathBuf>,
        /// Print the best class and its probability per timestep
        #[arg(long)]
        logits: bool,
    },
    /// Recognize frames written into the capture directory
    Live {
        /// Process the frames already present and exit
        #[arg(long)]
        once: bool,
    },
    /// List sample images that have no label yet
    Pending,
    /// Record the label of a sample image
    Label {
        /// Image filename inside the sample directory
        file: String,
        /// Text shown in the image
        text: String,
    },
    /// Write the default configuration file
    InitConfig {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging; RUST_LOG takes precedence
    let default_level = if args.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config_path = match &args.config {
        Some(path) => path.clone(),
        None => storage::get_config_dir()?.join("config.toml"),
    };

    if let Command::InitConfig { force } = args.command {
        return init_config(&config_path, force);
    }

    let config = load_or_create_config(&config_path)?;

    match args.command {
        Command::Train { epochs } => run_train(config, epochs),
        Command::Recognize { images, logits } => run_recognize(&config, &images, logits),
        Command::Live { once } => run_live(&config, once),
        Command::Pending => run_pending(&config),
        Command::Label { file, text } => run_label(&config, &file, &text),
        Command::InitConfig { .. } => Ok(()),
    }
}

/// Load configuration, or fall back to defaults when the file does not exist
fn load_or_create_config(path: &Path) -> Result<AppConfig> {
    if path.exists() {
        let config = config::load_config(path)?;
        info!("Loaded configuration from {:?}", path);
        return Ok(config);
    }
    info!("Using default configuration");
    Ok(AppConfig::default())
}

fn init_config(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        anyhow::bail!("{:?} already exists (use --force to overwrite)", path);
    }
    config::save_config(&AppConfig::default(), path)
        .with_context(|| format!("Failed to write {:?}", path))?;
    println!("Wrote default configuration to {}", path.display());
    Ok(())
}

fn run_train(mut config: AppConfig, epochs: Option<usize>) -> Result<()> {
    if let Some(epochs) = epochs {
        config.training.epochs = epochs;
    }

    let alphabet = config.alphabet()?;
    let store = SampleStore::new(
        &config.paths.label_file,
        &config.paths.sample_dir,
        config.model.input_size(),
    );
    let trainer = Trainer::new(alphabet, config.model, config.training.clone());

    let (report, manifest) = trainer.train_and_save(&store, &config.paths.weights_file)?;

    for stats in &report.epochs {
        println!(
            "  epoch {:>3}: loss {:.4}, {} batches, {} samples, {} skipped, {:.1?}",
            stats.epoch, stats.mean_loss, stats.batches, stats.samples, stats.skipped, stats.elapsed
        );
    }
    println!(
        "Trained {} epochs on {} samples ({} skipped), final loss {:.4}",
        report.epochs.len(),
        report.samples_used,
        report.samples_skipped,
        report.final_loss().unwrap_or(f32::NAN)
    );
    println!(
        "Weights: {} (sha256 {})",
        config.paths.weights_file.display(),
        manifest.sha256
    );
    Ok(())
}

fn load_recognizer(config: &AppConfig) -> Result<Recognizer> {
    let alphabet = config.alphabet()?;
    Recognizer::load(&config.paths.weights_file, alphabet, config.model)
        .context("Cannot run inference without trained weights")
}

fn run_recognize(config: &AppConfig, images: &[PathBuf], show_logits: bool) -> Result<()> {
    let recognizer = load_recognizer(config)?;
    let alphabet = config.alphabet()?;

    for path in images {
        let (recognition, elapsed) = timed(|| recognizer.recognize_path(path));
        let recognition = recognition?;
        println!("{}\t{}", path.display(), recognition.text);
        info!("Recognized {:?} in {:?}", path, elapsed);

        if show_logits {
            for (t, (class, prob)) in recognition.best_path().into_iter().enumerate() {
                let symbol = if class == BLANK as usize {
                    '-'
                } else {
                    alphabet.decode_index(class)?
                };
                println!("  t={:<3} {} {:>3} {:.3}", t, symbol, class, prob);
            }
        }
    }
    Ok(())
}

fn run_live(config: &AppConfig, once: bool) -> Result<()> {
    let recognizer = load_recognizer(config)?;
    let settings = &config.capture;
    let source = DirectoryFrameSource::from_settings(settings, once)?;
    let conditioner = FrameConditioner::new(settings.roi, settings.binarize);

    let live = LiveLoop::new(recognizer, conditioner).with_crop_dir(settings.save_crops_to.clone());
    let stats = live.run(source, |result| {
        let name = result
            .source
            .as_deref()
            .and_then(Path::file_name)
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        println!("{}\t{}\t{:?}", name, result.text, result.latency);
    })?;

    println!("Processed {} frames, dropped {}", stats.processed, stats.dropped);
    Ok(())
}

fn run_pending(config: &AppConfig) -> Result<()> {
    let labels = storage::labels::load_labels(&config.paths.label_file)?;
    let pending = storage::labels::pending_images(&config.paths.sample_dir, &labels)?;
    for name in &pending {
        println!("{}", name);
    }
    info!("{} labeled, {} pending", labels.len(), pending.len());
    Ok(())
}

fn run_label(config: &AppConfig, file: &str, text: &str) -> Result<()> {
    let alphabet = config.alphabet()?;
    if !config.paths.sample_dir.join(file).exists() {
        warn!("{} is not in {:?}", file, config.paths.sample_dir);
    }
    let label = storage::labels::append_label(&config.paths.label_file, file, text, &alphabet)?;
    println!("{},{}", file, label);
    Ok(())
}
