//! 植物の葉の病害分類 CLI
//!
//! 学習・分類・モデル情報の表示・データセットの確認を行います。

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use burn::tensor::backend::{AutodiffBackend, Backend};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use plant_disease_lib::backend::{CpuBackend, CpuTrainingBackend};
use plant_disease_lib::logging::{init_logging, LogConfig, LogLevel};
use plant_disease_lib::ml::{check_dataset, train_model, InferenceEngine, TrainingRequest};
use plant_disease_lib::model::{load_metadata, print_metadata_info, AppConfig, DeviceType};
use plant_disease_lib::types::DetectionResponse;

/// Plant leaf disease classifier
#[derive(Parser, Debug)]
#[command(name = "plant_disease")]
#[command(version)]
#[command(about = "Train and run a CNN that classifies plant leaf diseases", long_about = None)]
struct Cli {
    /// Path to the JSON config file (defaults to config.json)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, conflicts_with = "quiet")]
    verbose: bool,

    /// Only log errors
    #[arg(short, long)]
    quiet: bool,

    /// Log level (trace, debug, info, warn, error); overrides --verbose/--quiet
    #[arg(long)]
    log_level: Option<LogLevel>,

    /// Use the CPU (NdArray) backend regardless of the config file
    #[arg(long)]
    cpu: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Train a model from a directory with one subdirectory per class
    Train {
        /// Training data directory
        #[arg(short, long)]
        data_dir: PathBuf,

        /// Validation data directory (defaults to a split of the training data)
        #[arg(long)]
        val_dir: Option<PathBuf>,

        /// Output artifact path (defaults to the configured model path)
        #[arg(short, long)]
        output: Option<PathBuf>,

        #[arg(short, long)]
        epochs: Option<usize>,

        #[arg(short, long)]
        batch_size: Option<usize>,

        #[arg(short, long)]
        learning_rate: Option<f64>,

        /// Disable data augmentation
        #[arg(long)]
        no_augmentation: bool,

        /// Write per-epoch metrics to this CSV file
        #[arg(long)]
        history_csv: Option<PathBuf>,
    },

    /// Classify one or more images
    Classify {
        /// Model artifact (defaults to the configured model path)
        #[arg(short, long)]
        model: Option<PathBuf>,

        /// Print the detection response as JSON
        #[arg(long)]
        json: bool,

        #[arg(required = true)]
        images: Vec<PathBuf>,
    },

    /// Show the metadata stored in a model artifact
    Info {
        #[arg(short, long)]
        model: Option<PathBuf>,
    },

    /// Check a dataset layout without training
    CheckDataset {
        #[arg(short, long)]
        data_dir: PathBuf,

        #[arg(long)]
        val_dir: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_config = LogConfig::from_flags(cli.verbose, cli.quiet, cli.log_level);
    init_logging(&log_config).map_err(anyhow::Error::msg)?;

    let config_path = cli.config.unwrap_or_else(AppConfig::default_path);
    let mut config = AppConfig::load_or_default(&config_path);
    if cli.cpu {
        config.set_device_type(DeviceType::Cpu);
    }

    match cli.command {
        Commands::Train {
            data_dir,
            val_dir,
            output,
            epochs,
            batch_size,
            learning_rate,
            no_augmentation,
            history_csv,
        } => {
            if let Some(output) = output {
                config.set_model_path(output.to_string_lossy().to_string());
            }
            if let Some(epochs) = epochs {
                config.training.num_epochs = epochs;
            }
            if let Some(batch_size) = batch_size {
                config.training.batch_size = batch_size;
            }
            if let Some(learning_rate) = learning_rate {
                config.training.learning_rate = learning_rate;
            }
            if no_augmentation {
                config.augmentation.enabled = false;
            }
            config.display();

            let request = TrainingRequest::from_config(&config, data_dir, val_dir);
            match effective_device(config.device_type) {
                DeviceType::Cpu => run_train::<CpuTrainingBackend>(&request, Default::default(), history_csv.as_deref()),
                DeviceType::Wgpu => run_train_gpu(&request, history_csv.as_deref()),
            }
        }
        Commands::Classify { model, json, images } => {
            let model_path = model.unwrap_or_else(|| PathBuf::from(&config.model.model_path));
            let max_bytes = config.inference.max_upload_bytes;
            match effective_device(config.device_type) {
                DeviceType::Cpu => run_classify::<CpuBackend>(&model_path, &images, json, max_bytes, Default::default()),
                DeviceType::Wgpu => run_classify_gpu(&model_path, &images, json, max_bytes),
            }
        }
        Commands::Info { model } => {
            let model_path = model.unwrap_or_else(|| PathBuf::from(&config.model.model_path));
            let metadata = load_metadata(&model_path)
                .with_context(|| format!("Failed to read model metadata from {}", model_path.display()))?;
            print_metadata_info(&metadata);
            Ok(())
        }
        Commands::CheckDataset { data_dir, val_dir } => {
            let report = check_dataset(&data_dir, val_dir.as_deref())
                .with_context(|| format!("Dataset check failed for {}", data_dir.display()))?;
            report.log();
            Ok(())
        }
    }
}

/// 利用できない場合はCPUにフォールバック
fn effective_device(requested: DeviceType) -> DeviceType {
    if requested == DeviceType::Wgpu && !cfg!(feature = "wgpu") {
        warn!("wgpu機能なしでビルドされているため、CPU (NdArray) を使用します");
        return DeviceType::Cpu;
    }
    requested
}

#[cfg(feature = "wgpu")]
fn run_train_gpu(request: &TrainingRequest, history_csv: Option<&Path>) -> Result<()> {
    use plant_disease_lib::backend::GpuTrainingBackend;
    run_train::<GpuTrainingBackend>(request, burn_wgpu::WgpuDevice::default(), history_csv)
}

#[cfg(not(feature = "wgpu"))]
fn run_train_gpu(request: &TrainingRequest, history_csv: Option<&Path>) -> Result<()> {
    run_train::<CpuTrainingBackend>(request, Default::default(), history_csv)
}

#[cfg(feature = "wgpu")]
fn run_classify_gpu(model_path: &Path, images: &[PathBuf], json: bool, max_bytes: usize) -> Result<()> {
    use plant_disease_lib::backend::GpuBackend;
    run_classify::<GpuBackend>(model_path, images, json, max_bytes, burn_wgpu::WgpuDevice::default())
}

#[cfg(not(feature = "wgpu"))]
fn run_classify_gpu(model_path: &Path, images: &[PathBuf], json: bool, max_bytes: usize) -> Result<()> {
    run_classify::<CpuBackend>(model_path, images, json, max_bytes, Default::default())
}

fn run_train<B: AutodiffBackend>(request: &TrainingRequest, device: B::Device, history_csv: Option<&Path>) -> Result<()> {
    info!("使用デバイス: {:?}", device);
    let report = train_model::<B>(request, &device, |_| {})
        .with_context(|| format!("Training failed for {}", request.train_dir.display()))?;

    if let Some(path) = history_csv {
        report.history.save_csv(path)?;
        info!("学習履歴を保存しました: {}", path.display());
    }
    if let Some(best) = report.history.best() {
        info!(
            "最良の検証精度: {:.2}% (エポック {})",
            best.val_accuracy * 100.0,
            best.epoch
        );
    }
    info!("学習完了: {} に保存しました", report.artifact_path.display());
    Ok(())
}

fn run_classify<B: Backend>(
    model_path: &Path,
    images: &[PathBuf],
    json: bool,
    max_bytes: usize,
    device: B::Device,
) -> Result<()> {
    let engine = InferenceEngine::<B>::new(device).with_max_upload_bytes(max_bytes);
    engine
        .initialize(model_path)
        .with_context(|| format!("Failed to load model {}", model_path.display()))?;

    for image in images {
        let prediction = match engine.classify_file(image) {
            Ok(prediction) => prediction,
            Err(e) => {
                warn!("{}: {}", image.display(), e);
                continue;
            }
        };
        if json {
            let response = DetectionResponse::from_prediction(&prediction);
            println!("{}", serde_json::to_string(&response)?);
        } else {
            println!("{}: {} ({}%)", image.display(), prediction.label, prediction.confidence);
        }
    }
    Ok(())
}
