//! 学習用CLI
//!
//! `train [DATA_DIR] [MODEL_OUTPUT_PATH] [オプション]`

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use safety_detector::ml::{train_model, TrainingReport};
use safety_detector::model::{AppConfig, Architecture, DeviceType};

#[derive(Parser, Debug)]
#[command(name = "train", about = "Train the hard hat classifier from a folder of images")]
struct Args {
    /// 学習データのルート（直下のフォルダ名がクラス名）
    data_dir: Option<PathBuf>,

    /// 学習済みモデルの出力先
    model_output_path: Option<PathBuf>,

    /// 設定ファイル
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long)]
    epochs: Option<usize>,

    #[arg(long)]
    batch_size: Option<usize>,

    #[arg(long)]
    learning_rate: Option<f64>,

    #[arg(long)]
    split_fraction: Option<f64>,

    #[arg(long)]
    seed: Option<u64>,

    /// resnet18 / resnet34 / conv-small / conv-medium
    #[arg(long)]
    architecture: Option<Architecture>,

    #[arg(long)]
    image_size: Option<usize>,

    /// 事前学習済みバックボーンの重み（.pth / .safetensors / .mpk）
    #[arg(long)]
    backbone_weights: Option<PathBuf>,

    /// wgpu / cpu
    #[arg(long)]
    device: Option<DeviceType>,
}

impl Args {
    /// 設定ファイルの値をコマンドライン引数で上書き
    fn apply(self, mut config: AppConfig) -> AppConfig {
        let t = &mut config.training;
        if let Some(v) = self.data_dir {
            t.data_dir = v;
        }
        if let Some(v) = self.model_output_path {
            t.model_output_path = v;
        }
        if let Some(v) = self.epochs {
            t.epochs = v;
        }
        if let Some(v) = self.batch_size {
            t.batch_size = v;
        }
        if let Some(v) = self.learning_rate {
            t.learning_rate = v;
        }
        if let Some(v) = self.split_fraction {
            t.split_fraction = v;
        }
        if let Some(v) = self.seed {
            t.seed = v;
        }
        if let Some(v) = self.architecture {
            t.architecture = v;
        }
        if let Some(v) = self.image_size {
            t.image_size = v;
        }
        if self.backbone_weights.is_some() {
            t.backbone_weights = self.backbone_weights;
        }
        if let Some(v) = self.device {
            config.device_type = v;
        }
        config
    }
}

fn print_report(report: &TrainingReport) {
    println!("\n=== Dataset ===");
    for (label, count) in &report.class_counts {
        println!("  {:<16} {} images", label, count);
    }
    println!("  Train / validation: {} / {}", report.num_train, report.num_valid);

    println!("\n=== Evaluation ===");
    match &report.metrics {
        Ok(metrics) => {
            println!("  Micro accuracy: {:.4}", metrics.micro_accuracy);
            println!("  Macro accuracy: {:.4}", metrics.macro_accuracy);
            println!("  Log-loss:       {:.4}", metrics.log_loss);
            for (label, loss) in report.labels.iter().zip(&metrics.per_class_log_loss) {
                match loss {
                    Some(loss) => println!("  Log-loss ({}): {:.4}", label, loss),
                    None => println!("  Log-loss ({}): n/a", label),
                }
            }
            println!("\nConfusion matrix (rows = actual, columns = predicted):");
            println!("{}", metrics.format_confusion_matrix(&report.labels));
        }
        Err(e) => println!("  Metrics unavailable: {}", e),
    }

    println!("\n=== Model ===");
    println!("  Saved to: {}", report.artifact_path.display());
    println!("  Size:     {:.2} KB", report.artifact_size as f64 / 1024.0);
}

fn main() -> ExitCode {
    safety_detector::init_tracing("info");
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => match AppConfig::load(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Error: failed to read config {}: {:#}", path.display(), e);
                return ExitCode::FAILURE;
            }
        },
        None => AppConfig::load_or_default(),
    };
    let config = args.apply(config);

    println!("=== Hard Hat Detector Training ===\n");
    config.display();

    let result = train_model(&config, |stats| {
        let valid = match (stats.valid_loss, stats.valid_accuracy) {
            (Some(loss), Some(acc)) => format!(", valid_loss={:.4}, valid_acc={:.4}", loss, acc),
            _ => String::new(),
        };
        println!(
            "Epoch {:>3}: train_loss={:.4}, train_acc={:.4}{}",
            stats.epoch, stats.train_loss, stats.train_accuracy, valid
        );
    });

    match result {
        Ok(report) => {
            print_report(&report);
            println!("\nTraining completed.");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("\nError: {:#}", e);
            ExitCode::FAILURE
        }
    }
}
