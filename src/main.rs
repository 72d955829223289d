//! 手書き数字分類ラボ CLI
//!
//! 学習・推論・学習履歴の表示をサブコマンドとして提供します。

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use digit_lab_lib::commands;
use digit_lab_lib::model::AppConfig;
use digit_lab_lib::prediction::{format_prediction_table, InputImage};
use digit_lab_lib::training::{TrainingRequest, TrainingState};
use digit_lab_lib::{Architecture, LabContext};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// MNIST digit classifier lab
#[derive(Parser)]
#[command(name = "digit-lab")]
#[command(about = "Train MNIST digit classifiers and compare their predictions")]
#[command(version)]
struct Cli {
    /// Path to the JSON config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the run-history database (migrates older layouts)
    InitDb,

    /// Write the current (or default) settings to the config file
    InitConfig,

    /// Train one architecture and record the run
    Train {
        /// Architecture to train ("MLP", "Small CNN", "Deeper CNN")
        #[arg(short, long, default_value = "MLP")]
        architecture: Architecture,

        /// Number of training epochs (1-20)
        #[arg(short, long)]
        epochs: Option<usize>,

        /// Batch size for training (16-128)
        #[arg(short, long)]
        batch_size: Option<usize>,
    },

    /// Classify an image with the best model of every architecture
    Predict {
        /// Path to the image file
        image: PathBuf,

        /// Treat the image as a drawing canvas (dark strokes on white)
        #[arg(long)]
        canvas: bool,

        /// Only use the best model of this architecture
        #[arg(short, long)]
        model: Option<Architecture>,

        /// Write the 28x28 model input to this PNG file
        #[arg(long)]
        preview: Option<PathBuf>,

        /// Print the result as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show recorded runs and per-epoch accuracy
    History {
        /// Also write the history as CSV files into this directory
        #[arg(long)]
        export_dir: Option<PathBuf>,
    },

    /// Compare the run history with the model files on disk
    Check,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // RUST_LOG が設定されていればそちらを優先
    let level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config_path = cli.config.unwrap_or_else(AppConfig::default_path);
    let config = AppConfig::load_or_default_from(&config_path);
    config.log_summary();

    if let Commands::InitConfig = cli.command {
        config
            .save(&config_path)
            .with_context(|| format!("設定ファイルを書き込めません: {}", config_path.display()))?;
        println!("設定を保存しました: {}", config_path.display());
        return Ok(());
    }

    let mut ctx = LabContext::new(config)?;

    match cli.command {
        Commands::InitDb => {
            commands::init_db(&ctx)?;
            println!("学習履歴DBを初期化しました: {}", ctx.store().db_path().display());
        }
        Commands::InitConfig => {}
        Commands::Train {
            architecture,
            epochs,
            batch_size,
        } => {
            let epochs = epochs.unwrap_or(ctx.config().training.num_epochs);
            let batch_size = batch_size.unwrap_or(ctx.config().training.batch_size);
            run_training(&mut ctx, TrainingRequest::new(architecture, epochs, batch_size))?;
        }
        Commands::Predict {
            image,
            canvas,
            model,
            preview,
            json,
        } => {
            run_prediction(&ctx, &image, canvas, model, preview.as_deref(), json)?;
        }
        Commands::History { export_dir } => {
            let view = commands::refresh_history(&ctx)?;
            if view.is_empty() {
                println!("学習履歴がありません");
            } else {
                print!("{}", view.format_table());
            }
            if let Some(dir) = export_dir {
                for path in view.export_csv(&dir)? {
                    println!("書き出しました: {}", path.display());
                }
            }
        }
        Commands::Check => {
            let issues = commands::check_integrity(&ctx)?;
            if issues.is_empty() {
                println!("学習履歴とモデルファイルは一致しています");
            } else {
                for issue in &issues {
                    println!("- {}", issue);
                }
                bail!("{} 件の不整合があります", issues.len());
            }
        }
    }

    Ok(())
}

fn run_training(ctx: &mut LabContext, request: TrainingRequest) -> Result<()> {
    let mut session = commands::start_training(ctx, request)?;

    let mut shown = String::new();
    for text in session.by_ref() {
        let fresh = unseen_suffix(&shown, &text);
        if !fresh.trim().is_empty() {
            println!("{}", fresh.trim_end());
        }
        shown = text;
    }

    if session.state() == TrainingState::Failed {
        bail!("学習に失敗しました");
    }
    info!(
        run_id = ?session.run_id(),
        artifact = ?session.artifact_path(),
        "学習セッションを終了しました"
    );
    Ok(())
}

/// 前回表示した文字列との共通部分を除いた残り
fn unseen_suffix<'a>(shown: &str, current: &'a str) -> &'a str {
    let common = shown
        .char_indices()
        .zip(current.chars())
        .find(|((_, a), b)| a != b)
        .map(|((index, _), _)| index)
        .unwrap_or_else(|| shown.len().min(current.len()));
    current.get(common..).unwrap_or(current)
}

fn run_prediction(
    ctx: &LabContext,
    image: &Path,
    canvas: bool,
    model: Option<Architecture>,
    preview: Option<&Path>,
    json: bool,
) -> Result<()> {
    let bytes = std::fs::read(image)
        .with_context(|| format!("画像を読み込めません: {}", image.display()))?;
    let input = if canvas {
        InputImage::Canvas(bytes)
    } else {
        InputImage::Upload(bytes)
    };
    let loader = commands::model_loader(ctx.config())?;

    if let Some(architecture) = model {
        let prediction = commands::predict_with_model(ctx, Some(&input), architecture, loader.as_ref())?;
        if json {
            println!("{}", serde_json::to_string_pretty(&prediction)?);
        } else {
            println!("[{}]", architecture);
            println!("{}", prediction.summary());
            for (digit, percent) in prediction.top_k(ctx.config().prediction.top_k) {
                println!("  {}: {:.2}%", digit, percent);
            }
        }
        return Ok(());
    }

    let report = commands::predict(ctx, Some(&input), loader.as_ref())?;
    if let Some(path) = preview {
        report
            .preview
            .to_gray_image()
            .save(path)
            .with_context(|| format!("プレビューを書き込めません: {}", path.display()))?;
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!(
            "入力画像: {}x{}",
            report.original_size[0], report.original_size[1]
        );
        print!(
            "{}",
            format_prediction_table(&report.rows, ctx.config().prediction.top_k)
        );
        println!("{}", report.consensus_text);
    }
    Ok(())
}
