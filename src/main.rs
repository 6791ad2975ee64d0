//! 画像アップロードページのWebサーバー

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use safety_detector::model::AppConfig;
use safety_detector::serving::{spawn_watcher, ModelRegistry};

type ServingBackend = burn_ndarray::NdArray<f32>;

#[derive(Parser, Debug)]
#[command(name = "safety_detector", about = "Serve the hard hat detector upload page")]
struct Args {
    /// 設定ファイル
    #[arg(long)]
    config: Option<PathBuf>,

    /// 読み込むモデルファイル
    #[arg(long)]
    model: Option<PathBuf>,

    /// 待ち受けアドレス
    #[arg(long)]
    bind: Option<String>,

    /// 推論エンジンのプール数
    #[arg(long)]
    pool_size: Option<usize>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    safety_detector::init_tracing("info");
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => AppConfig::load(path)
            .with_context(|| format!("failed to read config {}", path.display()))?,
        None => AppConfig::load_or_default(),
    };
    if let Some(model) = args.model {
        config.serving.model_path = model;
    }
    if let Some(bind) = args.bind {
        config.serving.bind_addr = bind;
    }
    if let Some(pool_size) = args.pool_size {
        config.serving.pool_size = pool_size;
    }
    config.validate()?;
    let serving = config.serving;

    let registry = Arc::new(tokio::task::block_in_place(|| {
        ModelRegistry::<ServingBackend>::new(
            &serving.model_path,
            serving.pool_size,
            burn_ndarray::NdArrayDevice::Cpu,
        )
    }));
    let _watcher = spawn_watcher(
        registry.clone(),
        Duration::from_millis(serving.reload_interval_ms.max(100)),
    );

    let app = safety_detector::web::router(registry, serving.max_upload_bytes)
        .context("failed to build templates")?;

    let listener = tokio::net::TcpListener::bind(&serving.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", serving.bind_addr))?;
    tracing::info!("listening on http://{}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutting down");
        })
        .await?;

    Ok(())
}
