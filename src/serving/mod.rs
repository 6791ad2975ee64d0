//! 推論サーバー側の共有状態

pub mod pool;
pub mod registry;

use std::sync::Arc;
use std::time::Duration;

use burn::tensor::backend::Backend;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::error::DetectorError;
use crate::prediction::Prediction;

pub use pool::{EnginePool, PooledEngine};
pub use registry::{LoadedModel, ModelRegistry};

/// 画像1枚を分類する
///
/// Webハンドラーはこのトレイト越しにのみモデルを使います。
pub trait Predictor: Send + Sync {
    fn predict(&self, image: &[u8]) -> Result<Prediction, DetectorError>;
}

/// モデルファイルを定期的に確認し、更新されていれば読み直すタスクを起動
pub fn spawn_watcher<B: Backend>(
    registry: Arc<ModelRegistry<B>>,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // 初回のtickは即座に返るので読み飛ばす
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let registry = registry.clone();
            match tokio::task::spawn_blocking(move || registry.reload_if_changed()).await {
                Ok(Ok(true)) => tracing::debug!("model snapshot swapped"),
                Ok(Ok(false)) => {}
                Ok(Err(e)) => tracing::warn!("model reload failed, keeping current model: {}", e),
                Err(e) => tracing::error!("model watcher task panicked: {}", e),
            }
        }
    })
}
