// ヘルメット着用判定: 学習パイプラインと推論サーバー
pub mod error;
pub mod dataset;
pub mod metrics;
pub mod model;
pub mod prediction;

// 数値計算（burn）に依存する部分
#[cfg(feature = "ml")]
pub mod ml;
#[cfg(feature = "ml")]
pub mod serving;
#[cfg(feature = "ml")]
pub mod web;

#[cfg(all(test, feature = "ml"))]
mod testing;

pub use error::DetectorError;
pub use prediction::Prediction;

/// ログ出力を初期化（`RUST_LOG` で上書き可能）
pub fn init_tracing(default_filter: &str) {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .try_init();
}
