//! エラー定義
//!
//! 学習・推論・Webの各層で区別が必要なエラーをまとめています。
//! オーケストレーション側は `anyhow` でラップし、ここで定義した型は
//! `downcast_ref` で取り出せます。

use std::path::PathBuf;
use thiserror::Error;

/// 学習データの期待されるフォルダ構成
pub const EXPECTED_LAYOUT: &str = "Expected structure:
  data/
    hard_hat/     (JPEG/PNG images)
    no_hard_hat/  (JPEG/PNG images)";

#[derive(Debug, Error)]
pub enum DetectorError {
    /// データディレクトリや設定値の不備（学習は中断）
    #[error("{message}\n{}", EXPECTED_LAYOUT)]
    Configuration { message: String },

    /// 画像ファイルの読み込み失敗
    #[error("failed to read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// 指定パスにモデルファイルが存在しない
    #[error("model artifact not found: {}", .0.display())]
    ArtifactNotFound(PathBuf),

    /// モデルファイルは存在するが内容が不正
    #[error("invalid model artifact {}: {message}", .path.display())]
    Artifact { path: PathBuf, message: String },

    /// アップロード内容の検証エラー（ユーザー向け）
    #[error("{0}")]
    Validation(String),

    /// 画像のデコードや推論の失敗
    #[error("{0}")]
    Prediction(String),
}

impl DetectorError {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn artifact(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::Artifact {
            path: path.into(),
            message: message.into(),
        }
    }
}
