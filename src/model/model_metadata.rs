//! モデルメタデータの定義
//!
//! tar.gz形式のモデルファイルに `metadata.json` として保存されます。
//! ラベルのキー順はここに記録され、推論時のクラス名の対応付けはすべてこれを参照します。

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::metrics::EvaluationMetrics;
use crate::model::config::Architecture;
use crate::model::label_encoder::LabelEncoder;

/// 現在のメタデータ形式のバージョン
pub const FORMAT_VERSION: u32 = 1;

/// 列の型
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ColumnType {
    String,
    Bytes,
    /// クラス数を持つキー型
    Key { cardinality: usize },
    /// 固定長のf32ベクトル
    Vector { len: usize },
}

/// 入出力スキーマの1列
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    #[serde(rename = "type")]
    pub column_type: ColumnType,
}

impl Column {
    fn new(name: &str, column_type: ColumnType) -> Self {
        Self {
            name: name.to_string(),
            column_type,
        }
    }
}

/// 入出力スキーマ（順序付き）
pub fn default_schema(num_classes: usize) -> Vec<Column> {
    vec![
        Column::new("ImagePath", ColumnType::String),
        Column::new("Label", ColumnType::String),
        Column::new(
            "LabelAsKey",
            ColumnType::Key {
                cardinality: num_classes,
            },
        ),
        Column::new("Image", ColumnType::Bytes),
        Column::new("PredictedLabel", ColumnType::String),
        Column::new("Score", ColumnType::Vector { len: num_classes }),
    ]
}

/// 学習時のハイパーパラメータ
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hyperparameters {
    pub epochs: usize,
    pub batch_size: usize,
    pub learning_rate: f64,
    pub split_fraction: f64,
    pub seed: u64,
    pub dropout: f64,
}

/// モデルメタデータ
///
/// tar.gz形式で保存される情報：
/// - metadata.json: このメタデータ（JSON形式）
/// - model.bin: モデルの重み（バイナリ）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelMetadata {
    pub format_version: u32,

    /// 入出力スキーマ
    pub schema: Vec<Column>,

    /// キー順のクラスラベル
    /// 例: ["hard_hat", "no_hard_hat"]
    pub labels: LabelEncoder,

    /// バックボーンの種類
    pub architecture: Architecture,

    /// モデル入力サイズ（正方形）
    pub image_size: usize,

    pub hyperparameters: Hyperparameters,

    /// 学習・検証に使った枚数
    pub num_train: usize,
    pub num_valid: usize,

    /// 検証データでの評価結果（計算できなかった場合はNone）
    #[serde(default)]
    pub metrics: Option<EvaluationMetrics>,

    /// モデルの学習時刻（ISO8601形式）
    pub trained_at: String,
}

impl ModelMetadata {
    /// 新しいメタデータを作成
    pub fn new(
        labels: LabelEncoder,
        architecture: Architecture,
        image_size: usize,
        hyperparameters: Hyperparameters,
        num_train: usize,
        num_valid: usize,
        metrics: Option<EvaluationMetrics>,
    ) -> Self {
        let trained_at = chrono::Local::now().to_rfc3339();

        Self {
            format_version: FORMAT_VERSION,
            schema: default_schema(labels.num_classes()),
            labels,
            architecture,
            image_size,
            hyperparameters,
            num_train,
            num_valid,
            metrics,
            trained_at,
        }
    }

    pub fn num_classes(&self) -> usize {
        self.labels.num_classes()
    }

    /// メタデータをJSON文字列に変換
    pub fn to_json_string(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("Failed to serialize metadata to JSON")
    }

    /// JSON文字列からメタデータを生成
    pub fn from_json_string(json: &str) -> Result<Self> {
        let metadata: Self =
            serde_json::from_str(json).context("Failed to deserialize metadata from JSON")?;
        anyhow::ensure!(
            metadata.format_version == FORMAT_VERSION,
            "unsupported metadata format version {} (expected {})",
            metadata.format_version,
            FORMAT_VERSION
        );
        anyhow::ensure!(
            metadata.num_classes() > 0,
            "metadata does not contain any class labels"
        );
        Ok(metadata)
    }
}

#[cfg(test)]
pub(crate) fn sample_metadata(labels: &[&str]) -> ModelMetadata {
    ModelMetadata::new(
        LabelEncoder::from_labels(labels.iter().map(|l| l.to_string()).collect()),
        Architecture::ConvSmall,
        16,
        Hyperparameters {
            epochs: 1,
            batch_size: 2,
            learning_rate: 0.01,
            split_fraction: 0.2,
            seed: 42,
            dropout: 0.0,
        },
        8,
        2,
        None,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_tracks_class_count() {
        let metadata = sample_metadata(&["hard_hat", "no_hard_hat"]);
        let score = metadata.schema.last().unwrap();
        assert_eq!(score.name, "Score");
        assert_eq!(score.column_type, ColumnType::Vector { len: 2 });
        assert_eq!(metadata.schema[2].column_type, ColumnType::Key { cardinality: 2 });
    }

    #[test]
    fn test_json_keeps_label_order() {
        let metadata = sample_metadata(&["no_hard_hat", "hard_hat"]);
        let json = metadata.to_json_string().unwrap();
        let back = ModelMetadata::from_json_string(&json).unwrap();
        assert_eq!(back.labels.labels(), ["no_hard_hat", "hard_hat"]);
        assert_eq!(back.architecture, Architecture::ConvSmall);
        assert!(back.metrics.is_none());
    }

    #[test]
    fn test_rejects_unknown_format_version() {
        let mut metadata = sample_metadata(&["a", "b"]);
        metadata.format_version = 99;
        let json = serde_json::to_string(&metadata).unwrap();
        let err = ModelMetadata::from_json_string(&json).unwrap_err();
        assert!(err.to_string().contains("unsupported metadata format version"));
    }
}
