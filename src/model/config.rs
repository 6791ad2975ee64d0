//! アプリケーション設定管理モジュール
//!
//! 計算デバイス・学習設定・配信設定をJSON形式で保存・読み込みします。
//! CLI引数で指定された値はファイルの値より優先されます。

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// 計算デバイスの種類
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    /// WGPU (GPU) バックエンド
    #[default]
    Wgpu,
    /// NdArray (CPU) バックエンド
    Cpu,
}

impl std::fmt::Display for DeviceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceType::Wgpu => write!(f, "WGPU (GPU)"),
            DeviceType::Cpu => write!(f, "CPU (NdArray)"),
        }
    }
}

impl std::str::FromStr for DeviceType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "wgpu" | "gpu" => Ok(DeviceType::Wgpu),
            "cpu" | "ndarray" => Ok(DeviceType::Cpu),
            other => Err(format!("unknown device type: {other} (expected wgpu or cpu)")),
        }
    }
}

/// バックボーンの種類
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum Architecture {
    /// 3層CNN (32-64-128ch)
    ConvSmall,
    /// 3層CNN (64-128-256ch)
    ConvMedium,
    /// torchvision互換のResNet-18（ImageNetの学習済み重みを読み込める）
    #[default]
    #[serde(rename = "resnet18")]
    ResNet18,
    /// torchvision互換のResNet-34
    #[serde(rename = "resnet34")]
    ResNet34,
}

impl Architecture {
    /// 3層CNNの各畳み込み層の出力チャネル数
    pub fn conv_channels(&self) -> Option<[usize; 3]> {
        match self {
            Architecture::ConvSmall => Some([32, 64, 128]),
            Architecture::ConvMedium => Some([64, 128, 256]),
            Architecture::ResNet18 | Architecture::ResNet34 => None,
        }
    }

    /// ResNetのステージごとのブロック数
    pub fn resnet_blocks(&self) -> Option<[usize; 4]> {
        match self {
            Architecture::ResNet18 => Some([2, 2, 2, 2]),
            Architecture::ResNet34 => Some([3, 4, 6, 3]),
            Architecture::ConvSmall | Architecture::ConvMedium => None,
        }
    }

    /// ボトルネック特徴の次元
    pub fn feature_dim(&self) -> usize {
        match self.conv_channels() {
            Some([_, _, last]) => last,
            // ResNetの最終ステージは512ch
            None => 512,
        }
    }
}

impl std::fmt::Display for Architecture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Architecture::ConvSmall => write!(f, "conv-small"),
            Architecture::ConvMedium => write!(f, "conv-medium"),
            Architecture::ResNet18 => write!(f, "resnet18"),
            Architecture::ResNet34 => write!(f, "resnet34"),
        }
    }
}

impl std::str::FromStr for Architecture {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "conv-small" => Ok(Architecture::ConvSmall),
            "conv-medium" => Ok(Architecture::ConvMedium),
            "resnet18" | "resnet-18" => Ok(Architecture::ResNet18),
            "resnet34" | "resnet-34" => Ok(Architecture::ResNet34),
            other => Err(format!(
                "unknown architecture: {other} (expected resnet18, resnet34, conv-small or conv-medium)"
            )),
        }
    }
}

/// トレーニング設定
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingSettings {
    /// 学習データのルート（直下のフォルダ名がクラス名）
    pub data_dir: PathBuf,
    /// 学習済みモデルの出力先
    pub model_output_path: PathBuf,
    /// バックボーン
    pub architecture: Architecture,
    /// 事前学習済みバックボーンの重み（.pth / .pt / .safetensors / burnの.mpk）
    pub backbone_weights: Option<PathBuf>,
    /// エポック数
    pub epochs: usize,
    /// バッチサイズ
    pub batch_size: usize,
    /// 学習率
    pub learning_rate: f64,
    /// 検証データの割合
    pub split_fraction: f64,
    /// ランダムシード
    pub seed: u64,
    /// モデル入力サイズ（正方形）
    pub image_size: usize,
    /// 分類ヘッドのドロップアウト率
    pub dropout: f64,
}

impl Default for TrainingSettings {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("../data"),
            model_output_path: PathBuf::from("MLModel/model.tar.gz"),
            architecture: Architecture::default(),
            backbone_weights: None,
            epochs: 15,
            batch_size: 10,
            learning_rate: 0.01,
            split_fraction: 0.2,
            seed: 42,
            image_size: 224,
            dropout: 0.1,
        }
    }
}

/// 推論サーバ設定
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServingSettings {
    /// 読み込むモデルファイル
    pub model_path: PathBuf,
    /// 推論エンジンのプール数
    pub pool_size: usize,
    /// 待ち受けアドレス
    pub bind_addr: String,
    /// モデルファイル監視の間隔（ミリ秒）
    pub reload_interval_ms: u64,
    /// アップロードの上限サイズ（バイト）
    pub max_upload_bytes: usize,
}

impl Default for ServingSettings {
    fn default() -> Self {
        Self {
            model_path: PathBuf::from("MLModel/model.tar.gz"),
            pool_size: 4,
            bind_addr: "127.0.0.1:8080".to_string(),
            reload_interval_ms: 2000,
            max_upload_bytes: 10 * 1024 * 1024,
        }
    }
}

/// アプリケーション設定
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// 学習に使う計算デバイス
    pub device_type: DeviceType,
    /// トレーニング設定
    pub training: TrainingSettings,
    /// 推論サーバ設定
    pub serving: ServingSettings,
}

impl AppConfig {
    /// 設定ファイルのデフォルトパス
    pub fn default_path() -> PathBuf {
        PathBuf::from("config.json")
    }

    /// 設定を読み込む
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: AppConfig = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// 指定パスから設定を読み込む、存在しない・壊れている場合はデフォルト設定を返す
    pub fn load_or_default_from<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref();
        if path.exists() {
            match Self::load(path) {
                Ok(config) => {
                    tracing::info!("loaded config from {}", path.display());
                    config
                }
                Err(e) => {
                    tracing::warn!(
                        "failed to read config {} ({}), using defaults",
                        path.display(),
                        e
                    );
                    Self::default()
                }
            }
        } else {
            tracing::debug!("no config at {}, using defaults", path.display());
            Self::default()
        }
    }

    /// デフォルトパスから設定を読み込む
    pub fn load_or_default() -> Self {
        Self::load_or_default_from(Self::default_path())
    }

    /// 値の範囲チェック
    pub fn validate(&self) -> anyhow::Result<()> {
        let t = &self.training;
        anyhow::ensure!(t.epochs > 0, "epochs must be greater than 0");
        anyhow::ensure!(t.batch_size > 0, "batch_size must be greater than 0");
        anyhow::ensure!(
            t.learning_rate.is_finite() && t.learning_rate > 0.0,
            "learning_rate must be a positive number"
        );
        anyhow::ensure!(
            (0.0..1.0).contains(&t.split_fraction),
            "split_fraction must be in [0, 1)"
        );
        anyhow::ensure!((0.0..1.0).contains(&t.dropout), "dropout must be in [0, 1)");
        anyhow::ensure!(
            t.image_size >= 16,
            "image_size must be at least 16 (got {})",
            t.image_size
        );
        anyhow::ensure!(self.serving.pool_size > 0, "pool_size must be greater than 0");
        anyhow::ensure!(
            self.serving.max_upload_bytes > 0,
            "max_upload_bytes must be greater than 0"
        );
        Ok(())
    }

    /// 設定情報を表示
    pub fn display(&self) {
        println!("=== Configuration ===");
        println!("  Device:          {}", self.device_type);
        println!("  Data directory:  {}", self.training.data_dir.display());
        println!("  Model output:    {}", self.training.model_output_path.display());
        println!("  Architecture:    {}", self.training.architecture);
        match &self.training.backbone_weights {
            Some(path) => println!("  Backbone:        {}", path.display()),
            None => println!("  Backbone:        default initialization"),
        }
        println!("  Epochs:          {}", self.training.epochs);
        println!("  Batch size:      {}", self.training.batch_size);
        println!("  Learning rate:   {}", self.training.learning_rate);
        println!("  Split fraction:  {}", self.training.split_fraction);
        println!("  Seed:            {}", self.training.seed);
        println!("  Image size:      {}x{}", self.training.image_size, self.training.image_size);
        println!("=====================\n");
    }
}
