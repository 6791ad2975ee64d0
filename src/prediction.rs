//! 推論結果

use serde::Serialize;

/// 1枚の画像に対する推論結果
///
/// `scores[i]` は `labels[i]` の確率で、順序はモデルファイルに保存されたキー順です。
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Prediction {
    pub predicted_label: String,
    pub scores: Vec<f32>,
    pub labels: Vec<String>,
}

impl Prediction {
    /// 最大スコア
    pub fn confidence(&self) -> f32 {
        self.scores.iter().copied().fold(0.0, f32::max)
    }

    /// (クラス名, 確率) をキー順で返す
    pub fn probabilities(&self) -> impl Iterator<Item = (&str, f32)> {
        self.labels
            .iter()
            .map(String::as_str)
            .zip(self.scores.iter().copied())
    }
}
