//! 多クラス分類の評価指標
//!
//! 検証データに対する予測結果から正解率・log-loss・混同行列を計算します。

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// log-loss計算時の確率の下限
const LOG_LOSS_EPSILON: f64 = 1e-15;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum MetricsError {
    #[error("validation partition is empty")]
    EmptyPartition,
    #[error("at least two classes are required to evaluate (got {0})")]
    TooFewClasses(usize),
    #[error("score vector has {got} entries, expected {expected}")]
    ScoreLength { expected: usize, got: usize },
    #[error("label key {key} is out of range for {num_classes} classes")]
    KeyOutOfRange { key: u32, num_classes: usize },
}

/// 評価指標
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationMetrics {
    /// 全サンプルの正解率
    pub micro_accuracy: f64,
    /// クラスごとの正解率（再現率）の平均
    pub macro_accuracy: f64,
    pub log_loss: f64,
    /// クラスごとのlog-loss（サンプルがないクラスはNone）
    pub per_class_log_loss: Vec<Option<f64>>,
    /// 行 = 正解キー、列 = 予測キー
    pub confusion_matrix: Vec<Vec<usize>>,
    pub num_samples: usize,
}

impl EvaluationMetrics {
    /// `actual[i]` と `scores[i]`（キー順の確率）から指標を計算する
    pub fn compute(
        actual: &[u32],
        scores: &[Vec<f32>],
        num_classes: usize,
    ) -> Result<Self, MetricsError> {
        if num_classes < 2 {
            return Err(MetricsError::TooFewClasses(num_classes));
        }
        if actual.is_empty() {
            return Err(MetricsError::EmptyPartition);
        }

        let mut confusion = vec![vec![0usize; num_classes]; num_classes];
        let mut class_loss = vec![0.0f64; num_classes];
        let mut total_loss = 0.0f64;

        for (&key, row) in actual.iter().zip(scores) {
            let key_idx = key as usize;
            if key_idx >= num_classes {
                return Err(MetricsError::KeyOutOfRange { key, num_classes });
            }
            if row.len() != num_classes {
                return Err(MetricsError::ScoreLength {
                    expected: num_classes,
                    got: row.len(),
                });
            }

            let predicted = argmax(row);
            confusion[key_idx][predicted] += 1;

            let p = (row[key_idx] as f64).max(LOG_LOSS_EPSILON);
            let loss = -p.ln();
            total_loss += loss;
            class_loss[key_idx] += loss;
        }

        let n = actual.len();
        let correct: usize = (0..num_classes).map(|k| confusion[k][k]).sum();

        let mut recalls = Vec::new();
        let mut per_class_log_loss = Vec::with_capacity(num_classes);
        for k in 0..num_classes {
            let support: usize = confusion[k].iter().sum();
            if support == 0 {
                per_class_log_loss.push(None);
            } else {
                recalls.push(confusion[k][k] as f64 / support as f64);
                per_class_log_loss.push(Some(class_loss[k] / support as f64));
            }
        }

        Ok(Self {
            micro_accuracy: correct as f64 / n as f64,
            macro_accuracy: recalls.iter().sum::<f64>() / recalls.len() as f64,
            log_loss: total_loss / n as f64,
            per_class_log_loss,
            confusion_matrix: confusion,
            num_samples: n,
        })
    }

    /// 混同行列を表形式の文字列にする
    pub fn format_confusion_matrix(&self, labels: &[String]) -> String {
        let width = labels.iter().map(|l| l.len()).max().unwrap_or(0).max(8);
        let mut out = format!("{:width$} |", "actual\\pred", width = width);
        for label in labels {
            out.push_str(&format!(" {:>width$}", label, width = width));
        }
        out.push('\n');
        out.push_str(&"-".repeat(out.len().saturating_sub(1)));
        out.push('\n');
        for (label, row) in labels.iter().zip(&self.confusion_matrix) {
            out.push_str(&format!("{:width$} |", label, width = width));
            for count in row {
                out.push_str(&format!(" {:>width$}", count, width = width));
            }
            out.push('\n');
        }
        out
    }
}

/// 最大値のインデックス（同値なら先頭）
pub fn argmax(values: &[f32]) -> usize {
    let mut best = 0;
    for (i, v) in values.iter().enumerate() {
        if *v > values[best] {
            best = i;
        }
    }
    best
}
