//! ラベル文字列 ↔ ラベルキーの変換
//!
//! 学習時に全サンプルから作成し、メタデータに保存して推論時にも同じ順序を使います。

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::dataset::Sample;

/// ラベルキーの割り当て（キー = `labels` のインデックス）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LabelEncoder {
    labels: Vec<String>,
}

impl LabelEncoder {
    /// 全サンプルのラベルを辞書順に並べてキーを割り当てる
    pub fn fit(samples: &[Sample]) -> Self {
        let labels: BTreeSet<&str> = samples.iter().map(|s| s.label.as_str()).collect();
        Self {
            labels: labels.into_iter().map(str::to_string).collect(),
        }
    }

    /// 保存済みのキー順からそのまま復元する
    pub fn from_labels(labels: Vec<String>) -> Self {
        Self { labels }
    }

    pub fn encode(&self, label: &str) -> Option<u32> {
        self.labels
            .iter()
            .position(|l| l == label)
            .map(|i| i as u32)
    }

    /// キー順のラベル一覧
    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    pub fn num_classes(&self) -> usize {
        self.labels.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn sample(label: &str) -> Sample {
        Sample {
            path: PathBuf::from(format!("/data/{label}/x.jpg")),
            label: label.to_string(),
        }
    }

    #[test]
    fn test_fit_is_bijection_over_keys() {
        let samples = vec![
            sample("no_hard_hat"),
            sample("hard_hat"),
            sample("no_hard_hat"),
            sample("vest"),
        ];
        let encoder = LabelEncoder::fit(&samples);
        assert_eq!(encoder.num_classes(), 3);

        for (key, label) in encoder.labels().iter().enumerate() {
            assert_eq!(encoder.encode(label), Some(key as u32));
        }
        assert_eq!(encoder.encode("helmet"), None);
    }

    #[test]
    fn test_fit_ignores_sample_order() {
        let a = LabelEncoder::fit(&[sample("no_hard_hat"), sample("hard_hat")]);
        let b = LabelEncoder::fit(&[sample("hard_hat"), sample("no_hard_hat")]);
        assert_eq!(a, b);
        assert_eq!(a.labels(), ["hard_hat", "no_hard_hat"]);
    }

    #[test]
    fn test_serializes_as_plain_list() {
        let encoder = LabelEncoder::from_labels(vec!["b".into(), "a".into()]);
        let json = serde_json::to_string(&encoder).unwrap();
        assert_eq!(json, r#"["b","a"]"#);
        let back: LabelEncoder = serde_json::from_str(&json).unwrap();
        assert_eq!(back.encode("a"), Some(1));
    }
}
