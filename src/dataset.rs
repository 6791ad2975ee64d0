//! 学習データの読み込み
//!
//! `data/<クラス名>/*.jpg` というフォルダ構成から、ラベル付きサンプル一覧を作ります。

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::DetectorError;

/// 対応する画像拡張子（小文字）
pub const SUPPORTED_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];

/// ラベル付き画像1枚分
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sample {
    /// 画像の絶対パス
    pub path: PathBuf,
    /// 親ディレクトリ名
    pub label: String,
}

/// ラベルキーと画像バイト列を付与したサンプル
#[derive(Debug, Clone)]
pub struct EncodedSample {
    pub sample: Sample,
    /// `LabelEncoder` によるキー
    pub key: u32,
    /// 画像ファイルの中身そのまま
    pub image: Vec<u8>,
}

/// 読み込んだ学習データ
#[derive(Debug, Clone)]
pub struct ScannedData {
    /// 見つかったクラスフォルダ名（画像が0枚のものも含む、名前順）
    pub classes: Vec<String>,
    pub samples: Vec<Sample>,
}

impl ScannedData {
    /// クラスごとの枚数（ラベル名順、空のフォルダは0）
    pub fn class_counts(&self) -> BTreeMap<String, usize> {
        let mut counts: BTreeMap<String, usize> =
            self.classes.iter().map(|class| (class.clone(), 0)).collect();
        for sample in &self.samples {
            *counts.entry(sample.label.clone()).or_insert(0) += 1;
        }
        counts
    }
}

/// 拡張子が対応形式かどうか（大文字小文字は区別しない）
pub fn has_supported_extension(path: &Path) -> bool {
    path.extension()
        .map(|ext| ext.to_string_lossy().to_lowercase())
        .is_some_and(|ext| SUPPORTED_EXTENSIONS.contains(&ext.as_str()))
}

/// ルート直下の各サブディレクトリをクラスとしてサンプルを収集する
///
/// サブディレクトリ・ファイルともに名前順に並べるため、同じ入力からは常に同じ順序になります。
/// さらに下の階層や非対応ファイルは無視します。
pub fn load_samples(data_dir: &Path) -> Result<ScannedData, DetectorError> {
    if !data_dir.is_dir() {
        return Err(DetectorError::configuration(format!(
            "Data directory not found: {}",
            data_dir.display()
        )));
    }

    let mut class_dirs = Vec::new();
    for entry in fs::read_dir(data_dir).map_err(|e| DetectorError::io(data_dir, e))? {
        let path = entry.map_err(|e| DetectorError::io(data_dir, e))?.path();
        if path.is_dir() {
            class_dirs.push(path);
        }
    }
    class_dirs.sort();

    if class_dirs.is_empty() {
        return Err(DetectorError::configuration(format!(
            "No class directories found in {}",
            data_dir.display()
        )));
    }

    let mut classes = Vec::with_capacity(class_dirs.len());
    let mut samples = Vec::new();
    for class_dir in &class_dirs {
        let Some(label) = class_dir.file_name().map(|n| n.to_string_lossy().to_string()) else {
            continue;
        };
        classes.push(label.clone());

        let mut files = Vec::new();
        for entry in fs::read_dir(class_dir).map_err(|e| DetectorError::io(class_dir, e))? {
            let path = entry.map_err(|e| DetectorError::io(class_dir, e))?.path();
            if path.is_file() && has_supported_extension(&path) {
                files.push(path);
            }
        }
        files.sort();

        for file in files {
            let path = fs::canonicalize(&file).map_err(|e| DetectorError::io(&file, e))?;
            samples.push(Sample {
                path,
                label: label.clone(),
            });
        }
    }

    if samples.is_empty() {
        return Err(DetectorError::configuration(format!(
            "No images found in {}",
            data_dir.display()
        )));
    }

    tracing::debug!(
        samples = samples.len(),
        classes = classes.len(),
        "loaded training samples"
    );

    Ok(ScannedData { classes, samples })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn touch(path: &Path) {
        fs::write(path, b"not really an image").unwrap();
    }

    #[test]
    fn test_load_samples_counts_each_class() {
        let dir = tempfile::tempdir().unwrap();
        let hat = dir.path().join("hard_hat");
        let no_hat = dir.path().join("no_hard_hat");
        fs::create_dir_all(&hat).unwrap();
        fs::create_dir_all(&no_hat).unwrap();

        for name in ["a.jpg", "b.JPEG", "c.png"] {
            touch(&hat.join(name));
        }
        for name in ["d.jpg", "e.png"] {
            touch(&no_hat.join(name));
        }

        let scanned = load_samples(dir.path()).unwrap();
        assert_eq!(scanned.samples.len(), 5);

        let counts = scanned.class_counts();
        assert_eq!(counts["hard_hat"], 3);
        assert_eq!(counts["no_hard_hat"], 2);

        for sample in &scanned.samples {
            assert!(sample.path.is_absolute());
            let parent = sample.path.parent().unwrap().file_name().unwrap();
            assert_eq!(parent.to_string_lossy(), sample.label);
        }
    }

    #[test]
    fn test_load_samples_ignores_other_files_and_nested_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let hat = dir.path().join("hard_hat");
        fs::create_dir_all(hat.join("nested")).unwrap();
        touch(&hat.join("keep.png"));
        touch(&hat.join("notes.txt"));
        touch(&hat.join("anim.gif"));
        touch(&hat.join("nested").join("deep.jpg"));
        touch(&dir.path().join("stray.jpg"));

        let samples = load_samples(dir.path()).unwrap().samples;
        assert_eq!(samples.len(), 1);
        assert!(samples[0].path.ends_with("hard_hat/keep.png"));
    }

    #[test]
    fn test_load_samples_is_sorted() {
        let dir = tempfile::tempdir().unwrap();
        for class in ["zebra", "alpha"] {
            let class_dir = dir.path().join(class);
            fs::create_dir_all(&class_dir).unwrap();
            touch(&class_dir.join("2.jpg"));
            touch(&class_dir.join("1.jpg"));
        }

        let samples = load_samples(dir.path()).unwrap().samples;
        let labels: Vec<_> = samples.iter().map(|s| s.label.as_str()).collect();
        assert_eq!(labels, ["alpha", "alpha", "zebra", "zebra"]);
        assert!(samples[0].path.ends_with("alpha/1.jpg"));
    }

    #[test]
    fn test_empty_class_folder_is_counted_as_zero() {
        let dir = tempfile::tempdir().unwrap();
        let hat = dir.path().join("hard_hat");
        fs::create_dir_all(&hat).unwrap();
        fs::create_dir_all(dir.path().join("no_hard_hat")).unwrap();
        touch(&hat.join("a.jpg"));
        touch(&hat.join("b.png"));

        let scanned = load_samples(dir.path()).unwrap();
        assert_eq!(scanned.classes, ["hard_hat", "no_hard_hat"]);
        assert_eq!(scanned.samples.len(), 2);

        let counts = scanned.class_counts();
        assert_eq!(counts.len(), 2);
        assert_eq!(counts["hard_hat"], 2);
        assert_eq!(counts["no_hard_hat"], 0);
    }

    #[test]
    fn test_missing_directory_is_configuration_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_samples(&dir.path().join("missing")).unwrap_err();
        assert!(matches!(err, DetectorError::Configuration { .. }));
    }

    #[test]
    fn test_no_class_directories_is_configuration_error() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join("loose.jpg"));
        let err = load_samples(dir.path()).unwrap_err();
        assert!(matches!(err, DetectorError::Configuration { .. }));
        assert!(err.to_string().contains("Expected structure"));
    }

    #[test]
    fn test_empty_classes_is_configuration_error() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("hard_hat")).unwrap();
        fs::create_dir_all(dir.path().join("no_hard_hat")).unwrap();
        let err = load_samples(dir.path()).unwrap_err();
        assert!(err.to_string().starts_with("No images found"));
    }
}
