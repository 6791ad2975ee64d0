//! モデルファイルの読み込みと差し替え
//!
//! 読み込んだモデルは `LoadedModel` として丸ごと1つのスナップショットにまとめ、
//! ファイルが更新されたら新しいスナップショットと入れ替えます。
//! 処理中のリクエストは取得済みの古いスナップショットを最後まで使います。

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use burn::tensor::backend::Backend;
use parking_lot::{Mutex, RwLock};

use crate::error::DetectorError;
use crate::ml::InferenceEngine;
use crate::model::{load_model_with_metadata, ModelMetadata};
use crate::prediction::Prediction;
use crate::serving::pool::EnginePool;
use crate::serving::Predictor;

/// 読み込み済みモデル1世代分
pub struct LoadedModel<B: Backend> {
    pub generation: u64,
    pub metadata: ModelMetadata,
    pub pool: EnginePool<InferenceEngine<B>>,
}

impl<B: Backend> LoadedModel<B> {
    pub fn predict(&self, image: &[u8]) -> Result<Prediction, DetectorError> {
        let engine = self.pool.checkout();
        engine.predict(image)
    }
}

/// 更新検知用のファイル情報
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileStamp {
    modified: Option<SystemTime>,
    len: u64,
}

impl FileStamp {
    fn read(path: &Path) -> Result<Option<Self>, DetectorError> {
        match std::fs::metadata(path) {
            Ok(meta) => Ok(Some(Self {
                modified: meta.modified().ok(),
                len: meta.len(),
            })),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(DetectorError::io(path, e)),
        }
    }
}

pub struct ModelRegistry<B: Backend> {
    model_path: PathBuf,
    pool_size: usize,
    device: B::Device,
    current: RwLock<Option<Arc<LoadedModel<B>>>>,
    stamp: Mutex<Option<FileStamp>>,
    /// 直近の読み込み失敗（成功・ファイル削除で消える）
    last_error: Mutex<Option<String>>,
    generation: AtomicU64,
}

impl<B: Backend> ModelRegistry<B> {
    /// レジストリを作成し、モデルファイルがあれば読み込む
    ///
    /// ファイルがなくてもエラーにはせず、後から置かれたときに読み込みます。
    pub fn new(model_path: impl Into<PathBuf>, pool_size: usize, device: B::Device) -> Self {
        let registry = Self {
            model_path: model_path.into(),
            pool_size: pool_size.max(1),
            device,
            current: RwLock::new(None),
            stamp: Mutex::new(None),
            last_error: Mutex::new(None),
            generation: AtomicU64::new(0),
        };

        match registry.reload_if_changed() {
            Ok(_) if registry.snapshot().is_none() => tracing::warn!(
                "model not found at {}, waiting for it to be trained",
                registry.model_path.display()
            ),
            Ok(_) => {}
            Err(e) => tracing::warn!("failed to load model: {}", e),
        }

        registry
    }

    /// 現在のスナップショット（未読み込みならNone）
    pub fn snapshot(&self) -> Option<Arc<LoadedModel<B>>> {
        self.current.read().clone()
    }

    /// 読み込みに成功した回数
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// ファイルが変わっていれば読み直す
    ///
    /// スナップショットが入れ替わった場合に `Ok(true)` を返します。
    /// 読み込みに失敗した場合は今のスナップショットをそのまま使い続けます。
    pub fn reload_if_changed(&self) -> Result<bool, DetectorError> {
        // 同時に2回読み込まないよう、確認から入れ替えまでロックを保持する
        let mut stamp = self.stamp.lock();
        let latest = FileStamp::read(&self.model_path)?;

        let Some(latest) = latest else {
            *stamp = None;
            *self.last_error.lock() = None;
            let dropped = self.current.write().take().is_some();
            if dropped {
                tracing::warn!("model file {} was removed", self.model_path.display());
            }
            return Ok(dropped);
        };

        if *stamp == Some(latest) {
            return Ok(false);
        }
        // 壊れたファイルを毎回読み直さないよう、失敗してもスタンプは更新する
        *stamp = Some(latest);

        let loaded = match self.load() {
            Ok(loaded) => loaded,
            Err(e) => {
                let message = match &e {
                    DetectorError::Artifact { message, .. } => message.clone(),
                    other => other.to_string(),
                };
                *self.last_error.lock() = Some(message);
                return Err(e);
            }
        };
        *self.last_error.lock() = None;
        tracing::info!(
            generation = loaded.generation,
            labels = ?loaded.metadata.labels.labels(),
            trained_at = %loaded.metadata.trained_at,
            "model loaded from {}",
            self.model_path.display()
        );
        *self.current.write() = Some(Arc::new(loaded));
        Ok(true)
    }

    fn load(&self) -> Result<LoadedModel<B>, DetectorError> {
        let (metadata, binary) = load_model_with_metadata(&self.model_path)?;

        let engines = (0..self.pool_size)
            .map(|_| {
                InferenceEngine::from_parts(metadata.clone(), binary.clone(), &self.device)
                    .map_err(|e| DetectorError::artifact(&self.model_path, e.to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(LoadedModel {
            generation,
            metadata,
            pool: EnginePool::new(engines),
        })
    }
}

impl<B: Backend> Predictor for ModelRegistry<B> {
    fn predict(&self, image: &[u8]) -> Result<Prediction, DetectorError> {
        if let Some(snapshot) = self.snapshot() {
            return snapshot.predict(image);
        }

        // ファイルはあるが読み込めなかった場合は「見つからない」と区別する
        match self.last_error.lock().clone() {
            Some(message) if self.model_path.exists() => {
                Err(DetectorError::artifact(&self.model_path, message))
            }
            _ => Err(DetectorError::ArtifactNotFound(self.model_path.clone())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{png_bytes, write_test_artifact, TestBackend};
    use std::thread;

    fn registry(path: &Path, pool_size: usize) -> ModelRegistry<TestBackend> {
        ModelRegistry::new(path, pool_size, Default::default())
    }

    #[test]
    fn test_missing_artifact_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.tar.gz");
        let registry = registry(&path, 2);

        assert!(registry.snapshot().is_none());
        let err = registry.predict(&png_bytes([0, 0, 0], 8, 8)).unwrap_err();
        assert!(matches!(err, DetectorError::ArtifactNotFound(p) if p == path));
    }

    #[test]
    fn test_model_trained_after_start_is_picked_up() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.tar.gz");
        let registry = registry(&path, 1);
        assert!(!registry.reload_if_changed().unwrap());

        write_test_artifact(&path, &["hard_hat", "no_hard_hat"]);
        assert!(registry.reload_if_changed().unwrap());
        assert!(!registry.reload_if_changed().unwrap());
        assert_eq!(registry.generation(), 1);

        let prediction = registry.predict(&png_bytes([200, 200, 0], 8, 8)).unwrap();
        assert_eq!(prediction.labels, vec!["hard_hat", "no_hard_hat"]);
    }

    #[test]
    fn test_concurrent_predictions_match_sequential() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.tar.gz");
        write_test_artifact(&path, &["hard_hat", "no_hard_hat"]);
        let registry = Arc::new(registry(&path, 4));

        let images: Vec<Vec<u8>> = (0..50u8)
            .map(|i| png_bytes([i.wrapping_mul(5), 255 - i, i.wrapping_mul(3)], 10, 10))
            .collect();
        let expected: Vec<_> = images
            .iter()
            .map(|image| registry.predict(image).unwrap())
            .collect();

        let handles: Vec<_> = images
            .into_iter()
            .map(|image| {
                let registry = registry.clone();
                thread::spawn(move || registry.predict(&image).unwrap())
            })
            .collect();

        for (handle, expected) in handles.into_iter().zip(expected) {
            let actual = handle.join().unwrap();
            assert_eq!(actual.predicted_label, expected.predicted_label);
            for (a, e) in actual.scores.iter().zip(&expected.scores) {
                assert!((a - e).abs() < 1e-5);
            }
        }

        let snapshot = registry.snapshot().unwrap();
        assert_eq!(snapshot.pool.idle_count(), 4);
    }

    #[test]
    fn test_hot_reload_keeps_old_snapshot_usable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.tar.gz");
        write_test_artifact(&path, &["hat", "none"]);
        let registry = registry(&path, 2);
        let old = registry.snapshot().unwrap();

        write_test_artifact(&path, &["hard_hat", "no_hard_hat", "unknown"]);
        assert!(registry.reload_if_changed().unwrap());

        let image = png_bytes([10, 10, 10], 8, 8);
        let new_prediction = registry.predict(&image).unwrap();
        assert_eq!(new_prediction.labels.len(), 3);
        assert_eq!(registry.snapshot().unwrap().generation, 2);

        // 切り替え前に取得したスナップショットはそのまま使える
        let old_prediction = old.predict(&image).unwrap();
        assert_eq!(old_prediction.labels, vec!["hat", "none"]);
        assert_eq!(old.generation, 1);
    }

    #[test]
    fn test_broken_replacement_keeps_current_model() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.tar.gz");
        write_test_artifact(&path, &["hard_hat", "no_hard_hat"]);
        let registry = registry(&path, 1);

        std::fs::write(&path, b"definitely not a tar.gz archive").unwrap();
        assert!(registry.reload_if_changed().is_err());
        assert_eq!(registry.snapshot().unwrap().generation, 1);
        assert!(registry.predict(&png_bytes([1, 2, 3], 8, 8)).is_ok());
    }

    #[test]
    fn test_corrupt_artifact_at_startup_is_reported_as_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.tar.gz");
        std::fs::write(&path, b"garbage bytes, not an archive").unwrap();
        let registry = registry(&path, 1);

        assert!(registry.snapshot().is_none());
        let err = registry.predict(&png_bytes([1, 2, 3], 8, 8)).unwrap_err();
        assert!(matches!(&err, DetectorError::Artifact { path: p, .. } if *p == path));

        // 正しいファイルに置き換えれば読み込まれ、エラーは消える
        write_test_artifact(&path, &["hard_hat", "no_hard_hat"]);
        assert!(registry.reload_if_changed().unwrap());
        assert!(registry.predict(&png_bytes([1, 2, 3], 8, 8)).is_ok());
    }

    #[test]
    fn test_corrupt_artifact_removed_is_not_found_again() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.tar.gz");
        std::fs::write(&path, b"garbage").unwrap();
        let registry = registry(&path, 1);

        std::fs::remove_file(&path).unwrap();
        assert!(!registry.reload_if_changed().unwrap());
        assert!(matches!(
            registry.predict(&png_bytes([1, 2, 3], 8, 8)),
            Err(DetectorError::ArtifactNotFound(_))
        ));
    }

    #[test]
    fn test_removed_artifact_drops_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.tar.gz");
        write_test_artifact(&path, &["hard_hat", "no_hard_hat"]);
        let registry = registry(&path, 1);
        assert!(registry.snapshot().is_some());

        std::fs::remove_file(&path).unwrap();
        assert!(registry.reload_if_changed().unwrap());
        assert!(matches!(
            registry.predict(&png_bytes([1, 2, 3], 8, 8)),
            Err(DetectorError::ArtifactNotFound(_))
        ));
    }
}
