//! モデル推論機能
//!
//! 学習済みアーティファクトを一度だけ読み込み、1枚ずつ画像を分類します。
//! 読み込み済みモデルは `Arc` で共有します。ネットワークはロック内で複製するだけで、
//! 順伝播はロックの外で行います（複製はテンソルの記憶領域を共有）。

use std::path::Path;
use std::sync::{Arc, Mutex, RwLock};

use burn::{
    module::Module,
    record::{FullPrecisionSettings, NamedMpkBytesRecorder, Recorder},
    tensor::backend::Backend,
};
use tracing::{debug, info, warn};

use crate::error::{ClassifierError, LoadError, Result};
use crate::ml::ml_model::PlantClassifier;
use crate::ml::preprocess::{ImagePreprocessor, ImageTensor, MAX_UPLOAD_BYTES};
use crate::model::label_registry::LabelRegistry;
use crate::model::model_metadata::ModelMetadata;
use crate::model::model_storage::load_model_with_metadata;
use crate::types::{DetectionResponse, PredictionResult};

/// 読み込み済みモデル（不変）
///
/// burnのパラメータは遅延初期化セルを持つため `Sync` ではありません。
/// ネットワークは `Mutex` に入れ、呼び出しごとに複製して使います。
#[derive(Debug)]
pub struct LoadedModel<B: Backend> {
    network: Mutex<PlantClassifier<B>>,
    num_classes: usize,
    metadata: ModelMetadata,
    preprocessor: ImagePreprocessor,
    device: B::Device,
}

impl<B: Backend> LoadedModel<B> {
    /// アーティファクトからモデルを復元
    pub fn load(model_path: &Path, device: &B::Device, max_upload_bytes: usize) -> std::result::Result<Self, LoadError> {
        let (metadata, model_binary) = load_model_with_metadata(model_path)?;
        metadata.validate()?;

        // メタデータのアーキテクチャ記述でモデルを初期化
        let model = metadata
            .architecture
            .init::<B>(device)
            .map_err(|e| LoadError::Architecture(e.to_string()))?;
        let expected_params = model.num_params();

        // モデルの重みを復元（壊れたバイナリはパニックせずエラーになる）
        let recorder = NamedMpkBytesRecorder::<FullPrecisionSettings>::default();
        let record = Recorder::<B>::load(&recorder, model_binary, device)
            .map_err(|e| LoadError::Weights(format!("{:?}", e)))?;
        let model = model.load_record(record);

        let found_params = model.num_params();
        if found_params != expected_params {
            return Err(LoadError::ShapeMismatch {
                expected: expected_params,
                found: found_params,
            });
        }

        let num_classes = model.num_classes();
        if metadata.labels.len() != num_classes {
            // 分類時に LabelMappingMismatch として拒否する
            warn!(
                "ラベル数 ({}) とモデルの出力クラス数 ({}) が一致しません",
                metadata.labels.len(),
                num_classes
            );
        }

        let preprocessor = ImagePreprocessor::new(metadata.input_size()).with_max_bytes(max_upload_bytes);
        Ok(Self {
            network: Mutex::new(model),
            num_classes,
            metadata,
            preprocessor,
            device: device.clone(),
        })
    }

    /// 推論用にネットワークを複製（ロックは複製の間だけ保持）
    fn network(&self) -> PlantClassifier<B> {
        self.network.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn metadata(&self) -> &ModelMetadata {
        &self.metadata
    }

    pub fn labels(&self) -> &LabelRegistry {
        &self.metadata.labels
    }

    /// 前処理済みの画像を分類
    pub fn classify_tensor(&self, image: &ImageTensor) -> Result<PredictionResult> {
        image.ensure_shape(self.metadata.input_size())?;
        let labels = self.labels();
        labels.ensure_output_width(self.num_classes)?;

        // Tensorに変換 [1, 3, size, size]
        let input = ImageTensor::to_batch::<B>(std::slice::from_ref(image), &self.device)?;

        // 推論実行（autodiffなしのためドロップアウトは無効）
        let probabilities = self
            .network()
            .forward_softmax(input)
            .into_data()
            .convert::<f32>()
            .to_vec::<f32>()
            .map_err(|e| ClassifierError::Tensor(format!("{:?}", e)))?;

        // 最大値のインデックスを取得
        let (class_index, max_prob) = probabilities
            .iter()
            .copied()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(&b.1))
            .ok_or_else(|| ClassifierError::Tensor("empty model output".to_string()))?;

        let label = labels
            .label(class_index)
            .ok_or(ClassifierError::LabelMappingMismatch {
                labels: labels.len(),
                outputs: probabilities.len(),
            })?
            .to_string();
        let confidence = (max_prob as f64 * 100.0 * 100.0).round() / 100.0;

        debug!("推論結果: {} ({}%)", label, confidence);
        Ok(PredictionResult {
            label,
            class_index,
            confidence,
            probabilities,
        })
    }

    /// 画像バイト列を分類（データ拡張なし）
    pub fn classify(&self, bytes: &[u8]) -> Result<PredictionResult> {
        let image = self.preprocessor.preprocess(bytes)?;
        self.classify_tensor(&image)
    }
}

/// 推論エンジン
///
/// `initialize` が成功するまでは `classify` は `ModelNotLoaded` を返します。
/// 再初期化に失敗した場合は、それまでのモデルをそのまま使い続けます。
pub struct InferenceEngine<B: Backend> {
    device: B::Device,
    max_upload_bytes: usize,
    state: RwLock<Option<Arc<LoadedModel<B>>>>,
}

impl<B: Backend> InferenceEngine<B> {
    /// モデル未読み込みの推論エンジンを作成
    pub fn new(device: B::Device) -> Self {
        Self {
            device,
            max_upload_bytes: MAX_UPLOAD_BYTES,
            state: RwLock::new(None),
        }
    }

    pub fn with_max_upload_bytes(mut self, max_upload_bytes: usize) -> Self {
        self.max_upload_bytes = max_upload_bytes;
        self
    }

    /// モデルを読み込んで推論エンジンを初期化
    pub fn load<P: AsRef<Path>>(model_path: P, device: B::Device) -> Result<Self> {
        let engine = Self::new(device);
        engine.initialize(model_path)?;
        Ok(engine)
    }

    /// モデルを読み込み、成功した場合のみ差し替える
    pub fn initialize<P: AsRef<Path>>(&self, model_path: P) -> Result<()> {
        let model_path = model_path.as_ref();
        let loaded = match LoadedModel::load(model_path, &self.device, self.max_upload_bytes) {
            Ok(loaded) => loaded,
            Err(e) => {
                warn!("モデルの読み込みに失敗しました ({}): {}", model_path.display(), e);
                return Err(e.into());
            }
        };

        info!(
            "モデルを読み込みました: {} ({} クラス, 入力 {2}x{2})",
            model_path.display(),
            loaded.labels().len(),
            loaded.metadata().input_size()
        );

        let loaded = Arc::new(loaded);
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        *state = Some(loaded);
        Ok(())
    }

    fn current(&self) -> Option<Arc<LoadedModel<B>>> {
        self.state.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn is_ready(&self) -> bool {
        self.current().is_some()
    }

    /// 読み込み済みモデルのラベルレジストリ
    pub fn labels(&self) -> Option<LabelRegistry> {
        self.current().map(|loaded| loaded.labels().clone())
    }

    pub fn metadata(&self) -> Option<ModelMetadata> {
        self.current().map(|loaded| loaded.metadata().clone())
    }

    /// 単一画像を分類
    pub fn classify(&self, bytes: &[u8]) -> Result<PredictionResult> {
        let loaded = self.current().ok_or(ClassifierError::ModelNotLoaded)?;
        loaded.classify(bytes).inspect_err(|e| debug!("分類を拒否しました: {}", e))
    }

    /// 画像ファイルを分類
    pub fn classify_file<P: AsRef<Path>>(&self, image_path: P) -> Result<PredictionResult> {
        let loaded = self.current().ok_or(ClassifierError::ModelNotLoaded)?;
        let image = loaded.preprocessor.preprocess_file(image_path.as_ref())?;
        loaded.classify_tensor(&image)
    }

    /// 分類結果をAPIレスポンス形式で返す
    pub fn detect(&self, bytes: &[u8]) -> Result<DetectionResponse> {
        let prediction = self.classify(bytes)?;
        Ok(DetectionResponse::from_prediction(&prediction))
    }
}
