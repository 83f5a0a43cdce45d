//! モデル学習
//!
//! エポックごとに学習データを1周してバッチごとにAdamで更新し、
//! その後ドロップアウトなしのモデルで検証データを評価します。

use std::path::PathBuf;
use std::sync::Arc;

use burn::{
    data::dataloader::DataLoader,
    module::{AutodiffModule, Module},
    optim::{AdamConfig, GradientsParams, Optimizer},
    tensor::{
        backend::{AutodiffBackend, Backend},
        ElementConversion,
    },
};
use tracing::{debug, info, warn};

use crate::error::{ClassifierError, Result};
use crate::history::TrainingHistory;
use crate::ml::augmentation::Augmenter;
use crate::ml::dataset::{build_loader, load_splits, LeafBatch, LeafBatcher};
use crate::ml::ml_model::{correct_predictions, ModelConfig, PlantClassifier};
use crate::ml::preprocess::ImagePreprocessor;
use crate::model::config::{AppConfig, AugmentationSettings, TrainingSettings};
use crate::model::label_registry::LabelRegistry;
use crate::model::model_metadata::ModelMetadata;
use crate::model::model_storage::save_model;
use crate::types::EpochMetrics;

/// 損失と精度（サンプル数で重み付けした平均）
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct EvalMetrics {
    pub loss: f64,
    pub accuracy: f64,
}

#[derive(Default)]
struct Accumulator {
    loss_sum: f64,
    correct: usize,
    seen: usize,
}

impl Accumulator {
    fn add(&mut self, loss: f64, correct: usize, batch_size: usize) {
        self.loss_sum += loss * batch_size as f64;
        self.correct += correct;
        self.seen += batch_size;
    }

    fn finish(&self) -> EvalMetrics {
        if self.seen == 0 {
            return EvalMetrics::default();
        }
        EvalMetrics {
            loss: self.loss_sum / self.seen as f64,
            accuracy: self.correct as f64 / self.seen as f64,
        }
    }
}

/// 損失が有限値であることを確認
pub fn ensure_finite(epoch: usize, loss: f64) -> Result<()> {
    if loss.is_finite() {
        Ok(())
    } else {
        Err(ClassifierError::TrainingDiverged { epoch, loss })
    }
}

/// 検証データ全体を評価（パラメータは更新しない）
///
/// 読み込めない画像を含むバッチがあればエラー。
pub fn evaluate<B: Backend>(model: &PlantClassifier<B>, loader: &dyn DataLoader<B, LeafBatch<B>>) -> Result<EvalMetrics> {
    let mut acc = Accumulator::default();

    for batch in loader.iter() {
        batch.ensure_complete()?;
        let batch_size = batch.targets.dims()[0];
        let output = model.forward_classification(batch.images, batch.labels, batch.targets);
        let loss: f64 = output.loss.into_scalar().elem();
        acc.add(loss, correct_predictions(output.output, output.targets), batch_size);
    }

    if acc.seen == 0 {
        warn!("検証データがありません。検証指標は0として記録します");
    }
    Ok(acc.finish())
}

/// 早期終了の判定（検証精度が改善しないエポック数を数える）
#[derive(Debug)]
struct EarlyStopping {
    patience: usize,
    best: Option<f64>,
    stale_epochs: usize,
}

impl EarlyStopping {
    fn new(patience: usize) -> Self {
        Self {
            patience,
            best: None,
            stale_epochs: 0,
        }
    }

    /// 打ち切るべきなら true
    fn update(&mut self, val_accuracy: f64) -> bool {
        match self.best {
            Some(best) if val_accuracy <= best => self.stale_epochs += 1,
            _ => {
                self.best = Some(val_accuracy);
                self.stale_epochs = 0;
            }
        }
        self.stale_epochs >= self.patience
    }
}

/// 学習ループ
///
/// # 引数
/// - `model`: 初期化済みモデル（autodiffバックエンド）
/// - `train_loader`: 学習データ（データ拡張あり）
/// - `val_loader`: 検証データ（内部バックエンド）
/// - `on_epoch`: エポック終了ごとに呼ばれる
///
/// # 戻り値
/// - 学習済みモデルとエポックごとの指標
pub fn train<B: AutodiffBackend>(
    mut model: PlantClassifier<B>,
    train_loader: Arc<dyn DataLoader<B, LeafBatch<B>>>,
    val_loader: Arc<dyn DataLoader<B::InnerBackend, LeafBatch<B::InnerBackend>>>,
    settings: &TrainingSettings,
    mut on_epoch: impl FnMut(&EpochMetrics),
) -> Result<(PlantClassifier<B>, TrainingHistory)> {
    settings.validate()?;

    let mut optimizer = AdamConfig::new().init();
    let mut history = TrainingHistory::new();
    let mut early_stopping = settings.patience.map(EarlyStopping::new);
    let num_batches = train_loader.num_items().div_ceil(settings.batch_size);

    for epoch in 1..=settings.num_epochs {
        let mut acc = Accumulator::default();

        for (batch_idx, batch) in train_loader.iter().enumerate() {
            // ゼロ埋めされた画像で学習しない
            batch.ensure_complete()?;
            let batch_size = batch.targets.dims()[0];
            let output = model.forward_classification(batch.images, batch.labels, batch.targets);

            let loss_value: f64 = output.loss.clone().into_scalar().elem();
            ensure_finite(epoch, loss_value)?;
            acc.add(loss_value, correct_predictions(output.output, output.targets), batch_size);

            let grads = output.loss.backward();
            let grads = GradientsParams::from_grads(grads, &model);
            model = optimizer.step(settings.learning_rate, model, grads);

            debug!("  バッチ {:>4}/{}: loss = {:.4}", batch_idx + 1, num_batches, loss_value);
        }

        let train_metrics = acc.finish();
        let val_metrics = evaluate(&model.valid(), val_loader.as_ref())?;

        let metrics = EpochMetrics {
            epoch,
            train_loss: train_metrics.loss,
            train_accuracy: train_metrics.accuracy,
            val_loss: val_metrics.loss,
            val_accuracy: val_metrics.accuracy,
        };
        info!(
            "エポック {}/{}: train loss {:.4} / acc {:.2}% | val loss {:.4} / acc {:.2}%",
            epoch,
            settings.num_epochs,
            metrics.train_loss,
            metrics.train_accuracy * 100.0,
            metrics.val_loss,
            metrics.val_accuracy * 100.0
        );
        on_epoch(&metrics);
        history.push(metrics);

        if let Some(stopping) = early_stopping.as_mut() {
            if stopping.update(metrics.val_accuracy) {
                info!(
                    "検証精度が {} エポック改善しなかったため学習を終了します",
                    stopping.patience
                );
                break;
            }
        }
    }

    Ok((model, history))
}

/// 学習の入力一式
#[derive(Debug, Clone)]
pub struct TrainingRequest {
    /// クラスごとのサブディレクトリを持つ学習データ
    pub train_dir: PathBuf,
    /// 検証データ（なければ学習データを分割）
    pub val_dir: Option<PathBuf>,
    /// 保存先（.tar.gz）
    pub output_path: PathBuf,
    pub image_size: usize,
    pub dropout: f64,
    pub training: TrainingSettings,
    pub augmentation: AugmentationSettings,
}

impl TrainingRequest {
    pub fn from_config(config: &AppConfig, train_dir: PathBuf, val_dir: Option<PathBuf>) -> Self {
        Self {
            train_dir,
            val_dir,
            output_path: PathBuf::from(&config.model.model_path),
            image_size: config.model.image_size,
            dropout: config.model.dropout,
            training: config.training.clone(),
            augmentation: config.augmentation.clone(),
        }
    }
}

/// 学習結果
#[derive(Debug, Clone)]
pub struct TrainingReport {
    pub artifact_path: PathBuf,
    pub labels: LabelRegistry,
    pub history: TrainingHistory,
}

/// データ読み込みから保存までの学習全体を実行
///
/// 保存は学習がすべて成功した後に一度だけ行います。
pub fn train_model<B: AutodiffBackend>(
    request: &TrainingRequest,
    device: &B::Device,
    on_epoch: impl FnMut(&EpochMetrics),
) -> Result<TrainingReport> {
    request.training.validate()?;
    // データを読む前に入力サイズ・ドロップアウト率を検証
    ModelConfig::new(1)
        .with_dropout(request.dropout)
        .with_image_size(request.image_size)
        .validate()?;

    let training = &request.training;
    let (train_set, val_set) = load_splits(
        &request.train_dir,
        request.val_dir.as_deref(),
        training.train_ratio,
        training.seed,
    )?;

    let labels = train_set.registry().clone();
    let num_classes = labels.len();
    info!("クラス順序 ({}個): {}", num_classes, labels.labels().join(", "));

    let model_config = ModelConfig::new(num_classes)
        .with_dropout(request.dropout)
        .with_image_size(request.image_size);
    let model = model_config.init::<B>(device)?;
    info!(
        "モデル設定: {} クラス, 入力サイズ: {2}x{2}, dropout={1}, パラメータ数: {3}",
        num_classes,
        model_config.dropout,
        model_config.image_size,
        model.num_params()
    );

    let preprocessor = ImagePreprocessor::new(request.image_size);
    let mut train_batcher = LeafBatcher::<B>::new(device.clone(), preprocessor.clone(), num_classes);
    if request.augmentation.enabled {
        train_batcher = train_batcher.with_augmenter(Augmenter::from_settings(&request.augmentation));
    }
    let val_batcher = LeafBatcher::<B::InnerBackend>::new(device.clone(), preprocessor, num_classes);

    let train_loader = build_loader(train_batcher, train_set, training.batch_size, training.seed);
    let val_loader = build_loader(val_batcher, val_set, training.batch_size, training.seed);

    info!(
        "学習を開始します: エポック数 {}, バッチサイズ {}, 学習率 {}",
        training.num_epochs, training.batch_size, training.learning_rate
    );
    let (model, history) = train(model, train_loader, val_loader, training, on_epoch)?;

    let metadata = ModelMetadata::new(model_config, labels.clone(), history.len() as u32)
        .with_final_metrics(history.last().copied());
    let artifact_path = save_model(&request.output_path, &model.valid(), &metadata)?;

    Ok(TrainingReport {
        artifact_path,
        labels,
        history,
    })
}
