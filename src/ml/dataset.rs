//! 学習データの読み込み
//!
//! クラスごとにサブディレクトリを持つフォルダ構成から、画像パスとクラスIDの組を収集します。
//! 画像そのものはバッチ作成時に読み込みます（オンデマンド読み込み）。

use std::path::{Path, PathBuf};
use std::sync::Arc;

use burn::data::dataloader::{batcher::Batcher, DataLoader, DataLoaderBuilder};
use burn::tensor::{backend::Backend, Int, Tensor};
use burn_dataset::Dataset;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use tracing::{debug, info, warn};

use crate::error::{ClassifierError, Result};
use crate::ml::augmentation::Augmenter;
use crate::ml::ml_model::IMAGE_SIZE;
use crate::ml::preprocess::ImagePreprocessor;
use crate::model::label_registry::LabelRegistry;

/// 画像として扱う拡張子
pub const IMAGE_EXTENSIONS: [&str; 4] = ["png", "jpg", "jpeg", "bmp"];

/// データセットアイテム（画像パスのみ保持）
#[derive(Clone, Debug)]
pub struct LeafItem {
    pub path: PathBuf,
    pub label: usize,
}

/// クラスディレクトリ構成の画像データセット
#[derive(Clone, Debug)]
pub struct ImageFolder {
    root: PathBuf,
    registry: LabelRegistry,
    samples: Vec<LeafItem>,
}

/// `root` 直下のサブディレクトリ名（= クラス名）をソートして返す
pub fn discover_classes(root: &Path) -> Result<Vec<String>> {
    if !root.is_dir() {
        return Err(ClassifierError::NoClasses(root.to_path_buf()));
    }

    let mut classes = Vec::new();
    for entry in std::fs::read_dir(root)? {
        let path = entry?.path();
        if !path.is_dir() {
            continue;
        }
        match path.file_name().and_then(|n| n.to_str()) {
            Some(name) => classes.push(name.to_string()),
            None => warn!("UTF-8でないディレクトリ名をスキップします: {}", path.display()),
        }
    }

    if classes.is_empty() {
        return Err(ClassifierError::NoClasses(root.to_path_buf()));
    }
    // バイト順（作成順・ファイルシステムの列挙順に依存しない）
    classes.sort();
    Ok(classes)
}

fn has_image_extension(path: &Path) -> bool {
    path.extension()
        .map(|ext| ext.to_string_lossy().to_lowercase())
        .is_some_and(|ext| IMAGE_EXTENSIONS.contains(&ext.as_str()))
}

/// 最後までデコードできる画像か
///
/// ヘッダーだけ正しく本体が壊れたファイルも、ここで除外します。
fn is_readable_image(path: &Path, decoder: &ImagePreprocessor) -> bool {
    match decoder.decode_file(path) {
        Ok(_) => true,
        Err(e) => {
            debug!("読み込めない画像をスキップします {}: {}", path.display(), e);
            false
        }
    }
}

/// クラスディレクトリ内の読み込み可能な画像パスを収集（ソート済み）
fn collect_images(class_dir: &Path, decoder: &ImagePreprocessor) -> Result<Vec<PathBuf>> {
    let mut paths = Vec::new();
    for entry in std::fs::read_dir(class_dir)? {
        let path = entry?.path();
        if path.is_file() && has_image_extension(&path) && is_readable_image(&path, decoder) {
            paths.push(path);
        }
    }
    paths.sort();
    Ok(paths)
}

impl ImageFolder {
    /// ディレクトリから学習データを読み込む
    ///
    /// クラスIDはサブディレクトリ名のソート順で割り当てます。
    pub fn open(root: &Path) -> Result<Self> {
        let classes = discover_classes(root)?;
        let registry = LabelRegistry::new(classes)?;
        Self::open_with_registry(root, registry)
    }

    /// 指定されたレジストリの順序でディレクトリから読み込む
    ///
    /// いずれかのクラスに読み込み可能な画像が1枚もない場合は `EmptyDataset`。
    pub fn open_with_registry(root: &Path, registry: LabelRegistry) -> Result<Self> {
        let mut samples = Vec::new();
        // デコード可否の確認のみ（出力サイズは使わない）
        let decoder = ImagePreprocessor::new(IMAGE_SIZE);

        for (class_id, class_name) in registry.labels().iter().enumerate() {
            let class_dir = root.join(class_name);
            let images = if class_dir.is_dir() {
                collect_images(&class_dir, &decoder)?
            } else {
                Vec::new()
            };
            if images.is_empty() {
                return Err(ClassifierError::EmptyDataset {
                    class: class_name.clone(),
                    path: class_dir,
                });
            }
            samples.extend(images.into_iter().map(|path| LeafItem { path, label: class_id }));
        }

        let folder = Self {
            root: root.to_path_buf(),
            registry,
            samples,
        };
        folder.log_summary();
        Ok(folder)
    }

    fn log_summary(&self) {
        info!(
            "{} から {} クラス, {} 枚を読み込みました",
            self.root.display(),
            self.registry.len(),
            self.samples.len()
        );
        for (class_id, (name, count)) in self.class_counts().into_iter().enumerate() {
            debug!("  クラス {}: {} ({} 枚)", class_id, name, count);
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn registry(&self) -> &LabelRegistry {
        &self.registry
    }

    pub fn num_classes(&self) -> usize {
        self.registry.len()
    }

    pub fn samples(&self) -> &[LeafItem] {
        &self.samples
    }

    /// クラスごとの枚数（クラスID順）
    pub fn class_counts(&self) -> Vec<(String, usize)> {
        let mut counts = vec![0usize; self.registry.len()];
        for item in &self.samples {
            counts[item.label] += 1;
        }
        self.registry.labels().iter().cloned().zip(counts).collect()
    }

    /// データセットを学習用と検証用に分割（シード付きシャッフル）
    ///
    /// 2枚以上あれば両方に少なくとも1枚ずつ割り当てます。レジストリは共有します。
    pub fn split(self, train_ratio: f32, seed: u64) -> (Self, Self) {
        let mut samples = self.samples;
        let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
        samples.shuffle(&mut rng);

        let total_len = samples.len();
        let mut train_len = (total_len as f32 * train_ratio) as usize;
        if total_len >= 2 {
            train_len = train_len.clamp(1, total_len - 1);
        }
        let val_samples = samples.split_off(train_len.min(total_len));

        let train = Self {
            root: self.root.clone(),
            registry: self.registry.clone(),
            samples,
        };
        let val = Self {
            root: self.root,
            registry: self.registry,
            samples: val_samples,
        };
        (train, val)
    }
}

impl Dataset<LeafItem> for ImageFolder {
    fn get(&self, index: usize) -> Option<LeafItem> {
        self.samples.get(index).cloned()
    }

    fn len(&self) -> usize {
        self.samples.len()
    }
}

/// 学習用・検証用データセットを用意する
///
/// 検証ディレクトリがあればクラス数と順序が学習側と一致することを確認し、
/// なければ学習ディレクトリを `train_ratio` で分割します。
pub fn load_splits(
    train_dir: &Path,
    val_dir: Option<&Path>,
    train_ratio: f32,
    seed: u64,
) -> Result<(ImageFolder, ImageFolder)> {
    let train = ImageFolder::open(train_dir)?;

    match val_dir {
        Some(val_dir) => {
            let val_classes = discover_classes(val_dir)?;
            let val_registry = LabelRegistry::new(val_classes)?;
            train.registry().ensure_same_classes(&val_registry)?;
            let val = ImageFolder::open_with_registry(val_dir, val_registry)?;
            Ok((train, val))
        }
        None => {
            let (train, val) = train.split(train_ratio, seed);
            info!(
                "検証ディレクトリがないため学習データを分割しました: 学習 {} 枚 / 検証 {} 枚",
                train.len(),
                val.len()
            );
            Ok((train, val))
        }
    }
}

/// データセット構成のレポート
#[derive(Debug, Clone)]
pub struct SplitReport {
    pub root: PathBuf,
    pub class_counts: Vec<(String, usize)>,
}

impl SplitReport {
    fn from_folder(folder: &ImageFolder) -> Self {
        Self {
            root: folder.root().to_path_buf(),
            class_counts: folder.class_counts(),
        }
    }

    pub fn num_classes(&self) -> usize {
        self.class_counts.len()
    }

    pub fn total(&self) -> usize {
        self.class_counts.iter().map(|(_, count)| count).sum()
    }
}

#[derive(Debug, Clone)]
pub struct DatasetReport {
    pub train: SplitReport,
    pub validation: Option<SplitReport>,
}

impl DatasetReport {
    pub fn log(&self) {
        for (name, split) in std::iter::once(("train", &self.train))
            .chain(self.validation.as_ref().map(|v| ("validation", v)))
        {
            info!(
                "[{}] {}: {} クラス, {} 枚",
                name,
                split.root.display(),
                split.num_classes(),
                split.total()
            );
            for (class, count) in &split.class_counts {
                info!("  {:<40} {:>6}", class, count);
            }
        }
    }
}

/// データセットの健全性チェック（学習は行わない）
pub fn check_dataset(train_dir: &Path, val_dir: Option<&Path>) -> Result<DatasetReport> {
    let train = ImageFolder::open(train_dir)?;
    let validation = match val_dir {
        Some(val_dir) => {
            let val_registry = LabelRegistry::new(discover_classes(val_dir)?)?;
            train.registry().ensure_same_classes(&val_registry)?;
            Some(SplitReport::from_folder(&ImageFolder::open_with_registry(val_dir, val_registry)?))
        }
        None => None,
    };

    Ok(DatasetReport {
        train: SplitReport::from_folder(&train),
        validation,
    })
}

/// バッチデータ
#[derive(Clone, Debug)]
pub struct LeafBatch<B: Backend> {
    /// 画像 [batch_size, 3, size, size]
    pub images: Tensor<B, 4>,
    /// one-hotラベル [batch_size, num_classes]
    pub labels: Tensor<B, 2>,
    /// クラスID [batch_size]
    pub targets: Tensor<B, 1, Int>,
    /// 読み込みに失敗した画像（パスと理由）。空でないバッチは学習に使わない
    pub failures: Vec<(PathBuf, String)>,
}

impl<B: Backend> LeafBatch<B> {
    /// 読み込みに失敗した画像があればエラー
    pub fn ensure_complete(&self) -> Result<()> {
        match self.failures.first() {
            Some((path, reason)) => Err(ClassifierError::UnreadableTrainingImage {
                path: path.clone(),
                reason: reason.clone(),
                count: self.failures.len(),
            }),
            None => Ok(()),
        }
    }
}

/// バッチャー
#[derive(Clone, Debug)]
pub struct LeafBatcher<B: Backend> {
    device: B::Device,
    preprocessor: ImagePreprocessor,
    num_classes: usize,
    augmenter: Option<Augmenter>,
}

impl<B: Backend> LeafBatcher<B> {
    pub fn new(device: B::Device, preprocessor: ImagePreprocessor, num_classes: usize) -> Self {
        Self {
            device,
            preprocessor,
            num_classes,
            augmenter: None,
        }
    }

    /// データ拡張を有効にする（学習用バッチャーのみ）
    pub fn with_augmenter(mut self, augmenter: Augmenter) -> Self {
        self.augmenter = Some(augmenter);
        self
    }

    fn load_item(&self, item: &LeafItem, rng: &mut impl rand::Rng) -> std::result::Result<Vec<f32>, ClassifierError> {
        let bytes = self.preprocessor.read_file(&item.path)?;
        let tensor = match &self.augmenter {
            Some(augmenter) => self.preprocessor.preprocess_augmented(&bytes, augmenter, rng)?,
            None => self.preprocessor.preprocess(&bytes)?,
        };
        Ok(tensor.data().to_vec())
    }
}

impl<B: Backend> Batcher<B, LeafItem, LeafBatch<B>> for LeafBatcher<B> {
    fn batch(&self, items: Vec<LeafItem>, _device: &B::Device) -> LeafBatch<B> {
        let batch_size = items.len();
        let size = self.preprocessor.image_size();
        let pixels_per_image = size * size * 3;

        let mut all_pixels = Vec::with_capacity(batch_size * pixels_per_image);
        let mut one_hot = vec![0.0f32; batch_size * self.num_classes];
        let mut targets_vec = Vec::with_capacity(batch_size);
        let mut failures = Vec::new();
        let mut rng = rand::thread_rng();

        for (i, item) in items.iter().enumerate() {
            match self.load_item(item, &mut rng) {
                Ok(image_data) => all_pixels.extend_from_slice(&image_data),
                Err(e) => {
                    // Batcherはエラーを返せないため、形状だけ埋めて失敗を記録する
                    warn!("画像読み込み失敗 {}: {}", item.path.display(), e);
                    all_pixels.extend(std::iter::repeat(0.0f32).take(pixels_per_image));
                    failures.push((item.path.clone(), e.to_string()));
                }
            }
            one_hot[i * self.num_classes + item.label] = 1.0;
            targets_vec.push(item.label as i64);
        }

        // HWC -> CHW
        let images = Tensor::<B, 1>::from_floats(all_pixels.as_slice(), &self.device)
            .reshape([batch_size, size, size, 3])
            .permute([0, 3, 1, 2]);
        let labels = Tensor::<B, 1>::from_floats(one_hot.as_slice(), &self.device)
            .reshape([batch_size, self.num_classes]);
        let targets = Tensor::<B, 1, Int>::from_ints(targets_vec.as_slice(), &self.device);

        LeafBatch {
            images,
            labels,
            targets,
            failures,
        }
    }
}

/// データローダー作成（num_workers=0でオンデマンド読み込み、エポックごとにシード付きシャッフル）
pub fn build_loader<B: Backend>(
    batcher: LeafBatcher<B>,
    dataset: ImageFolder,
    batch_size: usize,
    seed: u64,
) -> Arc<dyn DataLoader<B, LeafBatch<B>>> {
    DataLoaderBuilder::new(batcher)
        .batch_size(batch_size)
        .shuffle(seed)
        .num_workers(0)
        .build(dataset)
}
