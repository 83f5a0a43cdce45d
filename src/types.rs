use serde::{Deserialize, Serialize};

/// 1枚の画像の分類結果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionResult {
    pub label: String,
    pub class_index: usize,
    /// 最大確率 x 100（小数第2位に丸め）
    pub confidence: f64,
    /// クラスごとの確率（クラスID順、合計 1）
    pub probabilities: Vec<f32>,
}

/// 推論APIのレスポンス
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionResponse {
    pub disease: String,
    pub confidence: f64,
    pub description: String,
    pub treatment: String,
}

impl DetectionResponse {
    pub fn from_prediction(prediction: &PredictionResult) -> Self {
        let disease = prediction.label.clone();
        Self {
            description: format!(
                "Prediction: **{}** with {}% confidence.",
                disease, prediction.confidence
            ),
            treatment: format!("Consult an expert for the treatment of {}.", disease),
            confidence: prediction.confidence,
            disease,
        }
    }
}

// エポックごとの学習指標
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EpochMetrics {
    pub epoch: usize,
    pub train_loss: f64,
    pub train_accuracy: f64,
    pub val_loss: f64,
    pub val_accuracy: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detection_response_text() {
        let prediction = PredictionResult {
            label: "Tomato_Late_blight".to_string(),
            class_index: 3,
            confidence: 97.25,
            probabilities: vec![],
        };
        let response = DetectionResponse::from_prediction(&prediction);
        assert_eq!(response.disease, "Tomato_Late_blight");
        assert_eq!(
            response.description,
            "Prediction: **Tomato_Late_blight** with 97.25% confidence."
        );
        assert_eq!(
            response.treatment,
            "Consult an expert for the treatment of Tomato_Late_blight."
        );
    }
}
