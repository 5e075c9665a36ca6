//! DetectionGate - Detector adapter and qualification filter
//!
//! ## Responsibilities
//!
//! - Invoke the external detector with a confidence threshold
//! - Filter raw detections to the configured target classes
//! - Convert detector failure into an explicit flag, never a crash and
//!   never a silent "no intruder"
//!
//! No retry lives here; the caller simply tries again next cycle.

mod http_detector;

pub use http_detector::{DetectorConfig, HttpDetector};

use crate::error::Result;
use crate::models::Detection;
use async_trait::async_trait;
use std::sync::Arc;

/// External detector contract
///
/// Constructed once at startup and injected; implementations raise on
/// I/O or model errors.
#[async_trait]
pub trait Detector: Send + Sync {
    async fn detect(&self, image: &[u8], confidence: f32) -> Result<Vec<Detection>>;
}

/// Gate configuration
#[derive(Debug, Clone)]
pub struct GateConfig {
    /// Classes that qualify for alerting (secondary classes such as
    /// "Animal" are monitored but never alert)
    pub target_classes: Vec<String>,
    /// Minimum qualifying confidence
    pub confidence_threshold: f32,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            target_classes: vec!["Human".to_string()],
            confidence_threshold: 0.5,
        }
    }
}

/// Result of one gate evaluation
#[derive(Debug, Clone, Default)]
pub struct GateOutcome {
    /// Detections in a target class at or above the threshold
    pub qualifying: Vec<Detection>,
    /// Everything the detector returned, for monitoring
    pub raw: Vec<Detection>,
    /// True when the detector itself failed; distinguishes "no detection"
    /// from "detector down" in audit logs
    pub detector_failed: bool,
}

impl GateOutcome {
    pub fn detected(&self) -> bool {
        !self.qualifying.is_empty()
    }

    /// Maximum confidence among qualifying detections
    pub fn max_confidence(&self) -> f32 {
        self.qualifying
            .iter()
            .map(|d| d.confidence)
            .fold(0.0, f32::max)
    }
}

/// DetectionGate instance
pub struct DetectionGate {
    detector: Arc<dyn Detector>,
    config: GateConfig,
}

impl DetectionGate {
    pub fn new(detector: Arc<dyn Detector>, config: GateConfig) -> Self {
        Self { detector, config }
    }

    /// Run detection on one frame and qualify the results
    pub async fn evaluate(&self, image: &[u8]) -> GateOutcome {
        let raw = match self
            .detector
            .detect(image, self.config.confidence_threshold)
            .await
        {
            Ok(detections) => detections,
            Err(e) => {
                tracing::error!(error = %e, "Detector invocation failed");
                return GateOutcome {
                    detector_failed: true,
                    ..Default::default()
                };
            }
        };

        let qualifying: Vec<Detection> = raw
            .iter()
            .filter(|d| {
                d.confidence >= self.config.confidence_threshold
                    && self
                        .config
                        .target_classes
                        .iter()
                        .any(|t| t == &d.class_name)
            })
            .cloned()
            .collect();

        tracing::debug!(
            raw_count = raw.len(),
            qualifying_count = qualifying.len(),
            "Detection gate evaluated"
        );

        GateOutcome {
            qualifying,
            raw,
            detector_failed: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    struct ScriptedDetector {
        result: std::result::Result<Vec<Detection>, ()>,
    }

    #[async_trait]
    impl Detector for ScriptedDetector {
        async fn detect(&self, _image: &[u8], _confidence: f32) -> Result<Vec<Detection>> {
            match &self.result {
                Ok(d) => Ok(d.clone()),
                Err(()) => Err(Error::Transient("inference endpoint unreachable".into())),
            }
        }
    }

    fn det(class: &str, confidence: f32) -> Detection {
        Detection {
            class_name: class.to_string(),
            confidence,
            bbox: None,
        }
    }

    fn gate(result: std::result::Result<Vec<Detection>, ()>) -> DetectionGate {
        DetectionGate::new(
            Arc::new(ScriptedDetector { result }),
            GateConfig::default(),
        )
    }

    #[tokio::test]
    async fn filters_to_target_classes() {
        let g = gate(Ok(vec![det("Human", 0.87), det("Animal", 0.92)]));
        let outcome = g.evaluate(b"jpeg").await;

        assert!(outcome.detected());
        assert_eq!(outcome.qualifying.len(), 1);
        assert_eq!(outcome.qualifying[0].class_name, "Human");
        assert_eq!(outcome.raw.len(), 2);
        assert!(!outcome.detector_failed);
    }

    #[tokio::test]
    async fn below_threshold_does_not_qualify() {
        let g = gate(Ok(vec![det("Human", 0.4)]));
        let outcome = g.evaluate(b"jpeg").await;
        assert!(!outcome.detected());
        assert_eq!(outcome.raw.len(), 1);
    }

    #[tokio::test]
    async fn detector_failure_is_flagged_not_a_negative() {
        let g = gate(Err(()));
        let outcome = g.evaluate(b"jpeg").await;
        assert!(!outcome.detected());
        assert!(outcome.detector_failed);
    }

    #[tokio::test]
    async fn max_confidence_over_multiple_qualifying() {
        let g = gate(Ok(vec![det("Human", 0.6), det("Human", 0.91)]));
        let outcome = g.evaluate(b"jpeg").await;
        assert_eq!(outcome.qualifying.len(), 2);
        assert!((outcome.max_confidence() - 0.91).abs() < f32::EPSILON);
    }
}
