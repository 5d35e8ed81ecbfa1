use std::sync::Arc;

use log::{debug, warn};

use super::features::{self, FrameError, FrameStats, Grid};
use super::{ClassifierLoadError, FeatureLayout, Label, PositionModel, PositionSummary, SharedBodySide};
use crate::sensors::{PressureFrame, Stamped};

/// Frame-level classifier plus per-window majority vote.
///
/// The model is loaded once and shared; the body side is read on every frame
/// so a control message can change it between windows.
#[derive(Clone)]
pub struct PositionClassifier {
    layout: FeatureLayout,
    model: Arc<dyn PositionModel>,
    side: SharedBodySide,
}

impl PositionClassifier {
    pub fn new(
        layout: FeatureLayout,
        model: Arc<dyn PositionModel>,
        side: SharedBodySide,
    ) -> Result<Self, ClassifierLoadError> {
        if model.input_len() != layout.len() {
            return Err(ClassifierLoadError::Dimension {
                what: "model inputs vs feature list",
                expected: layout.len(),
                found: model.input_len(),
            });
        }
        Ok(Self {
            layout,
            model,
            side,
        })
    }

    pub fn side(&self) -> &SharedBodySide {
        &self.side
    }

    /// Label one frame. Unoccupied frames never reach the model.
    pub fn classify_frame(&self, frame: &PressureFrame) -> Result<Label, FrameError> {
        let grid = Grid::from_frame(frame);
        if FrameStats::of(&grid).is_unoccupied() {
            return Ok(Label::Empty);
        }

        let features = features::extract(&grid, self.side.get())?;
        self.model.predict(&self.layout.arrange(&features))
    }

    /// Tally every frame of a window. Failed frames are logged and excluded.
    pub fn classify_window(&self, frames: &[Stamped<PressureFrame>]) -> PositionSummary {
        let mut summary = PositionSummary::default();
        for (i, frame) in frames.iter().enumerate() {
            match self.classify_frame(&frame.value) {
                Ok(label) => summary.counts.add(label),
                Err(e) => {
                    summary.excluded += 1;
                    warn!("[position] frame {} excluded: {}", i, e);
                }
            }
        }
        summary.label = summary.counts.majority();
        debug!(
            "[position] {} frames -> {:?} ({} excluded)",
            frames.len(),
            summary.label,
            summary.excluded
        );
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::position::{BodySide, FEATURE_NAMES};
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingModel {
        calls: AtomicUsize,
        answer: Label,
    }

    impl PositionModel for CountingModel {
        fn input_len(&self) -> usize {
            FEATURE_NAMES.len()
        }

        fn predict(&self, _features: &[f64]) -> Result<Label, FrameError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.answer)
        }
    }

    struct FailingModel;

    impl PositionModel for FailingModel {
        fn input_len(&self) -> usize {
            FEATURE_NAMES.len()
        }

        fn predict(&self, _features: &[f64]) -> Result<Label, FrameError> {
            Err(FrameError::Scoring("boom".into()))
        }
    }

    fn full_layout() -> FeatureLayout {
        FeatureLayout::from_names(&FEATURE_NAMES).unwrap()
    }

    fn occupied() -> PressureFrame {
        PressureFrame::from_fn(|r, c| if (4..12).contains(&r) && (2..6).contains(&c) { 700 } else { 400 + (c as u16) })
    }

    fn saturated() -> PressureFrame {
        PressureFrame::from_fn(|r, c| if r == 0 && c == 0 { 5001 } else { 10 })
    }

    fn stamped(frames: Vec<PressureFrame>) -> Vec<Stamped<PressureFrame>> {
        frames.into_iter().map(|f| Stamped::new(Utc::now(), f)).collect()
    }

    #[test]
    fn test_gate_skips_model() {
        let model = Arc::new(CountingModel {
            calls: AtomicUsize::new(0),
            answer: Label::Supine,
        });
        let classifier =
            PositionClassifier::new(full_layout(), model.clone(), SharedBodySide::default()).unwrap();

        assert_eq!(classifier.classify_frame(&saturated()), Ok(Label::Empty));
        assert_eq!(model.calls.load(Ordering::SeqCst), 0);

        assert_eq!(classifier.classify_frame(&occupied()), Ok(Label::Supine));
        assert_eq!(model.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_gate_skips_model_on_spread_frames() {
        let model = Arc::new(CountingModel {
            calls: AtomicUsize::new(0),
            answer: Label::Supine,
        });
        let classifier =
            PositionClassifier::new(full_layout(), model.clone(), SharedBodySide::default()).unwrap();

        for high in [4000, 1000] {
            let patchy = PressureFrame::from_fn(|r, c| if (r + c) % 2 == 0 { high } else { 0 });
            assert_eq!(classifier.classify_frame(&patchy), Ok(Label::Empty));
        }
        assert_eq!(model.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_window_majority() {
        let model = Arc::new(CountingModel {
            calls: AtomicUsize::new(0),
            answer: Label::LateralLeft,
        });
        let classifier =
            PositionClassifier::new(full_layout(), model, SharedBodySide::new(BodySide::Left)).unwrap();

        let frames = stamped(vec![occupied(), saturated(), occupied(), occupied()]);
        let summary = classifier.classify_window(&frames);
        assert_eq!(summary.counts.lateral_left, 3);
        assert_eq!(summary.counts.empty, 1);
        assert_eq!(summary.label, Some(Label::LateralLeft));
        assert_eq!(summary.index(), Some(2));
    }

    #[test]
    fn test_failed_frames_excluded() {
        let classifier =
            PositionClassifier::new(full_layout(), Arc::new(FailingModel), SharedBodySide::default())
                .unwrap();
        let flat = PressureFrame::from_fn(|_, _| 100);

        let frames = stamped(vec![occupied(), flat, saturated()]);
        let summary = classifier.classify_window(&frames);
        assert_eq!(summary.excluded, 2);
        assert_eq!(summary.counts.total(), 1);
        assert_eq!(summary.label, Some(Label::Empty));
    }

    #[test]
    fn test_window_without_frames() {
        let classifier =
            PositionClassifier::new(full_layout(), Arc::new(FailingModel), SharedBodySide::default())
                .unwrap();
        let summary = classifier.classify_window(&[]);
        assert_eq!(summary.label, None);
        assert_eq!(summary.index(), None);
    }

    #[test]
    fn test_layout_must_match_model() {
        let layout = FeatureLayout::from_names(&["std"]).unwrap();
        assert!(PositionClassifier::new(layout, Arc::new(FailingModel), SharedBodySide::default()).is_err());
    }
}
