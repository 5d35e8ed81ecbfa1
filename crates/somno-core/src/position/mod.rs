//! Sleep position from pressure-mat frames
//!
//! Each frame goes through a cheap occupancy gate, then feature extraction
//! and a pluggable [`PositionModel`]. Frame labels are tallied per window
//! and the majority wins.

mod classifier;
pub mod features;
mod model;

pub use classifier::*;
pub use features::{FEATURE_NAMES, FeatureVector, FrameError};
pub use model::*;

use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Sleep position label.
///
/// Discriminants are the indices reported on the wire and also the tie-break
/// priority of the majority vote (lower wins).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Label {
    Empty = 0,
    LateralRight = 1,
    LateralLeft = 2,
    Supine = 3,
}

impl Label {
    pub const ALL: [Label; 4] = [
        Label::Empty,
        Label::LateralRight,
        Label::LateralLeft,
        Label::Supine,
    ];

    pub fn index(self) -> u8 {
        self as u8
    }

    pub fn from_index(index: u8) -> Option<Self> {
        Self::ALL.get(usize::from(index)).copied()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Label::Empty => "empty",
            Label::LateralRight => "lateral_right",
            Label::LateralLeft => "lateral_left",
            Label::Supine => "supine",
        }
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-label frame counts for one window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelCounts {
    pub empty: u32,
    pub lateral_right: u32,
    pub lateral_left: u32,
    pub supine: u32,
}

impl LabelCounts {
    pub fn add(&mut self, label: Label) {
        *self.slot(label) += 1;
    }

    pub fn get(&self, label: Label) -> u32 {
        match label {
            Label::Empty => self.empty,
            Label::LateralRight => self.lateral_right,
            Label::LateralLeft => self.lateral_left,
            Label::Supine => self.supine,
        }
    }

    pub fn total(&self) -> u32 {
        self.empty + self.lateral_right + self.lateral_left + self.supine
    }

    /// Most frequent label, `None` when nothing was counted.
    ///
    /// Ties go to the label with the lower index.
    pub fn majority(&self) -> Option<Label> {
        if self.total() == 0 {
            return None;
        }
        let mut best = Label::Empty;
        for label in Label::ALL {
            if self.get(label) > self.get(best) {
                best = label;
            }
        }
        Some(best)
    }

    fn slot(&mut self, label: Label) -> &mut u32 {
        match label {
            Label::Empty => &mut self.empty,
            Label::LateralRight => &mut self.lateral_right,
            Label::LateralLeft => &mut self.lateral_left,
            Label::Supine => &mut self.supine,
        }
    }
}

/// Position result for one window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PositionSummary {
    pub counts: LabelCounts,
    /// Majority label, `None` for a window without usable frames.
    pub label: Option<Label>,
    /// Frames dropped because feature extraction or scoring failed.
    pub excluded: u32,
}

impl PositionSummary {
    pub fn index(&self) -> Option<u8> {
        self.label.map(Label::index)
    }
}

/// Which side of the bed the mat is installed on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BodySide {
    Left,
    #[default]
    Right,
}

impl BodySide {
    /// Accepts `L`, `R`, `left` and `right` in any case.
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "l" | "left" => Some(Self::Left),
            "r" | "right" => Some(Self::Right),
            _ => None,
        }
    }
}

/// Body side shared between the classifier and the control-message handler.
#[derive(Debug, Clone, Default)]
pub struct SharedBodySide(Arc<RwLock<BodySide>>);

impl SharedBodySide {
    pub fn new(side: BodySide) -> Self {
        Self(Arc::new(RwLock::new(side)))
    }

    pub fn get(&self) -> BodySide {
        *self.0.read()
    }

    pub fn set(&self, side: BodySide) {
        *self.0.write() = side;
    }
}
