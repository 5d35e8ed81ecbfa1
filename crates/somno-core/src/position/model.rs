use std::fs;
use std::path::{Path, PathBuf};

use log::info;
use serde::Deserialize;
use thiserror::Error;

use super::Label;
use super::features::{FEATURE_NAMES, FeatureVector, FrameError};

#[derive(Error, Debug)]
pub enum ClassifierLoadError {
    #[error("cannot read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid model artifact {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("feature list is empty")]
    EmptyFeatureList,
    #[error("unknown feature {0:?}")]
    UnknownFeature(String),
    #[error("model has no classes")]
    NoClasses,
    #[error("{what}: expected {expected}, found {found}")]
    Dimension {
        what: &'static str,
        expected: usize,
        found: usize,
    },
}

/// Scoring function over an arranged feature vector.
pub trait PositionModel: Send + Sync {
    /// Number of inputs the model expects.
    fn input_len(&self) -> usize;

    fn predict(&self, features: &[f64]) -> Result<Label, FrameError>;
}

/// Order in which extracted features are fed to the model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeatureLayout {
    indices: Vec<usize>,
}

/// Alternative spellings accepted in feature lists.
const FEATURE_ALIASES: [(&str, &str); 2] = [("simetria", "symmetry"), ("simetría", "symmetry")];

fn canonical_feature(name: &str) -> String {
    let lower = name.to_lowercase();
    FEATURE_ALIASES
        .iter()
        .find(|(alias, _)| *alias == lower)
        .map_or(lower, |(_, canonical)| canonical.to_string())
}

impl FeatureLayout {
    /// Layout from feature names, matched case-insensitively. Known aliases
    /// such as `Simetria` resolve to their canonical name.
    pub fn from_names<S: AsRef<str>>(names: &[S]) -> Result<Self, ClassifierLoadError> {
        if names.is_empty() {
            return Err(ClassifierLoadError::EmptyFeatureList);
        }
        let indices = names
            .iter()
            .map(|name| {
                let name = name.as_ref();
                let wanted = canonical_feature(name);
                FEATURE_NAMES
                    .iter()
                    .position(|&n| n == wanted)
                    .ok_or_else(|| ClassifierLoadError::UnknownFeature(name.to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { indices })
    }

    /// Parse a feature-list file.
    ///
    /// The first line starting with `[` is read as a bracketed list of quoted
    /// names. Without one, every non-empty line not starting with `#` is a
    /// name.
    pub fn parse(text: &str) -> Result<Self, ClassifierLoadError> {
        if let Some(line) = text.lines().map(str::trim).find(|l| l.starts_with('[')) {
            let inner = line.trim_start_matches('[').trim_end_matches(']');
            let names: Vec<&str> = inner
                .split(',')
                .map(|n| n.trim().trim_matches(|c| c == '\'' || c == '"'))
                .filter(|n| !n.is_empty())
                .collect();
            return Self::from_names(names.as_slice());
        }

        let names: Vec<&str> = text
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.starts_with('#'))
            .collect();
        Self::from_names(names.as_slice())
    }

    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    pub fn arrange(&self, features: &FeatureVector) -> Vec<f64> {
        self.indices.iter().map(|&i| features.0[i]).collect()
    }
}

/// One-vs-rest linear scorer: the class with the highest
/// `coefficients[k] . x + intercepts[k]` wins, ties to the first.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct LinearModel {
    classes: Vec<Label>,
    coefficients: Vec<Vec<f64>>,
    intercepts: Vec<f64>,
}

impl LinearModel {
    pub fn new(
        classes: Vec<Label>,
        coefficients: Vec<Vec<f64>>,
        intercepts: Vec<f64>,
    ) -> Result<Self, ClassifierLoadError> {
        let model = Self {
            classes,
            coefficients,
            intercepts,
        };
        model.validate()?;
        Ok(model)
    }

    fn validate(&self) -> Result<(), ClassifierLoadError> {
        if self.classes.is_empty() {
            return Err(ClassifierLoadError::NoClasses);
        }
        let n = self.classes.len();
        for (what, found) in [
            ("coefficient rows", self.coefficients.len()),
            ("intercepts", self.intercepts.len()),
        ] {
            if found != n {
                return Err(ClassifierLoadError::Dimension {
                    what,
                    expected: n,
                    found,
                });
            }
        }
        let width = self.coefficients[0].len();
        if let Some(row) = self.coefficients.iter().find(|r| r.len() != width) {
            return Err(ClassifierLoadError::Dimension {
                what: "coefficient columns",
                expected: width,
                found: row.len(),
            });
        }
        Ok(())
    }
}

impl PositionModel for LinearModel {
    fn input_len(&self) -> usize {
        self.coefficients.first().map_or(0, Vec::len)
    }

    fn predict(&self, features: &[f64]) -> Result<Label, FrameError> {
        if features.len() != self.input_len() {
            return Err(FrameError::Scoring(format!(
                "expected {} features, got {}",
                self.input_len(),
                features.len()
            )));
        }

        let mut best: Option<(f64, Label)> = None;
        for ((row, intercept), &label) in self
            .coefficients
            .iter()
            .zip(&self.intercepts)
            .zip(&self.classes)
        {
            let score = row.iter().zip(features).map(|(w, x)| w * x).sum::<f64>() + intercept;
            if !score.is_finite() {
                return Err(FrameError::Scoring(format!("score for {} is not finite", label)));
            }
            if best.is_none_or(|(s, _)| score > s) {
                best = Some((score, label));
            }
        }
        best.map(|(_, label)| label)
            .ok_or_else(|| FrameError::Scoring("model has no classes".into()))
    }
}

/// Load the model artifact and its feature list, checking they agree.
pub fn load_linear_model(
    model_path: &Path,
    features_path: &Path,
) -> Result<(FeatureLayout, LinearModel), ClassifierLoadError> {
    let text = fs::read_to_string(features_path).map_err(|source| ClassifierLoadError::Io {
        path: features_path.to_path_buf(),
        source,
    })?;
    let layout = FeatureLayout::parse(&text)?;

    let raw = fs::read(model_path).map_err(|source| ClassifierLoadError::Io {
        path: model_path.to_path_buf(),
        source,
    })?;
    let model: LinearModel =
        serde_json::from_slice(&raw).map_err(|source| ClassifierLoadError::Parse {
            path: model_path.to_path_buf(),
            source,
        })?;
    model.validate()?;

    if model.input_len() != layout.len() {
        return Err(ClassifierLoadError::Dimension {
            what: "model inputs vs feature list",
            expected: layout.len(),
            found: model.input_len(),
        });
    }

    info!(
        "[position] loaded model {} ({} classes, {} features)",
        model_path.display(),
        model.classes.len(),
        layout.len()
    );
    Ok((layout, model))
}
