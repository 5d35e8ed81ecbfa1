use std::fs;
use std::path::{Path, PathBuf};

use log::info;
use serde::Serialize;
use thiserror::Error;

use crate::position::PositionSummary;
use crate::sensors::Timestamp;
use crate::signal::SignalAnalysis;
use crate::window::Window;

#[derive(Error, Debug)]
pub enum DumpError {
    #[error("debug dump I/O on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot encode debug record: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Host counters captured while a window was processed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct PerformanceCounters {
    pub processing_ms: f64,
    /// Windows still waiting after this one was popped.
    pub queue_depth: usize,
    /// Windows evicted from the processing queue since start.
    pub evicted_windows: u64,
}

#[derive(Serialize)]
struct DumpRecord<'a> {
    init_timestamp: Timestamp,
    finish_timestamp: Timestamp,
    raw: &'a Window,
    signals: &'a SignalAnalysis,
    position: &'a PositionSummary,
    performance: PerformanceCounters,
}

/// Per-window diagnostic files under `<root>/record_<n>/reg_<id>.json`.
///
/// `n` is chosen once per run.
#[derive(Debug, Clone)]
pub struct DebugDump {
    folder: PathBuf,
}

impl DebugDump {
    pub fn create(root: &Path) -> Result<Self, DumpError> {
        let io_err = |source| DumpError::Io {
            path: root.to_path_buf(),
            source,
        };
        fs::create_dir_all(root).map_err(io_err)?;

        let existing = fs::read_dir(root)
            .map_err(io_err)?
            .filter_map(Result::ok)
            .filter(|e| e.path().is_dir())
            .filter(|e| e.file_name().to_string_lossy().starts_with("record_"))
            .count();

        let folder = root.join(format!("record_{}", existing + 1));
        fs::create_dir_all(&folder).map_err(|source| DumpError::Io {
            path: folder.clone(),
            source,
        })?;
        info!("[dump] writing window diagnostics to {}", folder.display());
        Ok(Self { folder })
    }

    pub fn folder(&self) -> &Path {
        &self.folder
    }

    pub fn write(
        &self,
        window: &Window,
        signals: &SignalAnalysis,
        position: &PositionSummary,
        performance: PerformanceCounters,
    ) -> Result<PathBuf, DumpError> {
        let record = DumpRecord {
            init_timestamp: window.start(),
            finish_timestamp: window.end(),
            raw: window,
            signals,
            position,
            performance,
        };
        let path = self.folder.join(format!("reg_{}.json", window.id()));
        let body = serde_json::to_vec(&record)?;
        fs::write(&path, body).map_err(|source| DumpError::Io {
            path: path.clone(),
            source,
        })?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sensors::{MotionSample, SensorPayload};
    use crate::window::ActiveWindow;
    use chrono::Utc;

    #[test]
    fn test_unusable_root_reports_dump_error() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("not-a-dir");
        fs::write(&file, b"").unwrap();

        let err = DebugDump::create(&file).unwrap_err();
        assert!(matches!(err, DumpError::Io { ref path, .. } if path == &file));
        assert!(err.to_string().starts_with("debug dump I/O"));
    }

    #[test]
    fn test_folder_numbering_and_contents() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("record_1")).unwrap();

        let dump = DebugDump::create(dir.path()).unwrap();
        assert_eq!(dump.folder(), dir.path().join("record_2"));

        let now = Utc::now();
        let mut active = ActiveWindow::new(now);
        active.push(now, SensorPayload::Motion(MotionSample([0.5; 6])));
        let window = active.close(7, now);

        let path = dump
            .write(
                &window,
                &SignalAnalysis::default(),
                &PositionSummary::default(),
                PerformanceCounters {
                    processing_ms: 1.5,
                    queue_depth: 2,
                    evicted_windows: 0,
                },
            )
            .unwrap();
        assert!(path.ends_with("record_2/reg_7.json"));

        let json: serde_json::Value = serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        assert_eq!(json["raw"]["motion"].as_array().unwrap().len(), 1);
        assert_eq!(json["performance"]["queue_depth"], 2);
        assert!(json["signals"]["metrics"]["heart_rate"].is_null());
    }
}
