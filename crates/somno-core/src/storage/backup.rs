use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{Local, NaiveDate, NaiveDateTime};
use log::{debug, info, warn};
use thiserror::Error;

use crate::telemetry::TelemetryMessage;

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("backup I/O on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("cannot encode message: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("corrupt backup {}: {source}", .path.display())]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

fn io_err(path: &Path) -> impl FnOnce(io::Error) -> BackupError + '_ {
    move |source| BackupError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Undelivered messages on disk, one JSON file each.
///
/// Layout: `<root>/<YYYY-MM-DD>_<n>/<HH-MM-SS_micro>.json`. The session
/// folder for a date is picked on the first write of that date and reused
/// for the rest of the run.
#[derive(Debug)]
pub struct BackupStore {
    root: PathBuf,
    session: Option<(NaiveDate, PathBuf)>,
}

impl BackupStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            session: None,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Persist with the local wall clock.
    pub fn persist(&mut self, message: &TelemetryMessage) -> Result<PathBuf, BackupError> {
        self.persist_at(message, Local::now().naive_local())
    }

    pub fn persist_at(
        &mut self,
        message: &TelemetryMessage,
        now: NaiveDateTime,
    ) -> Result<PathBuf, BackupError> {
        let folder = self.session_folder(now.date())?;
        let body = serde_json::to_vec(message)?;

        let stem = now.format("%H-%M-%S_%6f").to_string();
        let mut path = folder.join(format!("{}.json", stem));
        let mut k = 1;
        while path.exists() {
            path = folder.join(format!("{}_{}.json", stem, k));
            k += 1;
        }

        // Readers only list `*.json`, so a torn write is never picked up.
        let partial = path.with_extension("json.tmp");
        fs::write(&partial, body).map_err(io_err(&partial))?;
        fs::rename(&partial, &path).map_err(io_err(&path))?;
        debug!("[backup] stored {}", path.display());
        Ok(path)
    }

    fn session_folder(&mut self, date: NaiveDate) -> Result<PathBuf, BackupError> {
        let cached = self
            .session
            .as_ref()
            .filter(|(d, _)| *d == date)
            .map(|(_, folder)| folder.clone());
        let folder = match cached {
            Some(folder) => folder,
            None => {
                let n = self
                    .sessions_for(date)?
                    .last()
                    .map_or(1, |(n, _)| n + 1);
                let folder = self.root.join(format!("{}_{}", date.format("%Y-%m-%d"), n));
                info!("[backup] new session folder {}", folder.display());
                self.session = Some((date, folder.clone()));
                folder
            }
        };
        fs::create_dir_all(&folder).map_err(io_err(&folder))?;
        Ok(folder)
    }

    /// Session folders of `date`, ordered by session number.
    fn sessions_for(&self, date: NaiveDate) -> Result<Vec<(u32, PathBuf)>, BackupError> {
        let prefix = format!("{}_", date.format("%Y-%m-%d"));
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_err(&self.root)(e)),
        };

        let mut sessions = Vec::new();
        for entry in entries {
            let entry = entry.map_err(io_err(&self.root))?;
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let name = entry.file_name();
            let Some(n) = name
                .to_str()
                .and_then(|s| s.strip_prefix(&prefix))
                .and_then(|s| s.parse::<u32>().ok())
            else {
                continue;
            };
            sessions.push((n, path));
        }
        sessions.sort_by_key(|(n, _)| *n);
        Ok(sessions)
    }

    /// Backups of `date`, oldest first.
    pub fn pending(&self, date: NaiveDate) -> Result<Vec<PathBuf>, BackupError> {
        let mut files = Vec::new();
        for (_, folder) in self.sessions_for(date)? {
            let mut names: Vec<PathBuf> = fs::read_dir(&folder)
                .map_err(io_err(&folder))?
                .filter_map(Result::ok)
                .map(|e| e.path())
                .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
                .collect();
            names.sort();
            files.extend(names);
        }
        Ok(files)
    }

    /// Session folders of any date other than `today` that still hold
    /// backups, with their file counts. The drain never reads them.
    pub fn stale_sessions(&self, today: NaiveDate) -> Result<Vec<(PathBuf, usize)>, BackupError> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_err(&self.root)(e)),
        };

        let mut stale = Vec::new();
        for entry in entries {
            let entry = entry.map_err(io_err(&self.root))?;
            let name = entry.file_name();
            let Some(date) = name
                .to_str()
                .and_then(|s| s.rsplit_once('_'))
                .filter(|(_, n)| n.parse::<u32>().is_ok())
                .and_then(|(d, _)| NaiveDate::parse_from_str(d, "%Y-%m-%d").ok())
            else {
                continue;
            };
            if date == today || !entry.path().is_dir() {
                continue;
            }
            let folder = entry.path();
            let count = fs::read_dir(&folder)
                .map_err(io_err(&folder))?
                .filter_map(Result::ok)
                .filter(|e| e.path().extension().is_some_and(|ext| ext == "json"))
                .count();
            if count > 0 {
                stale.push((folder, count));
            }
        }
        stale.sort();
        Ok(stale)
    }

    /// Backups of today's date.
    pub fn pending_today(&self) -> Result<Vec<PathBuf>, BackupError> {
        self.pending(Local::now().date_naive())
    }

    pub fn load(path: &Path) -> Result<TelemetryMessage, BackupError> {
        let raw = fs::read(path).map_err(io_err(path))?;
        serde_json::from_slice(&raw).map_err(|source| BackupError::Corrupt {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Delete a delivered backup.
    pub fn remove(path: &Path) -> Result<(), BackupError> {
        fs::remove_file(path).map_err(io_err(path))
    }

    /// Rename an unreadable backup to `*.json.bad` so it stops blocking the
    /// drain.
    pub fn quarantine(path: &Path) -> Result<PathBuf, BackupError> {
        let mut bad = path.as_os_str().to_owned();
        bad.push(".bad");
        let bad = PathBuf::from(bad);
        fs::rename(path, &bad).map_err(io_err(path))?;
        warn!("[backup] quarantined unreadable {}", bad.display());
        Ok(bad)
    }

    /// Remove session folders of `date` that hold no files at all.
    pub fn prune_empty(&self, date: NaiveDate) -> Result<usize, BackupError> {
        let mut removed = 0;
        for (_, folder) in self.sessions_for(date)? {
            let empty = fs::read_dir(&folder)
                .map_err(io_err(&folder))?
                .next()
                .is_none();
            if empty {
                fs::remove_dir(&folder).map_err(io_err(&folder))?;
                debug!("[backup] removed drained folder {}", folder.display());
                removed += 1;
            }
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::RecordData;
    use std::collections::BTreeMap;

    fn message(t: i64) -> TelemetryMessage {
        TelemetryMessage {
            client_id: "000001".into(),
            init: "0".into(),
            event: "0".into(),
            unix_time: t,
            data: RecordData {
                te: "21".into(),
                hu: "40".into(),
                hf: "".into(),
                bf: "".into(),
                no: "10".into(),
                ps: "3".into(),
                pm: BTreeMap::new(),
                sk: "1".into(),
                iq: BTreeMap::new(),
            },
        }
    }

    fn at(h: u32, m: u32, s: u32, micro: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 3, 14)
            .unwrap()
            .and_hms_micro_opt(h, m, s, micro)
            .unwrap()
    }

    #[test]
    fn test_layout_and_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = BackupStore::new(dir.path());

        let b = store.persist_at(&message(2), at(10, 0, 5, 0)).unwrap();
        let a = store.persist_at(&message(1), at(9, 59, 59, 999_999)).unwrap();

        assert_eq!(
            b,
            dir.path().join("2025-03-14_1").join("10-00-05_000000.json")
        );
        let pending = store.pending(at(0, 0, 0, 0).date()).unwrap();
        assert_eq!(pending, vec![a.clone(), b]);
        assert_eq!(BackupStore::load(&a).unwrap(), message(1));
    }

    #[test]
    fn test_name_collision_appends_suffix() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = BackupStore::new(dir.path());
        let when = at(8, 30, 0, 42);

        let first = store.persist_at(&message(1), when).unwrap();
        let second = store.persist_at(&message(2), when).unwrap();
        assert!(second.ends_with("08-30-00_000042_1.json"));

        let pending = store.pending(when.date()).unwrap();
        assert_eq!(pending, vec![first, second]);
    }

    #[test]
    fn test_new_run_gets_next_session_folder() {
        let dir = tempfile::tempdir().unwrap();
        let when = at(12, 0, 0, 0);

        let mut first_run = BackupStore::new(dir.path());
        let old = first_run.persist_at(&message(1), when).unwrap();

        let mut second_run = BackupStore::new(dir.path());
        let new = second_run.persist_at(&message(2), at(12, 0, 0, 1)).unwrap();
        assert!(new.starts_with(dir.path().join("2025-03-14_2")));

        // Session 1 drains before session 2 regardless of file names.
        assert_eq!(second_run.pending(when.date()).unwrap(), vec![old, new]);
    }

    #[test]
    fn test_remove_and_prune() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = BackupStore::new(dir.path());
        let when = at(1, 2, 3, 4);
        let path = store.persist_at(&message(1), when).unwrap();

        BackupStore::remove(&path).unwrap();
        assert_eq!(store.prune_empty(when.date()).unwrap(), 1);
        assert!(!dir.path().join("2025-03-14_1").exists());
        assert!(store.pending(when.date()).unwrap().is_empty());
    }

    #[test]
    fn test_corrupt_file_quarantined() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = BackupStore::new(dir.path());
        let when = at(1, 2, 3, 4);
        let path = store.persist_at(&message(1), when).unwrap();
        fs::write(&path, b"{ truncated").unwrap();

        assert!(matches!(
            BackupStore::load(&path),
            Err(BackupError::Corrupt { .. })
        ));
        let bad = BackupStore::quarantine(&path).unwrap();
        assert!(bad.to_string_lossy().ends_with(".json.bad"));
        assert!(store.pending(when.date()).unwrap().is_empty());
    }

    #[test]
    fn test_stale_sessions_lists_other_dates() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = BackupStore::new(dir.path());
        let today = at(0, 0, 0, 0).date();
        let yesterday = today.pred_opt().unwrap();

        store.persist_at(&message(1), at(9, 0, 0, 0)).unwrap();
        let mut old_run = BackupStore::new(dir.path());
        old_run.persist_at(&message(2), yesterday.and_hms_opt(23, 0, 0).unwrap()).unwrap();
        old_run.persist_at(&message(3), yesterday.and_hms_opt(23, 0, 1).unwrap()).unwrap();
        fs::create_dir(dir.path().join("2025-03-01_1")).unwrap();
        fs::create_dir(dir.path().join("notes")).unwrap();

        let stale = store.stale_sessions(today).unwrap();
        assert_eq!(stale, vec![(dir.path().join("2025-03-13_1"), 2)]);
        assert!(store.stale_sessions(yesterday).unwrap()[0].0.ends_with("2025-03-14_1"));
    }

    #[test]
    fn test_missing_root_has_nothing_pending() {
        let dir = tempfile::tempdir().unwrap();
        let store = BackupStore::new(dir.path().join("absent"));
        assert!(store.pending(at(0, 0, 0, 0).date()).unwrap().is_empty());
        assert!(store.stale_sessions(at(0, 0, 0, 0).date()).unwrap().is_empty());
    }
}
