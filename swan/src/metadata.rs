// Copyright (c) Facebook, Inc. and its affiliates.
//! Experiment metadata store.
//!
//! `FileStore` keeps one JSON table per relation under a directory:
//! `experiment.json`, `phase.json`, `measurement.json` and `metadata.json`.
//! Every table is rewritten through a staging file and renamed into place.
//! A `LOCK` file holding the owner's pid makes the session exclusive
//! across processes and a mutex serializes calls within the process.
use anyhow::{bail, Context, Result};
use log::{debug, info, warn};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::error::SwanError;
use swan_intf::{ExperimentRecord, MeasurementRecord, MetadataEntry, MetadataKind, PhaseRecord};
use swan_util::conf::{self, Flag};
use swan_util::*;

const LOCK_FILE: &str = "LOCK";
const INITIAL_BACKOFF: Duration = Duration::from_millis(100);

lazy_static::lazy_static! {
    static ref STORE_PATH: Flag<String> = conf::string_flag(
        "metadata_store_path",
        "Directory of the experiment metadata tables",
        "./experiments/metadata",
    );
    static ref CONNECTION_TIMEOUT: Flag<Duration> = conf::duration_flag(
        "metadata_connection_timeout",
        "Upper bound on the time spent opening the metadata store",
        Duration::from_secs(10),
    );
    static ref CONNECTION_RETRIES: Flag<i64> = conf::int_flag(
        "metadata_connection_retries",
        "Number of attempts to open the metadata store",
        5,
    );
    static ref ENV_PREFIX: Flag<String> = conf::string_flag(
        "metadata_env_prefix",
        "Environment variables with this prefix are recorded with the experiment",
        "SWAN_",
    );
}

pub fn register_flags() {
    lazy_static::initialize(&STORE_PATH);
    lazy_static::initialize(&CONNECTION_TIMEOUT);
    lazy_static::initialize(&CONNECTION_RETRIES);
    lazy_static::initialize(&ENV_PREFIX);
}

pub trait MetadataStore: Send + Sync {
    /// Inserts or replaces the experiment row. Nested phases are ignored.
    fn record_experiment(&self, exp: &ExperimentRecord) -> Result<()>;

    /// Inserts or replaces the phase row. Nested measurements are ignored.
    fn record_phase(&self, phase: &PhaseRecord) -> Result<()>;

    fn record_measurement(&self, measurement: &MeasurementRecord) -> Result<()>;

    fn record_map(
        &self,
        experiment_id: &str,
        kind: MetadataKind,
        map: BTreeMap<String, String>,
    ) -> Result<()>;

    fn record(&self, experiment_id: &str, key: &str, value: &str, kind: MetadataKind) -> Result<()> {
        let mut map = BTreeMap::new();
        map.insert(key.to_string(), value.to_string());
        self.record_map(experiment_id, kind, map)
    }

    /// The single metadata map of `kind`. Zero or several rows are an error.
    fn get_by_kind(&self, experiment_id: &str, kind: MetadataKind)
        -> Result<BTreeMap<String, String>>;

    /// The experiment with its phases and their measurements sorted by load.
    fn get_experiment(&self, id: &str) -> Result<ExperimentRecord>;

    /// Drops every row of the experiment.
    fn clear(&self, experiment_id: &str) -> Result<()>;
}

pub type MetadataStoreRef = Arc<dyn MetadataStore>;

/// Stores the experiment row and every nested phase and measurement.
pub fn save_experiment(store: &dyn MetadataStore, exp: &ExperimentRecord) -> Result<()> {
    store.record_experiment(exp)?;
    for phase in exp.phases.iter() {
        store.record_phase(phase)?;
        for m in phase.measurements.iter() {
            store.record_measurement(m)?;
        }
    }
    Ok(())
}

/// Environment variables starting with `prefix`.
pub fn environ_with_prefix(prefix: &str) -> BTreeMap<String, String> {
    std::env::vars()
        .filter(|(k, _)| k.starts_with(prefix))
        .collect()
}

pub fn environ_from_flags() -> BTreeMap<String, String> {
    environ_with_prefix(&ENV_PREFIX.value())
}

#[derive(Debug, Serialize, Deserialize)]
struct Table<T> {
    rows: Vec<T>,
}

impl<T> Default for Table<T> {
    fn default() -> Self {
        Self { rows: vec![] }
    }
}

impl<T: DeserializeOwned> JsonLoad for Table<T> {}
impl<T: Serialize> JsonSave for Table<T> {}

#[derive(Debug)]
struct Session {
    dir: PathBuf,
}

impl Session {
    fn table_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.json", name))
    }

    fn read<T: DeserializeOwned + Serialize>(&self, name: &str) -> Result<Vec<T>> {
        let path = self.table_path(name);
        Ok(Table::<T>::load_or_default(&path)
            .map_err(|e| SwanError::Metadata(format!("loading {:?}: {:#}", &path, &e)))?
            .rows)
    }

    /// Loads the table, lets `update` modify the rows and commits.
    fn update<T, F>(&self, name: &str, update: F) -> Result<()>
    where
        T: DeserializeOwned + Serialize,
        F: FnOnce(&mut Vec<T>),
    {
        let path = self.table_path(name);
        let mut file = JsonReportFile::<Table<T>>::open(&path)
            .map_err(|e| SwanError::Metadata(format!("loading {:?}: {:#}", &path, &e)))?;
        update(&mut file.data.rows);
        file.commit()
            .map_err(|e| SwanError::Metadata(format!("writing {:?}: {:#}", &path, &e)))?;
        Ok(())
    }
}

fn pid_alive(pid: i32) -> bool {
    let rc = unsafe { libc::kill(pid, 0) };
    rc == 0 || io::Error::last_os_error().raw_os_error() != Some(libc::ESRCH)
}

/// Takes the lock file. Returns false if another live process holds it.
fn try_lock(dir: &Path) -> Result<bool> {
    let path = dir.join(LOCK_FILE);
    match fs::OpenOptions::new().write(true).create_new(true).open(&path) {
        Ok(mut f) => {
            write!(f, "{}", std::process::id())?;
            Ok(true)
        }
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
            let owner = read_one_line(&path)
                .ok()
                .and_then(|s| s.trim().parse::<i32>().ok());
            match owner {
                Some(pid) if pid_alive(pid) => Ok(false),
                _ => {
                    warn!("metadata: Removing stale lock {:?} ({:?})", &path, owner);
                    fs::remove_file(&path)?;
                    Ok(false)
                }
            }
        }
        Err(e) => Err(e).with_context(|| format!("creating {:?}", &path)),
    }
}

#[derive(Debug)]
pub struct FileStore {
    session: Mutex<Session>,
}

impl FileStore {
    /// Opens the store at `dir`, retrying up to `retries` times with an
    /// exponential backoff from 100ms bounded by `timeout`. A path which
    /// is not a directory fails right away.
    pub fn open(dir: &Path, retries: u32, timeout: Duration) -> Result<Self> {
        if let Ok(md) = fs::metadata(dir) {
            if !md.is_dir() {
                bail!(SwanError::Config(format!(
                    "metadata store path {:?} is not a directory",
                    dir
                )));
            }
        }

        let started_at = Instant::now();
        let mut backoff = INITIAL_BACKOFF;
        let mut last_err = String::from("no attempt made");
        for attempt in 0..retries.max(1) {
            let res = fs::create_dir_all(dir)
                .with_context(|| format!("creating {:?}", dir))
                .and_then(|_| try_lock(dir));
            match res {
                Ok(true) => {
                    debug!("metadata: Opened {:?} after {} attempts", dir, attempt + 1);
                    return Ok(Self {
                        session: Mutex::new(Session {
                            dir: dir.to_path_buf(),
                        }),
                    });
                }
                Ok(false) => last_err = format!("{:?} is locked by another process", dir),
                Err(e) => last_err = format!("{:#}", &e),
            }
            let elapsed = started_at.elapsed();
            if elapsed + backoff > timeout {
                break;
            }
            warn!("metadata: Failed to open store ({}), retrying in {:?}", &last_err, backoff);
            if wait_prog_state(backoff) == ProgState::Exiting {
                last_err = "interrupted".into();
                break;
            }
            backoff *= 2;
        }
        bail!(SwanError::Metadata(format!(
            "cannot open {:?}: {}",
            dir, &last_err
        )))
    }

    pub fn open_from_flags() -> Result<Self> {
        let retries = CONNECTION_RETRIES.value().max(1) as u32;
        Self::open(
            Path::new(&STORE_PATH.value()),
            retries,
            CONNECTION_TIMEOUT.value(),
        )
    }
}

impl Drop for FileStore {
    fn drop(&mut self) {
        if let Ok(session) = self.session.lock() {
            let path = session.dir.join(LOCK_FILE);
            if let Err(e) = fs::remove_file(&path) {
                warn!("metadata: Failed to remove {:?} ({})", &path, &e);
            }
        }
    }
}

impl MetadataStore for FileStore {
    fn record_experiment(&self, exp: &ExperimentRecord) -> Result<()> {
        let row = exp.row();
        self.session
            .lock()
            .unwrap()
            .update::<ExperimentRecord, _>("experiment", |rows| {
                rows.retain(|r| r.id != row.id);
                rows.push(row);
            })
    }

    fn record_phase(&self, phase: &PhaseRecord) -> Result<()> {
        let row = PhaseRecord {
            measurements: vec![],
            ..phase.clone()
        };
        self.session
            .lock()
            .unwrap()
            .update::<PhaseRecord, _>("phase", |rows| {
                rows.retain(|r| !(r.experiment_id == row.experiment_id && r.id == row.id));
                rows.push(row);
            })
    }

    fn record_measurement(&self, measurement: &MeasurementRecord) -> Result<()> {
        let row = measurement.clone();
        self.session
            .lock()
            .unwrap()
            .update::<MeasurementRecord, _>("measurement", |rows| {
                rows.retain(|r| r.key() != row.key());
                rows.push(row);
            })
    }

    fn record_map(
        &self,
        experiment_id: &str,
        kind: MetadataKind,
        map: BTreeMap<String, String>,
    ) -> Result<()> {
        let entry = MetadataEntry::new(experiment_id, kind, map);
        self.session
            .lock()
            .unwrap()
            .update::<MetadataEntry, _>("metadata", |rows| {
                rows.push(entry);
                rows.sort_by(|a, b| {
                    (&a.experiment_id, b.time_uuid).cmp(&(&b.experiment_id, a.time_uuid))
                });
            })
    }

    fn get_by_kind(
        &self,
        experiment_id: &str,
        kind: MetadataKind,
    ) -> Result<BTreeMap<String, String>> {
        let rows = self
            .session
            .lock()
            .unwrap()
            .read::<MetadataEntry>("metadata")?;
        let mut matches: Vec<MetadataEntry> = rows
            .into_iter()
            .filter(|r| r.experiment_id == experiment_id && r.kind == kind)
            .collect();
        if matches.len() != 1 {
            bail!(SwanError::Metadata(format!(
                "expected exactly one {:?} metadata row for {}, found {}",
                kind.as_str(),
                experiment_id,
                matches.len()
            )));
        }
        Ok(matches.remove(0).map)
    }

    fn get_experiment(&self, id: &str) -> Result<ExperimentRecord> {
        let session = self.session.lock().unwrap();
        let mut exps: Vec<ExperimentRecord> = session
            .read::<ExperimentRecord>("experiment")?
            .into_iter()
            .filter(|r| r.id == id)
            .collect();
        if exps.len() != 1 {
            bail!(SwanError::Metadata(format!(
                "expected exactly one experiment {}, found {}",
                id,
                exps.len()
            )));
        }
        let mut exp = exps.remove(0);

        for phase in session.read::<PhaseRecord>("phase")?.into_iter() {
            if phase.experiment_id == id {
                exp.add_phase(phase);
            }
        }
        for m in session.read::<MeasurementRecord>("measurement")?.into_iter() {
            if m.experiment_id != id {
                continue;
            }
            if exp.phase_mut(&m.phase_id).is_none() {
                warn!("metadata: Measurement without phase {:?}", &m.phase_id);
                exp.add_phase(PhaseRecord {
                    experiment_id: id.to_string(),
                    id: m.phase_id.clone(),
                    ..Default::default()
                });
            }
            if let Some(phase) = exp.phase_mut(&m.phase_id) {
                phase.add_measurement(m);
            }
        }
        for phase in exp.phases.iter_mut() {
            phase.sort_measurements();
        }
        Ok(exp)
    }

    fn clear(&self, experiment_id: &str) -> Result<()> {
        let session = self.session.lock().unwrap();
        session.update::<ExperimentRecord, _>("experiment", |rows| {
            rows.retain(|r| r.id != experiment_id)
        })?;
        session.update::<PhaseRecord, _>("phase", |rows| {
            rows.retain(|r| r.experiment_id != experiment_id)
        })?;
        session.update::<MeasurementRecord, _>("measurement", |rows| {
            rows.retain(|r| r.experiment_id != experiment_id)
        })?;
        session.update::<MetadataEntry, _>("metadata", |rows| {
            rows.retain(|r| r.experiment_id != experiment_id)
        })?;
        info!("metadata: Cleared experiment {}", experiment_id);
        Ok(())
    }
}
