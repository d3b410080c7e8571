//! Persistent store of closing episodes, split into training and validation rows.
use crate::atomic::write_json_atomic;
use crate::episode::{Co2ClosingState, EpisodeOrigin};
use crate::error::DatasetError;
use aqua_traits::RandomSource;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::fs;
use std::path::{Path, PathBuf};

/// Row filter for queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatasetKind {
    Training,
    Validation,
    Any,
}

impl DatasetKind {
    fn accepts(self, validation: bool) -> bool {
        match self {
            DatasetKind::Training => !validation,
            DatasetKind::Validation => validation,
            DatasetKind::Any => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatasetRow {
    pub close_time: i64,
    pub origin: EpisodeOrigin,
    pub validation: bool,
    pub episode: Co2ClosingState,
}

/// Episode storage keyed by close time.
pub trait DatasetStore {
    /// Store a finalized episode. Fails with [`DatasetError::Duplicate`] when
    /// the close time is already present.
    fn insert(&mut self, episode: &Co2ClosingState, validation: bool) -> Result<(), DatasetError>;

    /// Move the given rows to the training split. Returns how many changed.
    fn mark_as_training(&mut self, close_times: &[i64]) -> Result<usize, DatasetError>;

    fn rows(&self, kind: DatasetKind) -> Result<Vec<DatasetRow>, DatasetError>;

    fn schema_version(&self) -> u32;

    fn find(&self, kind: DatasetKind) -> Result<Vec<Co2ClosingState>, DatasetError> {
        Ok(self.rows(kind)?.into_iter().map(|r| r.episode).collect())
    }

    fn close_times(&self, kind: DatasetKind) -> Result<Vec<i64>, DatasetError> {
        Ok(self.rows(kind)?.iter().map(|r| r.close_time).collect())
    }

    fn count(&self, kind: DatasetKind) -> Result<usize, DatasetError> {
        Ok(self.rows(kind)?.len())
    }
}

/// Upgrade steps, applied in order. Entry `i` moves the document from
/// version `i` to `i + 1`. Every step tolerates already-upgraded input.
const MIGRATIONS: &[fn(&mut Map<String, Value>)] =
    &[create_rows, backfill_origin, backfill_validation];

pub const SCHEMA_VERSION: u32 = MIGRATIONS.len() as u32;
const VERSION_KEY: &str = "schemaVersion";

fn create_rows(doc: &mut Map<String, Value>) {
    doc.entry("rows").or_insert_with(|| json!([]));
}

fn for_each_row(doc: &mut Map<String, Value>, f: impl Fn(&mut Map<String, Value>)) {
    if let Some(Value::Array(rows)) = doc.get_mut("rows") {
        for row in rows.iter_mut().filter_map(Value::as_object_mut) {
            f(row);
        }
    }
}

fn backfill_origin(doc: &mut Map<String, Value>) {
    for_each_row(doc, |row| {
        row.entry("origin").or_insert(json!(0));
    });
}

fn backfill_validation(doc: &mut Map<String, Value>) {
    for_each_row(doc, |row| {
        row.entry("validation").or_insert(json!(false));
    });
}

/// Bring `doc` up to [`SCHEMA_VERSION`]. Returns the version it started at.
pub fn migrate(doc: &mut Value) -> Result<u32, DatasetError> {
    let obj = doc
        .as_object_mut()
        .ok_or_else(|| DatasetError::Corrupt("top level is not an object".into()))?;
    let found = match obj.get(VERSION_KEY) {
        None => 0,
        Some(v) => v
            .as_u64()
            .and_then(|v| u32::try_from(v).ok())
            .ok_or_else(|| DatasetError::Corrupt(format!("bad {VERSION_KEY}: {v}")))?,
    };
    if found > SCHEMA_VERSION {
        return Err(DatasetError::UnsupportedVersion {
            found,
            supported: SCHEMA_VERSION,
        });
    }
    for (step, upgrade) in MIGRATIONS.iter().enumerate().skip(found as usize) {
        upgrade(obj);
        obj.insert(VERSION_KEY.into(), json!(step + 1));
        tracing::info!(version = step + 1, "dataset schema upgraded");
    }
    Ok(found)
}

/// In-memory rows shared by both store implementations.
#[derive(Debug, Default, Clone)]
struct Rows(Vec<DatasetRow>);

impl Rows {
    fn insert(&mut self, episode: &Co2ClosingState, validation: bool) -> Result<(), DatasetError> {
        if self.0.iter().any(|r| r.close_time == episode.close_time) {
            return Err(DatasetError::Duplicate(episode.close_time));
        }
        self.0.push(DatasetRow {
            close_time: episode.close_time,
            origin: episode.origin,
            validation,
            episode: episode.clone(),
        });
        Ok(())
    }

    /// Flip matching validation rows to training. Returns the flipped indices.
    fn mark_as_training(&mut self, close_times: &[i64]) -> Vec<usize> {
        let mut changed = Vec::new();
        for (i, row) in self.0.iter_mut().enumerate() {
            if row.validation && close_times.contains(&row.close_time) {
                row.validation = false;
                changed.push(i);
            }
        }
        changed
    }

    fn filtered(&self, kind: DatasetKind) -> Vec<DatasetRow> {
        self.0
            .iter()
            .filter(|r| kind.accepts(r.validation))
            .cloned()
            .collect()
    }
}

/// Test double and scratch store.
#[derive(Debug, Default, Clone)]
pub struct MemoryDatasetStore {
    rows: Rows,
}

impl MemoryDatasetStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DatasetStore for MemoryDatasetStore {
    fn insert(&mut self, episode: &Co2ClosingState, validation: bool) -> Result<(), DatasetError> {
        self.rows.insert(episode, validation)
    }

    fn mark_as_training(&mut self, close_times: &[i64]) -> Result<usize, DatasetError> {
        Ok(self.rows.mark_as_training(close_times).len())
    }

    fn rows(&self, kind: DatasetKind) -> Result<Vec<DatasetRow>, DatasetError> {
        Ok(self.rows.filtered(kind))
    }

    fn schema_version(&self) -> u32 {
        SCHEMA_VERSION
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DocumentOut<'a> {
    schema_version: u32,
    rows: &'a [DatasetRow],
}

/// JSON document on disk, rewritten atomically after every mutation.
#[derive(Debug)]
pub struct FileDatasetStore {
    path: PathBuf,
    rows: Rows,
}

impl FileDatasetStore {
    /// Open or create the document at `path`, applying pending upgrades.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, DatasetError> {
        let path = path.into();
        let mut doc = match fs::read(&path) {
            Ok(bytes) => serde_json::from_slice::<Value>(&bytes)
                .map_err(|e| DatasetError::Corrupt(e.to_string()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => json!({}),
            Err(source) => {
                return Err(DatasetError::Io {
                    path: path.display().to_string(),
                    source,
                });
            }
        };
        let found = migrate(&mut doc)?;
        let rows: Vec<DatasetRow> = serde_json::from_value(doc["rows"].take())
            .map_err(|e| DatasetError::Corrupt(e.to_string()))?;
        let store = Self {
            path,
            rows: Rows(rows),
        };
        if found != SCHEMA_VERSION {
            store.persist()?;
        }
        tracing::info!(
            path = %store.path.display(),
            rows = store.rows.0.len(),
            "dataset opened"
        );
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self) -> Result<(), DatasetError> {
        let doc = DocumentOut {
            schema_version: SCHEMA_VERSION,
            rows: &self.rows.0,
        };
        write_json_atomic(&self.path, &doc).map_err(|source| DatasetError::Io {
            path: self.path.display().to_string(),
            source,
        })
    }
}

impl DatasetStore for FileDatasetStore {
    // A failed write rolls memory back so it never runs ahead of the file.
    fn insert(&mut self, episode: &Co2ClosingState, validation: bool) -> Result<(), DatasetError> {
        self.rows.insert(episode, validation)?;
        if let Err(e) = self.persist() {
            self.rows.0.pop();
            return Err(e);
        }
        Ok(())
    }

    fn mark_as_training(&mut self, close_times: &[i64]) -> Result<usize, DatasetError> {
        let changed = self.rows.mark_as_training(close_times);
        if changed.is_empty() {
            return Ok(0);
        }
        if let Err(e) = self.persist() {
            for i in &changed {
                self.rows.0[*i].validation = true;
            }
            return Err(e);
        }
        Ok(changed.len())
    }

    fn rows(&self, kind: DatasetKind) -> Result<Vec<DatasetRow>, DatasetError> {
        Ok(self.rows.filtered(kind))
    }

    fn schema_version(&self) -> u32 {
        SCHEMA_VERSION
    }
}

/// Split parameters for [`insert_assigned`] and [`rebalance`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SplitPolicy {
    /// Share of rows meant for training, in `(0, 1]`.
    pub training_fraction: f64,
    /// Surplus validation rows tolerated before promotion kicks in.
    pub tolerance: usize,
}

impl Default for SplitPolicy {
    fn default() -> Self {
        Self {
            training_fraction: 0.9,
            tolerance: 20,
        }
    }
}

/// Insert with a Bernoulli draw deciding the split. Returns the validation flag used.
pub fn insert_assigned(
    store: &mut dyn DatasetStore,
    episode: &Co2ClosingState,
    policy: SplitPolicy,
    rng: &mut dyn RandomSource,
) -> Result<bool, DatasetError> {
    let validation = !rng.chance(policy.training_fraction);
    store.insert(episode, validation)?;
    Ok(validation)
}

pub fn expected_validation(total: usize, training_fraction: f64) -> usize {
    (total as f64 * (1.0 - training_fraction)).floor() as usize
}

/// Promote random validation rows to training when the validation split has
/// grown past its expected size by more than the tolerance. Rows only ever
/// move towards training. Returns the number promoted.
pub fn rebalance(
    store: &mut dyn DatasetStore,
    policy: SplitPolicy,
    rng: &mut dyn RandomSource,
) -> Result<usize, DatasetError> {
    let total = store.count(DatasetKind::Any)?;
    let mut validation = store.close_times(DatasetKind::Validation)?;
    let expected = expected_validation(total, policy.training_fraction);
    let surplus = validation.len().saturating_sub(expected);
    if surplus <= policy.tolerance {
        return Ok(0);
    }
    // Partial Fisher-Yates: the first `surplus` slots end up a uniform sample.
    for i in 0..surplus {
        let j = i + rng.index(validation.len() - i);
        validation.swap(i, j);
    }
    let promoted = store.mark_as_training(&validation[..surplus])?;
    tracing::info!(
        total,
        expected_validation = expected,
        promoted,
        "dataset rebalanced"
    );
    Ok(promoted)
}

/// Merge rows exported by another instance. Existing close times are skipped.
/// Returns `(imported, skipped)`.
pub fn import_rows(
    store: &mut dyn DatasetStore,
    rows: &[DatasetRow],
) -> Result<(usize, usize), DatasetError> {
    let (mut imported, mut skipped) = (0, 0);
    for row in rows {
        let mut episode = row.episode.clone();
        episode.origin = EpisodeOrigin::OtherInstance;
        match store.insert(&episode, row.validation) {
            Ok(()) => imported += 1,
            Err(DatasetError::Duplicate(_)) => skipped += 1,
            Err(e) => return Err(e),
        }
    }
    Ok((imported, skipped))
}

/// Rows from a dataset document on disk, upgraded to the current schema.
pub fn read_rows(path: &Path) -> Result<Vec<DatasetRow>, DatasetError> {
    let bytes = fs::read(path).map_err(|source| DatasetError::Io {
        path: path.display().to_string(),
        source,
    })?;
    let mut doc: Value =
        serde_json::from_slice(&bytes).map_err(|e| DatasetError::Corrupt(e.to_string()))?;
    migrate(&mut doc)?;
    serde_json::from_value(doc["rows"].take()).map_err(|e| DatasetError::Corrupt(e.to_string()))
}
