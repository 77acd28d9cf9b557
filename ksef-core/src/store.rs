//! Persistence seam for submission records and export checkpoints.
use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    sync::{Mutex, MutexGuard},
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    export::SyncState,
    submission::{Submission, SubmissionStatus},
};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("state file I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("state file is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("submission {0} does not exist")]
    UnknownSubmission(u64),
    #[error("submission {0} is accepted and can no longer change")]
    Immutable(u64),
    #[error("store lock poisoned")]
    Poisoned,
}

/// Result of [`SubmissionStore::claim`].
#[derive(Debug, Clone, PartialEq)]
pub enum Claim {
    /// The record was stored as the invoice's current attempt.
    Claimed(Submission),
    /// The invoice already has a PENDING or ACCEPTED record; nothing was written.
    Busy(Submission),
}

/// Durable storage for [`Submission`] records.
///
/// Implementations must make `claim` an atomic check-and-set.
pub trait SubmissionStore {
    /// Most recent record for the invoice.
    fn current(&self, invoice_id: &str) -> Result<Option<Submission>, StoreError>;

    fn get(&self, id: u64) -> Result<Option<Submission>, StoreError>;

    /// Store `record` unless the current record is PENDING or ACCEPTED.
    ///
    /// A record with id 0 starts a new lineage and is assigned an id.
    fn claim(&self, record: Submission) -> Result<Claim, StoreError>;

    /// Overwrite an existing record. Accepted records only take a UPO backfill.
    fn save(&self, record: &Submission) -> Result<(), StoreError>;

    fn list(&self) -> Result<Vec<Submission>, StoreError>;
}

/// Durable storage for export checkpoints, keyed by export type.
pub trait SyncStateStore {
    /// The stored state, or a fresh one for a type never seen before.
    fn load_sync_state(&self, export_type: &str) -> Result<SyncState, StoreError>;

    fn save_sync_state(&self, state: &SyncState) -> Result<(), StoreError>;
}

impl<T: SubmissionStore + ?Sized> SubmissionStore for &T {
    fn current(&self, invoice_id: &str) -> Result<Option<Submission>, StoreError> {
        (**self).current(invoice_id)
    }

    fn get(&self, id: u64) -> Result<Option<Submission>, StoreError> {
        (**self).get(id)
    }

    fn claim(&self, record: Submission) -> Result<Claim, StoreError> {
        (**self).claim(record)
    }

    fn save(&self, record: &Submission) -> Result<(), StoreError> {
        (**self).save(record)
    }

    fn list(&self) -> Result<Vec<Submission>, StoreError> {
        (**self).list()
    }
}

impl<T: SyncStateStore + ?Sized> SyncStateStore for &T {
    fn load_sync_state(&self, export_type: &str) -> Result<SyncState, StoreError> {
        (**self).load_sync_state(export_type)
    }

    fn save_sync_state(&self, state: &SyncState) -> Result<(), StoreError> {
        (**self).save_sync_state(state)
    }
}

/// Contents shared by both stores; the file store serializes it as-is.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct StoreData {
    #[serde(default)]
    next_id: u64,
    #[serde(default)]
    submissions: BTreeMap<u64, Submission>,
    #[serde(default)]
    sync_states: BTreeMap<String, SyncState>,
}

impl StoreData {
    fn current(&self, invoice_id: &str) -> Option<&Submission> {
        self.submissions
            .values()
            .filter(|record| record.invoice_id == invoice_id)
            .max_by_key(|record| record.id)
    }

    fn claim(&mut self, mut record: Submission) -> Result<Claim, StoreError> {
        if let Some(current) = self.current(&record.invoice_id) {
            if matches!(
                current.status,
                SubmissionStatus::Pending | SubmissionStatus::Accepted
            ) {
                return Ok(Claim::Busy(current.clone()));
            }
        }
        if record.id == 0 {
            self.next_id = self.next_id.max(self.submissions.keys().max().copied().unwrap_or(0)) + 1;
            record.id = self.next_id;
        } else if !self.submissions.contains_key(&record.id) {
            return Err(StoreError::UnknownSubmission(record.id));
        }
        self.submissions.insert(record.id, record.clone());
        Ok(Claim::Claimed(record))
    }

    fn save(&mut self, record: &Submission) -> Result<(), StoreError> {
        let stored = self
            .submissions
            .get(&record.id)
            .ok_or(StoreError::UnknownSubmission(record.id))?;
        if stored.status == SubmissionStatus::Accepted && !only_upo_changed(stored, record) {
            return Err(StoreError::Immutable(record.id));
        }
        self.submissions.insert(record.id, record.clone());
        Ok(())
    }

    fn sync_state(&self, export_type: &str) -> SyncState {
        self.sync_states
            .get(export_type)
            .cloned()
            .unwrap_or_else(|| SyncState::new(export_type))
    }
}

fn only_upo_changed(stored: &Submission, update: &Submission) -> bool {
    let mut expected = stored.clone();
    expected.upo_xml = update.upo_xml.clone();
    expected.updated_at = update.updated_at;
    expected == *update
}

/// In-process store for tests and embedding.
#[derive(Debug, Default)]
pub struct MemoryStore {
    data: Mutex<StoreData>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, StoreData>, StoreError> {
        self.data.lock().map_err(|_| StoreError::Poisoned)
    }
}

impl SubmissionStore for MemoryStore {
    fn current(&self, invoice_id: &str) -> Result<Option<Submission>, StoreError> {
        Ok(self.lock()?.current(invoice_id).cloned())
    }

    fn get(&self, id: u64) -> Result<Option<Submission>, StoreError> {
        Ok(self.lock()?.submissions.get(&id).cloned())
    }

    fn claim(&self, record: Submission) -> Result<Claim, StoreError> {
        self.lock()?.claim(record)
    }

    fn save(&self, record: &Submission) -> Result<(), StoreError> {
        self.lock()?.save(record)
    }

    fn list(&self) -> Result<Vec<Submission>, StoreError> {
        Ok(self.lock()?.submissions.values().cloned().collect())
    }
}

impl SyncStateStore for MemoryStore {
    fn load_sync_state(&self, export_type: &str) -> Result<SyncState, StoreError> {
        Ok(self.lock()?.sync_state(export_type))
    }

    fn save_sync_state(&self, state: &SyncState) -> Result<(), StoreError> {
        self.lock()?
            .sync_states
            .insert(state.export_type.clone(), state.clone());
        Ok(())
    }
}

/// JSON document on disk, re-read on every operation.
///
/// Writes go to a sibling temporary file that is renamed over the original. The in-process
/// mutex serializes read-modify-write cycles; separate processes sharing one file are not
/// coordinated.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    guard: Mutex<()>,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            guard: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read(&self) -> Result<StoreData, StoreError> {
        match fs::read(&self.path) {
            Ok(bytes) if bytes.iter().all(u8::is_ascii_whitespace) => Ok(StoreData::default()),
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(StoreData::default()),
            Err(err) => Err(err.into()),
        }
    }

    fn write(&self, data: &StoreData) -> Result<(), StoreError> {
        let json = serde_json::to_vec_pretty(data)?;
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    fn with_data<T>(
        &self,
        f: impl FnOnce(&mut StoreData) -> Result<(T, bool), StoreError>,
    ) -> Result<T, StoreError> {
        let _guard = self.guard.lock().map_err(|_| StoreError::Poisoned)?;
        let mut data = self.read()?;
        let (value, dirty) = f(&mut data)?;
        if dirty {
            self.write(&data)?;
        }
        Ok(value)
    }
}

impl SubmissionStore for FileStore {
    fn current(&self, invoice_id: &str) -> Result<Option<Submission>, StoreError> {
        self.with_data(|data| Ok((data.current(invoice_id).cloned(), false)))
    }

    fn get(&self, id: u64) -> Result<Option<Submission>, StoreError> {
        self.with_data(|data| Ok((data.submissions.get(&id).cloned(), false)))
    }

    fn claim(&self, record: Submission) -> Result<Claim, StoreError> {
        self.with_data(|data| {
            let claim = data.claim(record)?;
            let dirty = matches!(claim, Claim::Claimed(_));
            Ok((claim, dirty))
        })
    }

    fn save(&self, record: &Submission) -> Result<(), StoreError> {
        self.with_data(|data| Ok((data.save(record)?, true)))
    }

    fn list(&self) -> Result<Vec<Submission>, StoreError> {
        self.with_data(|data| Ok((data.submissions.values().cloned().collect(), false)))
    }
}

impl SyncStateStore for FileStore {
    fn load_sync_state(&self, export_type: &str) -> Result<SyncState, StoreError> {
        self.with_data(|data| Ok((data.sync_state(export_type), false)))
    }

    fn save_sync_state(&self, state: &SyncState) -> Result<(), StoreError> {
        self.with_data(|data| {
            data.sync_states
                .insert(state.export_type.clone(), state.clone());
            Ok(((), true))
        })
    }
}

/// Serde adapter storing optional bytes as base64 text.
pub(crate) mod base64_serde {
    use base64ct::{Base64, Encoding};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(bytes) => serializer.serialize_some(&Base64::encode_string(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Vec<u8>>, D::Error> {
        Option::<String>::deserialize(deserializer)?
            .map(|text| Base64::decode_vec(&text).map_err(serde::de::Error::custom))
            .transpose()
    }
}
