use anyhow::{Context, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::debug;

/// Embedded ordered keyed store backing approvals and the audit log.
///
/// Each bucket is one JSON document on disk, rewritten through a temp
/// file and an atomic rename on every mutation, so a crash never leaves
/// a half-written bucket behind. Keys within a bucket are ordered.
pub struct Store {
    dir: PathBuf,
    buckets: Mutex<HashMap<String, BTreeMap<String, serde_json::Value>>>,
}

impl Store {
    /// Open the store at `dir`, loading any bucket files already present.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create store directory {}", dir.display()))?;

        let mut buckets = HashMap::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let name = match path.file_stem().and_then(|s| s.to_str()) {
                Some(name) => name.to_string(),
                None => continue,
            };
            let raw = fs::read(&path)
                .with_context(|| format!("failed to read bucket {}", path.display()))?;
            let bucket: BTreeMap<String, serde_json::Value> = serde_json::from_slice(&raw)
                .with_context(|| format!("failed to decode bucket {}", path.display()))?;
            debug!("loaded bucket {:?} with {} records", name, bucket.len());
            buckets.insert(name, bucket);
        }

        Ok(Self {
            dir,
            buckets: Mutex::new(buckets),
        })
    }

    /// Insert or replace a record. The bucket is flushed to disk before
    /// the call returns.
    pub fn put<T: Serialize>(&self, bucket: &str, key: &str, value: &T) -> Result<()> {
        let encoded = serde_json::to_value(value).context("failed to encode record")?;

        let mut buckets = self.buckets.lock().unwrap();
        let entries = buckets.entry(bucket.to_string()).or_default();
        entries.insert(key.to_string(), encoded);
        self.flush(bucket, entries)
    }

    pub fn get<T: DeserializeOwned>(&self, bucket: &str, key: &str) -> Result<Option<T>> {
        let buckets = self.buckets.lock().unwrap();
        match buckets.get(bucket).and_then(|entries| entries.get(key)) {
            Some(value) => Ok(Some(
                serde_json::from_value(value.clone()).context("failed to decode record")?,
            )),
            None => Ok(None),
        }
    }

    /// Remove a record; returns whether it existed.
    pub fn delete(&self, bucket: &str, key: &str) -> Result<bool> {
        let mut buckets = self.buckets.lock().unwrap();
        let entries = match buckets.get_mut(bucket) {
            Some(entries) => entries,
            None => return Ok(false),
        };
        let existed = entries.remove(key).is_some();
        if existed {
            self.flush(bucket, entries)?;
        }
        Ok(existed)
    }

    /// Snapshot of a bucket, ordered by key.
    pub fn list<T: DeserializeOwned>(&self, bucket: &str) -> Result<Vec<(String, T)>> {
        let buckets = self.buckets.lock().unwrap();
        let entries = match buckets.get(bucket) {
            Some(entries) => entries,
            None => return Ok(Vec::new()),
        };

        let mut records = Vec::with_capacity(entries.len());
        for (key, value) in entries {
            let decoded =
                serde_json::from_value(value.clone()).context("failed to decode record")?;
            records.push((key.clone(), decoded));
        }
        Ok(records)
    }

    fn flush(&self, bucket: &str, entries: &BTreeMap<String, serde_json::Value>) -> Result<()> {
        let path = self.dir.join(format!("{}.json", bucket));
        let tmp = self.dir.join(format!(".{}.json.tmp", bucket));

        let encoded = serde_json::to_vec(entries).context("failed to encode bucket")?;
        {
            let mut file = fs::File::create(&tmp)
                .with_context(|| format!("failed to create {}", tmp.display()))?;
            file.write_all(&encoded)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &path)
            .with_context(|| format!("failed to replace bucket {}", path.display()))?;
        Ok(())
    }
}
