//! Durable identity registry.
//!
//! The whole registry is one JSON document rewritten atomically on every
//! mutation. Mutations are serialized by a single writer lock held across
//! the read-modify-write cycle; readers take the last committed snapshot.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::deadline::Deadline;
use crate::error::{Error, Result};
use crate::persist;
use crate::photos::{PhotoArea, StagedPhotos};
use crate::types::Identity;

/// On-disk registry document: identities keyed by id, in insertion order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Registry {
    #[serde(default)]
    pub identities: IndexMap<String, Identity>,
}

impl Registry {
    pub fn load(path: &Path) -> Result<Self> {
        persist::read_json(path)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        persist::write_json_atomic(path, self)
    }

    /// Enforce the single-encoder invariant: every embedding shares the
    /// dimension and model version of the first enrolled identity.
    fn check_compatible(&self, candidate: &Identity) -> Result<()> {
        let embedding = &candidate.embedding;
        if embedding.values.is_empty() {
            return Err(Error::Validation("embedding must not be empty".into()));
        }
        let Some(reference) = self.identities.values().next() else {
            return Ok(());
        };
        let expected = &reference.embedding;
        if expected.dimension() != embedding.dimension() {
            return Err(Error::Validation(format!(
                "embedding dimension {} does not match registry dimension {}",
                embedding.dimension(),
                expected.dimension()
            )));
        }
        if expected.model_version != embedding.model_version {
            return Err(Error::Validation(format!(
                "embedding model {:?} does not match registry model {:?}",
                embedding.model_version, expected.model_version
            )));
        }
        Ok(())
    }
}

/// Point-in-time view of the registry. Iterating is lazy and can be
/// restarted; the view never changes after it is taken.
#[derive(Debug, Clone)]
pub struct Snapshot(Arc<Registry>);

impl Snapshot {
    pub fn iter(&self) -> indexmap::map::Values<'_, String, Identity> {
        self.0.identities.values()
    }

    pub fn get(&self, id: &str) -> Option<&Identity> {
        self.0.identities.get(id)
    }

    pub fn len(&self) -> usize {
        self.0.identities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.identities.is_empty()
    }
}

impl<'a> IntoIterator for &'a Snapshot {
    type Item = &'a Identity;
    type IntoIter = indexmap::map::Values<'a, String, Identity>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

pub struct IdentityStore {
    path: PathBuf,
    photos: PhotoArea,
    committed: RwLock<Arc<Registry>>,
    writer: Mutex<()>,
}

impl IdentityStore {
    /// Load the registry at `path` (missing = empty) and clear stale staging.
    pub fn open(path: impl Into<PathBuf>, photos: PhotoArea) -> Result<Self> {
        let path = path.into();
        let registry = Registry::load(&path)?;
        photos.sweep_staging()?;
        tracing::info!(
            path = %path.display(),
            identities = registry.identities.len(),
            "identity registry opened"
        );
        Ok(Self {
            path,
            photos,
            committed: RwLock::new(Arc::new(registry)),
            writer: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn photos(&self) -> &PhotoArea {
        &self.photos
    }

    pub fn list(&self) -> Snapshot {
        Snapshot(self.current())
    }

    pub fn get(&self, id: &str) -> Result<Identity> {
        self.current()
            .identities
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(id.to_string()))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.current().identities.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.current().identities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Insert a new identity and persist the registry.
    pub fn put(&self, identity: Identity) -> Result<()> {
        let _guard = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let mut next = self.prepare_insert(&identity)?;
        next.identities.insert(identity.id.clone(), identity);
        next.save(&self.path)?;
        self.publish(next);
        Ok(())
    }

    /// Commit an enrollment: move `staged` into the identity's photo
    /// directory, record the final photo paths and persist, all under the
    /// writer lock. Nothing is committed once `deadline` has passed; on any
    /// failure the staged photos are removed.
    pub fn put_staged(
        &self,
        mut identity: Identity,
        mut staged: StagedPhotos,
        deadline: Deadline,
    ) -> Result<Identity> {
        let _guard = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        deadline.check()?;
        let mut next = self.prepare_insert(&identity)?;

        let target = self.photos.identity_dir(&identity.id)?;
        identity.photos = staged.promote(&target)?;
        next.identities.insert(identity.id.clone(), identity.clone());

        if let Err(err) = next.save(&self.path) {
            if let Err(cleanup) = self.photos.remove_identity(&identity.id) {
                tracing::warn!(id = %identity.id, error = %cleanup, "failed to remove photos after aborted commit");
            }
            return Err(err);
        }
        self.publish(next);

        tracing::info!(id = %identity.id, photos = identity.photos.len(), "identity committed");
        Ok(identity)
    }

    /// Delete an identity and its photos. Returns the removed identity, or
    /// `None` if it was not enrolled.
    pub fn remove(&self, id: &str) -> Result<Option<Identity>> {
        let _guard = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let current = self.current();
        if !current.identities.contains_key(id) {
            return Ok(None);
        }

        let mut next = Registry::clone(&current);
        let removed = next.identities.shift_remove(id);
        next.save(&self.path)?;
        self.publish(next);

        if let Err(err) = self.photos.remove_identity(id) {
            tracing::warn!(id, error = %err, "identity removed but its photos could not be deleted");
        } else {
            tracing::info!(id, "identity removed");
        }
        Ok(removed)
    }

    /// Copy of the committed registry, ready to receive `identity`.
    /// Must be called with the writer lock held.
    fn prepare_insert(&self, identity: &Identity) -> Result<Registry> {
        self.photos.identity_dir(&identity.id)?;
        if identity.name.trim().is_empty() {
            return Err(Error::Validation("name must not be empty".into()));
        }

        let current = self.current();
        if current.identities.contains_key(&identity.id) {
            return Err(Error::DuplicateIdentity(identity.id.clone()));
        }
        current.check_compatible(identity)?;
        Ok(Registry::clone(&current))
    }

    fn current(&self) -> Arc<Registry> {
        self.committed
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn publish(&self, registry: Registry) {
        *self.committed.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(registry);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Embedding;
    use tempfile::TempDir;

    fn identity(id: &str, values: &[f32]) -> Identity {
        Identity {
            id: id.into(),
            name: format!("Student {id}"),
            embedding: Embedding::new(values.to_vec(), Some("test".into())),
            photos: vec![],
            registered_at: "2026-01-05T08:00:00Z".into(),
        }
    }

    fn open(tmp: &TempDir) -> IdentityStore {
        IdentityStore::open(
            tmp.path().join("students.json"),
            PhotoArea::new(tmp.path().join("images")),
        )
        .unwrap()
    }

    #[test]
    fn put_get_list() {
        let tmp = TempDir::new().unwrap();
        let store = open(&tmp);
        store.put(identity("S002", &[0.0, 1.0])).unwrap();
        store.put(identity("S001", &[1.0, 0.0])).unwrap();

        assert_eq!(store.get("S001").unwrap().name, "Student S001");
        let ids: Vec<_> = store.list().iter().map(|i| i.id.clone()).collect();
        assert_eq!(ids, vec!["S002", "S001"]);
        assert!(matches!(store.get("S404"), Err(Error::NotFound(_))));
    }

    #[test]
    fn duplicate_leaves_document_unchanged() {
        let tmp = TempDir::new().unwrap();
        let store = open(&tmp);
        store.put(identity("S001", &[1.0, 0.0])).unwrap();
        let before = std::fs::read(store.path()).unwrap();

        let mut impostor = identity("S001", &[0.0, 1.0]);
        impostor.name = "Someone Else".into();
        let err = store.put(impostor).unwrap_err();
        assert!(matches!(err, Error::DuplicateIdentity(ref id) if id == "S001"));

        assert_eq!(std::fs::read(store.path()).unwrap(), before);
        assert_eq!(store.get("S001").unwrap().name, "Student S001");
    }

    #[test]
    fn list_twice_is_identical() {
        let tmp = TempDir::new().unwrap();
        let store = open(&tmp);
        store.put(identity("A", &[1.0, 0.0])).unwrap();
        store.put(identity("B", &[0.0, 1.0])).unwrap();

        let first: Vec<Identity> = store.list().iter().cloned().collect();
        let second: Vec<Identity> = store.list().iter().cloned().collect();
        assert_eq!(first, second);
    }

    #[test]
    fn snapshot_is_not_affected_by_later_writes() {
        let tmp = TempDir::new().unwrap();
        let store = open(&tmp);
        store.put(identity("A", &[1.0, 0.0])).unwrap();

        let snapshot = store.list();
        store.put(identity("B", &[0.0, 1.0])).unwrap();
        store.remove("A").unwrap();

        assert_eq!(snapshot.len(), 1);
        assert!(snapshot.get("A").is_some());
        // Restartable.
        assert_eq!(snapshot.iter().count(), snapshot.iter().count());
        assert_eq!(store.list().len(), 1);
    }

    #[test]
    fn registry_survives_reopen() {
        let tmp = TempDir::new().unwrap();
        {
            let store = open(&tmp);
            store.put(identity("S001", &[1.0, 0.0])).unwrap();
            store.put(identity("S002", &[0.0, 1.0])).unwrap();
        }
        let store = open(&tmp);
        let ids: Vec<_> = store.list().iter().map(|i| i.id.clone()).collect();
        assert_eq!(ids, vec!["S001", "S002"]);
    }

    #[test]
    fn remove_returns_the_removed_identity() {
        let tmp = TempDir::new().unwrap();
        let store = open(&tmp);
        assert!(store.remove("ghost").unwrap().is_none());

        store.put(identity("S001", &[1.0, 0.0])).unwrap();
        let removed = store.remove("S001").unwrap().unwrap();
        assert_eq!(removed.id, "S001");
        assert!(store.is_empty());
        assert!(store.remove("S001").unwrap().is_none());
    }

    #[test]
    fn mismatched_embeddings_are_rejected() {
        let tmp = TempDir::new().unwrap();
        let store = open(&tmp);
        store.put(identity("S001", &[1.0, 0.0])).unwrap();

        let err = store.put(identity("S002", &[1.0, 0.0, 0.0])).unwrap_err();
        assert!(matches!(err, Error::Validation(ref m) if m.contains("dimension")));

        let mut other_model = identity("S003", &[1.0, 0.0]);
        other_model.embedding.model_version = Some("other".into());
        assert!(matches!(store.put(other_model), Err(Error::Validation(_))));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn unsafe_id_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let store = open(&tmp);
        assert!(matches!(
            store.put(identity("../escape", &[1.0])),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn put_staged_moves_photos_and_records_paths() {
        let tmp = TempDir::new().unwrap();
        let store = open(&tmp);
        let mut staged = store.photos().stage().unwrap();
        staged.save(1, "png", b"one").unwrap();
        staged.save(2, "png", b"two").unwrap();

        let committed = store
            .put_staged(identity("S001", &[1.0, 0.0]), staged, Deadline::none())
            .unwrap();

        let dir = store.photos().identity_dir("S001").unwrap();
        assert_eq!(committed.photos, vec![dir.join("photo1.png"), dir.join("photo2.png")]);
        assert!(committed.photos.iter().all(|p| p.exists()));
        assert_eq!(store.get("S001").unwrap(), committed);

        store.remove("S001").unwrap();
        assert!(!dir.exists());
    }

    #[test]
    fn put_staged_after_deadline_commits_nothing() {
        let tmp = TempDir::new().unwrap();
        let store = open(&tmp);
        let mut staged = store.photos().stage().unwrap();
        staged.save(1, "png", b"one").unwrap();
        let staging_dir = staged.dir().to_path_buf();

        let expired = Deadline::at(std::time::Instant::now());
        let err = store
            .put_staged(identity("S001", &[1.0, 0.0]), staged, expired)
            .unwrap_err();

        assert!(matches!(err, Error::DeadlineExceeded));
        assert!(store.is_empty());
        assert!(!staging_dir.exists());
        assert!(!store.photos().identity_dir("S001").unwrap().exists());
    }

    #[test]
    fn put_staged_removes_promoted_photos_when_save_fails() {
        let tmp = TempDir::new().unwrap();
        let store = open(&tmp);
        let mut staged = store.photos().stage().unwrap();
        staged.save(1, "png", b"one").unwrap();

        // A directory in place of the registry file makes the rename fail.
        std::fs::create_dir(store.path()).unwrap();
        std::fs::write(store.path().join("keep"), b"x").unwrap();

        let err = store
            .put_staged(identity("S001", &[1.0, 0.0]), staged, Deadline::none())
            .unwrap_err();

        assert!(matches!(err, Error::Storage { .. }));
        assert!(!store.photos().identity_dir("S001").unwrap().exists());
        let staging = store.photos().root().join(".staging");
        assert_eq!(std::fs::read_dir(staging).unwrap().count(), 0);
        assert!(matches!(store.get("S001"), Err(Error::NotFound(_))));
    }

    #[test]
    fn remove_succeeds_when_photo_cleanup_fails() {
        let tmp = TempDir::new().unwrap();
        let store = open(&tmp);
        store.put(identity("S001", &[1.0, 0.0])).unwrap();

        // A plain file where the photo directory should be cannot be removed as a tree.
        let dir = store.photos().identity_dir("S001").unwrap();
        std::fs::create_dir_all(store.photos().root()).unwrap();
        std::fs::write(&dir, b"not a directory").unwrap();

        let removed = store.remove("S001").unwrap();
        assert_eq!(removed.map(|i| i.id).as_deref(), Some("S001"));
        assert!(!store.contains("S001"));
        assert!(Registry::load(store.path()).unwrap().identities.is_empty());
    }

    #[test]
    fn concurrent_puts_lose_nothing() {
        let tmp = TempDir::new().unwrap();
        let store = open(&tmp);

        std::thread::scope(|s| {
            for n in 0..16 {
                let store = &store;
                s.spawn(move || store.put(identity(&format!("S{n:03}"), &[1.0, n as f32])).unwrap());
            }
        });

        assert_eq!(store.len(), 16);
        assert_eq!(Registry::load(store.path()).unwrap().identities.len(), 16);
    }

    #[test]
    fn unsynchronized_read_modify_write_loses_an_update() {
        // Two writers that each load, modify and save without the writer
        // lock: the second save silently discards the first insertion.
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("students.json");

        let mut first = Registry::load(&path).unwrap();
        let mut second = Registry::load(&path).unwrap();
        first.identities.insert("A".into(), identity("A", &[1.0, 0.0]));
        second.identities.insert("B".into(), identity("B", &[0.0, 1.0]));
        first.save(&path).unwrap();
        second.save(&path).unwrap();

        let after = Registry::load(&path).unwrap();
        assert_eq!(after.identities.len(), 1);
        assert!(!after.identities.contains_key("A"));
    }

    #[test]
    fn open_sweeps_interrupted_enrollments() {
        let tmp = TempDir::new().unwrap();
        let photos = PhotoArea::new(tmp.path().join("images"));
        let mut staged = photos.stage().unwrap();
        staged.save(1, "png", b"orphan").unwrap();
        let dir = staged.dir().to_path_buf();
        std::mem::forget(staged);

        let _store = open(&tmp);
        assert!(!dir.exists());
    }
}
