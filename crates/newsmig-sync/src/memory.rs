//! In-memory [`Persistence`] for tests and dry runs.
//!
//! A unit of work clones the committed state on `begin` and publishes its
//! working copy on `commit`. Savepoints are snapshots of the working copy.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use newsmig_core::{Asset, AssetId, ContentAssetLink, ContentId, ContentRecord};

use crate::persistence::{Persistence, PersistenceError, UnitOfWork};

#[derive(Debug, Clone, Default)]
struct MemoryState {
    contents: BTreeMap<ContentId, ContentRecord>,
    assets: Vec<Asset>,
    links: Vec<ContentAssetLink>,
}

impl MemoryState {
    fn with_links(&self, mut record: ContentRecord) -> ContentRecord {
        record.asset_ids = self
            .links
            .iter()
            .filter(|link| link.content_id == record.id)
            .map(|link| link.asset_id)
            .collect();
        record
    }

    fn next_asset_id(&self) -> AssetId {
        self.assets.iter().map(|a| a.id).max().unwrap_or(0) + 1
    }
}

#[derive(Debug, Default)]
struct Faults {
    commits: usize,
    commits_allowed: Option<usize>,
    failing_updates: HashSet<ContentId>,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryPersistence {
    state: Arc<Mutex<MemoryState>>,
    faults: Arc<Mutex<Faults>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Linked asset ids on the record are ignored; use [`Self::seed_link`].
    pub fn seed_content(&self, record: ContentRecord) {
        let mut record = record;
        record.asset_ids.clear();
        lock(&self.state).contents.insert(record.id, record);
    }

    pub fn seed_asset(&self, file_name: &str) -> Asset {
        let mut state = lock(&self.state);
        let now = Utc::now();
        let asset = Asset {
            id: state.next_asset_id(),
            file_name: file_name.to_string(),
            created_at: now,
            created_by_id: newsmig_core::DEFAULT_AUDIT_USER_ID,
            updated_at: now,
            updated_by_id: newsmig_core::DEFAULT_AUDIT_USER_ID,
        };
        state.assets.push(asset.clone());
        asset
    }

    pub fn seed_link(&self, content_id: ContentId, asset_id: AssetId) {
        lock(&self.state).links.push(ContentAssetLink {
            content_id,
            asset_id,
        });
    }

    /// The first `allowed` commits succeed; every later one fails.
    pub fn fail_commits_after(&self, allowed: usize) {
        lock(&self.faults).commits_allowed = Some(allowed);
    }

    pub fn fail_updates_for(&self, content_id: ContentId) {
        lock(&self.faults).failing_updates.insert(content_id);
    }

    pub fn commits(&self) -> usize {
        lock(&self.faults).commits
    }

    pub fn content(&self, id: ContentId) -> Option<ContentRecord> {
        let state = lock(&self.state);
        state
            .contents
            .get(&id)
            .cloned()
            .map(|record| state.with_links(record))
    }

    /// Committed records in id order.
    pub fn contents(&self) -> Vec<ContentRecord> {
        let state = lock(&self.state);
        state
            .contents
            .values()
            .cloned()
            .map(|record| state.with_links(record))
            .collect()
    }

    pub fn assets(&self) -> Vec<Asset> {
        lock(&self.state).assets.clone()
    }

    pub fn links(&self) -> Vec<ContentAssetLink> {
        lock(&self.state).links.clone()
    }
}

#[async_trait]
impl Persistence for MemoryPersistence {
    async fn begin(&self) -> Result<Box<dyn UnitOfWork>, PersistenceError> {
        let working = lock(&self.state).clone();
        Ok(Box::new(MemoryUnitOfWork {
            shared: self.clone(),
            working,
            savepoints: Vec::new(),
        }))
    }
}

pub struct MemoryUnitOfWork {
    shared: MemoryPersistence,
    working: MemoryState,
    savepoints: Vec<(String, MemoryState)>,
}

impl MemoryUnitOfWork {
    fn savepoint_index(&self, name: &str) -> Result<usize, PersistenceError> {
        self.savepoints
            .iter()
            .rposition(|(existing, _)| existing == name)
            .ok_or_else(|| PersistenceError::Message(format!("savepoint {name} does not exist")))
    }
}

#[async_trait]
impl UnitOfWork for MemoryUnitOfWork {
    async fn count_contents(&mut self) -> Result<u64, PersistenceError> {
        Ok(self.working.contents.len() as u64)
    }

    async fn fetch_contents(
        &mut self,
        offset: u64,
        limit: u64,
    ) -> Result<Vec<ContentRecord>, PersistenceError> {
        let offset = usize::try_from(offset).unwrap_or(usize::MAX);
        let limit = usize::try_from(limit).unwrap_or(usize::MAX);
        Ok(self
            .working
            .contents
            .values()
            .rev()
            .skip(offset)
            .take(limit)
            .cloned()
            .map(|record| self.working.with_links(record))
            .collect())
    }

    async fn find_asset_by_file_name(
        &mut self,
        file_name: &str,
    ) -> Result<Option<Asset>, PersistenceError> {
        Ok(self
            .working
            .assets
            .iter()
            .find(|asset| asset.file_name == file_name)
            .cloned())
    }

    async fn insert_asset(
        &mut self,
        file_name: &str,
        audit_user_id: i64,
        at: DateTime<Utc>,
    ) -> Result<Asset, PersistenceError> {
        if self.working.assets.iter().any(|a| a.file_name == file_name) {
            return Err(PersistenceError::DuplicateAsset(file_name.to_string()));
        }
        let asset = Asset {
            id: self.working.next_asset_id(),
            file_name: file_name.to_string(),
            created_at: at,
            created_by_id: audit_user_id,
            updated_at: at,
            updated_by_id: audit_user_id,
        };
        self.working.assets.push(asset.clone());
        Ok(asset)
    }

    async fn insert_link(&mut self, link: ContentAssetLink) -> Result<(), PersistenceError> {
        if self.working.links.contains(&link) {
            return Err(PersistenceError::DuplicateLink(link));
        }
        if !self.working.contents.contains_key(&link.content_id) {
            return Err(PersistenceError::Message(format!(
                "content {} does not exist",
                link.content_id
            )));
        }
        if !self.working.assets.iter().any(|a| a.id == link.asset_id) {
            return Err(PersistenceError::Message(format!(
                "asset {} does not exist",
                link.asset_id
            )));
        }
        self.working.links.push(link);
        Ok(())
    }

    async fn update_content(&mut self, record: &ContentRecord) -> Result<(), PersistenceError> {
        if lock(&self.shared.faults).failing_updates.contains(&record.id) {
            return Err(PersistenceError::Message(format!(
                "injected update failure for content {}",
                record.id
            )));
        }
        let stored = self
            .working
            .contents
            .get_mut(&record.id)
            .ok_or_else(|| {
                PersistenceError::Message(format!("content {} no longer exists", record.id))
            })?;
        stored.text = record.text.clone();
        stored.metadata = record.metadata.clone();
        stored.primary_asset_id = record.primary_asset_id;
        stored.updated_at = record.updated_at;
        stored.updated_by_id = record.updated_by_id;
        Ok(())
    }

    async fn delete_empty_contents(&mut self) -> Result<u64, PersistenceError> {
        let empty: HashSet<ContentId> = self
            .working
            .contents
            .values()
            .filter(|record| record.text.trim().is_empty())
            .map(|record| record.id)
            .collect();
        self.working
            .links
            .retain(|link| !empty.contains(&link.content_id));
        self.working.contents.retain(|id, _| !empty.contains(id));
        Ok(empty.len() as u64)
    }

    async fn savepoint(&mut self, name: &str) -> Result<(), PersistenceError> {
        self.savepoints
            .push((name.to_string(), self.working.clone()));
        Ok(())
    }

    async fn release_savepoint(&mut self, name: &str) -> Result<(), PersistenceError> {
        let index = self.savepoint_index(name)?;
        self.savepoints.truncate(index);
        Ok(())
    }

    async fn rollback_to_savepoint(&mut self, name: &str) -> Result<(), PersistenceError> {
        let index = self.savepoint_index(name)?;
        self.savepoints.truncate(index + 1);
        self.working = self.savepoints[index].1.clone();
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), PersistenceError> {
        let this = *self;
        {
            let mut faults = lock(&this.shared.faults);
            if faults
                .commits_allowed
                .is_some_and(|allowed| faults.commits >= allowed)
            {
                return Err(PersistenceError::Message(
                    "injected commit failure: connection lost".to_string(),
                ));
            }
            faults.commits += 1;
        }
        *lock(&this.shared.state) = this.working;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn uncommitted_work_is_discarded() {
        let db = MemoryPersistence::new();
        db.seed_content(ContentRecord::new(1, "t", "<p>x</p>"));

        let mut uow = db.begin().await.unwrap();
        uow.insert_asset("a.jpg", 1, Utc::now()).await.unwrap();
        drop(uow);
        assert!(db.assets().is_empty());

        let mut uow = db.begin().await.unwrap();
        let asset = uow.insert_asset("a.jpg", 1, Utc::now()).await.unwrap();
        uow.insert_link(ContentAssetLink { content_id: 1, asset_id: asset.id })
            .await
            .unwrap();
        uow.commit().await.unwrap();
        assert_eq!(db.assets().len(), 1);
        assert_eq!(db.content(1).unwrap().asset_ids, vec![asset.id]);
    }

    #[tokio::test]
    async fn rollback_to_savepoint_restores_working_copy() {
        let db = MemoryPersistence::new();
        let mut uow = db.begin().await.unwrap();
        uow.insert_asset("keep.jpg", 1, Utc::now()).await.unwrap();
        uow.savepoint("record").await.unwrap();
        uow.insert_asset("drop.jpg", 1, Utc::now()).await.unwrap();
        uow.rollback_to_savepoint("record").await.unwrap();
        uow.release_savepoint("record").await.unwrap();
        assert!(uow.release_savepoint("record").await.is_err());
        uow.commit().await.unwrap();

        let names: Vec<_> = db.assets().into_iter().map(|a| a.file_name).collect();
        assert_eq!(names, vec!["keep.jpg".to_string()]);
    }

    #[tokio::test]
    async fn duplicates_are_rejected() {
        let db = MemoryPersistence::new();
        db.seed_content(ContentRecord::new(7, "t", "x"));
        let asset = db.seed_asset("a.jpg");
        db.seed_link(7, asset.id);

        let mut uow = db.begin().await.unwrap();
        assert!(matches!(
            uow.insert_asset("a.jpg", 1, Utc::now()).await,
            Err(PersistenceError::DuplicateAsset(_))
        ));
        assert!(matches!(
            uow.insert_link(ContentAssetLink { content_id: 7, asset_id: asset.id }).await,
            Err(PersistenceError::DuplicateLink(_))
        ));
    }

    #[tokio::test]
    async fn fetch_orders_by_id_descending() {
        let db = MemoryPersistence::new();
        for id in 1..=5 {
            db.seed_content(ContentRecord::new(id, "t", "x"));
        }
        let mut uow = db.begin().await.unwrap();
        let ids: Vec<_> = uow
            .fetch_contents(1, 3)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(ids, vec![4, 3, 2]);
    }

    #[tokio::test]
    async fn commit_failure_injection() {
        let db = MemoryPersistence::new();
        db.fail_commits_after(1);
        db.begin().await.unwrap().commit().await.unwrap();
        assert!(db.begin().await.unwrap().commit().await.is_err());
        assert_eq!(db.commits(), 1);
    }
}
