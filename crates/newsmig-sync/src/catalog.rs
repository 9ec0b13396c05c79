use chrono::Utc;
use newsmig_core::{Asset, AssetId, ContentAssetLink, ContentRecord};
use tracing::{debug, info};

use crate::persistence::{PersistenceError, UnitOfWork};

/// Lookup-then-create asset catalog over the current unit of work.
///
/// Writers are single-threaded per batch; the storage-level unique constraint on
/// `file_name` is the backstop if that ever stops holding.
pub struct AssetCatalog<'u> {
    uow: &'u mut dyn UnitOfWork,
    audit_user_id: i64,
}

impl<'u> AssetCatalog<'u> {
    pub fn new(uow: &'u mut dyn UnitOfWork, audit_user_id: i64) -> Self {
        Self { uow, audit_user_id }
    }

    pub fn into_inner(self) -> &'u mut dyn UnitOfWork {
        self.uow
    }

    pub async fn find_by_file_name(
        &mut self,
        file_name: &str,
    ) -> Result<Option<Asset>, PersistenceError> {
        self.uow.find_asset_by_file_name(file_name).await
    }

    /// Callers check [`Self::find_by_file_name`] first.
    pub async fn create(&mut self, file_name: &str) -> Result<Asset, PersistenceError> {
        let asset = self
            .uow
            .insert_asset(file_name, self.audit_user_id, Utc::now())
            .await?;
        info!(asset_id = asset.id, file_name, "asset created");
        Ok(asset)
    }

    /// Returns `false` when the pair was already linked.
    pub async fn link_content_to_asset(
        &mut self,
        record: &mut ContentRecord,
        asset_id: AssetId,
    ) -> Result<bool, PersistenceError> {
        if record.is_linked_to(asset_id) {
            debug!(content_id = record.id, asset_id, "asset already linked");
            return Ok(false);
        }
        let link = ContentAssetLink {
            content_id: record.id,
            asset_id,
        };
        let created = match self.uow.insert_link(link).await {
            Ok(()) => true,
            Err(PersistenceError::DuplicateLink(_)) => false,
            Err(err) => return Err(err),
        };
        record.asset_ids.push(asset_id);
        Ok(created)
    }

    pub async fn create_with_link(
        &mut self,
        record: &mut ContentRecord,
        file_name: &str,
    ) -> Result<Asset, PersistenceError> {
        let asset = self.create(file_name).await?;
        self.link_content_to_asset(record, asset.id).await?;
        Ok(asset)
    }
}
