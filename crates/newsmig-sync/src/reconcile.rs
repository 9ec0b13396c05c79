use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use futures::future::join_all;
use newsmig_core::{file_name_from_path, AssetId, ContentId, ContentRecord, VIDEO_LINKS_KEY};
use newsmig_extract::{ContentExtractor, UrlNormalizer};
use newsmig_storage::{MediaUploader, UploadError};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::catalog::AssetCatalog;
use crate::persistence::{PersistenceError, UnitOfWork};

/// Step of a record pass that touches persistence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconcileStage {
    AssetsResolved,
    PrimaryAssetResolved,
    Updated,
}

impl fmt::Display for ReconcileStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::AssetsResolved => "assets_resolved",
            Self::PrimaryAssetResolved => "primary_asset_resolved",
            Self::Updated => "updated",
        })
    }
}

#[derive(Debug, Error)]
#[error("content {content_id} failed at {stage}: {source}")]
pub struct ReconcileError {
    pub content_id: ContentId,
    pub stage: ReconcileStage,
    #[source]
    pub source: PersistenceError,
}

/// What one pass over a record did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub media_skipped: bool,
    pub assets_created: usize,
    pub links_created: usize,
    pub uploads_failed: usize,
    pub primary_asset_set: bool,
    pub video_links: usize,
}

enum Step {
    Link(AssetId),
    Upload(String),
}

enum Resolved {
    Existing(AssetId),
    Uploaded(Result<String, UploadError>),
}

pub struct ContentReconciler {
    uploader: Arc<dyn MediaUploader>,
    extractor: Arc<dyn ContentExtractor>,
    normalizer: UrlNormalizer,
    audit_user_id: i64,
}

impl ContentReconciler {
    pub fn new(
        uploader: Arc<dyn MediaUploader>,
        extractor: Arc<dyn ContentExtractor>,
        normalizer: UrlNormalizer,
        audit_user_id: i64,
    ) -> Self {
        Self {
            uploader,
            extractor,
            normalizer,
            audit_user_id,
        }
    }

    pub fn extractor(&self) -> &dyn ContentExtractor {
        self.extractor.as_ref()
    }

    pub fn audit_user_id(&self) -> i64 {
        self.audit_user_id
    }

    /// Handled by an earlier pass: normalized text plus either linked assets or
    /// written video links. Such records keep their text and media.
    pub fn is_processed(&self, record: &ContentRecord) -> bool {
        self.extractor.is_normalized(&record.text)
            && (record.has_linked_assets() || record.metadata.contains_key(VIDEO_LINKS_KEY))
    }

    /// Normalizes one record in place and writes it through `uow`.
    ///
    /// Upload failures are counted and skipped; persistence failures abort the record.
    /// A processed record is only written when its primary asset gets resolved.
    pub async fn reconcile(
        &self,
        uow: &mut dyn UnitOfWork,
        record: &mut ContentRecord,
    ) -> Result<ReconcileReport, ReconcileError> {
        let content_id = record.id;
        let at = |stage: ReconcileStage| {
            move |source: PersistenceError| ReconcileError {
                content_id,
                stage,
                source,
            }
        };

        let processed = self.is_processed(record);
        let mut report = ReconcileReport::default();
        let mut catalog = AssetCatalog::new(uow, self.audit_user_id);

        let raw = if processed {
            debug!(content_id, "record already processed; text left as is");
            None
        } else {
            let raw = std::mem::take(&mut record.text);
            record.text = self.extractor.normalize_text(&raw);
            Some(raw)
        };

        match raw.as_deref() {
            Some(raw) if !record.has_linked_assets() => {
                let media = self.extractor.extract_media(raw);
                self.resolve_images(&mut catalog, record, &media.images, &mut report)
                    .await
                    .map_err(at(ReconcileStage::AssetsResolved))?;

                let mut links = record.metadata.video_links();
                for url in media.videos {
                    if !links.contains(&url) {
                        links.push(url);
                    }
                }
                report.video_links = links.len();
                record.metadata.set_video_links(links);
            }
            _ => {
                debug!(content_id, processed, "media extraction skipped");
                report.media_skipped = true;
            }
        }

        if record.primary_asset_id.is_none() {
            self.resolve_primary(&mut catalog, record, &mut report)
                .await
                .map_err(at(ReconcileStage::PrimaryAssetResolved))?;
        }
        if processed && !report.primary_asset_set {
            return Ok(report);
        }

        record.touch(self.audit_user_id);
        catalog
            .into_inner()
            .update_content(record)
            .await
            .map_err(at(ReconcileStage::Updated))?;
        Ok(report)
    }

    /// Lookups first, then the missing files upload concurrently, then catalog
    /// writes in document order.
    async fn resolve_images(
        &self,
        catalog: &mut AssetCatalog<'_>,
        record: &mut ContentRecord,
        images: &[String],
        report: &mut ReconcileReport,
    ) -> Result<(), PersistenceError> {
        let mut seen = HashSet::new();
        let mut plan = Vec::new();
        for url in images {
            let relative = self.normalizer.to_relative(url);
            let file_name = file_name_from_path(&relative);
            if file_name.is_empty() {
                warn!(content_id = record.id, url = %url, "image reference has no file name; skipped");
                continue;
            }
            if !seen.insert(file_name.clone()) {
                continue;
            }
            let step = match catalog.find_by_file_name(&file_name).await? {
                Some(asset) => Step::Link(asset.id),
                None => Step::Upload(relative),
            };
            plan.push((file_name, step));
        }

        let resolved = join_all(plan.into_iter().map(|(file_name, step)| async move {
            let outcome = match step {
                Step::Link(asset_id) => Resolved::Existing(asset_id),
                Step::Upload(relative) => Resolved::Uploaded(self.uploader.upload(&relative).await),
            };
            (file_name, outcome)
        }))
        .await;

        for (file_name, outcome) in resolved {
            match outcome {
                Resolved::Existing(asset_id) => {
                    if catalog.link_content_to_asset(record, asset_id).await? {
                        report.links_created += 1;
                    }
                }
                Resolved::Uploaded(Ok(stored)) => {
                    catalog.create_with_link(record, &stored).await?;
                    report.assets_created += 1;
                    report.links_created += 1;
                }
                Resolved::Uploaded(Err(err)) => {
                    warn!(content_id = record.id, file_name = %file_name, error = %err, "image skipped");
                    report.uploads_failed += 1;
                }
            }
        }
        Ok(())
    }

    /// The lead image becomes the primary asset without joining the link list.
    async fn resolve_primary(
        &self,
        catalog: &mut AssetCatalog<'_>,
        record: &mut ContentRecord,
        report: &mut ReconcileReport,
    ) -> Result<(), PersistenceError> {
        let Some(url) = record.metadata.primary_image_url().map(ToString::to_string) else {
            return Ok(());
        };
        let relative = self.normalizer.to_relative(&url);
        let file_name = file_name_from_path(&relative);
        if file_name.is_empty() {
            warn!(content_id = record.id, url = %url, "primary image has no file name; skipped");
            return Ok(());
        }

        let asset = match catalog.find_by_file_name(&file_name).await? {
            Some(asset) => asset,
            None => match self.uploader.upload(&relative).await {
                Ok(stored) => {
                    report.assets_created += 1;
                    catalog.create(&stored).await?
                }
                Err(err) => {
                    warn!(content_id = record.id, file_name = %file_name, error = %err, "primary image skipped");
                    report.uploads_failed += 1;
                    return Ok(());
                }
            },
        };
        record.primary_asset_id = Some(asset.id);
        report.primary_asset_set = true;
        Ok(())
    }
}
