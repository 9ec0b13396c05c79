//! Migration run orchestration: catalog, per-record reconciliation and batch commits.

mod catalog;
mod config;
mod memory;
mod persistence;
mod reconcile;

pub use catalog::AssetCatalog;
pub use config::{MigratorConfig, SourceConfig, StorageConfig, DEFAULT_BATCH_SIZE};
pub use memory::{MemoryPersistence, MemoryUnitOfWork};
pub use persistence::{PgPersistence, PgUnitOfWork, Persistence, PersistenceError, UnitOfWork};
pub use reconcile::{ContentReconciler, ReconcileError, ReconcileReport, ReconcileStage};

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use newsmig_core::{ContentRecord, VIDEO_LINKS_KEY};
use newsmig_extract::{ContentExtractor, HtmlExtractor, UrlNormalizer};
use newsmig_storage::{
    AssetUploader, HttpSource, LocalObjectStore, LocalSource, ObjectStore, S3Credentials,
    S3ObjectStore, SourceReader,
};
use serde::Serialize;
use thiserror::Error;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "newsmig-sync";

const RECORD_SAVEPOINT: &str = "reconcile_record";

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("pre-pass cleanup failed: {0}")]
    Prepare(#[source] PersistenceError),
    #[error("batch {batch_index} failed ({committed_batches} batches committed before it): {source}")]
    Batch {
        batch_index: usize,
        committed_batches: usize,
        #[source]
        source: PersistenceError,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub total_records: u64,
    pub batches_committed: usize,
    pub records_processed: usize,
    pub records_failed: usize,
    pub records_skipped: usize,
    pub assets_created: usize,
    pub links_created: usize,
    pub uploads_failed: usize,
    pub primary_assets_set: usize,
    pub empty_records_deleted: u64,
    pub metadata_cleared: usize,
}

/// Counters for one batch; folded into the summary only once the batch commits.
#[derive(Debug, Default)]
struct BatchTally {
    processed: usize,
    failed: usize,
    skipped: usize,
    assets_created: usize,
    links_created: usize,
    uploads_failed: usize,
    primary_assets_set: usize,
}

impl BatchTally {
    fn record(&mut self, report: &ReconcileReport) {
        self.processed += 1;
        self.skipped += usize::from(report.media_skipped);
        self.assets_created += report.assets_created;
        self.links_created += report.links_created;
        self.uploads_failed += report.uploads_failed;
        self.primary_assets_set += usize::from(report.primary_asset_set);
    }
}

impl RunSummary {
    fn absorb(&mut self, tally: BatchTally) {
        self.batches_committed += 1;
        self.records_processed += tally.processed;
        self.records_failed += tally.failed;
        self.records_skipped += tally.skipped;
        self.assets_created += tally.assets_created;
        self.links_created += tally.links_created;
        self.uploads_failed += tally.uploads_failed;
        self.primary_assets_set += tally.primary_assets_set;
    }
}

/// Drives the reconciler over every record in fixed-size, individually committed batches.
pub struct BatchCoordinator {
    persistence: Arc<dyn Persistence>,
    reconciler: ContentReconciler,
    batch_size: usize,
    row_limit: Option<u64>,
}

impl BatchCoordinator {
    pub fn new(
        persistence: Arc<dyn Persistence>,
        reconciler: ContentReconciler,
        batch_size: usize,
    ) -> Self {
        Self {
            persistence,
            reconciler,
            batch_size: batch_size.max(1),
            row_limit: None,
        }
    }

    pub fn with_row_limit(mut self, row_limit: Option<u64>) -> Self {
        self.row_limit = row_limit;
        self
    }

    pub async fn run(&self) -> Result<RunSummary, CoordinatorError> {
        let run_id = Uuid::new_v4();
        self.run_inner(run_id)
            .instrument(info_span!("migration_run", %run_id))
            .await
    }

    async fn run_inner(&self, run_id: Uuid) -> Result<RunSummary, CoordinatorError> {
        let mut summary = RunSummary {
            run_id,
            started_at: Utc::now(),
            ..Default::default()
        };

        let total = self.prepare(&mut summary).await.map_err(|err| {
            error!(error = %err, "pre-pass cleanup failed; run halted");
            CoordinatorError::Prepare(err)
        })?;
        summary.total_records = self.row_limit.map_or(total, |limit| total.min(limit));

        let batch_size = self.batch_size as u64;
        let batches = summary.total_records.div_ceil(batch_size);
        info!(
            total_records = summary.total_records,
            batches, batch_size, "migration started"
        );

        for batch_index in 0..batches {
            let offset = batch_index * batch_size;
            let limit = batch_size.min(summary.total_records - offset);
            let batch_index = batch_index as usize;

            let tally = self
                .run_batch(offset, limit)
                .instrument(info_span!("content_batch", batch_index, offset))
                .await
                .map_err(|source| {
                    error!(
                        batch_index,
                        committed_batches = summary.batches_committed,
                        error = %source,
                        "batch failed; run halted"
                    );
                    CoordinatorError::Batch {
                        batch_index,
                        committed_batches: summary.batches_committed,
                        source,
                    }
                })?;
            info!(
                batch_index,
                records = tally.processed,
                failed = tally.failed,
                "batch committed"
            );
            summary.absorb(tally);
        }

        summary.finished_at = Utc::now();
        info!(
            records_processed = summary.records_processed,
            records_failed = summary.records_failed,
            assets_created = summary.assets_created,
            links_created = summary.links_created,
            uploads_failed = summary.uploads_failed,
            "migration finished"
        );
        Ok(summary)
    }

    /// Deletes empty records and clears stale video links; returns the remaining record count.
    ///
    /// The metadata scan covers the same top rows the run will process.
    async fn prepare(&self, summary: &mut RunSummary) -> Result<u64, PersistenceError> {
        let mut uow = self.persistence.begin().await?;
        summary.empty_records_deleted = uow.delete_empty_contents().await?;
        if summary.empty_records_deleted > 0 {
            info!(deleted = summary.empty_records_deleted, "empty records deleted");
        }

        let total = uow.count_contents().await?;
        let scan = self.row_limit.map_or(total, |limit| total.min(limit));
        let mut offset = 0;
        while offset < scan {
            let limit = (self.batch_size as u64).min(scan - offset);
            let records = uow.fetch_contents(offset, limit).await?;
            if records.is_empty() {
                break;
            }
            offset += records.len() as u64;
            for mut record in records {
                if !self.has_stale_video_links(&record) {
                    continue;
                }
                record.metadata.remove(VIDEO_LINKS_KEY);
                record.touch(self.reconciler.audit_user_id());
                uow.update_content(&record).await?;
                summary.metadata_cleared += 1;
            }
        }
        if summary.metadata_cleared > 0 {
            info!(cleared = summary.metadata_cleared, "stale video links cleared");
        }

        uow.commit().await?;
        Ok(total)
    }

    /// Unprocessed markup with no video reference left in it.
    fn has_stale_video_links(&self, record: &ContentRecord) -> bool {
        let extractor = self.reconciler.extractor();
        record.metadata.contains_key(VIDEO_LINKS_KEY)
            && !record.has_linked_assets()
            && !self.reconciler.is_processed(record)
            && extractor.has_markup(&record.text)
            && !extractor.has_video_references(&record.text)
    }

    async fn run_batch(&self, offset: u64, limit: u64) -> Result<BatchTally, PersistenceError> {
        let mut uow = self.persistence.begin().await?;
        let records = uow.fetch_contents(offset, limit).await?;
        let mut tally = BatchTally::default();

        for mut record in records {
            let content_id = record.id;
            uow.savepoint(RECORD_SAVEPOINT).await?;
            match self.reconciler.reconcile(uow.as_mut(), &mut record).await {
                Ok(report) => {
                    uow.release_savepoint(RECORD_SAVEPOINT).await?;
                    tally.record(&report);
                }
                Err(err) => {
                    warn!(content_id, stage = %err.stage, error = %err.source, "record skipped");
                    uow.rollback_to_savepoint(RECORD_SAVEPOINT).await?;
                    uow.release_savepoint(RECORD_SAVEPOINT).await?;
                    tally.failed += 1;
                }
            }
        }

        uow.commit().await?;
        Ok(tally)
    }
}

pub fn build_source(config: &MigratorConfig) -> Result<Arc<dyn SourceReader>> {
    Ok(match &config.source {
        SourceConfig::Local { root } => Arc::new(LocalSource::new(root.clone())),
        SourceConfig::Http { base_url } => {
            Arc::new(HttpSource::new(base_url, &config.http_client_config())?)
        }
    })
}

pub fn build_object_store(config: &MigratorConfig) -> Result<Arc<dyn ObjectStore>> {
    Ok(match &config.storage {
        StorageConfig::Local { root } => Arc::new(LocalObjectStore::new(root.clone())),
        StorageConfig::S3(s3) => Arc::new(S3ObjectStore::new(
            s3.clone(),
            S3Credentials::from_env()?,
            &config.http_client_config(),
        )?),
    })
}

/// Wires a coordinator from configuration around the given persistence.
pub fn build_coordinator(
    config: &MigratorConfig,
    persistence: Arc<dyn Persistence>,
) -> Result<BatchCoordinator> {
    let uploader = AssetUploader::new(
        build_source(config)?,
        build_object_store(config)?,
        config.uploader_config(),
    );
    let extractor: Arc<dyn ContentExtractor> = Arc::new(HtmlExtractor);
    let reconciler = ContentReconciler::new(
        Arc::new(uploader),
        extractor,
        UrlNormalizer::new(config.legacy_domain.clone()),
        config.audit_user_id,
    );
    Ok(BatchCoordinator::new(persistence, reconciler, config.batch_size)
        .with_row_limit(config.row_limit))
}

pub async fn run_migration(config: &MigratorConfig) -> Result<RunSummary> {
    config.validate()?;
    let persistence = PgPersistence::connect(
        &config.database_url,
        config.max_db_connections,
        Duration::from_secs(config.db_acquire_timeout_secs),
    )
    .await?;
    let coordinator = build_coordinator(config, Arc::new(persistence))?;
    Ok(coordinator.run().await?)
}

pub async fn run_migration_from_env() -> Result<RunSummary> {
    run_migration(&MigratorConfig::from_env()).await
}
