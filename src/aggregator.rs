//! Aggregation and finalization
//!
//! Everything a finished job changes in the metadata store happens under
//! one [`StoreTransaction`]: the category folder, the job folder (with the
//! configured duplicate behavior), the child mount items from the
//! processor results, and the queue-to-history transition. Post-processors
//! run over the result set before anything is staged: sample hiding,
//! blacklisted-extension removal, duplicate renaming, and the optional
//! importable-video check. STRM emission is the only filesystem write in
//! the core.

use chrono::Utc;
use uuid::Uuid;

use crate::config::{DuplicateNzbBehavior, ImportConfig, ImportStrategy};
use crate::error::{Error, FailureReason, Result};
use crate::processors::{FileProcessingResult, MediaKind};
use crate::store::{
    HistoryItem, MetadataStore, MountContent, MountItem, QueueItem, StoreTransaction,
};
use crate::types::HistoryStatus;

/// Highest " (N)" suffix tried before a duplicate job is given up on
const MAX_INCREMENT: u32 = 100;

/// Outcome of a successful finalization
#[derive(Clone, Debug)]
pub struct FinalizeOutcome {
    /// Id of the job's mount directory
    pub download_dir_id: Uuid,
    /// Final (possibly incremented) directory name
    pub dir_name: String,
}

/// Commits processor output into the metadata store
pub struct Finalizer<'a> {
    store: &'a dyn MetadataStore,
    config: &'a ImportConfig,
}

impl<'a> Finalizer<'a> {
    /// Build a finalizer over a store and import configuration
    pub fn new(store: &'a dyn MetadataStore, config: &'a ImportConfig) -> Self {
        Self { store, config }
    }

    /// Finalize a completed job
    pub async fn finalize_completed(
        &self,
        job: &QueueItem,
        results: Vec<FileProcessingResult>,
        download_seconds: u64,
    ) -> Result<FinalizeOutcome> {
        let mut tx = StoreTransaction::default();

        // Category folder is reused across jobs of the same category
        let category_id = self.get_or_create_category(&job.category, &mut tx).await?;

        // Job folder per duplicate policy
        let (dir_id, dir_name, write_items) =
            self.resolve_job_folder(category_id, &job.job_name, &mut tx).await?;

        if write_items {
            let kept = self.post_process(results)?;
            for result in &kept {
                tx.add_item(MountItem::file(
                    dir_id,
                    &result.name,
                    result.size,
                    MountContent::Segments {
                        spans: result.spans.clone(),
                        xor_obfuscated: result
                            .archive
                            .as_ref()
                            .map(|a| a.xor_obfuscated)
                            .unwrap_or(false),
                    },
                ));
            }
            if self.config.import_strategy == ImportStrategy::Strm {
                self.emit_strm_files(&job.category, &dir_name, &kept).await?;
            }
        }

        tx.remove_queue_item(job.id);
        tx.add_history(HistoryItem {
            id: job.id,
            job_name: job.job_name.clone(),
            status: HistoryStatus::Completed,
            fail_message: None,
            failure_reason: None,
            download_seconds,
            download_dir_id: Some(dir_id),
            nzb_contents: job.nzb_contents.clone(),
            created_at: Utc::now(),
        });
        self.store.commit(tx).await?;

        Ok(FinalizeOutcome {
            download_dir_id: dir_id,
            dir_name,
        })
    }

    /// Finalize a failed job: queue item out, failed history in, no mount
    /// items left behind
    pub async fn finalize_failed(
        &self,
        job: &QueueItem,
        reason: FailureReason,
        message: String,
        download_seconds: u64,
    ) -> Result<()> {
        let mut tx = StoreTransaction::default();
        tx.remove_queue_item(job.id);
        tx.add_history(HistoryItem {
            id: job.id,
            job_name: job.job_name.clone(),
            status: HistoryStatus::Failed,
            fail_message: Some(message),
            failure_reason: Some(reason),
            download_seconds,
            download_dir_id: None,
            nzb_contents: job.nzb_contents.clone(),
            created_at: Utc::now(),
        });
        self.store.commit(tx).await
    }

    async fn get_or_create_category(
        &self,
        category: &str,
        tx: &mut StoreTransaction,
    ) -> Result<Uuid> {
        let root = self.store.root_id();
        let id = MountItem::child_id(root, category);
        if self.store.get_item(id).await?.is_none() {
            tx.add_item(MountItem::directory(root, category));
        }
        Ok(id)
    }

    /// Resolve the job directory per `duplicate_nzb_behavior`
    ///
    /// Returns `(id, name, write_items)`; `write_items` is false for the
    /// Ignore policy, which finishes against the existing folder.
    async fn resolve_job_folder(
        &self,
        category_id: Uuid,
        job_name: &str,
        tx: &mut StoreTransaction,
    ) -> Result<(Uuid, String, bool)> {
        let id = MountItem::child_id(category_id, job_name);
        let existing = self.store.get_item(id).await?;
        if existing.is_none() {
            tx.add_item(MountItem::directory(category_id, job_name));
            return Ok((id, job_name.to_string(), true));
        }

        match self.config.duplicate_nzb_behavior {
            DuplicateNzbBehavior::MarkFailed => Err(Error::DuplicateJob(job_name.to_string())),
            DuplicateNzbBehavior::Ignore => {
                tracing::info!(job_name, "job folder exists, keeping existing content");
                Ok((id, job_name.to_string(), false))
            }
            DuplicateNzbBehavior::Increment => {
                for n in 2..=MAX_INCREMENT {
                    let candidate = format!("{job_name} ({n})");
                    let candidate_id = MountItem::child_id(category_id, &candidate);
                    if self.store.get_item(candidate_id).await?.is_none() {
                        tx.add_item(MountItem::directory(category_id, &candidate));
                        return Ok((candidate_id, candidate, true));
                    }
                }
                Err(Error::DuplicateJob(format!(
                    "{job_name}: no free name up to ({MAX_INCREMENT})"
                )))
            }
        }
    }

    /// Filter and rename the processor results before staging
    fn post_process(
        &self,
        results: Vec<FileProcessingResult>,
    ) -> Result<Vec<FileProcessingResult>> {
        let mut kept: Vec<FileProcessingResult> = Vec::new();

        for result in results {
            if self.config.hide_samples && is_sample(&result.name) {
                tracing::debug!(name = %result.name, "dropping sample file");
                continue;
            }
            if self.is_blacklisted(&result.name) {
                tracing::debug!(name = %result.name, "dropping blacklisted extension");
                continue;
            }
            kept.push(result);
        }

        // Rename duplicate output names " (2)" … keeping the extension intact
        let mut seen: std::collections::HashMap<String, u32> = std::collections::HashMap::new();
        for result in &mut kept {
            let count = seen.entry(result.name.clone()).or_insert(0);
            *count += 1;
            if *count > 1 {
                result.name = numbered_name(&result.name, *count);
            }
        }

        if self.config.ensure_importable_video
            && !kept.iter().any(|r| r.media_kind == MediaKind::Video && !r.corrupt)
        {
            return Err(Error::NoVideoFiles);
        }
        Ok(kept)
    }

    fn is_blacklisted(&self, name: &str) -> bool {
        let lower = name.to_ascii_lowercase();
        self.config
            .blacklisted_extensions
            .iter()
            .any(|ext| lower.ends_with(&ext.to_ascii_lowercase()))
    }

    /// Write STRM pointer files, the core's only filesystem output
    async fn emit_strm_files(
        &self,
        category: &str,
        dir_name: &str,
        results: &[FileProcessingResult],
    ) -> Result<()> {
        let Some(base_dir) = self.config.strm_output_dir.as_ref() else {
            return Ok(());
        };
        let base_url = self
            .config
            .strm_base_url
            .as_deref()
            .unwrap_or("")
            .trim_end_matches('/');

        let target = base_dir.join(dir_name);
        tokio::fs::create_dir_all(&target).await?;
        for result in results {
            if result.media_kind != MediaKind::Video {
                continue;
            }
            let strm_name = format!("{}.strm", stem_of(&result.name));
            let url = format!("{base_url}/{category}/{dir_name}/{}", result.name);
            tokio::fs::write(target.join(strm_name), url).await?;
        }
        Ok(())
    }
}

/// `name.ext` → `name (n).ext`
fn numbered_name(name: &str, n: u32) -> String {
    match name.rfind('.') {
        Some(at) if at > 0 => format!("{} ({n}){}", &name[..at], &name[at..]),
        _ => format!("{name} ({n})"),
    }
}

fn stem_of(name: &str) -> &str {
    match name.rfind('.') {
        Some(at) if at > 0 => &name[..at],
        _ => name,
    }
}

/// Sample detection by filename convention
fn is_sample(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    let stem = stem_of(&lower);
    stem.ends_with("sample")
        || stem.ends_with("-sample")
        || stem.starts_with("sample-")
        || stem.contains(".sample.")
}
