//! Batch helpers over the segment fetcher
//!
//! Population-level operations the pipeline and the health checker share:
//! checking a whole NZB's articles with `STAT`, and resolving file sizes
//! from first-segment yEnc headers, both with bounded concurrency and
//! progress reporting.

use std::collections::HashMap;

use futures::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::types::{MessageId, UsageContext};

use super::SegmentFetcher;

impl SegmentFetcher {
    /// STAT a population of message-ids with bounded concurrency
    ///
    /// `progress` receives `(done, total)` after every completed check;
    /// it must not block.
    pub async fn check_all_segments(
        &self,
        ids: &[MessageId],
        concurrency: usize,
        progress: impl Fn(usize, usize) + Send + Sync,
        ctx: &UsageContext,
        cancel: &CancellationToken,
    ) -> Result<Vec<(MessageId, bool)>> {
        let total = ids.len();
        let done = std::sync::atomic::AtomicUsize::new(0);

        let mut results: Vec<(MessageId, bool)> = futures::stream::iter(ids.iter().cloned().enumerate())
            .map(|(index, id)| {
                let done = &done;
                let progress = &progress;
                async move {
                    let exists = self.stat_exists(&id, ctx, cancel).await?;
                    let finished = done.fetch_add(1, std::sync::atomic::Ordering::Relaxed) + 1;
                    progress(finished, total);
                    Ok::<_, Error>((index, id, exists))
                }
            })
            .buffer_unordered(concurrency.max(1))
            .collect::<Vec<_>>()
            .await
            .into_iter()
            .collect::<Result<Vec<_>>>()?
            .into_iter()
            .map(|(index, id, exists)| (index, (id, exists)))
            .collect::<std::collections::BTreeMap<_, _>>()
            .into_values()
            .collect();

        results.shrink_to_fit();
        Ok(results)
    }

    /// Resolve file sizes from first-segment yEnc headers
    ///
    /// `first_segments` maps an opaque file key to the file's first segment
    /// id. Files whose segment cannot be fetched are simply absent from the
    /// result; the caller decides whether that is fatal.
    pub async fn file_sizes_batch(
        &self,
        first_segments: &[(usize, MessageId)],
        concurrency: usize,
        ctx: &UsageContext,
        cancel: &CancellationToken,
    ) -> HashMap<usize, u64> {
        let resolved: Vec<Option<(usize, u64)>> =
            futures::stream::iter(first_segments.iter().cloned())
                .map(|(key, id)| async move {
                    match self.fetch_segment(&id, ctx, cancel).await {
                        Ok(decoded) if decoded.header.size > 0 => {
                            Some((key, decoded.header.size))
                        }
                        Ok(_) => None,
                        Err(e) => {
                            tracing::debug!(message_id = %id, error = %e, "size resolution failed");
                            None
                        }
                    }
                })
                .buffer_unordered(concurrency.max(1))
                .collect()
                .await;

        resolved.into_iter().flatten().collect()
    }
}
