//! # nzb-mount
//!
//! Backend core of an NZB-driven media fetcher/mounter: it parses NZB
//! manifests, streams segmented article bodies from NNTP providers through
//! yEnc decoding, deobfuscates archives (stored RAR, stored 7z, split
//! MKV), and commits the reconstructed files as mount items into a
//! pluggable metadata store consumed by a virtual filesystem.
//!
//! ## Design Philosophy
//!
//! - **Library-first** - no CLI or HTTP surface, purely a crate for embedding
//! - **Streaming** - bodies flow through bounded buffers; nothing is
//!   written to disk except optional STRM pointer files
//! - **Deterministic** - mount-item ids are UUIDv5 over (parent, name), so
//!   re-ingesting an NZB reproduces the same tree
//! - **Event-driven** - consumers subscribe to lifecycle events, no polling
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use nzb_mount::{Config, InMemoryStore, NzbMount, Priority, ProviderConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config {
//!         providers: vec![ProviderConfig {
//!             host: "news.example.com".to_string(),
//!             port: 563,
//!             tls: true,
//!             username: Some("user".to_string()),
//!             password: Some("pass".to_string()),
//!             max_connections: 20,
//!             provider_type: Default::default(),
//!             priority: 0,
//!         }],
//!         ..Default::default()
//!     };
//!
//!     let mount = NzbMount::new(config, Arc::new(InMemoryStore::new()))?;
//!
//!     let mut events = mount.subscribe();
//!     tokio::spawn(async move {
//!         while let Ok(event) = events.recv().await {
//!             println!("event: {event:?}");
//!         }
//!     });
//!
//!     let nzb = std::fs::read("example.nzb")?;
//!     mount.queue().add_nzb(&nzb, "example", "movies", Priority::Normal).await?;
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// Finalization into the metadata store
pub mod aggregator;
/// Configuration types
pub mod config;
/// Error types and failure categories
pub mod error;
/// High-level segment fetching with provider fallback
pub mod fetcher;
/// Usage-class partitioned connection limiter
pub mod limiter;
/// Known-missing segment cache
pub mod missing_cache;
/// NNTP client layer
pub mod nntp;
/// NZB manifest parsing
pub mod nzb;
/// Par2 packet parsing
pub mod par2;
/// Deobfuscation pipeline
pub mod pipeline;
/// File processors (RAR, 7z, split MKV, plain)
pub mod processors;
/// Fire-and-forget progress reporting
pub mod progress;
/// Queue manager
pub mod queue;
/// Retry logic with exponential backoff
pub mod retry;
/// Metadata store contract and in-memory implementation
pub mod store;
/// Core types and events
pub mod types;
/// Streaming yEnc decoder
pub mod yenc;

// Re-export commonly used types
pub use config::{
    Config, ConfigHandle, DuplicateNzbBehavior, ImportStrategy, ProviderConfig, ProviderType,
};
pub use error::{Error, FailureReason, Result};
pub use fetcher::{SegmentBody, SegmentFetcher};
pub use limiter::{GlobalLimiter, UsagePermit};
pub use queue::QueueManager;
pub use store::{InMemoryStore, MetadataStore, MountContent, MountItem, MountItemKind};
pub use types::{Event, JobId, MessageId, Priority, UsageClass, UsageContext};

use std::sync::Arc;

use missing_cache::MissingSegmentCache;

/// The wired-up fetcher core: pools, limiter, queue worker, and store
///
/// External surfaces (WebDAV, SABnzbd-compatible API, the mount) hold one
/// of these: the queue manager ingests NZBs, the segment fetcher serves
/// on-demand streaming reads, and the store answers metadata queries.
pub struct NzbMount {
    fetcher: Arc<SegmentFetcher>,
    queue: QueueManager,
    store: Arc<dyn MetadataStore>,
    missing: Arc<MissingSegmentCache>,
    worker: tokio::task::JoinHandle<()>,
}

impl NzbMount {
    /// Validate the configuration and start the queue worker
    pub fn new(config: Config, store: Arc<dyn MetadataStore>) -> Result<Self> {
        config.validate()?;

        let missing = Arc::new(MissingSegmentCache::default());
        let fetcher = Arc::new(SegmentFetcher::new(&config, missing.clone()));
        let handle = ConfigHandle::new(config);
        let queue = QueueManager::new(store.clone(), fetcher.clone(), handle);
        let worker = queue.start();

        Ok(Self {
            fetcher,
            queue,
            store,
            missing,
            worker,
        })
    }

    /// The queue manager (ingestion, removal, lifecycle events)
    pub fn queue(&self) -> &QueueManager {
        &self.queue
    }

    /// The segment fetcher (streaming reads through the mount)
    pub fn fetcher(&self) -> &Arc<SegmentFetcher> {
        &self.fetcher
    }

    /// The metadata store
    pub fn store(&self) -> &Arc<dyn MetadataStore> {
        &self.store
    }

    /// The process-wide known-missing segment cache
    pub fn missing_cache(&self) -> &Arc<MissingSegmentCache> {
        &self.missing
    }

    /// Subscribe to job lifecycle events
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<Event> {
        self.queue.subscribe()
    }

    /// Cancel the in-flight job, stop the worker, and wait for it
    pub async fn shutdown(self) -> Result<()> {
        self.queue.shutdown().await;
        self.worker.await.ok();
        Ok(())
    }
}

/// Run the core until a termination signal arrives, then shut down.
///
/// - **Unix:** listens for SIGTERM and SIGINT, with fallbacks if signal
///   registration fails.
/// - **Windows/other:** listens for Ctrl+C via `tokio::signal::ctrl_c()`.
pub async fn run_with_shutdown(mount: NzbMount) -> Result<()> {
    wait_for_signal().await;
    mount.shutdown().await
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    // Signal registration may fail in restricted environments (containers, tests)
    let sigterm = signal(SignalKind::terminate());
    let sigint = signal(SignalKind::interrupt());

    match (sigterm, sigint) {
        (Ok(mut sigterm), Ok(mut sigint)) => {
            tokio::select! {
                _ = sigterm.recv() => tracing::info!("received SIGTERM"),
                _ = sigint.recv() => tracing::info!("received SIGINT"),
            }
        }
        (Err(e), _) => {
            tracing::warn!(error = %e, "could not register SIGTERM handler, waiting for SIGINT only");
            if let Ok(mut sigint) = signal(SignalKind::interrupt()) {
                sigint.recv().await;
            } else {
                tokio::signal::ctrl_c().await.ok();
            }
        }
        (_, Err(e)) => {
            tracing::warn!(error = %e, "could not register SIGINT handler, waiting for SIGTERM only");
            if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                sigterm.recv().await;
            } else {
                tokio::signal::ctrl_c().await.ok();
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for Ctrl+C");
    }
}
