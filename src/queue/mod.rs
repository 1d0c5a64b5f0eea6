//! Queue manager
//!
//! A single worker drains the queue: pick the next ready item (not paused,
//! priority then enqueue order), run the pipeline and processors under a
//! per-job cancellation token, and finalize. Completion and fatal failure
//! move the job into history atomically; transient failures pause the item
//! in place for a configured minute. Removal requests cancel the in-flight
//! token outside the scheduler state lock and let the worker finalize.
//!
//! A supervisor logs jobs that have been running suspiciously long. All
//! notifications are fire-and-forget broadcast events.

use std::sync::Arc;
use std::time::Instant;

use chrono::{Duration as ChronoDuration, Utc};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::aggregator::{FinalizeOutcome, Finalizer};
use crate::config::{Config, ConfigHandle};
use crate::error::{FailureReason, Result};
use crate::fetcher::SegmentFetcher;
use crate::nzb::NzbDocument;
use crate::pipeline::DeobfuscationPipeline;
use crate::processors::{
    FileGroupKind, FileProcessingResult, ProcessorContext, group_files, process_all,
    rar_concurrency,
};
use crate::progress::ProgressReporter;
use crate::retry::IsRetryable;
use crate::store::{MetadataStore, QueueItem};
use crate::types::{Event, JobId, Priority, UsageClass, UsageContext};

/// Poll interval when the queue is empty
const QUEUE_POLL_INTERVAL: std::time::Duration = std::time::Duration::from_millis(200);

/// How often the supervisor looks at the active job
const SUPERVISOR_TICK: std::time::Duration = std::time::Duration::from_secs(60);

/// Single-worker queue scheduler
#[derive(Clone)]
pub struct QueueManager {
    inner: Arc<QueueInner>,
}

struct QueueInner {
    store: Arc<dyn MetadataStore>,
    fetcher: Arc<SegmentFetcher>,
    config: ConfigHandle,
    events: broadcast::Sender<Event>,
    active: std::sync::Mutex<Option<ActiveJob>>,
    shutdown: CancellationToken,
}

struct ActiveJob {
    id: JobId,
    token: CancellationToken,
    started: Instant,
}

impl QueueManager {
    /// Create the manager; call [`QueueManager::start`] to spawn the worker
    pub fn new(
        store: Arc<dyn MetadataStore>,
        fetcher: Arc<SegmentFetcher>,
        config: ConfigHandle,
    ) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(QueueInner {
                store,
                fetcher,
                config,
                events,
                active: std::sync::Mutex::new(None),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Subscribe to lifecycle events
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.inner.events.subscribe()
    }

    /// Parse and enqueue an NZB
    pub async fn add_nzb(
        &self,
        content: &[u8],
        job_name: &str,
        category: &str,
        priority: Priority,
    ) -> Result<JobId> {
        let doc = NzbDocument::parse(content)?;
        let item = QueueItem {
            id: JobId::new(),
            job_name: job_name.to_string(),
            category: category.to_string(),
            total_segment_bytes: doc.total_bytes(),
            priority,
            pause_until: None,
            created_at: Utc::now(),
            nzb_contents: String::from_utf8_lossy(content).into_owned(),
        };
        let id = item.id;
        self.inner.store.add_queue_item(item).await?;
        self.inner
            .events
            .send(Event::Queued {
                id,
                job_name: job_name.to_string(),
            })
            .ok();
        Ok(id)
    }

    /// Spawn the worker and supervisor tasks
    pub fn start(&self) -> tokio::task::JoinHandle<()> {
        let inner = self.inner.clone();
        let supervisor = self.inner.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = supervisor.shutdown.cancelled() => break,
                    _ = tokio::time::sleep(SUPERVISOR_TICK) => {}
                }
                let warn_after = {
                    let config = supervisor.config.get().await;
                    std::time::Duration::from_secs(config.queue.supervisor_interval_secs)
                };
                let long_runner = {
                    let active = supervisor.active.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
                    active
                        .as_ref()
                        .filter(|job| job.started.elapsed() >= warn_after)
                        .map(|job| (job.id, job.started.elapsed()))
                };
                if let Some((id, for_how_long)) = long_runner {
                    tracing::warn!(
                        job_id = %id,
                        running_secs = for_how_long.as_secs(),
                        "job has been processing for a long time"
                    );
                }
            }
        });

        tokio::spawn(Box::pin(QueueInner::worker_loop(inner)))
    }

    /// Remove a job: cancel it if in flight, else take it off the queue
    ///
    /// Cancellation happens outside any scheduler state; the worker
    /// finalizes the cancelled job as failed on its own.
    pub async fn remove(&self, id: JobId) -> Result<()> {
        let in_flight = {
            let active = self.inner.active.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            active
                .as_ref()
                .filter(|job| job.id == id)
                .map(|job| job.token.clone())
        };
        match in_flight {
            Some(token) => {
                token.cancel();
                Ok(())
            }
            None => {
                self.inner.store.remove_queue_items(&[id]).await?;
                self.inner.events.send(Event::Removed { id }).ok();
                Ok(())
            }
        }
    }

    /// Stop the worker; the in-flight job is cancelled and finalized
    pub async fn shutdown(&self) {
        if let Some(token) = {
            let active = self.inner.active.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            active.as_ref().map(|job| job.token.clone())
        } {
            token.cancel();
        }
        self.inner.shutdown.cancel();
    }
}

impl QueueInner {
    /// Drain the queue until shutdown is requested
    async fn worker_loop(inner: Arc<Self>) {
        loop {
            if inner.shutdown.is_cancelled() {
                break;
            }
            match inner.pick_next().await {
                Some(item) => Box::pin(inner.run_one(item)).await,
                None => {
                    tokio::select! {
                        _ = inner.shutdown.clone().cancelled_owned() => break,
                        _ = tokio::time::sleep(QUEUE_POLL_INTERVAL) => {}
                    }
                }
            }
        }
        tracing::debug!("queue worker stopped");
    }

    /// Next ready item: not paused, highest priority, oldest first
    async fn pick_next(&self) -> Option<QueueItem> {
        let now = Utc::now();
        let mut items = match self.store.queue_items().await {
            Ok(items) => items,
            Err(e) => {
                tracing::error!(error = %e, "failed to read the queue");
                return None;
            }
        };
        items.retain(|item| item.pause_until.map(|until| until <= now).unwrap_or(true));
        items.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.created_at.cmp(&b.created_at))
        });
        items.into_iter().next()
    }

    /// Run one job to a terminal (or paused) state
    async fn run_one(&self, item: QueueItem) {
        let token = CancellationToken::new();
        {
            let mut active = self.active.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            *active = Some(ActiveJob {
                id: item.id,
                token: token.clone(),
                started: Instant::now(),
            });
        }
        self.events
            .send(Event::Started {
                id: item.id,
                job_name: item.job_name.clone(),
            })
            .ok();
        tracing::info!(job_id = %item.id, job_name = %item.job_name, "processing job");

        let started = Instant::now();
        let config = self.config.get().await;
        let outcome = Box::pin(self.process_and_finalize(&item, &token, &config, started)).await;

        {
            let mut active = self.active.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            *active = None;
        }

        let elapsed = started.elapsed().as_secs();
        match outcome {
            Ok(outcome) => {
                tracing::info!(
                    job_id = %item.id,
                    dir = %outcome.dir_name,
                    seconds = elapsed,
                    "job completed"
                );
                self.events
                    .send(Event::Completed {
                        id: item.id,
                        job_name: item.job_name.clone(),
                        download_dir_id: outcome.download_dir_id,
                    })
                    .ok();
            }
            Err(e) if e.is_retryable() && !self.shutdown.is_cancelled() => {
                let until = Utc::now()
                    + ChronoDuration::seconds(config.queue.retry_pause_secs as i64);
                tracing::warn!(job_id = %item.id, error = %e, "transient failure, pausing job");
                if let Err(pause_error) = self.store.set_pause_until(item.id, Some(until)).await {
                    tracing::error!(job_id = %item.id, error = %pause_error, "failed to pause job");
                }
                self.events
                    .send(Event::Paused { id: item.id, until })
                    .ok();
            }
            Err(e) => {
                let reason = FailureReason::from(&e);
                let message = e.to_string();
                tracing::warn!(job_id = %item.id, %reason, error = %message, "job failed");

                let finalizer = Finalizer::new(self.store.as_ref(), &config.import);
                if let Err(final_error) = finalizer
                    .finalize_failed(&item, reason, message.clone(), elapsed)
                    .await
                {
                    tracing::error!(job_id = %item.id, error = %final_error, "failed to finalize job");
                }
                self.events
                    .send(Event::Failed {
                        id: item.id,
                        job_name: item.job_name.clone(),
                        reason,
                        message,
                    })
                    .ok();
            }
        }
    }

    async fn process_and_finalize(
        &self,
        item: &QueueItem,
        token: &CancellationToken,
        config: &Config,
        started: Instant,
    ) -> Result<FinalizeOutcome> {
        let results = self.process_job(item, token, config).await?;
        let finalizer = Finalizer::new(self.store.as_ref(), &config.import);
        finalizer
            .finalize_completed(item, results, started.elapsed().as_secs())
            .await
    }

    /// Pipeline and processors for one job
    async fn process_job(
        &self,
        item: &QueueItem,
        token: &CancellationToken,
        config: &Config,
    ) -> Result<Vec<FileProcessingResult>> {
        let nzb = NzbDocument::parse(item.nzb_contents.as_bytes())?;
        let password = nzb.password().map(str::to_string);

        let events = self.events.clone();
        let id = item.id;
        let progress = ProgressReporter::new(Arc::new(move |percent| {
            events.send(Event::Progress { id, percent }).ok();
        }));

        let usage = UsageContext::for_job(UsageClass::Queue, item.job_name.clone());
        let pipeline = DeobfuscationPipeline::new(
            &self.fetcher,
            config,
            progress.clone(),
            usage.clone(),
            token.clone(),
        );
        let infos = Box::pin(pipeline.run(&nzb)).await?;

        let groups = group_files(infos);
        let rar_count = groups
            .iter()
            .filter(|g| g.kind == FileGroupKind::Rar)
            .count();
        let parallelism = rar_concurrency(config.connections.max_queue_connections, rar_count);

        let ctx = ProcessorContext {
            fetcher: &self.fetcher,
            usage,
            cancel: token.clone(),
            password,
        };
        let results = Box::pin(process_all(groups, &ctx, parallelism, &progress)).await?;
        progress.report(100);
        Ok(results)
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectionsConfig;
    use crate::missing_cache::MissingSegmentCache;
    use crate::nntp::test_server::TestServer;
    use crate::store::InMemoryStore;
    use crate::types::HistoryStatus;
    use crate::yenc::tests::encode;
    use std::time::Duration;

    /// Register a file's segments with the server and emit its NZB <file>
    fn nzb_file_xml(server: &TestServer, name: &str, data: &[u8], part_size: usize) -> String {
        let chunks: Vec<&[u8]> = data.chunks(part_size.max(1)).collect();
        let total = chunks.len();
        let mut segments = String::new();
        for (i, chunk) in chunks.iter().enumerate() {
            let id = format!("{name}-p{}@test", i + 1);
            let begin = (i * part_size + 1) as u64;
            let end = (i * part_size + chunk.len()) as u64;
            server.add_article(
                &id,
                &encode(
                    chunk,
                    name,
                    128,
                    Some((i as u32 + 1, total as u32, begin, end, data.len() as u64)),
                ),
            );
            segments.push_str(&format!(
                "<segment bytes=\"{}\" number=\"{}\">{id}</segment>",
                chunk.len() + 100,
                i + 1
            ));
        }
        format!(
            "<file poster=\"p@x\" date=\"1700000000\" subject=\"post - &quot;{name}&quot; yEnc\">\
             <groups><group>alt.binaries.test</group></groups>\
             <segments>{segments}</segments></file>"
        )
    }

    fn nzb_doc(files: &[String]) -> String {
        format!(
            "<?xml version=\"1.0\"?><nzb xmlns=\"http://www.newzbin.com/DTD/2003/nzb\">{}</nzb>",
            files.join("")
        )
    }

    struct Fixture {
        server: TestServer,
        store: Arc<InMemoryStore>,
        manager: QueueManager,
        worker: tokio::task::JoinHandle<()>,
    }

    async fn fixture_with_worker(start_worker: bool) -> Fixture {
        let server = TestServer::start().await;
        let config = Config {
            providers: vec![server.provider()],
            connections: ConnectionsConfig {
                connection_acquire_timeout_secs: 2,
                operation_timeout_secs: 5,
                idle_ping_after_secs: 3600,
                ..Default::default()
            },
            ..Default::default()
        };
        let store = Arc::new(InMemoryStore::new());
        let fetcher = Arc::new(SegmentFetcher::new(
            &config,
            Arc::new(MissingSegmentCache::default()),
        ));
        let manager = QueueManager::new(store.clone(), fetcher, ConfigHandle::new(config));
        let worker = if start_worker {
            manager.start()
        } else {
            tokio::spawn(async {})
        };
        Fixture {
            server,
            store,
            manager,
            worker,
        }
    }

    async fn fixture() -> Fixture {
        fixture_with_worker(true).await
    }

    /// Scheduler-only fixture: no worker, items stay queued
    async fn scheduler_fixture() -> Fixture {
        fixture_with_worker(false).await
    }

    async fn wait_for<F: Fn(&Event) -> bool>(
        rx: &mut broadcast::Receiver<Event>,
        what: F,
    ) -> Event {
        loop {
            let event = tokio::time::timeout(Duration::from_secs(10), rx.recv())
                .await
                .expect("timed out waiting for event")
                .expect("event channel closed");
            if what(&event) {
                return event;
            }
        }
    }

    #[tokio::test]
    async fn plain_job_completes_end_to_end() {
        let f = fixture().await;
        let mut events = f.manager.subscribe();

        let data: Vec<u8> = (0u8..=255).cycle().take(2500).collect();
        let xml = nzb_doc(&[nzb_file_xml(&f.server, "Nice.Movie.2024.mkv", &data, 1000)]);

        let id = f
            .manager
            .add_nzb(xml.as_bytes(), "Nice.Movie.2024", "movies", Priority::Normal)
            .await
            .unwrap();

        let completed = wait_for(&mut events, |e| matches!(e, Event::Completed { .. })).await;
        let Event::Completed {
            id: done_id,
            download_dir_id,
            ..
        } = completed
        else {
            unreachable!()
        };
        assert_eq!(done_id, id);

        // Queue → history, no orphans
        assert!(f.store.queue_items().await.unwrap().is_empty());
        let history = f.store.history_items().await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, HistoryStatus::Completed);

        // The mount item landed with the right size
        let file = f
            .store
            .get_item_child(download_dir_id, "Nice.Movie.2024.mkv")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(file.size, 2500);

        f.manager.shutdown().await;
        let _ = f.worker.await;
    }

    #[tokio::test]
    async fn missing_articles_fail_the_job() {
        let f = fixture().await;
        let mut events = f.manager.subscribe();

        // NZB referencing articles the server does not have
        let xml = nzb_doc(&["<file poster=\"p\" subject=\"&quot;gone.mkv&quot;\">\
            <groups><group>a.b.t</group></groups>\
            <segments><segment bytes=\"100\" number=\"1\">gone-p1@test</segment></segments>\
            </file>"
            .to_string()]);

        f.manager
            .add_nzb(xml.as_bytes(), "gone", "movies", Priority::Normal)
            .await
            .unwrap();

        let failed = wait_for(&mut events, |e| matches!(e, Event::Failed { .. })).await;
        let Event::Failed { reason, .. } = failed else {
            unreachable!()
        };
        assert_eq!(reason, FailureReason::MissingArticles);

        let history = f.store.history_items().await.unwrap();
        assert_eq!(history[0].status, HistoryStatus::Failed);
        assert_eq!(
            history[0].failure_reason,
            Some(FailureReason::MissingArticles)
        );
        assert!(f.store.queue_items().await.unwrap().is_empty());

        f.manager.shutdown().await;
    }

    #[tokio::test]
    async fn cancel_while_downloading_fails_then_next_job_runs() {
        let f = fixture().await;
        let mut events = f.manager.subscribe();

        // Slow the first job's body transfers to open a cancellation window
        f.server.set_body_delay(Duration::from_millis(400));
        let data = vec![0x42u8; 5000];
        let xml1 = nzb_doc(&[nzb_file_xml(&f.server, "First.mkv", &data, 5000)]);
        let xml2 = nzb_doc(&[nzb_file_xml(&f.server, "Second.mkv", &data, 5000)]);

        let first = f
            .manager
            .add_nzb(xml1.as_bytes(), "First", "movies", Priority::Normal)
            .await
            .unwrap();
        let second = f
            .manager
            .add_nzb(xml2.as_bytes(), "Second", "movies", Priority::Normal)
            .await
            .unwrap();

        // Cancel the first job once it is actively processing
        wait_for(&mut events, |e| matches!(e, Event::Started { id, .. } if *id == first)).await;
        f.manager.remove(first).await.unwrap();

        let failed = wait_for(&mut events, |e| matches!(e, Event::Failed { .. })).await;
        let Event::Failed { id, reason, .. } = failed else {
            unreachable!()
        };
        assert_eq!(id, first);
        assert_eq!(reason, FailureReason::TimeoutCancelled);

        // The second job proceeds and completes
        f.server.set_body_delay(Duration::ZERO);
        let completed = wait_for(&mut events, |e| matches!(e, Event::Completed { .. })).await;
        let Event::Completed { id, .. } = completed else {
            unreachable!()
        };
        assert_eq!(id, second);

        let history = f.store.history_items().await.unwrap();
        assert_eq!(history.len(), 2);
        let first_history = history.iter().find(|h| h.id == first).unwrap();
        assert_eq!(first_history.status, HistoryStatus::Failed);
        assert_eq!(
            first_history.failure_reason,
            Some(FailureReason::TimeoutCancelled)
        );

        f.manager.shutdown().await;
    }

    #[tokio::test]
    async fn transient_failure_pauses_the_job() {
        // Provider that refuses TCP connections entirely
        let dead = {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            drop(listener);
            addr
        };
        let config = Config {
            providers: vec![crate::config::ProviderConfig {
                host: "127.0.0.1".into(),
                port: dead.port(),
                tls: false,
                username: None,
                password: None,
                max_connections: 2,
                provider_type: crate::config::ProviderType::PrimaryPooled,
                priority: 0,
            }],
            connections: ConnectionsConfig {
                connection_acquire_timeout_secs: 1,
                operation_timeout_secs: 1,
                ..Default::default()
            },
            // Keep the connect backoff short; the provider stays dead anyway
            retry: crate::config::RetryConfig {
                max_attempts: 1,
                initial_delay_ms: 10,
                max_delay_ms: 50,
                backoff_multiplier: 2.0,
                jitter: false,
            },
            ..Default::default()
        };
        let store = Arc::new(InMemoryStore::new());
        let fetcher = Arc::new(SegmentFetcher::new(
            &config,
            Arc::new(MissingSegmentCache::default()),
        ));
        let manager = QueueManager::new(store.clone(), fetcher, ConfigHandle::new(config));
        let mut events = manager.subscribe();
        let _worker = manager.start();

        let xml = "<?xml version=\"1.0\"?><nzb><file poster=\"p\" subject=\"&quot;f.mkv&quot;\">\
            <groups><group>a.b.t</group></groups>\
            <segments><segment bytes=\"100\" number=\"1\">f-p1@test</segment></segments>\
            </file></nzb>";
        let id = manager
            .add_nzb(xml.as_bytes(), "f", "movies", Priority::Normal)
            .await
            .unwrap();

        let paused = wait_for(&mut events, |e| matches!(e, Event::Paused { .. })).await;
        let Event::Paused { id: paused_id, until } = paused else {
            unreachable!()
        };
        assert_eq!(paused_id, id);
        assert!(until > Utc::now());

        // No orphan: still queued with a pause, no history record
        let queue = store.queue_items().await.unwrap();
        assert_eq!(queue.len(), 1);
        assert!(queue[0].pause_until.is_some());
        assert!(store.history_items().await.unwrap().is_empty());

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn queue_orders_by_priority_then_age() {
        let f = scheduler_fixture().await;

        let data = vec![1u8; 10];
        let xml_low = nzb_doc(&[nzb_file_xml(&f.server, "low.bin", &data, 10)]);
        let xml_high = nzb_doc(&[nzb_file_xml(&f.server, "high.bin", &data, 10)]);

        let low = f
            .manager
            .add_nzb(xml_low.as_bytes(), "low", "c", Priority::Low)
            .await
            .unwrap();
        let high = f
            .manager
            .add_nzb(xml_high.as_bytes(), "high", "c", Priority::High)
            .await
            .unwrap();

        let next = f.manager.inner.pick_next().await.unwrap();
        assert_eq!(next.id, high, "higher priority wins over older item");

        f.store.remove_queue_items(&[high]).await.unwrap();
        let next = f.manager.inner.pick_next().await.unwrap();
        assert_eq!(next.id, low);
    }

    #[tokio::test]
    async fn paused_items_are_not_picked() {
        let f = scheduler_fixture().await;

        let data = vec![1u8; 10];
        let xml = nzb_doc(&[nzb_file_xml(&f.server, "p.bin", &data, 10)]);
        let id = f
            .manager
            .add_nzb(xml.as_bytes(), "p", "c", Priority::Normal)
            .await
            .unwrap();

        f.store
            .set_pause_until(id, Some(Utc::now() + ChronoDuration::minutes(5)))
            .await
            .unwrap();
        assert!(f.manager.inner.pick_next().await.is_none());

        // An elapsed pause makes it eligible again
        f.store
            .set_pause_until(id, Some(Utc::now() - ChronoDuration::seconds(1)))
            .await
            .unwrap();
        assert_eq!(f.manager.inner.pick_next().await.unwrap().id, id);
    }

    #[tokio::test]
    async fn removing_a_queued_job_emits_removed() {
        let f = scheduler_fixture().await;
        let mut events = f.manager.subscribe();

        let data = vec![1u8; 10];
        let xml = nzb_doc(&[nzb_file_xml(&f.server, "r.bin", &data, 10)]);
        let id = f
            .manager
            .add_nzb(xml.as_bytes(), "r", "c", Priority::Normal)
            .await
            .unwrap();

        f.manager.remove(id).await.unwrap();
        wait_for(&mut events, |e| matches!(e, Event::Removed { id: r } if *r == id)).await;
        assert!(f.store.queue_items().await.unwrap().is_empty());
    }
}
