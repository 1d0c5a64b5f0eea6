//! End-to-end scenarios against an in-process NNTP server

mod common;

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use common::{
    MockNntpServer, hash16k, nzb_doc, par2_file_desc, post_file, rar4_stored_block, rar4_volume,
    yenc_encode,
};
use nzb_mount::config::ConnectionsConfig;
use nzb_mount::store::{InMemoryStore, MetadataStore, MountContent};
use nzb_mount::types::{Event, HistoryStatus};
use nzb_mount::{
    Config, Error, FailureReason, MessageId, MountItem, NzbMount, Priority, SegmentFetcher,
    UsageClass, UsageContext,
};

fn config_for(servers: &[&MockNntpServer]) -> Config {
    let mut config = Config {
        connections: ConnectionsConfig {
            connection_acquire_timeout_secs: 2,
            operation_timeout_secs: 5,
            idle_ping_after_secs: 3600,
            ..Default::default()
        },
        ..Default::default()
    };
    for server in servers {
        config.providers.push(server.provider());
    }
    config
}

async fn wait_for<F: Fn(&Event) -> bool>(
    rx: &mut tokio::sync::broadcast::Receiver<Event>,
    what: F,
) -> Event {
    loop {
        let event = tokio::time::timeout(Duration::from_secs(15), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed");
        if what(&event) {
            return event;
        }
    }
}

#[tokio::test]
async fn stored_rar_over_three_segments_mounts_one_file() {
    let server = MockNntpServer::start().await;
    let store = Arc::new(InMemoryStore::new());
    let mount = NzbMount::new(config_for(&[&server]), store.clone()).expect("start");
    let mut events = mount.subscribe();

    // One stored, unencrypted RAR holding a single file, posted over 3 segments
    let payload: Vec<u8> = (0u8..=255).cycle().take(90_000).collect();
    let volume = rar4_volume(&[rar4_stored_block("Great.Movie.2024.mkv", &payload)]);
    let part = volume.len() / 3 + 1;
    let xml = nzb_doc(&[post_file(
        &server,
        "Great.Movie.2024.rar",
        "Great.Movie.2024.rar",
        &volume,
        part,
    )]);

    mount
        .queue()
        .add_nzb(xml.as_bytes(), "Great.Movie.2024", "movies", Priority::Normal)
        .await
        .expect("enqueue");

    let Event::Completed {
        download_dir_id, ..
    } = wait_for(&mut events, |e| matches!(e, Event::Completed { .. })).await
    else {
        unreachable!()
    };

    // Deterministic id chain: root → category → job
    let category_id = MountItem::child_id(store.root_id(), "movies");
    assert_eq!(
        download_dir_id,
        MountItem::child_id(category_id, "Great.Movie.2024")
    );

    let file = store
        .get_item_child(download_dir_id, "Great.Movie.2024.mkv")
        .await
        .expect("store")
        .expect("mounted file");
    assert_eq!(file.size, payload.len() as u64, "size is the advertised entry size");

    let Some(MountContent::Segments { spans, .. }) = &file.content else {
        panic!("file should carry segment spans");
    };
    assert_eq!(spans.len(), 3, "entry data crosses all three segments");
    let covered: u64 = spans.iter().map(|s| s.end - s.start).sum();
    assert_eq!(covered, payload.len() as u64);
    // Spans arrive in strict byte order over the segment sequence
    for pair in spans.windows(2) {
        assert!(pair[0].message_id != pair[1].message_id);
    }

    // Second ingestion of the same NZB with increment behavior yields " (2)"
    mount
        .queue()
        .add_nzb(xml.as_bytes(), "Great.Movie.2024", "movies", Priority::Normal)
        .await
        .expect("enqueue again");
    wait_for(&mut events, |e| matches!(e, Event::Completed { .. })).await;

    let sibling = store
        .get_item_child(category_id, "Great.Movie.2024 (2)")
        .await
        .expect("store")
        .expect("incremented sibling");
    assert_eq!(
        sibling.id,
        MountItem::child_id(category_id, "Great.Movie.2024 (2)")
    );

    mount.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn par2_canonical_names_override_obfuscated_headers() {
    let server = MockNntpServer::start().await;
    let store = Arc::new(InMemoryStore::new());
    let mount = NzbMount::new(config_for(&[&server]), store.clone()).expect("start");
    let mut events = mount.subscribe();

    // Two media files whose subjects and yEnc headers only carry junk names
    let data_a: Vec<u8> = (0u8..200).cycle().take(30_000).collect();
    let data_b: Vec<u8> = (50u8..250).cycle().take(40_000).collect();

    let file_a = post_file(&server, "obfuscated123", "obfuscated123", &data_a, 50_000);
    let file_b = post_file(&server, "obfuscated456", "obfuscated456", &data_b, 50_000);

    // The Par2 index knows the real names, keyed by 16 KiB hashes
    let mut par2 = par2_file_desc("A.mkv", data_a.len() as u64, hash16k(&data_a));
    par2.extend_from_slice(&par2_file_desc("B.mkv", data_b.len() as u64, hash16k(&data_b)));
    let file_par2 = post_file(&server, "release.par2", "release.par2", &par2, 50_000);

    let xml = nzb_doc(&[file_a, file_b, file_par2]);
    mount
        .queue()
        .add_nzb(xml.as_bytes(), "Obfuscated.Release", "movies", Priority::Normal)
        .await
        .expect("enqueue");

    let Event::Completed {
        download_dir_id, ..
    } = wait_for(&mut events, |e| matches!(e, Event::Completed { .. })).await
    else {
        unreachable!()
    };

    // Canonical names from the Par2 descriptors appear in the mount
    let a = store
        .get_item_child(download_dir_id, "A.mkv")
        .await
        .expect("store")
        .expect("A.mkv mounted");
    assert_eq!(a.size, data_a.len() as u64);
    let b = store
        .get_item_child(download_dir_id, "B.mkv")
        .await
        .expect("store")
        .expect("B.mkv mounted");
    assert_eq!(b.size, data_b.len() as u64);

    // The junk names are gone, and the Par2 file itself is not mounted
    for junk in ["obfuscated123", "obfuscated456", "release.par2"] {
        assert!(
            store
                .get_item_child(download_dir_id, junk)
                .await
                .expect("store")
                .is_none(),
            "{junk} must not be mounted"
        );
    }

    mount.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn fetcher_falls_back_to_second_provider_and_affinity_drops() {
    let p1 = MockNntpServer::start().await;
    let p2 = MockNntpServer::start().await;

    // <abc@x> exists only on provider 2
    let payload = b"the payload served by provider two".to_vec();
    p2.add_article("abc@x", &yenc_encode(&payload, "f.bin", 128, None));

    let fetcher = SegmentFetcher::new(
        &config_for(&[&p1, &p2]),
        Arc::new(nzb_mount::missing_cache::MissingSegmentCache::default()),
    );

    let ctx = UsageContext::for_job(UsageClass::Streaming, "fallback-job");
    let decoded = fetcher
        .fetch_segment(&MessageId::new("abc@x"), &ctx, &CancellationToken::new())
        .await
        .expect("fetched from provider 2");
    assert_eq!(decoded.data.as_ref(), payload.as_slice());

    // Provider 1 answered 430; its affinity score dropped below provider 2's
    let s1 = fetcher.affinity().score(Some("fallback-job"), 0);
    let s2 = fetcher.affinity().score(Some("fallback-job"), 1);
    assert!(s1 < s2, "p1 score {s1} should be below p2 score {s2}");
}

#[tokio::test]
async fn mid_body_cancellation_returns_permits_and_replaces_connection() {
    let server = MockNntpServer::start().await;

    // 1 MiB body with a small stream buffer so the transfer cannot finish
    // without a consumer
    let payload = vec![0x5Au8; 1024 * 1024];
    server.add_article(
        "big@x",
        &yenc_encode(&payload, "big.bin", 128, Some((1, 1, 1, 1024 * 1024, 1024 * 1024))),
    );

    let mut config = config_for(&[&server]);
    config.connections.stream_buffer_size = 128 * 1024;
    let fetcher = SegmentFetcher::new(
        &config,
        Arc::new(nzb_mount::missing_cache::MissingSegmentCache::default()),
    );
    let baseline = fetcher.limiter().available(UsageClass::Streaming);

    let ctx = UsageContext::of(UsageClass::Streaming);
    let cancel = CancellationToken::new();
    let mut body = fetcher
        .fetch_body(&MessageId::new("big@x"), &ctx, &cancel)
        .await
        .expect("body opened");

    // Consume roughly 200 KiB, then cancel mid-body
    let mut consumed = 0usize;
    while consumed < 200 * 1024 {
        let chunk = body
            .next_chunk()
            .await
            .expect("chunk")
            .expect("body not finished yet");
        consumed += chunk.len();
    }
    assert!(
        fetcher.limiter().available(UsageClass::Streaming) < baseline,
        "an open body holds a limiter permit"
    );
    cancel.cancel();
    let error = body.next_chunk().await.expect_err("cancelled consumer");
    assert!(matches!(error, Error::Cancelled));
    drop(body);

    // The limiter permit came back on drop
    assert_eq!(fetcher.limiter().available(UsageClass::Streaming), baseline);

    // The broken connection is replaced: the next fetch opens a new TCP
    // connection and succeeds
    let before = server.accepted();
    let again = fetcher
        .fetch_segment(&MessageId::new("big@x"), &ctx, &CancellationToken::new())
        .await
        .expect("refetch succeeds");
    assert_eq!(again.data.len(), payload.len());
    assert!(server.accepted() > before, "pool opened a replacement connection");
}

#[tokio::test]
async fn crc_mismatch_names_file_and_part() {
    let server = MockNntpServer::start().await;

    let mut wire = yenc_encode(b"bytes that will not match", "Named.File.mkv", 128, Some((4, 9, 1, 25, 225)));
    let text = String::from_utf8(wire.clone()).expect("ascii");
    let at = text.find("pcrc32=").expect("trailer");
    wire[at + 7..at + 15].copy_from_slice(b"deadbeef");
    server.add_article("bad@x", &wire);

    let fetcher = SegmentFetcher::new(
        &config_for(&[&server]),
        Arc::new(nzb_mount::missing_cache::MissingSegmentCache::default()),
    );

    let error = fetcher
        .fetch_segment(
            &MessageId::new("bad@x"),
            &UsageContext::of(UsageClass::Queue),
            &CancellationToken::new(),
        )
        .await
        .expect_err("corrupt segment");
    match error {
        Error::CrcMismatch { filename, part, .. } => {
            assert_eq!(filename, "Named.File.mkv");
            assert_eq!(part, 4);
        }
        other => panic!("expected CrcMismatch, got {other:?}"),
    }
}

#[tokio::test]
async fn cancelled_job_fails_and_next_job_completes() {
    let server = MockNntpServer::start().await;
    let store = Arc::new(InMemoryStore::new());
    let mount = NzbMount::new(config_for(&[&server]), store.clone()).expect("start");
    let mut events = mount.subscribe();

    server.set_body_delay(Duration::from_millis(400));
    let data = vec![0x11u8; 4000];
    let xml1 = nzb_doc(&[post_file(&server, "first.mkv", "first.mkv", &data, 4000)]);
    let xml2 = nzb_doc(&[post_file(&server, "second.mkv", "second.mkv", &data, 4000)]);

    let first = mount
        .queue()
        .add_nzb(xml1.as_bytes(), "First.Job", "tv", Priority::Normal)
        .await
        .expect("enqueue first");
    let second = mount
        .queue()
        .add_nzb(xml2.as_bytes(), "Second.Job", "tv", Priority::Normal)
        .await
        .expect("enqueue second");

    wait_for(&mut events, |e| matches!(e, Event::Started { id, .. } if *id == first)).await;
    mount.queue().remove(first).await.expect("cancel first");

    let Event::Failed { id, reason, .. } =
        wait_for(&mut events, |e| matches!(e, Event::Failed { .. })).await
    else {
        unreachable!()
    };
    assert_eq!(id, first);
    assert_eq!(reason, FailureReason::TimeoutCancelled);

    server.set_body_delay(Duration::ZERO);
    let Event::Completed { id, .. } =
        wait_for(&mut events, |e| matches!(e, Event::Completed { .. })).await
    else {
        unreachable!()
    };
    assert_eq!(id, second);

    let history = store.history_items().await.expect("history");
    assert_eq!(history.len(), 2);
    let first_record = history.iter().find(|h| h.id == first).expect("first record");
    assert_eq!(first_record.status, HistoryStatus::Failed);
    assert_eq!(
        first_record.fail_message.as_deref(),
        Some("operation cancelled")
    );
    let second_record = history.iter().find(|h| h.id == second).expect("second record");
    assert_eq!(second_record.status, HistoryStatus::Completed);
    assert!(store.queue_items().await.expect("queue").is_empty());

    mount.shutdown().await.expect("shutdown");
}
