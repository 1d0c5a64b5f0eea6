//! High-level segment fetching
//!
//! The fetcher turns "get the bytes of message-id X" into the full dance:
//! global-limiter admission, provider selection by affinity, pool leasing,
//! `BODY` + yEnc decode, and fallback across providers. Primaries are tried
//! before backups; a 430 moves on to the next provider, a transport error
//! likewise. Only when every provider has answered 430 does the segment
//! count as missing (and enter the known-missing cache); if any provider
//! failed transiently the error stays retryable.

mod affinity;
mod batch;

pub use affinity::ProviderAffinity;

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::limiter::{GlobalLimiter, UsagePermit};
use crate::missing_cache::MissingSegmentCache;
use crate::nntp::body::BodyStream;
use crate::nntp::pool::{PooledConnection, ProviderPool};
use crate::types::{MessageId, UsageContext};
use crate::yenc::{YencDecoded, YencDecoder, YencHeader};

/// Segment fetcher over all configured providers
pub struct SegmentFetcher {
    pools: Vec<ProviderPool>,
    /// (pool index, priority) of primary providers
    primaries: Vec<(usize, i32)>,
    /// (pool index, priority) of backup providers
    backups: Vec<(usize, i32)>,
    limiter: GlobalLimiter,
    affinity: ProviderAffinity,
    missing: Arc<MissingSegmentCache>,
}

impl SegmentFetcher {
    /// Build pools and the limiter from configuration
    pub fn new(config: &Config, missing: Arc<MissingSegmentCache>) -> Self {
        let mut pools = Vec::new();
        let mut primaries = Vec::new();
        let mut backups = Vec::new();

        for provider in config.providers.iter().filter(|p| p.is_enabled()) {
            let index = pools.len();
            if provider.is_backup() {
                backups.push((index, provider.priority));
            } else {
                primaries.push((index, provider.priority));
            }
            pools.push(ProviderPool::new(
                provider.clone(),
                &config.connections,
                config.retry.clone(),
            ));
        }

        Self {
            pools,
            primaries,
            backups,
            limiter: GlobalLimiter::new(config.primary_capacity(), &config.limiter),
            affinity: ProviderAffinity::new(config.connections.provider_affinity),
            missing: missing.clone(),
        }
    }

    /// The limiter, for components that need standalone admission
    pub fn limiter(&self) -> &GlobalLimiter {
        &self.limiter
    }

    /// The affinity table (diagnostics)
    pub fn affinity(&self) -> &ProviderAffinity {
        &self.affinity
    }

    /// Whether a segment is currently in the known-missing cache
    pub fn missing_contains(&self, message_id: &MessageId) -> bool {
        self.missing.contains(message_id)
    }

    /// Fetch and fully decode one segment, with provider fallback
    ///
    /// CRC mismatches count as corruption and also fall through to the next
    /// provider; they only surface once every provider has been tried.
    pub async fn fetch_segment(
        &self,
        message_id: &MessageId,
        ctx: &UsageContext,
        cancel: &CancellationToken,
    ) -> Result<YencDecoded> {
        if self.missing.contains(message_id) {
            return Err(Error::ArticleNotFound {
                message_id: message_id.as_str().to_string(),
            });
        }

        let _permit = with_cancel(cancel, self.limiter.acquire(ctx)).await?;
        let job = ctx.job_name.as_deref();

        let mut last_transient: Option<Error> = None;
        let mut last_corrupt: Option<Error> = None;
        let mut attempts = 0usize;
        let mut not_found = 0usize;

        for tier in [&self.primaries, &self.backups] {
            for index in self.affinity.order(job, tier) {
                if cancel.is_cancelled() {
                    return Err(Error::Cancelled);
                }
                attempts += 1;
                let started = Instant::now();

                match self.try_provider(index, message_id, cancel).await {
                    Ok(decoded) => {
                        self.affinity
                            .record_success(job, index, started.elapsed());
                        return Ok(decoded);
                    }
                    Err(Error::Cancelled) => return Err(Error::Cancelled),
                    Err(Error::ArticleNotFound { .. }) => {
                        self.affinity.record_failure(job, index);
                        not_found += 1;
                    }
                    Err(e @ (Error::CrcMismatch { .. } | Error::InvalidYenc(_))) => {
                        tracing::warn!(
                            message_id = %message_id,
                            provider = %self.pools[index].provider().host,
                            error = %e,
                            "segment corrupt, trying next provider"
                        );
                        self.affinity.record_failure(job, index);
                        last_corrupt = Some(e);
                    }
                    Err(e) => {
                        tracing::debug!(
                            message_id = %message_id,
                            provider = %self.pools[index].provider().host,
                            error = %e,
                            "provider failed, trying next"
                        );
                        self.affinity.record_failure(job, index);
                        last_transient = Some(e);
                    }
                }
            }
        }

        if let Some(e) = last_transient {
            return Err(e);
        }
        if let Some(e) = last_corrupt {
            return Err(e);
        }
        if attempts > 0 && not_found == attempts {
            self.missing.record(message_id);
        }
        Err(Error::ArticleNotFound {
            message_id: message_id.as_str().to_string(),
        })
    }

    /// Open a decoded streaming body for one segment
    ///
    /// Fallback applies up to the point the body starts streaming; after
    /// that, errors surface to the consumer. The yEnc header is parsed
    /// before this returns.
    pub async fn fetch_body(
        &self,
        message_id: &MessageId,
        ctx: &UsageContext,
        cancel: &CancellationToken,
    ) -> Result<SegmentBody> {
        if self.missing.contains(message_id) {
            return Err(Error::ArticleNotFound {
                message_id: message_id.as_str().to_string(),
            });
        }

        let permit = with_cancel(cancel, self.limiter.acquire(ctx)).await?;
        let job = ctx.job_name.as_deref();

        let mut permit = Some(permit);
        let mut last_transient: Option<Error> = None;
        let mut all_not_found = true;

        for tier in [&self.primaries, &self.backups] {
            for index in self.affinity.order(job, tier) {
                if cancel.is_cancelled() {
                    return Err(Error::Cancelled);
                }
                let started = Instant::now();

                let mut lease = match with_cancel(
                    cancel,
                    self.pools[index].acquire(),
                )
                .await?
                {
                    Ok(lease) => lease,
                    Err(e) => {
                        self.affinity.record_failure(job, index);
                        all_not_found = false;
                        last_transient = Some(e);
                        continue;
                    }
                };

                match lease.body(message_id).await {
                    Ok(stream) => {
                        let taken = permit.take().expect("permit consumed once");
                        match SegmentBody::start(stream, lease, taken, cancel.clone()).await {
                            Ok(body) => {
                                self.affinity
                                    .record_success(job, index, started.elapsed());
                                return Ok(body);
                            }
                            Err((e, returned_permit)) => {
                                self.affinity.record_failure(job, index);
                                all_not_found = false;
                                last_transient = Some(e);
                                permit = Some(returned_permit);
                            }
                        }
                    }
                    Err(Error::ArticleNotFound { .. }) => {
                        self.affinity.record_failure(job, index);
                    }
                    Err(e) => {
                        self.affinity.record_failure(job, index);
                        all_not_found = false;
                        last_transient = Some(e);
                    }
                }
            }
        }

        if let Some(e) = last_transient {
            return Err(e);
        }
        if all_not_found {
            self.missing.record(message_id);
        }
        Err(Error::ArticleNotFound {
            message_id: message_id.as_str().to_string(),
        })
    }

    /// Does the article exist on any provider
    pub async fn stat_exists(
        &self,
        message_id: &MessageId,
        ctx: &UsageContext,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        if self.missing.contains(message_id) {
            return Ok(false);
        }

        let _permit = with_cancel(cancel, self.limiter.acquire(ctx)).await?;
        let job = ctx.job_name.as_deref();

        let mut last_transient: Option<Error> = None;
        for tier in [&self.primaries, &self.backups] {
            for index in self.affinity.order(job, tier) {
                if cancel.is_cancelled() {
                    return Err(Error::Cancelled);
                }
                let mut lease = match with_cancel(cancel, self.pools[index].acquire()).await? {
                    Ok(lease) => lease,
                    Err(e) => {
                        last_transient = Some(e);
                        continue;
                    }
                };
                match lease.stat(message_id).await {
                    Ok(true) => return Ok(true),
                    Ok(false) => {}
                    Err(e) => last_transient = Some(e),
                }
            }
        }

        match last_transient {
            Some(e) => Err(e),
            None => Ok(false),
        }
    }

    /// One full-body attempt against one provider
    async fn try_provider(
        &self,
        index: usize,
        message_id: &MessageId,
        cancel: &CancellationToken,
    ) -> Result<YencDecoded> {
        let mut lease = with_cancel(cancel, self.pools[index].acquire()).await??;
        let mut stream = lease.body(message_id).await?;

        let mut decoder = YencDecoder::new();
        let mut data = Vec::new();
        loop {
            match with_cancel(cancel, stream.next_chunk()).await?? {
                Some(chunk) => {
                    let decoded = decoder.feed(&chunk)?;
                    data.extend_from_slice(&decoded);
                }
                None => break,
            }
        }
        let header = decoder.header().cloned().unwrap_or_default();
        let summary = decoder.finish()?;
        Ok(YencDecoded {
            header,
            data: Bytes::from(data),
            crc32: summary.crc32,
        })
    }
}

/// A streaming, decoded segment body
///
/// Holds the pool lease and limiter permit for the duration of the read;
/// both release when this is dropped. Dropping before the end of the body
/// abandons the transfer (the underlying connection is then discarded by
/// its pool).
pub struct SegmentBody {
    header: YencHeader,
    stream: BodyStream,
    decoder: Option<YencDecoder>,
    pending: VecDeque<Bytes>,
    cancel: CancellationToken,
    _lease: PooledConnection,
    _permit: UsagePermit,
}

impl SegmentBody {
    /// Pump the stream until the yEnc header is parsed
    async fn start(
        mut stream: BodyStream,
        lease: PooledConnection,
        permit: UsagePermit,
        cancel: CancellationToken,
    ) -> std::result::Result<Self, (Error, UsagePermit)> {
        let mut decoder = YencDecoder::new();
        let mut pending = VecDeque::new();

        loop {
            let chunk = match stream.next_chunk().await {
                Ok(Some(chunk)) => chunk,
                Ok(None) => {
                    return Err((
                        Error::InvalidYenc("body ended before yEnc header".into()),
                        permit,
                    ));
                }
                Err(e) => return Err((e, permit)),
            };
            match decoder.feed(&chunk) {
                Ok(decoded) => {
                    if !decoded.is_empty() {
                        pending.push_back(decoded);
                    }
                }
                Err(e) => return Err((e, permit)),
            }
            if let Some(header) = decoder.header() {
                return Ok(Self {
                    header: header.clone(),
                    stream,
                    decoder: Some(decoder),
                    pending,
                    cancel,
                    _lease: lease,
                    _permit: permit,
                });
            }
        }
    }

    /// Parsed yEnc header (filename, sizes, part info)
    pub fn header(&self) -> &YencHeader {
        &self.header
    }

    /// Next decoded chunk; `None` after the verified end of the part
    pub async fn next_chunk(&mut self) -> Result<Option<Bytes>> {
        if let Some(chunk) = self.pending.pop_front() {
            return Ok(Some(chunk));
        }
        if self.decoder.is_none() {
            return Ok(None);
        }

        loop {
            if self.cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            match with_cancel(&self.cancel, self.stream.next_chunk()).await?? {
                Some(chunk) => {
                    let decoder = self.decoder.as_mut().expect("decoder present");
                    let decoded = decoder.feed(&chunk)?;
                    if !decoded.is_empty() {
                        return Ok(Some(decoded));
                    }
                }
                None => {
                    // Stream complete: verify trailer and CRC
                    let decoder = self.decoder.take().expect("decoder present");
                    decoder.finish()?;
                    return Ok(None);
                }
            }
        }
    }

    /// Drain the remaining body into memory
    pub async fn read_to_end(&mut self) -> Result<Bytes> {
        let mut out = Vec::new();
        while let Some(chunk) = self.next_chunk().await? {
            out.extend_from_slice(&chunk);
        }
        Ok(Bytes::from(out))
    }
}

/// Race a future against job cancellation
pub(crate) async fn with_cancel<T>(
    cancel: &CancellationToken,
    fut: impl std::future::Future<Output = T>,
) -> Result<T> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Error::Cancelled),
        value = fut => Ok(value),
    }
}
