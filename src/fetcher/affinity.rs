//! Provider affinity scoring
//!
//! Per job, each provider carries a success/latency score that decays with
//! age. Providers are tried in descending score order; ties fall back to
//! the configured provider priority. With affinity disabled the fetcher
//! round-robins across enabled primary providers instead.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

/// Exponential smoothing weight for new observations
const SMOOTHING: f64 = 0.2;

/// Score half-life: scores fade toward neutral as observations age
const HALF_LIFE: Duration = Duration::from_secs(300);

/// Neutral score for providers without observations
const NEUTRAL: f64 = 0.5;

#[derive(Clone, Copy, Debug)]
struct Score {
    value: f64,
    updated: Instant,
}

impl Score {
    fn decayed(&self, now: Instant) -> f64 {
        let age = now.duration_since(self.updated).as_secs_f64();
        let half_lives = age / HALF_LIFE.as_secs_f64();
        // Fade toward neutral rather than zero so stale scores neither
        // condemn nor favor a provider forever
        NEUTRAL + (self.value - NEUTRAL) * 0.5f64.powf(half_lives)
    }
}

/// Success/latency affinity table, keyed by (job, provider index)
pub struct ProviderAffinity {
    enabled: bool,
    scores: std::sync::Mutex<HashMap<(String, usize), Score>>,
    round_robin: AtomicUsize,
}

impl ProviderAffinity {
    /// Create the table; `enabled = false` selects round-robin ordering
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            scores: std::sync::Mutex::new(HashMap::new()),
            round_robin: AtomicUsize::new(0),
        }
    }

    /// Record a successful fetch with its latency
    pub fn record_success(&self, job: Option<&str>, provider: usize, latency: Duration) {
        // Fast responses score near 1, slow ones fade toward 0
        let observation = 1.0 / (1.0 + latency.as_secs_f64());
        self.update(job, provider, observation);
    }

    /// Record a failed fetch (not-found or transport error)
    pub fn record_failure(&self, job: Option<&str>, provider: usize) {
        self.update(job, provider, 0.0);
    }

    /// Current score for diagnostics and tests
    pub fn score(&self, job: Option<&str>, provider: usize) -> f64 {
        let key = (job.unwrap_or_default().to_string(), provider);
        let scores = self.scores.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        scores
            .get(&key)
            .map(|s| s.decayed(Instant::now()))
            .unwrap_or(NEUTRAL)
    }

    /// Order provider indices for a fetch attempt
    ///
    /// `candidates` carries `(index, priority)` pairs, already filtered to
    /// the providers eligible for this attempt (primaries or backups).
    pub fn order(&self, job: Option<&str>, candidates: &[(usize, i32)]) -> Vec<usize> {
        if candidates.is_empty() {
            return Vec::new();
        }
        if !self.enabled {
            // Round-robin: rotate the candidate list by a shared counter
            let start = self.round_robin.fetch_add(1, Ordering::Relaxed) % candidates.len();
            return candidates
                .iter()
                .cycle()
                .skip(start)
                .take(candidates.len())
                .map(|(i, _)| *i)
                .collect();
        }

        let now = Instant::now();
        let scores = self.scores.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let job_key = job.unwrap_or_default();

        let mut ordered: Vec<(usize, f64, i32)> = candidates
            .iter()
            .map(|&(index, priority)| {
                let score = scores
                    .get(&(job_key.to_string(), index))
                    .map(|s| s.decayed(now))
                    .unwrap_or(NEUTRAL);
                (index, score, priority)
            })
            .collect();

        // Higher score first; ties by declared priority (lower first)
        ordered.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.2.cmp(&b.2))
        });
        ordered.into_iter().map(|(i, _, _)| i).collect()
    }

    fn update(&self, job: Option<&str>, provider: usize, observation: f64) {
        let key = (job.unwrap_or_default().to_string(), provider);
        let now = Instant::now();
        let mut scores = self.scores.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let entry = scores.entry(key).or_insert(Score {
            value: NEUTRAL,
            updated: now,
        });
        let decayed = entry.decayed(now);
        entry.value = decayed * (1.0 - SMOOTHING) + observation * SMOOTHING;
        entry.updated = now;
    }
}
