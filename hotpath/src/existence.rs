//! Probabilistic set of valid entity ids.
//!
//! A Bloom filter stored as one bitmap per entity kind in the shared backend.
//! `false` from [`ExistenceFilter::might_exist`] means the id was never
//! registered; `true` may be a false positive and must still be verified.
//!
//! Registration after entity creation is asynchronous. The window is bounded:
//! [`ExistenceFilter::register_in_background`] retries until
//! `max_registration_lag` and reports a miss at `error`, while the registering
//! process answers `true` for the id from a local set in the meantime.

use std::collections::HashSet;
use std::f64::consts::LN_2;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, error, instrument, warn};

use crate::backend::BitmapStore;
use crate::background::{BackgroundPool, JobError};
use crate::backoff::{BackoffPolicy, Deadline};
use crate::clock::Clock;
use crate::config::FilterConfig;
use crate::errors::BackendResult;
use crate::timeout::bounded;
use crate::types::EntityKind;

const WARM_UP_CHUNK: usize = 1_000;

/// Size and hash count of a Bloom filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BloomParameters {
    /// Number of bits
    pub bits: u64,
    /// Number of bit positions per id
    pub hashes: u32,
}

impl BloomParameters {
    /// Optimal parameters for `expected_items` at `false_positive_rate`.
    ///
    /// `m = -n ln p / (ln 2)^2`, `k = (m / n) ln 2`, both at least 1.
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    pub fn optimal(expected_items: u64, false_positive_rate: f64) -> Self {
        let n = expected_items.max(1) as f64;
        let p = false_positive_rate.clamp(f64::MIN_POSITIVE, 0.5);
        let m = (-(n * p.ln()) / (LN_2 * LN_2)).ceil().max(1.0);
        let k = ((m / n) * LN_2).round().max(1.0);
        Self {
            bits: m as u64,
            hashes: k as u32,
        }
    }

    /// Bit offsets of `id` within a filter for `kind`.
    ///
    /// Double hashing over a SHA-256 digest, so every process computes the
    /// same positions.
    pub fn positions(&self, kind: EntityKind, id: u64) -> Vec<u64> {
        let digest = Sha256::digest(format!("{kind}:{id}").as_bytes());
        let mut first = [0_u8; 8];
        let mut second = [0_u8; 8];
        first.copy_from_slice(&digest[..8]);
        second.copy_from_slice(&digest[8..16]);
        let h1 = u64::from_le_bytes(first);
        let h2 = u64::from_le_bytes(second) | 1;

        (0..u64::from(self.hashes))
            .map(|i| h1.wrapping_add(i.wrapping_mul(h2)) % self.bits)
            .collect()
    }
}

/// Existence filter over the shared bitmap backend.
pub struct ExistenceFilter {
    bitmap: Arc<dyn BitmapStore>,
    clock: Arc<dyn Clock>,
    params: BloomParameters,
    key_prefix: String,
    call_timeout: Duration,
    max_lag: Duration,
    retry: BackoffPolicy,
    recent: Mutex<HashSet<(EntityKind, u64)>>,
}

impl std::fmt::Debug for ExistenceFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExistenceFilter")
            .field("params", &self.params)
            .field("key_prefix", &self.key_prefix)
            .finish_non_exhaustive()
    }
}

impl ExistenceFilter {
    /// Creates a filter sized by `config`.
    pub fn new(
        bitmap: Arc<dyn BitmapStore>,
        clock: Arc<dyn Clock>,
        config: &FilterConfig,
        call_timeout: Duration,
    ) -> Self {
        Self {
            bitmap,
            clock,
            params: BloomParameters::optimal(
                config.expected_items.into(),
                config.false_positive_rate.into(),
            ),
            key_prefix: config.key_prefix.clone(),
            call_timeout,
            max_lag: config.max_registration_lag,
            retry: config.registration_retry,
            recent: Mutex::new(HashSet::new()),
        }
    }

    /// Filter parameters in use.
    pub const fn parameters(&self) -> BloomParameters {
        self.params
    }

    fn key(&self, kind: EntityKind) -> String {
        format!("{}{kind}", self.key_prefix)
    }

    /// Whether `id` may have been registered.
    ///
    /// Fails open: a backend error answers `true` so that a filter outage
    /// degrades to cache/store lookups rather than false "not found" replies.
    pub async fn might_exist(&self, kind: EntityKind, id: u64) -> bool {
        if self.recent.lock().contains(&(kind, id)) {
            return true;
        }
        let positions = self.params.positions(kind, id);
        let key = self.key(kind);
        match bounded(self.call_timeout, self.bitmap.get_bits(&key, &positions)).await {
            Ok(bits) => bits.iter().all(|bit| *bit),
            Err(e) => {
                warn!(%kind, id, error = %e, "existence filter unavailable, failing open");
                true
            }
        }
    }

    /// Registers `id`. Idempotent.
    pub async fn register(&self, kind: EntityKind, id: u64) -> BackendResult<()> {
        let positions = self.params.positions(kind, id);
        let key = self.key(kind);
        bounded(self.call_timeout, self.bitmap.set_bits(&key, &positions)).await
    }

    /// Registers `id` through `pool`, retrying until the lag bound.
    ///
    /// Until the registration is confirmed this process answers `true` for the
    /// id. Returns whether the job was accepted by the pool.
    pub fn register_in_background(
        self: &Arc<Self>,
        pool: &BackgroundPool,
        kind: EntityKind,
        id: u64,
    ) -> bool {
        self.recent.lock().insert((kind, id));
        let filter = Arc::clone(self);
        let accepted = pool.try_submit(format!("register {kind} {id}"), async move {
            filter
                .register_with_retry(kind, id)
                .await
                .map_err(|e| -> JobError { Box::new(e) })
        });
        if !accepted {
            error!(%kind, id, "existence filter registration could not be scheduled");
        }
        accepted
    }

    async fn register_with_retry(&self, kind: EntityKind, id: u64) -> BackendResult<()> {
        let deadline = Deadline::after(self.clock.as_ref(), self.max_lag);
        let mut delays = self.retry.schedule();
        loop {
            match self.register(kind, id).await {
                Ok(()) => {
                    self.recent.lock().remove(&(kind, id));
                    debug!(%kind, id, "existence filter registration confirmed");
                    return Ok(());
                }
                Err(e) => {
                    let next = delays
                        .next()
                        .filter(|_| !deadline.is_expired(self.clock.as_ref()));
                    let Some(delay) = next else {
                        error!(
                            %kind,
                            id,
                            max_lag = ?self.max_lag,
                            error = %e,
                            "existence filter registration exceeded its lag bound"
                        );
                        return Err(e);
                    };
                    warn!(%kind, id, error = %e, ?delay, "existence filter registration failed, retrying");
                    tokio::time::sleep(delay.min(deadline.remaining(self.clock.as_ref()))).await;
                }
            }
        }
    }

    /// Registers every id, in chunks. Returns how many were registered.
    #[instrument(skip(self, ids))]
    pub async fn warm_up<I>(&self, kind: EntityKind, ids: I) -> BackendResult<usize>
    where
        I: IntoIterator<Item = u64> + Send,
        I::IntoIter: Send,
    {
        let key = self.key(kind);
        let mut registered = 0;
        let mut positions = Vec::new();
        let mut pending = 0;

        for id in ids {
            positions.extend(self.params.positions(kind, id));
            pending += 1;
            if pending == WARM_UP_CHUNK {
                bounded(self.call_timeout, self.bitmap.set_bits(&key, &positions)).await?;
                registered += pending;
                positions.clear();
                pending = 0;
            }
        }
        if pending > 0 {
            bounded(self.call_timeout, self.bitmap.set_bits(&key, &positions)).await?;
            registered += pending;
        }

        debug!(%kind, registered, "existence filter warmed up");
        Ok(registered)
    }
}
