//! Seckill admission: the purchase entry point.
//!
//! One atomic backend evaluation checks stock, checks the per-voucher buyer
//! set, decrements stock, records the buyer and appends the order intent to
//! the stream. Concurrent attempts for the same voucher cannot interleave, so
//! "first N buyers, one order per buyer" holds across every instance.
//!
//! The order id is pre-allocated before the evaluation so it travels inside
//! the intent. A generator failure leaves it empty and the purchase proceeds.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::backend::{AdmissionBackend, AdmissionRequest, KeyValueStore};
use crate::config::AdmissionConfig;
use crate::errors::{AdmissionError, AdmissionResult, BackendError};
use crate::id_gen::IdGenerator;
use crate::intent::OrderIntent;
use crate::timeout::bounded;
use crate::types::{OrderId, UserId, VoucherId};

/// Raw reply of the admission script.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AdmissionCode {
    /// Stock taken, buyer recorded, intent appended
    Ok = 0,
    /// Voucher unknown or stock exhausted
    OutOfStock = 1,
    /// Buyer already admitted for this voucher
    Duplicate = 2,
}

impl TryFrom<i64> for AdmissionCode {
    type Error = AdmissionError;

    fn try_from(code: i64) -> Result<Self, Self::Error> {
        match code {
            0 => Ok(Self::Ok),
            1 => Ok(Self::OutOfStock),
            2 => Ok(Self::Duplicate),
            other => Err(AdmissionError::UnexpectedReply(other)),
        }
    }
}

/// What a purchase attempt achieved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AdmissionOutcome {
    /// The purchase is queued for materialization.
    Admitted {
        /// Pre-allocated order id, absent when the generator failed
        order_id: Option<OrderId>,
    },
    /// No stock left.
    OutOfStock,
    /// This buyer already holds an admission for the voucher.
    Duplicate,
}

impl AdmissionOutcome {
    /// Whether the purchase was admitted.
    pub const fn is_admitted(&self) -> bool {
        matches!(self, Self::Admitted { .. })
    }
}

/// Purchase entry point.
pub struct AdmissionScript {
    backend: Arc<dyn AdmissionBackend>,
    kv: Arc<dyn KeyValueStore>,
    ids: Arc<dyn IdGenerator>,
    config: AdmissionConfig,
    stream_key: String,
    call_timeout: Duration,
}

impl std::fmt::Debug for AdmissionScript {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionScript")
            .field("config", &self.config)
            .field("stream_key", &self.stream_key)
            .finish_non_exhaustive()
    }
}

impl AdmissionScript {
    /// Creates the entry point publishing intents to `stream_key`.
    pub fn new(
        backend: Arc<dyn AdmissionBackend>,
        kv: Arc<dyn KeyValueStore>,
        ids: Arc<dyn IdGenerator>,
        config: AdmissionConfig,
        stream_key: impl Into<String>,
        call_timeout: Duration,
    ) -> Self {
        Self {
            backend,
            kv,
            ids,
            config,
            stream_key: stream_key.into(),
            call_timeout,
        }
    }

    /// Key of the admission stock counter of `voucher_id`.
    pub fn stock_key(&self, voucher_id: VoucherId) -> String {
        format!("{}{voucher_id}", self.config.stock_key_prefix)
    }

    /// Key of the admitted-buyer set of `voucher_id`.
    pub fn buyers_key(&self, voucher_id: VoucherId) -> String {
        format!("{}{voucher_id}", self.config.buyers_key_prefix)
    }

    /// Attempts to buy one unit of `voucher_id` for `user_id`.
    #[instrument(skip(self))]
    pub async fn attempt_purchase(
        &self,
        user_id: UserId,
        voucher_id: VoucherId,
    ) -> AdmissionResult<AdmissionOutcome> {
        let order_id = match bounded(
            self.call_timeout,
            self.ids.next_id(&self.config.order_namespace),
        )
        .await
        {
            Ok(id) => Some(OrderId::new(id)),
            Err(e) => {
                warn!(error = %e, "order id pre-allocation failed, continuing without one");
                None
            }
        };

        let intent = OrderIntent {
            order_id,
            user_id,
            voucher_id,
        };
        let request = AdmissionRequest {
            stock_key: self.stock_key(voucher_id),
            buyers_key: self.buyers_key(voucher_id),
            stream_key: self.stream_key.clone(),
            buyer: user_id.to_string(),
            intent: intent.to_fields(),
        };

        let reply = bounded(self.call_timeout, self.backend.evaluate_admission(&request)).await?;
        let outcome = match AdmissionCode::try_from(reply)? {
            AdmissionCode::Ok => {
                info!(order_id = ?order_id, "purchase admitted");
                AdmissionOutcome::Admitted { order_id }
            }
            AdmissionCode::OutOfStock => AdmissionOutcome::OutOfStock,
            AdmissionCode::Duplicate => AdmissionOutcome::Duplicate,
        };
        Ok(outcome)
    }

    /// Sets the admission stock of a newly created seckill voucher.
    #[instrument(skip(self))]
    pub async fn preload_stock(&self, voucher_id: VoucherId, stock: u64) -> AdmissionResult<()> {
        bounded(
            self.call_timeout,
            self.kv.set(&self.stock_key(voucher_id), &stock.to_string()),
        )
        .await?;
        info!("seckill stock preloaded");
        Ok(())
    }

    /// Admission stock left, `None` if never preloaded.
    pub async fn remaining_stock(&self, voucher_id: VoucherId) -> AdmissionResult<Option<u64>> {
        let key = self.stock_key(voucher_id);
        let Some(raw) = bounded(self.call_timeout, self.kv.get(&key)).await? else {
            return Ok(None);
        };
        raw.parse()
            .map(Some)
            .map_err(|e: std::num::ParseIntError| {
                AdmissionError::Backend(BackendError::Corrupt {
                    key,
                    detail: e.to_string(),
                })
            })
    }
}
