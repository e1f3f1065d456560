//! Idempotent conversion of order intents into durable orders.
//!
//! Each intent is applied inside one store transaction:
//!
//! 1. an existing order for the (user, voucher) pair means the intent was
//!    already handled: nothing is written;
//! 2. the seckill stock is decremented under `stock >= 1`;
//! 3. the general voucher stock is decremented under the same guard;
//! 4. the order row is inserted;
//! 5. the transaction commits.
//!
//! A guarded decrement that touches zero rows means the stores disagree with
//! the admission state. That is an [`InvariantViolation`](MaterializeError::InvariantViolation):
//! the transaction is rolled back and the message must not be acknowledged.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, instrument, warn};

use crate::clock::Clock;
use crate::errors::{MaterializeError, MaterializeResult, StoreError};
use crate::intent::OrderIntent;
use crate::store::{NewVoucherOrder, OrderStore, OrderTransaction, VoucherOrder};
use crate::timeout::bounded;

pub use crate::errors::StockCounter;

/// Result of applying one intent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MaterializeOutcome {
    /// The order row was created and committed.
    Committed(VoucherOrder),
    /// An order for the pair already existed; nothing was written.
    AlreadyMaterialized,
}

/// Applies order intents to the relational store.
pub struct OrderMaterializer {
    store: Arc<dyn OrderStore>,
    clock: Arc<dyn Clock>,
    call_timeout: Duration,
}

impl std::fmt::Debug for OrderMaterializer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrderMaterializer")
            .field("call_timeout", &self.call_timeout)
            .finish_non_exhaustive()
    }
}

impl OrderMaterializer {
    /// Creates a materializer over `store`.
    pub fn new(store: Arc<dyn OrderStore>, clock: Arc<dyn Clock>, call_timeout: Duration) -> Self {
        Self {
            store,
            clock,
            call_timeout,
        }
    }

    /// Applies `intent` in one transaction.
    ///
    /// Safe to call again for the same intent after a crash or a failed
    /// acknowledgement.
    #[instrument(skip(self, intent), fields(user_id = %intent.user_id, voucher_id = %intent.voucher_id))]
    pub async fn materialize(&self, intent: &OrderIntent) -> MaterializeResult<MaterializeOutcome> {
        let mut tx = bounded(self.call_timeout, self.store.begin()).await?;

        let applied = self.apply(tx.as_mut(), intent).await;
        let outcome = match applied {
            Ok(Some(order)) => match bounded(self.call_timeout, tx.commit()).await {
                Ok(()) => {
                    info!(row_id = order.id, order_id = ?order.order_id, "order materialized");
                    Ok(MaterializeOutcome::Committed(order))
                }
                Err(e) => Err(MaterializeError::from(e)),
            },
            Ok(None) => {
                self.rollback(tx).await;
                debug!("order already exists, nothing to do");
                Ok(MaterializeOutcome::AlreadyMaterialized)
            }
            Err(e) => {
                self.rollback(tx).await;
                Err(e)
            }
        };

        match outcome {
            Err(MaterializeError::Store(StoreError::UniqueViolation(detail))) => {
                debug!(%detail, "concurrent redelivery already inserted the order");
                Ok(MaterializeOutcome::AlreadyMaterialized)
            }
            Err(e @ MaterializeError::InvariantViolation { .. }) => {
                error!(error = %e, "stock desync, order intent needs operator intervention");
                Err(e)
            }
            other => other,
        }
    }

    async fn apply(
        &self,
        tx: &mut dyn OrderTransaction,
        intent: &OrderIntent,
    ) -> MaterializeResult<Option<VoucherOrder>> {
        if bounded(
            self.call_timeout,
            tx.order_exists(intent.user_id, intent.voucher_id),
        )
        .await?
        {
            return Ok(None);
        }

        let seckill = bounded(self.call_timeout, tx.decrement_seckill_stock(intent.voucher_id)).await?;
        if seckill == 0 {
            return Err(MaterializeError::InvariantViolation {
                voucher_id: intent.voucher_id,
                counter: StockCounter::Seckill,
            });
        }

        let voucher = bounded(self.call_timeout, tx.decrement_voucher_stock(intent.voucher_id)).await?;
        if voucher == 0 {
            return Err(MaterializeError::InvariantViolation {
                voucher_id: intent.voucher_id,
                counter: StockCounter::Voucher,
            });
        }

        let order = NewVoucherOrder::seckill(
            intent.order_id,
            intent.user_id,
            intent.voucher_id,
            self.clock.now(),
        );
        let inserted = bounded(self.call_timeout, tx.insert_order(&order)).await?;
        Ok(Some(inserted))
    }

    async fn rollback(&self, tx: Box<dyn OrderTransaction>) {
        if let Err(e) = bounded(self.call_timeout, tx.rollback()).await {
            warn!(error = %e, "rollback failed, transaction is discarded with its connection");
        }
    }
}
