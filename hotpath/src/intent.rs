//! The order-intent message carried on the order stream.
//!
//! Wire form is a flat field map: `userId`, `voucherId` and `orderId`, all
//! decimal strings. `orderId` is always present but may be empty when id
//! pre-allocation failed.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::errors::{MaterializeError, MaterializeResult};
use crate::types::{OrderId, UserId, VoucherId};

/// Field holding the buyer id.
pub const FIELD_USER_ID: &str = "userId";
/// Field holding the voucher id.
pub const FIELD_VOUCHER_ID: &str = "voucherId";
/// Field holding the pre-allocated order id, possibly empty.
pub const FIELD_ORDER_ID: &str = "orderId";

/// An admitted purchase waiting to be materialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderIntent {
    /// Id allocated at admission; absent on intents from older producers
    pub order_id: Option<OrderId>,
    /// Admitted buyer
    pub user_id: UserId,
    /// Voucher the buyer was admitted for
    pub voucher_id: VoucherId,
}

impl OrderIntent {
    /// Stream field map.
    pub fn to_fields(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            (FIELD_USER_ID.to_string(), self.user_id.to_string()),
            (FIELD_VOUCHER_ID.to_string(), self.voucher_id.to_string()),
            (
                FIELD_ORDER_ID.to_string(),
                self.order_id.map(|id| id.to_string()).unwrap_or_default(),
            ),
        ])
    }

    /// Parses a stream field map.
    ///
    /// Missing fields or unparsable buyer/voucher ids are `Malformed`. An
    /// unparsable order id is dropped with a warning so the order still gets
    /// its row id.
    pub fn from_fields(fields: &BTreeMap<String, String>) -> MaterializeResult<Self> {
        let user_id = required_id(fields, FIELD_USER_ID)?;
        let voucher_id = required_id(fields, FIELD_VOUCHER_ID)?;
        let raw_order = field(fields, FIELD_ORDER_ID)?.trim();

        let order_id = if raw_order.is_empty() {
            None
        } else if let Ok(id) = raw_order.parse::<u64>() {
            Some(OrderId::new(id))
        } else {
            warn!(order_id = raw_order, "unparsable pre-allocated order id, using row id");
            None
        };

        Ok(Self {
            order_id,
            user_id: UserId::new(user_id),
            voucher_id: VoucherId::new(voucher_id),
        })
    }
}

fn field<'a>(fields: &'a BTreeMap<String, String>, name: &str) -> MaterializeResult<&'a str> {
    fields
        .get(name)
        .map(String::as_str)
        .ok_or_else(|| MaterializeError::Malformed(format!("missing field {name}")))
}

fn required_id(fields: &BTreeMap<String, String>, name: &str) -> MaterializeResult<u64> {
    let raw = field(fields, name)?;
    raw.trim()
        .parse()
        .map_err(|_| MaterializeError::Malformed(format!("field {name} is not an id: {raw:?}")))
}
