//! In-memory backends for `hotpath`
//!
//! [`InMemoryBackend`] implements every cache/coordination contract (key-value
//! with expiry, bitmaps, the atomic admission evaluation and consumer-group
//! streams) in one process. [`InMemoryShopRepository`] and
//! [`InMemoryOrderStore`] stand in for the relational store. Useful for
//! testing and local development where no shared infrastructure is running.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![allow(clippy::significant_drop_tightening)]

mod backend;
mod node;
mod relational;
mod stream;

pub use backend::InMemoryBackend;
pub use node::InMemoryNode;
pub use relational::{InMemoryOrderStore, InMemoryShopRepository};
