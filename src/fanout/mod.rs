//! Proactive pyramid generation.
//!
//! ```text
//! pyramid ──► tract_row (per native level, per tract row)
//!                 └──► tract (per tract column)
//!                         └──► parcels: native tiles, then derived levels
//! ```
//!
//! A parcel is a `parcel_len`-square block of tiles; a tract is a
//! `tract_len`-square block of parcels. Every unit goes through a
//! [`Dispatcher`], so the local worker pool can be swapped for any queue
//! that carries [`WorkUnit`] JSON.

mod dispatch;
mod scheduler;
mod unit;

pub use dispatch::{work_queue, Dispatcher, LocalDispatcher, WorkReceiver, WorkerPool};
pub use scheduler::{PyramidScheduler, TractSummary};
pub use unit::{
    parent_addresses, FanoutConfig, WorkUnit, DEFAULT_PARCEL_LEN, DEFAULT_TRACT_LEN,
};
