//! resource-pool: counting-resource admission control.
//!
//! A [`Pool`] hands out units from a bounded or unbounded supply. Requests that
//! do not fit wait in arrival order and are granted as units are released or
//! the pool grows. A waiting request for a fixed number of units can be forced,
//! bursting usage past the pool size. [`Pool::when_idle`] completes whenever the
//! pool has nothing allocated and nobody waiting.

mod allocation;
mod config;
mod error;
mod idle;
mod pool;
mod request;
mod state;

pub use allocation::Allocation;
pub use config::{Capacity, POOL_SIZE_ENV, PoolConfig};
pub use error::PoolError;
pub use idle::WhenIdle;
pub use pool::Pool;
pub use request::{AllocationRequest, PartialAllocationRequest};
