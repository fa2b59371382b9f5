pub mod admin;
pub mod allocation;
pub mod stats;

pub use admin::AdminService;
pub use allocation::{AllocationEngine, ClaimError, ClaimSuccess, ReadError, ReleaseError};
pub use stats::{PoolStats, StatsService};
