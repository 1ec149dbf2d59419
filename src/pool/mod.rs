pub mod manager;
pub mod types;

pub use manager::AccountPool;
pub use types::{AccountStatus, Outcome, PoolAccount};
