pub mod refresh_task;
pub mod store;
pub mod types;

pub use store::{RefreshOutcome, Store};
pub use types::CredentialAccount;
