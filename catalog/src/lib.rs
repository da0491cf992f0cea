pub mod config_store;
pub mod database;
pub mod notification;
pub mod snapshot;

#[cfg(test)]
mod test_utils;

pub use config_store::{ConfigStore, ConfigStoreError};
pub use notification::NotifiableStore;
pub use snapshot::SnapshotError;
