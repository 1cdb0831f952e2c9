pub mod config;
pub mod fetcher;
pub mod fingerprint;
pub mod monitor;
pub mod notifier;
pub mod scheduler;
pub mod snapshot;
pub mod version;
