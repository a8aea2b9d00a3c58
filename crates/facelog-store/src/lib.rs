//! facelog-store: Event Logger.
//!
//! Identities (`users`) and timestamped recognition events (`detections`)
//! in a local SQLite file, plus the policy deciding which matches are
//! written.

pub mod policy;
pub mod store;

pub use policy::{DebounceByIdentity, RecordEveryMatch, RecordPolicy};
pub use store::{default_db_path, Identity, RecentDetection, Store, StoreError, TIMESTAMP_FORMAT};
