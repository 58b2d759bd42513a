//! Bulk downloads of public repositories from the Source Cooperative data
//! endpoint.
//!
//! [`inventory`] lists the objects under a repository prefix and
//! [`downloader::Downloader`] fetches a batch of them into a local
//! directory, splitting large objects into ranged parts when the server
//! allows it.

pub mod blocking;
pub mod download;
pub mod downloader;
pub mod errors;
pub mod event;
pub mod fetch;
pub mod inventory;
pub mod storage;
pub mod utils;

pub use download::ObjectDescriptor;
pub use downloader::{BatchResult, ConfirmGate, DownloadOptions, Downloader};
pub use errors::{CoopError, CoopResult};
pub use event::{Event, ProgressSink};
pub use inventory::{BatchSummary, ObjectInventory, S3Inventory};
