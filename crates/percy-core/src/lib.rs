//! The Percy state machine (spec.md §4.4): build/snapshot/upload
//! orchestration wired against [`percy_queue`]'s priority queues and
//! [`percy_logger`]'s structured logger. The external collaborators of
//! spec.md §6 (browser driver, remote API client, resource discovery, the
//! local HTTP/WebSocket server) are expressed as traits in [`traits`] so
//! this crate has zero knowledge of an actual headless browser or HTTP SDK.

#![forbid(unsafe_code)]
#![deny(unreachable_pub)]

mod error;
mod options;
mod percy;
mod traits;

pub use error::PercyError;
pub use options::{BuildState, Options, ReadyState};
pub use percy::Percy;
pub use traits::{
    ApiErrorDetail, BrowserDriver, BuildInfo, OnSnapshotDone, OptionsValidator, PercyContext,
    RemoteClient, ResourceDiscoverer, ServerHandle, Snapshot, SnapshotGatherer, SnapshotInput,
    SnapshotOptions, SnapshotPayload, StaticFileServer, UploadError,
};
