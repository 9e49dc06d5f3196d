pub mod http;
pub mod memory;
pub mod types;

pub use http::HttpControlPlane;
pub use memory::{Call, CallOutcome, CallRecord, MemoryControlPlane};
pub use types::{
    HostingPlatform, ImageDescription, ModelDescription, Registry, RemoteError, ResourceKind,
};
