#![forbid(unsafe_code)]
#![deny(unreachable_pub)]

//! Shared identity and capability-probing primitives for the transcoding worker.

pub mod capability;
pub mod identity;

pub use capability::CapabilitySnapshot;
pub use identity::EngineIdentity;
