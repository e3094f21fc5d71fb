//! Supervisor for the AirLLM sidecar: an auxiliary child process driving an
//! alternate model runtime, speaking newline-delimited JSON on its standard
//! streams.
//!
//! Contract: after spawn the sidecar loads the requested model and emits
//! exactly one status frame `{"type":"status","status":"READY"|"ERROR",..}`.
//! Generation requests and responses are correlated by id. At most one
//! sidecar process exists; enabling a new model disables the current one.

mod supervisor;
mod wire;

pub use supervisor::AirLlmSupervisor;
pub use supervisor::CuratedModel;
pub use supervisor::SidecarCommand;
pub use supervisor::SidecarConfig;
pub use supervisor::SidecarStatus;
pub use wire::GenerateResponse;
pub use wire::StatusFrame;
