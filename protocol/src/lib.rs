//! Wire types for the nimbus worker.
//!
//! The host UI and the worker exchange newline-delimited JSON objects over
//! the worker's standard streams. Every inbound object is a [`Request`];
//! every outbound object is either a terminal [`Response`] or a
//! [`StreamFrame`] belonging to an in-flight streaming command.

mod conversation;
mod ipc;
mod permission;

pub use conversation::ChatMessage;
pub use conversation::Conversation;
pub use conversation::ConversationSummary;
pub use conversation::Role;
pub use ipc::ErrorBody;
pub use ipc::ErrorCode;
pub use ipc::Request;
pub use ipc::Response;
pub use ipc::ResponseStatus;
pub use ipc::StreamEvent;
pub use ipc::StreamFrame;
pub use permission::Permission;

/// Reserved request id used for unsolicited telemetry frames.
pub const SYSTEM_STATS_ID: &str = "SYSTEM_STATS";

/// Encrypted payloads on disk carry this literal prefix followed by
/// base64(nonce || ciphertext || tag).
pub const ENC_PREFIX: &str = "ENC:";
