//! Bridge to a local Ollama runtime: streaming chat and pull over the HTTP
//! API, model listing via the `ollama` CLI with a tolerant table parser.

mod cli;
mod client;
mod pull;

pub use cli::ModelEntry;
pub use cli::list_models_cli;
pub use cli::parse_list_output;
pub use client::ChatEvent;
pub use client::ChatTurn;
pub use client::OllamaClient;
pub use pull::PullEvent;

/// Default local runtime endpoint.
pub const DEFAULT_HOST_ROOT: &str = "http://127.0.0.1:11434";
