//! One module per command family; every function takes the shared context
//! and the raw payload and returns a value, a stream, or a typed error.

pub mod airllm;
pub mod chat;
pub mod conversations;
pub mod memory;
pub mod models;
pub mod projects;
pub mod repo;
pub mod security;
pub mod system;
pub mod tunnel;
