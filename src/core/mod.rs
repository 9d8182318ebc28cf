//! Lifecycle core: the supervisor and the state it keeps in memory.

pub mod handles;
pub mod supervisor;
pub mod types;

pub use supervisor::BotSupervisor;
pub use types::{Actor, UploadReport};
