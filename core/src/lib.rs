/// Flux - messaging client core
///
/// Keeps one coherent, de-duplicated, chronologically ordered message stream
/// per peer, fed by REST history fetches and a live push channel.

pub mod error;
pub mod config;
pub mod messenger_types;
pub mod session;
pub mod api;
pub mod utils;
pub mod push;
pub mod peer_directory;
pub mod conversation_store;
pub mod composer;
pub mod messenger;
pub mod cli_app;

pub use config::Config;
pub use error::{FluxError, Result};
pub use messenger::Messenger;
pub use session::{resolve_actor, Session};
