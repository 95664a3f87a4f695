//! reunite-registry: register and search missing children by face.
//!
//! [`RegistryService`] ties the face encoder, the matcher, the descriptor
//! store and the record directory together. [`spawn_engine`] moves it onto a
//! dedicated thread behind an async [`EngineHandle`] with request deadlines.

pub mod config;
pub mod engine;
pub mod service;

#[cfg(test)]
mod testing;

pub use config::{CombinePolicy, Config, ConfigError};
pub use engine::{spawn_engine, EngineHandle};
pub use service::{
    ListedEntry, MatchedChild, RegisterOutcome, RegistryError, RegistryService, RegistryStatus,
    Rejection, SearchOutcome,
};
