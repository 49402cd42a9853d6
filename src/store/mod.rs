//! Model store: persisted desired and observed state of the fleet.

pub mod hooks;
pub mod memory;
pub mod mesh;
pub mod model;
pub mod repo;

#[cfg(test)]
mod memory_test;

pub use hooks::ModelHooks;
pub use memory::MemoryTable;
pub use mesh::Mesh;
pub use model::*;
pub use repo::{Repositories, Repository, StoreResult};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{model} {id} not found")]
    NotFound { model: &'static str, id: String },

    #[error("store io: {0}")]
    Io(#[from] std::io::Error),

    #[error("store encoding: {0}")]
    Encoding(#[from] serde_json::Error),
}
