// HTTP API controllers: status, config, artifacts, operator and cloud
// provisioning endpoints.

pub mod artifacts;
pub mod cloud;
pub mod config;
pub mod controller;
pub mod mesh;
pub mod status;

#[cfg(test)]
mod mesh_test;

// Re-export controller types for convenience
pub use artifacts::ArtifactController;
pub use cloud::CloudProvisionController;
pub use config::ShowConfigController;
pub use mesh::MeshController;
pub use status::StatusController;
