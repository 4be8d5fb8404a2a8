//! Distribution v2 server and client for hauler stores.
//!
//! The server ([`server::serve`]) exposes a [`hauler::Store`] to any OCI
//! client: pulls resolve through the store index, pushes land in upload
//! sessions and are promoted into the CAS. The client ([`RegistryClient`])
//! is what builders pull through and what [`RegistryTarget`] pushes with.

#![forbid(unsafe_code)]

pub mod auth;
pub mod client;
pub mod copy;
pub mod error;
mod handlers;
pub mod retry;
pub mod server;

pub use auth::{Anonymous, Credentials, CredentialResolver, DockerConfig, StaticCredentials};
pub use client::{ClientConfig, Endpoint, RegistryClient, RemoteManifest};
pub use copy::RegistryTarget;
pub use error::RegistryError;
pub use handlers::MAX_MANIFEST_SIZE;
pub use retry::RetryPolicy;
pub use server::{router, serve, serve_on, ServeConfig};
