//! Builds FreeBSD container images from a Linux CI host.
//!
//! The heavy lifting happens on a throwaway FreeBSD VM. This crate drives
//! it over ssh, deploys declared assets into mounted buildah containers
//! there, and commits and pushes the resulting multi-arch manifests.
//!
//! # Architecture
//!
//! ```text
//! freebsd-builder container
//!     │
//!     ├── config      projects.toml → Project / ContainerConfig / Asset
//!     ├── container   buildah flow per architecture
//!     │     └── deploy        assets → files in the container root
//!     │           ├── matcher     archive member → destination
//!     │           └── archive     gzip / zstd / tar extraction
//!     └── process     Runner: LocalRunner | transport::RemoteRunner
//!                                             │ ssh
//!                                   freebsd-builder serve <marker>
//! ```
//!
//! Every external command goes through [`process::Runner`], so the same
//! code runs on the VM (through [`transport::RemoteRunner`]) or locally
//! (`freebsd-builder deploy`), and tests record commands instead.

pub mod config;
pub mod container;
pub mod deploy;
pub mod error;
pub mod fetch;
pub mod logging;
pub mod preflight;
pub mod process;
pub mod transport;
pub mod version;

pub use error::BuildError;
