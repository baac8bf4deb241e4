// src/lib.rs

//! apexd: activation engine for signed filesystem-image packages
//!
//! Makes the contents of a package (a read-only archive carrying an ext4
//! image and a manifest) appear at two fixed paths, a per-version mount
//! and a "latest" alias, safely and with cryptographic integrity
//! verification, and undoes those effects on request.
//!
//! # Architecture
//!
//! - Scoped resources: loop devices, dm nodes, mount-point directories and
//!   staged files are drop-on-failure, commit-on-success handles
//! - Single trust gate: verity data is recomputed from the signature block
//!   on every mount and checked against trusted key directories
//! - One registry: the in-memory mounted-package map is the linearization
//!   point; observers only see committed mounts
//! - Transactional staging: a batch of packages lands in the active
//!   directory fully or not at all

pub mod config;
pub mod controller;
pub mod dm;
mod error;
pub mod hooks;
pub mod lock;
pub mod loopdev;
pub mod mount;
pub mod package;
pub mod registry;
pub mod session;
pub mod staging;
pub mod status;
pub mod verity;

pub use config::ApexdConfig;
pub use controller::{Apexd, ApexInfo};
pub use error::{Error, Result};
pub use package::{ApexFile, ApexManifest};
pub use registry::{MountedPackage, MountedRegistry};
pub use session::{SessionState, StagedSession};
pub use status::{DaemonStatus, StatusPublisher};
pub use verity::{AvbSignatureReader, HashtreeDescriptor, SignatureReader, VerityData};
