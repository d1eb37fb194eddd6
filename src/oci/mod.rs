//! Image formats: config object, manifests, registry access and hashing.

pub mod config;
pub mod manifest;
pub mod registry;
pub mod utils;
