pub mod config;
pub mod constants;
pub mod error;
pub mod export;
pub mod image;
pub mod layer;
pub mod local;
pub mod logging;
pub mod oci;
pub mod previous;
pub mod rebase;
pub mod reference;
pub mod remote;

pub use error::{ImageError, Result};
pub use image::{Backend, Image};
pub use local::LocalImage;
pub use remote::RemoteImage;
