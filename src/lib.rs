#![warn(clippy::all)]
#![allow(clippy::new_without_default)]

pub mod encoding;
pub mod error;
pub mod keys;
pub mod storage;

pub use error::{Error, Result};
pub use keys::HdKey;
pub use storage::LogDb;
