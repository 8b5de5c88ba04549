pub mod classifier;
pub mod config;
pub mod cursor;
pub mod error;
pub mod record;
pub mod router;

pub mod kafka;

#[cfg(test)]
mod testing;

pub use classifier::{classify, Region};
pub use config::Config;
pub use error::{Error, Result};
pub use record::Record;
pub use router::{Router, RouterStats};
