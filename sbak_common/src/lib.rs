mod error;
pub use error::*;

pub mod config;
pub mod notify;
pub mod subprocess;
pub mod timestamps;
pub mod volume;
pub mod worker;
