pub mod config;
pub mod error;
pub mod intent;
pub mod model;
pub mod report;

pub use config::*;
pub use error::*;
pub use intent::*;
pub use model::*;
pub use report::*;
