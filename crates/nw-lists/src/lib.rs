pub mod manager;
pub mod store;

pub use manager::*;
pub use store::*;

// Blacklist/whitelist files mirrored into filter rules
