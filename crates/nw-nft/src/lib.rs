pub mod applier;
pub mod command;
pub mod compiler;
pub mod engine;
#[cfg(any(test, feature = "fake"))]
pub mod fake;
pub mod handles;
pub mod host;
pub mod snapshot;
pub mod status;

pub use applier::*;
pub use command::*;
pub use compiler::*;
pub use engine::*;
pub use handles::*;
pub use host::*;
pub use snapshot::*;
pub use status::*;

// nft command builder, intent compiler and applier
