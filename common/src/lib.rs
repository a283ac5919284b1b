pub mod protocol;
pub mod snapshot;

pub use protocol::*;
pub use snapshot::*;
