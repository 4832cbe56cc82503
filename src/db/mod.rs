pub mod connection;
pub mod queries;
pub mod recorder;

pub use connection::*;
pub use queries::*;
pub use recorder::*;
