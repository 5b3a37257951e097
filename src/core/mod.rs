pub mod error;
pub mod types;

pub use error::{DriverError, ErrorKind, Result};
pub use types::{AccessMode, Params, Query, QueryResult, Record, ServerAddress};
