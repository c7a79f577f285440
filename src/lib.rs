pub mod backend;
pub mod util;

pub use backend::db::Database;
pub use util::config::{CoercionPolicy, EngineConfig};
pub use util::error::Error;
