pub mod compactor;
pub mod config;
pub mod engine;
pub mod limits;
pub mod model;
pub mod notify;
pub mod observability;
pub mod tenant;
pub mod wal;

pub use engine::{Engine, EngineError};
pub use model::overlaps;
