//! Order lifecycle engine
//!
//! - [`order_engine`] - DB-first create/cancel state machine
//! - [`sizing`] - capital- and position-based quantity computation
//! - [`sweeper`] - orphan and stale-cancel recovery

pub mod order_engine;
pub mod sizing;
pub mod sweeper;

pub use order_engine::{EngineError, OrderEngine};
pub use sizing::{size_order, SizingError, SizingInput};
pub use sweeper::Sweeper;
