//! Agent loop: the driver, its run handle, outcomes and loop events.

pub mod events;
pub mod runner;
pub mod types;

pub use events::*;
pub use runner::*;
pub use types::*;
