//! API request handlers

mod deploy;
mod events;
mod gateway;
mod health;
mod nodes;
mod system;

pub use deploy::*;
pub use events::*;
pub use gateway::*;
pub use health::*;
pub use nodes::*;
pub use system::*;
