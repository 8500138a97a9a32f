//! Persistent state management
//!
//! One actor owns the store; everything else holds a cloneable handle.

mod manager;
mod messages;
pub mod recovery;

pub use manager::StateManager;
pub use messages::{StateCommand, StateError, StateEvent, StateResponse};
pub use recovery::{RecoveryStats, recover};
