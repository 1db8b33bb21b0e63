//! Node-local state persistence.
//!
//! Small files that let the agent recognize, across restarts and image
//! upgrades, which persistent disk it mounted and whether the ephemeral data
//! area belongs to the current stemcell.

mod store;

pub use store::{StateError, StateStore};
