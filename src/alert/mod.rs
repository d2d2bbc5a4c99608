//! Topic watchdog: groups of timed watches, the supervising agent, and
//! alert delivery.

mod agent;
mod group;
mod health;
mod remote;

pub use agent::*;
pub use group::*;
pub use health::*;
pub use remote::*;
