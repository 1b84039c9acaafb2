//! Turn synchronization
//!
//! In simultaneous-turn mode no agent starts turn N+1 before every agent has
//! finished turn N.

mod barrier;

pub use barrier::{BarrierConfig, BarrierError, BarrierOutcome, TurnBarrier, TurnState};
