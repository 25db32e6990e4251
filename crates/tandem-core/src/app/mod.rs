pub mod accumulator;
pub mod runtime;
pub mod turn;

pub use accumulator::{PendingFlush, TurnAccumulator, TurnOutcome};
pub use runtime::{RuntimeError, RuntimeEvent, RuntimeHandle, RuntimeService, SessionSummary};
