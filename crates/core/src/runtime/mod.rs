mod scheduler;
mod shutdown;

pub use scheduler::{FlightGuard, LoopScheduler, SingleFlight, TickOutcome};
pub use shutdown::ShutdownGuard;
