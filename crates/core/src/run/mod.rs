//! Run lifecycle: shared state, the control signal, and the controller
//! that owns every execution.

pub mod controller;
pub mod state;

pub use controller::{RunController, RunOptions};
pub use state::{ControlSignal, ExecutionContext, RunControl, RunState};
