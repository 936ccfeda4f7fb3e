pub mod machine;
pub mod progress;

pub use machine::{AbortReason, RunEvent, RunLimits, RunState, RunStateMachine, RunStatus};
pub use progress::{ProgressEvent, RunProgress};
