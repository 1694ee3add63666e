// Settlement workers - periodic drivers and the dual-approval gate
pub mod approval_gate;
pub mod custody_monitor;
pub mod deposit_poller;
pub mod safety_monitor;
pub mod scheduler;

pub use approval_gate::{ApprovalGate, ApprovalOutcome};
pub use custody_monitor::{CustodyMonitor, CustodyReport};
pub use deposit_poller::{DepositPoller, PollReport};
pub use safety_monitor::{SafetyMonitor, SafetyReport};
pub use scheduler::{PeriodicTask, WorkerScheduler};
