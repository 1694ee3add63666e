// Orchestrator - drives each payment through its lifecycle
pub mod lifecycle;

pub use lifecycle::{PaymentOrchestrator, PaymentView};
