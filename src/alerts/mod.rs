//! Alert evaluation
//!
//! Rules are evaluated on a fixed tick by a single background loop that owns
//! the alert instance table and emits firing/resolved notifications.

pub mod evaluator;
pub mod instance;
pub mod scheduler;
pub mod template;

pub use evaluator::{AlertEvaluator, TickOutcome};
pub use instance::{AlertInstance, AlertState, InstanceKey};
pub use scheduler::{AlertsSnapshot, EvaluationLoop, EvaluationTask};
