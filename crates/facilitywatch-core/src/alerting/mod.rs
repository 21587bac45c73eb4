//! Alert rule evaluation engine
//!
//! Evaluates sustained threshold rules against sensor readings, deduplicates
//! live alerts and drives the alert status lifecycle.

mod evaluator;
mod lifecycle;
mod matcher;
mod memory;
mod notifier;
mod repository;
mod scheduler;

pub use evaluator::{EvaluationResult, ThresholdEvaluator};
pub use lifecycle::{AlertLifecycleManager, CycleReport, WorkOrderSpawn};
pub use matcher::SensorIndex;
pub use memory::InMemoryStore;
pub use notifier::{
    BroadcastSink, FanoutSink, NotificationDispatcher, NotificationSink, RedisSink, WebhookSink,
};
pub use repository::{
    AlertRepository, AlertStore, InsertOutcome, ReadingStore, RuleRepository, SensorDirectory,
};
pub use scheduler::EvaluationScheduler;
