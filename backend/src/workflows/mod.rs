// Workflow Automation Engine
//
// Trigger-evaluated, condition-gated, time-scheduled execution engine that
// drives outbound actions (messages, lead updates, tasks) for individual
// leads. Executions run sequentially within themselves and concurrently
// across each other on a bounded worker pool.

pub mod actions;
pub mod conditions;
pub mod dispatcher;
pub mod engine;
pub mod scheduler;
pub mod snapshot;
pub mod store;
pub mod templates;
pub mod triggers;
pub mod worker;


pub use actions::{Action, ActionKind, ActionStatus, ActionTemplate};
pub use conditions::{Condition, ConditionEvaluator, ConditionGroup, StoredRuleEvaluator};
pub use dispatcher::{ActionDispatcher, ActionOutcome};
pub use engine::{
    EngineError, Execution, ExecutionOutcome, ExecutionStatus, PendingSweep, SkipReason,
    WorkflowDefinition, WorkflowEngine, WorkflowStats,
};
pub use scheduler::ActionScheduler;
pub use snapshot::LeadSnapshot;
pub use store::{PgWorkflowStore, StoreError, WorkflowStore};
pub use triggers::{Trigger, TriggerKind};
pub use worker::{WorkerHandle, WorkerPool};
