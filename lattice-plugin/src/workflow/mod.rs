//! Multi-plugin workflows with compensation on failure

pub mod definition;
pub mod engine;
pub mod instance;
pub mod transaction;

pub use definition::{
    BindingSource, Branch, BranchPredicate, CompensatingAction, Edge, InputBinding, Stage,
    WorkflowBuilder, WorkflowDefinition,
};
pub use engine::{WorkflowEngine, WorkflowReport, WorkflowRun};
pub use instance::{FailureKind, StageFailure, StageStatus, WorkflowInstance, WorkflowStatus};
pub use transaction::{
    CompensationFailure, ResolvedCompensation, RollbackManager, RollbackReport, TransactionEntry,
    TransactionLog,
};
