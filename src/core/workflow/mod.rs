pub mod engine;
pub mod events;
pub mod executor;
pub mod expression;
pub mod input;
pub mod persistence;
pub mod schema;
pub mod state;

pub use engine::{WorkflowEngine, WorkflowEngineBuilder};
pub use events::{
    BroadcastEventSink, EventSink, ListenerEventSink, NullEventSink, WorkflowEvent,
};
pub use executor::{
    ActionExecutor, ActionHandler, BuiltinAction, HumanAction, HumanInLoopExecutor,
    HumanResponse, HumanReviewRequest, ParallelBatchExecutor, StepExecutor,
};
pub use input::InputNode;
pub use persistence::{
    FileRunRepository, InMemoryRunRepository, RunRecord, RunRepository, StepRecord,
    StepRecordStatus,
};
pub use schema::{Step, StepType, Trigger, TriggerType, WorkflowDefinition};
pub use state::{
    ExecutionContext, ExecutionState, RunError, RunResult, RunStatus, StepResult, StepStatus,
};
