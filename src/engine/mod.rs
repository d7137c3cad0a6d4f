// ==========================================
// 数据迁移导入引擎 - 引擎层
// ==========================================
// 职责: 作业生命周期编排、状态机、调度与事件
// 红线: Engine 不拼 SQL，状态只经由状态机修改
// ==========================================

pub mod events;
pub mod job_state;
pub mod orchestrator;
pub mod scheduler;

// 重导出核心引擎
pub use events::{
    JobEvent, JobEventPublisher, JobEventType, NoOpEventPublisher, OptionalEventPublisher,
    RecordingEventPublisher,
};
pub use job_state::{is_allowed, JobStateMachine, JobTransition, JobTransitionListener};
pub use orchestrator::{
    ExecutionOutcome, ImportOrchestrator, OrchestratorDeps, PreparedExecution, IMPORT_ERROR_CODE,
};
pub use scheduler::{JobRuntime, JobScheduler};
