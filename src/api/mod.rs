// ==========================================
// 数据迁移导入引擎 - API 层
// ==========================================
// 职责: 提供与传输层无关的作业接口
// ==========================================

pub mod error;
pub mod import_api;

// 重导出核心类型
pub use error::{ApiError, ApiResult, ErrorDetail};
pub use import_api::{ExecutionHandle, ImportApi, RollbackHandle, TaskHandle};
