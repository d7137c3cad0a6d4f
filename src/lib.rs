// ==========================================
// 数据迁移导入引擎 - 核心库
// ==========================================
// 流水线: 文件分析 -> 字段映射 -> 转换 -> 校验 -> 批量导入 -> 回滚
// 技术栈: Rust + Tokio + SQLite
// 定位: 多租户表格数据迁移，人工确认映射后执行
// ==========================================

// 初始化国际化系统
rust_i18n::i18n!("locales", fallback = "zh-CN");

// ==========================================
// 模块声明
// ==========================================

// 领域层 - 实体与类型
pub mod domain;

// 数据仓储层 - 作业状态/台账/目标存储
pub mod repository;

// 引擎层 - 作业编排与状态机
pub mod engine;

// 导入层 - 解析/映射/转换/校验/执行/回滚
pub mod importer;

// 配置层 - 导入参数
pub mod config;

// 数据库基础设施（连接初始化/PRAGMA 统一）
pub mod db;

// 日志系统
pub mod logging;

// 国际化
pub mod i18n;

// API 层 - 作业接口
pub mod api;

// ==========================================
// 重导出核心类型
// ==========================================

// 领域类型
pub use domain::types::{ErrorHandlingMode, IssueCategory, JobState, Severity};

// 领域实体
pub use domain::{
    FieldMapping, ImportJob, ImportedRecord, MappingTemplate, RestorePoint, TargetSchema,
    TransformationRule, ValidationIssue, ValidationReport, ValueMap,
};

// 引擎
pub use engine::{ExecutionOutcome, ImportOrchestrator, JobEventPublisher, OrchestratorDeps};

// API
pub use api::{ApiError, ApiResult, ExecutionHandle, ImportApi};

// ==========================================
// 常量定义
// ==========================================

// 系统版本
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

// 系统名称
pub const APP_NAME: &str = "数据迁移导入引擎";

// 数据库版本
pub const DB_VERSION: &str = "v1";
