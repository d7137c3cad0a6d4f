// ==========================================
// 数据迁移导入引擎 - 导入流水线错误类型
// ==========================================
// 工具: thiserror 派生宏
// ==========================================

use crate::domain::types::JobState;
use crate::repository::error::RepositoryError;
use thiserror::Error;

/// 导入流水线错误类型
#[derive(Error, Debug)]
pub enum ImportError {
    // ===== 文件分析错误 =====
    #[error("文件格式不支持: {0}")]
    UnsupportedFormat(String),

    #[error("文件无数据行: {0}")]
    EmptyInput(String),

    // ===== 映射错误 =====
    #[error("必填字段未映射且无默认值: {}", fields.join(", "))]
    MappingIncomplete { fields: Vec<String> },

    // ===== 转换错误（单行，非致命；以校验问题形式记录） =====
    #[error("转换失败 (行 {row}, 字段 {field}, 值 {value}): {message}")]
    TransformationFailed {
        row: usize,
        field: String,
        value: String,
        message: String,
    },

    // ===== 校验错误 =====
    #[error("存在 {error_count} 个错误级校验问题，禁止执行")]
    ValidationBlocked { error_count: usize },

    // ===== 执行错误 =====
    #[error("记录重复 (行 {row}): 源记录 ID {source_record_id} 在文件中重复出现")]
    RecordConflict { row: usize, source_record_id: String },

    #[error("批次提交失败 (批次 {batch_index}): {message}")]
    BatchCommitFailed { batch_index: usize, message: String },

    // ===== 回滚错误 =====
    #[error("回滚被阻止: {0}")]
    RollbackBlocked(String),

    // ===== 作业错误 =====
    #[error("作业不存在: {0}")]
    JobNotFound(String),

    #[error("非法的状态转换: {from} -> {to}")]
    InvalidStateTransition { from: JobState, to: JobState },

    #[error("作业正被其他操作占用: {0}")]
    JobBusy(String),

    #[error("操作超时: {0}")]
    Timeout(String),

    #[error("目标实体类型未注册: {0}")]
    UnknownEntityType(String),

    #[error("参数无效: {0}")]
    InvalidArgument(String),

    // ===== 基础设施错误 =====
    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

// 实现 From<csv::Error>
impl From<csv::Error> for ImportError {
    fn from(err: csv::Error) -> Self {
        ImportError::UnsupportedFormat(format!("CSV 解析失败: {}", err))
    }
}

// 实现 From<calamine::XlsxError>
impl From<calamine::XlsxError> for ImportError {
    fn from(err: calamine::XlsxError) -> Self {
        ImportError::UnsupportedFormat(format!("Excel 解析失败: {}", err))
    }
}

/// Result 类型别名
pub type ImportResult<T> = Result<T, ImportError>;
