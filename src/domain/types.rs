// ==========================================
// 数据迁移导入引擎 - 领域类型定义
// ==========================================
// 职责: 作业状态、错误处理策略、问题级别/类别等枚举
// 序列化格式: SCREAMING_SNAKE_CASE (与数据库一致)
// ==========================================

use serde::{Deserialize, Serialize};
use std::fmt;

// ==========================================
// 作业状态 (Job State)
// ==========================================
// 流转: CREATED → ANALYZING → MAPPING → VALIDATING → READY → IMPORTING
//       → {COMPLETED | COMPLETED_WITH_ERRORS | FAILED} → [ROLLED_BACK]
// 合法转换表见 engine::job_state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Created,             // 已创建
    Analyzing,           // 文件分析中
    Mapping,             // 字段映射中
    Validating,          // 校验中
    Ready,               // 校验通过，可执行
    Importing,           // 导入执行中
    Paused,              // 已暂停（批次边界）
    Completed,           // 完成
    CompletedWithErrors, // 完成但有失败记录
    Failed,              // 失败
    Cancelled,           // 已取消
    RolledBack,          // 已回滚
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Created => "CREATED",
            JobState::Analyzing => "ANALYZING",
            JobState::Mapping => "MAPPING",
            JobState::Validating => "VALIDATING",
            JobState::Ready => "READY",
            JobState::Importing => "IMPORTING",
            JobState::Paused => "PAUSED",
            JobState::Completed => "COMPLETED",
            JobState::CompletedWithErrors => "COMPLETED_WITH_ERRORS",
            JobState::Failed => "FAILED",
            JobState::Cancelled => "CANCELLED",
            JobState::RolledBack => "ROLLED_BACK",
        }
    }

    /// 解析状态字符串（未知值返回 None）
    pub fn parse(s: &str) -> Option<JobState> {
        match s.trim().to_uppercase().as_str() {
            "CREATED" => Some(JobState::Created),
            "ANALYZING" => Some(JobState::Analyzing),
            "MAPPING" => Some(JobState::Mapping),
            "VALIDATING" => Some(JobState::Validating),
            "READY" => Some(JobState::Ready),
            "IMPORTING" => Some(JobState::Importing),
            "PAUSED" => Some(JobState::Paused),
            "COMPLETED" => Some(JobState::Completed),
            "COMPLETED_WITH_ERRORS" => Some(JobState::CompletedWithErrors),
            "FAILED" => Some(JobState::Failed),
            "CANCELLED" => Some(JobState::Cancelled),
            "ROLLED_BACK" => Some(JobState::RolledBack),
            _ => None,
        }
    }

    /// 是否处于导入开始之前
    pub fn is_pre_import(&self) -> bool {
        matches!(
            self,
            JobState::Created
                | JobState::Analyzing
                | JobState::Mapping
                | JobState::Validating
                | JobState::Ready
        )
    }

    /// 是否已有落库批次（可回滚）
    pub fn has_committed_data(&self) -> bool {
        matches!(
            self,
            JobState::Completed
                | JobState::CompletedWithErrors
                | JobState::Failed
                | JobState::Cancelled
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ==========================================
// 错误处理策略 (Error Handling Mode)
// ==========================================
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorHandlingMode {
    StopOnError,     // 任一记录失败即终止作业
    SkipAndContinue, // 记录失败写入 ImportError 后继续
    RetryThenSkip,   // 单条记录重试 N 次（退避）后跳过
}

impl ErrorHandlingMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorHandlingMode::StopOnError => "STOP_ON_ERROR",
            ErrorHandlingMode::SkipAndContinue => "SKIP_AND_CONTINUE",
            ErrorHandlingMode::RetryThenSkip => "RETRY_THEN_SKIP",
        }
    }

    pub fn parse(s: &str) -> ErrorHandlingMode {
        match s.trim().to_uppercase().as_str() {
            "STOP_ON_ERROR" => ErrorHandlingMode::StopOnError,
            "RETRY_THEN_SKIP" => ErrorHandlingMode::RetryThenSkip,
            _ => ErrorHandlingMode::SkipAndContinue,
        }
    }
}

impl fmt::Display for ErrorHandlingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ==========================================
// 问题级别 (Severity)
// ==========================================
// 顺序: Info < Warning < Error
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Info,    // 提示（仅记录）
    Warning, // 警告（不阻断执行）
    Error,   // 错误（阻断执行）
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "INFO",
            Severity::Warning => "WARNING",
            Severity::Error => "ERROR",
        }
    }

    pub fn parse(s: &str) -> Severity {
        match s.trim().to_uppercase().as_str() {
            "ERROR" => Severity::Error,
            "WARNING" => Severity::Warning,
            _ => Severity::Info,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ==========================================
// 校验类别 (Issue Category)
// ==========================================
// 顺序固定: 必填 → 类型 → 格式 → 引用 → 业务规则 → 质量
// 后续类别假定同字段前序类别已通过
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IssueCategory {
    RequiredField,
    Type,
    Format,
    Reference,
    BusinessRule,
    Quality,
}

impl IssueCategory {
    /// 按执行顺序排列的全部类别
    pub const ORDERED: [IssueCategory; 6] = [
        IssueCategory::RequiredField,
        IssueCategory::Type,
        IssueCategory::Format,
        IssueCategory::Reference,
        IssueCategory::BusinessRule,
        IssueCategory::Quality,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            IssueCategory::RequiredField => "REQUIRED_FIELD",
            IssueCategory::Type => "TYPE",
            IssueCategory::Format => "FORMAT",
            IssueCategory::Reference => "REFERENCE",
            IssueCategory::BusinessRule => "BUSINESS_RULE",
            IssueCategory::Quality => "QUALITY",
        }
    }

    pub fn parse(s: &str) -> IssueCategory {
        match s.trim().to_uppercase().as_str() {
            "REQUIRED_FIELD" => IssueCategory::RequiredField,
            "TYPE" => IssueCategory::Type,
            "FORMAT" => IssueCategory::Format,
            "REFERENCE" => IssueCategory::Reference,
            "BUSINESS_RULE" => IssueCategory::BusinessRule,
            _ => IssueCategory::Quality,
        }
    }
}

impl fmt::Display for IssueCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ==========================================
// 还原点状态 (Restore Point Status)
// ==========================================
// USED / EXPIRED 状态不可再作为回滚目标
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RestorePointStatus {
    Active,  // 可用
    Used,    // 已用于完整回滚
    Expired, // 超出保留期
}

impl RestorePointStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RestorePointStatus::Active => "ACTIVE",
            RestorePointStatus::Used => "USED",
            RestorePointStatus::Expired => "EXPIRED",
        }
    }

    pub fn parse(s: &str) -> RestorePointStatus {
        match s.trim().to_uppercase().as_str() {
            "USED" => RestorePointStatus::Used,
            "EXPIRED" => RestorePointStatus::Expired,
            _ => RestorePointStatus::Active,
        }
    }
}

impl fmt::Display for RestorePointStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ==========================================
// 未映射源字段处理方式
// ==========================================
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UnmappedFieldAction {
    #[default]
    Ignore,         // 丢弃
    StoreAsCustom,  // 写入 custom_fields.<列名>
    StoreInOverflow, // 写入 _overflow 对象
}

// ==========================================
// 记录写入动作
// ==========================================
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecordAction {
    Created, // 新建
    Updated, // 增量模式下原地更新
    Skipped, // 仅新增模式下已存在，跳过
}

impl RecordAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordAction::Created => "CREATED",
            RecordAction::Updated => "UPDATED",
            RecordAction::Skipped => "SKIPPED",
        }
    }

    pub fn parse(s: &str) -> RecordAction {
        match s.trim().to_uppercase().as_str() {
            "CREATED" => RecordAction::Created,
            "UPDATED" => RecordAction::Updated,
            _ => RecordAction::Skipped,
        }
    }
}

impl fmt::Display for RecordAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_state_round_trip_strings() {
        for state in [
            JobState::Created,
            JobState::Importing,
            JobState::CompletedWithErrors,
            JobState::RolledBack,
        ] {
            assert_eq!(JobState::parse(state.as_str()), Some(state));
        }
        assert_eq!(JobState::parse("unknown"), None);
    }

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Error > Severity::Warning);
        assert!(Severity::Warning > Severity::Info);
    }

    #[test]
    fn test_category_order_is_fixed() {
        assert_eq!(IssueCategory::ORDERED[0], IssueCategory::RequiredField);
        assert_eq!(IssueCategory::ORDERED[5], IssueCategory::Quality);
    }
}
