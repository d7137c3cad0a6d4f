// ==========================================
// 数据迁移导入引擎 - 校验问题与报告
// ==========================================

use crate::domain::types::{IssueCategory, Severity};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ==========================================
// ValidationIssue - 校验问题
// ==========================================
// 创建后不可变（仅允许标记 resolved）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub issue_id: String,
    pub job_id: String,
    pub row_number: Option<usize>,     // 源文件行号（1 起，不含表头）
    pub severity: Severity,
    pub category: IssueCategory,
    pub field: Option<String>,
    pub code: String,                  // 问题代码（用于建议修复查找）
    pub message: String,
    pub source_value: Option<String>,
    pub auto_fixable: bool,
    pub suggested_fix: Option<String>,
    pub resolved: bool,
    pub created_at: DateTime<Utc>,
}

// ==========================================
// ValidationReport - 校验报告
// ==========================================
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValidationReport {
    pub job_id: String,
    pub error_count: usize,
    pub warning_count: usize,
    pub info_count: usize,
    pub records_checked: usize,
    pub issues: Vec<ValidationIssue>,
}

impl ValidationReport {
    /// 从问题列表汇总计数
    pub fn from_issues(job_id: &str, records_checked: usize, issues: Vec<ValidationIssue>) -> Self {
        let mut report = ValidationReport {
            job_id: job_id.to_string(),
            records_checked,
            ..Default::default()
        };
        for issue in &issues {
            match issue.severity {
                Severity::Error => report.error_count += 1,
                Severity::Warning => report.warning_count += 1,
                Severity::Info => report.info_count += 1,
            }
        }
        report.issues = issues;
        report
    }

    /// 是否允许进入执行
    pub fn can_execute(&self) -> bool {
        self.error_count == 0
    }

    /// 首条错误（用于 ValidationBlocked 摘要）
    pub fn first_error(&self) -> Option<&ValidationIssue> {
        self.issues.iter().find(|i| i.severity == Severity::Error)
    }
}
