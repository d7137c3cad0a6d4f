// ==========================================
// 数据迁移导入引擎 - 数据质量校验器实现
// ==========================================
// 类别顺序（每条记录固定）: 必填 → 类型 → 格式 → 引用 → 业务规则 → 质量
// 同一字段一旦被前序类别标记，后续类别跳过该字段
// 幂等: 问题 ID 由 (作业, 行, 字段, 代码) 确定，重复校验结果一致
// ==========================================

use crate::domain::mapping::{FieldMapping, MappingStatus};
use crate::domain::record::TransformedRecord;
use crate::domain::schema::{BusinessRule, FieldType, TargetField, TargetSchema};
use crate::domain::types::{IssueCategory, Severity};
use crate::domain::validation::ValidationIssue;
use crate::i18n;
use crate::importer::data_cleaner::DataCleaner;
use crate::importer::error::{ImportError, ImportResult};
use crate::importer::field_mapper::string_similarity;
use crate::importer::importer_trait::RowParseError;
use crate::repository::schema_provider::TargetSchemaProvider;
use chrono::{DateTime, NaiveDate, Utc};
use regex::Regex;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use uuid::Uuid;

/// 常见占位值（质量类提示）
const PLACEHOLDER_VALUES: [&str; 6] = ["test", "tbd", "xxx", "asdf", "todo", "?"];

/// 引用查询缓存: (实体类型, ID) → 是否存在
pub type ReferenceCache = HashMap<(String, String), bool>;

// ==========================================
// 问题代码
// ==========================================
pub mod issue_codes {
    pub const REQUIRED_MISSING: &str = "required_missing";
    pub const TRANSFORMATION_FAILED: &str = "transformation_failed";
    pub const TYPE_MISMATCH: &str = "type_mismatch";
    pub const INVALID_EMAIL: &str = "invalid_email";
    pub const INVALID_ENUM_VALUE: &str = "invalid_enum_value";
    pub const PATTERN_MISMATCH: &str = "pattern_mismatch";
    pub const TOO_LONG: &str = "too_long";
    pub const OUT_OF_RANGE: &str = "out_of_range";
    pub const UNRESOLVED_REFERENCE: &str = "unresolved_reference";
    pub const DATE_ORDER: &str = "date_order";
    pub const REQUIRED_IF: &str = "required_if";
    pub const PLACEHOLDER_VALUE: &str = "placeholder_value";
    pub const DEFAULT_APPLIED: &str = "default_applied";
    pub const DUPLICATE_RECORD: &str = "duplicate_record";
    pub const MALFORMED_ROW: &str = "malformed_row";
    pub const MAPPING_UNCONFIRMED: &str = "mapping_unconfirmed";
}

use issue_codes::*;

/// 问题草稿（由 finish 补全作业/ID/时间）
struct Draft {
    row_number: Option<usize>,
    severity: Severity,
    category: IssueCategory,
    field: Option<String>,
    code: &'static str,
    message: String,
    source_value: Option<String>,
    auto_fixable: bool,
    suggested_fix: Option<String>,
}

fn finish(job_id: &str, draft: Draft, now: DateTime<Utc>) -> ValidationIssue {
    let identity = format!(
        "{}/{}/{}/{}",
        job_id,
        draft.row_number.map(|r| r.to_string()).unwrap_or_default(),
        draft.field.as_deref().unwrap_or(""),
        draft.code
    );
    ValidationIssue {
        issue_id: Uuid::new_v5(&Uuid::NAMESPACE_OID, identity.as_bytes()).to_string(),
        job_id: job_id.to_string(),
        row_number: draft.row_number,
        severity: draft.severity,
        category: draft.category,
        field: draft.field,
        code: draft.code.to_string(),
        message: draft.message,
        source_value: draft.source_value,
        auto_fixable: draft.auto_fixable,
        suggested_fix: draft.suggested_fix,
        resolved: false,
        created_at: now,
    }
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

pub struct DqValidator {
    schema: TargetSchema,
    patterns: HashMap<String, Regex>, // 字段名 → 格式正则
    lookup_timeout: Duration,
}

impl DqValidator {
    /// 创建校验器
    ///
    /// # 返回
    /// - Err(InvalidArgument): 模式中的格式正则无效
    pub fn new(schema: TargetSchema, lookup_timeout: Duration) -> ImportResult<Self> {
        let mut patterns = HashMap::new();
        for field in &schema.fields {
            if let Some(pattern) = &field.pattern {
                let re = Regex::new(pattern).map_err(|e| {
                    ImportError::InvalidArgument(format!(
                        "字段 {} 的格式正则无效: {}",
                        field.name, e
                    ))
                })?;
                patterns.insert(field.name.clone(), re);
            }
        }
        Ok(Self {
            schema,
            patterns,
            lookup_timeout,
        })
    }

    /// 校验单条转换后记录
    ///
    /// # 参数
    /// - refs: 目标领域的存在性查询
    /// - cache: 本轮校验内的引用查询缓存
    ///
    /// # 返回
    /// - Ok(Vec<ValidationIssue>): 按类别顺序排列的问题
    /// - Err(Timeout / Repository): 引用查询失败
    pub async fn validate_record(
        &self,
        job_id: &str,
        record: &TransformedRecord,
        refs: &dyn TargetSchemaProvider,
        cache: &mut ReferenceCache,
        now: DateTime<Utc>,
    ) -> ImportResult<Vec<ValidationIssue>> {
        let row = Some(record.row_number);
        let mut drafts: Vec<Draft> = Vec::new();
        let mut flagged: HashSet<&str> = HashSet::new();

        let value_of = |name: &str| record.target.get(name).filter(|v| !v.is_null());

        for category in IssueCategory::ORDERED {
            match category {
                // ===== 必填 =====
                IssueCategory::RequiredField => {
                    for field in self.schema.required_fields() {
                        if value_of(&field.name).is_none() && !record.failed_field(&field.name) {
                            flagged.insert(field.name.as_str());
                            drafts.push(Draft {
                                row_number: row,
                                severity: Severity::Error,
                                category,
                                field: Some(field.name.clone()),
                                code: REQUIRED_MISSING,
                                message: format!("必填字段 {} 缺失", field.name),
                                source_value: None,
                                auto_fixable: false,
                                suggested_fix: Some(i18n::t_with_args(
                                    "fix.required_missing",
                                    &[("field", field.name.as_str())],
                                )),
                            });
                        }
                    }
                }
                // ===== 类型（含转换失败） =====
                IssueCategory::Type => {
                    for failure in &record.failures {
                        let required = self
                            .schema
                            .field(&failure.field)
                            .map(|f| f.required)
                            .unwrap_or(false);
                        flagged.insert(failure.field.as_str());
                        let err = ImportError::TransformationFailed {
                            row: record.row_number,
                            field: failure.field.clone(),
                            value: failure.source_value.clone(),
                            message: failure.message.clone(),
                        };
                        drafts.push(Draft {
                            row_number: row,
                            severity: if required {
                                Severity::Error
                            } else {
                                Severity::Warning
                            },
                            category,
                            field: Some(failure.field.clone()),
                            code: TRANSFORMATION_FAILED,
                            message: err.to_string(),
                            source_value: Some(failure.source_value.clone()),
                            auto_fixable: false,
                            suggested_fix: Some(i18n::t_with_args(
                                "fix.transformation_failed",
                                &[("field", failure.field.as_str())],
                            )),
                        });
                    }
                    for field in &self.schema.fields {
                        if flagged.contains(field.name.as_str()) {
                            continue;
                        }
                        if let Some(value) = value_of(&field.name) {
                            if !type_matches(value, field.field_type) {
                                flagged.insert(field.name.as_str());
                                drafts.push(Draft {
                                    row_number: row,
                                    severity: Severity::Error,
                                    category,
                                    field: Some(field.name.clone()),
                                    code: TYPE_MISMATCH,
                                    message: format!(
                                        "字段 {} 期望类型 {}",
                                        field.name,
                                        field.field_type.as_str()
                                    ),
                                    source_value: Some(value_text(value)),
                                    auto_fixable: false,
                                    suggested_fix: Some(i18n::t_with_args(
                                        "fix.type_mismatch",
                                        &[("field", field.name.as_str()), ("type", field.field_type.as_str())],
                                    )),
                                });
                            }
                        }
                    }
                }
                // ===== 格式 =====
                IssueCategory::Format => {
                    for field in &self.schema.fields {
                        if flagged.contains(field.name.as_str()) {
                            continue;
                        }
                        let Some(value) = value_of(&field.name) else {
                            continue;
                        };
                        if let Some(draft) = self.check_format(field, value, row) {
                            flagged.insert(field.name.as_str());
                            drafts.push(draft);
                        }
                    }
                }
                // ===== 引用 =====
                IssueCategory::Reference => {
                    for field in &self.schema.fields {
                        let Some(entity) = &field.reference_entity else {
                            continue;
                        };
                        if flagged.contains(field.name.as_str()) {
                            continue;
                        }
                        let Some(value) = value_of(&field.name) else {
                            continue;
                        };
                        let id = value_text(value);
                        if self.reference_exists(refs, cache, entity, &id).await? {
                            continue;
                        }
                        flagged.insert(field.name.as_str());
                        drafts.push(Draft {
                            row_number: row,
                            // 可选字段降级为警告
                            severity: if field.required {
                                Severity::Error
                            } else {
                                Severity::Warning
                            },
                            category,
                            field: Some(field.name.clone()),
                            code: UNRESOLVED_REFERENCE,
                            message: format!("{} 引用的 {} '{}' 不存在", field.name, entity, id),
                            source_value: Some(id.clone()),
                            auto_fixable: false,
                            suggested_fix: Some(i18n::t_with_args(
                                "fix.unresolved_reference",
                                &[("entity", entity.as_str()), ("value", id.as_str())],
                            )),
                        });
                    }
                }
                // ===== 业务规则 =====
                IssueCategory::BusinessRule => {
                    for rule in &self.schema.business_rules {
                        if let Some(draft) = self.check_business_rule(rule, record, &flagged) {
                            drafts.push(draft);
                        }
                    }
                }
                // ===== 质量 =====
                IssueCategory::Quality => {
                    for field in &self.schema.fields {
                        if flagged.contains(field.name.as_str()) {
                            continue;
                        }
                        if let Some(Value::String(text)) = value_of(&field.name) {
                            let lowered = text.trim().to_lowercase();
                            if PLACEHOLDER_VALUES.contains(&lowered.as_str()) {
                                drafts.push(Draft {
                                    row_number: row,
                                    severity: Severity::Warning,
                                    category,
                                    field: Some(field.name.clone()),
                                    code: PLACEHOLDER_VALUE,
                                    message: format!("字段 {} 疑似占位值 '{}'", field.name, text),
                                    source_value: Some(text.clone()),
                                    auto_fixable: false,
                                    suggested_fix: Some(i18n::t_with_args(
                                        "fix.placeholder_value",
                                        &[("field", field.name.as_str())],
                                    )),
                                });
                            }
                        }
                        if field.required
                            && record
                                .applied
                                .iter()
                                .any(|a| a.field == field.name && a.step == "default")
                        {
                            drafts.push(Draft {
                                row_number: row,
                                severity: Severity::Info,
                                category,
                                field: Some(field.name.clone()),
                                code: DEFAULT_APPLIED,
                                message: format!("必填字段 {} 使用了映射默认值", field.name),
                                source_value: None,
                                auto_fixable: false,
                                suggested_fix: None,
                            });
                        }
                    }
                }
            }
        }

        Ok(drafts.into_iter().map(|d| finish(job_id, d, now)).collect())
    }

    async fn reference_exists(
        &self,
        refs: &dyn TargetSchemaProvider,
        cache: &mut ReferenceCache,
        entity: &str,
        id: &str,
    ) -> ImportResult<bool> {
        let key = (entity.to_string(), id.to_string());
        if let Some(hit) = cache.get(&key) {
            return Ok(*hit);
        }
        let exists = tokio::time::timeout(self.lookup_timeout, refs.exists_by_id(entity, id))
            .await
            .map_err(|_| {
                ImportError::Timeout(format!("引用查询 {} '{}' 超时", entity, id))
            })??;
        cache.insert(key, exists);
        Ok(exists)
    }

    fn check_format(&self, field: &TargetField, value: &Value, row: Option<usize>) -> Option<Draft> {
        let text = value_text(value);
        let draft = |code: &'static str, message: String, auto_fixable: bool, fix: String| Draft {
            row_number: row,
            severity: Severity::Error,
            category: IssueCategory::Format,
            field: Some(field.name.clone()),
            code,
            message,
            source_value: Some(text.clone()),
            auto_fixable,
            suggested_fix: Some(fix),
        };

        if field.field_type == FieldType::Email && !DataCleaner::is_email(&text) {
            return Some(draft(
                INVALID_EMAIL,
                format!("'{}' 不是有效的邮箱地址", text),
                false,
                i18n::t_with_args("fix.invalid_email", &[("field", field.name.as_str())]),
            ));
        }

        if field.field_type == FieldType::Enum
            && !field.enum_values.is_empty()
            && !field.enum_values.iter().any(|v| v == &text)
        {
            let closest = field
                .enum_values
                .iter()
                .map(|v| (v, string_similarity(&text, v)))
                .filter(|(_, s)| *s >= 0.6)
                .max_by(|a, b| a.1.total_cmp(&b.1))
                .map(|(v, _)| v.clone());
            let fix = match &closest {
                Some(v) => i18n::t_with_args("fix.invalid_enum_value", &[("value", v.as_str())]),
                None => i18n::t_with_args(
                    "fix.invalid_enum_value_list",
                    &[("values", field.enum_values.join(", ").as_str())],
                ),
            };
            return Some(draft(
                INVALID_ENUM_VALUE,
                format!("'{}' 不在 {} 的取值范围内", text, field.name),
                closest.is_some(),
                fix,
            ));
        }

        if let Some(re) = self.patterns.get(&field.name) {
            if !re.is_match(&text) {
                return Some(draft(
                    PATTERN_MISMATCH,
                    format!("'{}' 不符合格式 {}", text, re.as_str()),
                    false,
                    i18n::t_with_args(
                        "fix.pattern_mismatch",
                        &[("field", field.name.as_str()), ("pattern", re.as_str())],
                    ),
                ));
            }
        }

        if let Some(max_len) = field.max_length {
            if text.chars().count() > max_len {
                return Some(draft(
                    TOO_LONG,
                    format!("字段 {} 长度超过 {}", field.name, max_len),
                    true,
                    i18n::t_with_args(
                        "fix.too_long",
                        &[("field", field.name.as_str()), ("max", max_len.to_string().as_str())],
                    ),
                ));
            }
        }

        if let Some(number) = value.as_f64() {
            let below = field.min.map(|min| number < min).unwrap_or(false);
            let above = field.max.map(|max| number > max).unwrap_or(false);
            if below || above {
                let range = format!(
                    "[{}, {}]",
                    field.min.map(|v| v.to_string()).unwrap_or_else(|| "-∞".to_string()),
                    field.max.map(|v| v.to_string()).unwrap_or_else(|| "+∞".to_string())
                );
                return Some(draft(
                    OUT_OF_RANGE,
                    format!("字段 {} 的值 {} 超出范围 {}", field.name, number, range),
                    false,
                    i18n::t_with_args("fix.out_of_range", &[("field", field.name.as_str()), ("range", range.as_str())]),
                ));
            }
        }
        None
    }

    fn check_business_rule(
        &self,
        rule: &BusinessRule,
        record: &TransformedRecord,
        flagged: &HashSet<&str>,
    ) -> Option<Draft> {
        let text_of = |name: &str| {
            record
                .target
                .get(name)
                .filter(|v| !v.is_null())
                .map(value_text)
        };
        match rule {
            BusinessRule::DateOrder { earlier, later } => {
                if flagged.contains(earlier.as_str()) || flagged.contains(later.as_str()) {
                    return None;
                }
                let first = text_of(earlier).and_then(|t| parse_any_date(&t))?;
                let second = text_of(later).and_then(|t| parse_any_date(&t))?;
                (first > second).then(|| Draft {
                    row_number: Some(record.row_number),
                    severity: Severity::Error,
                    category: IssueCategory::BusinessRule,
                    field: Some(later.clone()),
                    code: DATE_ORDER,
                    message: format!("{} ({}) 早于 {} ({})", later, second, earlier, first),
                    source_value: text_of(later),
                    auto_fixable: false,
                    suggested_fix: Some(i18n::t_with_args(
                        "fix.date_order",
                        &[("earlier", earlier.as_str()), ("later", later.as_str())],
                    )),
                })
            }
            BusinessRule::RequiredIf {
                field,
                when_field,
                equals,
            } => {
                if flagged.contains(field.as_str()) {
                    return None;
                }
                let condition = text_of(when_field)
                    .map(|v| v.trim().eq_ignore_ascii_case(equals.trim()))
                    .unwrap_or(false);
                (condition && text_of(field).is_none()).then(|| Draft {
                    row_number: Some(record.row_number),
                    severity: Severity::Error,
                    category: IssueCategory::BusinessRule,
                    field: Some(field.clone()),
                    code: REQUIRED_IF,
                    message: format!("{} 为 {} 时 {} 必填", when_field, equals, field),
                    source_value: None,
                    auto_fixable: false,
                    suggested_fix: Some(i18n::t_with_args(
                        "fix.required_if",
                        &[("field", field.as_str()), ("when", when_field.as_str()), ("equals", equals.as_str())],
                    )),
                })
            }
        }
    }

    // ==========================================
    // 非记录级问题
    // ==========================================

    /// 畸形行（分析阶段已跳过）
    pub fn malformed_row_issue(job_id: &str, err: &RowParseError, now: DateTime<Utc>) -> ValidationIssue {
        finish(
            job_id,
            Draft {
                row_number: Some(err.row_number),
                severity: Severity::Warning,
                category: IssueCategory::Quality,
                field: None,
                code: MALFORMED_ROW,
                message: format!("第 {} 行无法解析，已跳过: {}", err.row_number, err.message),
                source_value: None,
                auto_fixable: false,
                suggested_fix: Some(i18n::t("fix.malformed_row")),
            },
            now,
        )
    }

    /// 文件内重复的源记录 ID（仅新增模式为错误；增量模式保留首条）
    pub fn duplicate_issue(
        job_id: &str,
        row_number: usize,
        source_record_id: &str,
        incremental: bool,
        now: DateTime<Utc>,
    ) -> ValidationIssue {
        let err = ImportError::RecordConflict {
            row: row_number,
            source_record_id: source_record_id.to_string(),
        };
        finish(
            job_id,
            Draft {
                row_number: Some(row_number),
                severity: if incremental {
                    Severity::Warning
                } else {
                    Severity::Error
                },
                category: IssueCategory::Quality,
                field: None,
                code: DUPLICATE_RECORD,
                message: err.to_string(),
                source_value: Some(source_record_id.to_string()),
                auto_fixable: false,
                suggested_fix: Some(i18n::t_with_args(
                    "fix.duplicate_record",
                    &[("id", source_record_id)],
                )),
            },
            now,
        )
    }

    /// 待确认的映射（作业级提示）
    pub fn mapping_issues(job_id: &str, mapping: &FieldMapping, now: DateTime<Utc>) -> Vec<ValidationIssue> {
        mapping
            .columns
            .iter()
            .filter(|c| c.status == MappingStatus::NeedsConfirmation)
            .map(|c| {
                let target = c.target_field.clone().unwrap_or_default();
                finish(
                    job_id,
                    Draft {
                        row_number: None,
                        severity: Severity::Info,
                        category: IssueCategory::Quality,
                        field: c.target_field.clone(),
                        code: MAPPING_UNCONFIRMED,
                        message: format!(
                            "列 {} → {} 的映射置信度 {:.2}，尚未确认",
                            c.source_column, target, c.confidence
                        ),
                        source_value: Some(c.source_column.clone()),
                        auto_fixable: false,
                        suggested_fix: Some(i18n::t_with_args(
                            "fix.mapping_unconfirmed",
                            &[("column", c.source_column.as_str())],
                        )),
                    },
                    now,
                )
            })
            .collect()
    }
}

fn type_matches(value: &Value, field_type: FieldType) -> bool {
    match field_type {
        FieldType::Integer => value.is_i64() || value.is_u64(),
        FieldType::Decimal => value.is_number(),
        FieldType::Boolean => value.is_boolean(),
        FieldType::Date => value
            .as_str()
            .map(|s| NaiveDate::parse_from_str(s, "%Y-%m-%d").is_ok())
            .unwrap_or(false),
        FieldType::DateTime => value
            .as_str()
            .map(|s| DateTime::parse_from_rfc3339(s).is_ok())
            .unwrap_or(false),
        FieldType::Text | FieldType::Email | FieldType::Enum => value.is_string(),
    }
}

fn parse_any_date(text: &str) -> Option<NaiveDate> {
    DataCleaner::parse_date(text).or_else(|| DataCleaner::parse_datetime(text).map(|dt| dt.date_naive()))
}
