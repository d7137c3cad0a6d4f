// ==========================================
// 数据迁移导入引擎 - 转换引擎
// ==========================================
// 职责: record → record' 纯函数（每个目标字段: 取值 → 值映射 → 规则 → 类型规范化）
// 顺序固定: 值映射先于规则，规则可假定枚举已规范化
// 失败: 单字段输出 null 并记录 TransformFailure，不影响同记录其它字段
// ==========================================

use crate::domain::mapping::{FieldMapping, MappingStatus, ValueMap};
use crate::domain::record::{AppliedTransformation, SourceRow, TransformFailure, TransformedRecord};
use crate::domain::rule::{Predicate, PredicateOp, RuleValue, StringOp, TransformationRule};
use crate::domain::schema::{TargetField, TargetSchema};
use crate::domain::types::UnmappedFieldAction;
use crate::importer::data_cleaner::DataCleaner;
use crate::importer::error::{ImportError, ImportResult};
use crate::importer::importer_trait::Clock;
use crate::repository::job_repo::StoredRule;
use chrono::{NaiveDate, NaiveDateTime, SecondsFormat};
use regex::Regex;
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

/// 未映射列 store_as_custom 的目标对象
pub const CUSTOM_FIELDS_KEY: &str = "custom_fields";
/// 未映射列 store_in_overflow 的目标对象
pub const OVERFLOW_KEY: &str = "_overflow";

// ==========================================
// RecordTransformer - 作业级转换器（构建一次，逐行复用）
// ==========================================
pub struct RecordTransformer {
    schema: TargetSchema,
    mapping: FieldMapping,
    value_maps: HashMap<String, ValueMap>,      // target_field → ValueMap
    rules_by_id: HashMap<String, TransformationRule>,
    rules_by_field: HashMap<String, TransformationRule>,
    regexes: HashMap<String, Regex>,            // 预编译的正则（规则与谓词）
    clock: Arc<dyn Clock>,
}

impl RecordTransformer {
    /// 构建转换器
    ///
    /// # 参数
    /// - rules: 作业内已登记的规则（同字段多条时以后登记者为准）
    ///
    /// # 返回
    /// - Err(InvalidArgument): 规则中的正则无法编译
    pub fn new(
        schema: TargetSchema,
        mapping: FieldMapping,
        value_maps: Vec<ValueMap>,
        rules: Vec<StoredRule>,
        clock: Arc<dyn Clock>,
    ) -> ImportResult<Self> {
        let mut regexes = HashMap::new();
        for stored in &rules {
            collect_patterns(&stored.rule, &mut |pattern: &str| {
                if !regexes.contains_key(pattern) {
                    let re = Regex::new(pattern).map_err(|e| {
                        ImportError::InvalidArgument(format!(
                            "规则 {} 的正则无效 '{}': {}",
                            stored.rule_id, pattern, e
                        ))
                    })?;
                    regexes.insert(pattern.to_string(), re);
                }
                Ok(())
            })?;
        }

        let mut rules_by_id = HashMap::new();
        let mut rules_by_field = HashMap::new();
        for stored in rules {
            rules_by_field.insert(stored.target_field.clone(), stored.rule.clone());
            rules_by_id.insert(stored.rule_id, stored.rule);
        }

        Ok(Self {
            schema,
            mapping,
            value_maps: value_maps
                .into_iter()
                .map(|m| (m.target_field.clone(), m))
                .collect(),
            rules_by_id,
            rules_by_field,
            regexes,
            clock,
        })
    }

    pub fn schema(&self) -> &TargetSchema {
        &self.schema
    }

    /// 转换单行
    pub fn transform(&self, row: &SourceRow) -> TransformedRecord {
        let mut target = Map::new();
        let mut applied = Vec::new();
        let mut failures = Vec::new();

        for field in &self.schema.fields {
            let (value, raw) = self.initial_value(field, row, &mut applied);
            let value = self.apply_value_map(field, value, &mut applied);

            let value = match self.rule_for(field) {
                Some(rule) => match self.apply_rule(rule, &value, row) {
                    Ok(out) => {
                        if out != value {
                            applied.push(AppliedTransformation {
                                field: field.name.clone(),
                                step: rule.kind().to_string(),
                                before: value.clone(),
                                after: out.clone(),
                            });
                        }
                        out
                    }
                    Err(message) => {
                        failures.push(TransformFailure {
                            field: field.name.clone(),
                            source_value: raw.clone().unwrap_or_else(|| value_text(&value)),
                            message,
                        });
                        target.insert(field.name.clone(), Value::Null);
                        continue;
                    }
                },
                None => value,
            };

            match DataCleaner::coerce(&value, field) {
                Ok(out) => {
                    if out != value && !value.is_null() {
                        applied.push(AppliedTransformation {
                            field: field.name.clone(),
                            step: "coerce".to_string(),
                            before: value,
                            after: out.clone(),
                        });
                    }
                    target.insert(field.name.clone(), out);
                }
                Err(message) => {
                    failures.push(TransformFailure {
                        field: field.name.clone(),
                        source_value: raw.unwrap_or_else(|| value_text(&value)),
                        message,
                    });
                    target.insert(field.name.clone(), Value::Null);
                }
            }
        }

        self.apply_unmapped(row, &mut target, &mut applied);

        TransformedRecord {
            row_number: row.row_number,
            source: row.to_map(),
            target,
            applied,
            failures,
        }
    }

    /// 字段初始值: 映射列 → 映射默认值 → null
    fn initial_value(
        &self,
        field: &TargetField,
        row: &SourceRow,
        applied: &mut Vec<AppliedTransformation>,
    ) -> (Value, Option<String>) {
        if let Some(col) = self.mapping.for_target(&field.name) {
            if let Some(raw) = row.get(&col.source_column) {
                if let Some(text) = DataCleaner::normalize_null(raw) {
                    return (Value::String(text.to_string()), Some(raw.to_string()));
                }
            }
        }
        match self.mapping.defaults.get(&field.name) {
            Some(default) => {
                applied.push(AppliedTransformation {
                    field: field.name.clone(),
                    step: "default".to_string(),
                    before: Value::Null,
                    after: default.clone(),
                });
                (default.clone(), None)
            }
            None => (Value::Null, None),
        }
    }

    fn apply_value_map(
        &self,
        field: &TargetField,
        value: Value,
        applied: &mut Vec<AppliedTransformation>,
    ) -> Value {
        let (Some(map), Value::String(text)) = (self.value_maps.get(&field.name), &value) else {
            return value;
        };
        let mapped = map
            .lookup(text)
            .cloned()
            .or_else(|| map.default_value.clone());
        match mapped {
            Some(out) if out != value => {
                applied.push(AppliedTransformation {
                    field: field.name.clone(),
                    step: "value_map".to_string(),
                    before: value,
                    after: out.clone(),
                });
                out
            }
            _ => value,
        }
    }

    /// 字段规则: 映射条目引用的规则优先，其次按字段登记的规则
    fn rule_for(&self, field: &TargetField) -> Option<&TransformationRule> {
        self.mapping
            .for_target(&field.name)
            .and_then(|c| c.rule_id.as_ref())
            .and_then(|id| self.rules_by_id.get(id))
            .or_else(|| self.rules_by_field.get(&field.name))
    }

    /// 执行单条规则
    fn apply_rule(
        &self,
        rule: &TransformationRule,
        current: &Value,
        row: &SourceRow,
    ) -> Result<Value, String> {
        match rule {
            TransformationRule::DateFormat {
                input_pattern,
                with_time,
            } => {
                let Some(text) = non_empty_text(current) else {
                    return Ok(Value::Null);
                };
                convert_date(&text, input_pattern, *with_time).map(Value::String)
            }
            TransformationRule::StringOps { ops } => {
                let Some(text) = non_empty_text(current) else {
                    return Ok(Value::Null);
                };
                Ok(Value::String(
                    ops.iter().fold(text, |acc, op| apply_string_op(op, acc)),
                ))
            }
            TransformationRule::RegexReplace {
                pattern,
                replacement,
            } => {
                let Some(text) = non_empty_text(current) else {
                    return Ok(Value::Null);
                };
                let re = self
                    .regexes
                    .get(pattern)
                    .ok_or_else(|| format!("正则未编译: {}", pattern))?;
                Ok(Value::String(
                    re.replace_all(&text, replacement.as_str()).into_owned(),
                ))
            }
            TransformationRule::Lookup {
                table,
                default,
                case_sensitive,
            } => {
                let Some(text) = non_empty_text(current) else {
                    return Ok(Value::Null);
                };
                let hit = if *case_sensitive {
                    table.get(&text)
                } else {
                    table
                        .iter()
                        .find(|(k, _)| k.trim().eq_ignore_ascii_case(text.trim()))
                        .map(|(_, v)| v)
                };
                hit.or(default.as_ref())
                    .cloned()
                    .ok_or_else(|| format!("查找表中没有 '{}'", text))
            }
            TransformationRule::Conditional { branches, default } => {
                for branch in branches {
                    if self.evaluate(&branch.when, current, row)? {
                        return Ok(self.resolve(&branch.then, current, row));
                    }
                }
                Ok(self.resolve(default, current, row))
            }
            TransformationRule::Concat {
                parts,
                separator,
                skip_empty,
            } => {
                let pieces: Vec<String> = parts
                    .iter()
                    .map(|p| value_text(&self.resolve(p, current, row)))
                    .filter(|s| !*skip_empty || !s.trim().is_empty())
                    .collect();
                if pieces.is_empty() {
                    Ok(Value::Null)
                } else {
                    Ok(Value::String(pieces.join(separator)))
                }
            }
            TransformationRule::Split {
                separator,
                index,
                trim,
            } => {
                let Some(text) = non_empty_text(current) else {
                    return Ok(Value::Null);
                };
                if separator.is_empty() {
                    return Err("拆分分隔符为空".to_string());
                }
                Ok(text
                    .split(separator.as_str())
                    .nth(*index)
                    .map(|s| if *trim { s.trim() } else { s })
                    .filter(|s| !s.is_empty())
                    .map(|s| Value::String(s.to_string()))
                    .unwrap_or(Value::Null))
            }
        }
    }

    fn resolve(&self, source: &RuleValue, current: &Value, row: &SourceRow) -> Value {
        match source {
            RuleValue::Literal(v) => v.clone(),
            RuleValue::Column(column) => row
                .get(column)
                .and_then(DataCleaner::normalize_null)
                .map(|s| Value::String(s.to_string()))
                .unwrap_or(Value::Null),
            RuleValue::Current => current.clone(),
            RuleValue::Now => Value::String(
                self.clock
                    .now()
                    .to_rfc3339_opts(SecondsFormat::Secs, true),
            ),
            RuleValue::Null => Value::Null,
        }
    }

    fn evaluate(&self, predicate: &Predicate, current: &Value, row: &SourceRow) -> Result<bool, String> {
        let operand = match &predicate.column {
            Some(column) => self.resolve(&RuleValue::Column(column.clone()), current, row),
            None => current.clone(),
        };
        let text = value_text(&operand);
        let expected = predicate.value.as_ref().map(value_text).unwrap_or_default();

        let result = match predicate.op {
            PredicateOp::IsEmpty => DataCleaner::is_null_token(&text),
            PredicateOp::NotEmpty => !DataCleaner::is_null_token(&text),
            PredicateOp::Equals => text.trim() == expected.trim(),
            PredicateOp::NotEquals => text.trim() != expected.trim(),
            PredicateOp::Contains => text.contains(&expected),
            PredicateOp::StartsWith => text.starts_with(&expected),
            PredicateOp::GreaterThan => compare_loose(&text, &expected) == Some(Ordering::Greater),
            PredicateOp::LessThan => compare_loose(&text, &expected) == Some(Ordering::Less),
            PredicateOp::In => match &predicate.value {
                Some(Value::Array(items)) => items
                    .iter()
                    .any(|item| value_text(item).trim() == text.trim()),
                _ => return Err("in 谓词需要数组取值".to_string()),
            },
            PredicateOp::Matches => {
                let re = self
                    .regexes
                    .get(&expected)
                    .ok_or_else(|| format!("正则未编译: {}", expected))?;
                re.is_match(&text)
            }
        };
        Ok(result)
    }

    /// 未映射列按其处理方式写入 custom_fields / _overflow
    fn apply_unmapped(
        &self,
        row: &SourceRow,
        target: &mut Map<String, Value>,
        applied: &mut Vec<AppliedTransformation>,
    ) {
        for col in &self.mapping.columns {
            if col.status != MappingStatus::Unmapped {
                continue;
            }
            let key = match col.unmapped_action {
                UnmappedFieldAction::Ignore => continue,
                UnmappedFieldAction::StoreAsCustom => CUSTOM_FIELDS_KEY,
                UnmappedFieldAction::StoreInOverflow => OVERFLOW_KEY,
            };
            let Some(raw) = row.get(&col.source_column) else {
                continue;
            };
            let value = DataCleaner::normalize_null(raw)
                .map(|s| Value::String(s.to_string()))
                .unwrap_or(Value::Null);
            let bucket = target
                .entry(key.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if let Value::Object(obj) = bucket {
                obj.insert(col.source_column.clone(), value.clone());
                applied.push(AppliedTransformation {
                    field: format!("{}.{}", key, col.source_column),
                    step: "unmapped".to_string(),
                    before: Value::Null,
                    after: value,
                });
            }
        }
    }
}

/// 收集规则中出现的正则（RegexReplace 与 matches 谓词）
fn collect_patterns<F>(rule: &TransformationRule, sink: &mut F) -> ImportResult<()>
where
    F: FnMut(&str) -> ImportResult<()>,
{
    match rule {
        TransformationRule::RegexReplace { pattern, .. } => sink(pattern),
        TransformationRule::Conditional { branches, .. } => {
            for branch in branches {
                if branch.when.op == PredicateOp::Matches {
                    let pattern = branch.when.value.as_ref().map(value_text).unwrap_or_default();
                    sink(&pattern)?;
                }
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

fn value_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn non_empty_text(value: &Value) -> Option<String> {
    let text = value_text(value);
    if DataCleaner::is_null_token(&text) {
        None
    } else {
        Some(text.trim().to_string())
    }
}

/// 数值 → 日期 → 字符串 依次尝试比较
fn compare_loose(a: &str, b: &str) -> Option<Ordering> {
    if let (Some(x), Some(y)) = (DataCleaner::parse_decimal(a), DataCleaner::parse_decimal(b)) {
        return x.partial_cmp(&y);
    }
    if let (Some(x), Some(y)) = (DataCleaner::parse_date(a), DataCleaner::parse_date(b)) {
        return Some(x.cmp(&y));
    }
    Some(a.cmp(b))
}

fn apply_string_op(op: &StringOp, value: String) -> String {
    match op {
        StringOp::Trim => value.trim().to_string(),
        StringOp::Upper => value.to_uppercase(),
        StringOp::Lower => value.to_lowercase(),
        StringOp::Title => value
            .split_whitespace()
            .map(|word| {
                let mut chars = word.chars();
                match chars.next() {
                    Some(first) => first
                        .to_uppercase()
                        .chain(chars.flat_map(|c| c.to_lowercase()))
                        .collect::<String>(),
                    None => String::new(),
                }
            })
            .collect::<Vec<_>>()
            .join(" "),
        StringOp::CollapseWhitespace => value.split_whitespace().collect::<Vec<_>>().join(" "),
        StringOp::Prefix(prefix) => format!("{}{}", prefix, value),
        StringOp::Suffix(suffix) => format!("{}{}", value, suffix),
        StringOp::Truncate(n) => value.chars().take(*n).collect(),
        StringOp::Replace { from, to } => value.replace(from.as_str(), to),
    }
}

/// 声明式日期格式 → strftime（YYYY/YY/MM/DD/HH/mm/ss；含 % 视为已是 strftime）
pub fn to_strftime(pattern: &str) -> String {
    if pattern.contains('%') {
        return pattern.to_string();
    }
    const TOKENS: [(&str, &str); 7] = [
        ("YYYY", "%Y"),
        ("YY", "%y"),
        ("MM", "%m"),
        ("DD", "%d"),
        ("HH", "%H"),
        ("mm", "%M"),
        ("ss", "%S"),
    ];
    let mut out = String::new();
    let mut rest = pattern;
    'outer: while !rest.is_empty() {
        for (token, chrono_fmt) in TOKENS {
            if let Some(tail) = rest.strip_prefix(token) {
                out.push_str(chrono_fmt);
                rest = tail;
                continue 'outer;
            }
        }
        let mut chars = rest.chars();
        if let Some(c) = chars.next() {
            out.push(c);
        }
        rest = chars.as_str();
    }
    out
}

/// 按声明格式解析并输出 ISO-8601
fn convert_date(text: &str, input_pattern: &str, with_time: bool) -> Result<String, String> {
    let fmt = to_strftime(input_pattern);
    if with_time {
        if let Ok(dt) = NaiveDateTime::parse_from_str(text, &fmt) {
            return Ok(dt.and_utc().to_rfc3339_opts(SecondsFormat::Secs, true));
        }
        return NaiveDate::parse_from_str(text, &fmt)
            .ok()
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .map(|dt| dt.and_utc().to_rfc3339_opts(SecondsFormat::Secs, true))
            .ok_or_else(|| format!("'{}' 不符合日期格式 {}", text, input_pattern));
    }
    NaiveDate::parse_from_str(text, &fmt)
        .or_else(|_| NaiveDateTime::parse_from_str(text, &fmt).map(|dt| dt.date()))
        .map(|d| d.format("%Y-%m-%d").to_string())
        .map_err(|_| format!("'{}' 不符合日期格式 {}", text, input_pattern))
}
