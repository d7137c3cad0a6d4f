// ==========================================
// 数据迁移导入引擎 - 数据清洗器实现
// ==========================================
// 职责: NULL 标准化 / 值类型识别 / 按目标类型强制转换
// 使用方: 文件分析（类型推断）、转换引擎（落值）、校验引擎（格式）
// ==========================================

use crate::domain::mapping::ColumnType;
use crate::domain::schema::{FieldType, TargetField};
use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, Utc};
use regex::Regex;
use serde_json::{Number, Value};
use std::sync::OnceLock;

/// 视为空值的标记（忽略大小写）
const NULL_TOKENS: [&str; 5] = ["", "null", "n/a", "-", "na"];

/// 可识别的日期格式
const DATE_FORMATS: [&str; 5] = ["%Y-%m-%d", "%Y/%m/%d", "%m/%d/%Y", "%d.%m.%Y", "%Y%m%d"];

/// 可识别的日期时间格式（不含时区）
const DATETIME_FORMATS: [&str; 4] = [
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%Y/%m/%d %H:%M:%S",
    "%m/%d/%Y %H:%M",
];

fn email_regex() -> Option<&'static Regex> {
    static EMAIL: OnceLock<Option<Regex>> = OnceLock::new();
    EMAIL
        .get_or_init(|| Regex::new(r"^[A-Za-z0-9._%+\-]+@[A-Za-z0-9.\-]+\.[A-Za-z]{2,}$").ok())
        .as_ref()
}

pub struct DataCleaner;

impl DataCleaner {
    /// 空值标记判定（"", NULL, N/A, -）
    pub fn is_null_token(value: &str) -> bool {
        let trimmed = value.trim();
        NULL_TOKENS.iter().any(|t| trimmed.eq_ignore_ascii_case(t))
    }

    /// 空值标准化: 空值标记 → None，其余 trim
    pub fn normalize_null(value: &str) -> Option<&str> {
        if Self::is_null_token(value) {
            None
        } else {
            Some(value.trim())
        }
    }

    pub fn parse_integer(value: &str) -> Option<i64> {
        let cleaned = value.trim().replace(',', "");
        if cleaned.is_empty() {
            return None;
        }
        cleaned.parse::<i64>().ok()
    }

    pub fn parse_decimal(value: &str) -> Option<f64> {
        let cleaned = value.trim().replace(',', "");
        if cleaned.is_empty() {
            return None;
        }
        cleaned.parse::<f64>().ok().filter(|v| v.is_finite())
    }

    /// 布尔值解析（true/false/yes/no/y/n/是/否）
    pub fn parse_bool(value: &str) -> Option<bool> {
        match value.trim().to_lowercase().as_str() {
            "true" | "yes" | "y" | "t" | "是" => Some(true),
            "false" | "no" | "n" | "f" | "否" => Some(false),
            _ => None,
        }
    }

    /// 日期解析（多格式兼容）
    pub fn parse_date(value: &str) -> Option<NaiveDate> {
        let trimmed = value.trim();
        DATE_FORMATS
            .iter()
            .find_map(|fmt| NaiveDate::parse_from_str(trimmed, fmt).ok())
    }

    /// 日期时间解析（RFC 3339 优先，其余按 UTC 处理）
    pub fn parse_datetime(value: &str) -> Option<DateTime<Utc>> {
        let trimmed = value.trim();
        if let Ok(dt) = DateTime::parse_from_rfc3339(trimmed) {
            return Some(dt.with_timezone(&Utc));
        }
        DATETIME_FORMATS
            .iter()
            .find_map(|fmt| NaiveDateTime::parse_from_str(trimmed, fmt).ok())
            .map(|naive| naive.and_utc())
    }

    pub fn is_email(value: &str) -> bool {
        email_regex()
            .map(|re| re.is_match(value.trim()))
            .unwrap_or(false)
    }

    /// 识别单个非空值的类型（最具体者优先）
    pub fn classify(value: &str) -> ColumnType {
        if Self::is_null_token(value) {
            ColumnType::Empty
        } else if Self::parse_integer(value).is_some() {
            ColumnType::Integer
        } else if Self::parse_decimal(value).is_some() {
            ColumnType::Decimal
        } else if Self::parse_bool(value).is_some() {
            ColumnType::Boolean
        } else if Self::parse_date(value).is_some() {
            ColumnType::Date
        } else if Self::parse_datetime(value).is_some() {
            ColumnType::DateTime
        } else if Self::is_email(value) {
            ColumnType::Email
        } else {
            ColumnType::Text
        }
    }

    /// 按目标字段类型强制转换（转换引擎的最后一步）
    ///
    /// # 返回
    /// - Ok(Value): 规范化后的值（日期为 ISO-8601）
    /// - Err(String): 无法转换的原因
    pub fn coerce(value: &Value, field: &TargetField) -> Result<Value, String> {
        let text = match value {
            Value::Null => return Ok(Value::Null),
            Value::String(s) => match Self::normalize_null(s) {
                Some(s) => s.to_string(),
                None => return Ok(Value::Null),
            },
            Value::Bool(b) if field.field_type == FieldType::Boolean => return Ok(Value::Bool(*b)),
            Value::Number(n) if field.field_type == FieldType::Decimal => {
                return Ok(Value::Number(n.clone()))
            }
            Value::Number(n) if field.field_type == FieldType::Integer && n.is_i64() => {
                return Ok(Value::Number(n.clone()))
            }
            other => other.to_string().trim_matches('"').to_string(),
        };

        match field.field_type {
            FieldType::Text => Ok(Value::String(text)),
            FieldType::Integer => Self::parse_integer(&text)
                .map(|v| Value::Number(v.into()))
                .or_else(|| {
                    // "12.0" 之类的整数值
                    Self::parse_decimal(&text)
                        .filter(|f| f.fract() == 0.0 && f.abs() < i64::MAX as f64)
                        .map(|f| Value::Number((f as i64).into()))
                })
                .ok_or_else(|| format!("'{}' 不是整数", text)),
            FieldType::Decimal => Self::parse_decimal(&text)
                .and_then(Number::from_f64)
                .map(Value::Number)
                .ok_or_else(|| format!("'{}' 不是数值", text)),
            FieldType::Boolean => Self::parse_bool(&text)
                .or_else(|| match text.as_str() {
                    "1" => Some(true),
                    "0" => Some(false),
                    _ => None,
                })
                .map(Value::Bool)
                .ok_or_else(|| format!("'{}' 不是布尔值", text)),
            FieldType::Date => Self::parse_date(&text)
                .or_else(|| Self::parse_datetime(&text).map(|dt| dt.date_naive()))
                .map(|d| Value::String(d.format("%Y-%m-%d").to_string()))
                .ok_or_else(|| format!("'{}' 不是可识别的日期", text)),
            FieldType::DateTime => Self::parse_datetime(&text)
                .or_else(|| {
                    Self::parse_date(&text)
                        .and_then(|d| d.and_hms_opt(0, 0, 0))
                        .map(|naive| naive.and_utc())
                })
                .map(|dt| Value::String(dt.to_rfc3339_opts(SecondsFormat::Secs, true)))
                .ok_or_else(|| format!("'{}' 不是可识别的日期时间", text)),
            // 邮箱格式与枚举取值由校验引擎判定，这里只做规范化
            FieldType::Email => Ok(Value::String(text.to_lowercase())),
            FieldType::Enum => Ok(Value::String(
                field
                    .enum_values
                    .iter()
                    .find(|v| v.eq_ignore_ascii_case(&text))
                    .cloned()
                    .unwrap_or(text),
            )),
        }
    }

    /// 类型兼容度（源列推断类型 vs 目标字段类型）
    pub fn type_compatible(column: ColumnType, field: FieldType) -> bool {
        match (column, field) {
            (ColumnType::Empty, _) => true,
            (_, FieldType::Text) => true,
            (ColumnType::Text, FieldType::Enum) => true,
            (ColumnType::Boolean, FieldType::Enum) => true,
            (ColumnType::Integer, FieldType::Integer | FieldType::Decimal | FieldType::Boolean) => {
                true
            }
            (ColumnType::Decimal, FieldType::Decimal) => true,
            (ColumnType::Boolean, FieldType::Boolean) => true,
            (ColumnType::Date, FieldType::Date | FieldType::DateTime) => true,
            (ColumnType::DateTime, FieldType::Date | FieldType::DateTime) => true,
            (ColumnType::Email, FieldType::Email) => true,
            _ => false,
        }
    }

    /// 源列推断类型与目标类型完全一致
    pub fn type_exact(column: ColumnType, field: FieldType) -> bool {
        matches!(
            (column, field),
            (ColumnType::Integer, FieldType::Integer)
                | (ColumnType::Decimal, FieldType::Decimal)
                | (ColumnType::Boolean, FieldType::Boolean)
                | (ColumnType::Date, FieldType::Date)
                | (ColumnType::DateTime, FieldType::DateTime)
                | (ColumnType::Email, FieldType::Email)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_null_tokens() {
        assert!(DataCleaner::is_null_token("  "));
        assert!(DataCleaner::is_null_token("NULL"));
        assert!(DataCleaner::is_null_token("n/a"));
        assert!(DataCleaner::is_null_token("-"));
        assert!(!DataCleaner::is_null_token("0"));
        assert_eq!(DataCleaner::normalize_null("  value  "), Some("value"));
    }

    #[test]
    fn test_classify_values() {
        assert_eq!(DataCleaner::classify("42"), ColumnType::Integer);
        assert_eq!(DataCleaner::classify("1,200"), ColumnType::Integer);
        assert_eq!(DataCleaner::classify("3.14"), ColumnType::Decimal);
        assert_eq!(DataCleaner::classify("yes"), ColumnType::Boolean);
        assert_eq!(DataCleaner::classify("01/15/2024"), ColumnType::Date);
        assert_eq!(DataCleaner::classify("2024-01-15 10:30:00"), ColumnType::DateTime);
        assert_eq!(DataCleaner::classify("a.b@example.com"), ColumnType::Email);
        assert_eq!(DataCleaner::classify("Harassment"), ColumnType::Text);
    }

    #[test]
    fn test_coerce_by_field_type() {
        let int_field = TargetField::new("n", FieldType::Integer);
        assert_eq!(DataCleaner::coerce(&json!("12"), &int_field), Ok(json!(12)));
        assert_eq!(DataCleaner::coerce(&json!("12.0"), &int_field), Ok(json!(12)));
        assert!(DataCleaner::coerce(&json!("abc"), &int_field).is_err());

        let date_field = TargetField::new("d", FieldType::Date);
        assert_eq!(
            DataCleaner::coerce(&json!("2024/01/15"), &date_field),
            Ok(json!("2024-01-15"))
        );

        let bool_field = TargetField::new("b", FieldType::Boolean);
        assert_eq!(DataCleaner::coerce(&json!("1"), &bool_field), Ok(json!(true)));

        let enum_field = TargetField::new("e", FieldType::Enum).with_enum(&["THEFT"]);
        assert_eq!(DataCleaner::coerce(&json!("theft"), &enum_field), Ok(json!("THEFT")));

        assert_eq!(DataCleaner::coerce(&json!("N/A"), &int_field), Ok(Value::Null));
    }

    #[test]
    fn test_type_compatibility() {
        assert!(DataCleaner::type_compatible(ColumnType::Integer, FieldType::Decimal));
        assert!(DataCleaner::type_compatible(ColumnType::Text, FieldType::Enum));
        assert!(!DataCleaner::type_compatible(ColumnType::Text, FieldType::Date));
        assert!(DataCleaner::type_exact(ColumnType::Date, FieldType::Date));
    }
}
