// ==========================================
// 数据迁移导入引擎 - 目标模式描述符
// ==========================================
// 职责: 描述导入目标实体（字段/类型/必填/枚举/引用）
// 说明: 目标领域模式由外部提供，引擎不内置任何业务实体知识
// ==========================================

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ==========================================
// FieldType - 目标字段类型
// ==========================================
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FieldType {
    Text,
    Integer,
    Decimal,
    Boolean,
    Date,     // ISO-8601 日期 (YYYY-MM-DD)
    DateTime, // ISO-8601 日期时间 (RFC 3339)
    Email,
    Enum,     // 取值限定于 enum_values
}

impl FieldType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FieldType::Text => "TEXT",
            FieldType::Integer => "INTEGER",
            FieldType::Decimal => "DECIMAL",
            FieldType::Boolean => "BOOLEAN",
            FieldType::Date => "DATE",
            FieldType::DateTime => "DATE_TIME",
            FieldType::Email => "EMAIL",
            FieldType::Enum => "ENUM",
        }
    }
}

// ==========================================
// TargetField - 目标字段描述
// ==========================================
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetField {
    pub name: String,
    pub field_type: FieldType,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub enum_values: Vec<String>,         // 枚举取值（FieldType::Enum）
    #[serde(default)]
    pub examples: Vec<String>,            // 声明的示例值（用于值模式匹配）
    #[serde(default)]
    pub aliases: Vec<String>,             // 常见的源列别名
    #[serde(default)]
    pub reference_entity: Option<String>, // 引用的实体类型（存在性校验）
    #[serde(default)]
    pub default_value: Option<Value>,     // 模式级默认值
    #[serde(default)]
    pub pattern: Option<String>,          // 格式正则
    #[serde(default)]
    pub max_length: Option<usize>,
    #[serde(default)]
    pub min: Option<f64>,
    #[serde(default)]
    pub max: Option<f64>,
}

impl TargetField {
    /// 构造最简字段描述（测试与 CLI 便捷入口）
    pub fn new(name: &str, field_type: FieldType) -> Self {
        Self {
            name: name.to_string(),
            field_type,
            required: false,
            enum_values: Vec::new(),
            examples: Vec::new(),
            aliases: Vec::new(),
            reference_entity: None,
            default_value: None,
            pattern: None,
            max_length: None,
            min: None,
            max: None,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn with_enum(mut self, values: &[&str]) -> Self {
        self.enum_values = values.iter().map(|v| v.to_string()).collect();
        self
    }

    pub fn with_aliases(mut self, aliases: &[&str]) -> Self {
        self.aliases = aliases.iter().map(|v| v.to_string()).collect();
        self
    }

    pub fn with_reference(mut self, entity_type: &str) -> Self {
        self.reference_entity = Some(entity_type.to_string());
        self
    }
}

// ==========================================
// BusinessRule - 记录级业务规则
// ==========================================
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BusinessRule {
    /// earlier 字段日期不得晚于 later 字段
    DateOrder { earlier: String, later: String },
    /// 当 when_field == equals 时 field 必填
    RequiredIf {
        field: String,
        when_field: String,
        equals: String,
    },
}

// ==========================================
// TargetSchema - 目标实体模式
// ==========================================
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetSchema {
    pub entity_type: String,
    pub fields: Vec<TargetField>,
    #[serde(default)]
    pub key_field: Option<String>,            // 源记录 ID 所在字段
    #[serde(default)]
    pub business_rules: Vec<BusinessRule>,
    #[serde(default)]
    pub depends_on: Vec<String>,              // 父实体类型（回滚时子先于父）
}

impl TargetSchema {
    pub fn field(&self, name: &str) -> Option<&TargetField> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn required_fields(&self) -> impl Iterator<Item = &TargetField> {
        self.fields.iter().filter(|f| f.required)
    }
}
