// ==========================================
// 数据迁移导入引擎 - 转换规则定义
// ==========================================
// 职责: 固定目录的规则类型（不提供通用脚本语言）
// 约束: 规则是单条记录上的纯函数，可在试运行/重试中安全重复执行
// ==========================================

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

// ==========================================
// TransformationRule - 转换规则
// ==========================================
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransformationRule {
    /// 声明的输入格式 → ISO-8601
    DateFormat {
        input_pattern: String, // 如 "MM/DD/YYYY"，也接受 strftime（含 %）
        #[serde(default)]
        with_time: bool,       // 输出日期时间而非日期
    },
    /// 字符串操作链
    StringOps { ops: Vec<StringOp> },
    /// 正则替换（全部匹配）
    RegexReplace { pattern: String, replacement: String },
    /// 查找表
    Lookup {
        table: BTreeMap<String, Value>,
        #[serde(default)]
        default: Option<Value>,
        #[serde(default)]
        case_sensitive: bool,
    },
    /// 条件: 按声明顺序取第一个命中分支，未命中使用显式默认值
    Conditional {
        branches: Vec<ConditionalBranch>,
        default: RuleValue,
    },
    /// 拼接多个源列
    Concat {
        parts: Vec<RuleValue>,
        #[serde(default)]
        separator: String,
        #[serde(default = "default_true")]
        skip_empty: bool,
    },
    /// 按分隔符拆分后取第 index 段
    Split {
        separator: String,
        index: usize,
        #[serde(default = "default_true")]
        trim: bool,
    },
}

fn default_true() -> bool {
    true
}

impl TransformationRule {
    /// 规则类型名（用于转换轨迹）
    pub fn kind(&self) -> &'static str {
        match self {
            TransformationRule::DateFormat { .. } => "date_format",
            TransformationRule::StringOps { .. } => "string_ops",
            TransformationRule::RegexReplace { .. } => "regex_replace",
            TransformationRule::Lookup { .. } => "lookup",
            TransformationRule::Conditional { .. } => "conditional",
            TransformationRule::Concat { .. } => "concat",
            TransformationRule::Split { .. } => "split",
        }
    }
}

// ==========================================
// StringOp - 字符串操作
// ==========================================
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", content = "arg", rename_all = "snake_case")]
pub enum StringOp {
    Trim,
    Upper,
    Lower,
    Title,
    CollapseWhitespace,
    Prefix(String),
    Suffix(String),
    Truncate(usize),
    Replace { from: String, to: String },
}

// ==========================================
// RuleValue - 规则取值来源
// ==========================================
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum RuleValue {
    Literal(Value),
    Column(String), // 源记录中的列
    Current,        // 当前字段值（值映射之后）
    Now,            // 注入时钟的当前时间（RFC 3339）
    Null,
}

// ==========================================
// ConditionalBranch / Predicate
// ==========================================
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionalBranch {
    pub when: Predicate,
    pub then: RuleValue,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Predicate {
    #[serde(default)]
    pub column: Option<String>, // None 表示当前字段值
    pub op: PredicateOp,
    #[serde(default)]
    pub value: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PredicateOp {
    Equals,
    NotEquals,
    Contains,
    StartsWith,
    IsEmpty,
    NotEmpty,
    GreaterThan,
    LessThan,
    In,
    Matches,
}
