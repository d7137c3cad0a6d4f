// ==========================================
// 数据迁移导入引擎 - 值映射器
// ==========================================
// 职责: 为枚举型目标字段生成 {源值 → 目标值} 建议表
// ==========================================

use crate::domain::mapping::{ValueMap, ValueMapEntry};
use crate::domain::schema::TargetField;
use crate::importer::importer_trait::MappingScorer;
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

/// "其他" 兜底取值的常见写法
const FALLBACK_NAMES: [&str; 3] = ["OTHER", "UNKNOWN", "MISC"];

pub struct ValueMapper {
    scorer: Arc<dyn MappingScorer>,
    propose_threshold: f64,
}

impl ValueMapper {
    pub fn new(scorer: Arc<dyn MappingScorer>, propose_threshold: f64) -> Self {
        Self {
            scorer,
            propose_threshold,
        }
    }

    /// 生成值映射建议
    ///
    /// # 参数
    /// - field: 目标字段（取值域来自 enum_values，没有时用 examples）
    /// - source_values: 源列去重值
    /// - template_map: 模板中同字段的值映射（优先）
    ///
    /// # 返回
    /// 值映射表；低于建议阈值的源值不生成条目，由兜底默认值处理
    pub fn propose<I, S>(
        &self,
        field: &TargetField,
        source_values: I,
        template_map: Option<&ValueMap>,
    ) -> ValueMap
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let domain: &[String] = if field.enum_values.is_empty() {
            &field.examples
        } else {
            &field.enum_values
        };

        let mut entries: Vec<ValueMapEntry> = Vec::new();
        for source in source_values {
            let source = source.as_ref().trim();
            if source.is_empty() || entries.iter().any(|e| e.source_value == source) {
                continue;
            }

            if let Some(target) = template_map.and_then(|m| m.lookup(source)) {
                entries.push(ValueMapEntry {
                    source_value: source.to_string(),
                    target_value: target.clone(),
                    confidence: 1.0,
                });
                continue;
            }

            let best = domain
                .iter()
                .map(|candidate| (candidate, self.scorer.score_value(source, candidate)))
                .fold(None, |best: Option<(&String, f64)>, (c, s)| match best {
                    Some((_, bs)) if bs >= s => best,
                    _ => Some((c, s)),
                });

            match best {
                Some((target, score)) if score >= self.propose_threshold => {
                    entries.push(ValueMapEntry {
                        source_value: source.to_string(),
                        target_value: Value::String(target.clone()),
                        confidence: score,
                    });
                }
                _ => debug!(field = %field.name, value = source, "源值无匹配目标，交由兜底值处理"),
            }
        }

        let default_value = template_map
            .and_then(|m| m.default_value.clone())
            .or_else(|| {
                domain
                    .iter()
                    .find(|v| FALLBACK_NAMES.iter().any(|f| v.eq_ignore_ascii_case(f)))
                    .map(|v| Value::String(v.clone()))
            });

        ValueMap {
            target_field: field.name.clone(),
            entries,
            default_value,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::schema::FieldType;
    use crate::importer::field_mapper::HeuristicScorer;
    use serde_json::json;

    fn category() -> TargetField {
        TargetField::new("category", FieldType::Enum).with_enum(&[
            "HARASSMENT",
            "THEFT",
            "FRAUD",
            "OTHER",
        ])
    }

    #[test]
    fn test_propose_value_map_with_fallback() {
        let mapper = ValueMapper::new(Arc::new(HeuristicScorer::new()), 0.6);
        let map = mapper.propose(&category(), ["Harassment", "Theft", "Parking", "Theft"], None);

        assert_eq!(map.entries.len(), 2);
        assert_eq!(map.lookup("Harassment"), Some(&json!("HARASSMENT")));
        assert!(map.entries.iter().all(|e| e.confidence >= 0.85));
        assert_eq!(map.lookup("Parking"), None);
        assert_eq!(map.default_value, Some(json!("OTHER")));
    }

    #[test]
    fn test_template_entries_take_precedence() {
        let mapper = ValueMapper::new(Arc::new(HeuristicScorer::new()), 0.6);
        let template = ValueMap {
            target_field: "category".to_string(),
            entries: vec![ValueMapEntry {
                source_value: "Parking".to_string(),
                target_value: json!("FRAUD"),
                confidence: 1.0,
            }],
            default_value: None,
        };
        let map = mapper.propose(&category(), ["Parking"], Some(&template));
        assert_eq!(map.lookup("Parking"), Some(&json!("FRAUD")));
    }
}
