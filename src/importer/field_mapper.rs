// ==========================================
// 数据迁移导入引擎 - 字段映射器实现
// ==========================================
// 职责: 源列 → 目标字段 置信度映射 / 模板复用 / 完整性检查
// 阈值: ≥ 自动接受阈值 自动接受；≥ 建议阈值 待确认；否则不映射
// ==========================================

use crate::domain::mapping::{
    ColumnMapping, ColumnProfile, FieldMapping, MappingStatus, MappingTemplate, TemplateEntry,
};
use crate::domain::schema::{FieldType, TargetSchema};
use crate::domain::schema::TargetField;
use crate::importer::data_cleaner::DataCleaner;
use crate::importer::error::{ImportError, ImportResult};
use crate::importer::file_analyzer::normalize_column_name;
use crate::importer::importer_trait::MappingScorer;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info};

/// 同分判定精度
const SCORE_EPSILON: f64 = 1e-9;

// ==========================================
// HeuristicScorer - 基线启发式评分器
// ==========================================
// 三项信号按 noisy-OR 合成: 名称相似度 / 类型兼容 / 值模式重合
pub struct HeuristicScorer {
    name_weight: f64,
    type_weight: f64,
    pattern_weight: f64,
}

impl Default for HeuristicScorer {
    fn default() -> Self {
        Self {
            name_weight: 0.9,
            type_weight: 0.3,
            pattern_weight: 0.85,
        }
    }
}

impl HeuristicScorer {
    pub fn new() -> Self {
        Self::default()
    }

    /// 列名与字段名（含别名）的最大相似度
    fn name_similarity(&self, column: &str, field: &TargetField) -> f64 {
        std::iter::once(field.name.as_str())
            .chain(field.aliases.iter().map(|a| a.as_str()))
            .map(|candidate| string_similarity(column, candidate))
            .fold(0.0, f64::max)
    }

    /// 样本值与目标声明的枚举/示例值的重合度（0-1）
    fn pattern_overlap(&self, profile: &ColumnProfile, field: &TargetField) -> f64 {
        let declared: Vec<&String> = field.enum_values.iter().chain(field.examples.iter()).collect();
        if declared.is_empty() || profile.sample_values.is_empty() {
            return 0.0;
        }
        let hits = profile
            .sample_values
            .iter()
            .filter(|sample| {
                declared
                    .iter()
                    .any(|d| self.score_value(sample, d) >= 0.8)
            })
            .count();
        hits as f64 / profile.sample_values.len() as f64
    }
}

impl MappingScorer for HeuristicScorer {
    fn name(&self) -> &'static str {
        "heuristic"
    }

    fn score_field(&self, profile: &ColumnProfile, field: &TargetField) -> f64 {
        let name = self.name_similarity(&profile.name, field);
        let type_score = if DataCleaner::type_exact(profile.inferred_type, field.field_type) {
            1.0
        } else if DataCleaner::type_compatible(profile.inferred_type, field.field_type) {
            0.5
        } else {
            0.0
        };
        let pattern = self.pattern_overlap(profile, field);

        let mut score = 1.0
            - (1.0 - self.name_weight * name)
                * (1.0 - self.type_weight * type_score)
                * (1.0 - self.pattern_weight * pattern);

        // 类型不兼容: 名称完全一致时降为待确认，否则基本排除
        if !DataCleaner::type_compatible(profile.inferred_type, field.field_type) {
            score *= if name >= 1.0 - SCORE_EPSILON { 0.75 } else { 0.5 };
        }
        // 枚举目标但样本值零重合
        if field.field_type == FieldType::Enum
            && !field.enum_values.is_empty()
            && !profile.sample_values.is_empty()
            && pattern == 0.0
        {
            score *= 0.7;
        }
        score.clamp(0.0, 1.0)
    }

    fn score_value(&self, source_value: &str, target_value: &str) -> f64 {
        string_similarity(source_value, target_value)
    }
}

/// 字符串相似度: 规范化相等 → 1；否则取 词元 Jaccard / 编辑距离 / 包含 的最大值
pub fn string_similarity(a: &str, b: &str) -> f64 {
    let na = normalize_column_name(a);
    let nb = normalize_column_name(b);
    if na.is_empty() || nb.is_empty() {
        return 0.0;
    }
    if na == nb {
        return 1.0;
    }

    let ta = tokens(a);
    let tb = tokens(b);
    let token_score = {
        let inter = ta.intersection(&tb).count();
        let union = ta.union(&tb).count();
        if union == 0 {
            0.0
        } else {
            inter as f64 / union as f64
        }
    };

    let max_len = na.chars().count().max(nb.chars().count());
    let edit_score = 1.0 - levenshtein(&na, &nb) as f64 / max_len as f64;

    let contain_score = if na.len().min(nb.len()) >= 3 && (na.contains(&nb) || nb.contains(&na)) {
        0.8
    } else {
        0.0
    };

    token_score.max(edit_score).max(contain_score)
}

/// 词元拆分（非字母数字分隔 + 驼峰边界）
fn tokens(s: &str) -> HashSet<String> {
    let mut out = HashSet::new();
    let mut current = String::new();
    let mut prev_lower = false;
    for c in s.chars() {
        if !c.is_alphanumeric() {
            if !current.is_empty() {
                out.insert(std::mem::take(&mut current));
            }
            prev_lower = false;
            continue;
        }
        if c.is_uppercase() && prev_lower && !current.is_empty() {
            out.insert(std::mem::take(&mut current));
        }
        prev_lower = c.is_lowercase();
        current.extend(c.to_lowercase());
    }
    if !current.is_empty() {
        out.insert(current);
    }
    out
}

fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0; b.len() + 1];
    for (i, ca) in a.iter().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = usize::from(ca != cb);
            curr[j + 1] = (prev[j] + cost).min(prev[j + 1] + 1).min(curr[j] + 1);
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b.len()]
}

// ==========================================
// FieldMapper - 映射生成
// ==========================================
pub struct FieldMapper {
    scorer: Arc<dyn MappingScorer>,
    auto_accept_threshold: f64,
    propose_threshold: f64,
}

impl FieldMapper {
    pub fn new(
        scorer: Arc<dyn MappingScorer>,
        auto_accept_threshold: f64,
        propose_threshold: f64,
    ) -> Self {
        Self {
            scorer,
            auto_accept_threshold,
            propose_threshold,
        }
    }

    pub fn scorer(&self) -> &Arc<dyn MappingScorer> {
        &self.scorer
    }

    /// 生成映射建议
    ///
    /// 每列只竞争其最高分目标: 该目标已被占用且不是并列时，此列保持未映射，不退而求其次。
    ///
    /// # 参数
    /// - profiles: 源列画像
    /// - schema: 目标模式
    /// - template: 可选映射模板（列名精确命中时跳过评分）
    /// - existing: 现有映射（已确认的列保持不变）
    ///
    /// # 返回
    /// 按源列顺序排列的 FieldMapping
    pub fn propose(
        &self,
        profiles: &[ColumnProfile],
        schema: &TargetSchema,
        template: Option<&MappingTemplate>,
        existing: Option<&FieldMapping>,
    ) -> FieldMapping {
        let mut claimed: HashSet<String> = HashSet::new();
        let mut slots: Vec<Option<ColumnMapping>> = vec![None; profiles.len()];

        // 1. 用户已确认的映射原样保留
        if let Some(existing) = existing {
            for (idx, profile) in profiles.iter().enumerate() {
                if let Some(col) = existing
                    .for_column(&profile.name)
                    .filter(|c| c.status == MappingStatus::Confirmed)
                {
                    if let Some(target) = &col.target_field {
                        claimed.insert(target.clone());
                    }
                    slots[idx] = Some(col.clone());
                }
            }
        }

        // 2. 模板精确命中
        if let Some(template) = template {
            for (idx, profile) in profiles.iter().enumerate() {
                if slots[idx].is_some() {
                    continue;
                }
                let Some(entry) = template
                    .entries
                    .iter()
                    .find(|e| e.source_column == profile.name)
                else {
                    continue;
                };
                if schema.field(&entry.target_field).is_none() || claimed.contains(&entry.target_field)
                {
                    continue;
                }
                claimed.insert(entry.target_field.clone());
                slots[idx] = Some(ColumnMapping {
                    source_column: profile.name.clone(),
                    target_field: Some(entry.target_field.clone()),
                    confidence: 1.0,
                    status: MappingStatus::FromTemplate,
                    rule_id: entry.rule_id.clone(),
                    unmapped_action: preserved_action(existing, &profile.name),
                });
            }
        }

        // 3. 其余列评分（按列顺序，先到先得）
        for (idx, profile) in profiles.iter().enumerate() {
            if slots[idx].is_some() {
                continue;
            }
            let mut scored: Vec<(&TargetField, f64)> = schema
                .fields
                .iter()
                .map(|f| (f, self.scorer.score_field(profile, f)))
                .filter(|(_, s)| *s >= self.propose_threshold)
                .collect();
            scored.sort_by(|a, b| b.1.total_cmp(&a.1));

            let mapping = match scored.first() {
                None => ColumnMapping::unmapped(&profile.name),
                Some((_, best)) => {
                    let best = *best;
                    // 最高分并列时优先未被占用的目标；全部已占用则不映射
                    let pick = scored
                        .iter()
                        .take_while(|(_, s)| (best - s).abs() < SCORE_EPSILON)
                        .find(|(f, _)| !claimed.contains(&f.name));
                    match pick {
                        Some((field, score)) => {
                            claimed.insert(field.name.clone());
                            ColumnMapping {
                                source_column: profile.name.clone(),
                                target_field: Some(field.name.clone()),
                                confidence: *score,
                                status: if *score >= self.auto_accept_threshold {
                                    MappingStatus::AutoAccepted
                                } else {
                                    MappingStatus::NeedsConfirmation
                                },
                                rule_id: None,
                                unmapped_action: preserved_action(existing, &profile.name),
                            }
                        }
                        None => {
                            debug!(column = %profile.name, "最佳目标已被占用，保持未映射");
                            ColumnMapping::unmapped(&profile.name)
                        }
                    }
                }
            };
            let mut mapping = mapping;
            if mapping.status == MappingStatus::Unmapped {
                mapping.unmapped_action = preserved_action(existing, &profile.name);
            }
            slots[idx] = Some(mapping);
        }

        let columns: Vec<ColumnMapping> = slots.into_iter().flatten().collect();

        // 默认值: 保留已配置，补充模式级默认
        let mut defaults = existing.map(|m| m.defaults.clone()).unwrap_or_default();
        for field in &schema.fields {
            if let Some(default) = &field.default_value {
                defaults
                    .entry(field.name.clone())
                    .or_insert_with(|| default.clone());
            }
        }

        let mapping = FieldMapping {
            columns,
            defaults,
            template: template.map(|t| t.reference()),
        };

        info!(
            scorer = self.scorer.name(),
            columns = mapping.columns.len(),
            auto_accepted = count_status(&mapping, MappingStatus::AutoAccepted),
            needs_confirmation = count_status(&mapping, MappingStatus::NeedsConfirmation),
            from_template = count_status(&mapping, MappingStatus::FromTemplate),
            unmapped = count_status(&mapping, MappingStatus::Unmapped),
            "映射建议生成完成"
        );
        mapping
    }

    /// 校验用户提交的映射（目标存在且不重复）
    pub fn check_consistency(mapping: &FieldMapping, schema: &TargetSchema) -> ImportResult<()> {
        let mut seen = HashSet::new();
        for col in &mapping.columns {
            let Some(target) = col.effective_target() else {
                continue;
            };
            if schema.field(target).is_none() {
                return Err(ImportError::InvalidArgument(format!(
                    "列 {} 映射到未知字段 {}",
                    col.source_column, target
                )));
            }
            if !seen.insert(target.to_string()) {
                return Err(ImportError::InvalidArgument(format!(
                    "目标字段 {} 被多个源列映射",
                    target
                )));
            }
        }
        for field in mapping.defaults.keys() {
            if schema.field(field).is_none() {
                return Err(ImportError::InvalidArgument(format!("默认值指向未知字段 {}", field)));
            }
        }
        Ok(())
    }

    /// 进入校验前的完整性检查
    ///
    /// # 返回
    /// - Err(MappingIncomplete): 必填字段既无映射也无默认值
    pub fn check_complete(mapping: &FieldMapping, schema: &TargetSchema) -> ImportResult<()> {
        let missing: Vec<String> = schema
            .required_fields()
            .filter(|f| !mapping.covers(&f.name))
            .map(|f| f.name.clone())
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(ImportError::MappingIncomplete { fields: missing })
        }
    }

    /// 由映射生成模板条目
    pub fn template_entries(mapping: &FieldMapping) -> Vec<TemplateEntry> {
        mapping
            .columns
            .iter()
            .filter_map(|c| {
                c.effective_target().map(|target| TemplateEntry {
                    source_column: c.source_column.clone(),
                    target_field: target.to_string(),
                    rule_id: c.rule_id.clone(),
                })
            })
            .collect()
    }
}

fn preserved_action(
    existing: Option<&FieldMapping>,
    column: &str,
) -> crate::domain::types::UnmappedFieldAction {
    existing
        .and_then(|m| m.for_column(column))
        .map(|c| c.unmapped_action)
        .unwrap_or_default()
}

fn count_status(mapping: &FieldMapping, status: MappingStatus) -> usize {
    mapping.columns.iter().filter(|c| c.status == status).count()
}
