//! 类目树解析：候选匹配 + 深者优先互斥
//!
//! 先对整棵森林做先序遍历标记候选（大小写不敏感、去空白的精确匹配；
//! 仅当某标签全树无精确命中时才退化为子串匹配）。
//! 再做互斥：同一条祖先链上若祖先与后代同为候选，取消祖先、保留后代——
//! 不同分支之间永不互斥。结果集中不存在任何祖先-后代对。

use std::collections::HashSet;

use crate::page::model::{OptionForest, SelectionState};

/// 一次解析的完整结果
#[derive(Debug, Default)]
pub struct Resolution {
    /// 最终选中的节点 id
    pub selected: Vec<usize>,
    /// 因更深后代被取代的节点 id
    pub excluded: Vec<usize>,
    /// 在森林中找不到任何对应节点的标签（进最终报告说明原因）
    pub unmatched: Vec<String>,
}

/// 对一个字段的森林执行标签解析，就地更新节点选中状态
pub fn resolve(forest: &mut OptionForest, proposed: &[String]) -> Resolution {
    let targets: Vec<(String, String)> = proposed
        .iter()
        .map(|label| (label.clone(), normalize(label)))
        .filter(|(_, n)| !n.is_empty())
        .collect();
    if targets.is_empty() {
        return Resolution::default();
    }

    // 第一遍：精确匹配
    let mut candidates: HashSet<usize> = HashSet::new();
    let mut matched_labels: HashSet<usize> = HashSet::new();
    let order = forest.iter_dfs();
    for &id in &order {
        let node_norm = normalize(&forest.node(id).label);
        for (i, (_, target)) in targets.iter().enumerate() {
            if node_norm == *target {
                candidates.insert(id);
                matched_labels.insert(i);
            }
        }
    }

    // 第二遍：仅对全树无精确命中的标签做子串回退
    for (i, (raw, target)) in targets.iter().enumerate() {
        if matched_labels.contains(&i) {
            continue;
        }
        for &id in &order {
            let node_norm = normalize(&forest.node(id).label);
            if node_norm.contains(target.as_str()) || target.contains(node_norm.as_str()) {
                candidates.insert(id);
                matched_labels.insert(i);
                tracing::debug!(label = %raw, node = %forest.node(id).label, "fuzzy fallback match");
            }
        }
    }

    let unmatched: Vec<String> = targets
        .iter()
        .enumerate()
        .filter(|(i, _)| !matched_labels.contains(i))
        .map(|(_, (raw, _))| raw.clone())
        .collect();

    // 互斥：候选的祖先若也是候选，取消祖先，保留更深的后代
    let mut excluded: HashSet<usize> = HashSet::new();
    for &id in &candidates {
        for ancestor in forest.ancestors(id) {
            if candidates.contains(&ancestor) {
                excluded.insert(ancestor);
            }
        }
    }

    let mut selected: Vec<usize> = candidates.difference(&excluded).copied().collect();
    selected.sort_unstable();
    let mut excluded: Vec<usize> = excluded.into_iter().collect();
    excluded.sort_unstable();

    for &id in &selected {
        forest.node_mut(id).state = SelectionState::Selected;
    }
    for &id in &excluded {
        forest.node_mut(id).state = SelectionState::Excluded;
        tracing::debug!(node = %forest.node(id).label, "ancestor superseded by deeper selection");
    }

    Resolution {
        selected,
        excluded,
        unmatched,
    }
}

/// 匹配用归一化：去除全部空白并转小写
fn normalize(label: &str) -> String {
    label
        .chars()
        .filter(|c| !c.is_whitespace())
        .flat_map(|c| c.to_lowercase())
        .collect()
}
