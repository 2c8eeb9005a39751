//! DOM Semanticizer：原始页面快照 → 紧凑选项模型
//!
//! 只保留能承载取值的交互元素（勾选框/单选项/层级树节点），装饰节点全部丢弃；
//! 树形字段按扁平列表中的深度标注用父节点栈还原层级。
//! 提取失败（定位不到筛选表单锚点）向上报告，不做静默重试。

use crate::core::AgentError;
use crate::page::model::{
    FieldModel, NodeKind, OptionForest, PageModel, PageSnapshot, RawElement, Selectable,
    SelectionState,
};

/// 将页面快照提取为语义模型
pub fn extract(snapshot: &PageSnapshot) -> Result<PageModel, AgentError> {
    // 按首次出现顺序收集各筛选组的交互元素
    let mut groups: Vec<(String, Vec<&RawElement>)> = Vec::new();
    for element in &snapshot.elements {
        if element.selectable == Selectable::None {
            continue;
        }
        let Some(group) = element.group.as_deref() else {
            // 表单容器之外的游离交互元素，不属于任何字段
            tracing::debug!(tag = %element.tag, text = %element.text, "skip ungrouped element");
            continue;
        };
        if element.text.trim().is_empty() {
            continue;
        }
        match groups.iter_mut().find(|(name, _)| name == group) {
            Some((_, members)) => members.push(element),
            None => groups.push((group.to_string(), vec![element])),
        }
    }

    if groups.is_empty() {
        return Err(AgentError::ExtractionFailed(format!(
            "筛选表单容器未定位：{} 无可提取的筛选组",
            snapshot.url
        )));
    }

    let mut fields = Vec::with_capacity(groups.len());
    for (name, members) in groups {
        let kind = field_kind(&members);
        let mut forest = OptionForest::new();
        // (深度, 节点 id) 栈：弹出深度不小于当前元素的帧后，栈顶即父节点
        let mut stack: Vec<(usize, usize)> = Vec::new();
        for element in members {
            while stack.last().is_some_and(|(d, _)| *d >= element.depth) {
                stack.pop();
            }
            let parent = stack.last().map(|(_, id)| *id);
            let id = forest.push(element.text.trim(), node_kind(element.selectable), parent);
            if element.checked {
                forest.node_mut(id).state = SelectionState::Selected;
            }
            stack.push((element.depth, id));
        }
        fields.push(FieldModel { name, kind, forest });
    }

    let model = PageModel {
        url: snapshot.url.clone(),
        fields,
    };
    tracing::debug!(
        url = %model.url,
        fields = model.fields.len(),
        ratio = compression_ratio(snapshot, &model),
        "page model extracted"
    );
    Ok(model)
}

/// 字段整体类型：出现树节点则为层级树，全为单选项则为单选，否则多选
fn field_kind(members: &[&RawElement]) -> NodeKind {
    if members.iter().any(|e| e.selectable == Selectable::TreeNode) {
        NodeKind::TreeNode
    } else if members.iter().all(|e| e.selectable == Selectable::Radio) {
        NodeKind::SingleChoice
    } else {
        NodeKind::BooleanToggle
    }
}

fn node_kind(selectable: Selectable) -> NodeKind {
    match selectable {
        Selectable::Checkbox => NodeKind::BooleanToggle,
        Selectable::Radio => NodeKind::SingleChoice,
        Selectable::TreeNode | Selectable::None => NodeKind::TreeNode,
    }
}

/// 模型序列化尺寸与快照序列化尺寸之比（越小越省上下文预算）
pub fn compression_ratio(snapshot: &PageSnapshot, model: &PageModel) -> f32 {
    let raw = serde_json::to_string(snapshot).map(|s| s.len()).unwrap_or(1);
    let compact = model.to_prompt_text().len();
    compact as f32 / raw.max(1) as f32
}
