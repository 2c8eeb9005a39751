//! 页面语义模型
//!
//! PageSnapshot 是驱动侧抓取的扁平元素列表（原始 DOM 表示）；
//! PageModel 是提取后的「字段 → 选项森林」紧凑模型，作为计入 LLM 上下文预算的唯一页面表示。
//! 选项树用竞技场（arena）存储，父节点以下标回指，避免所有权环并支持向上遍历做互斥检查。

use std::collections::BTreeMap;

use schemars::JsonSchema;
use serde::{Deserialize, Deserializer, Serialize};

/// 元素的可选中类型（驱动侧标注）
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Selectable {
    /// 纯装饰/容器元素，提取时丢弃
    None,
    Checkbox,
    Radio,
    TreeNode,
}

/// 驱动抓取的单个页面元素
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RawElement {
    pub tag: String,
    pub text: String,
    /// 所属筛选组标题（如「地区」「行业」）；装饰元素通常为 None
    pub group: Option<String>,
    /// 组内嵌套深度（树形字段用），根为 0
    #[serde(default)]
    pub depth: usize,
    pub selectable: Selectable,
    #[serde(default)]
    pub checked: bool,
    #[serde(default)]
    pub expandable: bool,
}

/// 自动化驱动提供的页面快照，仅作为 Semanticizer 的输入，从不落盘
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PageSnapshot {
    pub url: String,
    pub elements: Vec<RawElement>,
}

/// 选项节点类型
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    BooleanToggle,
    SingleChoice,
    TreeNode,
}

/// 选中状态：Excluded 表示被更深的后代取代（深者优先互斥）
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionState {
    Unselected,
    Selected,
    Excluded,
}

/// 竞技场中的一个选项节点；id 即其在 nodes 中的下标，单次提取内唯一
#[derive(Clone, Debug, Serialize)]
pub struct OptionNode {
    pub id: usize,
    pub label: String,
    pub kind: NodeKind,
    /// 父节点下标（非拥有回指）
    pub parent: Option<usize>,
    /// 有序子节点下标
    pub children: Vec<usize>,
    pub state: SelectionState,
}

/// 一个字段的选项森林：竞技场 + 有序根列表
#[derive(Clone, Debug, Default, Serialize)]
pub struct OptionForest {
    nodes: Vec<OptionNode>,
    roots: Vec<usize>,
}

impl OptionForest {
    pub fn new() -> Self {
        Self::default()
    }

    /// 追加一个节点并挂到 parent 下（None 则为根），返回其 id
    pub fn push(&mut self, label: impl Into<String>, kind: NodeKind, parent: Option<usize>) -> usize {
        let id = self.nodes.len();
        self.nodes.push(OptionNode {
            id,
            label: label.into(),
            kind,
            parent,
            children: Vec::new(),
            state: SelectionState::Unselected,
        });
        match parent {
            Some(p) => self.nodes[p].children.push(id),
            None => self.roots.push(id),
        }
        id
    }

    pub fn node(&self, id: usize) -> &OptionNode {
        &self.nodes[id]
    }

    pub fn node_mut(&mut self, id: usize) -> &mut OptionNode {
        &mut self.nodes[id]
    }

    pub fn roots(&self) -> &[usize] {
        &self.roots
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// 自 id 的父节点起向根遍历
    pub fn ancestors(&self, id: usize) -> Ancestors<'_> {
        Ancestors {
            forest: self,
            next: self.nodes[id].parent,
        }
    }

    /// 节点深度（根为 0）
    pub fn depth(&self, id: usize) -> usize {
        self.ancestors(id).count()
    }

    /// 先序遍历全部节点 id
    pub fn iter_dfs(&self) -> Vec<usize> {
        let mut order = Vec::with_capacity(self.nodes.len());
        let mut stack: Vec<usize> = self.roots.iter().rev().copied().collect();
        while let Some(id) = stack.pop() {
            order.push(id);
            for child in self.nodes[id].children.iter().rev() {
                stack.push(*child);
            }
        }
        order
    }
}

/// 向上遍历迭代器
pub struct Ancestors<'a> {
    forest: &'a OptionForest,
    next: Option<usize>,
}

impl<'a> Iterator for Ancestors<'a> {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        let id = self.next?;
        self.next = self.forest.nodes[id].parent;
        Some(id)
    }
}

/// 一个命名字段及其选项森林
#[derive(Clone, Debug, Serialize)]
pub struct FieldModel {
    pub name: String,
    pub kind: NodeKind,
    pub forest: OptionForest,
}

/// 提取结果：字段有序列表，每次提取新建，单趟解析内不被并发修改
#[derive(Clone, Debug, Default, Serialize)]
pub struct PageModel {
    pub url: String,
    pub fields: Vec<FieldModel>,
}

impl PageModel {
    pub fn field(&self, name: &str) -> Option<&FieldModel> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn field_mut(&mut self, name: &str) -> Option<&mut FieldModel> {
        self.fields.iter_mut().find(|f| f.name == name)
    }

    /// 渲染为提示词中的紧凑文本：每字段一段，树形选项按深度缩进
    pub fn to_prompt_text(&self) -> String {
        let mut out = String::new();
        for field in &self.fields {
            let kind = match field.kind {
                NodeKind::BooleanToggle => "多选",
                NodeKind::SingleChoice => "单选",
                NodeKind::TreeNode => "层级树",
            };
            out.push_str(&format!("字段「{}」({}):\n", field.name, kind));
            for id in field.forest.iter_dfs() {
                let node = field.forest.node(id);
                let indent = "  ".repeat(field.forest.depth(id));
                out.push_str(&format!("{}- {}\n", indent, node.label));
            }
        }
        out
    }
}

/// LLM 给出的原始「字段 → 标签」选择，修复/解析之前的形态。
/// 反序列化同时接受单个字符串与字符串数组两种取值写法。
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct ProposedSelection(pub BTreeMap<String, Vec<String>>);

#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

impl<'de> Deserialize<'de> for ProposedSelection {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = BTreeMap::<String, OneOrMany>::deserialize(deserializer)?;
        let mut fields = BTreeMap::new();
        for (key, value) in raw {
            let values = match value {
                OneOrMany::One(s) => vec![s],
                OneOrMany::Many(v) => v,
            };
            fields.insert(key, values);
        }
        Ok(ProposedSelection(fields))
    }
}

impl ProposedSelection {
    pub fn labels(&self, field: &str) -> &[String] {
        self.0.get(field).map(|v| v.as_slice()).unwrap_or(&[])
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// 提示词中向 LLM 展示的选择对象结构（仅用于生成 JSON Schema）
#[derive(JsonSchema)]
#[allow(dead_code)]
struct SelectionShape {
    /// 字段名到选项标签列表的映射，标签须逐字取自页面模型
    fields: BTreeMap<String, Vec<String>>,
}

/// 选择对象的 JSON Schema 文本，拼入字段选择提示词
pub fn selection_schema_json() -> String {
    serde_json::to_string_pretty(&schemars::schema_for!(SelectionShape)).unwrap_or_default()
}

/// 解析完成后的最终检索条件：唯一交给自动化驱动执行的结构
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchCondition {
    /// 搜索关键词（自由文本输入框）
    pub keyword: Option<String>,
    pub entries: Vec<ConditionEntry>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConditionEntry {
    pub field: String,
    pub values: Vec<String>,
}

impl SearchCondition {
    pub fn is_empty(&self) -> bool {
        self.keyword.is_none() && self.entries.is_empty()
    }
}

/// 驱动执行 apply 时回报的单步动作，逐条转为 log_line 事件
#[derive(Clone, Debug, Serialize)]
pub struct AppliedStep {
    pub field: String,
    pub detail: String,
}
