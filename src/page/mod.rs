//! 页面语义层：快照提取、选项森林与类目树解析

pub mod extract;
pub mod model;
pub mod resolve;

pub use extract::{compression_ratio, extract};
pub use model::{
    selection_schema_json, AppliedStep, ConditionEntry, FieldModel, NodeKind, OptionForest,
    OptionNode, PageModel, PageSnapshot, ProposedSelection, RawElement, SearchCondition,
    Selectable, SelectionState,
};
pub use resolve::{resolve, Resolution};
