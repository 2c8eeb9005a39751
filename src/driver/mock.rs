//! 脚本化门户驱动（测试与无浏览器环境用）
//!
//! 返回预置快照、记录 apply 收到的条件，可编程注入「前 N 次 apply 失败」
//! 与「驱动不可达」两类故障，用于重试与 Failed 路径的验证。

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::core::AgentError;
use crate::driver::{PortalDriver, PortalHandle};
use crate::page::{AppliedStep, PageSnapshot, RawElement, SearchCondition, Selectable};

/// 脚本化驱动
#[derive(Default)]
pub struct MockPortalDriver {
    snapshot: Option<PageSnapshot>,
    unreachable: bool,
    /// 前 N 次 apply 返回 ToolExecutionFailed
    fail_applies: Arc<AtomicU32>,
    /// 历史上收到的全部条件
    pub applied: Arc<Mutex<Vec<SearchCondition>>>,
    /// close 被调用的次数
    pub closed: Arc<AtomicUsize>,
}

impl MockPortalDriver {
    pub fn new(snapshot: PageSnapshot) -> Self {
        Self {
            snapshot: Some(snapshot),
            ..Self::default()
        }
    }

    /// 标准高级搜索页面夹具：地区单选、企业状态勾选、行业三层类目树
    pub fn with_default_form() -> Self {
        Self::new(default_snapshot())
    }

    /// 驱动不可达（open 即失败）
    pub fn unreachable() -> Self {
        Self {
            unreachable: true,
            ..Self::default()
        }
    }

    pub fn fail_next_applies(&self, n: u32) {
        self.fail_applies.store(n, Ordering::SeqCst);
    }

    pub fn applied_conditions(&self) -> Vec<SearchCondition> {
        self.applied.lock().map(|v| v.clone()).unwrap_or_default()
    }

    pub fn close_count(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PortalDriver for MockPortalDriver {
    async fn open(&self) -> Result<Box<dyn PortalHandle>, AgentError> {
        if self.unreachable {
            return Err(AgentError::DriverUnreachable(
                "scripted: browser not available".to_string(),
            ));
        }
        Ok(Box::new(MockHandle {
            snapshot: self
                .snapshot
                .clone()
                .unwrap_or_else(|| PageSnapshot {
                    url: "about:blank".into(),
                    elements: Vec::new(),
                }),
            fail_applies: Arc::clone(&self.fail_applies),
            applied: Arc::clone(&self.applied),
            closed: Arc::clone(&self.closed),
        }))
    }
}

struct MockHandle {
    snapshot: PageSnapshot,
    fail_applies: Arc<AtomicU32>,
    applied: Arc<Mutex<Vec<SearchCondition>>>,
    closed: Arc<AtomicUsize>,
}

#[async_trait]
impl PortalHandle for MockHandle {
    async fn snapshot(&mut self) -> Result<PageSnapshot, AgentError> {
        Ok(self.snapshot.clone())
    }

    async fn apply(&mut self, condition: &SearchCondition) -> Result<Vec<AppliedStep>, AgentError> {
        let remaining = self.fail_applies.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_applies.store(remaining - 1, Ordering::SeqCst);
            return Err(AgentError::ToolExecutionFailed(
                "scripted: click intercepted".to_string(),
            ));
        }
        if let Ok(mut log) = self.applied.lock() {
            log.push(condition.clone());
        }
        let mut steps = Vec::new();
        if let Some(keyword) = &condition.keyword {
            steps.push(AppliedStep {
                field: "关键词".into(),
                detail: format!("输入「{}」", keyword),
            });
        }
        for entry in &condition.entries {
            for value in &entry.values {
                steps.push(AppliedStep {
                    field: entry.field.clone(),
                    detail: format!("勾选「{}」", value),
                });
            }
        }
        Ok(steps)
    }

    async fn screenshot(&mut self) -> Result<String, AgentError> {
        // 1x1 PNG 的 base64，足够覆盖 [SCREENSHOT] 帧的链路
        Ok("iVBORw0KGgoAAAANSUhEUgAAAAEAAAABCAYAAAAfFcSJAAAADUlEQVR42mP8z8BQDwAEhQGAhKmMIQAAAABJRU5ErkJggg==".to_string())
    }

    async fn close(&mut self) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}

/// 测试与演示共用的页面夹具
pub fn default_snapshot() -> PageSnapshot {
    fn el(group: &str, text: &str, depth: usize, selectable: Selectable) -> RawElement {
        RawElement {
            tag: "li".into(),
            text: text.into(),
            group: Some(group.into()),
            depth,
            selectable,
            checked: false,
            expandable: false,
        }
    }
    fn noise(text: &str) -> RawElement {
        RawElement {
            tag: "div".into(),
            text: text.into(),
            group: None,
            depth: 0,
            selectable: Selectable::None,
            checked: false,
            expandable: false,
        }
    }

    let mut elements: Vec<RawElement> = (0..30)
        .map(|i| noise(&format!("页面装饰区块 {}：推广位/导航/页脚说明文案", i)))
        .collect();
    for region in ["广东", "北京", "上海", "江苏", "浙江"] {
        elements.push(el("地区", region, 0, Selectable::Radio));
    }
    for cap in ["100万以下", "100-500万", "500-1000万", "1000万-1亿", "1亿以上"] {
        elements.push(el("注册资本", cap, 0, Selectable::Radio));
    }
    for status in ["在业", "存续", "迁入", "迁出"] {
        elements.push(el("企业状态", status, 0, Selectable::Checkbox));
    }
    elements.push(el("行业", "制造业", 0, Selectable::TreeNode));
    elements.push(el("行业", "汽车零部件", 1, Selectable::TreeNode));
    elements.push(el("行业", "汽车玻璃", 2, Selectable::TreeNode));
    elements.push(el("行业", "汽车电子", 2, Selectable::TreeNode));
    elements.push(el("行业", "批发零售", 0, Selectable::TreeNode));
    elements.push(el("行业", "汽车销售", 1, Selectable::TreeNode));

    PageSnapshot {
        url: "https://portal.example/advance-search".into(),
        elements,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_open_snapshot_apply_close_roundtrip() {
        let driver = MockPortalDriver::with_default_form();
        let mut handle = driver.open().await.unwrap();
        let snapshot = handle.snapshot().await.unwrap();
        assert!(!snapshot.elements.is_empty());

        let condition = SearchCondition {
            keyword: Some("汽车玻璃".into()),
            entries: vec![],
        };
        let steps = handle.apply(&condition).await.unwrap();
        assert_eq!(steps.len(), 1);
        handle.close().await;

        assert_eq!(driver.applied_conditions().len(), 1);
        assert_eq!(driver.close_count(), 1);
    }

    #[tokio::test]
    async fn test_scripted_apply_failures() {
        let driver = MockPortalDriver::with_default_form();
        driver.fail_next_applies(1);
        let mut handle = driver.open().await.unwrap();
        let condition = SearchCondition::default();
        assert!(matches!(
            handle.apply(&condition).await,
            Err(AgentError::ToolExecutionFailed(_))
        ));
        // 第二次成功
        assert!(handle.apply(&condition).await.is_ok());
    }

    #[tokio::test]
    async fn test_unreachable_driver() {
        let driver = MockPortalDriver::unreachable();
        assert!(matches!(
            driver.open().await,
            Err(AgentError::DriverUnreachable(_))
        ));
    }
}
