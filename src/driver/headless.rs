//! headless_chrome 门户驱动（feature = "browser"）
//!
//! headless_chrome 是同步 API，所有页面操作包在 spawn_blocking 里执行；
//! Browser 进程随句柄存活，close 时整体释放。

use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use headless_chrome::protocol::cdp::Page::CaptureScreenshotFormatOption;
use headless_chrome::{Browser, Tab};

use crate::core::AgentError;
use crate::driver::{PortalDriver, PortalHandle};
use crate::page::{AppliedStep, PageSnapshot, RawElement, SearchCondition};

/// 采集脚本：遍历筛选容器内的元素，输出扁平标注列表的 JSON
const COLLECT_JS: &str = r#"
(function() {
    const container = document.querySelector('.advance-filters, .filter-container, form');
    const out = [];
    const push = (el, group, depth, selectable) => {
        out.push({
            tag: el.tagName.toLowerCase(),
            text: (el.textContent || el.value || '').trim().slice(0, 80),
            group: group,
            depth: depth,
            selectable: selectable,
            checked: !!(el.checked || el.classList.contains('checked') || el.getAttribute('aria-checked') === 'true'),
            expandable: !!el.querySelector && !!el.querySelector('.expand, .arrow'),
        });
    };
    if (!container) return JSON.stringify(out);
    for (const groupEl of container.querySelectorAll('.filter-group, fieldset, [data-filter-group]')) {
        const title = (groupEl.querySelector('.title, legend, .group-title') || {}).textContent;
        const group = title ? title.trim() : null;
        for (const el of groupEl.querySelectorAll('input, label, li, [role="treeitem"], [role="checkbox"], [role="radio"]')) {
            const role = el.getAttribute('role') || '';
            const type = (el.getAttribute('type') || '').toLowerCase();
            let selectable = 'none';
            if (role === 'treeitem' || el.closest('[role="tree"], .category-tree')) selectable = 'tree_node';
            else if (type === 'radio' || role === 'radio') selectable = 'radio';
            else if (type === 'checkbox' || role === 'checkbox' || el.tagName === 'LABEL') selectable = 'checkbox';
            let depth = 0;
            let p = el.parentElement;
            while (p && p !== groupEl) { if (p.tagName === 'UL' || p.tagName === 'OL') depth++; p = p.parentElement; }
            push(el, group, Math.max(0, depth - 1), selectable);
        }
    }
    return JSON.stringify(out);
})()
"#;

/// headless_chrome 实现
pub struct HeadlessPortalDriver {
    portal_url: String,
}

impl HeadlessPortalDriver {
    pub fn new(portal_url: impl Into<String>) -> Self {
        Self {
            portal_url: portal_url.into(),
        }
    }
}

#[async_trait]
impl PortalDriver for HeadlessPortalDriver {
    async fn open(&self) -> Result<Box<dyn PortalHandle>, AgentError> {
        let url = self.portal_url.clone();
        let opened = tokio::task::spawn_blocking(move || -> Result<(Browser, Arc<Tab>), String> {
            let browser =
                Browser::default().map_err(|e| format!("Chrome launch failed: {}", e))?;
            let tab = browser
                .new_tab()
                .map_err(|e| format!("Browser tab failed: {}", e))?;
            tab.navigate_to(&url)
                .map_err(|e| format!("Navigate failed: {}", e))?;
            tab.wait_for_element("body")
                .map_err(|e| format!("Page load failed: {}", e))?;
            // 等待筛选面板渲染
            std::thread::sleep(std::time::Duration::from_millis(500));
            Ok((browser, tab))
        })
        .await
        .map_err(|e| AgentError::DriverUnreachable(e.to_string()))?
        .map_err(AgentError::DriverUnreachable)?;

        let (browser, tab) = opened;
        tracing::info!(url = %self.portal_url, "portal opened");
        Ok(Box::new(HeadlessHandle {
            browser: Some(browser),
            tab,
            url: self.portal_url.clone(),
        }))
    }
}

struct HeadlessHandle {
    /// 持有以维持 Chrome 进程；close 时置 None 释放
    browser: Option<Browser>,
    tab: Arc<Tab>,
    url: String,
}

impl HeadlessHandle {
    /// 在阻塞线程上执行一段 JS 并取回字符串结果
    async fn eval(&self, js: String) -> Result<String, String> {
        let tab = Arc::clone(&self.tab);
        tokio::task::spawn_blocking(move || {
            let result = tab.evaluate(&js, true).map_err(|e| e.to_string())?;
            Ok(result
                .value
                .and_then(|v| v.as_str().map(String::from))
                .unwrap_or_default())
        })
        .await
        .map_err(|e| e.to_string())?
    }
}

fn js_escape(text: &str) -> String {
    text.replace('\\', "\\\\").replace('"', "\\\"").replace('\n', "\\n")
}

#[async_trait]
impl PortalHandle for HeadlessHandle {
    async fn snapshot(&mut self) -> Result<PageSnapshot, AgentError> {
        let raw = self
            .eval(COLLECT_JS.to_string())
            .await
            .map_err(AgentError::ExtractionFailed)?;
        let elements: Vec<RawElement> = serde_json::from_str(&raw)
            .map_err(|e| AgentError::ExtractionFailed(format!("collect script: {}", e)))?;
        Ok(PageSnapshot {
            url: self.url.clone(),
            elements,
        })
    }

    async fn apply(&mut self, condition: &SearchCondition) -> Result<Vec<AppliedStep>, AgentError> {
        let mut steps = Vec::new();

        if let Some(keyword) = &condition.keyword {
            let js = format!(
                r#"(function() {{
                    const input = document.querySelector('.search-input input, input[type="search"], #searchKey');
                    if (!input) return 'missing';
                    input.value = "{}";
                    input.dispatchEvent(new Event('input', {{ bubbles: true }}));
                    return 'ok';
                }})()"#,
                js_escape(keyword)
            );
            let out = self.eval(js).await.map_err(AgentError::ToolExecutionFailed)?;
            if out != "ok" {
                return Err(AgentError::ToolExecutionFailed(
                    "关键词输入框未找到".to_string(),
                ));
            }
            steps.push(AppliedStep {
                field: "关键词".into(),
                detail: format!("输入「{}」", keyword),
            });
        }

        for entry in &condition.entries {
            for value in &entry.values {
                let js = format!(
                    r#"(function() {{
                        const groups = document.querySelectorAll('.filter-group, fieldset, [data-filter-group]');
                        for (const g of groups) {{
                            const title = (g.querySelector('.title, legend, .group-title') || {{}}).textContent;
                            if (!title || title.trim() !== "{}") continue;
                            for (const el of g.querySelectorAll('label, li, [role="treeitem"]')) {{
                                if ((el.textContent || '').trim() === "{}") {{
                                    el.scrollIntoView({{ behavior: 'instant', block: 'center' }});
                                    el.click();
                                    return 'ok';
                                }}
                            }}
                        }}
                        return 'missing';
                    }})()"#,
                    js_escape(&entry.field),
                    js_escape(value)
                );
                let out = self.eval(js).await.map_err(AgentError::ToolExecutionFailed)?;
                if out != "ok" {
                    return Err(AgentError::ToolExecutionFailed(format!(
                        "「{}」下未找到选项「{}」",
                        entry.field, value
                    )));
                }
                steps.push(AppliedStep {
                    field: entry.field.clone(),
                    detail: format!("勾选「{}」", value),
                });
            }
        }

        // 提交搜索
        let submit = r#"(function() {
            const btn = document.querySelector('.search-btn, button[type="submit"], .btn-query');
            if (!btn) return 'missing';
            btn.click();
            return 'ok';
        })()"#;
        if let Err(e) = self.eval(submit.to_string()).await {
            return Err(AgentError::ToolExecutionFailed(e));
        }
        steps.push(AppliedStep {
            field: "提交".into(),
            detail: "点击查询按钮".into(),
        });

        Ok(steps)
    }

    async fn screenshot(&mut self) -> Result<String, AgentError> {
        let tab = Arc::clone(&self.tab);
        let bytes = tokio::task::spawn_blocking(move || {
            tab.capture_screenshot(CaptureScreenshotFormatOption::Png, None, None, true)
                .map_err(|e| e.to_string())
        })
        .await
        .map_err(|e| AgentError::ToolExecutionFailed(e.to_string()))?
        .map_err(AgentError::ToolExecutionFailed)?;
        Ok(base64::engine::general_purpose::STANDARD.encode(bytes))
    }

    async fn close(&mut self) {
        if self.browser.take().is_some() {
            tracing::debug!(url = %self.url, "browser context released");
        }
    }
}
