//! 自动化驱动契约：open / snapshot / apply / screenshot / close
//!
//! 浏览器上下文是稀缺的有状态资源：句柄只在一次工具执行阶段内存活，
//! 编排器保证在每条退出路径（成功、修复失败、动作失败、取消）上都调用 close。

use async_trait::async_trait;

use crate::core::AgentError;
use crate::page::{AppliedStep, PageSnapshot, SearchCondition};

pub mod mock;

#[cfg(feature = "browser")]
pub mod headless;

pub use mock::MockPortalDriver;

#[cfg(feature = "browser")]
pub use headless::HeadlessPortalDriver;

/// 门户驱动：负责创建会话级浏览器上下文
#[async_trait]
pub trait PortalDriver: Send + Sync {
    /// 打开门户页面并返回句柄；失败即 DriverUnreachable（唯一打 Failed 的错误）
    async fn open(&self) -> Result<Box<dyn PortalHandle>, AgentError>;
}

/// 一次工具执行阶段内的页面句柄
#[async_trait]
pub trait PortalHandle: Send + Sync {
    /// 抓取当前页面的原始元素快照
    async fn snapshot(&mut self) -> Result<PageSnapshot, AgentError>;

    /// 按最终检索条件操作表单并提交，逐步返回执行动作
    async fn apply(&mut self, condition: &SearchCondition) -> Result<Vec<AppliedStep>, AgentError>;

    /// 整页截图，返回 base64 PNG
    async fn screenshot(&mut self) -> Result<String, AgentError>;

    /// 释放浏览器上下文；幂等
    async fn close(&mut self);
}
