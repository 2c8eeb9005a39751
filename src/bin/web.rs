//! sift Web 服务入口
//!
//! 启动: cargo run --bin sift-web
//! 真实浏览器驱动: cargo run --bin sift-web --features browser（需本机 Chrome/Chromium）

use std::sync::Arc;

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use sift::config::load_config;
use sift::core::Orchestrator;
use sift::driver::PortalDriver;
use sift::llm::{create_embedder_from_config, create_llm_from_config};
use sift::retrieval::{KnowledgeStore, VectorKnowledgeBase};
use sift::session::SessionStore;
use sift::web::{router, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer())
        .init();

    let cfg = load_config(None).unwrap_or_default();

    let llm = create_llm_from_config(&cfg.llm);

    // 知识库：目录未配置或加载失败都降级为空库，检索返回空命中
    let embedder =
        create_embedder_from_config(cfg.llm.base_url.as_deref(), &cfg.llm.embedding_model, None);
    let mut kb = VectorKnowledgeBase::new(
        embedder,
        cfg.retrieval.top_k,
        cfg.retrieval.score_threshold,
        cfg.retrieval.chunk_size,
        cfg.retrieval.chunk_overlap,
    );
    if let Some(dir) = &cfg.retrieval.knowledge_dir {
        if let Err(e) = kb.load_dir(dir).await {
            tracing::warn!(error = %e, "knowledge dir unavailable, starting with empty store");
        }
    } else {
        tracing::info!("no knowledge dir configured, retrieval starts empty");
    }
    let knowledge: Arc<dyn KnowledgeStore> = Arc::new(kb);

    let driver = create_driver(&cfg);

    let orchestrator = Arc::new(Orchestrator::new(
        llm,
        knowledge,
        driver,
        cfg.app.max_think_turns,
        cfg.app.max_context_turns,
    ));
    let store = Arc::new(SessionStore::new(std::time::Duration::from_secs(
        cfg.session.timeout_secs,
    )));

    // 后台清扫过期会话
    let sweep_store = Arc::clone(&store);
    let sweep_interval = cfg.session.sweep_interval_secs.max(1);
    tokio::spawn(async move {
        let mut interval =
            tokio::time::interval(std::time::Duration::from_secs(sweep_interval));
        interval.tick().await;
        loop {
            interval.tick().await;
            let swept = sweep_store.cleanup_expired().await;
            if swept > 0 {
                tracing::info!(swept, "expired sessions cleaned up");
            }
        }
    });

    let state = Arc::new(AppState {
        store,
        orchestrator,
        buffer_size: cfg.stream.buffer_size,
    });
    let app = router(state);

    tracing::info!(bind = %cfg.server.bind, "sift web service listening");
    let listener = tokio::net::TcpListener::bind(&cfg.server.bind).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

#[cfg(feature = "browser")]
fn create_driver(cfg: &sift::config::AppConfig) -> Arc<dyn PortalDriver> {
    tracing::info!(url = %cfg.portal.url, "using headless browser portal driver");
    Arc::new(sift::driver::headless::HeadlessPortalDriver::new(
        cfg.portal.url.clone(),
    ))
}

#[cfg(not(feature = "browser"))]
fn create_driver(_cfg: &sift::config::AppConfig) -> Arc<dyn PortalDriver> {
    tracing::warn!("browser feature disabled, using scripted portal driver");
    Arc::new(sift::driver::mock::MockPortalDriver::with_default_form())
}
