//! 端到端流程测试：脚本化 LLM + 脚本化门户驱动，跑通整条回合链路

use std::sync::Arc;
use std::time::Duration;

use sift::core::{Orchestrator, SessionPhase};
use sift::driver::mock::MockPortalDriver;
use sift::driver::PortalDriver;
use sift::llm::{LlmClient, MockLlmClient};
use sift::retrieval::{KnowledgeStore, VectorKnowledgeBase};
use sift::session::{SessionCell, SessionStore};
use sift::stream::{EventStreamer, LogEvent, SequencedEvent};

const SUFFICIENT: &str = r#"{"decision": "sufficient"}"#;

fn build_orchestrator(
    responses: Vec<&str>,
    driver: Arc<MockPortalDriver>,
    knowledge: Arc<dyn KnowledgeStore>,
) -> Orchestrator {
    let llm: Arc<dyn LlmClient> = Arc::new(MockLlmClient::with_responses(responses));
    Orchestrator::new(llm, knowledge, driver as Arc<dyn PortalDriver>, 5, 20)
}

fn empty_knowledge() -> Arc<dyn KnowledgeStore> {
    Arc::new(VectorKnowledgeBase::new(None, 3, 0.5, 500, 50))
}

async fn run_turn(
    orchestrator: &Orchestrator,
    cell: Arc<SessionCell>,
    input: &str,
) -> Vec<SequencedEvent> {
    let (streamer, mut stream) = EventStreamer::channel_with_counter(128, Arc::clone(&cell.seq));
    orchestrator
        .handle_turn(cell, input.to_string(), &streamer)
        .await;
    drop(streamer);
    let mut events = Vec::new();
    while let Some(ev) = stream.recv().await {
        events.push(ev);
    }
    events
}

fn final_report(events: &[SequencedEvent]) -> Option<String> {
    events.iter().find_map(|ev| match &ev.event {
        LogEvent::FinalReport { text } => Some(text.clone()),
        _ => None,
    })
}

/// 三要素齐备的请求：直接走到工具执行，树字段做深者优先互斥，
/// 报告含执行总结，截图帧随流下发。
#[tokio::test]
async fn full_search_flow_with_tree_resolution() {
    let driver = Arc::new(MockPortalDriver::with_default_form());
    let orchestrator = build_orchestrator(
        vec![
            SUFFICIENT,
            r#"{"关键词": "汽车玻璃", "地区": "广东", "注册资本": "1亿以上", "行业": ["汽车玻璃", "汽车零部件"]}"#,
        ],
        Arc::clone(&driver),
        empty_knowledge(),
    );
    let store = SessionStore::new(Duration::from_secs(3600));
    let cell = store.get_or_create("e2e-1").await;

    let events = run_turn(
        &orchestrator,
        Arc::clone(&cell),
        "找广东省注册资本1亿以上的汽车玻璃厂商",
    )
    .await;

    // 序号严格递增
    let mut last = 0;
    for ev in &events {
        assert!(ev.seq > last);
        last = ev.seq;
    }

    let report = final_report(&events).expect("final report");
    assert!(report.starts_with("EXECUTION_SUMMARY"));
    assert!(report.contains("||NEWLINE||"));
    assert!(report.contains("✅ 关键词：汽车玻璃"));

    // 截图帧存在且是合法 base64 PNG 前缀
    assert!(events.iter().any(|ev| matches!(
        &ev.event,
        LogEvent::Screenshot { image_base64 } if image_base64.starts_with("iVBOR")
    )));

    // 深者优先：祖先「汽车零部件」被更深的「汽车玻璃」取代
    let applied = driver.applied_conditions();
    assert_eq!(applied.len(), 1);
    let industry = applied[0]
        .entries
        .iter()
        .find(|e| e.field == "行业")
        .expect("industry entry applied");
    assert_eq!(industry.values, vec!["汽车玻璃"]);
    // 单选字段原样透传
    let region = applied[0]
        .entries
        .iter()
        .find(|e| e.field == "地区")
        .expect("region entry applied");
    assert_eq!(region.values, vec!["广东"]);

    assert_eq!(driver.close_count(), 1);
    assert_eq!(cell.state.read().await.phase, SessionPhase::Idle);
}

/// 含糊请求先追问、同会话追答后继续执行（多轮澄清）
#[tokio::test]
async fn vague_request_clarifies_then_resumes_in_same_session() {
    let driver = Arc::new(MockPortalDriver::with_default_form());
    let orchestrator = build_orchestrator(
        vec![
            r#"{"decision": "needs_clarification", "question": "请问目标地区和注册资本门槛是？"}"#,
            SUFFICIENT,
            r#"{"地区": "广东", "行业": "汽车销售"}"#,
        ],
        Arc::clone(&driver),
        empty_knowledge(),
    );
    let store = SessionStore::new(Duration::from_secs(3600));
    let cell = store.get_or_create("e2e-2").await;

    let events = run_turn(&orchestrator, Arc::clone(&cell), "帮我找些汽车相关的公司").await;
    let first_turn_last_seq = events.last().map(|ev| ev.seq).unwrap_or(0);
    assert!(final_report(&events).is_none());
    assert!(events.iter().any(|ev| matches!(
        &ev.event,
        LogEvent::Text { chunk } if chunk.contains("目标地区")
    )));
    {
        let session = cell.state.read().await;
        assert_eq!(session.phase, SessionPhase::AwaitingClarification);
        assert!(session
            .pending_clarification
            .as_deref()
            .is_some_and(|q| q.contains("注册资本")));
        // 追问已计入对话历史
        assert_eq!(session.turns.len(), 2);
    }

    let events = run_turn(&orchestrator, Arc::clone(&cell), "广东省，门槛不限").await;
    // 序号跨回合接力：同一会话第二回合不得从头计数
    assert!(events
        .first()
        .is_some_and(|ev| ev.seq > first_turn_last_seq));
    let report = final_report(&events).expect("final report after clarification");
    assert!(report.contains("汽车销售"));
    assert_eq!(driver.applied_conditions().len(), 1);
    assert_eq!(cell.state.read().await.phase, SessionPhase::Idle);
}

/// 检索轮：路由先要资料，命中片段以 [RAG_HIT] 下发后继续执行
#[tokio::test]
async fn knowledge_round_emits_hits_then_executes() {
    let driver = Arc::new(MockPortalDriver::with_default_form());
    let mut kb = VectorKnowledgeBase::new(None, 3, 0.5, 500, 50);
    kb.index_text(
        "industry.md",
        "汽车玻璃属于汽车零部件制造，挂在行业类目树的制造业分支下。",
    )
    .await;
    let orchestrator = build_orchestrator(
        vec![
            r#"{"decision": "needs_knowledge", "topic": "汽车玻璃的行业类目归属"}"#,
            SUFFICIENT,
            r#"{"行业": "汽车玻璃"}"#,
        ],
        Arc::clone(&driver),
        Arc::new(kb),
    );
    let store = SessionStore::new(Duration::from_secs(3600));
    let cell = store.get_or_create("e2e-3").await;

    let events = run_turn(
        &orchestrator,
        Arc::clone(&cell),
        "找做汽车玻璃的制造企业，广东，资本不限",
    )
    .await;

    assert!(events.iter().any(|ev| matches!(
        &ev.event,
        LogEvent::RetrievalHit { preview } if preview.contains("汽车零部件")
    )));
    assert!(final_report(&events).is_some());
    assert_eq!(driver.applied_conditions().len(), 1);
}

/// 驱动不可达：会话进入终态 Failed，后续消息被拒绝
#[tokio::test]
async fn unreachable_driver_is_terminal() {
    let driver = Arc::new(MockPortalDriver::unreachable());
    let orchestrator = build_orchestrator(
        vec![SUFFICIENT, SUFFICIENT],
        Arc::clone(&driver),
        empty_knowledge(),
    );
    let store = SessionStore::new(Duration::from_secs(3600));
    let cell = store.get_or_create("e2e-4").await;

    run_turn(
        &orchestrator,
        Arc::clone(&cell),
        "找广东省注册资本1亿以上的汽车玻璃厂商",
    )
    .await;
    assert_eq!(cell.state.read().await.phase, SessionPhase::Failed);

    let events = run_turn(&orchestrator, Arc::clone(&cell), "换个条件再试试呢").await;
    assert!(events.iter().any(|ev| matches!(
        &ev.event,
        LogEvent::Error { text } if text.contains("会话已失效")
    )));
    assert_eq!(cell.state.read().await.phase, SessionPhase::Failed);
}

/// 模型输出残缺 JSON：修复管线兜底，流程照常走完
#[tokio::test]
async fn malformed_selection_output_is_repaired() {
    let driver = Arc::new(MockPortalDriver::with_default_form());
    let orchestrator = build_orchestrator(
        vec![
            SUFFICIENT,
            // 代码围栏 + 全角引号 + 尾逗号
            "好的，选择如下：\n```json\n{“行业”: [“汽车玻璃”,], “地区”: “广东”,}\n```",
        ],
        Arc::clone(&driver),
        empty_knowledge(),
    );
    let store = SessionStore::new(Duration::from_secs(3600));
    let cell = store.get_or_create("e2e-5").await;

    let events = run_turn(
        &orchestrator,
        Arc::clone(&cell),
        "找广东做汽车玻璃的企业，资本不限",
    )
    .await;

    let report = final_report(&events).expect("repaired selection still executes");
    assert!(report.starts_with("EXECUTION_SUMMARY"));
    let applied = driver.applied_conditions();
    assert_eq!(applied.len(), 1);
    assert!(applied[0]
        .entries
        .iter()
        .any(|e| e.field == "行业" && e.values == vec!["汽车玻璃"]));
}

/// 页面上不存在的标签：跳过并在报告里带原因，其余条件照常执行
#[tokio::test]
async fn unknown_labels_are_reported_not_fabricated() {
    let driver = Arc::new(MockPortalDriver::with_default_form());
    let orchestrator = build_orchestrator(
        vec![
            SUFFICIENT,
            r#"{"地区": "广东", "行业": ["量子玻璃"]}"#,
        ],
        Arc::clone(&driver),
        empty_knowledge(),
    );
    let store = SessionStore::new(Duration::from_secs(3600));
    let cell = store.get_or_create("e2e-6").await;

    let events = run_turn(
        &orchestrator,
        Arc::clone(&cell),
        "找广东做量子玻璃的企业，资本不限",
    )
    .await;

    let report = final_report(&events).expect("final report");
    assert!(report.contains("量子玻璃||REASON||"));
    let applied = driver.applied_conditions();
    assert_eq!(applied.len(), 1);
    assert!(applied[0].entries.iter().any(|e| e.field == "地区"));
    assert!(!applied[0].entries.iter().any(|e| e.field == "行业"));
}
