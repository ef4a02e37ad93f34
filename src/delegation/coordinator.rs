//! 委派协调器
//!
//! 流程：查找目标 → 授权 → 尝试取委派槽（满则 Busy）→ 启动全新上下文的目标群会话 →
//! 按到达顺序缓存输出片段，受硬超时约束 → 拼接结果 → 释放槽位 → 写且只写一个结果文件。
//! 执行与请求方的等待互相独立：请求方先放弃，这里照样跑完并写结果。

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use crate::config::{AppConfig, DelegationSection};
use crate::core::DelegationError;
use crate::groups::GroupRegistry;
use crate::ipc::{DelegateTask, DelegationOutcome, IpcLayout, RequestLedger};
use crate::queue::DelegationPool;
use crate::runner::{RunningSession, SessionRunner, SessionSpec};

/// 会话没有任何输出时的结果文本
pub const NO_OUTPUT: &str = "(no output)";

#[derive(Debug, Clone)]
pub struct DelegationSettings {
    pub limits: DelegationSection,
    /// 超时后等待会话进程退出的宽限期
    pub kill_grace: Duration,
}

impl DelegationSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            limits: config.delegation.clone(),
            kill_grace: Duration::from_millis(config.sessions.kill_grace_ms),
        }
    }
}

impl Default for DelegationSettings {
    fn default() -> Self {
        Self::from_config(&AppConfig::default())
    }
}

pub struct DelegationCoordinator {
    registry: Arc<GroupRegistry>,
    runner: Arc<dyn SessionRunner>,
    pool: Arc<DelegationPool>,
    layout: IpcLayout,
    ledger: Arc<RequestLedger>,
    settings: DelegationSettings,
}

impl DelegationCoordinator {
    pub fn new(
        registry: Arc<GroupRegistry>,
        runner: Arc<dyn SessionRunner>,
        pool: Arc<DelegationPool>,
        layout: IpcLayout,
        ledger: Arc<RequestLedger>,
        settings: DelegationSettings,
    ) -> Self {
        Self {
            registry,
            runner,
            pool,
            layout,
            ledger,
            settings,
        }
    }

    pub fn pool(&self) -> &Arc<DelegationPool> {
        &self.pool
    }

    pub fn ledger(&self) -> &Arc<RequestLedger> {
        &self.ledger
    }

    pub fn layout(&self) -> &IpcLayout {
        &self.layout
    }

    /// 执行一次委派，返回拼接后的结果文本
    pub async fn delegate(
        &self,
        source_group: &str,
        target_group: &str,
        prompt: &str,
        timeout_secs: Option<u64>,
    ) -> Result<String, DelegationError> {
        let source = self.registry.get_by_folder(source_group).await.ok_or_else(|| {
            DelegationError::Authorization(format!("unknown source group '{}'", source_group))
        })?;
        let target = self.registry.get_by_folder(target_group).await;
        super::authorize(&source, target.as_ref(), target_group, self.registry.main_folder())?;
        let Some(target) = target else {
            return Err(DelegationError::UnknownTarget(target_group.to_string()));
        };
        if prompt.trim().is_empty() {
            return Err(DelegationError::Protocol("prompt is empty".to_string()));
        }

        // 槽位随 _permit drop 归还，包括下面任何一个提前返回
        let _permit = self.pool.try_acquire()?;

        let timeout = self.settings.limits.clamp_timeout(timeout_secs);
        let is_main = self.registry.is_main(&target.folder);
        let spec = SessionSpec::delegated(target, prompt, source_group, is_main);

        tracing::info!(
            source = %source_group,
            target = %target_group,
            timeout_secs = timeout,
            active = self.pool.active(),
            "delegation started"
        );

        let mut session = RunningSession::start(
            Arc::clone(&self.runner),
            spec,
            Duration::from_secs(timeout),
            self.settings.kill_grace,
        );

        let mut fragments = Vec::new();
        while let Some(output) = session.next_output().await {
            if let Some(text) = output.text {
                tracing::debug!(target_group = %target_group, len = text.len(), "delegation fragment");
                fragments.push(text);
            }
        }
        let summary = session.finish().await?;

        Ok(assemble_result(fragments, summary.result))
    }

    /// 处理一个已认领的请求：无论成功失败，都向来源群写且只写一个结果
    pub async fn handle_request(&self, source_folder: &str, task: DelegateTask) {
        let started = std::time::Instant::now();
        let result = self
            .delegate(
                &task.source_group,
                &task.target_group,
                &task.prompt,
                task.timeout_seconds,
            )
            .await;

        let outcome = match &result {
            Ok(text) => DelegationOutcome::success(&task.target_group, text.clone()),
            Err(e) => DelegationOutcome::error(&task.target_group, e),
        };
        match &result {
            Ok(_) => tracing::info!(
                request_id = %task.request_id,
                target = %task.target_group,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "delegation completed"
            ),
            Err(e) => tracing::warn!(
                request_id = %task.request_id,
                target = %task.target_group,
                error = %e,
                "delegation failed"
            ),
        }
        self.deliver(source_folder, &task.request_id, outcome).await;
    }

    /// 不经执行直接回写错误（认领阶段就能判定的问题）
    pub async fn reject(
        &self,
        source_folder: &str,
        request_id: &str,
        target_group: &str,
        error: &DelegationError,
    ) {
        tracing::warn!(request_id = %request_id, source = %source_folder, error = %error, "request rejected");
        self.deliver(source_folder, request_id, DelegationOutcome::error(target_group, error))
            .await;
    }

    async fn deliver(&self, source_folder: &str, request_id: &str, outcome: DelegationOutcome) {
        let success = outcome.is_success();
        let results = self.layout.group(source_folder).results();
        if let Err(e) = results.write_outcome(request_id, &outcome).await {
            tracing::error!(request_id = %request_id, error = %e, "failed to write delegation outcome");
        }
        if let Err(e) = self.ledger.finish(request_id, success, Utc::now()).await {
            tracing::debug!(request_id = %request_id, error = %e, "ledger not updated");
        }
    }
}

/// 片段按到达顺序以空行连接；没有片段时用会话摘要，再没有就是 "(no output)"
fn assemble_result(fragments: Vec<String>, summary: Option<String>) -> String {
    let fragments: Vec<String> = fragments
        .into_iter()
        .filter(|f| !f.trim().is_empty())
        .collect();
    if !fragments.is_empty() {
        return fragments.join("\n\n");
    }
    summary
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| NO_OUTPUT.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::groups::{ContainerConfig, RegisteredGroup};
    use crate::runner::testing::{Script, ScriptedRunner};

    async fn registry() -> Arc<GroupRegistry> {
        let registry = GroupRegistry::in_memory("main");
        registry
            .register(RegisteredGroup::new("main@g", "Main", "main", "@Andy"))
            .await
            .unwrap();
        registry
            .register(RegisteredGroup::new("gmail@g", "Gmail", "gmail-reader", "@Andy"))
            .await
            .unwrap();
        registry
            .register(
                RegisteredGroup::new("research@g", "Research", "research", "@Andy")
                    .with_container_config(ContainerConfig {
                        allow_delegation: vec!["browser".into()],
                        ..Default::default()
                    }),
            )
            .await
            .unwrap();
        registry
            .register(RegisteredGroup::new("finance@g", "Finance", "finance", "@Andy"))
            .await
            .unwrap();
        Arc::new(registry)
    }

    fn coordinator(
        registry: Arc<GroupRegistry>,
        runner: Arc<ScriptedRunner>,
        max: usize,
        dir: &std::path::Path,
    ) -> DelegationCoordinator {
        let mut settings = DelegationSettings::default();
        settings.kill_grace = Duration::from_millis(100);
        DelegationCoordinator::new(
            registry,
            runner,
            Arc::new(DelegationPool::new(max)),
            IpcLayout::new(dir),
            Arc::new(RequestLedger::default()),
            settings,
        )
    }

    #[test]
    fn test_assemble_result() {
        assert_eq!(assemble_result(vec!["Alice".into(), "Bob".into()], None), "Alice\n\nBob");
        assert_eq!(assemble_result(vec![], Some("summary".into())), "summary");
        assert_eq!(assemble_result(vec!["  ".into()], Some(" ".into())), NO_OUTPUT);
    }

    #[tokio::test]
    async fn test_fragments_joined_in_arrival_order() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::emitting(&["Alice", "Bob"]));
        let coord = coordinator(registry().await, runner.clone(), 3, dir.path());

        let result = coord
            .delegate("main", "gmail-reader", "list unread senders", Some(60))
            .await
            .unwrap();
        assert_eq!(result, "Alice\n\nBob");

        let specs = runner.specs.lock().unwrap();
        assert_eq!(specs[0].group.folder, "gmail-reader");
        assert_eq!(specs[0].session_id, None);
        assert!(specs[0].is_delegated());
        assert_eq!(coord.pool().active(), 0);
    }

    #[tokio::test]
    async fn test_no_output_marker() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::emitting(&[]));
        let coord = coordinator(registry().await, runner, 3, dir.path());
        let result = coord.delegate("main", "finance", "anything?", None).await.unwrap();
        assert_eq!(result, NO_OUTPUT);
    }

    #[tokio::test]
    async fn test_denied_before_any_resource_is_used() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::emitting(&["secret"]));
        let coord = coordinator(registry().await, runner.clone(), 3, dir.path());

        let err = coord
            .delegate("research", "finance", "show balances", None)
            .await
            .unwrap_err();
        assert!(matches!(err, DelegationError::Authorization(_)));
        assert_eq!(runner.calls(), 0);
        assert_eq!(coord.pool().active(), 0);
    }

    #[tokio::test]
    async fn test_unknown_target() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::emitting(&[]));
        let coord = coordinator(registry().await, runner.clone(), 3, dir.path());
        let err = coord.delegate("main", "ghost", "hi", None).await.unwrap_err();
        assert_eq!(err, DelegationError::UnknownTarget("ghost".into()));
        assert_eq!(runner.calls(), 0);
    }

    #[tokio::test]
    async fn test_host_timeout_frees_slot() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::new(Script::Hang));
        let coord = coordinator(registry().await, runner, 1, dir.path());

        let err = coord.delegate("main", "finance", "slow", Some(1)).await.unwrap_err();
        assert_eq!(err, DelegationError::Timeout(1));
        assert_eq!(coord.pool().active(), 0);
    }

    #[tokio::test]
    async fn test_spawn_failure_frees_slot() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::new(Script::Fail("image not found".into())));
        let coord = coordinator(registry().await, runner, 1, dir.path());

        let err = coord.delegate("main", "finance", "x", None).await.unwrap_err();
        assert!(matches!(err, DelegationError::Spawn(msg) if msg.contains("image not found")));
        assert_eq!(coord.pool().active(), 0);
    }

    #[tokio::test]
    async fn test_handle_request_writes_exactly_one_outcome() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::emitting(&["Alice", "Bob"]));
        let coord = coordinator(registry().await, runner, 3, dir.path());
        coord.ledger().begin("req-1", Utc::now()).await.unwrap();

        coord
            .handle_request(
                "main",
                DelegateTask {
                    request_id: "req-1".into(),
                    source_group: "main".into(),
                    target_group: "gmail-reader".into(),
                    prompt: "list unread senders".into(),
                    timeout_seconds: Some(60),
                },
            )
            .await;

        let results = coord.layout().group("main").results();
        let raw = std::fs::read_to_string(results.dir().join("req-1.json")).unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(
            value,
            serde_json::json!({"status":"success","result":"Alice\n\nBob","targetGroup":"gmail-reader"})
        );
        assert!(!results.dir().join("req-1.error.json").exists());
        assert_eq!(
            coord.ledger().get("req-1").await.unwrap().state,
            crate::ipc::RequestState::Completed
        );
    }
}
