//! 委派工具（会话侧）
//!
//! 在隔离会话内运行：把请求写进本群的 tasks/，然后轮询本群的 delegation_results/，
//! 直到拿到结果或等待超时。对 agent 来说是一个同步调用。

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::Mutex;

use crate::config::DelegationSection;
use crate::core::DelegationError;
use crate::groups::validate_folder;
use crate::ipc::{
    DelegateTask, DelegationOutcome, GroupIpc, RequestRecord, RequestState, TaskRequest,
};
use crate::tools::Tool;

/// 请求方在宿主超时之外多等的时间，让宿主的超时错误有机会先送达
const CLIENT_SLACK: Duration = Duration::from_secs(5);

pub struct DelegateClient {
    source_group: String,
    ipc: GroupIpc,
    limits: DelegationSection,
    records: Mutex<HashMap<String, RequestRecord>>,
}

impl DelegateClient {
    pub fn new(
        ipc_dir: impl Into<PathBuf>,
        source_group: impl Into<String>,
        limits: &DelegationSection,
    ) -> Self {
        Self {
            source_group: source_group.into(),
            ipc: GroupIpc::new(ipc_dir),
            limits: limits.clone(),
            records: Mutex::new(HashMap::new()),
        }
    }

    /// 清理之前放弃等待后才送达、一直没人取的结果
    pub async fn startup(&self) -> usize {
        match self.ipc.results().purge_stale(self.limits.stale_after()).await {
            Ok(n) => n,
            Err(e) => {
                tracing::warn!(error = %e, "failed to purge stale outcomes");
                0
            }
        }
    }

    /// 委派并等待；Err 是可以直接给 agent 看的错误文本
    pub async fn delegate(
        &self,
        target_group: &str,
        prompt: &str,
        timeout_secs: Option<u64>,
    ) -> Result<String, String> {
        if validate_folder(target_group).is_err() {
            return Err(DelegationError::UnknownTarget(target_group.to_string()).to_string());
        }
        if prompt.trim().is_empty() {
            return Err(DelegationError::Protocol("prompt is empty".to_string()).to_string());
        }

        let timeout = self.limits.clamp_timeout(timeout_secs);
        let request_id = uuid::Uuid::new_v4().to_string();
        let request = TaskRequest::Delegate(DelegateTask {
            request_id: request_id.clone(),
            source_group: self.source_group.clone(),
            target_group: target_group.to_string(),
            prompt: prompt.to_string(),
            timeout_seconds: Some(timeout),
        });

        self.records.lock().await.insert(
            request_id.clone(),
            RequestRecord::new(&request_id, RequestState::Pending, Utc::now()),
        );
        if let Err(e) = self.ipc.tasks().submit(&request).await {
            self.mark(&request_id, RequestState::Expired).await;
            return Err(format!("Failed to submit delegation request: {}", e));
        }
        tracing::info!(request_id = %request_id, target = %target_group, timeout_secs = timeout, "delegation submitted");

        let poll = Duration::from_millis(self.limits.poll_interval_ms.max(1));
        let waited = self
            .ipc
            .results()
            .await_result(&request_id, poll, Duration::from_secs(timeout) + CLIENT_SLACK)
            .await;

        if let Ok(outcome) = &waited {
            tracing::info!(
                request_id = %request_id,
                target = %outcome.target_group(),
                success = outcome.is_success(),
                "delegation outcome received"
            );
        }
        match waited {
            Ok(DelegationOutcome::Success { result, .. }) => {
                self.mark(&request_id, RequestState::Completed).await;
                self.mark(&request_id, RequestState::Consumed).await;
                Ok(result)
            }
            Ok(DelegationOutcome::Error { error, .. }) => {
                self.mark(&request_id, RequestState::Failed).await;
                self.mark(&request_id, RequestState::Consumed).await;
                Err(error)
            }
            Err(DelegationError::Timeout(_)) => {
                self.mark(&request_id, RequestState::Expired).await;
                tracing::warn!(request_id = %request_id, "stopped waiting for delegation outcome");
                Err(DelegationError::Timeout(timeout).to_string())
            }
            Err(e) => {
                self.mark(&request_id, RequestState::Expired).await;
                Err(e.to_string())
            }
        }
    }

    /// 最近一次发出的请求（按创建时间）
    pub async fn last_record(&self) -> Option<RequestRecord> {
        self.records
            .lock()
            .await
            .values()
            .max_by_key(|r| r.created_at)
            .cloned()
    }

    async fn mark(&self, request_id: &str, next: RequestState) {
        if let Some(record) = self.records.lock().await.get_mut(request_id) {
            if let Err(e) = record.transition(next, Utc::now()) {
                tracing::debug!(request_id = %request_id, error = %e, "client state not updated");
            }
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DelegateArgs {
    target_group: String,
    prompt: String,
    #[serde(default)]
    timeout_seconds: Option<u64>,
}

/// agent 可调用的 `delegate` 工具
pub struct DelegateTool {
    client: Arc<DelegateClient>,
}

impl DelegateTool {
    pub fn new(client: Arc<DelegateClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Tool for DelegateTool {
    fn name(&self) -> &str {
        "delegate"
    }

    fn description(&self) -> &str {
        "Ask another group's agent to run a task in a fresh session and wait for its answer. \
         Args: {\"targetGroup\": \"folder\", \"prompt\": \"task\", \"timeoutSeconds\": 300}"
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "targetGroup": { "type": "string", "description": "Folder name of the target group" },
                "prompt": { "type": "string", "description": "Task for the target group's agent" },
                "timeoutSeconds": { "type": "integer", "minimum": 1 }
            },
            "required": ["targetGroup", "prompt"]
        })
    }

    async fn execute(&self, args: Value) -> Result<String, String> {
        let args: DelegateArgs =
            serde_json::from_value(args).map_err(|e| format!("Invalid arguments: {}", e))?;
        self.client
            .delegate(&args.target_group, &args.prompt, args.timeout_seconds)
            .await
    }
}
