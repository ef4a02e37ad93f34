//! IPC 报文格式
//!
//! 请求：`{"type":"delegate","requestId":..,"sourceGroup":..,"targetGroup":..,"prompt":..,"timeoutSeconds":..}`
//! 结果：`{"status":"success","result":..,"targetGroup":..}` 或 `{"status":"error","error":..,"targetGroup":..}`

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::core::DelegationError;

/// 会话交给宿主的一次性请求，按 `type` 分派
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskRequest {
    Delegate(DelegateTask),
}

impl TaskRequest {
    pub fn request_id(&self) -> &str {
        match self {
            Self::Delegate(task) => &task.request_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Delegate(_) => "delegate",
        }
    }

    /// 解析原始文件内容并校验 requestId
    pub fn parse(raw: &str) -> Result<Self, DelegationError> {
        let request: Self = serde_json::from_str(raw)
            .map_err(|e| DelegationError::Protocol(e.to_string()))?;
        validate_request_id(request.request_id())?;
        Ok(request)
    }

    /// 报文无法完整解析时，尽量取出 requestId 以便回写错误结果
    pub fn recover_request_id(raw: &str) -> Option<String> {
        let value: serde_json::Value = serde_json::from_str(raw).ok()?;
        let id = value.get("requestId")?.as_str()?;
        validate_request_id(id).ok()?;
        Some(id.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DelegateTask {
    pub request_id: String,
    pub source_group: String,
    pub target_group: String,
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
}

/// 每个 requestId 恰好一个的委派结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum DelegationOutcome {
    Success {
        result: String,
        #[serde(rename = "targetGroup")]
        target_group: String,
    },
    Error {
        error: String,
        #[serde(rename = "targetGroup")]
        target_group: String,
    },
}

impl DelegationOutcome {
    pub fn success(target_group: impl Into<String>, result: impl Into<String>) -> Self {
        Self::Success {
            result: result.into(),
            target_group: target_group.into(),
        }
    }

    pub fn error(target_group: impl Into<String>, error: &DelegationError) -> Self {
        Self::Error {
            error: error.to_string(),
            target_group: target_group.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    pub fn target_group(&self) -> &str {
        match self {
            Self::Success { target_group, .. } | Self::Error { target_group, .. } => target_group,
        }
    }
}

fn request_id_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_-]{0,127}$").expect("static request id pattern")
    })
}

/// requestId 会成为文件名，只允许安全字符
pub fn validate_request_id(id: &str) -> Result<(), DelegationError> {
    if request_id_pattern().is_match(id) {
        Ok(())
    } else {
        Err(DelegationError::Protocol(format!("invalid requestId: {:?}", id)))
    }
}
