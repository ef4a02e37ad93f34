//! 隔离会话运行器
//!
//! SessionRunner 是宿主与「真正跑 agent 的进程」之间唯一的接缝：启动一次会话、
//! 把输出片段按到达顺序推到 channel、在 cancel 触发时终止进程。
//! RunningSession 在其上加硬超时：到期先 cancel，宽限期后仍未退出就 abort。

mod container;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, Sleep};
use tokio_util::sync::CancellationToken;

pub use container::{
    run_process, ContainerRunner, OutputParser, ParsedOutput, OUTPUT_END_MARKER, OUTPUT_START_MARKER,
};

use crate::core::{DelegationError, HiveError};
use crate::groups::RegisteredGroup;

/// 会话用途：普通对话轮次（续接会话）或委派（全新上下文）
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionMode {
    Turn { chat_jid: String },
    Delegated { source_group: String },
}

/// 启动一次会话所需的全部信息
#[derive(Debug, Clone)]
pub struct SessionSpec {
    pub group: RegisteredGroup,
    pub prompt: String,
    /// 要续接的 agent 会话；委派时恒为 None
    pub session_id: Option<String>,
    pub is_main: bool,
    pub mode: SessionMode,
}

impl SessionSpec {
    pub fn turn(
        group: RegisteredGroup,
        prompt: impl Into<String>,
        session_id: Option<String>,
        is_main: bool,
    ) -> Self {
        let chat_jid = group.jid.clone();
        Self {
            group,
            prompt: prompt.into(),
            session_id,
            is_main,
            mode: SessionMode::Turn { chat_jid },
        }
    }

    pub fn delegated(
        group: RegisteredGroup,
        prompt: impl Into<String>,
        source_group: impl Into<String>,
        is_main: bool,
    ) -> Self {
        Self {
            group,
            prompt: prompt.into(),
            session_id: None,
            is_main,
            mode: SessionMode::Delegated {
                source_group: source_group.into(),
            },
        }
    }

    pub fn is_delegated(&self) -> bool {
        matches!(self.mode, SessionMode::Delegated { .. })
    }

    /// 写给会话进程 stdin 的输入
    pub fn input(&self) -> SessionInput {
        let (chat_jid, delegated_from) = match &self.mode {
            SessionMode::Turn { chat_jid } => (Some(chat_jid.clone()), None),
            SessionMode::Delegated { source_group } => (None, Some(source_group.clone())),
        };
        SessionInput {
            prompt: self.prompt.clone(),
            session_id: self.session_id.clone(),
            group_folder: self.group.folder.clone(),
            chat_jid,
            is_main: self.is_main,
            delegated_from,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInput {
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub group_folder: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chat_jid: Option<String>,
    pub is_main: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delegated_from: Option<String>,
}

/// 会话流式吐出的一个片段
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionOutput {
    pub text: Option<String>,
    /// agent 报告的新会话 ID（续接用）
    pub session_id: Option<String>,
}

impl SessionOutput {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            session_id: None,
        }
    }
}

/// 会话正常结束后的收尾信息
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionSummary {
    /// 没有任何流式片段时可用的最终摘要
    pub result: Option<String>,
    pub session_id: Option<String>,
}

#[async_trait]
pub trait SessionRunner: Send + Sync {
    /// 跑一次会话直到结束；cancel 触发时应尽快终止底层进程并返回
    async fn run(
        &self,
        spec: SessionSpec,
        outputs: mpsc::UnboundedSender<SessionOutput>,
        cancel: CancellationToken,
    ) -> Result<SessionSummary, HiveError>;
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RunError {
    #[error("session exceeded {0}s and was terminated")]
    Timeout(u64),
    #[error("{0}")]
    Failed(String),
}

impl From<RunError> for DelegationError {
    fn from(e: RunError) -> Self {
        match e {
            RunError::Timeout(secs) => DelegationError::Timeout(secs),
            RunError::Failed(msg) => DelegationError::Spawn(msg),
        }
    }
}

/// 一次正在运行的会话：边读片段边盯着截止时间
pub struct RunningSession {
    outputs: mpsc::UnboundedReceiver<SessionOutput>,
    handle: JoinHandle<Result<SessionSummary, HiveError>>,
    cancel: CancellationToken,
    deadline: std::pin::Pin<Box<Sleep>>,
    timeout: Duration,
    grace: Duration,
    timed_out: bool,
}

impl RunningSession {
    /// 在独立任务里启动会话（runner 内部 panic 会变成 JoinError 而不是拖垮调用方）
    pub fn start(
        runner: Arc<dyn SessionRunner>,
        spec: SessionSpec,
        timeout: Duration,
        grace: Duration,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let handle = tokio::spawn(async move { runner.run(spec, tx, token).await });
        Self {
            outputs: rx,
            handle,
            cancel,
            deadline: Box::pin(tokio::time::sleep_until(Instant::now() + timeout)),
            timeout,
            grace,
            timed_out: false,
        }
    }

    /// 下一个片段；会话结束（发送端关闭）或超时后返回 None
    pub async fn next_output(&mut self) -> Option<SessionOutput> {
        if self.timed_out {
            return None;
        }
        tokio::select! {
            biased;
            output = self.outputs.recv() => output,
            _ = &mut self.deadline => {
                self.timed_out = true;
                None
            }
        }
    }

    /// 等待会话退出并给出最终结果
    pub async fn finish(mut self) -> Result<SessionSummary, RunError> {
        if !self.timed_out {
            tokio::select! {
                joined = &mut self.handle => return Self::joined(joined),
                _ = &mut self.deadline => self.timed_out = true,
            }
        }

        tracing::warn!(timeout_secs = self.timeout.as_secs(), "session hit its deadline, terminating");
        self.cancel.cancel();
        if tokio::time::timeout(self.grace, &mut self.handle).await.is_err() {
            tracing::warn!("session ignored termination, aborting");
            self.handle.abort();
        }
        Err(RunError::Timeout(self.timeout.as_secs()))
    }

    fn joined(
        joined: Result<Result<SessionSummary, HiveError>, tokio::task::JoinError>,
    ) -> Result<SessionSummary, RunError> {
        match joined {
            Ok(Ok(summary)) => Ok(summary),
            Ok(Err(e)) => Err(RunError::Failed(e.to_string())),
            Err(e) => Err(RunError::Failed(format!("session crashed: {}", e))),
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! 测试用的脚本化 runner

    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use super::*;

    #[derive(Debug, Clone)]
    pub enum Script {
        /// 依次输出片段，每片之间等待 delay，最后返回 summary
        Emit {
            fragments: Vec<String>,
            delay: Duration,
            summary: Option<String>,
            session_id: Option<String>,
        },
        /// 一直挂着直到被 cancel
        Hang,
        /// 无视 cancel 一直挂着
        Stubborn,
        Fail(String),
        Panic,
    }

    pub struct ScriptedRunner {
        script: Script,
        pub calls: AtomicUsize,
        pub specs: Mutex<Vec<SessionSpec>>,
    }

    impl ScriptedRunner {
        pub fn new(script: Script) -> Self {
            Self {
                script,
                calls: AtomicUsize::new(0),
                specs: Mutex::new(Vec::new()),
            }
        }

        pub fn emitting(fragments: &[&str]) -> Self {
            Self::new(Script::Emit {
                fragments: fragments.iter().map(|s| s.to_string()).collect(),
                delay: Duration::from_millis(1),
                summary: None,
                session_id: None,
            })
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl SessionRunner for ScriptedRunner {
        async fn run(
            &self,
            spec: SessionSpec,
            outputs: mpsc::UnboundedSender<SessionOutput>,
            cancel: CancellationToken,
        ) -> Result<SessionSummary, HiveError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.specs.lock().unwrap().push(spec);
            match &self.script {
                Script::Emit {
                    fragments,
                    delay,
                    summary,
                    session_id,
                } => {
                    for fragment in fragments {
                        tokio::time::sleep(*delay).await;
                        let _ = outputs.send(SessionOutput::text(fragment.clone()));
                    }
                    Ok(SessionSummary {
                        result: summary.clone(),
                        session_id: session_id.clone(),
                    })
                }
                Script::Hang => {
                    cancel.cancelled().await;
                    Err(HiveError::Runner("terminated".into()))
                }
                Script::Stubborn => std::future::pending().await,
                Script::Fail(msg) => Err(HiveError::Runner(msg.clone())),
                Script::Panic => panic!("runner exploded"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    fn spec() -> SessionSpec {
        SessionSpec::delegated(
            RegisteredGroup::new("t@g", "T", "target", "@Andy"),
            "hello",
            "main",
            false,
        )
    }

    #[test]
    fn test_delegated_input_has_no_session() {
        let input = spec().input();
        assert_eq!(input.session_id, None);
        assert_eq!(input.delegated_from.as_deref(), Some("main"));
        assert_eq!(input.chat_jid, None);
        let json = serde_json::to_value(&input).unwrap();
        assert_eq!(json["groupFolder"], "target");
        assert!(json.get("sessionId").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_collects_fragments_in_order() {
        let runner = Arc::new(ScriptedRunner::emitting(&["a", "b", "c"]));
        let mut session =
            RunningSession::start(runner, spec(), Duration::from_secs(10), Duration::from_secs(1));
        let mut seen = Vec::new();
        while let Some(out) = session.next_output().await {
            seen.extend(out.text);
        }
        assert_eq!(seen, vec!["a", "b", "c"]);
        assert!(session.finish().await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_cancels_session() {
        let runner = Arc::new(ScriptedRunner::new(Script::Hang));
        let mut session =
            RunningSession::start(runner, spec(), Duration::from_secs(5), Duration::from_secs(1));
        assert!(session.next_output().await.is_none());
        assert_eq!(session.finish().await.unwrap_err(), RunError::Timeout(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stubborn_session_is_aborted() {
        let runner = Arc::new(ScriptedRunner::new(Script::Stubborn));
        let session =
            RunningSession::start(runner, spec(), Duration::from_secs(2), Duration::from_secs(1));
        assert_eq!(session.finish().await.unwrap_err(), RunError::Timeout(2));
    }

    #[tokio::test]
    async fn test_panic_becomes_failure() {
        let runner = Arc::new(ScriptedRunner::new(Script::Panic));
        let session =
            RunningSession::start(runner, spec(), Duration::from_secs(5), Duration::from_secs(1));
        let err = session.finish().await.unwrap_err();
        assert!(matches!(err, RunError::Failed(msg) if msg.contains("crashed")));
    }
}
