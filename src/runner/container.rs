//! 容器运行器：`<runtime> run -i --rm ... <image>`
//!
//! stdin 写入一份 JSON SessionInput；stdout 上每个输出包在
//! `---HIVE_OUTPUT_START---` / `---HIVE_OUTPUT_END---` 两行之间，内容是一个 JSON：
//! `{"status":"success"|"error","result":..,"newSessionId":..,"error":..}`。
//! 没有出现任何标记时，整段 stdout 作为最终摘要。

use std::collections::VecDeque;
use std::path::{Component, Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{SessionInput, SessionOutput, SessionRunner, SessionSpec, SessionSummary};
use crate::config::AppConfig;
use crate::core::HiveError;
use crate::groups::AdditionalMount;
use crate::ipc::IpcLayout;

pub const OUTPUT_START_MARKER: &str = "---HIVE_OUTPUT_START---";
pub const OUTPUT_END_MARKER: &str = "---HIVE_OUTPUT_END---";

/// 保留多少行 stderr 用于错误信息
const STDERR_TAIL_LINES: usize = 20;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ContainerOutput {
    status: String,
    #[serde(default)]
    result: Option<String>,
    #[serde(default)]
    new_session_id: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

/// 解析出的一个输出块
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedOutput {
    Output(SessionOutput),
    AgentError(String),
    Malformed(String),
}

/// 逐行喂入 stdout 的解析器
#[derive(Debug, Default)]
pub struct OutputParser {
    in_block: bool,
    block: String,
    plain: Vec<String>,
    pub markers_seen: usize,
}

impl OutputParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, line: &str) -> Option<ParsedOutput> {
        let trimmed = line.trim();
        if trimmed == OUTPUT_START_MARKER {
            self.in_block = true;
            self.block.clear();
            return None;
        }
        if trimmed == OUTPUT_END_MARKER && self.in_block {
            self.in_block = false;
            self.markers_seen += 1;
            let parsed = match serde_json::from_str::<ContainerOutput>(self.block.trim()) {
                Ok(out) if out.status == "error" => ParsedOutput::AgentError(
                    out.error.unwrap_or_else(|| "agent reported an error".to_string()),
                ),
                Ok(out) => ParsedOutput::Output(SessionOutput {
                    text: out.result.filter(|t| !t.trim().is_empty()),
                    session_id: out.new_session_id,
                }),
                Err(e) => ParsedOutput::Malformed(e.to_string()),
            };
            return Some(parsed);
        }
        if self.in_block {
            self.block.push_str(line);
            self.block.push('\n');
        } else {
            self.plain.push(line.to_string());
        }
        None
    }

    /// 无标记模式下的整段输出
    pub fn plain_text(&self) -> Option<String> {
        let text = self.plain.join("\n");
        let text = text.trim();
        (!text.is_empty()).then(|| text.to_string())
    }
}

/// 以容器为隔离单元的 SessionRunner
pub struct ContainerRunner {
    runtime: String,
    image: String,
    groups_dir: PathBuf,
    ipc: IpcLayout,
    container_workspace: String,
    /// `stop -t` 的秒数，取自 kill_grace_ms（向上取整）
    stop_grace_secs: u64,
}

impl ContainerRunner {
    pub fn new(config: &AppConfig) -> Self {
        Self {
            runtime: config.runner.runtime.clone(),
            image: config.runner.image.clone(),
            groups_dir: config.groups_dir(),
            ipc: IpcLayout::new(config.ipc_dir()),
            container_workspace: config.runner.container_workspace.clone(),
            stop_grace_secs: config.sessions.kill_grace_ms.div_ceil(1000),
        }
    }

    /// `<runtime> stop -t <grace> <name>` 的参数
    pub fn stop_args(&self, name: &str) -> Vec<String> {
        vec![
            "stop".to_string(),
            "-t".to_string(),
            self.stop_grace_secs.to_string(),
            name.to_string(),
        ]
    }

    /// 取消时通过运行时停掉容器本身
    ///
    /// 杀掉本地的 `run` 客户端不会停止守护进程托管的容器，必须显式 stop。
    /// 任务是分离的：即使 run 的 future 被中止，stop 也会执行完。
    fn spawn_stopper(&self, name: &str, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        let runtime = self.runtime.clone();
        let args = self.stop_args(name);
        let name = name.to_string();
        tokio::spawn(async move {
            cancel.cancelled().await;
            tracing::info!(container = %name, "stopping session container");
            let status = Command::new(&runtime)
                .args(&args)
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()
                .await;
            match status {
                Ok(status) if status.success() => {}
                Ok(status) => {
                    tracing::warn!(container = %name, status = %status, "container stop failed")
                }
                Err(e) => tracing::warn!(container = %name, error = %e, "container stop failed"),
            }
        })
    }

    /// 容器名：hive-<folder>-<毫秒时间戳>
    fn container_name(spec: &SessionSpec) -> String {
        let suffix = if spec.is_delegated() { "-d" } else { "" };
        format!(
            "hive-{}{}-{}",
            spec.group.folder,
            suffix,
            chrono::Utc::now().timestamp_millis()
        )
    }

    /// `run` 之后的全部参数
    pub fn build_args(&self, spec: &SessionSpec, name: &str) -> Vec<String> {
        let ws = self.container_workspace.trim_end_matches('/');
        let group_dir = self.groups_dir.join(&spec.group.folder);
        let ipc_dir = self.ipc.group(&spec.group.folder).dir().to_path_buf();

        let mut args = vec![
            "run".to_string(),
            "-i".to_string(),
            "--rm".to_string(),
            "--name".to_string(),
            name.to_string(),
            "-e".to_string(),
            format!("HIVE_GROUP_FOLDER={}", spec.group.folder),
            "-e".to_string(),
            format!("HIVE_IPC_DIR={}/ipc", ws),
            "-v".to_string(),
            format!("{}:{}/group", group_dir.display(), ws),
            "-v".to_string(),
            format!("{}:{}/ipc", ipc_dir.display(), ws),
        ];

        let extra = spec
            .group
            .container_config
            .as_ref()
            .map(|c| c.additional_mounts.as_slice())
            .unwrap_or_default();
        for mount in extra {
            match mount_arg(mount, ws) {
                Ok(arg) => {
                    args.push("-v".to_string());
                    args.push(arg);
                }
                Err(reason) => {
                    tracing::warn!(
                        folder = %spec.group.folder,
                        host_path = %mount.host_path.display(),
                        reason = %reason,
                        "skipping additional mount"
                    );
                }
            }
        }

        args.push(self.image.clone());
        args
    }
}

/// 校验额外挂载并生成 `-v` 参数
fn mount_arg(mount: &AdditionalMount, workspace: &str) -> Result<String, String> {
    if !mount.host_path.is_absolute() {
        return Err("host path must be absolute".to_string());
    }
    if !mount.host_path.exists() {
        return Err("host path does not exist".to_string());
    }
    let name = match &mount.container_path {
        Some(p) => p.trim_matches('/').to_string(),
        None => mount
            .host_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| "cannot derive container path".to_string())?,
    };
    if name.is_empty()
        || Path::new(&name)
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
    {
        return Err(format!("invalid container path {:?}", name));
    }
    let mut arg = format!("{}:{}/extra/{}", mount.host_path.display(), workspace, name);
    if mount.readonly {
        arg.push_str(":ro");
    }
    Ok(arg)
}

#[async_trait]
impl SessionRunner for ContainerRunner {
    async fn run(
        &self,
        spec: SessionSpec,
        outputs: mpsc::UnboundedSender<SessionOutput>,
        cancel: CancellationToken,
    ) -> Result<SessionSummary, HiveError> {
        std::fs::create_dir_all(self.groups_dir.join(&spec.group.folder))?;
        self.ipc.group(&spec.group.folder).ensure()?;

        let name = Self::container_name(&spec);
        let mut cmd = Command::new(&self.runtime);
        cmd.args(self.build_args(&spec, &name));

        tracing::info!(
            container = %name,
            folder = %spec.group.folder,
            delegated = spec.is_delegated(),
            resumed = spec.session_id.is_some(),
            "spawning session container"
        );
        let stopper = self.spawn_stopper(&name, cancel.clone());
        let result = run_process(cmd, &spec.input(), outputs, cancel.clone()).await;
        if !cancel.is_cancelled() {
            stopper.abort();
        }
        result
    }
}

/// 启动子进程、写入输入、流式解析输出；cancel 时杀掉子进程（kill_on_drop 兜底）
pub async fn run_process(
    mut cmd: Command,
    input: &SessionInput,
    outputs: mpsc::UnboundedSender<SessionOutput>,
    cancel: CancellationToken,
) -> Result<SessionSummary, HiveError> {
    cmd.stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd
        .spawn()
        .map_err(|e| HiveError::Runner(format!("failed to start session: {}", e)))?;

    if let Some(mut stdin) = child.stdin.take() {
        let payload = serde_json::to_vec(input)?;
        // 子进程可能根本不读 stdin，写失败不算致命
        if let Err(e) = stdin.write_all(&payload).await {
            tracing::debug!(error = %e, "session closed stdin early");
        }
        drop(stdin);
    }

    let stderr_task = child.stderr.take().map(|stderr| {
        tokio::spawn(async move {
            let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::debug!(target: "hive::session", "{}", line);
                if tail.len() == STDERR_TAIL_LINES {
                    tail.pop_front();
                }
                tail.push_back(line);
            }
            Vec::from(tail).join("\n")
        })
    });

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| HiveError::Runner("session stdout unavailable".to_string()))?;
    let mut lines = BufReader::new(stdout).lines();
    let mut parser = OutputParser::new();
    let mut session_id = None;
    let mut agent_error = None;

    loop {
        tokio::select! {
            line = lines.next_line() => {
                match line? {
                    Some(line) => match parser.feed(&line) {
                        Some(ParsedOutput::Output(out)) => {
                            if out.session_id.is_some() {
                                session_id = out.session_id.clone();
                            }
                            let _ = outputs.send(out);
                        }
                        Some(ParsedOutput::AgentError(e)) => {
                            tracing::warn!(error = %e, "session reported an error");
                            agent_error = Some(e);
                        }
                        Some(ParsedOutput::Malformed(e)) => {
                            tracing::warn!(error = %e, "malformed session output block");
                        }
                        None => {}
                    },
                    None => break,
                }
            }
            _ = cancel.cancelled() => {
                tracing::info!("terminating session process");
                let _ = child.kill().await;
                return Err(HiveError::Runner("session terminated".to_string()));
            }
        }
    }

    let status = tokio::select! {
        status = child.wait() => status?,
        _ = cancel.cancelled() => {
            let _ = child.kill().await;
            return Err(HiveError::Runner("session terminated".to_string()));
        }
    };
    let stderr_tail = match stderr_task {
        Some(task) => task.await.unwrap_or_default(),
        None => String::new(),
    };

    if !status.success() {
        let code = status
            .code()
            .map(|c| c.to_string())
            .unwrap_or_else(|| "signal".to_string());
        let detail = agent_error.unwrap_or(stderr_tail);
        return Err(HiveError::Runner(format!("session exited with {}: {}", code, detail.trim())));
    }
    if let Some(e) = agent_error {
        return Err(HiveError::Runner(e));
    }

    Ok(SessionSummary {
        result: if parser.markers_seen == 0 {
            parser.plain_text()
        } else {
            None
        },
        session_id,
    })
}
