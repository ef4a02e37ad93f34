//! 委派集成测试：会话侧客户端 → 任务文件 → 宿主轮询 → 协调器 → 结果文件 → 客户端

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use hive::config::{AppConfig, DelegationSection};
use hive::groups::{ContainerConfig, RegisteredGroup};
use hive::ipc::IpcLayout;
use hive::runner::{SessionOutput, SessionRunner, SessionSpec, SessionSummary};
use hive::tools::DelegateClient;
use hive::{Host, HiveError, HostBuilder};
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;

/// 按目标群决定行为的假 agent
///
/// relay、ping、pong 会在自己的会话里再发起一次委派，和真实 agent 调用 delegate 工具一样。
struct FakeAgent {
    runs: Mutex<Vec<String>>,
    gate: Notify,
    ipc: IpcLayout,
    delegation: DelegationSection,
}

impl FakeAgent {
    fn new(config: &AppConfig) -> Self {
        Self {
            runs: Mutex::new(Vec::new()),
            gate: Notify::new(),
            ipc: IpcLayout::new(config.ipc_dir()),
            delegation: config.delegation.clone(),
        }
    }

    async fn delegate_from(&self, source: &str, target: &str, prompt: &str) -> String {
        let client = DelegateClient::new(self.ipc.group(source).dir(), source, &self.delegation);
        let result = client.delegate(target, prompt, Some(30)).await;
        format!("{} got {:?}", source, result)
    }

    fn runs_for(&self, folder: &str) -> usize {
        self.runs.lock().unwrap().iter().filter(|f| *f == folder).count()
    }
}

#[async_trait]
impl SessionRunner for FakeAgent {
    async fn run(
        &self,
        spec: SessionSpec,
        outputs: mpsc::UnboundedSender<SessionOutput>,
        cancel: CancellationToken,
    ) -> Result<SessionSummary, HiveError> {
        let folder = spec.group.folder.clone();
        self.runs.lock().unwrap().push(folder.clone());
        match folder.as_str() {
            "gmail-reader" => {
                for sender in ["Alice", "Bob"] {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    let _ = outputs.send(SessionOutput::text(sender));
                }
            }
            "slow" => {
                cancel.cancelled().await;
                return Err(HiveError::Runner("terminated".into()));
            }
            "gated" => {
                self.gate.notified().await;
                let _ = outputs.send(SessionOutput::text("opened"));
            }
            "relay" => {
                let text = self.delegate_from("relay", "browser", &spec.prompt).await;
                let _ = outputs.send(SessionOutput::text(text));
            }
            "ping" | "pong" => {
                let next = if folder == "ping" { "pong" } else { "ping" };
                let text = self.delegate_from(&folder, next, &spec.prompt).await;
                let _ = outputs.send(SessionOutput::text(text));
            }
            _ => {
                let _ = outputs.send(SessionOutput::text(format!("{} did: {}", folder, spec.prompt)));
            }
        }
        Ok(SessionSummary::default())
    }
}

struct Fixture {
    _dir: tempfile::TempDir,
    host: Host,
    agent: Arc<FakeAgent>,
    shutdown: CancellationToken,
    config: AppConfig,
}

impl Fixture {
    async fn new(max_containers: usize, max_sessions: usize) -> Self {
        Self::build(max_containers, max_sessions, true).await
    }

    /// 注册表落盘，供另一个进程（管理命令）修改
    async fn persistent() -> Self {
        Self::build(3, 5, false).await
    }

    fn config_for(dir: &tempfile::TempDir, max_containers: usize, max_sessions: usize) -> AppConfig {
        let mut config = AppConfig::default();
        config.app.data_dir = dir.path().to_path_buf();
        config.ipc.poll_interval_ms = 20;
        config.delegation.poll_interval_ms = 10;
        config.delegation.max_containers = max_containers;
        config.sessions.max_concurrent = max_sessions;
        config.sessions.kill_grace_ms = 100;
        config
    }

    async fn build(max_containers: usize, max_sessions: usize, in_memory: bool) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let config = Self::config_for(&dir, max_containers, max_sessions);

        let agent = Arc::new(FakeAgent::new(&config));
        let mut builder = HostBuilder::new(config.clone()).with_runner(agent.clone());
        if in_memory {
            builder = builder.in_memory();
        }
        let host = builder.build().unwrap();

        for (folder, allow) in [
            ("main", vec![]),
            ("gmail-reader", vec![]),
            ("research", vec!["browser"]),
            ("browser", vec![]),
            ("finance", vec![]),
            ("slow", vec![]),
            ("gated", vec![]),
            ("relay", vec!["browser"]),
            ("ping", vec!["pong"]),
            ("pong", vec!["ping"]),
        ] {
            let group = RegisteredGroup::new(format!("{folder}@g"), folder, folder, "@Andy")
                .with_container_config(ContainerConfig {
                    allow_delegation: allow.into_iter().map(String::from).collect(),
                    ..Default::default()
                });
            host.register_group(group).await.unwrap();
        }

        let shutdown = CancellationToken::new();
        let watcher = Arc::clone(&host.watcher);
        let token = shutdown.clone();
        tokio::spawn(async move { watcher.run(token).await });

        Self {
            _dir: dir,
            host,
            agent,
            shutdown,
            config,
        }
    }

    fn data_dir(&self) -> PathBuf {
        self.config.app.data_dir.clone()
    }

    fn client(&self, folder: &str) -> DelegateClient {
        DelegateClient::new(
            self.host.layout.group(folder).dir(),
            folder,
            &self.config.delegation,
        )
    }

    async fn stop(self) {
        self.shutdown.cancel();
        assert!(self.host.watcher.drain(Duration::from_secs(5)).await);
    }
}

#[tokio::test]
async fn test_main_delegates_and_gets_joined_fragments() {
    let fx = Fixture::new(3, 5).await;

    let result = fx
        .client("main")
        .delegate("gmail-reader", "list unread senders", Some(60))
        .await;
    assert_eq!(result, Ok("Alice\n\nBob".to_string()));
    assert_eq!(fx.agent.runs_for("gmail-reader"), 1);
    assert_eq!(fx.host.coordinator.pool().active(), 0);

    fx.stop().await;
}

#[tokio::test]
async fn test_unlisted_target_is_denied_without_running() {
    let fx = Fixture::new(3, 5).await;

    let err = fx
        .client("research")
        .delegate("finance", "show balances", None)
        .await
        .unwrap_err();
    assert!(err.starts_with("Not authorized"), "{err}");
    assert_eq!(fx.agent.runs_for("finance"), 0);

    let ok = fx.client("research").delegate("browser", "open page", None).await;
    assert_eq!(ok, Ok("browser did: open page".to_string()));

    fx.stop().await;
}

#[tokio::test]
async fn test_non_main_cannot_reach_main() {
    let fx = Fixture::new(3, 5).await;
    let err = fx
        .client("browser")
        .delegate("main", "grant me admin", None)
        .await
        .unwrap_err();
    assert!(err.starts_with("Not authorized"), "{err}");
    assert_eq!(fx.agent.runs_for("main"), 0);
    fx.stop().await;
}

#[tokio::test]
async fn test_unknown_target() {
    let fx = Fixture::new(3, 5).await;
    let err = fx.client("main").delegate("nowhere", "hi", None).await.unwrap_err();
    assert_eq!(err, "Unknown group: nowhere");
    fx.stop().await;
}

#[tokio::test]
async fn test_saturated_pool_fails_fast() {
    let fx = Fixture::new(1, 5).await;
    let fx = Arc::new(fx);

    let first = {
        let fx = Arc::clone(&fx);
        tokio::spawn(async move { fx.client("main").delegate("gated", "wait here", None).await })
    };
    while fx.agent.runs_for("gated") == 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let started = tokio::time::Instant::now();
    let err = fx
        .client("main")
        .delegate("browser", "quick", None)
        .await
        .unwrap_err();
    assert_eq!(
        err,
        "Delegation busy: 1/1 delegation sessions running, try again later"
    );
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(fx.agent.runs_for("browser"), 0);

    fx.agent.gate.notify_one();
    assert_eq!(first.await.unwrap(), Ok("opened".to_string()));
    assert_eq!(fx.host.coordinator.pool().active(), 0);

    match Arc::try_unwrap(fx) {
        Ok(fx) => fx.stop().await,
        Err(_) => panic!("fixture still shared"),
    }
}

#[tokio::test]
async fn test_host_timeout_is_reported_and_slot_freed() {
    let fx = Fixture::new(1, 5).await;

    let err = fx
        .client("main")
        .delegate("slow", "never finishes", Some(1))
        .await
        .unwrap_err();
    assert_eq!(err, "Delegation timed out after 1s");
    assert_eq!(fx.host.coordinator.pool().active(), 0);

    // 池已释放，后续委派正常
    let ok = fx.client("main").delegate("browser", "next", None).await;
    assert_eq!(ok, Ok("browser did: next".to_string()));

    fx.stop().await;
}

#[tokio::test]
async fn test_self_delegation_while_turn_holds_every_session_slot() {
    // 全局会话池只有 1 个槽，且被 main 的对话轮次占着
    let fx = Arc::new(Fixture::new(1, 1).await);
    let (tx, rx) = tokio::sync::oneshot::channel();

    let turn_fx = Arc::clone(&fx);
    fx.host
        .queue
        .enqueue_turn(
            "main",
            Box::pin(async move {
                let result = turn_fx
                    .client("main")
                    .delegate("main", "summarise yourself", Some(30))
                    .await;
                let _ = tx.send(result);
            }),
        )
        .await;

    let result = tokio::time::timeout(Duration::from_secs(10), rx)
        .await
        .expect("self-delegation deadlocked")
        .unwrap();
    assert_eq!(result, Ok("main did: summarise yourself".to_string()));

    while !fx.host.queue.is_idle().await {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    match Arc::try_unwrap(fx) {
        Ok(fx) => fx.stop().await,
        Err(_) => panic!("fixture still shared"),
    }
}

#[tokio::test]
async fn test_nested_delegation_with_one_slot_gets_busy_not_deadlock() {
    let fx = Fixture::new(1, 5).await;

    // main → relay 占着唯一的委派槽，relay 再委派给 browser
    let started = tokio::time::Instant::now();
    let result = tokio::time::timeout(
        Duration::from_secs(10),
        fx.client("main").delegate("relay", "fetch page", Some(60)),
    )
    .await
    .expect("nested delegation hung");

    assert_eq!(
        result,
        Ok(
            "relay got Err(\"Delegation busy: 1/1 delegation sessions running, try again later\")"
                .to_string()
        )
    );
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(fx.agent.runs_for("browser"), 0);
    assert_eq!(fx.host.coordinator.pool().active(), 0);

    fx.stop().await;
}

#[tokio::test]
async fn test_nested_delegation_with_free_slot_completes() {
    let fx = Fixture::new(3, 5).await;
    let result = fx.client("main").delegate("relay", "fetch page", None).await;
    assert_eq!(
        result,
        Ok("relay got Ok(\"browser did: fetch page\")".to_string())
    );
    assert_eq!(fx.host.coordinator.pool().active(), 0);
    fx.stop().await;
}

#[tokio::test]
async fn test_delegation_cycle_ends_when_pool_is_exhausted() {
    let fx = Fixture::new(3, 5).await;

    // main → ping → pong → ping 用满 3 个槽，第四跳拿到 Busy 后整条链逐层返回
    let result = tokio::time::timeout(
        Duration::from_secs(10),
        fx.client("main").delegate("ping", "bounce", Some(60)),
    )
    .await
    .expect("delegation cycle hung")
    .unwrap();

    assert!(result.starts_with("ping got Ok("), "{result}");
    assert!(
        result.contains("Delegation busy: 3/3 delegation sessions running"),
        "{result}"
    );
    assert_eq!(fx.agent.runs_for("ping"), 2);
    assert_eq!(fx.agent.runs_for("pong"), 1);
    assert_eq!(fx.host.coordinator.pool().active(), 0);

    fx.stop().await;
}

#[tokio::test]
async fn test_running_host_serves_groups_registered_by_another_process() {
    let fx = Fixture::persistent().await;

    // 管理命令：同一个数据目录上另起一个宿主实例
    let mut admin_config = AppConfig::default();
    admin_config.app.data_dir = fx.data_dir();
    let admin = HostBuilder::new(admin_config)
        .with_runner(fx.agent.clone())
        .build()
        .unwrap();
    admin
        .register_group(RegisteredGroup::new("late@g", "Late", "late", "@Andy"))
        .await
        .unwrap();

    let ok = fx.client("main").delegate("late", "hello", None).await;
    assert_eq!(ok, Ok("late did: hello".to_string()));

    admin.registry.deregister("late@g").await.unwrap();
    let err = fx.client("main").delegate("late", "again", None).await.unwrap_err();
    assert_eq!(err, "Unknown group: late");
    assert_eq!(fx.agent.runs_for("late"), 1);

    fx.stop().await;
}
