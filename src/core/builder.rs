//! 宿主构建器：统一的组件装配逻辑
//!
//! 命令行和集成测试都从这里拿到同一套注册表、池、队列、协调器与轮询器，
//! 区别只在 SessionRunner（真实容器或脚本化 runner）和挂接的渠道。

use std::sync::Arc;
use std::time::Duration;

use crate::config::AppConfig;
use crate::core::HiveError;
use crate::delegation::{DelegationCoordinator, DelegationSettings};
use crate::groups::{GroupRegistry, RegisteredGroup, SessionStore};
use crate::ipc::{IpcLayout, RequestLedger, TaskWatcher};
use crate::queue::{DelegationPool, GroupQueue, SessionPool};
use crate::router::{Channel, MessageRouter};
use crate::runner::{ContainerRunner, SessionRunner};

const REGISTRY_FILE: &str = "registered_groups.json";
const SESSIONS_FILE: &str = "sessions.json";

pub struct HostBuilder {
    config: AppConfig,
    runner: Option<Arc<dyn SessionRunner>>,
    channels: Vec<Arc<dyn Channel>>,
    in_memory: bool,
}

impl HostBuilder {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config: config.normalized(),
            runner: None,
            channels: Vec::new(),
            in_memory: false,
        }
    }

    /// 替换默认的容器 runner
    pub fn with_runner(mut self, runner: Arc<dyn SessionRunner>) -> Self {
        self.runner = Some(runner);
        self
    }

    pub fn with_channel(mut self, channel: Arc<dyn Channel>) -> Self {
        self.channels.push(channel);
        self
    }

    /// 注册表与会话表不落盘
    pub fn in_memory(mut self) -> Self {
        self.in_memory = true;
        self
    }

    pub fn build(self) -> Result<Host, HiveError> {
        let config = self.config;
        let data_dir = config.app.data_dir.clone();
        std::fs::create_dir_all(&data_dir)?;

        let main_folder = config.app.main_folder.clone();
        let (registry, sessions) = if self.in_memory {
            (GroupRegistry::in_memory(main_folder), SessionStore::in_memory())
        } else {
            (
                GroupRegistry::load(data_dir.join(REGISTRY_FILE), main_folder)?,
                SessionStore::load(data_dir.join(SESSIONS_FILE))?,
            )
        };
        let registry = Arc::new(registry);
        let sessions = Arc::new(sessions);

        let runner: Arc<dyn SessionRunner> = match self.runner {
            Some(runner) => runner,
            None => Arc::new(ContainerRunner::new(&config)),
        };

        let layout = IpcLayout::new(config.ipc_dir());
        let queue = Arc::new(GroupQueue::new(Arc::new(SessionPool::new(
            config.sessions.max_concurrent,
        ))));
        let coordinator = Arc::new(DelegationCoordinator::new(
            Arc::clone(&registry),
            Arc::clone(&runner),
            Arc::new(DelegationPool::new(config.delegation.max_containers)),
            layout.clone(),
            Arc::new(RequestLedger::default()),
            DelegationSettings::from_config(&config),
        ));
        let watcher = Arc::new(TaskWatcher::new(
            layout.clone(),
            Arc::clone(&registry),
            Arc::clone(&coordinator),
            Duration::from_millis(config.ipc.poll_interval_ms.max(1)),
        ));

        let router = MessageRouter::new(
            &config,
            Arc::clone(&registry),
            Arc::clone(&sessions),
            Arc::clone(&queue),
            runner,
        );
        for channel in self.channels {
            router.add_channel(channel);
        }

        tracing::info!(
            data_dir = %data_dir.display(),
            max_sessions = config.sessions.max_concurrent,
            max_delegations = config.delegation.max_containers,
            "host assembled"
        );

        Ok(Host {
            config,
            layout,
            registry,
            sessions,
            queue,
            coordinator,
            watcher,
            router: Arc::new(router),
        })
    }
}

/// 装配完成的宿主
pub struct Host {
    pub config: AppConfig,
    pub layout: IpcLayout,
    pub registry: Arc<GroupRegistry>,
    pub sessions: Arc<SessionStore>,
    pub queue: Arc<GroupQueue>,
    pub coordinator: Arc<DelegationCoordinator>,
    pub watcher: Arc<TaskWatcher>,
    pub router: Arc<MessageRouter>,
}

impl Host {
    /// 注册新群并建好它的工作区与 IPC 目录
    pub async fn register_group(&self, group: RegisteredGroup) -> Result<(), HiveError> {
        let folder = group.folder.clone();
        self.registry.register(group).await?;
        std::fs::create_dir_all(self.config.groups_dir().join(&folder))?;
        self.layout.group(&folder).ensure()?;
        Ok(())
    }

    /// 关闭时等待在途委派的宽限期：最长委派超时加上进程终止宽限
    pub fn drain_grace(&self) -> Duration {
        Duration::from_secs(self.config.delegation.max_timeout_secs)
            + Duration::from_millis(self.config.sessions.kill_grace_ms)
    }
}
