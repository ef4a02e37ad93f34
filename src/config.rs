//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `HIVE__*` 覆盖（双下划线表示嵌套，如 `HIVE__DELEGATION__MAX_CONTAINERS=2`）。

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    #[serde(default)]
    pub app: AppSection,
    #[serde(default)]
    pub sessions: SessionsSection,
    #[serde(default)]
    pub delegation: DelegationSection,
    #[serde(default)]
    pub ipc: IpcSection,
    #[serde(default)]
    pub runner: RunnerSection,
}

/// [app] 段：数据目录、助手名、主群目录名
#[derive(Debug, Clone, Deserialize)]
pub struct AppSection {
    /// 数据根目录（groups/、ipc/、registered_groups.json 都在其下）
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default = "default_assistant_name")]
    pub assistant_name: String,
    /// 主群（管理会话）的目录名
    #[serde(default = "default_main_folder")]
    pub main_folder: String,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            assistant_name: default_assistant_name(),
            main_folder: default_main_folder(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_assistant_name() -> String {
    "Andy".to_string()
}

fn default_main_folder() -> String {
    "main".to_string()
}

/// [sessions] 段：普通会话的全局并发上限与执行超时
#[derive(Debug, Clone, Deserialize)]
pub struct SessionsSection {
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    /// 单轮会话的硬超时（秒），可被群配置 containerConfig.timeout 覆盖
    #[serde(default = "default_session_timeout")]
    pub default_timeout_secs: u64,
    /// 请求终止后等待子进程退出的宽限期（毫秒）
    #[serde(default = "default_kill_grace_ms")]
    pub kill_grace_ms: u64,
}

impl Default for SessionsSection {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            default_timeout_secs: default_session_timeout(),
            kill_grace_ms: default_kill_grace_ms(),
        }
    }
}

fn default_max_concurrent() -> usize {
    5
}

fn default_session_timeout() -> u64 {
    1800
}

fn default_kill_grace_ms() -> u64 {
    5000
}

/// [delegation] 段：委派池上限、超时默认值/上限、客户端轮询
#[derive(Debug, Clone, Deserialize)]
pub struct DelegationSection {
    /// 委派专用池大小，与全局会话池互不相交
    #[serde(default = "default_max_containers")]
    pub max_containers: usize,
    #[serde(default = "default_delegation_timeout")]
    pub default_timeout_secs: u64,
    #[serde(default = "default_max_timeout")]
    pub max_timeout_secs: u64,
    /// 请求方轮询结果目录的间隔（毫秒）
    #[serde(default = "default_client_poll_ms")]
    pub poll_interval_ms: u64,
    /// 未被消费的结果文件超过该时长视为过期，下次启动时清理
    pub stale_after_secs: Option<u64>,
}

impl Default for DelegationSection {
    fn default() -> Self {
        Self {
            max_containers: default_max_containers(),
            default_timeout_secs: default_delegation_timeout(),
            max_timeout_secs: default_max_timeout(),
            poll_interval_ms: default_client_poll_ms(),
            stale_after_secs: None,
        }
    }
}

impl DelegationSection {
    /// 把请求里的超时秒数归一化：缺省或 0 用默认值，超过上限截断
    pub fn clamp_timeout(&self, requested: Option<u64>) -> u64 {
        match requested {
            None | Some(0) => self.default_timeout_secs.min(self.max_timeout_secs),
            Some(secs) => secs.min(self.max_timeout_secs),
        }
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(
            self.stale_after_secs
                .unwrap_or(self.max_timeout_secs + 60),
        )
    }
}

fn default_max_containers() -> usize {
    3
}

fn default_delegation_timeout() -> u64 {
    300
}

fn default_max_timeout() -> u64 {
    1800
}

fn default_client_poll_ms() -> u64 {
    500
}

/// [ipc] 段：宿主侧任务目录的轮询间隔
#[derive(Debug, Clone, Deserialize)]
pub struct IpcSection {
    #[serde(default = "default_watch_poll_ms")]
    pub poll_interval_ms: u64,
}

impl Default for IpcSection {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_watch_poll_ms(),
        }
    }
}

fn default_watch_poll_ms() -> u64 {
    1000
}

/// [runner] 段：容器运行时与镜像
#[derive(Debug, Clone, Deserialize)]
pub struct RunnerSection {
    /// docker / podman / container 等兼容 `run -i --rm -v` 的命令
    #[serde(default = "default_runtime")]
    pub runtime: String,
    #[serde(default = "default_image")]
    pub image: String,
    /// 容器内工作区根路径
    #[serde(default = "default_container_workspace")]
    pub container_workspace: String,
}

impl Default for RunnerSection {
    fn default() -> Self {
        Self {
            runtime: default_runtime(),
            image: default_image(),
            container_workspace: default_container_workspace(),
        }
    }
}

fn default_runtime() -> String {
    "docker".to_string()
}

fn default_image() -> String {
    "hive-agent:latest".to_string()
}

fn default_container_workspace() -> String {
    "/workspace".to_string()
}

impl AppConfig {
    /// 把 0 值的并发上限修正为 1，并提示委派池不小于全局池的配置
    pub fn normalized(mut self) -> Self {
        self.sessions.max_concurrent = self.sessions.max_concurrent.max(1);
        self.delegation.max_containers = self.delegation.max_containers.max(1);
        if self.delegation.max_containers >= self.sessions.max_concurrent {
            tracing::warn!(
                max_containers = self.delegation.max_containers,
                max_concurrent = self.sessions.max_concurrent,
                "delegation pool is not smaller than the session pool"
            );
        }
        self
    }

    pub fn groups_dir(&self) -> PathBuf {
        self.app.data_dir.join("groups")
    }

    pub fn ipc_dir(&self) -> PathBuf {
        self.app.data_dir.join("ipc")
    }
}

/// 从 config 目录加载配置，环境变量 HIVE__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 HIVE__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("HIVE")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    let cfg: AppConfig = c.try_deserialize()?;
    Ok(cfg.normalized())
}
