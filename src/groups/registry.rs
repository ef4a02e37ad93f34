//! 群组注册表
//!
//! 持久化为 data/registered_groups.json（jid -> RegisteredGroup），写入走临时文件 + rename。

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::core::HiveError;

/// 额外挂载：宿主路径 -> 容器内 /workspace/extra/<container_path>
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdditionalMount {
    pub host_path: PathBuf,
    /// 容器内相对 /workspace/extra 的路径，缺省取宿主路径的最后一段
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_path: Option<String>,
    #[serde(default = "default_readonly")]
    pub readonly: bool,
}

fn default_readonly() -> bool {
    true
}

/// 群级策略；字段缺省表示使用系统默认值
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerConfig {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub additional_mounts: Vec<AdditionalMount>,
    /// 会话执行超时（秒）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    /// 本群会话可以委派的目标群 folder 列表
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allow_delegation: Vec<String>,
}

/// 被托管的对话
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisteredGroup {
    pub jid: String,
    pub name: String,
    pub folder: String,
    pub trigger: String,
    pub added_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_config: Option<ContainerConfig>,
    /// 非主群默认需要触发词才会唤起会话
    #[serde(default = "default_requires_trigger")]
    pub requires_trigger: bool,
}

fn default_requires_trigger() -> bool {
    true
}

impl RegisteredGroup {
    pub fn new(
        jid: impl Into<String>,
        name: impl Into<String>,
        folder: impl Into<String>,
        trigger: impl Into<String>,
    ) -> Self {
        Self {
            jid: jid.into(),
            name: name.into(),
            folder: folder.into(),
            trigger: trigger.into(),
            added_at: Utc::now(),
            container_config: None,
            requires_trigger: true,
        }
    }

    pub fn with_container_config(mut self, config: ContainerConfig) -> Self {
        self.container_config = Some(config);
        self
    }

    /// 是否允许委派到 `folder`（只看本群策略，不含主群/自身规则）
    pub fn allows_delegation_to(&self, folder: &str) -> bool {
        self.container_config
            .as_ref()
            .map(|c| c.allow_delegation.iter().any(|f| f == folder))
            .unwrap_or(false)
    }

    pub fn timeout_secs(&self) -> Option<u64> {
        self.container_config.as_ref().and_then(|c| c.timeout)
    }
}

fn folder_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_-]{0,63}$").expect("static folder pattern")
    })
}

/// 校验 folder：只允许字母数字、下划线、连字符，防止路径穿越
pub fn validate_folder(folder: &str) -> Result<(), HiveError> {
    if folder_pattern().is_match(folder) {
        Ok(())
    } else {
        Err(HiveError::Registry(format!("invalid group folder: {:?}", folder)))
    }
}

/// 注册表文件的指纹：修改时间 + 长度
type FileStamp = (Option<SystemTime>, u64);

fn stamp_of(meta: &std::fs::Metadata) -> FileStamp {
    (meta.modified().ok(), meta.len())
}

struct Snapshot {
    groups: HashMap<String, RegisteredGroup>,
    /// 最近一次读入或写出时文件的指纹
    stamp: Option<FileStamp>,
}

/// 群组注册表：jid 为主键，folder 唯一
///
/// `hive groups ...` 在另一个进程里改写同一个文件，运行中的宿主靠 [`GroupRegistry::refresh`]
/// 在文件变化时重新加载。
pub struct GroupRegistry {
    inner: RwLock<Snapshot>,
    /// None 表示纯内存（测试用）
    path: Option<PathBuf>,
    main_folder: String,
}

impl GroupRegistry {
    /// 纯内存注册表
    pub fn in_memory(main_folder: impl Into<String>) -> Self {
        Self {
            inner: RwLock::new(Snapshot {
                groups: HashMap::new(),
                stamp: None,
            }),
            path: None,
            main_folder: main_folder.into(),
        }
    }

    /// 从 JSON 文件加载；文件不存在视为空注册表
    pub fn load(path: impl AsRef<Path>, main_folder: impl Into<String>) -> Result<Self, HiveError> {
        let path = path.as_ref().to_path_buf();
        let (groups, stamp) = match std::fs::read_to_string(&path) {
            Ok(data) => {
                let stamp = std::fs::metadata(&path).ok().map(|m| stamp_of(&m));
                (serde_json::from_str(&data)?, stamp)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => (HashMap::new(), None),
            Err(e) => return Err(e.into()),
        };
        tracing::info!(count = groups.len(), path = %path.display(), "Loaded registered groups");
        Ok(Self {
            inner: RwLock::new(Snapshot { groups, stamp }),
            path: Some(path),
            main_folder: main_folder.into(),
        })
    }

    pub fn main_folder(&self) -> &str {
        &self.main_folder
    }

    pub fn is_main(&self, folder: &str) -> bool {
        folder == self.main_folder
    }

    /// 文件被其它进程改过就重新加载；返回是否发生了重载
    pub async fn refresh(&self) -> Result<bool, HiveError> {
        let mut inner = self.inner.write().await;
        self.sync_from_disk(&mut inner).await
    }

    async fn sync_from_disk(&self, inner: &mut Snapshot) -> Result<bool, HiveError> {
        let Some(path) = &self.path else {
            return Ok(false);
        };
        let stamp = match tokio::fs::metadata(path).await {
            Ok(meta) => stamp_of(&meta),
            // 文件被删掉时保留内存中的状态
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        if inner.stamp == Some(stamp) {
            return Ok(false);
        }
        let data = tokio::fs::read_to_string(path).await?;
        let groups: HashMap<String, RegisteredGroup> = serde_json::from_str(&data)?;
        tracing::info!(
            before = inner.groups.len(),
            after = groups.len(),
            "Registered groups changed on disk, reloaded"
        );
        inner.groups = groups;
        inner.stamp = Some(stamp);
        Ok(true)
    }

    /// 在副本上应用修改，落盘成功后才替换内存状态
    async fn commit<T>(
        &self,
        change: impl FnOnce(&mut HashMap<String, RegisteredGroup>) -> Result<T, HiveError>,
    ) -> Result<T, HiveError> {
        let mut inner = self.inner.write().await;
        if let Err(e) = self.sync_from_disk(&mut inner).await {
            tracing::warn!(error = %e, "cannot reload registered groups before update");
        }
        let mut next = inner.groups.clone();
        let value = change(&mut next)?;
        let stamp = self.persist(&next).await?;
        inner.groups = next;
        inner.stamp = stamp;
        Ok(value)
    }

    /// 注册新群；folder 非法或已被占用时拒绝
    pub async fn register(&self, group: RegisteredGroup) -> Result<(), HiveError> {
        validate_folder(&group.folder)?;
        self.commit(|groups| {
            if groups.contains_key(&group.jid) {
                return Err(HiveError::Registry(format!("jid already registered: {}", group.jid)));
            }
            if groups.values().any(|g| g.folder == group.folder) {
                return Err(HiveError::Registry(format!("folder already in use: {}", group.folder)));
            }
            tracing::info!(jid = %group.jid, folder = %group.folder, "Registering group");
            groups.insert(group.jid.clone(), group);
            Ok(())
        })
        .await
    }

    /// 注销（不删除工作区与历史）
    pub async fn deregister(&self, jid: &str) -> Result<RegisteredGroup, HiveError> {
        let removed = self
            .commit(|groups| {
                groups
                    .remove(jid)
                    .ok_or_else(|| HiveError::Registry(format!("jid not registered: {}", jid)))
            })
            .await?;
        tracing::info!(jid = %jid, folder = %removed.folder, "Deregistered group");
        Ok(removed)
    }

    pub async fn rename(&self, jid: &str, name: impl Into<String>) -> Result<(), HiveError> {
        let name = name.into();
        self.commit(|groups| {
            let group = groups
                .get_mut(jid)
                .ok_or_else(|| HiveError::Registry(format!("jid not registered: {}", jid)))?;
            group.name = name;
            Ok(())
        })
        .await
    }

    pub async fn reconfigure(
        &self,
        jid: &str,
        config: Option<ContainerConfig>,
    ) -> Result<(), HiveError> {
        self.commit(|groups| {
            let group = groups
                .get_mut(jid)
                .ok_or_else(|| HiveError::Registry(format!("jid not registered: {}", jid)))?;
            group.container_config = config;
            Ok(())
        })
        .await
    }

    pub async fn get_by_jid(&self, jid: &str) -> Option<RegisteredGroup> {
        self.inner.read().await.groups.get(jid).cloned()
    }

    pub async fn get_by_folder(&self, folder: &str) -> Option<RegisteredGroup> {
        self.inner
            .read()
            .await
            .groups
            .values()
            .find(|g| g.folder == folder)
            .cloned()
    }

    /// 按 folder 排序的全部群
    pub async fn list(&self) -> Vec<RegisteredGroup> {
        let mut all: Vec<_> = self.inner.read().await.groups.values().cloned().collect();
        all.sort_by(|a, b| a.folder.cmp(&b.folder));
        all
    }

    pub async fn folders(&self) -> Vec<String> {
        self.list().await.into_iter().map(|g| g.folder).collect()
    }

    /// 写临时文件后 rename，返回写出后的文件指纹
    async fn persist(
        &self,
        groups: &HashMap<String, RegisteredGroup>,
    ) -> Result<Option<FileStamp>, HiveError> {
        let Some(path) = &self.path else {
            return Ok(None);
        };
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_string_pretty(groups)?).await?;
        tokio::fs::rename(&tmp, path).await?;
        let meta = tokio::fs::metadata(path).await?;
        Ok(Some(stamp_of(&meta)))
    }
}
