//! 会话 ID 存储：folder -> 上一次 agent 会话 ID
//!
//! 普通对话轮次会续接该会话；委派产生的会话从不读取也从不写回。

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tokio::sync::Mutex;

use crate::core::HiveError;

pub struct SessionStore {
    sessions: Mutex<HashMap<String, String>>,
    path: Option<PathBuf>,
}

impl SessionStore {
    pub fn in_memory() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            path: None,
        }
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, HiveError> {
        let path = path.as_ref().to_path_buf();
        let sessions = match std::fs::read_to_string(&path) {
            Ok(data) => serde_json::from_str(&data)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            sessions: Mutex::new(sessions),
            path: Some(path),
        })
    }

    pub async fn get(&self, folder: &str) -> Option<String> {
        self.sessions.lock().await.get(folder).cloned()
    }

    pub async fn set(&self, folder: &str, session_id: impl Into<String>) -> Result<(), HiveError> {
        let mut sessions = self.sessions.lock().await;
        let mut next = sessions.clone();
        next.insert(folder.to_string(), session_id.into());
        self.persist(&next).await?;
        *sessions = next;
        Ok(())
    }

    pub async fn clear(&self, folder: &str) -> Result<(), HiveError> {
        let mut sessions = self.sessions.lock().await;
        if !sessions.contains_key(folder) {
            return Ok(());
        }
        let mut next = sessions.clone();
        next.remove(folder);
        self.persist(&next).await?;
        *sessions = next;
        Ok(())
    }

    async fn persist(&self, sessions: &HashMap<String, String>) -> Result<(), HiveError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_string_pretty(sessions)?).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_get_clear_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sessions.json");
        let store = SessionStore::load(&path).unwrap();
        store.set("main", "sess-1").await.unwrap();

        let reloaded = SessionStore::load(&path).unwrap();
        assert_eq!(reloaded.get("main").await.as_deref(), Some("sess-1"));

        reloaded.clear("main").await.unwrap();
        assert!(SessionStore::load(&path).unwrap().get("main").await.is_none());
    }
}
