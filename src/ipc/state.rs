//! 请求状态机：pending → claimed → completed|failed → consumed|expired
//!
//! 时间戳由调用方传入，测试可以直接构造任意时刻而不必真实等待。
//! 请求方看不到 claimed，允许 pending 直接跳到 completed/failed；放弃等待则 pending → expired。

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex;

use crate::core::DelegationError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestState {
    Pending,
    Claimed,
    Completed,
    Failed,
    Consumed,
    Expired,
}

impl RequestState {
    pub fn can_transition_to(self, next: RequestState) -> bool {
        use RequestState::*;
        matches!(
            (self, next),
            (Pending, Claimed)
                | (Pending, Completed)
                | (Pending, Failed)
                | (Pending, Expired)
                | (Claimed, Completed)
                | (Claimed, Failed)
                | (Completed, Consumed)
                | (Completed, Expired)
                | (Failed, Consumed)
                | (Failed, Expired)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Consumed | Self::Expired)
    }

    /// 宿主侧视角：completed / failed 之后宿主不再关心
    pub fn is_finished(self) -> bool {
        matches!(self, Self::Completed | Self::Failed) || self.is_terminal()
    }
}

#[derive(Debug, Clone)]
pub struct RequestRecord {
    pub request_id: String,
    pub state: RequestState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// 每次进入某状态的时间
    pub history: Vec<(RequestState, DateTime<Utc>)>,
}

impl RequestRecord {
    pub fn new(request_id: impl Into<String>, state: RequestState, at: DateTime<Utc>) -> Self {
        Self {
            request_id: request_id.into(),
            state,
            created_at: at,
            updated_at: at,
            history: vec![(state, at)],
        }
    }

    pub fn transition(&mut self, next: RequestState, at: DateTime<Utc>) -> Result<(), DelegationError> {
        if !self.state.can_transition_to(next) {
            return Err(DelegationError::Protocol(format!(
                "request {} cannot move from {:?} to {:?}",
                self.request_id, self.state, next
            )));
        }
        self.state = next;
        self.updated_at = at;
        self.history.push((next, at));
        Ok(())
    }
}

/// 宿主侧台账：保证同一个 requestId 最多被处理一次
pub struct RequestLedger {
    records: Mutex<HashMap<String, RequestRecord>>,
    /// 已结束记录保留多久（过后可被 prune）
    retention: Duration,
}

impl RequestLedger {
    pub fn new(retention: Duration) -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            retention,
        }
    }

    /// 登记一次认领；同一 id 已出现过则拒绝
    pub async fn begin(&self, request_id: &str, at: DateTime<Utc>) -> Result<(), DelegationError> {
        let mut records = self.records.lock().await;
        if records.contains_key(request_id) {
            return Err(DelegationError::Protocol(format!(
                "duplicate requestId {}",
                request_id
            )));
        }
        records.insert(
            request_id.to_string(),
            RequestRecord::new(request_id, RequestState::Claimed, at),
        );
        Ok(())
    }

    pub async fn finish(
        &self,
        request_id: &str,
        success: bool,
        at: DateTime<Utc>,
    ) -> Result<(), DelegationError> {
        let next = if success {
            RequestState::Completed
        } else {
            RequestState::Failed
        };
        let mut records = self.records.lock().await;
        let record = records.get_mut(request_id).ok_or_else(|| {
            DelegationError::Protocol(format!("request {} was never claimed", request_id))
        })?;
        record.transition(next, at)
    }

    pub async fn get(&self, request_id: &str) -> Option<RequestRecord> {
        self.records.lock().await.get(request_id).cloned()
    }

    pub async fn in_flight(&self) -> usize {
        self.records
            .lock()
            .await
            .values()
            .filter(|r| !r.state.is_finished())
            .count()
    }

    /// 删除超过保留期的已结束记录，返回删除数
    pub async fn prune(&self, now: DateTime<Utc>) -> usize {
        let mut records = self.records.lock().await;
        let before = records.len();
        records.retain(|_, r| !(r.state.is_finished() && now - r.updated_at > self.retention));
        before - records.len()
    }
}

impl Default for RequestLedger {
    fn default() -> Self {
        Self::new(Duration::hours(24))
    }
}
