//! 入站消息路由
//!
//! 渠道适配器把平台事件转成 InboundMessage 交给 MessageRouter：
//! 找到注册群 → 非主群检查触发词 → 在该群的 GroupQueue 上排一个轮次。
//! 轮次续接群的上一次 agent 会话，输出片段经拥有该 jid 的 Channel 发回。

use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;

use crate::config::AppConfig;
use crate::core::HiveError;
use crate::groups::{GroupRegistry, RegisteredGroup, SessionStore};
use crate::queue::GroupQueue;
use crate::runner::{RunningSession, SessionRunner, SessionSpec};

/// 聊天渠道：能把文本发回某个会话
#[async_trait]
pub trait Channel: Send + Sync {
    fn name(&self) -> &str;

    /// 该 jid 是否由本渠道负责
    fn owns_jid(&self, jid: &str) -> bool;

    async fn send_message(&self, jid: &str, text: &str) -> Result<(), HiveError>;
}

/// 渠道归一化后的入站消息
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub chat_jid: String,
    pub sender: String,
    pub sender_name: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteDecision {
    /// jid 未注册，忽略
    Unregistered,
    /// 没有触发词
    Ignored,
    Queued,
}

pub struct MessageRouter {
    registry: Arc<GroupRegistry>,
    sessions: Arc<SessionStore>,
    queue: Arc<GroupQueue>,
    runner: Arc<dyn SessionRunner>,
    channels: RwLock<Vec<Arc<dyn Channel>>>,
    turn_timeout: Duration,
    kill_grace: Duration,
}

impl MessageRouter {
    pub fn new(
        config: &AppConfig,
        registry: Arc<GroupRegistry>,
        sessions: Arc<SessionStore>,
        queue: Arc<GroupQueue>,
        runner: Arc<dyn SessionRunner>,
    ) -> Self {
        Self {
            registry,
            sessions,
            queue,
            runner,
            channels: RwLock::new(Vec::new()),
            turn_timeout: Duration::from_secs(config.sessions.default_timeout_secs),
            kill_grace: Duration::from_millis(config.sessions.kill_grace_ms),
        }
    }

    pub fn add_channel(&self, channel: Arc<dyn Channel>) {
        tracing::info!(channel = channel.name(), "channel attached");
        self.channels
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(channel);
    }

    pub async fn route(&self, message: InboundMessage) -> RouteDecision {
        let Some(group) = self.registry.get_by_jid(&message.chat_jid).await else {
            tracing::debug!(jid = %message.chat_jid, "message from unregistered chat");
            return RouteDecision::Unregistered;
        };

        let is_main = self.registry.is_main(&group.folder);
        if !is_main && group.requires_trigger && !matches_trigger(&group.trigger, &message.content) {
            return RouteDecision::Ignored;
        }

        let Some(channel) = self.channel_for(&message.chat_jid) else {
            tracing::warn!(jid = %message.chat_jid, "no channel owns this chat, dropping message");
            return RouteDecision::Ignored;
        };

        let timeout = group
            .timeout_secs()
            .map(Duration::from_secs)
            .unwrap_or(self.turn_timeout);
        let folder = group.folder.clone();
        let prompt = format_prompt(&message);
        let turn = run_turn(TurnContext {
            group,
            is_main,
            prompt,
            chat_jid: message.chat_jid,
            channel,
            sessions: Arc::clone(&self.sessions),
            runner: Arc::clone(&self.runner),
            timeout,
            grace: self.kill_grace,
        });
        self.queue.enqueue_turn(&folder, Box::pin(turn)).await;
        RouteDecision::Queued
    }

    fn channel_for(&self, jid: &str) -> Option<Arc<dyn Channel>> {
        self.channels
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .find(|c| c.owns_jid(jid))
            .cloned()
    }
}

struct TurnContext {
    group: RegisteredGroup,
    is_main: bool,
    prompt: String,
    chat_jid: String,
    channel: Arc<dyn Channel>,
    sessions: Arc<SessionStore>,
    runner: Arc<dyn SessionRunner>,
    timeout: Duration,
    grace: Duration,
}

async fn run_turn(ctx: TurnContext) {
    let folder = ctx.group.folder.clone();
    let session_id = ctx.sessions.get(&folder).await;
    tracing::info!(folder = %folder, resumed = session_id.is_some(), "turn started");

    let spec = SessionSpec::turn(ctx.group.clone(), ctx.prompt.clone(), session_id, ctx.is_main);
    let mut session = RunningSession::start(ctx.runner.clone(), spec, ctx.timeout, ctx.grace);

    let mut latest_session = None;
    let mut delivered = 0usize;
    while let Some(output) = session.next_output().await {
        if output.session_id.is_some() {
            latest_session = output.session_id;
        }
        if let Some(text) = output.text.filter(|t| !t.trim().is_empty()) {
            deliver(&ctx, &folder, &text).await;
            delivered += 1;
        }
    }

    match session.finish().await {
        Ok(summary) => {
            // 没有任何分段时，退回到整段 stdout 摘要
            if delivered == 0 {
                if let Some(text) = summary.result.as_deref().filter(|t| !t.trim().is_empty()) {
                    deliver(&ctx, &folder, text).await;
                }
            }
            if let Some(id) = summary.session_id.or(latest_session) {
                if let Err(e) = ctx.sessions.set(&folder, id).await {
                    tracing::warn!(folder = %folder, error = %e, "failed to persist session id");
                }
            }
            tracing::info!(folder = %folder, "turn finished");
        }
        Err(e) => tracing::error!(folder = %folder, error = %e, "turn failed"),
    }
}

async fn deliver(ctx: &TurnContext, folder: &str, text: &str) {
    if let Err(e) = ctx.channel.send_message(&ctx.chat_jid, text).await {
        tracing::warn!(folder = %folder, channel = ctx.channel.name(), error = %e, "failed to deliver output");
    }
}

/// 触发词必须出现在开头，后面紧跟单词边界；忽略大小写
pub fn matches_trigger(trigger: &str, content: &str) -> bool {
    let trigger = trigger.trim();
    if trigger.is_empty() {
        return true;
    }
    let boundary = if trigger.chars().last().is_some_and(|c| c.is_alphanumeric()) {
        r"\b"
    } else {
        ""
    };
    match Regex::new(&format!("(?i)^{}{}", regex::escape(trigger), boundary)) {
        Ok(re) => re.is_match(content.trim_start()),
        Err(e) => {
            tracing::warn!(trigger = %trigger, error = %e, "invalid trigger pattern");
            false
        }
    }
}

fn xml_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// 把一条消息包装成 agent 的输入
fn format_prompt(message: &InboundMessage) -> String {
    format!(
        "<messages>\n<message sender=\"{}\" time=\"{}\">{}</message>\n</messages>",
        xml_escape(display_name(message)),
        message.timestamp.to_rfc3339(),
        xml_escape(&message.content)
    )
}

fn display_name(message: &InboundMessage) -> &str {
    if message.sender_name.trim().is_empty() {
        &message.sender
    } else {
        &message.sender_name
    }
}
