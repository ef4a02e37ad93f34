//! 控制台渠道：stdin 的每一行作为主群的一条消息，输出打印到 stdout

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::core::HiveError;
use crate::router::{Channel, InboundMessage, MessageRouter, RouteDecision};

pub struct ConsoleChannel {
    jid: String,
    assistant_name: String,
    out: Mutex<Box<dyn AsyncWrite + Send + Unpin>>,
}

impl ConsoleChannel {
    pub fn new(jid: impl Into<String>, assistant_name: impl Into<String>) -> Self {
        Self::with_writer(jid, assistant_name, Box::new(tokio::io::stdout()))
    }

    pub fn with_writer(
        jid: impl Into<String>,
        assistant_name: impl Into<String>,
        out: Box<dyn AsyncWrite + Send + Unpin>,
    ) -> Self {
        Self {
            jid: jid.into(),
            assistant_name: assistant_name.into(),
            out: Mutex::new(out),
        }
    }

    /// 逐行读取输入并路由，直到 EOF 或 shutdown
    pub async fn read_loop<R>(
        &self,
        input: R,
        router: Arc<MessageRouter>,
        shutdown: CancellationToken,
    ) -> Result<(), HiveError>
    where
        R: AsyncBufRead + Unpin,
    {
        let mut lines = input.lines();
        loop {
            let line = tokio::select! {
                _ = shutdown.cancelled() => break,
                line = lines.next_line() => line?,
            };
            let Some(line) = line else {
                tracing::info!("console input closed");
                break;
            };
            let content = line.trim();
            if content.is_empty() {
                continue;
            }
            let message = InboundMessage {
                chat_jid: self.jid.clone(),
                sender: "console".to_string(),
                sender_name: "You".to_string(),
                content: content.to_string(),
                timestamp: Utc::now(),
            };
            if router.route(message).await != RouteDecision::Queued {
                tracing::warn!(jid = %self.jid, "console message was not queued, is the main group registered?");
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Channel for ConsoleChannel {
    fn name(&self) -> &str {
        "console"
    }

    fn owns_jid(&self, jid: &str) -> bool {
        jid == self.jid
    }

    async fn send_message(&self, _jid: &str, text: &str) -> Result<(), HiveError> {
        let mut out = self.out.lock().await;
        let line = format!("{}: {}\n", self.assistant_name, text);
        out.write_all(line.as_bytes())
            .await
            .map_err(|e| HiveError::Channel(format!("console write failed: {}", e)))?;
        out.flush()
            .await
            .map_err(|e| HiveError::Channel(format!("console flush failed: {}", e)))
    }
}
