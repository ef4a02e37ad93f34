//! hive-delegate：在隔离会话内发起一次委派
//!
//! 用法：
//! ```bash
//! hive-delegate --target gmail-reader --prompt "list unread senders" --timeout 60
//! ```
//! 从 HIVE_IPC_DIR / HIVE_GROUP_FOLDER 得知本群的 IPC 目录与身份；
//! 成功时把结果打印到 stdout，失败时把错误打印到 stderr 并以非零码退出。
//! `--describe` 打印工具定义（name / description / parameters），供 agent 运行时注册。

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use hive::config::load_config;
use hive::observability;
use hive::tools::{DelegateClient, DelegateTool, ToolRegistry};

#[derive(Parser, Debug)]
#[command(name = "hive-delegate")]
#[command(version)]
#[command(about = "Delegate a task to another group's agent and wait for the answer", long_about = None)]
struct Args {
    /// 目标群目录名
    #[arg(short, long, required_unless_present = "describe")]
    target: Option<String>,

    #[arg(short, long, required_unless_present = "describe")]
    prompt: Option<String>,

    /// 超时秒数；缺省用配置默认值，超过上限会被截断
    #[arg(long)]
    timeout: Option<u64>,

    #[arg(long, env = "HIVE_IPC_DIR")]
    ipc_dir: PathBuf,

    #[arg(long, env = "HIVE_GROUP_FOLDER")]
    group: String,

    /// 只打印工具定义
    #[arg(long)]
    describe: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();

    let args = Args::parse();
    let config = load_config(None).context("Failed to load configuration")?;

    let client = Arc::new(DelegateClient::new(&args.ipc_dir, &args.group, &config.delegation));
    client.startup().await;

    let mut tools = ToolRegistry::new();
    tools.register(DelegateTool::new(Arc::clone(&client)));

    if args.describe {
        println!("{}", tools.to_schema_json());
        return Ok(());
    }

    let mut call = serde_json::json!({
        "targetGroup": args.target,
        "prompt": args.prompt,
    });
    if let Some(timeout) = args.timeout {
        call["timeoutSeconds"] = timeout.into();
    }

    match tools.execute("delegate", call).await {
        Ok(result) => {
            println!("{}", result);
            Ok(())
        }
        Err(error) => {
            if let Some(record) = client.last_record().await {
                tracing::debug!(
                    request_id = %record.request_id,
                    state = ?record.state,
                    "delegation finished without a result"
                );
            }
            eprintln!("{}", error);
            std::process::exit(1);
        }
    }
}
