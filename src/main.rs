//! Hive - 隔离 agent 会话的宿主
//!
//! 入口：加载配置、初始化日志，然后运行宿主或执行群组管理命令。

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use hive::channels::ConsoleChannel;
use hive::config::load_config;
use hive::core::{
    run_with_graceful_shutdown, QueueCleanup, ShutdownCoordinator, ShutdownManager, ShutdownReason,
    WatcherCleanup,
};
use hive::groups::{ContainerConfig, RegisteredGroup};
use hive::{observability, HostBuilder};

/// 控制台渠道使用的 jid（主群尚未注册时自动用它注册）
const CONSOLE_JID: &str = "console@local";

#[derive(Parser, Debug)]
#[command(name = "hive")]
#[command(version)]
#[command(about = "Host orchestrator for isolated agent sessions", long_about = None)]
struct Cli {
    /// 额外的配置文件，覆盖 config/default.toml
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// 运行宿主（默认）
    Run {
        /// 不从 stdin 读取消息
        #[arg(long)]
        no_console: bool,
    },
    /// 管理注册群
    Groups {
        #[command(subcommand)]
        command: GroupCommands,
    },
}

#[derive(Subcommand, Debug)]
enum GroupCommands {
    List,
    Register {
        #[arg(long)]
        jid: String,
        #[arg(long)]
        name: String,
        #[arg(long)]
        folder: String,
        /// 默认 "@<assistant_name>"
        #[arg(long)]
        trigger: Option<String>,
        /// 不需要触发词
        #[arg(long)]
        no_trigger: bool,
        /// 允许委派到的群目录，可重复
        #[arg(long = "allow")]
        allow_delegation: Vec<String>,
        /// 会话超时（秒）
        #[arg(long)]
        timeout: Option<u64>,
    },
    Rename {
        #[arg(long)]
        jid: String,
        #[arg(long)]
        name: String,
    },
    /// 替换群策略（委派允许列表、会话超时）；额外挂载保持不变
    Configure {
        #[arg(long)]
        jid: String,
        #[arg(long = "allow")]
        allow_delegation: Vec<String>,
        #[arg(long)]
        timeout: Option<u64>,
    },
    Deregister {
        #[arg(long)]
        jid: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();

    let cli = Cli::parse();
    let config = load_config(cli.config).context("Failed to load configuration")?;

    match cli.command.unwrap_or(Commands::Run { no_console: false }) {
        Commands::Run { no_console } => run(config, no_console).await,
        Commands::Groups { command } => groups(config, command).await,
    }
}

async fn run(config: hive::config::AppConfig, no_console: bool) -> anyhow::Result<()> {
    let assistant_name = config.app.assistant_name.clone();
    let host = HostBuilder::new(config).build().context("Failed to assemble host")?;

    let main_folder = host.registry.main_folder().to_string();
    let main_jid = match host.registry.get_by_folder(&main_folder).await {
        Some(group) => group.jid,
        None => {
            let mut group = RegisteredGroup::new(
                CONSOLE_JID,
                "Console",
                &main_folder,
                format!("@{}", assistant_name),
            );
            group.requires_trigger = false;
            host.register_group(group)
                .await
                .context("Failed to register main group")?;
            tracing::info!(folder = %main_folder, "registered console as the main group");
            CONSOLE_JID.to_string()
        }
    };

    let manager = Arc::new(ShutdownManager::new());
    let token = manager.token();

    let watcher = Arc::clone(&host.watcher);
    let watcher_token = token.clone();
    let watcher_task = tokio::spawn(async move { watcher.run(watcher_token).await });

    let grace = host.drain_grace();
    let mut coordinator = ShutdownCoordinator::new(grace + Duration::from_secs(5));
    coordinator.register(WatcherCleanup::new(Arc::clone(&host.watcher), grace));
    coordinator.register(QueueCleanup::new(Arc::clone(&host.queue)));

    let app = {
        let router = Arc::clone(&host.router);
        let token = token.clone();
        let manager = Arc::clone(&manager);
        async move {
            if no_console {
                token.cancelled().await;
                return;
            }
            let console = Arc::new(ConsoleChannel::new(&main_jid, &assistant_name));
            router.add_channel(console.clone());
            let stdin = tokio::io::BufReader::new(tokio::io::stdin());
            if let Err(e) = console.read_loop(stdin, router, token.clone()).await {
                tracing::error!(error = %e, "console channel failed");
                manager.shutdown(ShutdownReason::FatalError(e.to_string()));
                return;
            }
            // stdin 关闭后宿主继续处理委派，直到收到信号
            token.cancelled().await;
        }
    };

    tracing::info!(folder = %main_folder, "hive running, press Ctrl+C to stop");
    let cleanup_manager = Arc::clone(&manager);
    run_with_graceful_shutdown(Arc::clone(&manager), app, move || async move {
        // 应用自行结束时也要让轮询停下
        cleanup_manager.shutdown(ShutdownReason::UserInitiated);
        if let Err(e) = watcher_task.await {
            tracing::error!(error = %e, "task watcher crashed");
        }
        coordinator.run_cleanup().await;
    })
    .await;

    match manager.reason() {
        Some(ShutdownReason::FatalError(e)) => Err(anyhow::anyhow!("host stopped: {}", e)),
        _ => Ok(()),
    }
}

async fn groups(config: hive::config::AppConfig, command: GroupCommands) -> anyhow::Result<()> {
    let assistant_name = config.app.assistant_name.clone();
    let host = HostBuilder::new(config).build().context("Failed to assemble host")?;

    match command {
        GroupCommands::List => {
            for group in host.registry.list().await {
                let allow = group
                    .container_config
                    .as_ref()
                    .map(|c| c.allow_delegation.join(","))
                    .unwrap_or_default();
                println!(
                    "{}\t{}\t{}\t{}{}\tallow=[{}]",
                    group.folder,
                    group.jid,
                    group.name,
                    group.trigger,
                    if host.registry.is_main(&group.folder) { "\t(main)" } else { "" },
                    allow
                );
            }
        }
        GroupCommands::Register {
            jid,
            name,
            folder,
            trigger,
            no_trigger,
            allow_delegation,
            timeout,
        } => {
            let trigger = trigger.unwrap_or_else(|| format!("@{}", assistant_name));
            let mut group = RegisteredGroup::new(jid, name, &folder, trigger);
            group.requires_trigger = !no_trigger;
            if !allow_delegation.is_empty() || timeout.is_some() {
                group = group.with_container_config(ContainerConfig {
                    allow_delegation,
                    timeout,
                    ..Default::default()
                });
            }
            host.register_group(group)
                .await
                .with_context(|| format!("Failed to register group '{}'", folder))?;
            println!("registered {}", folder);
        }
        GroupCommands::Rename { jid, name } => {
            host.registry
                .rename(&jid, &name)
                .await
                .with_context(|| format!("Failed to rename '{}'", jid))?;
            println!("renamed {} to {}", jid, name);
        }
        GroupCommands::Configure {
            jid,
            allow_delegation,
            timeout,
        } => {
            let group = host
                .registry
                .get_by_jid(&jid)
                .await
                .with_context(|| format!("'{}' is not registered", jid))?;
            let additional_mounts = group
                .container_config
                .map(|c| c.additional_mounts)
                .unwrap_or_default();
            let config = ContainerConfig {
                additional_mounts,
                timeout,
                allow_delegation,
            };
            let config = (config != ContainerConfig::default()).then_some(config);
            host.registry
                .reconfigure(&jid, config)
                .await
                .with_context(|| format!("Failed to configure '{}'", jid))?;
            println!("configured {}", jid);
        }
        GroupCommands::Deregister { jid } => {
            let removed = host
                .registry
                .deregister(&jid)
                .await
                .with_context(|| format!("Failed to deregister '{}'", jid))?;
            // 工作区和 IPC 目录保留，只丢掉续接用的会话
            host.sessions.clear(&removed.folder).await?;
            println!("deregistered {} ({})", removed.folder, removed.jid);
        }
    }
    Ok(())
}
