//! Wasp - 多通道个人智能体系统
//!
//! 入口：初始化日志与配置，按依赖序装配存储、工具、技能、MCP、调度器与
//! Agent，启动各传输通道；Ctrl+C 后在 30 秒预算内按序优雅关闭。

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use wasp::agent::{Agent, AgentConfig};
use wasp::bus::{Message, MessageBus, CHANNEL_SCHEDULE};
use wasp::channels::{CliChannel, TelegramBot, TelegramConfig, WebSocketConfig, WebSocketServer};
use wasp::config::load_config;
use wasp::context::ContextBuilder;
use wasp::llm::MultiModelManager;
use wasp::mcp::{AdapterConfig, McpClient, McpManager};
use wasp::scheduler::{Scheduler, SchedulerConfig, TaskHandlerFactory, TaskManager};
use wasp::skills::{SkillRegistry, SkillSelector, SkillWatcher};
use wasp::storage::{FileMemoryStorage, FileSessionStorage, FileStorage, MemoryStorage, SessionStorage, Storage};
use wasp::tools::{
    file_tools, memory_tools, BraveSearchClient, CalculateTool, EchoTool, GetTimeTool, SearchConfig,
    ToolExecutor, ToolRegistry, WebSearchTool,
};

/// 整体关闭预算
const SHUTDOWN_BUDGET: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 日志：默认 info，可通过 RUST_LOG 覆盖
    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env().add_directive("info".parse()?))
        .with(fmt::layer())
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "wasp starting");

    let cfg = load_config(None).context("failed to load configuration")?;
    let base_path = cfg.app.base_path.clone();
    std::fs::create_dir_all(&base_path).context("failed to create data directory")?;

    // 存储
    let file_storage: Arc<dyn Storage> = Arc::new(FileStorage::new(&base_path));
    let session_storage: Arc<dyn SessionStorage> = Arc::new(FileSessionStorage::new(&base_path));
    let memory_storage: Arc<dyn MemoryStorage> = Arc::new(FileMemoryStorage::new(&base_path));
    tracing::info!(base = %base_path.display(), "storage initialized");

    // 总线
    let bus = Arc::new(MessageBus::new());
    bus.start().await;

    // 工具
    let tool_registry = Arc::new(ToolRegistry::new());
    register_tool(&tool_registry, Arc::new(GetTimeTool)).await;
    register_tool(&tool_registry, Arc::new(EchoTool)).await;
    register_tool(&tool_registry, Arc::new(CalculateTool)).await;
    for tool in file_tools(&base_path) {
        register_tool(&tool_registry, tool).await;
    }
    for tool in memory_tools(Arc::clone(&memory_storage)) {
        register_tool(&tool_registry, tool).await;
    }
    if !cfg.search.brave_api_key.is_empty() {
        let client = Arc::new(BraveSearchClient::new(SearchConfig {
            api_key: cfg.search.brave_api_key.clone(),
            ..Default::default()
        }));
        register_tool(&tool_registry, Arc::new(WebSearchTool::new(client))).await;
    }
    tracing::info!(count = tool_registry.count().await, "tools registered");

    // LLM
    let llm = if cfg.llm.models.is_empty() {
        tracing::warn!("no LLM models configured, agent will reply with a notice");
        None
    } else {
        match MultiModelManager::new(cfg.llm.models.clone(), &cfg.llm.default_model) {
            Ok(manager) => Some(Arc::new(manager)),
            Err(e) => {
                tracing::warn!(error = %e, "failed to create LLM manager, agent will run without LLM");
                None
            }
        }
    };

    // 技能
    let mut skill_selector = None;
    let mut skill_watcher = None;
    if cfg.skills.enabled {
        let registry = Arc::new(SkillRegistry::new());
        match registry.load_from_directory(&cfg.skills.directory).await {
            Ok(count) => tracing::info!(count, "skills loaded"),
            Err(e) => tracing::warn!(error = %e, "failed to load skills directory"),
        }

        if cfg.skills.auto_reload {
            let watcher = Arc::new(SkillWatcher::new(Arc::clone(&registry), &cfg.skills.directory));
            match watcher.start().await {
                Ok(()) => skill_watcher = Some(watcher),
                Err(e) => tracing::warn!(error = %e, "failed to start skill watcher"),
            }
        }

        // 选择器不接 LLM：hybrid 在无 LLM 时退化为 keyword
        skill_selector = Some(Arc::new(SkillSelector::new(
            registry,
            None,
            cfg.skills.selection.clone(),
        )));
    }

    // MCP
    let mut mcp_manager = None;
    if cfg.mcp.enabled {
        let manager = Arc::new(McpManager::new(Arc::clone(&tool_registry)));
        for client_cfg in &cfg.mcp.clients {
            let adapter_cfg = AdapterConfig {
                prefix: format!("mcp_{}_", client_cfg.name),
                description: format!("MCP tool from {}", client_cfg.name),
            };
            match McpClient::new(client_cfg.clone()) {
                Ok(client) => {
                    if let Err(e) = manager.add_client(client, adapter_cfg).await {
                        tracing::warn!(client = %client_cfg.name, error = %e, "failed to add mcp client");
                    }
                }
                Err(e) => {
                    tracing::warn!(client = %client_cfg.name, error = %e, "failed to create mcp client");
                }
            }
        }
        manager.connect_all().await;
        mcp_manager = Some(manager);
    }

    // 调度器：任务处理器把合成消息发布到 schedule 通道，由 Agent 照常处理
    let mut scheduler = None;
    let mut task_manager = None;
    if cfg.scheduler.enabled {
        let sched = Arc::new(Scheduler::new(SchedulerConfig {
            tick_interval: Duration::from_secs(cfg.scheduler.tick_secs.max(1)),
        }));

        let factory: TaskHandlerFactory = {
            let bus = Arc::clone(&bus);
            Arc::new(move |config| {
                let bus = Arc::clone(&bus);
                let chat_id = format!("task-{}", config.id);
                let content = if config.description.is_empty() {
                    config.name.clone()
                } else {
                    config.description.clone()
                };
                Arc::new(move |cancel| {
                    let bus = Arc::clone(&bus);
                    let msg = Message::new("", &chat_id, &content);
                    Box::pin(async move {
                        bus.publish(&cancel, CHANNEL_SCHEDULE, msg)
                            .await
                            .map_err(|e| e.to_string())
                    })
                })
            })
        };

        let manager = Arc::new(TaskManager::new(
            Arc::clone(&sched),
            &cfg.scheduler.tasks_file,
            factory,
        ));
        manager.start().await?;

        if cfg.scheduler.auto_start {
            if let Err(e) = sched.start().await {
                tracing::warn!(error = %e, "failed to start scheduler");
            }
        }

        scheduler = Some(sched);
        task_manager = Some(manager);
    }

    // Agent
    let context_builder = Arc::new(ContextBuilder::new(
        Arc::clone(&file_storage),
        Arc::clone(&memory_storage),
    ));
    let executor = Arc::new(ToolExecutor::new(Arc::clone(&tool_registry)));
    let agent = Arc::new(Agent::new(
        AgentConfig {
            max_iterations: cfg.app.max_iterations,
        },
        Arc::clone(&bus),
        llm,
        executor,
        context_builder,
        skill_selector,
        Arc::clone(&session_storage),
    ));
    agent.start().await;

    // 传输通道
    let mut telegram = None;
    if cfg.telegram.enabled && !cfg.telegram.token.is_empty() {
        let bot = Arc::new(TelegramBot::new(
            TelegramConfig::new(cfg.telegram.token.clone()),
            Arc::clone(&bus),
        ));
        bot.start().await;
        telegram = Some(bot);
    }

    let mut websocket = None;
    if cfg.websocket.enabled {
        let server = Arc::new(WebSocketServer::new(
            WebSocketConfig {
                host: cfg.websocket.host.clone(),
                port: cfg.websocket.port,
            },
            Arc::clone(&bus),
        ));
        if let Err(e) = server.start().await {
            tracing::warn!(error = %e, "failed to start websocket server");
        } else {
            websocket = Some(server);
        }
    }

    let mut cli = None;
    if cfg.cli.enabled {
        let channel = Arc::new(CliChannel::new(Arc::clone(&bus)));
        channel.start().await;
        cli = Some(channel);
    }

    tracing::info!("wasp is ready, press Ctrl+C to stop");
    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");

    // 按序关闭：传输 -> 技能监视 -> MCP -> 调度器 -> Agent -> 总线；整体 30s 预算
    let shutdown = async {
        if let Some(bot) = &telegram {
            bot.stop();
        }
        if let Some(server) = &websocket {
            server.stop().await;
        }
        if let Some(channel) = &cli {
            channel.stop();
        }
        if let Some(watcher) = &skill_watcher {
            watcher.stop();
        }
        if let Some(manager) = &mcp_manager {
            manager.close().await;
        }
        if let Some(manager) = &task_manager {
            manager.stop().await;
        }
        if let Some(sched) = &scheduler {
            sched.stop().await;
        }
        agent.stop().await;
        bus.close().await;
    };

    if tokio::time::timeout(SHUTDOWN_BUDGET, shutdown).await.is_err() {
        tracing::warn!("shutdown budget exceeded, abandoning remaining components");
    }

    tracing::info!("wasp stopped gracefully");
    Ok(())
}

async fn register_tool(registry: &ToolRegistry, tool: Arc<dyn wasp::tools::Tool>) {
    let name = tool.name().to_string();
    if let Err(e) = registry.register(tool).await {
        tracing::warn!(tool = %name, error = %e, "failed to register tool");
    }
}
