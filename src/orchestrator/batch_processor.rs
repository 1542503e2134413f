//! 批量参赛处理器 - 编排层
//!
//! ## 职责
//!
//! 本模块是整个应用的入口，负责批量参赛任务的提交和资源管理。
//!
//! ## 核心功能
//!
//! 1. **应用初始化**：启动日志、构造引擎上下文（浏览器工厂、队列、表单脚本）
//! 2. **批量加载**：扫描并加载所有待处理的参赛任务（`Vec<EntryJob>`）
//! 3. **入队**：全部交给任务网关，并发由 worker 控制
//! 4. **等待**：队列清空后汇总；降级模式下直接报告未执行
//! 5. **资源管理**：结束时停止 worker 并销毁会话池
//!
//! ## 设计特点
//!
//! - **顶层编排**：不处理单次参赛的细节，委托 workflow::EntryFlow
//! - **降级可见**：队列不可用时明确报告任务只被记录

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::browser::ChromiumEngineFactory;
use crate::config::Config;
use crate::events::{EngineEvent, EventBus};
use crate::forms::{FormKit, ScriptForms};
use crate::models::EntryJob;
use crate::orchestrator::engine::{EntryEngine, ENTRY_QUEUE};
use crate::queue::{GatewayMode, MemoryBroker, QueueCounts};
use crate::utils::logging::{init_log_file, log_entry_stats, log_jobs_loaded, log_startup, print_final_stats};
use crate::workflow::EntryStats;

/// 一次批量运行的汇总
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub total: usize,
    pub mode: GatewayMode,
    pub counts: QueueCounts,
    pub stats: EntryStats,
}

/// 应用主结构
pub struct App {
    config: Config,
    engine: EntryEngine,
}

impl App {
    /// 初始化应用（真实浏览器 + 进程内队列 + 表单脚本目录）
    pub async fn initialize(config: Config) -> Result<Self> {
        init_log_file(&config.output_log_file)?;

        let factory = Arc::new(ChromiumEngineFactory::headless(
            config.headless,
            config.chrome_executable.as_ref().map(PathBuf::from),
        ));
        let forms = ScriptForms::load(&config.form_scripts_dir).await?;
        let events = EventBus::new();
        subscribe_run_log(&events);

        let engine = EntryEngine::build(
            config.clone(),
            factory,
            Arc::new(MemoryBroker::new()),
            FormKit::from_single(Arc::new(forms)),
            events,
        )
        .await?;

        Ok(Self::with_engine(config, engine))
    }

    /// 使用已经组装好的引擎
    pub fn with_engine(config: Config, engine: EntryEngine) -> Self {
        log_startup(engine.entry_concurrency(), engine.pool().config().capacity());
        Self { config, engine }
    }

    pub fn engine(&self) -> &EntryEngine {
        &self.engine
    }

    /// 运行应用主逻辑
    pub async fn run(&self) -> Result<RunSummary> {
        let jobs = self.load_jobs().await?;
        let total = jobs.len();

        if jobs.is_empty() {
            warn!("⚠️ 没有找到待处理的TOML文件，程序结束");
        } else {
            self.enqueue_all(jobs).await?;
            log_jobs_loaded(total, ENTRY_QUEUE);
        }

        let gateway = self.engine.gateway();
        let counts = if gateway.is_fallback() {
            warn!("⚠️ 降级模式：{} 个任务只记录在进程内，本次运行不会执行", total);
            gateway.status(ENTRY_QUEUE).await?
        } else {
            self.engine.start_entry_workers();
            gateway
                .wait_for_idle(ENTRY_QUEUE, Duration::from_millis(500))
                .await?
        };

        let stats = self.engine.flow().stats();
        print_final_stats(&counts, total, &self.config.output_log_file);
        log_entry_stats(&stats);

        self.engine.shutdown().await;

        Ok(RunSummary {
            total,
            mode: gateway.mode(),
            counts,
            stats,
        })
    }

    /// 加载参赛任务
    async fn load_jobs(&self) -> Result<Vec<EntryJob>> {
        info!("\n📁 正在扫描待处理的参赛任务...");
        crate::models::load_all_entry_files(&self.config.jobs_folder).await
    }

    async fn enqueue_all(&self, jobs: Vec<EntryJob>) -> Result<()> {
        for job in jobs {
            let source = job.file_path.clone().unwrap_or_default();
            match self.engine.submit_entry(job).await {
                Ok(handle) => info!("✓ 已入队 {} ({})", handle.id, source),
                Err(e) => error!("❌ 入队失败 {}: {}", source, e),
            }
        }
        Ok(())
    }
}

/// 关键事件写入日志
fn subscribe_run_log(events: &EventBus) {
    events.subscribe(|event| match event {
        EngineEvent::JobFailed {
            job_id,
            error,
            will_retry: false,
            ..
        } => error!("[任务 {}] ❌ 重试耗尽: {}", job_id, error),
        EngineEvent::InstantWin {
            entry_id,
            prize_text,
            ..
        } => info!(
            "[参赛 {}] 🎉 即时中奖: {}",
            entry_id,
            prize_text.as_deref().unwrap_or("-")
        ),
        EngineEvent::CircuitStateChanged { key, from, to } => {
            warn!("[熔断 {}] {:?} → {:?}", key, from, to)
        }
        _ => {}
    });
}
