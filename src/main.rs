use anyhow::Result;
use entry_engine::utils::logging;
use entry_engine::{App, Config};

#[tokio::main]
async fn main() -> Result<()> {
    // 加载配置
    let config = Config::load()?;

    // 初始化日志
    logging::init(config.verbose_logging);

    // 初始化并运行应用
    let summary = App::initialize(config).await?.run().await?;
    if summary.stats.failed > 0 {
        tracing::warn!("⚠️ 有 {} 次参赛失败，详见日志", summary.stats.failed);
    }

    Ok(())
}
