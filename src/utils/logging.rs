use anyhow::Result;
/// 日志工具模块
///
/// 提供日志初始化、格式化和输出的辅助函数
use std::fs;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::queue::QueueCounts;
use crate::workflow::EntryStats;

/// 初始化日志订阅者
///
/// `RUST_LOG` 优先；否则 verbose 时为 debug，平时为 info。重复调用无副作用。
pub fn init(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("entry_engine={},warn", default_level)));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

/// 初始化日志文件
///
/// # 参数
/// - `log_file_path`: 日志文件路径
pub fn init_log_file(log_file_path: &str) -> Result<()> {
    let log_header = format!(
        "{}\n参赛任务日志 - {}\n{}\n\n",
        "=".repeat(60),
        chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
        "=".repeat(60)
    );
    fs::write(log_file_path, log_header)?;
    Ok(())
}

/// 记录程序启动信息
///
/// # 参数
/// - `entry_concurrency`: 参赛任务并发数（已按会话池容量截断）
/// - `pool_capacity`: 会话池容量
pub fn log_startup(entry_concurrency: usize, pool_capacity: usize) {
    info!("{}", "=".repeat(60));
    info!("🚀 程序启动 - 批量参赛模式");
    info!("📊 参赛并发数: {} (会话池容量 {})", entry_concurrency, pool_capacity);
    info!("{}", "=".repeat(60));
}

/// 记录任务加载信息
pub fn log_jobs_loaded(total: usize, queue: &str) {
    info!("✓ 找到 {} 个待处理的参赛任务", total);
    info!("📋 已全部加入队列 {}", queue);
    info!("💡 队列清空后输出统计\n");
}

/// 打印最终统计信息
///
/// # 参数
/// - `counts`: 队列计数
/// - `total`: 提交的任务总数
/// - `log_file_path`: 日志文件路径
pub fn print_final_stats(counts: &QueueCounts, total: usize, log_file_path: &str) {
    info!("\n{}", "=".repeat(60));
    info!("📊 全部处理完成统计");
    info!(
        "完成时间: {}",
        chrono::Local::now().format("%Y-%m-%d %H:%M:%S")
    );
    info!("{}", "=".repeat(60));
    info!("✅ 完成: {}/{}", counts.completed, total);
    info!("❌ 失败: {}", counts.failed);
    if counts.waiting + counts.delayed + counts.active > 0 {
        info!(
            "⏳ 未完成: 等待 {} / 延迟 {} / 进行中 {}",
            counts.waiting, counts.delayed, counts.active
        );
    }
    info!("{}", "=".repeat(60));
    info!("\n日志已保存至: {}", log_file_path);
}

/// 打印参赛结果分布
pub fn log_entry_stats(stats: &EntryStats) {
    info!(
        "🎯 已确认 {} / 已提交 {} / 失败 {}（其中已参加过 {}）",
        stats.confirmed, stats.submitted, stats.failed, stats.already_entered
    );
    if stats.instant_wins > 0 {
        info!("🎉 即时中奖: {}", stats.instant_wins);
    }
    if stats.circuit_open + stats.infrastructure_errors > 0 {
        info!(
            "⚠️ 熔断拦截 {} 次，基础设施错误 {} 次",
            stats.circuit_open, stats.infrastructure_errors
        );
    }
    info!("💰 打码花费: {:.4}", stats.challenge_cost);
}

/// 截断长文本用于日志显示
///
/// # 参数
/// - `text`: 原始文本
/// - `max_len`: 最大长度
///
/// # 返回
/// 返回截断后的文本
pub fn truncate_text(text: &str, max_len: usize) -> String {
    if text.chars().count() > max_len {
        text.chars().take(max_len).collect::<String>() + "..."
    } else {
        text.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_counts_chars_not_bytes() {
        assert_eq!(truncate_text("已经参加过了", 4), "已经参加...");
        assert_eq!(truncate_text("short", 10), "short");
    }

    #[test]
    fn test_init_log_file_writes_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.log");
        init_log_file(path.to_str().unwrap()).unwrap();
        let content = std::fs::read_to_string(path).unwrap();
        assert!(content.contains("参赛任务日志"));
    }

    #[test]
    fn test_init_is_idempotent() {
        init(false);
        init(true);
    }
}
