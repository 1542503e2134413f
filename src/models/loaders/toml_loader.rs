use crate::models::contest::EntryJob;
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tokio::fs;

/// 从 TOML 文件加载一个参赛任务
pub async fn load_entry_file(toml_file_path: &Path) -> Result<EntryJob> {
    let content = fs::read_to_string(toml_file_path)
        .await
        .with_context(|| format!("无法读取TOML文件: {}", toml_file_path.display()))?;

    let mut job: EntryJob = toml::from_str(&content)
        .with_context(|| format!("无法解析TOML文件: {}", toml_file_path.display()))?;

    job.file_path = Some(toml_file_path.to_string_lossy().to_string());

    Ok(job)
}

/// 从文件夹中加载所有参赛任务（按文件名排序，单个文件失败只记录警告）
pub async fn load_all_entry_files(folder_path: &str) -> Result<Vec<EntryJob>> {
    let folder = PathBuf::from(folder_path);

    if !folder.exists() {
        anyhow::bail!("文件夹不存在: {}", folder_path);
    }

    let mut toml_files = Vec::new();
    let mut entries = fs::read_dir(&folder)
        .await
        .with_context(|| format!("无法读取文件夹: {}", folder_path))?;

    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().and_then(|s| s.to_str()) == Some("toml") {
            toml_files.push(path);
        }
    }
    toml_files.sort();

    let mut jobs = Vec::with_capacity(toml_files.len());
    for path in toml_files {
        tracing::info!(
            "正在加载: {}",
            path.file_name().unwrap_or_default().to_string_lossy()
        );

        match load_entry_file(&path).await {
            Ok(job) => jobs.push(job),
            Err(e) => tracing::warn!("加载文件失败 {}: {:#}", path.display(), e),
        }
    }

    Ok(jobs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_loads_valid_files_and_skips_broken_ones() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("b.toml"),
            "[contest]\nid = \"c-2\"\nurl = \"https://b.test\"\n[profile]\nid = \"p\"\n",
        )
        .unwrap();
        std::fs::write(
            dir.path().join("a.toml"),
            "[contest]\nid = \"c-1\"\nurl = \"https://a.test\"\n[profile]\nid = \"p\"\n",
        )
        .unwrap();
        std::fs::write(dir.path().join("broken.toml"), "contest = 3").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let jobs = load_all_entry_files(dir.path().to_str().unwrap()).await.unwrap();
        let ids: Vec<_> = jobs.iter().map(|j| j.contest.id.as_str()).collect();
        assert_eq!(ids, vec!["c-1", "c-2"]);
        assert!(jobs[0].file_path.as_deref().unwrap().ends_with("a.toml"));
    }

    #[tokio::test]
    async fn test_missing_folder_is_error() {
        assert!(load_all_entry_files("/definitely/not/here").await.is_err());
    }
}
