//! data_dir 下的 JSON 快照持久化：config.json / stats.json / logs.json。

use anyhow::Context;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};

use crate::config::ProxyConfig;
use crate::types::{AggregateStats, RequestLogEntry};

const CONFIG_FILE: &str = "config.json";
const STATS_FILE: &str = "stats.json";
const LOGS_FILE: &str = "logs.json";

async fn read_json<T: DeserializeOwned>(path: &Path) -> anyhow::Result<Option<T>> {
    let data = match tokio::fs::read(path).await {
        Ok(v) => v,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e).with_context(|| format!("读取 {} 失败", path.display())),
    };
    let value =
        sonic_rs::from_slice(&data).with_context(|| format!("解析 {} 失败", path.display()))?;
    Ok(Some(value))
}

async fn write_json<T: Serialize>(path: &Path, value: &T) -> anyhow::Result<()> {
    if let Some(dir) = path.parent() {
        tokio::fs::create_dir_all(dir)
            .await
            .context("创建数据目录失败")?;
    }
    let data =
        sonic_rs::to_vec_pretty(value).with_context(|| format!("序列化 {} 失败", path.display()))?;
    tokio::fs::write(path, data)
        .await
        .with_context(|| format!("写入 {} 失败", path.display()))
}

fn file(data_dir: &Path, name: &str) -> PathBuf {
    data_dir.join(name)
}

pub async fn load_config(data_dir: &Path) -> anyhow::Result<Option<ProxyConfig>> {
    read_json(&file(data_dir, CONFIG_FILE)).await
}

pub async fn save_config(data_dir: &Path, config: &ProxyConfig) -> anyhow::Result<()> {
    write_json(&file(data_dir, CONFIG_FILE), config).await
}

pub async fn load_stats(data_dir: &Path) -> anyhow::Result<Option<AggregateStats>> {
    read_json(&file(data_dir, STATS_FILE)).await
}

pub async fn save_stats(data_dir: &Path, stats: &AggregateStats) -> anyhow::Result<()> {
    write_json(&file(data_dir, STATS_FILE), stats).await
}

pub async fn load_logs(data_dir: &Path) -> anyhow::Result<Option<Vec<RequestLogEntry>>> {
    read_json(&file(data_dir, LOGS_FILE)).await
}

pub async fn save_logs(data_dir: &Path, logs: &[RequestLogEntry]) -> anyhow::Result<()> {
    write_json(&file(data_dir, LOGS_FILE), &logs.to_vec()).await
}
