// 该文件是 Wuling （雾岭） 项目的一部分。
// src/config.rs - 服务配置与持久化
//
// 本文件根据 Apache 许可证第 2.0 版（以下简称“许可证”）授权使用；
// 除非遵守该许可证条款，否则您不得使用本文件。
// 您可通过以下网址获取许可证副本：
// http://www.apache.org/licenses/LICENSE-2.0
// 除非适用法律要求或书面同意，根据本许可协议分发的软件均按“原样”提供，
// 不附带任何形式的明示或暗示的保证或条件。
// 有关许可权限与限制的具体条款，请参阅本许可协议。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, Wareless Group

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::types::StreamConfig;

/// 服务器全局配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
  /// REST API 端口（外部 HTTP 组件使用）
  pub http_port: u16,
  /// ZeroMQ 发布端点（tcp 或 ipc）
  pub zmq_endpoint: String,
  /// 推理线程数（建议等于 NPU 核心数）
  pub num_infer_workers: usize,
  /// NPU 核心数
  pub num_npu_cores: usize,
  /// 每路解码输出队列大小（保留字段，核心未使用）
  pub decode_queue_size: usize,
  /// 全局推理任务队列容量
  pub infer_queue_size: usize,
  /// 流配置持久化路径
  pub streams_save_path: String,
  /// 日志级别
  pub log_level: String,
  /// 图片缓存保留时长（秒）
  pub cache_duration_sec: u64,
  /// JPEG 压缩质量 (1-100)
  pub cache_jpeg_quality: u8,
  /// 缓存图片宽度（0 = 保持原始宽度）
  pub cache_resize_width: u32,
  /// 缓存图片高度（0 = 按宽度等比例计算）
  pub cache_resize_height: u32,
  /// 缓存最大总内存（MB, 0 = 不限制）
  pub cache_max_memory_mb: usize,
}

impl Default for ServerConfig {
  fn default() -> Self {
    ServerConfig {
      http_port: 8080,
      zmq_endpoint: "ipc:///tmp/wuling.ipc".to_string(),
      num_infer_workers: 3,
      num_npu_cores: 3,
      decode_queue_size: 2,
      infer_queue_size: 18,
      streams_save_path: "/etc/wuling/streams.json".to_string(),
      log_level: "info".to_string(),
      cache_duration_sec: 5,
      cache_jpeg_quality: 75,
      cache_resize_width: 640,
      cache_resize_height: 0,
      cache_max_memory_mb: 64,
    }
  }
}

#[derive(Error, Debug)]
pub enum ConfigError {
  #[error("配置文件读取失败 {path}: {source}")]
  Io {
    path: String,
    source: std::io::Error,
  },
  #[error("配置文件解析失败 {path}: {source}")]
  Parse {
    path: String,
    source: serde_json::Error,
  },
}

/// 持久化文件结构: { "streams": [ ... ] }
#[derive(Debug, Default, Serialize, Deserialize)]
struct PersistedStreams {
  streams: Vec<StreamConfig>,
}

/// 从 JSON 文件加载服务器配置
pub fn load_server_config(path: &str) -> Result<ServerConfig, ConfigError> {
  let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
    path: path.to_string(),
    source,
  })?;
  serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
    path: path.to_string(),
    source,
  })
}

/// 加载已持久化的流配置
pub fn load_streams(path: &str) -> Result<Vec<StreamConfig>, ConfigError> {
  let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
    path: path.to_string(),
    source,
  })?;
  let persisted: PersistedStreams =
    serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
      path: path.to_string(),
      source,
    })?;
  Ok(persisted.streams)
}

/// 保存流配置（用于重启恢复）
///
/// 原子写入：先写 `<path>.tmp` 再 rename 覆盖，
/// 任何时刻读取方看到的都是完整文件。
pub fn save_streams(path: &str, streams: &[StreamConfig]) -> Result<(), ConfigError> {
  let io_err = |source| ConfigError::Io {
    path: path.to_string(),
    source,
  };

  if let Some(dir) = Path::new(path).parent() {
    if !dir.as_os_str().is_empty() && !dir.exists() {
      std::fs::create_dir_all(dir).map_err(io_err)?;
    }
  }

  let persisted = PersistedStreams {
    streams: streams.to_vec(),
  };
  let json = serde_json::to_string_pretty(&persisted).map_err(|source| ConfigError::Parse {
    path: path.to_string(),
    source,
  })?;

  let tmp_path = format!("{path}.tmp");
  std::fs::write(&tmp_path, json).map_err(io_err)?;
  std::fs::rename(&tmp_path, path).map_err(io_err)?;
  Ok(())
}

/// 加载类别标签文件
///
/// UTF-8 文本，每行一个类别名；去除行尾空白和 CR，跳过空行。
/// 行号即 class_id。文件无法打开时返回空列表并告警。
pub fn load_labels(path: &str) -> Vec<String> {
  if path.is_empty() {
    return Vec::new();
  }

  let text = match std::fs::read_to_string(path) {
    Ok(text) => text,
    Err(e) => {
      warn!("无法打开标签文件 {}: {}", path, e);
      return Vec::new();
    }
  };

  text
    .lines()
    .map(|line| line.trim_end().to_string())
    .filter(|line| !line.is_empty())
    .collect()
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::types::{ModelConfig, ModelKind};

  fn temp_path(tag: &str) -> String {
    std::env::temp_dir()
      .join(format!("wuling-config-{}-{}", tag, std::process::id()))
      .to_string_lossy()
      .into_owned()
  }

  #[test]
  fn server_config_defaults_from_empty_json() {
    let cfg: ServerConfig = serde_json::from_str("{}").unwrap();
    assert_eq!(cfg.num_infer_workers, 3);
    assert_eq!(cfg.infer_queue_size, 18);
    assert_eq!(cfg.decode_queue_size, 2);
    assert_eq!(cfg.cache_duration_sec, 5);
    assert_eq!(cfg.cache_jpeg_quality, 75);
    assert_eq!(cfg.log_level, "info");
  }

  #[test]
  fn server_config_partial_override() {
    let cfg: ServerConfig =
      serde_json::from_str(r#"{"num_infer_workers":2,"infer_queue_size":4}"#).unwrap();
    assert_eq!(cfg.num_infer_workers, 2);
    assert_eq!(cfg.infer_queue_size, 4);
    assert_eq!(cfg.http_port, 8080);
  }

  #[test]
  fn streams_save_load_round_trip() {
    let path = temp_path("streams.json");
    let streams = vec![StreamConfig {
      cam_id: "cam1".into(),
      rtsp_url: "rtsp://example/ch1".into(),
      frame_skip: 5,
      models: vec![ModelConfig {
        model_path: "/m/a.rknn".into(),
        task_name: "det".into(),
        kind: ModelKind::YoloV8,
        input_width: 640,
        input_height: 640,
        conf_threshold: 0.3,
        nms_threshold: 0.5,
        labels_file: String::new(),
      }],
    }];

    save_streams(&path, &streams).unwrap();
    let loaded = load_streams(&path).unwrap();
    assert_eq!(loaded.len(), 1);
    assert_eq!(loaded[0].cam_id, "cam1");
    assert_eq!(loaded[0].models[0].kind, ModelKind::YoloV8);

    // 覆盖保存为空列表
    save_streams(&path, &[]).unwrap();
    assert!(load_streams(&path).unwrap().is_empty());

    // 临时文件不残留
    assert!(!Path::new(&format!("{path}.tmp")).exists());
    std::fs::remove_file(&path).unwrap();
  }

  #[test]
  fn load_streams_missing_file_fails() {
    assert!(matches!(
      load_streams("/nonexistent/streams.json"),
      Err(ConfigError::Io { .. })
    ));
  }

  #[test]
  fn labels_file_parsing() {
    let path = temp_path("labels.txt");
    std::fs::write(&path, "person\r\nphone  \r\n\r\ncigarette\n").unwrap();
    let labels = load_labels(&path);
    assert_eq!(labels, vec!["person", "phone", "cigarette"]);
    std::fs::remove_file(&path).unwrap();

    assert!(load_labels("").is_empty());
    assert!(load_labels("/nonexistent/labels.txt").is_empty());
  }
}
