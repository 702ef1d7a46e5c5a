// 该文件是 Wuling （雾岭） 项目的一部分。
// src/types.rs - 核心数据类型定义
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::infer::FrameResultCollector;

/// 模型家族标签
///
/// 决定后处理的解码方式，序列化为 "yolov5" / "yolov8" / "yolov11"。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelKind {
  YoloV5,
  YoloV8,
  YoloV11,
}

fn default_model_kind() -> ModelKind {
  ModelKind::YoloV5
}

fn default_input_size() -> u32 {
  640
}

fn default_conf_threshold() -> f32 {
  0.25
}

fn default_nms_threshold() -> f32 {
  0.45
}

fn default_frame_skip() -> u32 {
  5
}

/// 单个模型的配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
  /// RKNN 模型文件路径（同时作为模型标识）
  pub model_path: String,
  /// 任务名称标识（如 "phone_detection"）
  pub task_name: String,
  /// 模型家族
  #[serde(rename = "model_type", default = "default_model_kind")]
  pub kind: ModelKind,
  /// 模型输入宽度
  #[serde(default = "default_input_size")]
  pub input_width: u32,
  /// 模型输入高度
  #[serde(default = "default_input_size")]
  pub input_height: u32,
  /// 置信度阈值
  #[serde(default = "default_conf_threshold")]
  pub conf_threshold: f32,
  /// NMS IoU 阈值
  #[serde(default = "default_nms_threshold")]
  pub nms_threshold: f32,
  /// 类别标签文件路径（可选，每行一个类别名）
  #[serde(default)]
  pub labels_file: String,
}

/// 单路 RTSP 流的配置
///
/// 流创建后配置不可变，替换需要先删除再添加。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
  /// 摄像头唯一标识
  pub cam_id: String,
  /// RTSP 地址
  pub rtsp_url: String,
  /// 每 N 帧推理一次
  #[serde(default = "default_frame_skip")]
  pub frame_skip: u32,
  /// 该流使用的模型列表（按配置顺序提交任务）
  #[serde(default)]
  pub models: Vec<ModelConfig>,
}

/// 检测框（坐标为原始帧坐标系）
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct BBox {
  pub x1: f32,
  pub y1: f32,
  pub x2: f32,
  pub y2: f32,
}

/// 单个检测目标
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Detection {
  /// 类别 ID（标签文件中的行号）
  pub class_id: i32,
  /// 类别名称（来自标签文件，缺失时为空）
  pub class_name: String,
  /// 置信度
  pub confidence: f32,
  /// 检测框
  pub bbox: BBox,
}

/// 单个模型对单帧的推理结果
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelResult {
  pub task_name: String,
  pub model_path: String,
  /// 推理总耗时（毫秒，墙钟时间）
  pub inference_time_ms: f64,
  pub detections: Vec<Detection>,
}

/// 单帧的完整推理结果（所有模型聚合后，ZeroMQ 输出格式）
///
/// `results` 的顺序是各模型完成的顺序而非配置顺序，
/// 消费端必须按 `task_name` 索引。
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FrameResult {
  pub cam_id: String,
  pub rtsp_url: String,
  pub frame_id: u64,
  pub timestamp_ms: i64,
  pub pts: i64,
  pub original_width: u32,
  pub original_height: u32,
  pub results: Vec<ModelResult>,
}

/// 流运行状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
  Stopped,
  Starting,
  Running,
  Reconnecting,
  Error,
}

impl StreamState {
  pub fn as_str(self) -> &'static str {
    match self {
      StreamState::Stopped => "stopped",
      StreamState::Starting => "starting",
      StreamState::Running => "running",
      StreamState::Reconnecting => "reconnecting",
      StreamState::Error => "error",
    }
  }

  /// 从原子存储的原始值还原状态
  pub fn from_raw(raw: u32) -> StreamState {
    match raw {
      1 => StreamState::Starting,
      2 => StreamState::Running,
      3 => StreamState::Reconnecting,
      4 => StreamState::Error,
      _ => StreamState::Stopped,
    }
  }

  pub fn as_raw(self) -> u32 {
    match self {
      StreamState::Stopped => 0,
      StreamState::Starting => 1,
      StreamState::Running => 2,
      StreamState::Reconnecting => 3,
      StreamState::Error => 4,
    }
  }
}

/// 流的运行状态快照（API 响应格式）
#[derive(Debug, Clone, Serialize)]
pub struct StreamStatus {
  pub cam_id: String,
  pub rtsp_url: String,
  pub status: String,
  pub frame_skip: u32,
  pub models: Vec<ModelConfig>,
  pub decoded_frames: u64,
  pub inferred_frames: u64,
  /// 丢帧只发生在全局推理队列，按流归属恒为 0，
  /// 观察方应读取队列的 dropped_count
  pub dropped_frames: u64,
  pub decode_fps: f64,
  pub infer_fps: f64,
  pub reconnect_count: u32,
  pub last_error: String,
  pub uptime_seconds: f64,
}

/// 图片缓存帧（JPEG 压缩后）
///
/// JPEG 数据引用计数共享：缓存和多个并发读取方持有同一份字节。
#[derive(Debug, Clone)]
pub struct CachedFrame {
  pub cam_id: String,
  pub frame_id: u64,
  pub timestamp_ms: i64,
  pub width: u32,
  pub height: u32,
  pub jpeg_data: Arc<Vec<u8>>,
}

impl CachedFrame {
  /// JPEG 数据大小（字节）
  pub fn jpeg_size(&self) -> usize {
    self.jpeg_data.len()
  }
}

/// 推理任务（有界队列中的元素）
///
/// 输入缓冲由任务独占持有，恰好被一个 worker 消费。
pub struct InferTask {
  // 帧标识
  pub cam_id: String,
  pub rtsp_url: String,
  pub frame_id: u64,
  pub pts: i64,
  pub timestamp_ms: i64,
  pub original_width: u32,
  pub original_height: u32,

  // 模型参数
  pub model_path: String,
  pub task_name: String,
  pub kind: ModelKind,
  pub conf_threshold: f32,
  pub nms_threshold: f32,
  /// 标签快照（同一流的任务共享同一份）
  pub labels: Arc<Vec<String>>,

  // 输入数据（2D 加速器 resize 后的 RGB888，长度 3*W*H）
  pub input_data: Vec<u8>,
  pub input_width: u32,
  pub input_height: u32,

  /// 结果聚合器（同一帧的多模型任务共享，单模型时为 None）
  pub collector: Option<Arc<FrameResultCollector>>,
}

impl InferTask {
  /// 由任务字段组装帧结果骨架（单模型直发路径）
  pub fn base_result(&self) -> FrameResult {
    FrameResult {
      cam_id: self.cam_id.clone(),
      rtsp_url: self.rtsp_url.clone(),
      frame_id: self.frame_id,
      timestamp_ms: self.timestamp_ms,
      pts: self.pts,
      original_width: self.original_width,
      original_height: self.original_height,
      results: Vec::new(),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn model_kind_serde_names() {
    assert_eq!(serde_json::to_string(&ModelKind::YoloV5).unwrap(), "\"yolov5\"");
    assert_eq!(serde_json::to_string(&ModelKind::YoloV11).unwrap(), "\"yolov11\"");
    let k: ModelKind = serde_json::from_str("\"yolov8\"").unwrap();
    assert_eq!(k, ModelKind::YoloV8);
  }

  #[test]
  fn stream_config_defaults() {
    let json = r#"{"cam_id":"cam1","rtsp_url":"rtsp://example/ch1",
      "models":[{"model_path":"/m/a.rknn","task_name":"det"}]}"#;
    let cfg: StreamConfig = serde_json::from_str(json).unwrap();
    assert_eq!(cfg.frame_skip, 5);
    assert_eq!(cfg.models[0].kind, ModelKind::YoloV5);
    assert_eq!(cfg.models[0].input_width, 640);
    assert!((cfg.models[0].conf_threshold - 0.25).abs() < 1e-6);
    assert!((cfg.models[0].nms_threshold - 0.45).abs() < 1e-6);
    assert!(cfg.models[0].labels_file.is_empty());
  }

  #[test]
  fn frame_result_json_round_trip() {
    let result = FrameResult {
      cam_id: "cam1".into(),
      rtsp_url: "rtsp://example/ch1".into(),
      frame_id: 42,
      timestamp_ms: 1700000000123,
      pts: 90000,
      original_width: 1920,
      original_height: 1080,
      results: vec![ModelResult {
        task_name: "det".into(),
        model_path: "/m/a.rknn".into(),
        inference_time_ms: 12.5,
        detections: vec![Detection {
          class_id: 0,
          class_name: "person".into(),
          confidence: 0.87,
          bbox: BBox { x1: 10.0, y1: 20.0, x2: 110.0, y2: 220.0 },
        }],
      }],
    };

    let json = serde_json::to_string(&result).unwrap();
    let back: FrameResult = serde_json::from_str(&json).unwrap();

    assert_eq!(back.cam_id, result.cam_id);
    assert_eq!(back.frame_id, result.frame_id);
    assert_eq!(back.pts, result.pts);
    assert_eq!(back.results.len(), 1);
    assert_eq!(back.results[0].task_name, "det");
    assert_eq!(back.results[0].detections.len(), 1);
    let d = &back.results[0].detections[0];
    assert_eq!(d.class_name, "person");
    assert!((d.confidence - 0.87).abs() < 1e-6);
    assert!((d.bbox.x2 - 110.0).abs() < 1e-4);
  }
}
