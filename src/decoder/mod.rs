// 该文件是 Wuling （雾岭） 项目的一部分。
// src/decoder/mod.rs - 视频解码抽象
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

//! # 视频解码抽象
//!
//! 流水线通过 [`DecoderFactory`] / [`FrameSource`] 两个 trait 使用解码器，
//! 重连即重新 `open`。跳帧走 [`FrameSource::skip_frame`] 轻量路径：
//! 只推进解码器状态，不做 GPU→CPU 拷贝和 NV12 提取，
//! 省掉被丢弃帧每帧约 1.4MB 的分配和 memcpy。
//!
//! 启用 `ffmpeg` 特性时由 [`FfmpegDecoderFactory`]（FFmpeg + RKMPP
//! 硬件解码，软解兜底）提供实现。

#[cfg(feature = "ffmpeg")]
mod ffmpeg;

#[cfg(feature = "ffmpeg")]
pub use self::ffmpeg::FfmpegDecoderFactory;

use thiserror::Error;

/// 解码器配置
#[derive(Debug, Clone)]
pub struct DecoderConfig {
  pub rtsp_url: String,
  /// RTSP 连接超时（秒）
  pub connect_timeout_sec: u32,
  /// 读取超时（秒），限制网络 IO 最长阻塞时间
  pub read_timeout_sec: u32,
  /// 使用 TCP 传输（更可靠）
  pub tcp_transport: bool,
}

impl Default for DecoderConfig {
  fn default() -> Self {
    DecoderConfig {
      rtsp_url: String::new(),
      connect_timeout_sec: 5,
      read_timeout_sec: 5,
      tcp_transport: true,
    }
  }
}

/// 打开流后协商出的参数
#[derive(Debug, Clone, Default)]
pub struct StreamInfo {
  pub width: u32,
  pub height: u32,
  pub fps: f64,
  /// 解码器名称（如 "h264_rkmpp"）
  pub codec_name: String,
  /// 是否使用硬件解码器
  pub is_hardware: bool,
}

/// 一帧解码输出
///
/// NV12 连续内存：Y 平面 `W*H` 字节 + UV 交织平面 `W*(H/2)` 字节，
/// 行距等于宽度（解码实现负责消除 stride padding）。
/// 缓冲由流水线在单次迭代内独占持有，迭代结束即释放。
pub struct VideoFrame {
  pub nv12_data: Vec<u8>,
  pub width: u32,
  pub height: u32,
  /// 原始 PTS
  pub pts: i64,
  /// 墙钟毫秒时间戳（由容器时间基换算，无 PTS 时取系统时钟）
  pub timestamp_ms: i64,
}

#[derive(Error, Debug)]
pub enum DecodeError {
  #[error("无法打开流 {url}: {reason}")]
  Open { url: String, reason: String },
  #[error("流中没有视频轨道")]
  NoVideoStream,
  #[error("找不到可用的解码器: {0}")]
  NoDecoder(String),
  #[error("解码器不可用: {0}")]
  Unavailable(String),
}

/// 已打开的帧源
pub trait FrameSource: Send {
  /// 协商出的流参数
  fn info(&self) -> &StreamInfo;

  /// 解码下一帧并提取 NV12 数据
  ///
  /// 阻塞到取得下一帧；流结束或读错误返回 None（上层进入重连）。
  fn decode_frame(&mut self) -> Option<VideoFrame>;

  /// 跳帧：推进解码器状态但丢弃帧数据
  ///
  /// 返回 false 表示流结束或出错。
  fn skip_frame(&mut self) -> bool;
}

/// 解码器工厂
///
/// 流水线线程每次（重）连接调用一次 `open`；
/// 返回的帧源归该线程独占。
pub trait DecoderFactory: Send + Sync {
  fn open(&self, config: &DecoderConfig) -> Result<Box<dyn FrameSource>, DecodeError>;
}
