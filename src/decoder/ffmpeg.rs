// 该文件是 Wuling （雾岭） 项目的一部分。
// src/decoder/ffmpeg.rs - FFmpeg + RKMPP 硬件解码
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

//! # FFmpeg 解码实现
//!
//! 从 RTSP 拉流，优先使用 `h264_rkmpp` / `hevc_rkmpp` 硬件解码器，
//! 不可用时回退软件解码。输出 NV12 连续内存帧。

use chrono::Utc;
use ffmpeg_next as ffmpeg;
use ffmpeg_next::Dictionary;
use ffmpeg_next::format::{self, Pixel};
use ffmpeg_next::media::Type;
use ffmpeg_next::util::frame::video::Video;
use tracing::{error, info, warn};

use super::{DecodeError, DecoderConfig, DecoderFactory, FrameSource, StreamInfo, VideoFrame};

pub struct FfmpegDecoderFactory;

impl FfmpegDecoderFactory {
  pub fn new() -> Self {
    FfmpegDecoderFactory
  }
}

impl Default for FfmpegDecoderFactory {
  fn default() -> Self {
    Self::new()
  }
}

impl DecoderFactory for FfmpegDecoderFactory {
  fn open(&self, config: &DecoderConfig) -> Result<Box<dyn FrameSource>, DecodeError> {
    ffmpeg::init().map_err(|e| DecodeError::Unavailable(format!("FFmpeg 初始化失败: {e}")))?;

    info!("打开 RTSP 流: {}", config.rtsp_url);

    let mut opts = Dictionary::new();
    if config.tcp_transport {
      opts.set("rtsp_transport", "tcp");
    }
    // socket 超时（微秒），同时约束连接与读取
    let timeout_us = config.connect_timeout_sec.max(config.read_timeout_sec) as i64 * 1_000_000;
    opts.set("stimeout", &timeout_us.to_string());
    opts.set("analyzeduration", "2000000");
    opts.set("probesize", "2000000");

    let input = format::input_with_dictionary(&config.rtsp_url, opts).map_err(|e| {
      DecodeError::Open {
        url: config.rtsp_url.clone(),
        reason: e.to_string(),
      }
    })?;

    let stream = input
      .streams()
      .best(Type::Video)
      .ok_or(DecodeError::NoVideoStream)?;
    let stream_index = stream.index();
    let parameters = stream.parameters();
    let codec_id = parameters.id();

    let time_base = stream.time_base();
    let time_base = time_base.numerator() as f64 / time_base.denominator() as f64;

    let fps = stream.avg_frame_rate();
    let fps = if fps.denominator() > 0 && fps.numerator() > 0 {
      fps.numerator() as f64 / fps.denominator() as f64
    } else {
      warn!("无法确定帧率, 默认 25.0");
      25.0
    };

    // 优先 RKMPP 硬件解码器
    let hw_name = match codec_id {
      ffmpeg::codec::Id::H264 => Some("h264_rkmpp"),
      ffmpeg::codec::Id::HEVC => Some("hevc_rkmpp"),
      _ => None,
    };

    let (decoder, codec_name, is_hardware) = open_video_decoder(parameters, hw_name)
      .map_err(|e| DecodeError::NoDecoder(format!("{codec_id:?}: {e}")))?;

    let info = StreamInfo {
      width: decoder.width(),
      height: decoder.height(),
      fps,
      codec_name: codec_name.clone(),
      is_hardware,
    };

    info!(
      "解码器已打开: {}x{} @ {:.1}fps, codec={}, hw={}",
      info.width, info.height, info.fps, info.codec_name, info.is_hardware
    );

    Ok(Box::new(FfmpegSource {
      input,
      decoder,
      stream_index,
      time_base,
      info,
    }))
  }
}

fn open_video_decoder(
  parameters: ffmpeg::codec::Parameters,
  hw_name: Option<&str>,
) -> Result<(ffmpeg::decoder::Video, String, bool), ffmpeg::Error> {
  if let Some(name) = hw_name {
    if let Some(codec) = ffmpeg::decoder::find_by_name(name) {
      let context = ffmpeg::codec::context::Context::from_parameters(parameters.clone())?;
      match context.decoder().open_as(codec).and_then(|d| d.video()) {
        Ok(video) => {
          info!("使用硬件解码器: {}", name);
          return Ok((video, name.to_string(), true));
        }
        Err(e) => {
          warn!("硬件解码器 {} 打开失败 ({}), 回退软件解码", name, e);
        }
      }
    } else {
      warn!("硬件解码器 {} 不可用, 回退软件解码", name);
    }
  }

  let context = ffmpeg::codec::context::Context::from_parameters(parameters)?;
  let video = context.decoder().video()?;
  let name = video
    .codec()
    .map(|c| c.name().to_string())
    .unwrap_or_default();
  Ok((video, name, false))
}

struct FfmpegSource {
  input: format::context::Input,
  decoder: ffmpeg::decoder::Video,
  stream_index: usize,
  /// 流时间基（秒）
  time_base: f64,
  info: StreamInfo,
}

impl FfmpegSource {
  /// 读包送解码直到取得一帧；流结束或读错误返回 None
  fn next_decoded(&mut self) -> Option<Video> {
    loop {
      let mut decoded = Video::empty();
      if self.decoder.receive_frame(&mut decoded).is_ok() {
        return Some(decoded);
      }

      let mut packet_iter = self.input.packets();
      loop {
        match packet_iter.next() {
          Some((stream, packet)) => {
            if stream.index() != self.stream_index {
              continue;
            }
            if let Err(e) = self.decoder.send_packet(&packet) {
              warn!("送包到解码器失败, 跳过: {}", e);
            }
            break;
          }
          None => {
            // 流结束: 冲刷解码器拿剩余帧
            let _ = self.decoder.send_eof();
            if self.decoder.receive_frame(&mut decoded).is_ok() {
              return Some(decoded);
            }
            return None;
          }
        }
      }
    }
  }

  /// 把 AVFrame 的 NV12 数据拷到连续内存（消除 stride padding）
  fn extract_nv12(frame: &Video) -> Vec<u8> {
    let w = frame.width() as usize;
    let h = frame.height() as usize;
    let y_size = w * h;
    let uv_size = w * (h / 2);

    let mut buffer = vec![0u8; y_size + uv_size];

    let y_data = frame.data(0);
    let y_stride = frame.stride(0);
    if y_stride == w {
      buffer[..y_size].copy_from_slice(&y_data[..y_size]);
    } else {
      for row in 0..h {
        let src = row * y_stride;
        buffer[row * w..(row + 1) * w].copy_from_slice(&y_data[src..src + w]);
      }
    }

    let uv_data = frame.data(1);
    let uv_stride = frame.stride(1);
    if uv_stride == w {
      buffer[y_size..y_size + uv_size].copy_from_slice(&uv_data[..uv_size]);
    } else {
      for row in 0..h / 2 {
        let src = row * uv_stride;
        buffer[y_size + row * w..y_size + (row + 1) * w].copy_from_slice(&uv_data[src..src + w]);
      }
    }

    buffer
  }
}

impl FrameSource for FfmpegSource {
  fn info(&self) -> &StreamInfo {
    &self.info
  }

  fn decode_frame(&mut self) -> Option<VideoFrame> {
    loop {
      let decoded = self.next_decoded()?;

      // RKMPP 解码输出即系统内存 NV12; 其它格式跳过该帧
      if decoded.format() != Pixel::NV12 {
        warn!("非预期像素格式: {:?} (期望 NV12), 跳过", decoded.format());
        continue;
      }

      let nv12_data = Self::extract_nv12(&decoded);

      let pts = decoded.pts().or_else(|| decoded.timestamp());
      let timestamp_ms = match pts {
        Some(pts) => (pts as f64 * self.time_base * 1000.0) as i64,
        None => {
          // 无 PTS 时以系统时钟兜底
          Utc::now().timestamp_millis()
        }
      };

      if nv12_data.is_empty() {
        error!("NV12 提取结果为空, 跳过");
        continue;
      }

      return Some(VideoFrame {
        width: decoded.width(),
        height: decoded.height(),
        nv12_data,
        pts: pts.unwrap_or(0),
        timestamp_ms,
      });
    }
  }

  fn skip_frame(&mut self) -> bool {
    // 解码成功即丢弃, 不做数据提取
    self.next_decoded().is_some()
  }
}
