// 该文件是 Wuling （雾岭） 项目的一部分。
// src/stream/pipeline.rs - 单路流解码流水线
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

//! # 单路流解码流水线
//!
//! 每路流一个专属线程：打开解码器 → 跳帧/解码 → 按模型逐个
//! letterbox 预处理并提交推理任务 → 另做一次缓存分辨率缩放、
//! JPEG 编码入环形缓存。打开失败或中途解码失败进入指数退避重连
//! （1s 起倍增，上限 8s），stop 信号在每次迭代和退避期间的
//! 100ms 粒度上被观察。
//!
//! 状态机: Stopped → Starting → Running → (Reconnecting ↔ Running) → Stopped。
//!
//! 资源独占：解码器、JPEG 编码器都归本线程；整个解码、预处理、
//! 编码过程不持有任何锁。解码帧在单次迭代内独占，迭代尾释放。

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::cache::{ImageCache, JpegEncoder};
use crate::config::ServerConfig;
use crate::decoder::{DecoderConfig, DecoderFactory, FrameSource};
use crate::infer::{FrameResultCollector, InferenceBackend};
use crate::processor;
use crate::types::{CachedFrame, FrameResult, InferTask, StreamConfig, StreamState};

/// 退避起点（秒）
const BACKOFF_START_SEC: u64 = 1;
/// 退避上限（秒）
const BACKOFF_MAX_SEC: u64 = 8;
/// 退避期间检查 stop 信号的粒度
const BACKOFF_TICK: Duration = Duration::from_millis(100);

/// 单路流的运行时上下文
///
/// 管理线程和流水线线程共享；计数器是 relaxed 原子量，
/// last_error 用独立互斥锁保护，状态查询不会和写入竞争。
pub(crate) struct StreamContext {
  pub config: StreamConfig,
  /// 模型路径 -> 预加载的标签快照
  pub labels: std::collections::HashMap<String, Arc<Vec<String>>>,

  pub stop_requested: AtomicBool,
  pub running: AtomicBool,
  state: AtomicU32,

  pub decoded_frames: AtomicU64,
  pub inferred_frames: AtomicU64,
  pub reconnect_count: AtomicU32,
  last_error: Mutex<String>,
  pub start_time: Mutex<Instant>,

  pub thread: Mutex<Option<JoinHandle<()>>>,
}

impl StreamContext {
  pub fn new(config: StreamConfig, labels: std::collections::HashMap<String, Arc<Vec<String>>>) -> Self {
    StreamContext {
      config,
      labels,
      stop_requested: AtomicBool::new(false),
      running: AtomicBool::new(false),
      state: AtomicU32::new(StreamState::Stopped.as_raw()),
      decoded_frames: AtomicU64::new(0),
      inferred_frames: AtomicU64::new(0),
      reconnect_count: AtomicU32::new(0),
      last_error: Mutex::new(String::new()),
      start_time: Mutex::new(Instant::now()),
      thread: Mutex::new(None),
    }
  }

  pub fn state(&self) -> StreamState {
    StreamState::from_raw(self.state.load(Ordering::Relaxed))
  }

  pub fn set_state(&self, state: StreamState) {
    self.state.store(state.as_raw(), Ordering::Relaxed);
  }

  pub fn set_error(&self, msg: &str) {
    let mut err = self.last_error.lock().expect("last_error mutex poisoned");
    *err = msg.to_string();
  }

  pub fn error(&self) -> String {
    self.last_error.lock().expect("last_error mutex poisoned").clone()
  }

  /// 重置运行统计（重新启动时调用）
  pub fn reset_stats(&self) {
    self.decoded_frames.store(0, Ordering::Relaxed);
    self.inferred_frames.store(0, Ordering::Relaxed);
    self.reconnect_count.store(0, Ordering::Relaxed);
    self.set_error("");
    *self.start_time.lock().expect("start_time mutex poisoned") = Instant::now();
  }
}

/// 流水线依赖的共享协作方
pub(crate) struct PipelineDeps {
  pub engine: Arc<dyn InferenceBackend>,
  pub cache: Arc<ImageCache>,
  pub decoder_factory: Arc<dyn DecoderFactory>,
  pub server_config: ServerConfig,
}

/// 可被 stop 信号打断的退避等待
fn backoff_sleep(ctx: &StreamContext, seconds: u64) {
  let deadline = Instant::now() + Duration::from_secs(seconds);
  while Instant::now() < deadline && !ctx.stop_requested.load(Ordering::Relaxed) {
    std::thread::sleep(BACKOFF_TICK);
  }
}

/// 解码线程主函数
pub(crate) fn run_pipeline(ctx: Arc<StreamContext>, deps: Arc<PipelineDeps>) {
  let cam_id = ctx.config.cam_id.clone();
  info!("[{}] 解码线程启动", cam_id);

  // JPEG 编码器不跨流共享, 在本线程创建并独占
  let jpeg_encoder = JpegEncoder::new(deps.server_config.cache_jpeg_quality);

  // 流内单调帧号, 跨重连会话连续递增
  let mut frame_seq: u64 = 0;
  let mut backoff_sec = BACKOFF_START_SEC;

  while !ctx.stop_requested.load(Ordering::Relaxed) {
    ctx.set_state(StreamState::Starting);

    let dec_cfg = DecoderConfig {
      rtsp_url: ctx.config.rtsp_url.clone(),
      ..DecoderConfig::default()
    };

    info!("[{}] 打开 RTSP 流: {}", cam_id, dec_cfg.rtsp_url);
    let mut source = match deps.decoder_factory.open(&dec_cfg) {
      Ok(source) => source,
      Err(e) => {
        ctx.set_error(&format!("打开流失败: {e}"));
        ctx.set_state(StreamState::Reconnecting);
        ctx.reconnect_count.fetch_add(1, Ordering::Relaxed);
        warn!("[{}] 打开失败, {}s 后重试: {}", cam_id, backoff_sec, e);
        backoff_sleep(&ctx, backoff_sec);
        backoff_sec = (backoff_sec * 2).min(BACKOFF_MAX_SEC);
        continue;
      }
    };

    // 打开成功, 重置退避
    backoff_sec = BACKOFF_START_SEC;
    ctx.set_state(StreamState::Running);
    ctx.set_error("");
    {
      let info = source.info();
      info!(
        "[{}] 流已打开: {}x{} @ {:.1}fps codec={} hw={}",
        cam_id, info.width, info.height, info.fps, info.codec_name, info.is_hardware
      );
    }

    let skip = ctx.config.frame_skip.max(1) as u64;
    // 会话内帧计数, 从 1 起, 用于跳帧取模
    let mut session_index: u64 = 0;

    while !ctx.stop_requested.load(Ordering::Relaxed) {
      session_index += 1;
      let need_process = skip <= 1 || session_index % skip == 0;

      // 跳帧走轻量路径: 只推进解码器, 不提取平面数据
      if !need_process {
        if !source.skip_frame() {
          on_decode_failure(&ctx, &cam_id, backoff_sec);
          break;
        }
        ctx.decoded_frames.fetch_add(1, Ordering::Relaxed);
        continue;
      }

      let Some(frame) = source.decode_frame() else {
        on_decode_failure(&ctx, &cam_id, backoff_sec);
        break;
      };
      ctx.decoded_frames.fetch_add(1, Ordering::Relaxed);
      frame_seq += 1;

      submit_infer_tasks(&ctx, &deps, &cam_id, frame_seq, &frame);
      cache_jpeg_snapshot(&deps, &jpeg_encoder, &cam_id, frame_seq, &frame);

      // frame 在此释放: 解码缓冲只存活一次迭代
    }

    drop(source);

    // 中途失败后的退避 (stop 场景直接退出外层循环)
    if !ctx.stop_requested.load(Ordering::Relaxed) {
      backoff_sleep(&ctx, backoff_sec);
      backoff_sec = (backoff_sec * 2).min(BACKOFF_MAX_SEC);
    }
  }

  ctx.set_state(StreamState::Stopped);
  ctx.running.store(false, Ordering::SeqCst);
  info!(
    "[{}] 解码线程退出 (共解码 {} 帧)",
    cam_id,
    ctx.decoded_frames.load(Ordering::Relaxed)
  );
}

fn on_decode_failure(ctx: &StreamContext, cam_id: &str, backoff_sec: u64) {
  ctx.set_error("解码失败或流已结束");
  ctx.set_state(StreamState::Reconnecting);
  ctx.reconnect_count.fetch_add(1, Ordering::Relaxed);
  warn!("[{}] 解码失败, {}s 后重连...", cam_id, backoff_sec);
}

/// 为每个模型绑定做 letterbox 预处理并提交推理任务
///
/// 任务按模型配置顺序提交；多模型时同帧任务共享一个聚合器。
fn submit_infer_tasks(
  ctx: &StreamContext,
  deps: &PipelineDeps,
  cam_id: &str,
  frame_id: u64,
  frame: &crate::decoder::VideoFrame,
) {
  if ctx.config.models.is_empty() {
    return;
  }

  let num_models = ctx.config.models.len();
  let collector = if num_models > 1 {
    let base = FrameResult {
      cam_id: cam_id.to_string(),
      rtsp_url: ctx.config.rtsp_url.clone(),
      frame_id,
      timestamp_ms: frame.timestamp_ms,
      pts: frame.pts,
      original_width: frame.width,
      original_height: frame.height,
      results: Vec::new(),
    };
    Some(Arc::new(FrameResultCollector::new(num_models, base)))
  } else {
    None
  };

  for mc in &ctx.config.models {
    let Some(rgb) = processor::nv12_to_rgb_letterbox(
      &frame.nv12_data,
      frame.width,
      frame.height,
      mc.input_width,
      mc.input_height,
    ) else {
      warn!("[{}] 模型 {} 预处理失败, 跳过该任务", cam_id, mc.task_name);
      continue;
    };

    let task = InferTask {
      cam_id: cam_id.to_string(),
      rtsp_url: ctx.config.rtsp_url.clone(),
      frame_id,
      pts: frame.pts,
      timestamp_ms: frame.timestamp_ms,
      original_width: frame.width,
      original_height: frame.height,
      model_path: mc.model_path.clone(),
      task_name: mc.task_name.clone(),
      kind: mc.kind,
      conf_threshold: mc.conf_threshold,
      nms_threshold: mc.nms_threshold,
      labels: ctx
        .labels
        .get(&mc.model_path)
        .cloned()
        .unwrap_or_else(|| Arc::new(Vec::new())),
      input_data: rgb,
      input_width: mc.input_width,
      input_height: mc.input_height,
      collector: collector.clone(),
    };

    // 队列满时引擎内部丢最旧; false 只出现在引擎未初始化/停止
    deps.engine.submit(task);
  }
}

/// 缓存分辨率缩放 + JPEG 编码 + 入环
fn cache_jpeg_snapshot(
  deps: &PipelineDeps,
  encoder: &JpegEncoder,
  cam_id: &str,
  frame_id: u64,
  frame: &crate::decoder::VideoFrame,
) {
  let cfg = &deps.server_config;

  let cache_w = if cfg.cache_resize_width > 0 {
    processor::align_even(cfg.cache_resize_width)
  } else {
    processor::align_even(frame.width)
  };
  let cache_h = if cfg.cache_resize_height > 0 {
    processor::align_even(cfg.cache_resize_height)
  } else {
    processor::proportional_height(frame.width, frame.height, cache_w)
  };
  if cache_w == 0 || cache_h == 0 {
    return;
  }

  let Some(rgb) = processor::nv12_to_rgb_resize(
    &frame.nv12_data,
    frame.width,
    frame.height,
    cache_w,
    cache_h,
  ) else {
    warn!("[{}] 缓存缩放失败, 跳过该帧", cam_id);
    return;
  };

  let Some(jpeg) = encoder.encode(&rgb, cache_w, cache_h) else {
    return;
  };

  deps.cache.add_frame(CachedFrame {
    cam_id: cam_id.to_string(),
    frame_id,
    timestamp_ms: frame.timestamp_ms,
    width: cache_w,
    height: cache_h,
    jpeg_data: Arc::new(jpeg),
  });
}
