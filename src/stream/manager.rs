// 该文件是 Wuling （雾岭） 项目的一部分。
// src/stream/manager.rs - 流生命周期管理
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

//! # 流生命周期管理
//!
//! 对流水线做增删启停和状态快照，负责配置持久化。
//! 一把互斥锁保护流表；线程 join 一律在锁外进行，
//! 避免阻塞其它管理操作（死锁规避的关键约定）。

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tracing::{error, info, warn};
use url::Url;

use super::pipeline::{self, PipelineDeps, StreamContext};
use crate::cache::ImageCache;
use crate::config::{self, ServerConfig};
use crate::decoder::DecoderFactory;
use crate::infer::{EngineError, InferenceBackend};
use crate::types::{FrameResult, StreamConfig, StreamState, StreamStatus};

#[derive(Error, Debug)]
pub enum StreamError {
  #[error("cam_id 不能为空")]
  EmptyId,
  #[error("流已存在: {0}")]
  Duplicate(String),
  #[error("RTSP 地址无效 {url}: {reason}")]
  InvalidUrl { url: String, reason: String },
  #[error("模型加载失败: {0}")]
  ModelLoad(#[from] EngineError),
}

pub struct StreamManager {
  config: ServerConfig,
  deps: Arc<PipelineDeps>,
  streams: Mutex<HashMap<String, Arc<StreamContext>>>,
}

impl StreamManager {
  pub fn new(
    config: &ServerConfig,
    engine: Arc<dyn InferenceBackend>,
    cache: Arc<ImageCache>,
    decoder_factory: Arc<dyn DecoderFactory>,
  ) -> Self {
    StreamManager {
      config: config.clone(),
      deps: Arc::new(PipelineDeps {
        engine,
        cache,
        decoder_factory,
        server_config: config.clone(),
      }),
      streams: Mutex::new(HashMap::new()),
    }
  }

  /// 添加并启动一路流
  ///
  /// 校验配置 → 预加载标签 → 加载模型（含上下文预创建, 失败即
  /// 整个调用失败）→ 注册缓存 → 启动解码线程 → 持久化。
  pub fn add_stream(&self, stream_config: StreamConfig) -> Result<(), StreamError> {
    {
      let mut streams = self.streams.lock().expect("manager mutex poisoned");

      if stream_config.cam_id.is_empty() {
        error!("无法添加流: cam_id 为空");
        return Err(StreamError::EmptyId);
      }
      if streams.contains_key(&stream_config.cam_id) {
        warn!("流 {} 已存在", stream_config.cam_id);
        return Err(StreamError::Duplicate(stream_config.cam_id));
      }

      match Url::parse(&stream_config.rtsp_url) {
        Ok(url) if url.scheme() == "rtsp" || url.scheme() == "rtsps" => {}
        Ok(url) => {
          return Err(StreamError::InvalidUrl {
            url: stream_config.rtsp_url.clone(),
            reason: format!("不支持的协议: {}", url.scheme()),
          });
        }
        Err(e) => {
          return Err(StreamError::InvalidUrl {
            url: stream_config.rtsp_url.clone(),
            reason: e.to_string(),
          });
        }
      }

      info!(
        "添加流: [{}] {} (skip={}, {} 个模型)",
        stream_config.cam_id,
        stream_config.rtsp_url,
        stream_config.frame_skip,
        stream_config.models.len()
      );

      // 预加载标签文件
      let mut labels = HashMap::new();
      for mc in &stream_config.models {
        if !mc.labels_file.is_empty() && !labels.contains_key(&mc.model_path) {
          labels.insert(
            mc.model_path.clone(),
            Arc::new(config::load_labels(&mc.labels_file)),
          );
        }
      }

      // 预加载模型 + 预创建全部 worker 上下文; 失败对 add_stream 致命
      self.deps.engine.load_models(&stream_config.models)?;

      // 注册到图片缓存
      self.deps.cache.add_stream(&stream_config.cam_id);

      let cam_id = stream_config.cam_id.clone();
      let ctx = Arc::new(StreamContext::new(stream_config, labels));
      self.spawn_pipeline(&ctx);
      streams.insert(cam_id, ctx);
    }

    // 持久化在锁外, 避免长 IO 阻塞其它操作
    self.save_configs();
    Ok(())
  }

  /// 移除一路流；首次返回 true, 此后的重复调用是 no-op
  pub fn remove_stream(&self, cam_id: &str) -> bool {
    let ctx = {
      let mut streams = self.streams.lock().expect("manager mutex poisoned");
      let Some(ctx) = streams.remove(cam_id) else {
        warn!("无法移除流 {}: 不存在", cam_id);
        return false;
      };
      info!("移除流: [{}]", cam_id);
      ctx.stop_requested.store(true, Ordering::SeqCst);
      ctx
    };

    // 锁外 join, 不阻塞其它管理操作
    if let Some(handle) = ctx.thread.lock().expect("thread mutex poisoned").take() {
      let _ = handle.join();
    }

    self.deps.cache.remove_stream(cam_id);
    self.save_configs();
    true
  }

  /// 重新启动已停止的流（重置统计）
  pub fn start_stream(&self, cam_id: &str) -> bool {
    let ctx = {
      let streams = self.streams.lock().expect("manager mutex poisoned");
      let Some(ctx) = streams.get(cam_id) else {
        warn!("无法启动流 {}: 不存在", cam_id);
        return false;
      };
      Arc::clone(ctx)
    };

    if ctx.running.load(Ordering::SeqCst) {
      warn!("流 {} 已在运行", cam_id);
      return true;
    }

    info!("启动流: [{}]", cam_id);

    // 等待旧线程完全退出
    if let Some(handle) = ctx.thread.lock().expect("thread mutex poisoned").take() {
      let _ = handle.join();
    }

    ctx.reset_stats();
    self.spawn_pipeline(&ctx);
    true
  }

  /// 停止一路流（同步等待线程退出）
  pub fn stop_stream(&self, cam_id: &str) -> bool {
    let ctx = {
      let streams = self.streams.lock().expect("manager mutex poisoned");
      let Some(ctx) = streams.get(cam_id) else {
        warn!("无法停止流 {}: 不存在", cam_id);
        return false;
      };
      Arc::clone(ctx)
    };

    info!("停止流: [{}]", cam_id);
    ctx.stop_requested.store(true, Ordering::SeqCst);

    if let Some(handle) = ctx.thread.lock().expect("thread mutex poisoned").take() {
      let _ = handle.join();
    }
    true
  }

  /// 启动所有未运行的流
  pub fn start_all(&self) {
    let cam_ids: Vec<String> = {
      let streams = self.streams.lock().expect("manager mutex poisoned");
      streams
        .iter()
        .filter(|(_, ctx)| !ctx.running.load(Ordering::SeqCst))
        .map(|(id, _)| id.clone())
        .collect()
    };
    for id in cam_ids {
      self.start_stream(&id);
    }
  }

  /// 停止所有流
  pub fn stop_all(&self) {
    let contexts: Vec<Arc<StreamContext>> = {
      let streams = self.streams.lock().expect("manager mutex poisoned");
      streams
        .values()
        .map(|ctx| {
          ctx.stop_requested.store(true, Ordering::SeqCst);
          Arc::clone(ctx)
        })
        .collect()
    };
    // 锁外统一 join
    for ctx in contexts {
      if let Some(handle) = ctx.thread.lock().expect("thread mutex poisoned").take() {
        let _ = handle.join();
      }
    }
  }

  /// 全部流的状态快照
  pub fn get_all_status(&self) -> Vec<StreamStatus> {
    let streams = self.streams.lock().expect("manager mutex poisoned");
    streams.values().map(|ctx| build_status(ctx)).collect()
  }

  /// 单路流的状态快照
  pub fn get_status(&self, cam_id: &str) -> Option<StreamStatus> {
    let streams = self.streams.lock().expect("manager mutex poisoned");
    streams.get(cam_id).map(|ctx| build_status(ctx))
  }

  /// 全部流配置快照
  pub fn get_all_configs(&self) -> Vec<StreamConfig> {
    let streams = self.streams.lock().expect("manager mutex poisoned");
    streams.values().map(|ctx| ctx.config.clone()).collect()
  }

  pub fn has_stream(&self, cam_id: &str) -> bool {
    let streams = self.streams.lock().expect("manager mutex poisoned");
    streams.contains_key(cam_id)
  }

  pub fn stream_count(&self) -> usize {
    self.streams.lock().expect("manager mutex poisoned").len()
  }

  /// 引擎结果回调：推进对应流的 inferred 计数
  ///
  /// 流已被移除时是 no-op。
  pub fn on_infer_result(&self, result: &FrameResult) {
    let streams = self.streams.lock().expect("manager mutex poisoned");
    if let Some(ctx) = streams.get(&result.cam_id) {
      ctx.inferred_frames.fetch_add(1, Ordering::Relaxed);
    }
  }

  /// 按顺序添加持久化的流配置
  pub fn load_and_start(&self, configs: Vec<StreamConfig>) {
    info!("恢复 {} 路持久化流...", configs.len());
    for cfg in configs {
      let cam_id = cfg.cam_id.clone();
      if let Err(e) = self.add_stream(cfg) {
        error!("恢复流 [{}] 失败: {}", cam_id, e);
      }
    }
  }

  /// 停止全部流并等待线程汇合
  pub fn shutdown(&self) {
    info!("StreamManager 关闭中...");
    self.stop_all();
    info!("StreamManager 关闭完成");
  }

  fn spawn_pipeline(&self, ctx: &Arc<StreamContext>) {
    ctx.stop_requested.store(false, Ordering::SeqCst);
    ctx.running.store(true, Ordering::SeqCst);
    ctx.set_state(StreamState::Starting);

    let thread_ctx = Arc::clone(ctx);
    let deps = Arc::clone(&self.deps);
    let handle = std::thread::Builder::new()
      .name(format!("stream-{}", ctx.config.cam_id))
      .spawn(move || pipeline::run_pipeline(thread_ctx, deps))
      .expect("无法创建解码线程");

    *ctx.thread.lock().expect("thread mutex poisoned") = Some(handle);
  }

  fn save_configs(&self) {
    let configs = self.get_all_configs();
    match config::save_streams(&self.config.streams_save_path, &configs) {
      Ok(()) => info!(
        "已保存 {} 路流配置到 {}",
        configs.len(),
        self.config.streams_save_path
      ),
      Err(e) => error!("流配置保存失败: {}", e),
    }
  }
}

impl Drop for StreamManager {
  fn drop(&mut self) {
    self.shutdown();
  }
}

fn build_status(ctx: &StreamContext) -> StreamStatus {
  let uptime_seconds = ctx
    .start_time
    .lock()
    .expect("start_time mutex poisoned")
    .elapsed()
    .as_secs_f64();
  let decoded_frames = ctx.decoded_frames.load(Ordering::Relaxed);
  let inferred_frames = ctx.inferred_frames.load(Ordering::Relaxed);

  let (decode_fps, infer_fps) = if uptime_seconds > 0.0 {
    (
      decoded_frames as f64 / uptime_seconds,
      inferred_frames as f64 / uptime_seconds,
    )
  } else {
    (0.0, 0.0)
  };

  StreamStatus {
    cam_id: ctx.config.cam_id.clone(),
    rtsp_url: ctx.config.rtsp_url.clone(),
    status: ctx.state().as_str().to_string(),
    frame_skip: ctx.config.frame_skip,
    models: ctx.config.models.clone(),
    decoded_frames,
    inferred_frames,
    dropped_frames: 0,
    decode_fps,
    infer_fps,
    reconnect_count: ctx.reconnect_count.load(Ordering::Relaxed),
    last_error: ctx.error(),
    uptime_seconds,
  }
}
