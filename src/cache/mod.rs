// 该文件是 Wuling （雾岭） 项目的一部分。
// src/cache/mod.rs - 图片环形缓存
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

//! # 图片环形缓存
//!
//! 每路流一个按时间戳升序的 JPEG 环：插入时先淘汰该流的过期帧，
//! 再追加到尾部；全局字节预算超限时跨流淘汰最旧的头部帧。
//! 下游告警消费方凭时间戳取回对应检测帧的图片。
//!
//! 并发模型：流表一把锁，每个环各自一把锁，全局字节计数为原子量。
//! 读一个环不会阻塞其它环的写。环内顺序由流水线保证：
//! 单生产者按时间戳序追加，淘汰只从头部弹出。

mod jpeg;

pub use jpeg::JpegEncoder;

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, info};

use crate::types::CachedFrame;

struct StreamRing {
  frames: Mutex<VecDeque<CachedFrame>>,
  memory_bytes: AtomicUsize,
}

impl StreamRing {
  fn new() -> Self {
    StreamRing {
      frames: Mutex::new(VecDeque::new()),
      memory_bytes: AtomicUsize::new(0),
    }
  }
}

pub struct ImageCache {
  /// 保留时长（毫秒）
  duration_ms: i64,
  /// 全局字节预算（0 = 不限制）
  max_memory_bytes: usize,
  streams: Mutex<HashMap<String, Arc<StreamRing>>>,
  total_memory: AtomicUsize,
}

impl ImageCache {
  pub fn new(duration_sec: u64, max_memory_mb: usize) -> Self {
    info!(
      "ImageCache 创建: 保留 {}s, 内存上限 {}MB",
      duration_sec, max_memory_mb
    );
    ImageCache {
      duration_ms: duration_sec as i64 * 1000,
      max_memory_bytes: max_memory_mb * 1024 * 1024,
      streams: Mutex::new(HashMap::new()),
      total_memory: AtomicUsize::new(0),
    }
  }

  /// 显式注册流（插入时也会按需创建）
  pub fn add_stream(&self, cam_id: &str) {
    let mut streams = self.streams.lock().expect("cache map mutex poisoned");
    if !streams.contains_key(cam_id) {
      streams.insert(cam_id.to_string(), Arc::new(StreamRing::new()));
      debug!("ImageCache: 注册流 {}", cam_id);
    }
  }

  /// 移除流并从全局计数中扣除其字节
  pub fn remove_stream(&self, cam_id: &str) {
    let mut streams = self.streams.lock().expect("cache map mutex poisoned");
    if let Some(ring) = streams.remove(cam_id) {
      let bytes = ring.memory_bytes.load(Ordering::Relaxed);
      self.total_memory.fetch_sub(bytes, Ordering::Relaxed);
      debug!("ImageCache: 移除流 {} (释放 {} 字节)", cam_id, bytes);
    }
  }

  /// 插入一帧
  ///
  /// 先按保留时长淘汰该流头部的过期帧，追加新帧；
  /// 之后若全局字节超出预算，跨流淘汰最旧的帧直到回到预算内。
  pub fn add_frame(&self, frame: CachedFrame) {
    let ring = self.get_or_create(&frame.cam_id);
    let frame_size = frame.jpeg_size();

    {
      let mut frames = ring.frames.lock().expect("cache ring mutex poisoned");

      // 按时间淘汰: ts < 新帧 ts - 保留时长
      let threshold = frame.timestamp_ms - self.duration_ms;
      while let Some(front) = frames.front() {
        if front.timestamp_ms >= threshold {
          break;
        }
        let size = front.jpeg_size();
        frames.pop_front();
        ring.memory_bytes.fetch_sub(size, Ordering::Relaxed);
        self.total_memory.fetch_sub(size, Ordering::Relaxed);
      }

      frames.push_back(frame);
      ring.memory_bytes.fetch_add(frame_size, Ordering::Relaxed);
    }
    self.total_memory.fetch_add(frame_size, Ordering::Relaxed);

    if self.max_memory_bytes > 0
      && self.total_memory.load(Ordering::Relaxed) > self.max_memory_bytes
    {
      self.evict_global();
    }
  }

  /// 精确时间戳查询
  pub fn get_frame(&self, cam_id: &str, timestamp_ms: i64) -> Option<CachedFrame> {
    let ring = self.get(cam_id)?;
    let frames = ring.frames.lock().expect("cache ring mutex poisoned");
    frames
      .iter()
      .find(|f| f.timestamp_ms == timestamp_ms)
      .cloned()
  }

  /// 最近时间戳查询（|frame.ts - ts| 最小）
  pub fn get_nearest_frame(&self, cam_id: &str, timestamp_ms: i64) -> Option<CachedFrame> {
    let ring = self.get(cam_id)?;
    let frames = ring.frames.lock().expect("cache ring mutex poisoned");
    frames
      .iter()
      .min_by_key(|f| (f.timestamp_ms - timestamp_ms).abs())
      .cloned()
  }

  /// 最新一帧
  pub fn get_latest_frame(&self, cam_id: &str) -> Option<CachedFrame> {
    let ring = self.get(cam_id)?;
    let frames = ring.frames.lock().expect("cache ring mutex poisoned");
    frames.back().cloned()
  }

  /// 全局字节占用
  pub fn total_memory_bytes(&self) -> usize {
    self.total_memory.load(Ordering::Relaxed)
  }

  /// 全部流的帧总数
  pub fn total_frames(&self) -> usize {
    let streams = self.streams.lock().expect("cache map mutex poisoned");
    streams
      .values()
      .map(|ring| ring.frames.lock().expect("cache ring mutex poisoned").len())
      .sum()
  }

  /// 指定流的帧数
  pub fn stream_frame_count(&self, cam_id: &str) -> usize {
    self
      .get(cam_id)
      .map(|ring| ring.frames.lock().expect("cache ring mutex poisoned").len())
      .unwrap_or(0)
  }

  /// 流数量
  pub fn stream_count(&self) -> usize {
    self.streams.lock().expect("cache map mutex poisoned").len()
  }

  fn get_or_create(&self, cam_id: &str) -> Arc<StreamRing> {
    let mut streams = self.streams.lock().expect("cache map mutex poisoned");
    Arc::clone(
      streams
        .entry(cam_id.to_string())
        .or_insert_with(|| Arc::new(StreamRing::new())),
    )
  }

  fn get(&self, cam_id: &str) -> Option<Arc<StreamRing>> {
    let streams = self.streams.lock().expect("cache map mutex poisoned");
    streams.get(cam_id).cloned()
  }

  /// 跨流淘汰最旧帧直到全局字节回到预算内
  fn evict_global(&self) {
    let streams = self.streams.lock().expect("cache map mutex poisoned");

    let mut evicted = 0usize;
    while self.total_memory.load(Ordering::Relaxed) > self.max_memory_bytes {
      // 找头部时间戳最旧的流
      let mut oldest: Option<(&String, i64)> = None;
      for (cam_id, ring) in streams.iter() {
        let frames = ring.frames.lock().expect("cache ring mutex poisoned");
        if let Some(front) = frames.front() {
          if oldest.map(|(_, ts)| front.timestamp_ms < ts).unwrap_or(true) {
            oldest = Some((cam_id, front.timestamp_ms));
          }
        }
      }

      let Some((cam_id, _)) = oldest else {
        break; // 所有环都已空
      };

      let ring = &streams[cam_id];
      let mut frames = ring.frames.lock().expect("cache ring mutex poisoned");
      if let Some(front) = frames.pop_front() {
        let size = front.jpeg_size();
        ring.memory_bytes.fetch_sub(size, Ordering::Relaxed);
        self.total_memory.fetch_sub(size, Ordering::Relaxed);
        evicted += 1;
      }
    }

    if evicted > 0 {
      debug!(
        "ImageCache: 内存淘汰 {} 帧 ({:.1}MB / {:.1}MB)",
        evicted,
        self.total_memory.load(Ordering::Relaxed) as f64 / (1024.0 * 1024.0),
        self.max_memory_bytes as f64 / (1024.0 * 1024.0)
      );
    }
  }
}
