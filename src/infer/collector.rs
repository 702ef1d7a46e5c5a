// 该文件是 Wuling （雾岭） 项目的一部分。
// src/infer/collector.rs - 多模型推理结果聚合器
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

//! # 帧结果聚合器
//!
//! 一帧需要多个模型推理时（如同时检测手机和吸烟），解码线程为该帧创建
//! 一个 `FrameResultCollector`，同帧的所有 `InferTask` 通过 `Arc` 共享它。
//! 多个 worker 线程并发调用 `add_result()`，把计数推到 N 的那一次调用
//! 拿到完整的 `FrameResult`，其余调用返回 None。
//!
//! 聚合器不设超时：若某个 worker 永远不完成（流被中途删除），
//! 最后一个 `Arc` 释放时聚合器随之销毁，该帧不产生结果。

use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::types::{FrameResult, ModelResult};

pub struct FrameResultCollector {
  total_models: usize,
  completed: AtomicUsize,
  result: Mutex<Option<FrameResult>>,
}

impl FrameResultCollector {
  /// 构造聚合器
  ///
  /// `total_models` 为需要等待的模型总数，`base` 携带帧标识信息
  /// （cam_id、frame_id、时间戳等），其 `results` 必须为空。
  pub fn new(total_models: usize, base: FrameResult) -> Self {
    debug_assert!(total_models >= 1);
    debug_assert!(base.results.is_empty());
    FrameResultCollector {
      total_models,
      completed: AtomicUsize::new(0),
      result: Mutex::new(Some(base)),
    }
  }

  /// 添加一个模型的推理结果（线程安全）
  ///
  /// 把完成计数推到 `total_models` 的那次调用返回完整的
  /// `FrameResult`，其余调用返回 None。聚合完成后再调用属于使用错误。
  pub fn add_result(&self, model_result: ModelResult) -> Option<FrameResult> {
    let mut guard = self.result.lock().expect("collector mutex poisoned");
    let Some(result) = guard.as_mut() else {
      debug_assert!(false, "add_result called after collector completed");
      return None;
    };

    result.results.push(model_result);
    let completed = self.completed.fetch_add(1, Ordering::Relaxed) + 1;

    if completed == self.total_models {
      return guard.take();
    }
    None
  }

  /// 模型总数
  pub fn total_models(&self) -> usize {
    self.total_models
  }

  /// 已完成的模型数
  pub fn completed_count(&self) -> usize {
    self.completed.load(Ordering::Relaxed)
  }

  /// 是否已全部完成
  pub fn is_complete(&self) -> bool {
    self.completed_count() >= self.total_models
  }
}
