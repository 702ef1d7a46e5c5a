// 该文件是 Wuling （雾岭） 项目的一部分。
// src/infer/engine.rs - 推理引擎
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

//! # 推理引擎
//!
//! 统一编排模型注册表、全局有界任务队列、worker 线程池和结果发布：
//! - `load_models()` 加载模型并同步预创建所有 (worker, 模型) 上下文
//! - `submit()` 把任务推入全局队列（满时丢最旧）
//! - worker 完成一帧后，引擎负责发布 + 额外回调（流管理器统计）
//! - `shutdown()` 按顺序停队列、汇合 worker、关发布器、卸载模型

use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tracing::{info, warn};

use super::registry::{ModelRegistry, RegistryError};
use super::worker::{InferWorker, OnComplete};
use crate::config::ServerConfig;
use crate::npu::{NpuRuntime, core_mask};
use crate::publisher::ResultPublisher;
use crate::queue::BoundedQueue;
use crate::types::{FrameResult, InferTask, ModelConfig};

/// 额外结果回调（发布之外的观察方，如流管理器的计数）
pub type ResultCallback = Arc<dyn Fn(&FrameResult) + Send + Sync>;

#[derive(Error, Debug)]
pub enum EngineError {
  #[error("引擎尚未初始化")]
  NotInitialized,
  #[error("模型加载失败 {path}: {source}")]
  ModelLoad {
    path: String,
    source: RegistryError,
  },
  #[error("worker {worker_id} 预创建上下文失败: {path}")]
  ContextPrecreate { worker_id: usize, path: String },
  #[error("发布器初始化失败: {0}")]
  PublisherInit(String),
}

/// 流水线看到的推理后端：加载模型 + 提交任务
///
/// 流管理器只依赖这层接口，测试可以用桩实现替换整个引擎。
pub trait InferenceBackend: Send + Sync {
  /// 加载流引用的所有模型，并在返回前完成全部上下文预创建
  fn load_models(&self, models: &[ModelConfig]) -> Result<(), EngineError>;

  /// 提交推理任务；仅在引擎未初始化或队列已停止时返回 false
  fn submit(&self, task: InferTask) -> bool;
}

/// worker 完成回调共享的结果路由
struct ResultRouter {
  publisher: Mutex<Option<Box<dyn ResultPublisher>>>,
  callback: Mutex<Option<ResultCallback>>,
}

impl ResultRouter {
  fn route(&self, result: FrameResult) {
    if let Some(publisher) = &*self.publisher.lock().expect("router mutex poisoned") {
      publisher.publish(&result);
    }
    if let Some(callback) = &*self.callback.lock().expect("router mutex poisoned") {
      callback(&result);
    }
  }
}

pub struct InferenceEngine {
  config: ServerConfig,
  registry: Arc<ModelRegistry>,
  queue: Arc<BoundedQueue<InferTask>>,
  workers: Mutex<Vec<InferWorker>>,
  router: Arc<ResultRouter>,
  initialized: AtomicBool,
}

impl InferenceEngine {
  pub fn new(config: &ServerConfig, runtime: Arc<dyn NpuRuntime>) -> Self {
    InferenceEngine {
      config: config.clone(),
      registry: Arc::new(ModelRegistry::new(runtime)),
      queue: Arc::new(BoundedQueue::new(config.infer_queue_size)),
      workers: Mutex::new(Vec::new()),
      router: Arc::new(ResultRouter {
        publisher: Mutex::new(None),
        callback: Mutex::new(None),
      }),
      initialized: AtomicBool::new(false),
    }
  }

  /// 设置额外结果回调（应在 init 之前调用）
  pub fn set_result_callback(&self, callback: ResultCallback) {
    *self.router.callback.lock().expect("router mutex poisoned") = Some(callback);
  }

  /// 初始化引擎：创建发布器和 worker 线程池
  pub fn init(&self) -> Result<(), EngineError> {
    if self.initialized.load(Ordering::SeqCst) {
      warn!("InferenceEngine 已初始化, 忽略重复调用");
      return Ok(());
    }

    info!("初始化 InferenceEngine...");
    info!("  worker 数量: {}", self.config.num_infer_workers);
    info!("  队列容量:    {}", self.config.infer_queue_size);
    info!("  NPU 核心数:  {}", self.config.num_npu_cores);

    #[cfg(feature = "zmq-publish")]
    {
      info!("  发布端点:    {}", self.config.zmq_endpoint);
      let publisher = crate::publisher::ZmqPublisher::bind(&self.config.zmq_endpoint)
        .map_err(|e| EngineError::PublisherInit(e.to_string()))?;
      *self.router.publisher.lock().expect("router mutex poisoned") = Some(Box::new(publisher));
    }
    #[cfg(not(feature = "zmq-publish"))]
    warn!("未启用 zmq-publish 特性, 结果只通过回调传递");

    let router = Arc::clone(&self.router);
    let on_complete: OnComplete = Arc::new(move |result| router.route(result));

    let mut workers = self.workers.lock().expect("engine workers mutex poisoned");
    for worker_id in 0..self.config.num_infer_workers.max(1) {
      let mut worker = InferWorker::new(
        worker_id,
        core_mask::from_worker_id(worker_id),
        Arc::clone(&self.registry),
        Arc::clone(&self.queue),
        Arc::clone(&on_complete),
      );
      worker.start();
      workers.push(worker);
    }

    self.initialized.store(true, Ordering::SeqCst);
    info!("InferenceEngine 初始化完成 ({} 个 worker)", workers.len());
    Ok(())
  }

  /// 优雅关闭：停队列 -> 汇合 worker -> 关发布器 -> 卸载模型
  pub fn shutdown(&self) {
    if !self.initialized.swap(false, Ordering::SeqCst) {
      return;
    }

    info!("InferenceEngine 关闭中...");
    self.queue.stop();

    let mut workers = self.workers.lock().expect("engine workers mutex poisoned");
    for worker in workers.iter_mut() {
      worker.stop();
    }
    workers.clear();
    drop(workers);

    if let Some(publisher) = self
      .router
      .publisher
      .lock()
      .expect("router mutex poisoned")
      .take()
    {
      publisher.shutdown();
    }

    self.registry.unload_all();
    info!("InferenceEngine 关闭完成");
  }

  // ---- 状态查询 ----

  pub fn is_initialized(&self) -> bool {
    self.initialized.load(Ordering::SeqCst)
  }

  /// 任务队列当前长度
  pub fn queue_size(&self) -> usize {
    self.queue.len()
  }

  /// 任务队列累计丢弃数
  pub fn queue_dropped(&self) -> u64 {
    self.queue.dropped_count()
  }

  /// worker 数量
  pub fn worker_count(&self) -> usize {
    self.workers.lock().expect("engine workers mutex poisoned").len()
  }

  /// 所有 worker 已处理的任务总数
  pub fn total_processed(&self) -> u64 {
    self
      .workers
      .lock()
      .expect("engine workers mutex poisoned")
      .iter()
      .map(|w| w.processed_count())
      .sum()
  }

  /// 已发布消息计数
  pub fn published_count(&self) -> u64 {
    self
      .router
      .publisher
      .lock()
      .expect("router mutex poisoned")
      .as_ref()
      .map(|p| p.published_count())
      .unwrap_or(0)
  }

  /// 模型注册表（只读访问）
  pub fn registry(&self) -> &Arc<ModelRegistry> {
    &self.registry
  }
}

impl InferenceBackend for InferenceEngine {
  fn load_models(&self, models: &[ModelConfig]) -> Result<(), EngineError> {
    if !self.initialized.load(Ordering::SeqCst) {
      return Err(EngineError::NotInitialized);
    }

    let workers = self.workers.lock().expect("engine workers mutex poisoned");
    for mc in models {
      if !self.registry.is_loaded(&mc.model_path) {
        info!("预加载模型: {} (task={})", mc.model_path, mc.task_name);
        self
          .registry
          .load(&mc.model_path)
          .map_err(|source| EngineError::ModelLoad {
            path: mc.model_path.clone(),
            source,
          })?;

        // 声明的输入尺寸和模型实际属性不一致只告警, 以配置为准
        if let Some(info) = self.registry.model_info(&mc.model_path) {
          let declared = 3 * mc.input_width as usize * mc.input_height as usize;
          if let Some(attr) = info.input_attrs.first() {
            if attr.n_elems != 0 && attr.n_elems != declared {
              warn!(
                "模型 {} 输入元素数 {} 与配置 {}x{}x3 不一致",
                mc.model_path, attr.n_elems, mc.input_width, mc.input_height
              );
            }
          }
        }
      }

      // 预创建所有 (worker, 模型) 上下文: 复制不能与流水线的
      // 2D 加速器调用并发, 必须在提交任何帧之前完成
      for worker in workers.iter() {
        if !worker.pre_create_context(&mc.model_path) {
          return Err(EngineError::ContextPrecreate {
            worker_id: worker.worker_id(),
            path: mc.model_path.clone(),
          });
        }
      }
    }
    Ok(())
  }

  fn submit(&self, task: InferTask) -> bool {
    if !self.initialized.load(Ordering::SeqCst) {
      warn!("InferenceEngine 未初始化, 丢弃任务");
      return false;
    }
    self.queue.push(task)
  }
}

impl Drop for InferenceEngine {
  fn drop(&mut self) {
    self.shutdown();
  }
}
