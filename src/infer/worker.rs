// 该文件是 Wuling （雾岭） 项目的一部分。
// src/infer/worker.rs - NPU 推理工作线程
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

//! # 推理工作线程
//!
//! 每个 worker 是一个长驻单线程 actor：带超时地从全局队列取任务，
//! 在自己独占的 NPU 上下文上执行推理，解码检测结果后交给聚合器或
//! 直接组装帧结果回调。
//!
//! 上下文按 (worker, 模型) 独占，正常情况下由引擎的 `load_models`
//! 预先创建；取任务时发现缺失才走惰性创建兜底。
//! worker 停止时释放持有的全部上下文。

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use super::postprocess;
use super::registry::ModelRegistry;
use crate::npu::NpuContext;
use crate::queue::BoundedQueue;
use crate::types::{FrameResult, InferTask, ModelResult};

/// 结果完成回调
pub type OnComplete = Arc<dyn Fn(FrameResult) + Send + Sync>;

/// 队列 pop 超时：保证 stop 信号能被及时观察到
const POP_TIMEOUT: Duration = Duration::from_millis(500);

struct WorkerShared {
  worker_id: usize,
  core_mask: u32,
  registry: Arc<ModelRegistry>,
  queue: Arc<BoundedQueue<InferTask>>,
  on_complete: OnComplete,
  /// (模型路径 -> 该 worker 独占的 NPU 上下文)
  contexts: Mutex<HashMap<String, Box<dyn NpuContext>>>,
  processed: AtomicU64,
  stop_requested: AtomicBool,
}

pub struct InferWorker {
  shared: Arc<WorkerShared>,
  handle: Option<thread::JoinHandle<()>>,
}

impl InferWorker {
  pub fn new(
    worker_id: usize,
    core_mask: u32,
    registry: Arc<ModelRegistry>,
    queue: Arc<BoundedQueue<InferTask>>,
    on_complete: OnComplete,
  ) -> Self {
    InferWorker {
      shared: Arc::new(WorkerShared {
        worker_id,
        core_mask,
        registry,
        queue,
        on_complete,
        contexts: Mutex::new(HashMap::new()),
        processed: AtomicU64::new(0),
        stop_requested: AtomicBool::new(false),
      }),
      handle: None,
    }
  }

  /// 启动 worker 线程
  pub fn start(&mut self) {
    if self.handle.is_some() {
      return;
    }
    self.shared.stop_requested.store(false, Ordering::SeqCst);

    let shared = Arc::clone(&self.shared);
    let handle = thread::Builder::new()
      .name(format!("infer-worker-{}", self.shared.worker_id))
      .spawn(move || run(shared))
      .expect("无法创建 worker 线程");
    self.handle = Some(handle);

    info!(
      "InferWorker[{}] 已启动 (core_mask={})",
      self.shared.worker_id, self.shared.core_mask
    );
  }

  /// 停止 worker：等待线程退出并释放全部上下文
  pub fn stop(&mut self) {
    let Some(handle) = self.handle.take() else {
      return;
    };
    self.shared.stop_requested.store(true, Ordering::SeqCst);
    if handle.join().is_err() {
      error!("InferWorker[{}] 线程异常退出", self.shared.worker_id);
    }

    let mut contexts = self.shared.contexts.lock().expect("worker contexts mutex poisoned");
    for path in contexts.keys() {
      debug!("InferWorker[{}] 释放模型上下文: {}", self.shared.worker_id, path);
    }
    contexts.clear();

    info!(
      "InferWorker[{}] 已停止 (处理 {} 个任务)",
      self.shared.worker_id,
      self.processed_count()
    );
  }

  /// 预创建 (worker, 模型) 上下文
  ///
  /// 由引擎在 `load_models` 时调用，确保所有上下文复制完成后
  /// 才开始提交该模型的帧（复制不能与 2D 加速器调用并发）。
  pub fn pre_create_context(&self, model_path: &str) -> bool {
    let mut contexts = self.shared.contexts.lock().expect("worker contexts mutex poisoned");
    if contexts.contains_key(model_path) {
      return true;
    }

    info!(
      "InferWorker[{}] 预创建模型上下文: {}",
      self.shared.worker_id, model_path
    );
    match self
      .shared
      .registry
      .create_worker_context(model_path, self.shared.core_mask)
    {
      Ok(ctx) => {
        contexts.insert(model_path.to_string(), ctx);
        true
      }
      Err(e) => {
        error!(
          "InferWorker[{}] 预创建上下文失败 {}: {}",
          self.shared.worker_id, model_path, e
        );
        false
      }
    }
  }

  pub fn worker_id(&self) -> usize {
    self.shared.worker_id
  }

  /// 已成功处理的任务数
  pub fn processed_count(&self) -> u64 {
    self.shared.processed.load(Ordering::Relaxed)
  }
}

impl Drop for InferWorker {
  fn drop(&mut self) {
    self.stop();
  }
}

fn run(shared: Arc<WorkerShared>) {
  debug!("InferWorker[{}] 线程开始运行", shared.worker_id);

  while !shared.stop_requested.load(Ordering::Relaxed) {
    let Some(task) = shared.queue.pop(POP_TIMEOUT) else {
      continue;
    };
    if process_task(&shared, task) {
      shared.processed.fetch_add(1, Ordering::Relaxed);
    }
  }

  debug!("InferWorker[{}] 线程退出", shared.worker_id);
}

/// 处理单个任务。返回 true 表示任务产生了结果（成功路径）。
fn process_task(shared: &WorkerShared, task: InferTask) -> bool {
  let t_start = Instant::now();

  // 输入校验: RGB888, 3*W*H
  let expected = 3 * task.input_width as usize * task.input_height as usize;
  if task.input_data.is_empty() || task.input_data.len() != expected {
    error!(
      "InferWorker[{}]: [{}] 帧 {} 输入数据长度异常: {} (期望 {})",
      shared.worker_id,
      task.cam_id,
      task.frame_id,
      task.input_data.len(),
      expected
    );
    return false;
  }

  let Some(model_info) = shared.registry.model_info(&task.model_path) else {
    error!(
      "InferWorker[{}]: 模型信息缺失: {}",
      shared.worker_id, task.model_path
    );
    return false;
  };

  let mut contexts = shared.contexts.lock().expect("worker contexts mutex poisoned");
  let ctx = match contexts.entry(task.model_path.clone()) {
    std::collections::hash_map::Entry::Occupied(e) => e.into_mut(),
    std::collections::hash_map::Entry::Vacant(e) => {
      // 惰性创建只是兜底，正常路径由 load_models 预创建
      info!(
        "InferWorker[{}] 惰性创建模型上下文: {}",
        shared.worker_id, task.model_path
      );
      match shared
        .registry
        .create_worker_context(&task.model_path, shared.core_mask)
      {
        Ok(ctx) => e.insert(ctx),
        Err(err) => {
          error!(
            "InferWorker[{}]: 无法获取模型上下文 {}: {}",
            shared.worker_id, task.model_path, err
          );
          return false;
        }
      }
    }
  };

  // 推理；驱动错误按瞬态处理：记录并丢弃该帧，不产生部分结果
  let outputs = match ctx.infer(&task.input_data) {
    Ok(outputs) => outputs,
    Err(e) => {
      warn!(
        "InferWorker[{}]: [{}] 帧 {} 推理失败: {}",
        shared.worker_id, task.cam_id, task.frame_id, e
      );
      return false;
    }
  };
  drop(contexts);

  let t_infer_done = Instant::now();

  // 后处理（纯 CPU, 不占用 NPU 上下文）
  let detections = postprocess::process(
    task.kind,
    &outputs,
    &model_info.output_attrs,
    task.input_width,
    task.input_height,
    task.original_width,
    task.original_height,
    task.conf_threshold,
    task.nms_threshold,
    &task.labels,
  );
  drop(outputs);

  let total_ms = t_start.elapsed().as_secs_f64() * 1000.0;
  let infer_ms = (t_infer_done - t_start).as_secs_f64() * 1000.0;

  debug!(
    "InferWorker[{}]: [{}] 帧 {} model={} -> {} 个目标 (infer={:.1}ms total={:.1}ms)",
    shared.worker_id,
    task.cam_id,
    task.frame_id,
    task.task_name,
    detections.len(),
    infer_ms,
    total_ms
  );

  let model_result = ModelResult {
    task_name: task.task_name.clone(),
    model_path: task.model_path.clone(),
    inference_time_ms: total_ms,
    detections,
  };

  // 聚合或直发
  if let Some(collector) = &task.collector {
    if let Some(complete) = collector.add_result(model_result) {
      (shared.on_complete)(complete);
    }
  } else {
    let mut result = task.base_result();
    result.results.push(model_result);
    (shared.on_complete)(result);
  }

  true
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::infer::FrameResultCollector;
  use crate::infer::testing::{MockRuntime, temp_model_file};
  use crate::npu::{TensorAttr, core_mask};
  use crate::types::ModelKind;

  fn v11_runtime() -> MockRuntime {
    // [1, 5, 4]: 1 类, 4 个 anchor, 全 0 -> 无检测但结果正常产生
    let attr = TensorAttr {
      n_elems: 20,
      dims: vec![1, 5, 4],
      ..TensorAttr::default()
    };
    MockRuntime::new(vec![vec![0.0; 20]], vec![attr])
  }

  fn make_task(
    model_path: &str,
    frame_id: u64,
    collector: Option<Arc<FrameResultCollector>>,
  ) -> InferTask {
    InferTask {
      cam_id: "cam1".into(),
      rtsp_url: "rtsp://example/ch1".into(),
      frame_id,
      pts: frame_id as i64 * 3600,
      timestamp_ms: 1700000000000 + frame_id as i64 * 40,
      original_width: 1920,
      original_height: 1080,
      model_path: model_path.into(),
      task_name: "det".into(),
      kind: ModelKind::YoloV11,
      conf_threshold: 0.5,
      nms_threshold: 0.45,
      labels: Arc::new(vec!["person".into()]),
      input_data: vec![0u8; 3 * 640 * 640],
      input_width: 640,
      input_height: 640,
      collector,
    }
  }

  struct Harness {
    runtime: MockRuntime,
    queue: Arc<BoundedQueue<InferTask>>,
    worker: InferWorker,
    results: Arc<Mutex<Vec<FrameResult>>>,
    _model: crate::infer::testing::TempModelFile,
    model_path: String,
  }

  fn harness(tag: &str) -> Harness {
    let runtime = v11_runtime();
    let registry = Arc::new(ModelRegistry::new(runtime.clone_arc()));
    let model = temp_model_file(tag);
    registry.load(model.path()).unwrap();

    let queue = Arc::new(BoundedQueue::new(18));
    let results: Arc<Mutex<Vec<FrameResult>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&results);
    let on_complete: OnComplete = Arc::new(move |r| sink.lock().unwrap().push(r));

    let worker = InferWorker::new(
      0,
      core_mask::from_worker_id(0),
      registry,
      Arc::clone(&queue),
      on_complete,
    );

    let model_path = model.path().to_string();
    Harness {
      runtime,
      queue,
      worker,
      results,
      _model: model,
      model_path,
    }
  }

  fn wait_until(deadline_ms: u64, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_millis(deadline_ms);
    while !cond() {
      assert!(Instant::now() < deadline, "条件等待超时");
      thread::sleep(Duration::from_millis(5));
    }
  }

  #[test]
  fn processes_task_and_delivers_result() {
    let mut h = harness("worker-single");
    assert!(h.worker.pre_create_context(&h.model_path));
    h.worker.start();

    h.queue.push(make_task(&h.model_path, 1, None));
    wait_until(2000, || h.worker.processed_count() == 1);

    h.worker.stop();

    let results = h.results.lock().unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].frame_id, 1);
    assert_eq!(results[0].results.len(), 1);
    assert_eq!(results[0].results[0].task_name, "det");
    assert!(results[0].results[0].detections.is_empty());
  }

  #[test]
  fn npu_failure_drops_task_without_result() {
    let mut h = harness("worker-fail");
    h.worker.pre_create_context(&h.model_path);
    h.runtime.set_fail_run(true);
    h.worker.start();

    h.queue.push(make_task(&h.model_path, 1, None));
    thread::sleep(Duration::from_millis(200));

    h.worker.stop();
    assert_eq!(h.worker.processed_count(), 0);
    assert!(h.results.lock().unwrap().is_empty());
  }

  #[test]
  fn empty_input_is_rejected() {
    let mut h = harness("worker-empty");
    h.worker.pre_create_context(&h.model_path);
    h.worker.start();

    let mut task = make_task(&h.model_path, 1, None);
    task.input_data = Vec::new();
    h.queue.push(task);
    thread::sleep(Duration::from_millis(200));

    h.worker.stop();
    assert_eq!(h.worker.processed_count(), 0);
    assert!(h.results.lock().unwrap().is_empty());
    assert_eq!(h.runtime.run_count(), 0);
  }

  #[test]
  fn aggregated_tasks_produce_single_result() {
    let mut h = harness("worker-agg");
    h.worker.pre_create_context(&h.model_path);
    h.worker.start();

    let base = make_task(&h.model_path, 9, None).base_result();
    let collector = Arc::new(FrameResultCollector::new(2, base));
    h.queue.push(make_task(&h.model_path, 9, Some(Arc::clone(&collector))));
    h.queue.push(make_task(&h.model_path, 9, Some(Arc::clone(&collector))));

    wait_until(2000, || h.worker.processed_count() == 2);
    h.worker.stop();

    let results = h.results.lock().unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].results.len(), 2);
    assert!(collector.is_complete());
  }

  #[test]
  fn contexts_released_on_stop() {
    let mut h = harness("worker-release");
    h.worker.pre_create_context(&h.model_path);
    // 主上下文 + worker 副本
    assert_eq!(h.runtime.live_contexts(), 2);

    h.worker.start();
    h.worker.stop();
    assert_eq!(h.runtime.live_contexts(), 1);
  }
}
