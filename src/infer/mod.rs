// 该文件是 Wuling （雾岭） 项目的一部分。
// src/infer/mod.rs - 推理模块
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

mod collector;
mod engine;
pub mod postprocess;
mod registry;
mod worker;

pub use collector::FrameResultCollector;
pub use engine::{EngineError, InferenceBackend, InferenceEngine};
pub use registry::{ModelInfo, ModelRegistry, RegistryError};
pub use worker::{InferWorker, OnComplete};

#[cfg(test)]
pub(crate) mod testing {
  //! 测试用 NPU 运行时替身与临时模型文件

  use std::sync::Arc;
  use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

  use crate::npu::{NpuContext, NpuError, NpuRuntime, TensorAttr};

  struct MockState {
    outputs: Vec<Vec<f32>>,
    input_attrs: Vec<TensorAttr>,
    output_attrs: Vec<TensorAttr>,
    fail_run: AtomicBool,
    load_count: AtomicUsize,
    run_count: AtomicUsize,
    live_contexts: AtomicUsize,
  }

  /// 可注入输出数据的 NPU 运行时替身
  ///
  /// 统计加载/推理次数和存活上下文数量，供生命周期断言使用。
  #[derive(Clone)]
  pub struct MockRuntime {
    state: Arc<MockState>,
  }

  impl MockRuntime {
    pub fn new(outputs: Vec<Vec<f32>>, output_attrs: Vec<TensorAttr>) -> Self {
      let input_attrs = vec![TensorAttr {
        n_elems: 640 * 640 * 3,
        dims: vec![1, 640, 640, 3],
        ..TensorAttr::default()
      }];
      MockRuntime {
        state: Arc::new(MockState {
          outputs,
          input_attrs,
          output_attrs,
          fail_run: AtomicBool::new(false),
          load_count: AtomicUsize::new(0),
          run_count: AtomicUsize::new(0),
          live_contexts: AtomicUsize::new(0),
        }),
      }
    }

    pub fn with_single_output(data: Vec<f32>) -> Self {
      let attr = TensorAttr {
        n_elems: data.len(),
        dims: vec![1, data.len()],
        ..TensorAttr::default()
      };
      Self::new(vec![data], vec![attr])
    }

    pub fn clone_arc(&self) -> Arc<dyn NpuRuntime> {
      Arc::new(self.clone())
    }

    pub fn set_fail_run(&self, fail: bool) {
      self.state.fail_run.store(fail, Ordering::SeqCst);
    }

    pub fn load_count(&self) -> usize {
      self.state.load_count.load(Ordering::SeqCst)
    }

    pub fn run_count(&self) -> usize {
      self.state.run_count.load(Ordering::SeqCst)
    }

    pub fn live_contexts(&self) -> usize {
      self.state.live_contexts.load(Ordering::SeqCst)
    }
  }

  impl NpuRuntime for MockRuntime {
    fn load_model(&self, model_data: &[u8]) -> Result<Box<dyn NpuContext>, NpuError> {
      if model_data.is_empty() {
        return Err(NpuError::Init("空模型数据".into()));
      }
      self.state.load_count.fetch_add(1, Ordering::SeqCst);
      self.state.live_contexts.fetch_add(1, Ordering::SeqCst);
      Ok(Box::new(MockContext {
        state: Arc::clone(&self.state),
      }))
    }
  }

  struct MockContext {
    state: Arc<MockState>,
  }

  impl NpuContext for MockContext {
    fn duplicate(&self) -> Result<Box<dyn NpuContext>, NpuError> {
      self.state.live_contexts.fetch_add(1, Ordering::SeqCst);
      Ok(Box::new(MockContext {
        state: Arc::clone(&self.state),
      }))
    }

    fn bind_core(&mut self, _core_mask: u32) -> Result<(), NpuError> {
      Ok(())
    }

    fn input_attrs(&self) -> Result<Vec<TensorAttr>, NpuError> {
      Ok(self.state.input_attrs.clone())
    }

    fn output_attrs(&self) -> Result<Vec<TensorAttr>, NpuError> {
      Ok(self.state.output_attrs.clone())
    }

    fn infer(&mut self, _input: &[u8]) -> Result<Vec<Vec<f32>>, NpuError> {
      if self.state.fail_run.load(Ordering::SeqCst) {
        return Err(NpuError::Run("mock failure".into()));
      }
      self.state.run_count.fetch_add(1, Ordering::SeqCst);
      Ok(self.state.outputs.clone())
    }
  }

  impl Drop for MockContext {
    fn drop(&mut self) {
      self.state.live_contexts.fetch_sub(1, Ordering::SeqCst);
    }
  }

  /// 测试结束自动删除的临时模型文件
  pub struct TempModelFile {
    path: String,
  }

  impl TempModelFile {
    pub fn path(&self) -> &str {
      &self.path
    }
  }

  impl Drop for TempModelFile {
    fn drop(&mut self) {
      let _ = std::fs::remove_file(&self.path);
    }
  }

  pub fn temp_model_file(tag: &str) -> TempModelFile {
    let path = std::env::temp_dir().join(format!("wuling-{}-{}.rknn", tag, std::process::id()));
    std::fs::write(&path, [7u8; 32]).expect("写入临时模型文件失败");
    TempModelFile {
      path: path.to_string_lossy().into_owned(),
    }
  }
}
