// 该文件是 Wuling （雾岭） 项目的一部分。
// src/infer/registry.rs - 模型注册表
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

//! # 模型注册表
//!
//! 负责模型文件加载、张量属性查询、为 worker 复制独立上下文并绑定
//! NPU 核心。所有修改操作由单一互斥锁串行化，查询是短临界区。
//!
//! 模型二进制数据在加载后保留：驱动的上下文复制接口可能引用它。
//! worker 上下文的所有权归调用方，释放即 Drop。

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::npu::{NpuContext, NpuError, NpuRuntime, TensorAttr, core_mask};

/// 模型信息（加载后查询到的属性）
#[derive(Debug, Clone)]
pub struct ModelInfo {
  pub model_path: String,
  pub input_attrs: Vec<TensorAttr>,
  pub output_attrs: Vec<TensorAttr>,
}

#[derive(Error, Debug)]
pub enum RegistryError {
  #[error("模型文件读取失败 {path}: {source}")]
  Io {
    path: String,
    source: std::io::Error,
  },
  #[error("模型文件为空: {0}")]
  EmptyFile(String),
  #[error("模型未加载: {0}")]
  NotLoaded(String),
  #[error(transparent)]
  Npu(#[from] NpuError),
}

struct LoadedModel {
  master: Box<dyn NpuContext>,
  info: ModelInfo,
  /// 模型二进制（上下文复制可能引用，保留到卸载）
  #[allow(dead_code)]
  model_data: Vec<u8>,
}

pub struct ModelRegistry {
  runtime: Arc<dyn NpuRuntime>,
  models: Mutex<HashMap<String, LoadedModel>>,
}

impl ModelRegistry {
  pub fn new(runtime: Arc<dyn NpuRuntime>) -> Self {
    ModelRegistry {
      runtime,
      models: Mutex::new(HashMap::new()),
    }
  }

  /// 加载模型文件并查询输入输出属性
  ///
  /// 幂等：重复加载同一路径直接成功返回。
  pub fn load(&self, model_path: &str) -> Result<(), RegistryError> {
    let mut models = self.models.lock().expect("registry mutex poisoned");

    if models.contains_key(model_path) {
      debug!("模型已加载: {}", model_path);
      return Ok(());
    }

    let model_data = std::fs::read(model_path).map_err(|source| RegistryError::Io {
      path: model_path.to_string(),
      source,
    })?;
    if model_data.is_empty() {
      return Err(RegistryError::EmptyFile(model_path.to_string()));
    }

    info!(
      "加载模型: {} ({:.2} MB)",
      model_path,
      model_data.len() as f64 / (1024.0 * 1024.0)
    );

    let master = self.runtime.load_model(&model_data)?;
    let input_attrs = master.input_attrs()?;
    let output_attrs = master.output_attrs()?;

    info!(
      "  输入张量 {} 个, 输出张量 {} 个",
      input_attrs.len(),
      output_attrs.len()
    );
    for (i, attr) in input_attrs.iter().enumerate() {
      debug!("  输入[{}]: dims={:?} n_elems={}", i, attr.dims, attr.n_elems);
    }
    for (i, attr) in output_attrs.iter().enumerate() {
      debug!(
        "  输出[{}]: dims={:?} n_elems={} int8={} zp={} scale={:.6}",
        i, attr.dims, attr.n_elems, attr.is_int8, attr.zp, attr.scale
      );
    }

    models.insert(
      model_path.to_string(),
      LoadedModel {
        master,
        info: ModelInfo {
          model_path: model_path.to_string(),
          input_attrs,
          output_attrs,
        },
        model_data,
      },
    );
    info!("模型加载完成: {}", model_path);
    Ok(())
  }

  /// 为 worker 复制独立上下文并绑定 NPU 核心
  ///
  /// 绑核是尽力而为：失败只记录告警，上下文回落到自动调度。
  /// 返回的上下文由调用方独占持有，释放即 Drop。
  pub fn create_worker_context(
    &self,
    model_path: &str,
    mask: u32,
  ) -> Result<Box<dyn NpuContext>, RegistryError> {
    let models = self.models.lock().expect("registry mutex poisoned");
    let loaded = models
      .get(model_path)
      .ok_or_else(|| RegistryError::NotLoaded(model_path.to_string()))?;

    let mut ctx = loaded.master.duplicate()?;

    if mask != core_mask::AUTO {
      match ctx.bind_core(mask) {
        Ok(()) => debug!("worker 上下文已绑定 NPU 核心 mask={}", mask),
        Err(e) => warn!("NPU 核心绑定失败, 回落自动调度: {}", e),
      }
    }

    Ok(ctx)
  }

  /// 获取模型信息（未加载返回 None）
  pub fn model_info(&self, model_path: &str) -> Option<ModelInfo> {
    let models = self.models.lock().expect("registry mutex poisoned");
    models.get(model_path).map(|m| m.info.clone())
  }

  /// 模型是否已加载
  pub fn is_loaded(&self, model_path: &str) -> bool {
    let models = self.models.lock().expect("registry mutex poisoned");
    models.contains_key(model_path)
  }

  /// 卸载指定模型
  pub fn unload(&self, model_path: &str) {
    let mut models = self.models.lock().expect("registry mutex poisoned");
    if models.remove(model_path).is_some() {
      info!("模型已卸载: {}", model_path);
    }
  }

  /// 卸载所有模型
  pub fn unload_all(&self) {
    let mut models = self.models.lock().expect("registry mutex poisoned");
    for path in models.keys() {
      info!("模型已卸载: {}", path);
    }
    models.clear();
  }

  /// 已加载的模型数量
  pub fn loaded_count(&self) -> usize {
    self.models.lock().expect("registry mutex poisoned").len()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::infer::testing::{MockRuntime, temp_model_file};
  use crate::npu::core_mask;

  #[test]
  fn load_is_idempotent() {
    let runtime = MockRuntime::with_single_output(vec![0.0; 16]);
    let registry = ModelRegistry::new(runtime.clone_arc());
    let model = temp_model_file("registry-idempotent");

    registry.load(model.path()).unwrap();
    registry.load(model.path()).unwrap();
    registry.load(model.path()).unwrap();

    assert_eq!(registry.loaded_count(), 1);
    assert_eq!(runtime.load_count(), 1);
    assert!(registry.is_loaded(model.path()));
  }

  #[test]
  fn load_missing_file_fails() {
    let runtime = MockRuntime::with_single_output(vec![]);
    let registry = ModelRegistry::new(runtime.clone_arc());
    let err = registry.load("/nonexistent/model.rknn").unwrap_err();
    assert!(matches!(err, RegistryError::Io { .. }));
    assert_eq!(registry.loaded_count(), 0);
  }

  #[test]
  fn worker_context_requires_loaded_model() {
    let runtime = MockRuntime::with_single_output(vec![]);
    let registry = ModelRegistry::new(runtime.clone_arc());
    let err = registry
      .create_worker_context("/m/none.rknn", core_mask::CORE_0)
      .unwrap_err();
    assert!(matches!(err, RegistryError::NotLoaded(_)));
  }

  #[test]
  fn worker_contexts_are_independent_and_released_on_drop() {
    let runtime = MockRuntime::with_single_output(vec![0.0; 4]);
    let registry = ModelRegistry::new(runtime.clone_arc());
    let model = temp_model_file("registry-contexts");
    registry.load(model.path()).unwrap();

    // 主上下文存活
    assert_eq!(runtime.live_contexts(), 1);

    let a = registry
      .create_worker_context(model.path(), core_mask::CORE_0)
      .unwrap();
    let b = registry
      .create_worker_context(model.path(), core_mask::CORE_1)
      .unwrap();
    assert_eq!(runtime.live_contexts(), 3);

    drop(a);
    drop(b);
    assert_eq!(runtime.live_contexts(), 1);

    registry.unload_all();
    assert_eq!(runtime.live_contexts(), 0);
    assert_eq!(registry.loaded_count(), 0);
  }
}
