// 该文件是 Wuling （雾岭） 项目的一部分。
// src/npu/rknn.rs - RKNN 运行时实现
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

//! # RKNN 运行时
//!
//! 基于 `rknpu` crate（librknnrt 绑定）的 [`NpuRuntime`] 实现。
//! 主上下文复制使用驱动的 dup 接口，复制出的上下文共享权重内存，
//! 因此模型二进制由上层（模型注册表）保留。

use rknpu::{Context, InitFlags, TensorFormat, TensorType};
use tracing::debug;

use super::{NpuContext, NpuError, NpuRuntime, TensorAttr};

pub struct RknnRuntime;

impl RknnRuntime {
  pub fn new() -> Self {
    RknnRuntime
  }
}

impl Default for RknnRuntime {
  fn default() -> Self {
    Self::new()
  }
}

impl NpuRuntime for RknnRuntime {
  fn load_model(&self, model_data: &[u8]) -> Result<Box<dyn NpuContext>, NpuError> {
    let context = Context::new(model_data, InitFlags::default())
      .map_err(|e| NpuError::Init(e.to_string()))?;

    match context.sdk_version() {
      Ok(version) => {
        if let Ok(api_ver) = version.api_version() {
          debug!("RKNN API 版本: {}", api_ver);
        }
        if let Ok(drv_ver) = version.driver_version() {
          debug!("RKNN 驱动版本: {}", drv_ver);
        }
      }
      Err(e) => {
        return Err(NpuError::Init(format!("无法查询 SDK 版本: {e}")));
      }
    }

    Ok(Box::new(RknnContext { context }))
  }
}

struct RknnContext {
  context: Context,
}

impl RknnContext {
  fn convert_attr(attr: &rknpu::TensorAttr) -> TensorAttr {
    let mut converted = TensorAttr {
      n_elems: attr.n_elems as usize,
      dims: attr.dims.iter().map(|&d| d as usize).collect(),
      ..TensorAttr::default()
    };
    if attr.tensor_type == TensorType::Int8 {
      converted.is_int8 = true;
      converted.zp = attr.zp;
      converted.scale = attr.scale;
    }
    converted
  }
}

impl NpuContext for RknnContext {
  fn duplicate(&self) -> Result<Box<dyn NpuContext>, NpuError> {
    let dup = self
      .context
      .duplicate()
      .map_err(|e| NpuError::Duplicate(e.to_string()))?;
    Ok(Box::new(RknnContext { context: dup }))
  }

  fn bind_core(&mut self, core_mask: u32) -> Result<(), NpuError> {
    self
      .context
      .set_core_mask(core_mask)
      .map_err(|e| NpuError::CoreBind {
        mask: core_mask,
        reason: e.to_string(),
      })
  }

  fn input_attrs(&self) -> Result<Vec<TensorAttr>, NpuError> {
    let num = self
      .context
      .num_inputs()
      .map_err(|e| NpuError::Query(format!("无法获取输入数量: {e}")))?;

    let mut attrs = Vec::with_capacity(num as usize);
    for i in 0..num {
      let attr = self
        .context
        .input_attr(i)
        .map_err(|e| NpuError::Query(format!("无法获取第 {i} 个输入属性: {e}")))?;
      attrs.push(Self::convert_attr(&attr));
    }
    Ok(attrs)
  }

  fn output_attrs(&self) -> Result<Vec<TensorAttr>, NpuError> {
    let num = self
      .context
      .num_outputs()
      .map_err(|e| NpuError::Query(format!("无法获取输出数量: {e}")))?;

    let mut attrs = Vec::with_capacity(num as usize);
    for i in 0..num {
      let attr = self
        .context
        .output_attr(i)
        .map_err(|e| NpuError::Query(format!("无法获取第 {i} 个输出属性: {e}")))?;
      attrs.push(Self::convert_attr(&attr));
    }
    Ok(attrs)
  }

  fn infer(&mut self, input: &[u8]) -> Result<Vec<Vec<f32>>, NpuError> {
    self
      .context
      .set_input(0, input, TensorFormat::NHWC, TensorType::UInt8)
      .map_err(|e| NpuError::SetInput(e.to_string()))?;

    self
      .context
      .run()
      .map_err(|e| NpuError::Run(e.to_string()))?;

    let num = self
      .context
      .num_outputs()
      .map_err(|e| NpuError::Query(format!("无法获取输出数量: {e}")))?;

    // get_outputs 以 want_float 形式取回全部输出；
    // Output 在本函数返回前 Drop，驱动缓冲随之释放
    let outputs = self
      .context
      .get_outputs()
      .map_err(|e| NpuError::GetOutput(e.to_string()))?;

    let mut converted = Vec::with_capacity(num as usize);
    for i in 0..num as usize {
      let data = outputs
        .get_f32(i)
        .map_err(|e| NpuError::GetOutput(format!("无法获取第 {i} 个输出: {e}")))?;
      converted.push(data.to_vec());
    }
    Ok(converted)
  }
}
