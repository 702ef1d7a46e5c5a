// 该文件是 Wuling （雾岭） 项目的一部分。
// src/npu/mod.rs - NPU 运行时抽象
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

//! # NPU 运行时抽象
//!
//! 把 NPU 驱动收窄成两个 trait：`NpuRuntime` 负责从模型字节产生
//! 主上下文，`NpuContext` 负责复制、绑核与推理执行。
//! 后处理和调度逻辑只依赖这层抽象，可以在无 NPU 的主机上测试；
//! 启用 `rknn` 特性时由 [`rknn::RknnRuntime`] 提供真实实现。

#[cfg(feature = "rknn")]
pub mod rknn;

use thiserror::Error;

/// NPU 核心掩码（与驱动定义一致）
///
/// core0=1, core1=2, core2=4, 自动调度=0。
pub mod core_mask {
  pub const AUTO: u32 = 0;
  pub const CORE_0: u32 = 1;
  pub const CORE_1: u32 = 2;
  pub const CORE_2: u32 = 4;
  pub const CORE_0_1: u32 = 3;
  pub const CORE_ALL: u32 = 7;

  /// 根据 worker 编号返回核心掩码：
  /// worker 0 -> Core0, 1 -> Core1, 2 -> Core2, >= 3 -> 自动调度
  pub fn from_worker_id(worker_id: usize) -> u32 {
    match worker_id {
      0 => CORE_0,
      1 => CORE_1,
      2 => CORE_2,
      _ => AUTO,
    }
  }
}

/// 张量属性（加载模型后查询所得）
///
/// 不直接暴露驱动类型，后处理可独立测试。
#[derive(Debug, Clone, Default)]
pub struct TensorAttr {
  /// 元素总数
  pub n_elems: usize,
  /// 维度（如 [1, 80, 80, 255]）
  pub dims: Vec<usize>,
  /// INT8 量化 zero point
  pub zp: i32,
  /// INT8 量化 scale
  pub scale: f32,
  /// 是否为 INT8 量化张量
  pub is_int8: bool,
}

#[derive(Error, Debug)]
pub enum NpuError {
  #[error("模型初始化失败: {0}")]
  Init(String),
  #[error("张量属性查询失败: {0}")]
  Query(String),
  #[error("上下文复制失败: {0}")]
  Duplicate(String),
  #[error("NPU 核心绑定失败 (mask={mask}): {reason}")]
  CoreBind { mask: u32, reason: String },
  #[error("输入设置失败: {0}")]
  SetInput(String),
  #[error("推理执行失败: {0}")]
  Run(String),
  #[error("输出获取失败: {0}")]
  GetOutput(String),
}

/// 一个可执行推理的 NPU 上下文
///
/// 主上下文由 [`NpuRuntime::load_model`] 产生，worker 上下文通过
/// [`duplicate`](NpuContext::duplicate) 轻量复制。上下文释放即 Drop，
/// 同一上下文在任意时刻只被一个 worker 持有。
impl std::fmt::Debug for dyn NpuContext {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str("NpuContext")
  }
}

pub trait NpuContext: Send {
  /// 从当前上下文复制一个轻量副本（共享权重，独立执行状态）
  fn duplicate(&self) -> Result<Box<dyn NpuContext>, NpuError>;

  /// 把上下文绑定到指定 NPU 核心
  fn bind_core(&mut self, core_mask: u32) -> Result<(), NpuError>;

  /// 输入张量属性列表
  fn input_attrs(&self) -> Result<Vec<TensorAttr>, NpuError>;

  /// 输出张量属性列表
  fn output_attrs(&self) -> Result<Vec<TensorAttr>, NpuError>;

  /// 执行一次推理
  ///
  /// `input` 为 NHWC 排列的 u8 RGB 数据（不透传量化）。
  /// 所有输出统一转成 float32 返回，驱动侧缓冲在返回前释放。
  fn infer(&mut self, input: &[u8]) -> Result<Vec<Vec<f32>>, NpuError>;
}

/// NPU 驱动入口
pub trait NpuRuntime: Send + Sync {
  /// 从模型二进制数据创建主上下文
  fn load_model(&self, model_data: &[u8]) -> Result<Box<dyn NpuContext>, NpuError>;
}
