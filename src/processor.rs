// 该文件是 Wuling （雾岭） 项目的一部分。
// src/processor.rs - 2D 图像处理（缩放 + 色彩转换）
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

//! # 2D 图像处理
//!
//! NV12 到 RGB888 的缩放 + 色彩转换（BT.601），无状态纯函数，
//! 可从多个流水线线程并发调用。模型输入路径使用 letterbox
//! （等比缩放 + 灰色填充，与后处理的坐标反变换配套）；
//! 缓存路径使用普通缩放。在目标硬件上这些操作对应 RGA 调用，
//! 这里是 CPU 实现（最近邻采样）。
//!
//! NV12 布局约定: Y 平面 `W*H` 字节 + UV 交织平面 `W*(H/2)` 字节，
//! 行距等于宽度（调用方负责消除 stride padding）。

/// letterbox 填充灰度值
const PAD_VALUE: u8 = 114;

/// 对齐到偶数（NV12/硬件 2 像素对齐要求）
pub fn align_even(v: u32) -> u32 {
  (v + 1) & !1
}

/// 按宽度等比例计算高度，2 像素对齐
pub fn proportional_height(src_w: u32, src_h: u32, target_w: u32) -> u32 {
  if src_w == 0 || src_h == 0 || target_w == 0 {
    return 0;
  }
  align_even((target_w as u64 * src_h as u64 / src_w as u64) as u32)
}

/// NV12 期望的数据长度: 1.5 * W * H
fn nv12_len(w: u32, h: u32) -> usize {
  w as usize * h as usize * 3 / 2
}

/// 采样 NV12 像素并转换为 RGB (BT.601 全范围近似)
#[inline]
fn sample_rgb(nv12: &[u8], src_w: u32, src_h: u32, sx: u32, sy: u32) -> (u8, u8, u8) {
  let w = src_w as usize;
  let y_size = w * src_h as usize;
  let y_idx = sy as usize * w + sx as usize;
  let uv_idx = y_size + (sy as usize / 2) * w + (sx as usize / 2) * 2;

  let y = nv12[y_idx] as f32;
  let u = nv12[uv_idx] as f32 - 128.0;
  let v = nv12[uv_idx + 1] as f32 - 128.0;

  let r = (y + 1.402 * v).clamp(0.0, 255.0) as u8;
  let g = (y - 0.344 * u - 0.714 * v).clamp(0.0, 255.0) as u8;
  let b = (y + 1.772 * u).clamp(0.0, 255.0) as u8;
  (r, g, b)
}

/// NV12 -> RGB888 普通缩放（拉伸到目标尺寸）
///
/// 输出长度恒为 `3 * dst_w * dst_h`。参数非法或数据不足返回 None。
pub fn nv12_to_rgb_resize(
  nv12: &[u8],
  src_w: u32,
  src_h: u32,
  dst_w: u32,
  dst_h: u32,
) -> Option<Vec<u8>> {
  if src_w == 0 || src_h == 0 || dst_w == 0 || dst_h == 0 {
    return None;
  }
  if nv12.len() < nv12_len(src_w, src_h) {
    return None;
  }

  let mut rgb = vec![0u8; 3 * dst_w as usize * dst_h as usize];
  let x_ratio = src_w as f32 / dst_w as f32;
  let y_ratio = src_h as f32 / dst_h as f32;

  for dy in 0..dst_h {
    let sy = ((dy as f32 * y_ratio) as u32).min(src_h - 1);
    for dx in 0..dst_w {
      let sx = ((dx as f32 * x_ratio) as u32).min(src_w - 1);
      let (r, g, b) = sample_rgb(nv12, src_w, src_h, sx, sy);
      let idx = 3 * (dy as usize * dst_w as usize + dx as usize);
      rgb[idx] = r;
      rgb[idx + 1] = g;
      rgb[idx + 2] = b;
    }
  }
  Some(rgb)
}

/// NV12 -> RGB888 letterbox 缩放（模型输入路径）
///
/// 等比缩放到目标尺寸内，短边两侧以灰色 (114) 填充。
/// 缩放与填充参数和后处理 `scale_coords` 的反变换一致。
/// 输出长度恒为 `3 * dst_w * dst_h`。
pub fn nv12_to_rgb_letterbox(
  nv12: &[u8],
  src_w: u32,
  src_h: u32,
  dst_w: u32,
  dst_h: u32,
) -> Option<Vec<u8>> {
  if src_w == 0 || src_h == 0 || dst_w == 0 || dst_h == 0 {
    return None;
  }
  if nv12.len() < nv12_len(src_w, src_h) {
    return None;
  }

  let scale = (dst_w as f32 / src_w as f32).min(dst_h as f32 / src_h as f32);
  let new_w = ((src_w as f32 * scale) as u32).max(1).min(dst_w);
  let new_h = ((src_h as f32 * scale) as u32).max(1).min(dst_h);
  let pad_x = (dst_w - new_w) / 2;
  let pad_y = (dst_h - new_h) / 2;

  let mut rgb = vec![PAD_VALUE; 3 * dst_w as usize * dst_h as usize];
  let x_ratio = src_w as f32 / new_w as f32;
  let y_ratio = src_h as f32 / new_h as f32;

  for dy in 0..new_h {
    let sy = ((dy as f32 * y_ratio) as u32).min(src_h - 1);
    for dx in 0..new_w {
      let sx = ((dx as f32 * x_ratio) as u32).min(src_w - 1);
      let (r, g, b) = sample_rgb(nv12, src_w, src_h, sx, sy);
      let idx = 3
        * ((dy + pad_y) as usize * dst_w as usize + (dx + pad_x) as usize);
      rgb[idx] = r;
      rgb[idx + 1] = g;
      rgb[idx + 2] = b;
    }
  }
  Some(rgb)
}
