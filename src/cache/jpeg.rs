// 该文件是 Wuling （雾岭） 项目的一部分。
// src/cache/jpeg.rs - JPEG 编码器
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use image::ExtendedColorType;
use image::codecs::jpeg::JpegEncoder as ImageJpegEncoder;
use tracing::error;

/// 每路流独占的 JPEG 编码器
///
/// 编码器不跨流共享（硬件实现持有不可共享的驱动状态），
/// 由流水线线程在自己的线程上创建和使用。
pub struct JpegEncoder {
  quality: u8,
}

impl JpegEncoder {
  /// 创建编码器，质量范围 1-100（越界自动收敛）
  pub fn new(quality: u8) -> Self {
    JpegEncoder {
      quality: quality.clamp(1, 100),
    }
  }

  pub fn quality(&self) -> u8 {
    self.quality
  }

  /// 把 RGB888 数据编码为 JPEG
  ///
  /// `rgb` 长度必须等于 `3 * width * height`，否则返回 None。
  pub fn encode(&self, rgb: &[u8], width: u32, height: u32) -> Option<Vec<u8>> {
    if width == 0 || height == 0 || rgb.len() != 3 * width as usize * height as usize {
      error!(
        "JPEG 编码输入异常: {}x{}, 数据 {} 字节",
        width,
        height,
        rgb.len()
      );
      return None;
    }

    let mut out = Vec::new();
    let mut encoder = ImageJpegEncoder::new_with_quality(&mut out, self.quality);
    match encoder.encode(rgb, width, height, ExtendedColorType::Rgb8) {
      Ok(()) => Some(out),
      Err(e) => {
        error!("JPEG 编码失败 ({}x{}): {}", width, height, e);
        None
      }
    }
  }
}
