// 该文件是 Wuling （雾岭） 项目的一部分。
// src/infer/postprocess.rs - YOLO 后处理
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

//! # YOLO 后处理
//!
//! 支持 YOLOv5 (anchor-based)、YOLOv8 (anchor-free DFL) 和
//! YOLOv11 (单融合输出头) 三种解码格式。纯 CPU 计算，不依赖任何硬件。
//!
//! 输出格式说明：
//!   YOLOv5: 3 个输出头 (stride 8/16/32)
//!     - 每头 shape: [1, grid_h, grid_w, num_anchors * (5 + num_classes)]
//!     - 5 = (cx, cy, w, h, obj_conf)
//!   YOLOv8: 3 个输出头 (stride 8/16/32)，anchor-free
//!     - 每头 shape: [1, grid_h, grid_w, 64 + num_classes]
//!     - 前 64 通道为 DFL box 回归 (4 * reg_max=16)，后面是类别 logits
//!   YOLOv11: 单融合输出头，通道主序
//!     - shape: [1, 4 + num_classes, num_anchors]
//!     - 前 4 通道为模型内部已解码的 [cx, cy, w, h]（模型输入像素），
//!       类别分数已在 [0,1]，无需 sigmoid

use tracing::{debug, error};

use crate::npu::TensorAttr;
use crate::types::{BBox, Detection, ModelKind};

/// YOLOv5 默认 anchor 定义 (COCO)
const YOLOV5_ANCHORS: [[f32; 6]; 3] = [
  [10.0, 13.0, 16.0, 30.0, 33.0, 23.0],     // stride 8
  [30.0, 61.0, 62.0, 45.0, 59.0, 119.0],    // stride 16
  [116.0, 90.0, 156.0, 198.0, 373.0, 326.0], // stride 32
];

const YOLOV5_NUM_ANCHORS: usize = 3;
const STRIDES: [usize; 3] = [8, 16, 32];
const REG_MAX: usize = 16;
const BOX_CHANNELS: usize = 4 * REG_MAX; // 64

fn sigmoid(x: f32) -> f32 {
  1.0 / (1.0 + (-x).exp())
}

fn iou(a: &BBox, b: &BBox) -> f32 {
  let inter_x1 = a.x1.max(b.x1);
  let inter_y1 = a.y1.max(b.y1);
  let inter_x2 = a.x2.min(b.x2);
  let inter_y2 = a.y2.min(b.y2);

  let inter_area = (inter_x2 - inter_x1).max(0.0) * (inter_y2 - inter_y1).max(0.0);
  let area_a = (a.x2 - a.x1) * (a.y2 - a.y1);
  let area_b = (b.x2 - b.x1) * (b.y2 - b.y1);
  let union_area = area_a + area_b - inter_area;

  if union_area > 0.0 {
    inter_area / union_area
  } else {
    0.0
  }
}

/// DFL (Distribution Focal Loss) 解码：
/// 对 reg_max 个值做 softmax（减最大值保持数值稳定），
/// 再按权重 0..reg_max 求期望。
fn dfl_decode(data: &[f32]) -> f32 {
  let max_val = data.iter().copied().fold(f32::MIN, f32::max);

  let mut sum_exp = 0.0f32;
  let mut weighted = 0.0f32;
  for (i, &v) in data.iter().enumerate() {
    let e = (v - max_val).exp();
    sum_exp += e;
    weighted += i as f32 * e;
  }
  weighted / sum_exp
}

/// INT8 反量化到 float
pub fn dequantize_int8(data: &[i8], zp: i32, scale: f32) -> Vec<f32> {
  data
    .iter()
    .map(|&v| (v as f32 - zp as f32) * scale)
    .collect()
}

/// 通用 NMS：按置信度降序，同类且 IoU 超过阈值的低分框被抑制
pub fn nms(detections: &mut Vec<Detection>, threshold: f32) {
  if detections.is_empty() {
    return;
  }

  detections.sort_by(|a, b| {
    b.confidence
      .partial_cmp(&a.confidence)
      .unwrap_or(std::cmp::Ordering::Equal)
  });

  let mut suppressed = vec![false; detections.len()];
  let mut result = Vec::with_capacity(detections.len());

  for i in 0..detections.len() {
    if suppressed[i] {
      continue;
    }
    result.push(detections[i].clone());

    for j in (i + 1)..detections.len() {
      if suppressed[j] {
        continue;
      }
      // 仅同类之间抑制
      if detections[i].class_id == detections[j].class_id
        && iou(&detections[i].bbox, &detections[j].bbox) > threshold
      {
        suppressed[j] = true;
      }
    }
  }

  *detections = result;
}

/// 将检测框从模型输入坐标映射回原始帧坐标
///
/// 预处理为 letterbox（等比缩放 + 短边填充），这里做逆变换：
/// 去除 padding，反缩放，再裁剪到原始图像范围。
pub fn scale_coords(dets: &mut [Detection], model_w: u32, model_h: u32, orig_w: u32, orig_h: u32) {
  let scale = (model_w as f32 / orig_w as f32).min(model_h as f32 / orig_h as f32);
  let pad_x = (model_w as f32 - orig_w as f32 * scale) / 2.0;
  let pad_y = (model_h as f32 - orig_h as f32 * scale) / 2.0;

  for det in dets.iter_mut() {
    det.bbox.x1 = ((det.bbox.x1 - pad_x) / scale).clamp(0.0, orig_w as f32);
    det.bbox.y1 = ((det.bbox.y1 - pad_y) / scale).clamp(0.0, orig_h as f32);
    det.bbox.x2 = ((det.bbox.x2 - pad_x) / scale).clamp(0.0, orig_w as f32);
    det.bbox.y2 = ((det.bbox.y2 - pad_y) / scale).clamp(0.0, orig_h as f32);
  }
}

fn class_name(labels: &[String], class_id: usize) -> String {
  labels.get(class_id).cloned().unwrap_or_default()
}

/// YOLOv5 后处理 (anchor-based, 3 个输出头)
pub fn yolov5(
  outputs: &[Vec<f32>],
  attrs: &[TensorAttr],
  model_w: u32,
  model_h: u32,
  orig_w: u32,
  orig_h: u32,
  conf_thresh: f32,
  nms_thresh: f32,
  labels: &[String],
) -> Vec<Detection> {
  if outputs.len() != 3 || attrs.len() != 3 {
    error!("YOLOv5 需要 3 个输出头, 实际 {} 个", outputs.len());
    return Vec::new();
  }

  let mut all_detections = Vec::new();

  for head in 0..3 {
    let data = &outputs[head];
    let attr = &attrs[head];

    if attr.dims.len() < 4 {
      error!("YOLOv5 第 {} 头需要 4 维张量, 实际 {} 维", head, attr.dims.len());
      continue;
    }

    // shape: [1, grid_h, grid_w, num_anchors * (5 + num_classes)]
    let grid_h = attr.dims[1];
    let grid_w = attr.dims[2];
    let channel = attr.dims[3];
    if channel / YOLOV5_NUM_ANCHORS <= 5 {
      error!("YOLOv5 第 {} 头通道数异常: {}", head, channel);
      continue;
    }
    let num_classes = channel / YOLOV5_NUM_ANCHORS - 5;
    let entry_size = 5 + num_classes;
    let stride = STRIDES[head] as f32;

    for y in 0..grid_h {
      for x in 0..grid_w {
        for a in 0..YOLOV5_NUM_ANCHORS {
          let offset = (y * grid_w * YOLOV5_NUM_ANCHORS + x * YOLOV5_NUM_ANCHORS + a) * entry_size;
          let Some(entry) = data.get(offset..offset + entry_size) else {
            continue;
          };

          let obj_conf = sigmoid(entry[4]);
          if obj_conf < conf_thresh {
            continue;
          }

          // 最大类别分数
          let mut best_class = 0usize;
          let mut best_score = entry[5];
          for c in 1..num_classes {
            if entry[5 + c] > best_score {
              best_score = entry[5 + c];
              best_class = c;
            }
          }
          let final_conf = obj_conf * sigmoid(best_score);
          if final_conf < conf_thresh {
            continue;
          }

          // 解码 (cx, cy, w, h) -> (x1, y1, x2, y2)，模型输入坐标系
          let cx = (sigmoid(entry[0]) * 2.0 - 0.5 + x as f32) * stride;
          let cy = (sigmoid(entry[1]) * 2.0 - 0.5 + y as f32) * stride;
          let bw = (sigmoid(entry[2]) * 2.0).powi(2) * YOLOV5_ANCHORS[head][a * 2];
          let bh = (sigmoid(entry[3]) * 2.0).powi(2) * YOLOV5_ANCHORS[head][a * 2 + 1];

          all_detections.push(Detection {
            class_id: best_class as i32,
            class_name: class_name(labels, best_class),
            confidence: final_conf,
            bbox: BBox {
              x1: cx - bw / 2.0,
              y1: cy - bh / 2.0,
              x2: cx + bw / 2.0,
              y2: cy + bh / 2.0,
            },
          });
        }
      }
    }
  }

  nms(&mut all_detections, nms_thresh);
  scale_coords(&mut all_detections, model_w, model_h, orig_w, orig_h);
  all_detections
}

/// YOLOv8 后处理 (anchor-free, DFL, 3 个输出头)
pub fn yolov8(
  outputs: &[Vec<f32>],
  attrs: &[TensorAttr],
  model_w: u32,
  model_h: u32,
  orig_w: u32,
  orig_h: u32,
  conf_thresh: f32,
  nms_thresh: f32,
  labels: &[String],
) -> Vec<Detection> {
  if outputs.len() != 3 || attrs.len() != 3 {
    error!("YOLOv8 需要 3 个输出头, 实际 {} 个", outputs.len());
    return Vec::new();
  }

  let mut all_detections = Vec::new();

  for head in 0..3 {
    let data = &outputs[head];
    let attr = &attrs[head];

    if attr.dims.len() < 4 {
      error!("YOLOv8 第 {} 头需要 4 维张量, 实际 {} 维", head, attr.dims.len());
      continue;
    }

    let grid_h = attr.dims[1];
    let grid_w = attr.dims[2];
    let channel = attr.dims[3];
    if channel <= BOX_CHANNELS {
      error!("YOLOv8 第 {} 头通道数 {} 不足 (需要 > {})", head, channel, BOX_CHANNELS);
      continue;
    }
    let num_classes = channel - BOX_CHANNELS;
    let stride = STRIDES[head] as f32;

    for y in 0..grid_h {
      for x in 0..grid_w {
        let offset = (y * grid_w + x) * channel;
        let Some(entry) = data.get(offset..offset + channel) else {
          continue;
        };

        // 类别分数在 box 通道之后，取 argmax 后做 sigmoid
        let scores = &entry[BOX_CHANNELS..];
        let mut best_class = 0usize;
        let mut best_score = scores[0];
        for c in 1..num_classes {
          if scores[c] > best_score {
            best_score = scores[c];
            best_class = c;
          }
        }
        let best_score = sigmoid(best_score);
        if best_score < conf_thresh {
          continue;
        }

        // DFL 解码：4 组 reg_max 值 -> 距 grid 中心的 (left, top, right, bottom)
        let left = dfl_decode(&entry[0..REG_MAX]) * stride;
        let top = dfl_decode(&entry[REG_MAX..2 * REG_MAX]) * stride;
        let right = dfl_decode(&entry[2 * REG_MAX..3 * REG_MAX]) * stride;
        let bottom = dfl_decode(&entry[3 * REG_MAX..4 * REG_MAX]) * stride;

        let cx = (x as f32 + 0.5) * stride;
        let cy = (y as f32 + 0.5) * stride;

        all_detections.push(Detection {
          class_id: best_class as i32,
          class_name: class_name(labels, best_class),
          confidence: best_score,
          bbox: BBox {
            x1: cx - left,
            y1: cy - top,
            x2: cx + right,
            y2: cy + bottom,
          },
        });
      }
    }
  }

  nms(&mut all_detections, nms_thresh);
  scale_coords(&mut all_detections, model_w, model_h, orig_w, orig_h);
  all_detections
}

/// YOLOv11 后处理 (anchor-free, 单融合输出头, 通道主序)
///
/// 输出 shape [1, 4+C, A]，通道间步长为 A 个 float。
/// 前 4 通道是模型内部已完成 anchor 解码的 [cx, cy, w, h]
/// （模型输入像素），类别分数已在 [0,1]，无需 sigmoid。
pub fn yolov11(
  outputs: &[Vec<f32>],
  attrs: &[TensorAttr],
  model_w: u32,
  model_h: u32,
  orig_w: u32,
  orig_h: u32,
  conf_thresh: f32,
  nms_thresh: f32,
  labels: &[String],
) -> Vec<Detection> {
  let (Some(data), Some(attr)) = (outputs.first(), attrs.first()) else {
    error!("YOLOv11 缺少输出数据");
    return Vec::new();
  };

  if attr.dims.len() < 3 {
    error!("YOLOv11 需要 3 维张量, 实际 {} 维", attr.dims.len());
    return Vec::new();
  }

  // dims: [1, 4+C, A]
  let num_channels = attr.dims[1];
  let num_anchors = attr.dims[2];
  if num_channels <= 4 || data.len() < num_channels * num_anchors {
    error!(
      "YOLOv11 输出尺寸异常: channels={} anchors={} len={}",
      num_channels,
      num_anchors,
      data.len()
    );
    return Vec::new();
  }
  let num_classes = num_channels - 4;

  let mut all_detections = Vec::new();

  for i in 0..num_anchors {
    let mut best_class = 0usize;
    let mut best_score = f32::MIN;
    for c in 0..num_classes {
      let score = data[(4 + c) * num_anchors + i];
      if score > best_score {
        best_score = score;
        best_class = c;
      }
    }
    if best_score < conf_thresh {
      continue;
    }

    let cx = data[i];
    let cy = data[num_anchors + i];
    let w = data[2 * num_anchors + i];
    let h = data[3 * num_anchors + i];

    all_detections.push(Detection {
      class_id: best_class as i32,
      class_name: class_name(labels, best_class),
      confidence: best_score,
      bbox: BBox {
        x1: cx - w * 0.5,
        y1: cy - h * 0.5,
        x2: cx + w * 0.5,
        y2: cy + h * 0.5,
      },
    });
  }

  debug!("YOLOv11: NMS 前 {} 个候选", all_detections.len());
  nms(&mut all_detections, nms_thresh);
  scale_coords(&mut all_detections, model_w, model_h, orig_w, orig_h);
  all_detections
}

/// YOLOv11 备选解码：DFL 距离 + 显式 anchor 网格
///
/// 部分模型转换工具链导出的 v11 模型保留 DFL 输出头：
/// shape [1, 64+C, A]，前 64 通道是 4 组 reg_max=16 的分布，
/// 类别通道为 logits 需要 sigmoid。该变体不参与类型分发，
/// 部署方按需显式调用。
pub fn yolov11_dfl(
  outputs: &[Vec<f32>],
  attrs: &[TensorAttr],
  model_w: u32,
  model_h: u32,
  orig_w: u32,
  orig_h: u32,
  conf_thresh: f32,
  nms_thresh: f32,
  labels: &[String],
) -> Vec<Detection> {
  let (Some(data), Some(attr)) = (outputs.first(), attrs.first()) else {
    error!("YOLOv11(DFL) 缺少输出数据");
    return Vec::new();
  };

  if attr.dims.len() < 3 {
    error!("YOLOv11(DFL) 需要 3 维张量, 实际 {} 维", attr.dims.len());
    return Vec::new();
  }

  let num_channels = attr.dims[1];
  let num_anchors = attr.dims[2];
  if num_channels <= BOX_CHANNELS || data.len() < num_channels * num_anchors {
    error!(
      "YOLOv11(DFL) 输出尺寸异常: channels={} anchors={}",
      num_channels, num_anchors
    );
    return Vec::new();
  }
  let num_classes = num_channels - BOX_CHANNELS;

  // anchor 网格：stride 8/16/32 的网格中心依次拼接
  let mut expected = 0usize;
  for stride in STRIDES {
    expected += (model_h as usize / stride) * (model_w as usize / stride);
  }
  if expected != num_anchors {
    error!(
      "YOLOv11(DFL) anchor 数量不匹配: 期望 {}, 实际 {}",
      expected, num_anchors
    );
    return Vec::new();
  }

  let mut all_detections = Vec::new();
  let mut base = 0usize;
  let mut dist = [0.0f32; REG_MAX];

  for stride in STRIDES {
    let grid_h = model_h as usize / stride;
    let grid_w = model_w as usize / stride;
    let stride_f = stride as f32;

    for y in 0..grid_h {
      for x in 0..grid_w {
        let i = base + y * grid_w + x;

        let mut best_class = 0usize;
        let mut best_score = f32::MIN;
        for c in 0..num_classes {
          let score = data[(BOX_CHANNELS + c) * num_anchors + i];
          if score > best_score {
            best_score = score;
            best_class = c;
          }
        }
        let best_score = sigmoid(best_score);
        if best_score < conf_thresh {
          continue;
        }

        // 通道主序取 4 组 DFL 分布
        let mut ltrb = [0.0f32; 4];
        for (k, side) in ltrb.iter_mut().enumerate() {
          for (b, slot) in dist.iter_mut().enumerate() {
            *slot = data[(k * REG_MAX + b) * num_anchors + i];
          }
          *side = dfl_decode(&dist) * stride_f;
        }

        let cx = (x as f32 + 0.5) * stride_f;
        let cy = (y as f32 + 0.5) * stride_f;

        all_detections.push(Detection {
          class_id: best_class as i32,
          class_name: class_name(labels, best_class),
          confidence: best_score,
          bbox: BBox {
            x1: cx - ltrb[0],
            y1: cy - ltrb[1],
            x2: cx + ltrb[2],
            y2: cy + ltrb[3],
          },
        });
      }
    }
    base += grid_h * grid_w;
  }

  nms(&mut all_detections, nms_thresh);
  scale_coords(&mut all_detections, model_w, model_h, orig_w, orig_h);
  all_detections
}

/// 按模型家族分发后处理
#[allow(clippy::too_many_arguments)]
pub fn process(
  kind: ModelKind,
  outputs: &[Vec<f32>],
  attrs: &[TensorAttr],
  model_w: u32,
  model_h: u32,
  orig_w: u32,
  orig_h: u32,
  conf_thresh: f32,
  nms_thresh: f32,
  labels: &[String],
) -> Vec<Detection> {
  match kind {
    ModelKind::YoloV5 => yolov5(
      outputs, attrs, model_w, model_h, orig_w, orig_h, conf_thresh, nms_thresh, labels,
    ),
    ModelKind::YoloV8 => yolov8(
      outputs, attrs, model_w, model_h, orig_w, orig_h, conf_thresh, nms_thresh, labels,
    ),
    ModelKind::YoloV11 => yolov11(
      outputs, attrs, model_w, model_h, orig_w, orig_h, conf_thresh, nms_thresh, labels,
    ),
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn logit(p: f32) -> f32 {
    (p / (1.0 - p)).ln()
  }

  fn det(class_id: i32, confidence: f32, x1: f32, y1: f32, x2: f32, y2: f32) -> Detection {
    Detection {
      class_id,
      class_name: String::new(),
      confidence,
      bbox: BBox { x1, y1, x2, y2 },
    }
  }

  fn attr4(dims: [usize; 4]) -> TensorAttr {
    TensorAttr {
      n_elems: dims.iter().product(),
      dims: dims.to_vec(),
      ..TensorAttr::default()
    }
  }

  fn attr3(dims: [usize; 3]) -> TensorAttr {
    TensorAttr {
      n_elems: dims.iter().product(),
      dims: dims.to_vec(),
      ..TensorAttr::default()
    }
  }

  #[test]
  fn nms_suppresses_overlapping_same_class() {
    let mut dets = vec![
      det(0, 0.9, 10.0, 10.0, 110.0, 110.0),
      det(0, 0.8, 15.0, 15.0, 115.0, 115.0),
      det(0, 0.7, 200.0, 200.0, 300.0, 300.0),
    ];
    nms(&mut dets, 0.5);
    assert_eq!(dets.len(), 2);
    assert!((dets[0].confidence - 0.9).abs() < 0.01);
    assert!((dets[1].confidence - 0.7).abs() < 0.01);
  }

  #[test]
  fn nms_keeps_different_classes() {
    let mut dets = vec![
      det(0, 0.9, 10.0, 10.0, 110.0, 110.0),
      det(1, 0.8, 10.0, 10.0, 110.0, 110.0),
    ];
    nms(&mut dets, 0.5);
    assert_eq!(dets.len(), 2);
  }

  #[test]
  fn nms_threshold_extremes() {
    // 阈值 1.0: IoU 永远不会超过 1, 不抑制任何框
    let mut dets = vec![
      det(0, 0.9, 0.0, 0.0, 100.0, 100.0),
      det(0, 0.8, 0.0, 0.0, 100.0, 100.0),
      det(0, 0.7, 1.0, 1.0, 99.0, 99.0),
    ];
    nms(&mut dets, 1.0);
    assert_eq!(dets.len(), 3);

    // 阈值 0.0: 任意重叠都抑制, 每类每簇只剩最高分;
    // 这里所有框互相重叠, 每类最多剩一个
    let mut dets = vec![
      det(0, 0.9, 0.0, 0.0, 100.0, 100.0),
      det(0, 0.8, 50.0, 50.0, 150.0, 150.0),
      det(0, 0.7, 90.0, 90.0, 190.0, 190.0),
    ];
    nms(&mut dets, 0.0);
    assert_eq!(dets.len(), 1);
    assert!((dets[0].confidence - 0.9).abs() < 0.01);
  }

  #[test]
  fn nms_empty_input() {
    let mut dets: Vec<Detection> = Vec::new();
    nms(&mut dets, 0.5);
    assert!(dets.is_empty());
  }

  #[test]
  fn dequantize_int8_values() {
    let data: [i8; 5] = [0, 10, -10, 127, -128];
    let out = dequantize_int8(&data, 0, 0.5);
    assert!((out[0] - 0.0).abs() < 1e-3);
    assert!((out[1] - 5.0).abs() < 1e-3);
    assert!((out[2] + 5.0).abs() < 1e-3);
    assert!((out[3] - 63.5).abs() < 1e-3);
    assert!((out[4] + 64.0).abs() < 1e-3);
  }

  #[test]
  fn dfl_uniform_distribution_decodes_to_center() {
    // 全 0 -> softmax 均匀 -> 期望 = (0+..+15)/16 = 7.5
    let data = [0.0f32; REG_MAX];
    assert!((dfl_decode(&data) - 7.5).abs() < 1e-4);

    // 单点尖峰 -> 期望即该 bin
    let mut peak = [0.0f32; REG_MAX];
    peak[3] = 100.0;
    assert!((dfl_decode(&peak) - 3.0).abs() < 1e-3);
  }

  #[test]
  fn unletterbox_inverts_letterbox() {
    // 1920x1080 -> 640x640: scale = 1/3, pad_y = (640 - 360) / 2 = 140
    let (orig_w, orig_h) = (1920u32, 1080u32);
    let (model_w, model_h) = (640u32, 640u32);
    let scale = (model_w as f32 / orig_w as f32).min(model_h as f32 / orig_h as f32);
    let pad_x = (model_w as f32 - orig_w as f32 * scale) / 2.0;
    let pad_y = (model_h as f32 - orig_h as f32 * scale) / 2.0;

    // 原始坐标系下的框, 正向 letterbox 到模型坐标系
    let orig_box = BBox { x1: 300.0, y1: 150.0, x2: 900.0, y2: 750.0 };
    let mut dets = vec![det(
      0,
      0.9,
      orig_box.x1 * scale + pad_x,
      orig_box.y1 * scale + pad_y,
      orig_box.x2 * scale + pad_x,
      orig_box.y2 * scale + pad_y,
    )];

    scale_coords(&mut dets, model_w, model_h, orig_w, orig_h);

    assert!((dets[0].bbox.x1 - orig_box.x1).abs() < 0.5);
    assert!((dets[0].bbox.y1 - orig_box.y1).abs() < 0.5);
    assert!((dets[0].bbox.x2 - orig_box.x2).abs() < 0.5);
    assert!((dets[0].bbox.y2 - orig_box.y2).abs() < 0.5);
  }

  fn yolov5_synthetic_heads(num_classes: usize) -> (Vec<Vec<f32>>, Vec<TensorAttr>) {
    let entry_size = 5 + num_classes;
    let channel = YOLOV5_NUM_ANCHORS * entry_size;
    let outputs = vec![
      vec![0.0f32; 80 * 80 * channel],
      vec![0.0f32; 40 * 40 * channel],
      vec![0.0f32; 20 * 20 * channel],
    ];
    let attrs = vec![
      attr4([1, 80, 80, channel]),
      attr4([1, 40, 40, channel]),
      attr4([1, 20, 20, channel]),
    ];
    (outputs, attrs)
  }

  #[test]
  fn yolov5_synthetic_detection() {
    let (mut outputs, attrs) = yolov5_synthetic_heads(1);

    // 在 head 0 (stride=8, 80x80) 的 (40,40) anchor 0 放一个高置信度检测
    let entry_size = 6;
    let (y, x, a) = (40usize, 40usize, 0usize);
    let offset = (y * 80 * YOLOV5_NUM_ANCHORS + x * YOLOV5_NUM_ANCHORS + a) * entry_size;
    // 几何原始值全 0:
    //   cx = (sigmoid(0)*2-0.5+40)*8 = 324, 同 cy
    //   w = (sigmoid(0)*2)^2 * 10 = 10, h = ... * 13 = 13
    outputs[0][offset + 4] = logit(0.95);
    outputs[0][offset + 5] = logit(0.90);

    let labels = vec!["person".to_string()];
    let dets = yolov5(&outputs, &attrs, 640, 640, 640, 640, 0.5, 0.45, &labels);

    assert_eq!(dets.len(), 1);
    let d = &dets[0];
    assert_eq!(d.class_id, 0);
    assert_eq!(d.class_name, "person");
    assert!((d.confidence - 0.95 * 0.90).abs() < 0.02);

    let cx = (d.bbox.x1 + d.bbox.x2) / 2.0;
    let cy = (d.bbox.y1 + d.bbox.y2) / 2.0;
    assert!((cx - 324.0).abs() < 0.5);
    assert!((cy - 324.0).abs() < 0.5);
    assert!(((d.bbox.x2 - d.bbox.x1) - 10.0).abs() < 0.1);
    assert!(((d.bbox.y2 - d.bbox.y1) - 13.0).abs() < 0.1);
  }

  #[test]
  fn yolov5_all_below_threshold_yields_nothing() {
    // 全 0 张量: obj = sigmoid(0) = 0.5 < 0.5 不成立? obj == 阈值时通过,
    // 但组合置信度 0.5 * 0.5 = 0.25 < 0.5 被过滤
    let (outputs, attrs) = yolov5_synthetic_heads(2);
    let dets = yolov5(&outputs, &attrs, 640, 640, 640, 640, 0.5, 0.45, &[]);
    assert!(dets.is_empty());
  }

  #[test]
  fn yolov8_synthetic_detection() {
    let num_classes = 2;
    let channel = BOX_CHANNELS + num_classes;
    let mut outputs = vec![
      vec![0.0f32; 80 * 80 * channel],
      vec![0.0f32; 40 * 40 * channel],
      vec![0.0f32; 20 * 20 * channel],
    ];
    let attrs = vec![
      attr4([1, 80, 80, channel]),
      attr4([1, 40, 40, channel]),
      attr4([1, 20, 20, channel]),
    ];

    // (40,40) 处 class 1 高置信度; DFL 全 0 -> 每边距离 7.5*8 = 60
    let offset = (40 * 80 + 40) * channel;
    outputs[0][offset + BOX_CHANNELS + 1] = logit(0.9);

    // 阈值取 0.6: 空白格子的 sigmoid(0)=0.5 被过滤
    let labels = vec!["person".to_string(), "phone".to_string()];
    let dets = yolov8(&outputs, &attrs, 640, 640, 640, 640, 0.6, 0.45, &labels);

    assert_eq!(dets.len(), 1);
    let d = &dets[0];
    assert_eq!(d.class_id, 1);
    assert_eq!(d.class_name, "phone");
    assert!((d.confidence - 0.9).abs() < 0.01);
    // grid 中心 (40.5*8, 40.5*8) = (324, 324), 每边 60
    assert!((d.bbox.x1 - 264.0).abs() < 0.5);
    assert!((d.bbox.y1 - 264.0).abs() < 0.5);
    assert!((d.bbox.x2 - 384.0).abs() < 0.5);
    assert!((d.bbox.y2 - 384.0).abs() < 0.5);
  }

  #[test]
  fn yolov8_all_below_threshold_yields_nothing() {
    let channel = BOX_CHANNELS + 2;
    let outputs = vec![
      vec![0.0f32; 80 * 80 * channel],
      vec![0.0f32; 40 * 40 * channel],
      vec![0.0f32; 20 * 20 * channel],
    ];
    let attrs = vec![
      attr4([1, 80, 80, channel]),
      attr4([1, 40, 40, channel]),
      attr4([1, 20, 20, channel]),
    ];
    let dets = yolov8(&outputs, &attrs, 640, 640, 640, 640, 0.6, 0.45, &[]);
    assert!(dets.is_empty());
  }

  #[test]
  fn yolov11_synthetic_detection() {
    // [1, 4+2, 10] 通道主序
    let num_anchors = 10;
    let num_channels = 6;
    let mut data = vec![0.0f32; num_channels * num_anchors];
    let i = 3;
    data[i] = 100.0; // cx
    data[num_anchors + i] = 120.0; // cy
    data[2 * num_anchors + i] = 40.0; // w
    data[3 * num_anchors + i] = 60.0; // h
    data[4 * num_anchors + i] = 0.9; // class 0 概率 (无需 sigmoid)

    let outputs = vec![data];
    let attrs = vec![attr3([1, num_channels, num_anchors])];
    let labels = vec!["person".to_string(), "phone".to_string()];

    let dets = yolov11(&outputs, &attrs, 640, 640, 640, 640, 0.5, 0.45, &labels);
    assert_eq!(dets.len(), 1);
    let d = &dets[0];
    assert_eq!(d.class_id, 0);
    assert!((d.confidence - 0.9).abs() < 1e-4);
    assert!((d.bbox.x1 - 80.0).abs() < 0.1);
    assert!((d.bbox.y1 - 90.0).abs() < 0.1);
    assert!((d.bbox.x2 - 120.0).abs() < 0.1);
    assert!((d.bbox.y2 - 150.0).abs() < 0.1);
  }

  #[test]
  fn yolov11_all_below_threshold_yields_nothing() {
    let outputs = vec![vec![0.0f32; 6 * 10]];
    let attrs = vec![attr3([1, 6, 10])];
    let dets = yolov11(&outputs, &attrs, 640, 640, 640, 640, 0.5, 0.45, &[]);
    assert!(dets.is_empty());
  }

  #[test]
  fn yolov11_dfl_synthetic_detection() {
    // 640x640 -> anchor 总数 8400
    let num_anchors = 80 * 80 + 40 * 40 + 20 * 20;
    let num_channels = BOX_CHANNELS + 1;
    let mut data = vec![0.0f32; num_channels * num_anchors];

    // stride 8 网格 (40,40) -> 索引 40*80+40; DFL 全 0 -> 每边 60
    let i = 40 * 80 + 40;
    data[BOX_CHANNELS * num_anchors + i] = logit(0.9);

    let outputs = vec![data];
    let attrs = vec![attr3([1, num_channels, num_anchors])];
    // 阈值取 0.6: 空白 anchor 的 sigmoid(0)=0.5 被过滤
    let dets = yolov11_dfl(&outputs, &attrs, 640, 640, 640, 640, 0.6, 0.45, &[]);

    assert_eq!(dets.len(), 1);
    let d = &dets[0];
    assert!((d.confidence - 0.9).abs() < 0.01);
    assert!((d.bbox.x1 - 264.0).abs() < 0.5);
    assert!((d.bbox.x2 - 384.0).abs() < 0.5);
  }

  #[test]
  fn process_dispatches_by_kind() {
    let (outputs, attrs) = yolov5_synthetic_heads(1);
    let dets = process(
      ModelKind::YoloV5,
      &outputs,
      &attrs,
      640,
      640,
      640,
      640,
      0.5,
      0.45,
      &[],
    );
    assert!(dets.is_empty());
  }
}
