// 该文件是 Wuling （雾岭） 项目的一部分。
// src/publisher.rs - 推理结果发布
//
// 本文件根据 Apache 许可证第 2.0 版（以下简称“许可证”）授权使用；
// 除非遵守该许可证条款，否则您不得使用本文件。
// 您可通过以下网址获取许可证副本：
// http://www.apache.org/licenses/LICENSE-2.0
// 除非适用法律要求或书面同意，根据本许可协议分发的软件均按“原样”提供，
// 不附带任何形式的明示或暗示的保证或条件。
// 有关许可权限与限制的具体条款，请参阅本许可协议。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, Wareless Group

//! # 结果发布
//!
//! 帧结果序列化为 UTF-8 JSON 单帧消息广播出去，无 topic 帧。
//! 发布是尽力而为：socket 达到高水位时静默丢弃，只有计数能观察到。

use thiserror::Error;

use crate::types::FrameResult;

#[derive(Error, Debug)]
pub enum PublishError {
  #[error("发布端点初始化失败 {endpoint}: {reason}")]
  Bind { endpoint: String, reason: String },
}

/// 帧结果广播端
pub trait ResultPublisher: Send + Sync {
  /// 发布单个帧结果（非阻塞，允许丢弃）
  fn publish(&self, result: &FrameResult);

  /// 已成功发布的消息计数
  fn published_count(&self) -> u64;

  /// 关闭发布端（允许最多 linger 时长冲刷在途消息）
  fn shutdown(&self);
}

#[cfg(feature = "zmq-publish")]
pub use self::zeromq::ZmqPublisher;

#[cfg(feature = "zmq-publish")]
mod zeromq {
  use std::sync::Mutex;
  use std::sync::atomic::{AtomicU64, Ordering};

  use tracing::{error, info, trace};

  use super::{PublishError, ResultPublisher};
  use crate::types::FrameResult;

  /// 发送高水位线：超过后消息被丢弃，避免内存无限增长
  const SEND_HWM: i32 = 100;
  /// 关闭时等待消息发送的时长（毫秒）
  const LINGER_MS: i32 = 1000;

  /// ZeroMQ PUB 发布器
  ///
  /// 绑定配置的 endpoint（tcp 或 ipc）。socket 不是线程安全的，
  /// 由互斥锁串行化发送；发布顺序即各 worker 的完成顺序。
  pub struct ZmqPublisher {
    endpoint: String,
    socket: Mutex<zmq::Socket>,
    _context: zmq::Context,
    published: AtomicU64,
  }

  impl ZmqPublisher {
    pub fn bind(endpoint: &str) -> Result<Self, PublishError> {
      let context = zmq::Context::new();
      let socket = context
        .socket(zmq::PUB)
        .and_then(|socket| {
          socket.set_sndhwm(SEND_HWM)?;
          socket.set_linger(LINGER_MS)?;
          socket.bind(endpoint)?;
          Ok(socket)
        })
        .map_err(|e| PublishError::Bind {
          endpoint: endpoint.to_string(),
          reason: e.to_string(),
        })?;

      info!("ZmqPublisher 已绑定: {}", endpoint);
      Ok(ZmqPublisher {
        endpoint: endpoint.to_string(),
        socket: Mutex::new(socket),
        _context: context,
        published: AtomicU64::new(0),
      })
    }
  }

  impl ResultPublisher for ZmqPublisher {
    fn publish(&self, result: &FrameResult) {
      let msg = match serde_json::to_string(result) {
        Ok(msg) => msg,
        Err(e) => {
          error!("帧结果序列化失败: {}", e);
          return;
        }
      };

      let socket = self.socket.lock().expect("publisher mutex poisoned");
      match socket.send(msg.as_bytes(), zmq::DONTWAIT) {
        Ok(()) => {
          self.published.fetch_add(1, Ordering::Relaxed);
          trace!(
            "已发布: [{}] 帧 {} ({} 字节)",
            result.cam_id,
            result.frame_id,
            msg.len()
          );
        }
        // 高水位丢弃按 Overflow 处理: 静默, 只体现在计数上
        Err(zmq::Error::EAGAIN) => {}
        Err(e) => error!("发布失败: {}", e),
      }
    }

    fn published_count(&self) -> u64 {
      self.published.load(Ordering::Relaxed)
    }

    fn shutdown(&self) {
      info!(
        "ZmqPublisher 关闭: {} (已发布 {} 条)",
        self.endpoint,
        self.published_count()
      );
    }
  }
}
