// 该文件是 Wuling （雾岭） 项目的一部分。
// src/queue.rs - 线程安全有界队列（满时丢弃最旧元素）
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

//! # 有界任务队列
//!
//! 解码线程与推理线程之间的帧传递缓冲：
//! - 队列满时自动丢弃最旧的元素，保证实时性（宁可推理新帧也不积压旧帧）
//! - 支持带超时的阻塞 pop 和非阻塞 try_pop
//! - 支持 `stop()` 优雅关闭：唤醒所有等待者，拒绝后续 push
//! - 统计丢弃数量
//! - 元素按移动语义传递，队列从不拷贝

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::Duration;

struct Inner<T> {
  queue: VecDeque<T>,
  stopped: bool,
  dropped: u64,
}

/// 多生产者多消费者有界队列
pub struct BoundedQueue<T> {
  capacity: usize,
  inner: Mutex<Inner<T>>,
  not_empty: Condvar,
}

impl<T> BoundedQueue<T> {
  /// 构造有界队列，容量必须大于 0（传入 0 时按 1 处理）
  pub fn new(capacity: usize) -> Self {
    BoundedQueue {
      capacity: capacity.max(1),
      inner: Mutex::new(Inner {
        queue: VecDeque::new(),
        stopped: false,
        dropped: 0,
      }),
      not_empty: Condvar::new(),
    }
  }

  /// 推入元素。队列已满时丢弃队首（最旧）元素并计数。
  ///
  /// 返回 false 表示队列已停止，元素未被插入。
  pub fn push(&self, item: T) -> bool {
    {
      let mut inner = self.inner.lock().expect("queue mutex poisoned");
      if inner.stopped {
        return false;
      }
      if inner.queue.len() >= self.capacity {
        inner.queue.pop_front();
        inner.dropped += 1;
      }
      inner.queue.push_back(item);
    }
    self.not_empty.notify_one();
    true
  }

  /// 阻塞弹出，最多等待 `timeout`。
  ///
  /// 超时、或被 `stop()` 唤醒且队列为空时返回 None。
  pub fn pop(&self, timeout: Duration) -> Option<T> {
    let inner = self.inner.lock().expect("queue mutex poisoned");
    let (mut inner, _result) = self
      .not_empty
      .wait_timeout_while(inner, timeout, |inner| {
        inner.queue.is_empty() && !inner.stopped
      })
      .expect("queue mutex poisoned");
    inner.queue.pop_front()
  }

  /// 非阻塞弹出
  pub fn try_pop(&self) -> Option<T> {
    let mut inner = self.inner.lock().expect("queue mutex poisoned");
    inner.queue.pop_front()
  }

  /// 当前队列长度
  pub fn len(&self) -> usize {
    self.inner.lock().expect("queue mutex poisoned").queue.len()
  }

  /// 队列是否为空
  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// 队列是否已满
  pub fn is_full(&self) -> bool {
    self.len() >= self.capacity
  }

  /// 最大容量
  pub fn capacity(&self) -> usize {
    self.capacity
  }

  /// 累计丢弃的元素数量
  pub fn dropped_count(&self) -> u64 {
    self.inner.lock().expect("queue mutex poisoned").dropped
  }

  /// 队列是否已停止
  pub fn is_stopped(&self) -> bool {
    self.inner.lock().expect("queue mutex poisoned").stopped
  }

  /// 停止队列：唤醒所有等待的 pop，之后的 push 全部失败
  pub fn stop(&self) {
    {
      let mut inner = self.inner.lock().expect("queue mutex poisoned");
      inner.stopped = true;
    }
    self.not_empty.notify_all();
  }

  /// 清空队列内容（不改变 stopped 状态和丢弃计数）
  pub fn clear(&self) {
    let mut inner = self.inner.lock().expect("queue mutex poisoned");
    inner.queue.clear();
  }

  /// 重置队列：清空内容、取消停止状态、清零统计
  pub fn reset(&self) {
    let mut inner = self.inner.lock().expect("queue mutex poisoned");
    inner.queue.clear();
    inner.stopped = false;
    inner.dropped = 0;
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::Arc;
  use std::sync::atomic::{AtomicU64, Ordering};
  use std::thread;

  #[test]
  fn drop_oldest_on_overflow() {
    let q = BoundedQueue::new(3);
    for i in 1..=5 {
      assert!(q.push(i));
    }
    assert_eq!(q.len(), 3);
    assert_eq!(q.dropped_count(), 2);
    // 1 和 2 被丢弃，弹出顺序为 3, 4, 5
    assert_eq!(q.try_pop(), Some(3));
    assert_eq!(q.try_pop(), Some(4));
    assert_eq!(q.try_pop(), Some(5));
    assert_eq!(q.try_pop(), None);
  }

  #[test]
  fn fifo_order_without_overflow() {
    let q = BoundedQueue::new(8);
    for i in 0..5 {
      q.push(i);
    }
    for i in 0..5 {
      assert_eq!(q.pop(Duration::from_millis(10)), Some(i));
    }
  }

  #[test]
  fn pop_times_out_on_empty() {
    let q: BoundedQueue<u32> = BoundedQueue::new(4);
    assert_eq!(q.pop(Duration::from_millis(20)), None);
  }

  #[test]
  fn stop_wakes_blocked_pop_and_rejects_push() {
    let q: Arc<BoundedQueue<u32>> = Arc::new(BoundedQueue::new(4));
    let q2 = Arc::clone(&q);
    let handle = thread::spawn(move || q2.pop(Duration::from_secs(10)));

    thread::sleep(Duration::from_millis(50));
    q.stop();
    assert_eq!(handle.join().unwrap(), None);
    assert!(q.is_stopped());
    assert!(!q.push(1));
    assert_eq!(q.len(), 0);
  }

  #[test]
  fn reset_after_stop() {
    let q = BoundedQueue::new(2);
    q.push(1);
    q.push(2);
    q.push(3);
    q.stop();
    assert!(q.is_stopped());
    q.reset();
    assert!(!q.is_stopped());
    assert_eq!(q.dropped_count(), 0);
    assert!(q.push(7));
    assert_eq!(q.try_pop(), Some(7));
  }

  #[test]
  fn concurrent_accounting() {
    // 多生产者多消费者下: pushed = popped + dropped + 剩余
    let q: Arc<BoundedQueue<u64>> = Arc::new(BoundedQueue::new(8));
    let popped = Arc::new(AtomicU64::new(0));
    const PER_PRODUCER: u64 = 500;

    let mut producers = Vec::new();
    for p in 0..4 {
      let q = Arc::clone(&q);
      producers.push(thread::spawn(move || {
        for i in 0..PER_PRODUCER {
          assert!(q.push(p * PER_PRODUCER + i));
        }
      }));
    }

    let mut consumers = Vec::new();
    for _ in 0..2 {
      let q = Arc::clone(&q);
      let popped = Arc::clone(&popped);
      consumers.push(thread::spawn(move || {
        while q.pop(Duration::from_millis(100)).is_some() {
          popped.fetch_add(1, Ordering::Relaxed);
        }
      }));
    }

    for h in producers {
      h.join().unwrap();
    }
    for h in consumers {
      h.join().unwrap();
    }

    let pushed = 4 * PER_PRODUCER;
    let total = popped.load(Ordering::Relaxed) + q.dropped_count() + q.len() as u64;
    assert_eq!(pushed, total);
  }
}
