// 该文件是 Wuling （雾岭） 项目的一部分。
// src/main.rs - 服务主程序
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use std::sync::Arc;
use std::sync::mpsc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use wuling::cache::ImageCache;
use wuling::config::{self, ServerConfig};
use wuling::decoder::DecoderFactory;
use wuling::infer::{InferenceBackend, InferenceEngine};
use wuling::npu::NpuRuntime;
use wuling::stream::StreamManager;

/// Wuling 多路视频流 NPU 推理服务
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
  /// 服务器配置文件路径 (JSON)
  #[arg(long, short = 'c', value_name = "FILE", default_value = "config/server.json")]
  config: String,
}

#[cfg(feature = "rknn")]
fn create_npu_runtime() -> Result<Arc<dyn NpuRuntime>> {
  Ok(Arc::new(wuling::npu::rknn::RknnRuntime::new()))
}

#[cfg(not(feature = "rknn"))]
fn create_npu_runtime() -> Result<Arc<dyn NpuRuntime>> {
  anyhow::bail!("编译时未启用 rknn 特性, 无法创建 NPU 运行时")
}

#[cfg(feature = "ffmpeg")]
fn create_decoder_factory() -> Result<Arc<dyn DecoderFactory>> {
  Ok(Arc::new(wuling::decoder::FfmpegDecoderFactory::new()))
}

#[cfg(not(feature = "ffmpeg"))]
fn create_decoder_factory() -> Result<Arc<dyn DecoderFactory>> {
  anyhow::bail!("编译时未启用 ffmpeg 特性, 无法解码 RTSP")
}

fn main() -> Result<()> {
  let args = Args::parse();

  // 加载配置 (不存在时使用默认值)
  let cfg = match config::load_server_config(&args.config) {
    Ok(cfg) => {
      println!("[startup] 已加载配置: {}", args.config);
      cfg
    }
    Err(e) => {
      println!("[startup] 使用默认配置 ({e})");
      ServerConfig::default()
    }
  };

  // 初始化日志
  let filter = EnvFilter::try_new(&cfg.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_writer(std::io::stderr)
    .init();

  info!("===================================");
  info!("  Wuling （雾岭） v{}", env!("CARGO_PKG_VERSION"));
  info!("===================================");
  info!("配置:");
  info!("  HTTP 端口:    {}", cfg.http_port);
  info!("  ZMQ 端点:     {}", cfg.zmq_endpoint);
  info!("  推理线程:     {}", cfg.num_infer_workers);
  info!("  推理队列:     {}", cfg.infer_queue_size);
  info!("  流配置路径:   {}", cfg.streams_save_path);
  info!("  缓存保留:     {}s", cfg.cache_duration_sec);
  info!("  缓存内存上限: {}MB", cfg.cache_max_memory_mb);

  // 组装核心组件
  let runtime = create_npu_runtime()?;
  let decoder_factory = create_decoder_factory()?;
  let engine = Arc::new(InferenceEngine::new(&cfg, runtime));
  let cache = Arc::new(ImageCache::new(
    cfg.cache_duration_sec,
    cfg.cache_max_memory_mb,
  ));
  let manager = Arc::new(StreamManager::new(
    &cfg,
    Arc::clone(&engine) as Arc<dyn InferenceBackend>,
    Arc::clone(&cache),
    decoder_factory,
  ));

  // 引擎结果回调: 推进各流的 inferred 计数
  let callback_manager = Arc::clone(&manager);
  engine.set_result_callback(Arc::new(move |result| {
    callback_manager.on_infer_result(result);
  }));

  engine.init().context("推理引擎初始化失败")?;

  // 恢复持久化的流配置
  match config::load_streams(&cfg.streams_save_path) {
    Ok(streams) if !streams.is_empty() => {
      info!("发现 {} 路持久化流, 开始恢复", streams.len());
      manager.load_and_start(streams);
    }
    Ok(_) => {}
    Err(e) => info!("没有可恢复的流配置: {}", e),
  }

  // 信号处理: 收到 SIGINT/SIGTERM 后优雅退出, 30s 看门狗兜底
  let (tx, rx) = mpsc::channel::<()>();
  ctrlc::set_handler(move || {
    info!("收到中断信号, 准备退出...");
    let _ = tx.send(());
    std::thread::spawn(|| {
      std::thread::sleep(Duration::from_secs(30));
      warn!("优雅退出超时, 强制退出");
      std::process::exit(1);
    });
  })
  .context("无法注册信号处理器")?;

  info!("服务已启动, Ctrl+C 退出");

  if rx.recv().is_err() {
    error!("信号通道异常");
  }

  // 按顺序关闭: 先停流水线, 再停推理引擎
  info!("服务关闭中...");
  manager.shutdown();
  engine.shutdown();
  info!("服务已退出");

  Ok(())
}
