// 该文件是 Qianli （千里眼） 项目的一部分。
// src/bin/simple_oneshot.rs - 单帧图像推理
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

use anyhow::Result;
use clap::Parser;
use url::Url;

use qianli::{
  FromUrl,
  input::InputWrapper,
  model::YoloV8Builder,
  output::OutputWrapper,
  runtime::{Runtime, RuntimeKind, replay::ReplayRuntime},
  task::{OneShotTask, Task},
};
use tracing::info;

/// Qianli 单帧推理参数
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 模型，例如 yolov8:///path/to/model.onnx?runtime=onnx&device=cuda&score=0.25
  ///
  /// `runtime=onnx|replay` 选择运行时，默认优先使用 ONNX Runtime
  #[arg(long, value_name = "MODEL")]
  pub model: Url,
  /// 输入来源
  #[arg(long, value_name = "SOURCE")]
  pub input: Url,
  /// 输出方式
  #[arg(long, value_name = "OUTPUT")]
  pub output: Url,
}

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();

  info!("模型: {}", args.model);
  info!("输入来源: {}", args.input);
  info!("输出方式: {}", args.output);

  let kind = RuntimeKind::from_url(&args.model)?;
  info!("运行时: {}", kind);
  match kind {
    RuntimeKind::Replay => run(ReplayRuntime::new(), &args),
    #[cfg(feature = "onnx")]
    RuntimeKind::Onnx => run(
      qianli::runtime::onnx::OnnxRuntime::from_url(&args.model)?,
      &args,
    ),
    #[cfg(not(feature = "onnx"))]
    RuntimeKind::Onnx => anyhow::bail!("onnx 运行时未编译，请启用 onnx 特性"),
  }
}

fn run<R: Runtime>(runtime: R, args: &Args) -> Result<()> {
  let input = InputWrapper::from_url(&args.input)?;
  let model = YoloV8Builder::from_url(&args.model)?.build(runtime)?;
  let output = OutputWrapper::from_url(&args.output)?;

  OneShotTask.run_task(input, model, output)
}
