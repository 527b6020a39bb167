// 该文件是 Qianli （千里眼） 项目的一部分。
// src/engine/binding.rs - 张量绑定目录
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

use tracing::debug;

use super::{EngineError, executor::TensorBinder};
use crate::runtime::{DataType, Engine, ExecutionContext, IoMode, Shape};

/// 执行计划中的一个输入或输出张量槽位
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
  /// 在执行计划中的槽位序号
  pub index: usize,
  pub name: String,
  pub data_type: DataType,
  pub element_size: usize,
  /// 输入为优化配置中的最大形状，即缓冲区容量对应的形状
  pub shape: Shape,
  pub element_count: usize,
}

impl Binding {
  fn new(index: usize, name: &str, data_type: DataType, shape: Shape) -> Result<Self, EngineError> {
    let element_count = shape
      .element_count()
      .filter(|count| count.checked_mul(data_type.size()).is_some())
      .ok_or_else(|| EngineError::DynamicShape {
        name: name.to_string(),
        shape: shape.clone(),
      })?;
    Ok(Self {
      index,
      name: name.to_string(),
      data_type,
      element_size: data_type.size(),
      shape,
      element_count,
    })
  }

  /// 缓冲区容量
  pub fn byte_size(&self) -> usize {
    self.element_count * self.element_size
  }
}

#[derive(Debug, Clone, Default)]
pub struct BindingCatalog {
  inputs: Vec<Binding>,
  outputs: Vec<Binding>,
}

impl BindingCatalog {
  /// 按执行计划顺序枚举张量，把每个输入的最大形状提交为执行形状，
  /// 然后读取由此确定的输出形状。
  pub(crate) fn discover<E, C, B>(
    engine: &E,
    context: &mut C,
    binder: &mut B,
  ) -> Result<Self, EngineError>
  where
    E: Engine<Context = C>,
    C: ExecutionContext,
    B: TensorBinder<C> + ?Sized,
  {
    let mut catalog = Self::default();
    let mut output_slots = Vec::new();

    for index in 0..engine.num_io_tensors() {
      let name = engine.tensor_name(index).map_err(EngineError::Deserialize)?;
      let data_type = engine
        .tensor_data_type(index)
        .map_err(EngineError::Deserialize)?;
      match engine.tensor_io_mode(index).map_err(EngineError::Deserialize)? {
        IoMode::Input => {
          let shape = engine
            .profile_max_shape(index)
            .map_err(EngineError::Deserialize)?;
          let binding = Binding::new(index, name, data_type, shape)?;
          binder
            .commit_input_shape(context, &binding, &binding.shape)
            .map_err(EngineError::Binding)?;
          debug!(
            "输入张量 #{} {}: {} {}, {} 字节",
            index,
            binding.name,
            binding.data_type,
            binding.shape,
            binding.byte_size()
          );
          catalog.inputs.push(binding);
        }
        IoMode::Output => output_slots.push((index, name.to_string(), data_type)),
      }
    }

    for (index, name, data_type) in output_slots {
      let shape = context
        .tensor_shape(index)
        .map_err(EngineError::Binding)?;
      let binding = Binding::new(index, &name, data_type, shape)?;
      debug!(
        "输出张量 #{} {}: {} {}, {} 字节",
        index,
        binding.name,
        binding.data_type,
        binding.shape,
        binding.byte_size()
      );
      catalog.outputs.push(binding);
    }

    Ok(catalog)
  }

  pub fn inputs(&self) -> &[Binding] {
    &self.inputs
  }

  pub fn outputs(&self) -> &[Binding] {
    &self.outputs
  }

  pub fn input(&self, index: usize) -> Option<&Binding> {
    self.inputs.get(index)
  }

  pub fn output(&self, index: usize) -> Option<&Binding> {
    self.outputs.get(index)
  }

  pub fn num_tensors(&self) -> usize {
    self.inputs.len() + self.outputs.len()
  }

  pub fn iter(&self) -> impl Iterator<Item = &Binding> {
    self.inputs.iter().chain(self.outputs.iter())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn byte_size_is_count_times_element_size() {
    let binding = Binding::new(0, "images", DataType::Float32, Shape::from([1, 3, 640, 640])).unwrap();
    assert_eq!(binding.element_count, 1228800);
    assert_eq!(binding.byte_size(), 4915200);

    let binding = Binding::new(1, "mask", DataType::UInt8, Shape::from([2, 5])).unwrap();
    assert_eq!(binding.byte_size(), 10);
  }

  #[test]
  fn dynamic_shape_cannot_size_a_buffer() {
    let err = Binding::new(0, "images", DataType::Float32, Shape::from([1, 3, -1, 640])).unwrap_err();
    assert!(matches!(err, EngineError::DynamicShape { .. }));
  }
}
