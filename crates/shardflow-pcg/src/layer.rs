//! The logical layer graph built by the user program.
//!
//! Layers are immutable once referenced; shapes are checked eagerly so a
//! malformed graph fails at construction, before lifting.

use std::collections::HashMap;

use shardflow_core::error::{Error, Result};
use shardflow_core::tensor::{ParallelTensorShape, TensorShape};
use shardflow_core::types::{GuidAllocator, LayerId, TensorId};
use shardflow_ops::{InputAttrs, OperatorAttrs};
use smallvec::SmallVec;

/// A logical tensor produced by a layer.
#[derive(Debug, Clone)]
pub struct LogicalTensor {
    /// Globally unique id
    pub id: TensorId,
    /// Logical shape
    pub shape: TensorShape,
    /// Whether gradients are computed for this tensor
    pub create_gradients: bool,
}

/// One layer of the user's network description.
#[derive(Debug, Clone)]
pub struct Layer {
    /// Globally unique id
    pub id: LayerId,
    /// Optional user-facing name
    pub name: Option<String>,
    /// Kind-specific attributes
    pub attrs: OperatorAttrs,
    /// Input tensors, produced by earlier layers
    pub inputs: Vec<TensorId>,
    /// Output tensors, owned by this layer
    pub outputs: Vec<LogicalTensor>,
}

/// An ordered graph of layers over logical tensors.
#[derive(Debug, Default, Clone)]
pub struct LayerGraph {
    layers: Vec<Layer>,
    producers: HashMap<TensorId, (LayerId, usize)>,
}

impl LayerGraph {
    /// Create an empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// The layers in construction order.
    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    /// Number of layers.
    pub fn len(&self) -> usize {
        self.layers.len()
    }

    /// Whether the graph has no layers.
    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Shape of a tensor in the graph.
    pub fn shape_of(&self, tensor: TensorId) -> Result<&TensorShape> {
        let (layer, slot) = self
            .producers
            .get(&tensor)
            .ok_or_else(|| Error::structural(format!("unknown tensor {tensor:?}")))?;
        let layer = self
            .layers
            .iter()
            .find(|l| l.id == *layer)
            .ok_or_else(|| Error::structural(format!("unknown layer {layer}")))?;
        Ok(&layer.outputs[*slot].shape)
    }

    /// Add an input layer producing one tensor of the given shape.
    pub fn add_input(&mut self, guids: &mut GuidAllocator, shape: TensorShape) -> TensorId {
        let layer_id = guids.fresh_layer();
        let tensor_id = guids.fresh_tensor();
        self.producers.insert(tensor_id, (layer_id, 0));
        self.layers.push(Layer {
            id: layer_id,
            name: Some("input".to_string()),
            attrs: OperatorAttrs::Input(InputAttrs {}),
            inputs: Vec::new(),
            outputs: vec![LogicalTensor {
                id: tensor_id,
                shape,
                create_gradients: false,
            }],
        });
        tensor_id
    }

    /// Add a layer. Output shapes are inferred through the operator
    /// catalog; the first output's id is returned alongside the rest.
    pub fn add_layer(
        &mut self,
        guids: &mut GuidAllocator,
        attrs: OperatorAttrs,
        inputs: &[TensorId],
        name: Option<&str>,
    ) -> Result<SmallVec<[TensorId; 2]>> {
        let input_shapes: Vec<ParallelTensorShape> = inputs
            .iter()
            .map(|&t| Ok(ParallelTensorShape::from_logical(self.shape_of(t)?)))
            .collect::<Result<_>>()?;
        if !attrs.is_valid(&input_shapes) {
            return Err(Error::structural_in(
                "layer rejects its input shapes",
                attrs.kind().to_string(),
            ));
        }
        let signature = attrs.infer(&input_shapes)?;

        let layer_id = guids.fresh_layer();
        let mut ids: SmallVec<[TensorId; 2]> = SmallVec::new();
        let mut outputs = Vec::with_capacity(signature.outputs.len());
        for (slot, shape) in signature.outputs.iter().enumerate() {
            let tensor_id = guids.fresh_tensor();
            self.producers.insert(tensor_id, (layer_id, slot));
            ids.push(tensor_id);
            outputs.push(LogicalTensor {
                id: tensor_id,
                shape: shape.logical(),
                create_gradients: true,
            });
        }
        self.layers.push(Layer {
            id: layer_id,
            name: name.map(str::to_string),
            attrs,
            inputs: inputs.to_vec(),
            outputs,
        });
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shardflow_core::types::{Activation, DataType};
    use shardflow_ops::LinearAttrs;

    #[test]
    fn test_build_small_graph() {
        let mut guids = GuidAllocator::new();
        let mut graph = LayerGraph::new();
        let x = graph.add_input(
            &mut guids,
            TensorShape::new([64, 128], DataType::Float),
        );
        let y = graph
            .add_layer(
                &mut guids,
                OperatorAttrs::Linear(LinearAttrs {
                    out_channels: 64,
                    use_bias: true,
                    activation: Activation::Relu,
                }),
                &[x],
                Some("dense1"),
            )
            .unwrap();
        assert_eq!(graph.len(), 2);
        assert_eq!(graph.shape_of(y[0]).unwrap().dims.as_slice(), &[64, 64]);
    }

    #[test]
    fn test_rejects_unknown_tensor() {
        let mut guids = GuidAllocator::new();
        let mut graph = LayerGraph::new();
        let result = graph.add_layer(
            &mut guids,
            OperatorAttrs::Linear(LinearAttrs {
                out_channels: 8,
                use_bias: false,
                activation: Activation::None,
            }),
            &[TensorId(999)],
            None,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_rejects_invalid_layer_shape() {
        let mut guids = GuidAllocator::new();
        let mut graph = LayerGraph::new();
        let x = graph.add_input(&mut guids, TensorShape::new([8, 10], DataType::Float));
        // Softmax axis out of range.
        let result = graph.add_layer(
            &mut guids,
            OperatorAttrs::Softmax(shardflow_ops::SoftmaxAttrs { axis: 5 }),
            &[x],
            None,
        );
        assert!(result.is_err());
    }
}
