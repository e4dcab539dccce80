//! Lifting the logical layer graph into a parallel computation graph.
//!
//! The lifter walks the layer graph in order, maps every logical tensor to
//! a parallel tensor, and realizes each layer as an operator with inferred
//! output and weight shapes. Inputs gain a trailing replica dimension; in
//! only-data-parallel mode a repartition operator splits the batch
//! dimension across all workers.

use std::collections::HashMap;

use shardflow_core::config::Config;
use shardflow_core::error::{Error, Result};
use shardflow_core::tensor::{ParallelTensor, ParallelTensorShape, TensorRef};
use shardflow_core::types::{GuidAllocator, InitializerKind, ParamSync, TensorId};
use shardflow_ops::{OperatorAttrs, OperatorKind, RepartitionAttrs, WeightAttrs};
use tracing::{debug, info};

use crate::graph::{Operator, Pcg};
use crate::layer::LayerGraph;

/// Sync mode given to every lifted weight tensor.
const WEIGHT_SYNC: ParamSync = ParamSync::Collective;

fn default_initializer(shape: &ParallelTensorShape) -> InitializerKind {
    // Rank-1 weights are biases and norm gains; start them at zero.
    if shape.rank() <= 1 {
        InitializerKind::Zero
    } else {
        InitializerKind::GlorotUniform { seed: 0 }
    }
}

/// Lift `layers` into a PCG with a pure data-parallel starting layout.
pub fn lift(layers: &LayerGraph, config: &Config, guids: &mut GuidAllocator) -> Result<Pcg> {
    let mut pcg = Pcg::new();
    let mut lifted: HashMap<TensorId, TensorRef> = HashMap::new();
    let workers = config.total_workers().max(1);

    for layer in layers.layers() {
        match layer.attrs.kind() {
            OperatorKind::Input => {
                let tensor = &layer.outputs[0];
                let mut shape = ParallelTensorShape::from_logical(&tensor.shape);
                shape.push_replica_dim();

                let input_id = guids.fresh_operator();
                let parallel = ParallelTensor::new(
                    guids.fresh_parallel_tensor(),
                    shape,
                    input_id,
                    0,
                    true,
                );
                pcg.push(Operator {
                    id: input_id,
                    layer: Some(layer.id),
                    name: layer.name.clone(),
                    attrs: layer.attrs.clone(),
                    inputs: Vec::new(),
                    weights: Vec::new(),
                    outputs: vec![parallel],
                    needs_input_grad: Vec::new(),
                    inplace_output: false,
                })?;
                let mut source = TensorRef::new(input_id, 0);

                if config.only_data_parallel {
                    // Start every input from a batch split over all workers.
                    let attrs = RepartitionAttrs {
                        dim: 0,
                        degree: workers,
                    };
                    let input_shape = pcg.resolve(source)?.shape.clone();
                    let split = attrs.output_shapes(std::slice::from_ref(&input_shape))?;
                    let part_id = guids.fresh_operator();
                    let outputs = split
                        .into_iter()
                        .map(|shape| {
                            ParallelTensor::new(
                                guids.fresh_parallel_tensor(),
                                shape,
                                part_id,
                                0,
                                true,
                            )
                        })
                        .collect();
                    pcg.push(Operator {
                        id: part_id,
                        layer: Some(layer.id),
                        name: None,
                        attrs: OperatorAttrs::Repartition(attrs),
                        inputs: vec![source],
                        weights: Vec::new(),
                        outputs,
                        needs_input_grad: vec![true],
                        inplace_output: false,
                    })?;
                    source = TensorRef::new(part_id, 0);
                }
                lifted.insert(tensor.id, source);
            }
            _ => {
                let inputs: Vec<TensorRef> = layer
                    .inputs
                    .iter()
                    .map(|t| {
                        lifted.get(t).copied().ok_or_else(|| {
                            Error::structural_in(
                                format!("layer input {t:?} was never lifted"),
                                layer.attrs.kind().to_string(),
                            )
                        })
                    })
                    .collect::<Result<_>>()?;
                let input_shapes: Vec<ParallelTensorShape> = inputs
                    .iter()
                    .map(|&r| Ok(pcg.resolve(r)?.shape.clone()))
                    .collect::<Result<_>>()?;
                if !layer.attrs.is_valid(&input_shapes) {
                    return Err(Error::structural_in(
                        "operator rejects its lifted input shapes",
                        layer.attrs.kind().to_string(),
                    ));
                }
                let signature = layer.attrs.infer(&input_shapes)?;

                // Each weight lives on its own anchor operator so that
                // ownership stays unique and the communicator cache can key
                // on weight machine views.
                let op_id = guids.fresh_operator();
                let mut weights = Vec::with_capacity(signature.weights.len());
                for shape in signature.weights {
                    let initializer = default_initializer(&shape);
                    let anchor_id = guids.fresh_operator();
                    let tensor = ParallelTensor::new(
                        guids.fresh_parallel_tensor(),
                        shape,
                        anchor_id,
                        0,
                        true,
                    )
                    .into_weight(initializer, WEIGHT_SYNC);
                    pcg.push(Operator {
                        id: anchor_id,
                        layer: Some(layer.id),
                        name: None,
                        attrs: OperatorAttrs::Weight(WeightAttrs {}),
                        inputs: Vec::new(),
                        weights: Vec::new(),
                        outputs: vec![tensor],
                        needs_input_grad: Vec::new(),
                        inplace_output: false,
                    })?;
                    weights.push(TensorRef::new(anchor_id, 0));
                }

                let outputs: Vec<ParallelTensor> = signature
                    .outputs
                    .into_iter()
                    .enumerate()
                    .map(|(slot, shape)| {
                        ParallelTensor::new(
                            guids.fresh_parallel_tensor(),
                            shape,
                            op_id,
                            slot,
                            true,
                        )
                    })
                    .collect();
                if outputs.len() != layer.outputs.len() {
                    return Err(Error::structural_in(
                        "lifted output arity differs from the layer",
                        layer.attrs.kind().to_string(),
                    ));
                }
                for (logical, parallel) in layer.outputs.iter().zip(outputs.iter()) {
                    if parallel.shape.logical() != logical.shape {
                        return Err(Error::shape_mismatch(
                            "lifted output shape differs from the layer",
                            logical.shape.dims.to_vec(),
                            parallel.shape.logical().dims.to_vec(),
                        ));
                    }
                }
                let needs_input_grad = vec![true; inputs.len()];
                pcg.push(Operator {
                    id: op_id,
                    layer: Some(layer.id),
                    name: layer.name.clone(),
                    attrs: layer.attrs.clone(),
                    inputs,
                    weights,
                    outputs,
                    needs_input_grad,
                    inplace_output: false,
                })?;
                for (slot, tensor) in layer.outputs.iter().enumerate() {
                    lifted.insert(tensor.id, TensorRef::new(op_id, slot));
                }
                debug!(kind = %layer.attrs.kind(), "lifted layer");
            }
        }
    }

    demote_input_gradients(&mut pcg);
    pcg.check_invariants()?;
    info!(
        layers = layers.len(),
        operators = pcg.len(),
        "lifted layer graph into PCG"
    );
    Ok(pcg)
}

/// Inputs fed by training data need no gradient.
fn demote_input_gradients(pcg: &mut Pcg) {
    let input_owned: Vec<shardflow_core::types::OperatorId> = pcg
        .operators()
        .iter()
        .filter(|op| op.kind() == OperatorKind::Input)
        .map(|op| op.id)
        .collect();
    for op in pcg.operators_mut() {
        for (slot, input) in op.inputs.clone().iter().enumerate() {
            if input_owned.contains(&input.owner) {
                if let Some(flag) = op.needs_input_grad.get_mut(slot) {
                    *flag = false;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shardflow_core::tensor::TensorShape;
    use shardflow_core::types::{Activation, DataType};
    use shardflow_ops::LinearAttrs;

    fn linear_graph(guids: &mut GuidAllocator) -> LayerGraph {
        let mut graph = LayerGraph::new();
        let x = graph.add_input(guids, TensorShape::new([64, 128], DataType::Float));
        graph
            .add_layer(
                guids,
                OperatorAttrs::Linear(LinearAttrs {
                    out_channels: 64,
                    use_bias: true,
                    activation: Activation::Relu,
                }),
                &[x],
                Some("dense1"),
            )
            .unwrap();
        graph
    }

    #[test]
    fn test_lift_single_linear_data_parallel() {
        let mut guids = GuidAllocator::new();
        let graph = linear_graph(&mut guids);
        let mut config = Config::with_machine(1, 4);
        config.only_data_parallel = true;

        let pcg = lift(&graph, &config, &mut guids).unwrap();
        let kinds: Vec<OperatorKind> = pcg.operators().iter().map(|op| op.kind()).collect();
        assert_eq!(
            kinds,
            vec![
                OperatorKind::Input,
                OperatorKind::Repartition,
                OperatorKind::Weight,
                OperatorKind::Weight,
                OperatorKind::Linear,
            ]
        );

        // The repartition splits the batch dimension four ways.
        let part = &pcg.operators()[1];
        match &part.attrs {
            OperatorAttrs::Repartition(attrs) => {
                assert_eq!(attrs.dim, 0);
                assert_eq!(attrs.degree, 4);
            }
            other => panic!("unexpected attrs {other:?}"),
        }

        // Linear output is [64, 64] with the batch split inherited.
        let linear = pcg.final_operator().unwrap();
        assert_eq!(linear.kind(), OperatorKind::Linear);
        let out = &linear.outputs[0];
        assert_eq!(out.shape.logical().dims.as_slice(), &[64, 64]);
        assert_eq!(out.shape.dims[0].degree, 4);
        assert!(pcg.check_invariants().is_ok());
    }

    #[test]
    fn test_lift_without_data_parallel_flag() {
        let mut guids = GuidAllocator::new();
        let graph = linear_graph(&mut guids);
        let config = Config::with_machine(1, 4);

        let pcg = lift(&graph, &config, &mut guids).unwrap();
        // No repartition inserted.
        assert!(pcg
            .operators()
            .iter()
            .all(|op| op.kind() != OperatorKind::Repartition));
    }

    #[test]
    fn test_lift_demotes_input_gradients() {
        let mut guids = GuidAllocator::new();
        let graph = linear_graph(&mut guids);
        let config = Config::with_machine(1, 2);

        let pcg = lift(&graph, &config, &mut guids).unwrap();
        let linear = pcg.final_operator().unwrap();
        assert_eq!(linear.needs_input_grad, vec![false]);
    }

    #[test]
    fn test_lift_output_shape_matches_layer() {
        let mut guids = GuidAllocator::new();
        let graph = linear_graph(&mut guids);
        let config = Config::with_machine(1, 2);
        let pcg = lift(&graph, &config, &mut guids).unwrap();

        for (layer, op) in graph
            .layers()
            .iter()
            .filter(|l| l.attrs.kind() != OperatorKind::Input)
            .zip(
                pcg.operators()
                    .iter()
                    .filter(|op| !op.kind().is_input_or_weight() && !op.is_parallel_op()),
            )
        {
            for (logical, parallel) in layer.outputs.iter().zip(op.outputs.iter()) {
                assert_eq!(parallel.shape.logical(), logical.shape);
            }
        }
    }
}
