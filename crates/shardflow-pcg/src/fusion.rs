//! Greedy vertical operator fusion.
//!
//! Repeatedly merges a non-terminal operator into the latest compatible
//! earlier operator sharing its machine view, preserving every boundary
//! region identity. Each successful merge shortens the operator list by
//! exactly one; the pass repeats until no merge applies, then verifies the
//! result against the pre-fusion graph.
//!
//! Runs after region mapping: slot matching is by region handle.

use std::collections::{HashMap, HashSet};

use shardflow_core::error::{Error, Result};
use shardflow_core::tensor::TensorRef;
use shardflow_core::types::{GuidAllocator, OperatorId, RegionHandle};
use shardflow_ops::{FusedAttrs, OperatorAttrs, OperatorKind};
use tracing::{debug, info};

use crate::graph::{Operator, Pcg};

type RegionLists = (Vec<RegionHandle>, Vec<RegionHandle>, Vec<RegionHandle>);

fn region_lists(pcg: &Pcg, op: &Operator) -> Result<RegionLists> {
    let resolve = |slot: &TensorRef| -> Result<RegionHandle> {
        pcg.resolve(*slot)?.region.ok_or_else(|| {
            Error::structural_in("fusion requires mapped regions", op.kind().to_string())
        })
    };
    let inputs = op.inputs.iter().map(resolve).collect::<Result<_>>()?;
    let weights = op.weights.iter().map(resolve).collect::<Result<_>>()?;
    let outputs = op
        .outputs
        .iter()
        .map(|t| {
            t.region.ok_or_else(|| {
                Error::structural_in("fusion requires mapped regions", op.kind().to_string())
            })
        })
        .collect::<Result<_>>()?;
    Ok((inputs, weights, outputs))
}

fn fusable_candidate(op: &Operator) -> bool {
    !op.kind().is_input_or_weight()
        && !op.is_parallel_op()
        && op.kind() != OperatorKind::Fused
        && !op.inplace_output
}

/// Attempt one merge; returns the rebuilt operator list on success.
fn fuse_once(pcg: &Pcg, guids: &mut GuidAllocator) -> Result<Option<Vec<Operator>>> {
    let ops = pcg.operators();
    let terminal = pcg.final_operator().map(|op| op.id);
    for l in 1..ops.len().saturating_sub(1) {
        let opl = &ops[l];
        if Some(opl.id) == terminal {
            continue;
        }
        // A weighted operator may seed a fused group but is never folded
        // into one: each fused task carries at most one weighted kernel
        // chain, seeded first.
        if !fusable_candidate(opl) || !opl.weights.is_empty() {
            continue;
        }
        // The seed cannot precede any producer of l's inputs.
        let mut start = 0usize;
        for slot in &opl.inputs {
            let owner_pos = pcg
                .position(slot.owner)
                .ok_or_else(|| Error::structural(format!("unknown owner {}", slot.owner)))?;
            start = start.max(owner_pos);
        }
        let (l_inputs, l_weights, l_outputs) = region_lists(pcg, opl)?;

        // Latest compatible seed wins.
        for i in (start..l).rev() {
            let opi = &ops[i];
            if opi.machine_view() != opl.machine_view() {
                continue;
            }
            let extending = opi.kind() == OperatorKind::Fused;
            if !extending && !fusable_candidate(opi) {
                continue;
            }

            let mut fused_attrs = if extending {
                match &opi.attrs {
                    OperatorAttrs::Fused(attrs) => attrs.clone(),
                    _ => unreachable!("kind/attrs mismatch"),
                }
            } else {
                let (i_inputs, i_weights, i_outputs) = region_lists(pcg, opi)?;
                match FusedAttrs::seed(opi.id, opi.kind(), &i_inputs, &i_weights, &i_outputs) {
                    Ok(attrs) => attrs,
                    Err(_) => continue,
                }
            };
            if !fused_attrs.try_add(opl.id, opl.kind(), &l_inputs, &l_weights, &l_outputs) {
                continue;
            }

            let rebuilt = rebuild(pcg, guids, i, l, fused_attrs)?;
            debug!(
                seed = %ops[i].id,
                merged = %opl.id,
                "fused operator pair"
            );
            return Ok(Some(rebuilt));
        }
    }
    Ok(None)
}

/// Rebuild the operator list with `ops[l]` folded into a fused operator at
/// position `i`.
fn rebuild(
    pcg: &Pcg,
    guids: &mut GuidAllocator,
    i: usize,
    l: usize,
    fused_attrs: FusedAttrs,
) -> Result<Vec<Operator>> {
    let ops = pcg.operators();
    let opi = &ops[i];
    let opl = &ops[l];
    let extending = opi.kind() == OperatorKind::Fused;
    let fused_id = if extending {
        opi.id
    } else {
        guids.fresh_operator()
    };

    // Region -> boundary reference, drawn from both constituents.
    let mut by_region: HashMap<RegionHandle, TensorRef> = HashMap::new();
    for slot in opi
        .inputs
        .iter()
        .chain(opi.weights.iter())
        .chain(opl.inputs.iter())
        .chain(opl.weights.iter())
    {
        if let Some(region) = pcg.resolve(*slot)?.region {
            by_region.entry(region).or_insert(*slot);
        }
    }
    let boundary = |regions: &[RegionHandle]| -> Result<Vec<TensorRef>> {
        regions
            .iter()
            .map(|region| {
                by_region.get(region).copied().ok_or_else(|| {
                    Error::fusion_integrity("boundary region lost its tensor reference")
                })
            })
            .collect()
    };
    let inputs = boundary(&fused_attrs.input_regions)?;
    let weights = boundary(&fused_attrs.weight_regions)?;

    // Adopt both constituents' outputs in slot-table order.
    let mut outputs = Vec::with_capacity(opi.outputs.len() + opl.outputs.len());
    outputs.extend(opi.outputs.iter().cloned());
    outputs.extend(opl.outputs.iter().cloned());
    if outputs.len() != fused_attrs.output_regions.len() {
        return Err(Error::fusion_integrity(
            "fused output count differs from its slot table",
        ));
    }
    for (slot, tensor) in outputs.iter_mut().enumerate() {
        tensor.owner = fused_id;
        tensor.owner_slot = slot;
    }

    let needs_input_grad = inputs
        .iter()
        .map(|slot| {
            Ok(pcg
                .get(slot.owner)
                .ok_or_else(|| Error::structural(format!("unknown owner {}", slot.owner)))?
                .kind()
                != OperatorKind::Input)
        })
        .collect::<Result<Vec<bool>>>()?;

    let fused_op = Operator {
        id: fused_id,
        layer: None,
        name: opi.name.clone(),
        attrs: OperatorAttrs::Fused(fused_attrs.clone()),
        inputs,
        weights,
        outputs,
        needs_input_grad,
        inplace_output: false,
    };

    // Splice: keep [0, i), substitute the fused op, keep the rest minus l,
    // rewiring consumers of either constituent by region identity.
    let mut rebuilt: Vec<Operator> = ops[..i].to_vec();
    rebuilt.push(fused_op);
    for (j, op) in ops.iter().enumerate().skip(i + 1) {
        if j == l {
            continue;
        }
        let mut op = op.clone();
        for slot in op.inputs.iter_mut() {
            if slot.owner == opi.id || slot.owner == opl.id {
                let region = pcg.resolve(*slot)?.region.ok_or_else(|| {
                    Error::structural("fusion requires mapped regions")
                })?;
                let out_slot = fused_attrs.find_output(region).ok_or_else(|| {
                    Error::fusion_integrity("downstream input lost inside the fused operator")
                })?;
                *slot = TensorRef::new(fused_id, out_slot);
            }
        }
        rebuilt.push(op);
    }
    if rebuilt.len() + 1 != ops.len() {
        return Err(Error::fusion_integrity(
            "fusion must shrink the list by exactly one",
        ));
    }
    Ok(rebuilt)
}

/// Run fusion to a fixed point. Returns the number of merges applied.
pub fn apply_fusion(pcg: &mut Pcg, guids: &mut GuidAllocator) -> Result<usize> {
    let before = pcg.len();
    let initial_ids: HashSet<OperatorId> = pcg.operators().iter().map(|op| op.id).collect();
    let mut originals: HashMap<OperatorId, RegionLists> = HashMap::new();
    for op in pcg.operators() {
        if op.kind() != OperatorKind::Fused {
            originals.insert(op.id, region_lists(pcg, op)?);
        }
    }

    let mut merges = 0usize;
    while let Some(rebuilt) = fuse_once(pcg, guids)? {
        pcg.replace_operators(rebuilt)?;
        pcg.check_invariants()?;
        merges += 1;
    }

    // Integrity: fused slot tables still match their sub-operators'
    // regions, and every surviving plain operator predates the pass.
    for op in pcg.operators() {
        match &op.attrs {
            OperatorAttrs::Fused(attrs) => {
                let lists = attrs
                    .sub_ops
                    .iter()
                    .map(|sub| {
                        originals.get(&sub.op).cloned().ok_or_else(|| {
                            Error::fusion_integrity(format!(
                                "fused sub-operator {} has no pre-fusion record",
                                sub.op
                            ))
                        })
                    })
                    .collect::<Result<Vec<_>>>()?;
                attrs.check_integrity(&lists)?;
            }
            _ => {
                if !initial_ids.contains(&op.id) {
                    return Err(Error::fusion_integrity(format!(
                        "operator {} appeared from nowhere during fusion",
                        op.id
                    )));
                }
            }
        }
    }

    info!(before, after = pcg.len(), merges, "fusion pass complete");
    Ok(merges)
}

#[cfg(test)]
mod tests {
    use super::*;
    use shardflow_core::machine::MachineView;
    use shardflow_core::tensor::{ParallelTensor, ParallelTensorShape};
    use shardflow_core::types::{Activation, DataType, GuidAllocator, RegionHandle};
    use shardflow_ops::{
        DropoutAttrs, ElementUnaryAttrs, InputAttrs, LinearAttrs, SoftmaxAttrs, WeightAttrs,
    };

    struct ChainBuilder {
        pcg: Pcg,
        next_region: u64,
        view: MachineView,
        shape: ParallelTensorShape,
    }

    impl ChainBuilder {
        fn new() -> Self {
            let mut shape = ParallelTensorShape::from_sizes(&[8, 16], DataType::Float);
            shape.push_replica_dim();
            Self {
                pcg: Pcg::new(),
                next_region: 0,
                view: MachineView::new([2, 1, 1]),
                shape,
            }
        }

        fn fresh_region(&mut self) -> RegionHandle {
            self.next_region += 1;
            RegionHandle(self.next_region)
        }

        fn mapped_tensor(
            &mut self,
            guids: &mut GuidAllocator,
            owner: shardflow_core::types::OperatorId,
            slot: usize,
        ) -> ParallelTensor {
            let region = self.fresh_region();
            let mut t = ParallelTensor::new(
                guids.fresh_parallel_tensor(),
                self.shape.clone(),
                owner,
                slot,
                true,
            );
            t.machine_view = self.view.clone();
            t.region = Some(region);
            t
        }

        fn push_input(&mut self, guids: &mut GuidAllocator) -> TensorRef {
            let id = guids.fresh_operator();
            let tensor = self.mapped_tensor(guids, id, 0);
            self.pcg
                .push(Operator {
                    id,
                    layer: None,
                    name: None,
                    attrs: OperatorAttrs::Input(InputAttrs {}),
                    inputs: vec![],
                    weights: vec![],
                    outputs: vec![tensor],
                    needs_input_grad: vec![],
                    inplace_output: false,
                })
                .unwrap();
            TensorRef::new(id, 0)
        }

        fn push_op(
            &mut self,
            guids: &mut GuidAllocator,
            attrs: OperatorAttrs,
            prev: TensorRef,
            with_weight: bool,
        ) -> TensorRef {
            let mut weights = Vec::new();
            if with_weight {
                let weight_id = guids.fresh_operator();
                let tensor = self.mapped_tensor(guids, weight_id, 0);
                self.pcg
                    .push(Operator {
                        id: weight_id,
                        layer: None,
                        name: None,
                        attrs: OperatorAttrs::Weight(WeightAttrs {}),
                        inputs: vec![],
                        weights: vec![],
                        outputs: vec![tensor],
                        needs_input_grad: vec![],
                        inplace_output: false,
                    })
                    .unwrap();
                weights.push(TensorRef::new(weight_id, 0));
            }
            let id = guids.fresh_operator();
            let out = self.mapped_tensor(guids, id, 0);
            self.pcg
                .push(Operator {
                    id,
                    layer: None,
                    name: None,
                    attrs,
                    inputs: vec![prev],
                    weights,
                    outputs: vec![out],
                    needs_input_grad: vec![true],
                    inplace_output: false,
                })
                .unwrap();
            TensorRef::new(id, 0)
        }
    }

    /// Hand-assemble a mapped PCG: input -> linear -> relu -> dropout ->
    /// linear -> softmax, all on one machine view.
    fn mapped_chain(guids: &mut GuidAllocator) -> Pcg {
        let mut builder = ChainBuilder::new();
        let linear = OperatorAttrs::Linear(LinearAttrs {
            out_channels: 16,
            use_bias: false,
            activation: Activation::None,
        });
        let mut prev = builder.push_input(guids);
        prev = builder.push_op(guids, linear.clone(), prev, true);
        prev = builder.push_op(
            guids,
            OperatorAttrs::ElementUnary(ElementUnaryAttrs::new(OperatorKind::Relu)),
            prev,
            false,
        );
        prev = builder.push_op(
            guids,
            OperatorAttrs::Dropout(DropoutAttrs { rate: 0.1, seed: 7 }),
            prev,
            false,
        );
        prev = builder.push_op(guids, linear, prev, true);
        builder.push_op(
            guids,
            OperatorAttrs::Softmax(SoftmaxAttrs { axis: 1 }),
            prev,
            false,
        );
        builder.pcg
    }

    #[test]
    fn test_fusion_collapses_elementwise_chain() {
        let mut guids = GuidAllocator::new();
        let mut pcg = mapped_chain(&mut guids);
        let before = pcg.len();

        let boundary_before: HashSet<RegionHandle> = pcg
            .operators()
            .iter()
            .flat_map(|op| op.outputs.iter().filter_map(|t| t.region))
            .collect();

        let merges = apply_fusion(&mut pcg, &mut guids).unwrap();
        // relu and dropout fold into the first linear.
        assert_eq!(merges, 2);
        assert_eq!(pcg.len(), before - 2);

        let fused = pcg
            .operators()
            .iter()
            .find(|op| op.kind() == OperatorKind::Fused)
            .expect("a fused operator exists");
        match &fused.attrs {
            OperatorAttrs::Fused(attrs) => {
                assert_eq!(attrs.num_sub_ops(), 3);
                let kinds: Vec<OperatorKind> =
                    attrs.sub_ops.iter().map(|s| s.kind).collect();
                assert_eq!(
                    kinds,
                    vec![OperatorKind::Linear, OperatorKind::Relu, OperatorKind::Dropout]
                );
            }
            _ => unreachable!(),
        }

        // Region identities on the graph boundary are preserved.
        let boundary_after: HashSet<RegionHandle> = pcg
            .operators()
            .iter()
            .flat_map(|op| op.outputs.iter().filter_map(|t| t.region))
            .collect();
        assert_eq!(boundary_before, boundary_after);
        assert!(pcg.check_invariants().is_ok());
    }

    #[test]
    fn test_fusion_skips_inplace_and_terminal() {
        let mut guids = GuidAllocator::new();
        let mut pcg = mapped_chain(&mut guids);
        // Mark the relu in-place: fusion must leave it alone, and the
        // dropout behind it then has no reachable seed.
        let relu_id = pcg
            .operators()
            .iter()
            .find(|op| op.kind() == OperatorKind::Relu)
            .unwrap()
            .id;
        pcg.get_mut(relu_id).unwrap().inplace_output = true;

        let merges = apply_fusion(&mut pcg, &mut guids).unwrap();
        assert_eq!(merges, 0);
        assert!(pcg
            .operators()
            .iter()
            .any(|op| op.kind() == OperatorKind::Relu));
        assert!(pcg
            .operators()
            .iter()
            .any(|op| op.kind() == OperatorKind::Dropout));
        // The terminal softmax is never merged.
        assert!(pcg
            .operators()
            .iter()
            .any(|op| op.kind() == OperatorKind::Softmax));
    }
}
