//! Fused-operator slot bookkeeping.
//!
//! A fused operator executes several sub-operators in one task invocation.
//! Its boundary slots are identified by region handle: each sub-operator
//! input is tagged with where it comes from (a fused input, an earlier
//! sub-operator's output, or a fused weight), so the runtime can wire one
//! launch for the whole group and rewrites can check that no region
//! identity was lost.

use serde::{Deserialize, Serialize};
use shardflow_core::error::{Error, Result};
use shardflow_core::types::{OperatorId, RegionHandle};

use crate::kind::OperatorKind;

/// Maximum sub-operators per fused operator.
pub const MAX_FUSED_OPERATORS: usize = 32;
/// Maximum boundary inputs per fused operator.
pub const MAX_FUSED_INPUTS: usize = 16;
/// Maximum weights per fused operator.
pub const MAX_FUSED_WEIGHTS: usize = 16;
/// Maximum outputs per fused operator.
pub const MAX_FUSED_OUTPUTS: usize = 16;

/// Where a sub-operator slot draws its tensor from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotSource {
    /// A boundary input of the fused operator
    Input,
    /// An output of an earlier sub-operator
    Output,
    /// A weight of the fused operator
    Weight,
}

/// Slot assignment of one sub-operator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubOpSlots {
    /// Original operator id
    pub op: OperatorId,
    /// Original operator kind
    pub kind: OperatorKind,
    /// Per input: source tag and index into the fused slot table
    pub inputs: Vec<(SlotSource, usize)>,
    /// Per weight: index into the fused weight table
    pub weights: Vec<usize>,
    /// Per output: index into the fused output table
    pub outputs: Vec<usize>,
}

/// Boundary slot tables of a fused operator, keyed by region identity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FusedAttrs {
    /// Regions exposed as fused inputs
    pub input_regions: Vec<RegionHandle>,
    /// Regions exposed as fused weights
    pub weight_regions: Vec<RegionHandle>,
    /// Regions exposed as fused outputs
    pub output_regions: Vec<RegionHandle>,
    /// Sub-operator slot assignments, in execution order
    pub sub_ops: Vec<SubOpSlots>,
}

impl FusedAttrs {
    /// Seed a fused operator from its first sub-operator. Fails if the
    /// kind is not fusable.
    pub fn seed(
        op: OperatorId,
        kind: OperatorKind,
        inputs: &[RegionHandle],
        weights: &[RegionHandle],
        outputs: &[RegionHandle],
    ) -> Result<Self> {
        if kind.is_input_or_weight() || kind.is_parallel_op() || kind == OperatorKind::Fused {
            return Err(Error::structural_in(
                "operator kind cannot seed a fused operator",
                kind.to_string(),
            ));
        }
        let mut fused = Self::default();
        if !fused.try_add(op, kind, inputs, weights, outputs) {
            return Err(Error::structural_in(
                "seed operator exceeds fused slot capacity",
                kind.to_string(),
            ));
        }
        Ok(fused)
    }

    /// Number of sub-operators.
    pub fn num_sub_ops(&self) -> usize {
        self.sub_ops.len()
    }

    /// Index of the fused output exposing `region`, if any.
    pub fn find_output(&self, region: RegionHandle) -> Option<usize> {
        self.output_regions.iter().position(|&r| r == region)
    }

    /// Incorporate another sub-operator. Inputs resolve against existing
    /// outputs first (producer inside the group), then existing inputs,
    /// then claim a new input slot. Returns `false` without mutating when
    /// any capacity bound would be exceeded.
    pub fn try_add(
        &mut self,
        op: OperatorId,
        kind: OperatorKind,
        inputs: &[RegionHandle],
        weights: &[RegionHandle],
        outputs: &[RegionHandle],
    ) -> bool {
        if self.sub_ops.len() >= MAX_FUSED_OPERATORS {
            return false;
        }
        let mut new_inputs = 0usize;
        for region in inputs {
            let known = self.output_regions.contains(region)
                || self.input_regions.contains(region);
            if !known {
                new_inputs += 1;
            }
        }
        let mut new_weights = 0usize;
        for region in weights {
            if !self.weight_regions.contains(region) {
                new_weights += 1;
            }
        }
        if self.input_regions.len() + new_inputs > MAX_FUSED_INPUTS
            || self.weight_regions.len() + new_weights > MAX_FUSED_WEIGHTS
            || self.output_regions.len() + outputs.len() > MAX_FUSED_OUTPUTS
        {
            return false;
        }

        let mut slots = SubOpSlots {
            op,
            kind,
            inputs: Vec::with_capacity(inputs.len()),
            weights: Vec::with_capacity(weights.len()),
            outputs: Vec::with_capacity(outputs.len()),
        };
        for region in inputs {
            if let Some(idx) = self.find_output(*region) {
                slots.inputs.push((SlotSource::Output, idx));
            } else if let Some(idx) = self.input_regions.iter().position(|r| r == region) {
                slots.inputs.push((SlotSource::Input, idx));
            } else {
                self.input_regions.push(*region);
                slots.inputs.push((SlotSource::Input, self.input_regions.len() - 1));
            }
        }
        for region in weights {
            let idx = match self.weight_regions.iter().position(|r| r == region) {
                Some(idx) => idx,
                None => {
                    self.weight_regions.push(*region);
                    self.weight_regions.len() - 1
                }
            };
            slots.weights.push(idx);
        }
        for region in outputs {
            self.output_regions.push(*region);
            slots.outputs.push(self.output_regions.len() - 1);
        }
        self.sub_ops.push(slots);
        true
    }

    /// Verify that every sub-operator slot still points at the region it
    /// was assigned, given each sub-operator's original region lists.
    pub fn check_integrity(
        &self,
        originals: &[(Vec<RegionHandle>, Vec<RegionHandle>, Vec<RegionHandle>)],
    ) -> Result<()> {
        if originals.len() != self.sub_ops.len() {
            return Err(Error::fusion_integrity(format!(
                "expected {} sub-operators, found {}",
                self.sub_ops.len(),
                originals.len()
            )));
        }
        for (slots, (inputs, weights, outputs)) in self.sub_ops.iter().zip(originals) {
            for ((source, idx), region) in slots.inputs.iter().zip(inputs) {
                let table = match source {
                    SlotSource::Input => &self.input_regions,
                    SlotSource::Output => &self.output_regions,
                    SlotSource::Weight => {
                        return Err(Error::fusion_integrity(
                            "input slot tagged as weight source",
                        ))
                    }
                };
                if table.get(*idx) != Some(region) {
                    return Err(Error::fusion_integrity(format!(
                        "input slot of {} drifted from its region",
                        slots.op
                    )));
                }
            }
            for (idx, region) in slots.weights.iter().zip(weights) {
                if self.weight_regions.get(*idx) != Some(region) {
                    return Err(Error::fusion_integrity(format!(
                        "weight slot of {} drifted from its region",
                        slots.op
                    )));
                }
            }
            for (idx, region) in slots.outputs.iter().zip(outputs) {
                if self.output_regions.get(*idx) != Some(region) {
                    return Err(Error::fusion_integrity(format!(
                        "output slot of {} drifted from its region",
                        slots.op
                    )));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn r(id: u64) -> RegionHandle {
        RegionHandle(id)
    }

    #[test]
    fn test_seed_and_chain() {
        // linear(r0; weight r10) -> r1, then relu(r1) -> r2.
        let mut fused = FusedAttrs::seed(
            OperatorId(1),
            OperatorKind::Linear,
            &[r(0)],
            &[r(10)],
            &[r(1)],
        )
        .unwrap();
        assert!(fused.try_add(OperatorId(2), OperatorKind::Relu, &[r(1)], &[], &[r(2)]));

        assert_eq!(fused.input_regions, vec![r(0)]);
        assert_eq!(fused.weight_regions, vec![r(10)]);
        assert_eq!(fused.output_regions, vec![r(1), r(2)]);
        // The relu input resolves to the linear output slot.
        assert_eq!(fused.sub_ops[1].inputs, vec![(SlotSource::Output, 0)]);
    }

    #[test]
    fn test_seed_rejects_parallel_op() {
        let err = FusedAttrs::seed(
            OperatorId(1),
            OperatorKind::Repartition,
            &[r(0)],
            &[],
            &[r(1)],
        );
        assert!(err.is_err());
    }

    #[test]
    fn test_capacity_refusal_leaves_state_untouched() {
        let mut fused = FusedAttrs::seed(
            OperatorId(1),
            OperatorKind::Linear,
            &[r(0)],
            &[],
            &[r(1)],
        )
        .unwrap();
        let many: Vec<RegionHandle> = (100..100 + MAX_FUSED_INPUTS as u64 + 1).map(r).collect();
        let before = fused.clone();
        assert!(!fused.try_add(OperatorId(2), OperatorKind::Concat, &many, &[], &[r(2)]));
        assert_eq!(fused, before);
    }

    #[test]
    fn test_integrity_check() {
        let mut fused = FusedAttrs::seed(
            OperatorId(1),
            OperatorKind::Linear,
            &[r(0)],
            &[r(10)],
            &[r(1)],
        )
        .unwrap();
        fused.try_add(OperatorId(2), OperatorKind::Relu, &[r(1)], &[], &[r(2)]);

        let originals = vec![
            (vec![r(0)], vec![r(10)], vec![r(1)]),
            (vec![r(1)], vec![], vec![r(2)]),
        ];
        assert!(fused.check_integrity(&originals).is_ok());

        let drifted = vec![
            (vec![r(0)], vec![r(10)], vec![r(1)]),
            (vec![r(99)], vec![], vec![r(2)]),
        ];
        assert!(fused.check_integrity(&drifted).is_err());
    }
}
