//! In-place output marking.
//!
//! An operator may compute in place when its output shares a machine view
//! with its first input and no other operator reads that input. Marked
//! operators are skipped by the fusion pass. Runs after lifting, before
//! fusion.

use shardflow_core::types::OperatorId;
use tracing::debug;

use crate::graph::Pcg;

/// Mark eligible operators in place. Returns how many were marked.
pub fn mark_inplace_operators(pcg: &mut Pcg) -> usize {
    let mut eligible: Vec<OperatorId> = Vec::new();
    let ops = pcg.operators();
    for (l, op) in ops.iter().enumerate().skip(1) {
        if !op.can_inplace_output() {
            continue;
        }
        let Some(&input) = op.inputs.first() else {
            continue;
        };
        let Ok(source) = pcg.resolve(input) else {
            continue;
        };
        if op.outputs[0].machine_view != source.machine_view {
            continue;
        }
        // Another reader of the same tensor forbids aliasing it.
        let contested = ops.iter().enumerate().any(|(i, other)| {
            i != l && other.inputs.iter().any(|slot| *slot == input)
        });
        if !contested {
            eligible.push(op.id);
        }
    }
    let marked = eligible.len();
    for id in eligible {
        if let Some(op) = pcg.get_mut(id) {
            op.inplace_output = true;
            debug!(op = %id, "marked operator in-place");
        }
    }
    marked
}
