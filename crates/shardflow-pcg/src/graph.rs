//! The parallel computation graph: operators over parallel tensors.
//!
//! Operators own their output tensors exclusively; inputs and weights are
//! weak references resolved through the graph's operator table, so the
//! producer/consumer cycle never turns into shared ownership.

use std::collections::HashMap;

use shardflow_core::error::{Error, Result};
use shardflow_core::machine::MachineView;
use shardflow_core::tensor::{ParallelTensor, TensorRef};
use shardflow_core::types::{LayerId, OperatorId};
use shardflow_ops::{OperatorAttrs, OperatorKind};

/// An operator in the parallel computation graph.
#[derive(Debug, Clone)]
pub struct Operator {
    /// Globally unique id
    pub id: OperatorId,
    /// Originating layer, if lifted from one
    pub layer: Option<LayerId>,
    /// Optional user-facing name
    pub name: Option<String>,
    /// Kind-specific attributes
    pub attrs: OperatorAttrs,
    /// Input slots, each owned by an earlier operator
    pub inputs: Vec<TensorRef>,
    /// Weight slots, each owned by a weight anchor operator
    pub weights: Vec<TensorRef>,
    /// Output tensors, owned exclusively by this operator
    pub outputs: Vec<ParallelTensor>,
    /// Per-input gradient requirement
    pub needs_input_grad: Vec<bool>,
    /// Whether the output aliases the first input's storage
    pub inplace_output: bool,
}

impl Operator {
    /// The kind tag.
    pub fn kind(&self) -> OperatorKind {
        self.attrs.kind()
    }

    /// Whether this is a pure data-movement operator.
    pub fn is_parallel_op(&self) -> bool {
        self.kind().is_parallel_op()
    }

    /// The machine view of the primary output.
    pub fn machine_view(&self) -> MachineView {
        self.outputs
            .first()
            .map(|t| t.machine_view.clone())
            .unwrap_or_else(|| MachineView::trivial(1))
    }

    /// Whether the operator may compute its single output in place over
    /// its first input.
    pub fn can_inplace_output(&self) -> bool {
        self.kind().is_elementwise_unary() && self.outputs.len() == 1
    }
}

/// The parallel computation graph: operators in topological order.
#[derive(Debug, Default, Clone)]
pub struct Pcg {
    operators: Vec<Operator>,
    index: HashMap<OperatorId, usize>,
}

impl Pcg {
    /// Create an empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an operator. Every input and weight must reference an
    /// operator already present.
    pub fn push(&mut self, op: Operator) -> Result<()> {
        for slot in op.inputs.iter().chain(op.weights.iter()) {
            let Some(&owner_pos) = self.index.get(&slot.owner) else {
                return Err(Error::structural_in(
                    format!("slot references unknown operator {}", slot.owner),
                    op.kind().to_string(),
                ));
            };
            if self.operators[owner_pos].outputs.len() <= slot.slot {
                return Err(Error::structural_in(
                    format!("slot {} out of range for {}", slot.slot, slot.owner),
                    op.kind().to_string(),
                ));
            }
        }
        if self.index.contains_key(&op.id) {
            return Err(Error::structural(format!("duplicate operator id {}", op.id)));
        }
        self.index.insert(op.id, self.operators.len());
        self.operators.push(op);
        Ok(())
    }

    /// The operators in topological order.
    pub fn operators(&self) -> &[Operator] {
        &self.operators
    }

    /// Number of operators.
    pub fn len(&self) -> usize {
        self.operators.len()
    }

    /// Whether the graph is empty.
    pub fn is_empty(&self) -> bool {
        self.operators.is_empty()
    }

    /// Look up an operator by id.
    pub fn get(&self, id: OperatorId) -> Option<&Operator> {
        self.index.get(&id).map(|&pos| &self.operators[pos])
    }

    /// Mutable lookup by id.
    pub fn get_mut(&mut self, id: OperatorId) -> Option<&mut Operator> {
        let pos = *self.index.get(&id)?;
        Some(&mut self.operators[pos])
    }

    /// Position of an operator in the topological order.
    pub fn position(&self, id: OperatorId) -> Option<usize> {
        self.index.get(&id).copied()
    }

    /// Iterate operators mutably, preserving order.
    pub fn operators_mut(&mut self) -> impl Iterator<Item = &mut Operator> {
        self.operators.iter_mut()
    }

    /// Resolve a tensor reference to the owned tensor.
    pub fn resolve(&self, slot: TensorRef) -> Result<&ParallelTensor> {
        let op = self
            .get(slot.owner)
            .ok_or_else(|| Error::structural(format!("unknown operator {}", slot.owner)))?;
        op.outputs
            .get(slot.slot)
            .ok_or_else(|| Error::structural(format!("slot {} out of range for {}", slot.slot, slot.owner)))
    }

    /// The terminal (loss-adjacent) operator: the last operator that is
    /// not an input or weight anchor.
    pub fn final_operator(&self) -> Option<&Operator> {
        self.operators
            .iter()
            .rev()
            .find(|op| !op.kind().is_input_or_weight())
    }

    /// Replace the operator list wholesale (used by the fusion pass) and
    /// rebuild the id index. The new list must still be reference-closed.
    pub fn replace_operators(&mut self, operators: Vec<Operator>) -> Result<()> {
        let mut rebuilt = Pcg::new();
        for op in operators {
            rebuilt.push(op)?;
        }
        *self = rebuilt;
        Ok(())
    }

    /// Consumers of each operator's outputs, with the referenced tensor's
    /// volume on each edge. Used by the propagation rewrite.
    pub fn backward_edge_map(&self) -> HashMap<OperatorId, Vec<(OperatorId, usize)>> {
        let mut map: HashMap<OperatorId, Vec<(OperatorId, usize)>> = HashMap::new();
        for op in &self.operators {
            for slot in &op.inputs {
                let volume = self
                    .resolve(*slot)
                    .map(|t| t.volume())
                    .unwrap_or_default();
                map.entry(slot.owner).or_default().push((op.id, volume));
            }
        }
        map
    }

    /// Check the graph invariants:
    ///
    /// - every input's owner appears strictly before the consumer;
    /// - every output records its owner and slot position correctly.
    pub fn check_invariants(&self) -> Result<()> {
        for (pos, op) in self.operators.iter().enumerate() {
            for slot in op.inputs.iter().chain(op.weights.iter()) {
                match self.position(slot.owner) {
                    Some(owner_pos) if owner_pos < pos => {}
                    Some(_) => {
                        return Err(Error::structural_in(
                            format!("operator {} consumes a later operator's output", op.id),
                            op.kind().to_string(),
                        ))
                    }
                    None => {
                        return Err(Error::structural_in(
                            format!("operator {} references unknown owner {}", op.id, slot.owner),
                            op.kind().to_string(),
                        ))
                    }
                }
            }
            for (slot, tensor) in op.outputs.iter().enumerate() {
                if tensor.owner != op.id || tensor.owner_slot != slot {
                    return Err(Error::structural_in(
                        format!("tensor {} has stale ownership metadata", tensor.id),
                        op.kind().to_string(),
                    ));
                }
            }
        }
        Ok(())
    }
}
