//! Serialization of the optimized PCG for hand-off to the task runtime.
//!
//! Little-endian framing: a magic tag and version, then one record per
//! operator carrying its kind tag, its attribute record, its input
//! references (owner id plus slot), and the chosen machine view. The
//! encoding is binary-stable within a build; there is no cross-version
//! compatibility requirement.

use byteorder::{LittleEndian, WriteBytesExt};
use shardflow_core::error::{Error, Result};
use shardflow_pcg::Pcg;

/// Magic tag at the head of a serialized graph.
pub const GRAPH_MAGIC: &[u8; 4] = b"SFPC";
/// Format version within this build.
pub const GRAPH_VERSION: u32 = 1;

/// Encode the optimized graph into a byte buffer.
pub fn serialize_pcg(pcg: &Pcg) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    buf.extend_from_slice(GRAPH_MAGIC);
    write_u32(&mut buf, GRAPH_VERSION)?;
    write_u32(&mut buf, pcg.len() as u32)?;

    for op in pcg.operators() {
        write_u64(&mut buf, op.id.0)?;
        write_u32(&mut buf, op.kind().tag())?;

        // Attribute records serialize through their kind-tagged form.
        let attrs = serde_json::to_vec(&op.attrs)
            .map_err(|e| Error::structural(format!("unencodable attributes: {e}")))?;
        write_u32(&mut buf, attrs.len() as u32)?;
        buf.extend_from_slice(&attrs);

        write_u32(&mut buf, op.inputs.len() as u32)?;
        for input in &op.inputs {
            write_u64(&mut buf, input.owner.0)?;
            write_u32(&mut buf, input.slot as u32)?;
        }
        write_u32(&mut buf, op.weights.len() as u32)?;
        for weight in &op.weights {
            write_u64(&mut buf, weight.owner.0)?;
            write_u32(&mut buf, weight.slot as u32)?;
        }

        let view = op.machine_view();
        write_u32(&mut buf, view.ndims() as u32)?;
        for &dim in view.dims() {
            write_u64(&mut buf, dim as u64)?;
        }
    }
    Ok(buf)
}

fn write_u32(buf: &mut Vec<u8>, value: u32) -> Result<()> {
    buf.write_u32::<LittleEndian>(value)
        .map_err(|e| Error::structural(format!("serialization failed: {e}")))
}

fn write_u64(buf: &mut Vec<u8>, value: u64) -> Result<()> {
    buf.write_u64::<LittleEndian>(value)
        .map_err(|e| Error::structural(format!("serialization failed: {e}")))
}
