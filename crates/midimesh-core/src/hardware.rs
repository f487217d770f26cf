//! Startup attachment of platform MIDI hardware to a mesh node.
//!
//! Enumerates the backend's ports, assigns device ids, announces every
//! endpoint into the registries, opens inputs with the boundary's
//! classifying callback, and registers outputs as routable ports. This is
//! the "announce local devices at startup" half of the boundary contract;
//! discovery then advertises the same records to peers.

use anyhow::Context;

use crate::backend_midir::{HardwareBackend, InputId};
use crate::boundary::MeshBoundary;
use crate::port::LocalPort;
use crate::registry::DeviceDirection;

/// A hardware input brought into the mesh.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachedInput {
    /// Device id assigned within this node.
    pub device_id: u16,
    /// Backend connection handle, needed for detach.
    pub input: InputId,
    /// Port name as reported by the backend.
    pub name: String,
}

/// A hardware output brought into the mesh.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachedOutput {
    /// Device id assigned within this node.
    pub device_id: u16,
    /// Port name as reported by the backend.
    pub name: String,
}

/// Everything one attach pass brought up; keep it around for detach.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct HardwareAttachment {
    /// Opened inputs.
    pub inputs: Vec<AttachedInput>,
    /// Opened outputs.
    pub outputs: Vec<AttachedOutput>,
}

/// Enumerate and attach every hardware port, assigning device ids from
/// `first_device_id` upward (inputs first, then outputs).
pub fn attach_hardware<B: HardwareBackend>(
    boundary: &MeshBoundary,
    backend: &mut B,
    first_device_id: u16,
) -> anyhow::Result<HardwareAttachment> {
    let mut attachment = HardwareAttachment::default();
    let mut next_id = first_device_id;

    let input_names = backend
        .input_ports()
        .context("failed to enumerate MIDI inputs")?;
    for (index, name) in input_names.into_iter().enumerate() {
        let device_id = next_id;
        next_id = next_id.wrapping_add(1);
        let callback = boundary.input_callback_for(device_id);
        let input = backend
            .open_input(index, Box::new(callback))
            .with_context(|| format!("failed to open MIDI input '{name}'"))?;
        boundary.announce_local_device(device_id, name.clone(), DeviceDirection::Input, None);
        attachment.inputs.push(AttachedInput {
            device_id,
            input,
            name,
        });
    }

    let output_names = backend
        .output_ports()
        .context("failed to enumerate MIDI outputs")?;
    for (index, name) in output_names.into_iter().enumerate() {
        let device_id = next_id;
        next_id = next_id.wrapping_add(1);
        let sink = backend
            .open_output(index)
            .with_context(|| format!("failed to open MIDI output '{name}'"))?;
        boundary.announce_local_device(device_id, name.clone(), DeviceDirection::Output, None);
        boundary.register_local_port(device_id, Box::new(LocalPort::output(name.clone(), sink)));
        attachment.outputs.push(AttachedOutput { device_id, name });
    }

    tracing::info!(
        inputs = attachment.inputs.len(),
        outputs = attachment.outputs.len(),
        "hardware attached"
    );
    Ok(attachment)
}

/// Tear down everything an attach pass brought up.
pub fn detach_hardware<B: HardwareBackend>(
    boundary: &MeshBoundary,
    backend: &mut B,
    attachment: HardwareAttachment,
) {
    for input in attachment.inputs {
        backend.close_input(input.input);
        boundary.withdraw_local_device(input.device_id);
    }
    for output in attachment.outputs {
        boundary.withdraw_local_device(output.device_id);
    }
}
