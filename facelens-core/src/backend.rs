//! The inference seam: how the pipeline talks to a compute backend.
//!
//! Every tensor a backend hands out is owned by a [`ScopedTensor`], which returns it to the
//! backend on drop. [`run_network`] uploads one input, runs the network, copies every output to
//! the host and releases all of them before returning, on success and on error alike.

use facelens_utils::timing_guard;
use log::trace;
use ndarray::{Array4, ArrayD};

use crate::error::{BackendResult, FaceError, Result};

/// A blocking compute backend.
///
/// `forward` must not return until the output values can be read.
pub trait Backend: Send + Sync {
    /// Backend-owned tensor handle.
    type Tensor: Send;
    /// A loaded network.
    type Network: Send + Sync;

    /// Upload `data` (row-major, matching `shape`) as a new tensor.
    fn allocate(&self, shape: &[usize], data: Vec<f32>) -> BackendResult<Self::Tensor>;

    /// Run `network` on `input`, returning its outputs in declaration order.
    fn forward(
        &self,
        network: &Self::Network,
        input: &Self::Tensor,
    ) -> BackendResult<Vec<Self::Tensor>>;

    /// Copy a tensor's values to the host.
    fn read(&self, tensor: &Self::Tensor) -> BackendResult<ArrayD<f32>>;

    /// Release a tensor. The handle is dropped right after and never used again.
    fn dispose(&self, tensor: &Self::Tensor);

    /// Number of tensors allocated and not yet disposed.
    fn live_tensors(&self) -> usize;
}

/// Owns a backend tensor and disposes it when dropped.
pub struct ScopedTensor<'b, B: Backend> {
    backend: &'b B,
    tensor: B::Tensor,
}

impl<'b, B: Backend> ScopedTensor<'b, B> {
    pub fn new(backend: &'b B, tensor: B::Tensor) -> Self {
        Self { backend, tensor }
    }

    /// Upload `tensor` and take ownership of the handle.
    pub fn upload(backend: &'b B, network: &str, tensor: &Array4<f32>) -> Result<Self> {
        let shape = tensor.shape().to_vec();
        let data: Vec<f32> = tensor.iter().copied().collect();
        let handle = backend
            .allocate(&shape, data)
            .map_err(|e| FaceError::backend(network, e))?;
        Ok(Self::new(backend, handle))
    }

    pub fn tensor(&self) -> &B::Tensor {
        &self.tensor
    }

    pub fn read(&self, network: &str) -> Result<ArrayD<f32>> {
        self.backend
            .read(&self.tensor)
            .map_err(|e| FaceError::backend(network, e))
    }
}

impl<B: Backend> Drop for ScopedTensor<'_, B> {
    fn drop(&mut self) {
        self.backend.dispose(&self.tensor);
    }
}

/// Run one forward pass and return every output as a host array.
///
/// `network_name` labels errors and timing records.
pub fn run_network<B: Backend>(
    backend: &B,
    network_name: &str,
    network: &B::Network,
    input: &Array4<f32>,
) -> Result<Vec<ArrayD<f32>>> {
    let _guard = timing_guard(format!("facelens::forward::{network_name}"), log::Level::Debug);
    let input = ScopedTensor::upload(backend, network_name, input)?;
    let outputs: Vec<ScopedTensor<'_, B>> = backend
        .forward(network, input.tensor())
        .map_err(|e| FaceError::backend(network_name, e))?
        .into_iter()
        .map(|t| ScopedTensor::new(backend, t))
        .collect();
    trace!("{network_name} produced {} outputs", outputs.len());
    outputs.iter().map(|t| t.read(network_name)).collect()
}

/// Role of a loaded network inside a [`NetworkSet`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NetworkSlot {
    Ssd,
    Tiny,
    MtcnnProposal,
    MtcnnRefine,
    MtcnnOutput,
    Landmarks,
    Recognition,
    Expression,
    AgeGender,
}

impl NetworkSlot {
    pub const ALL: [NetworkSlot; 9] = [
        NetworkSlot::Ssd,
        NetworkSlot::Tiny,
        NetworkSlot::MtcnnProposal,
        NetworkSlot::MtcnnRefine,
        NetworkSlot::MtcnnOutput,
        NetworkSlot::Landmarks,
        NetworkSlot::Recognition,
        NetworkSlot::Expression,
        NetworkSlot::AgeGender,
    ];

    /// Short name used in logs and errors.
    pub fn name(self) -> &'static str {
        match self {
            NetworkSlot::Ssd => "ssd",
            NetworkSlot::Tiny => "tiny",
            NetworkSlot::MtcnnProposal => "pnet",
            NetworkSlot::MtcnnRefine => "rnet",
            NetworkSlot::MtcnnOutput => "onet",
            NetworkSlot::Landmarks => "landmarks",
            NetworkSlot::Recognition => "recognition",
            NetworkSlot::Expression => "expression",
            NetworkSlot::AgeGender => "age_gender",
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

/// The networks a caller has loaded, one optional handle per [`NetworkSlot`].
#[derive(Debug)]
pub struct NetworkSet<N> {
    slots: [Option<N>; NetworkSlot::ALL.len()],
}

impl<N> Default for NetworkSet<N> {
    fn default() -> Self {
        Self {
            slots: std::array::from_fn(|_| None),
        }
    }
}

impl<N> NetworkSet<N> {
    /// Store `network`, returning the handle it replaced.
    pub fn insert(&mut self, slot: NetworkSlot, network: N) -> Option<N> {
        self.slots[slot.index()].replace(network)
    }

    pub fn remove(&mut self, slot: NetworkSlot) -> Option<N> {
        self.slots[slot.index()].take()
    }

    pub fn get(&self, slot: NetworkSlot) -> Option<&N> {
        self.slots[slot.index()].as_ref()
    }

    pub fn is_loaded(&self, slot: NetworkSlot) -> bool {
        self.get(slot).is_some()
    }

    /// The network in `slot`, or [`FaceError::MissingNetwork`].
    pub fn require(&self, slot: NetworkSlot) -> Result<&N> {
        self.get(slot)
            .ok_or_else(|| FaceError::MissingNetwork(slot.name().to_string()))
    }
}

/// Output `index` of a forward pass, or an output error naming the network.
pub(crate) fn take_output(
    outputs: &mut Vec<ArrayD<f32>>,
    index: usize,
    network: &str,
) -> Result<ArrayD<f32>> {
    if index >= outputs.len() {
        return Err(FaceError::output(
            network,
            format!("expected at least {} outputs, got {}", index + 1, outputs.len()),
        ));
    }
    Ok(std::mem::take(&mut outputs[index]))
}
