//! [`Backend`] implementation over `tract-onnx`.
//!
//! tract runs on the CPU, so a forward pass returns once its outputs are computed. Tensors are
//! plain host buffers; the backend only tracks how many are outstanding.

use std::{
    fmt::Write,
    path::Path,
    sync::atomic::{AtomicUsize, Ordering},
};

use anyhow::{Context, Result};
use log::{debug, warn};
use ndarray::{ArrayD, IxDyn};
use tract_onnx::prelude::{
    Datum, Framework, Graph, InferenceFact, InferenceModelExt, IntoTensor, SimplePlan, Tensor,
    TypedFact, TypedOp, tvec,
};

use crate::backend::Backend;
use crate::error::BackendResult;

type RunnableModel = SimplePlan<TypedFact, Box<dyn TypedOp>, Graph<TypedFact, Box<dyn TypedOp>>>;

/// An ONNX graph prepared for execution.
#[derive(Debug)]
pub struct TractNetwork {
    name: String,
    runnable: RunnableModel,
}

impl TractNetwork {
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Host tensor handed out by [`TractBackend`].
#[derive(Debug, Clone)]
pub struct TractTensor(Tensor);

/// CPU backend running ONNX graphs with tract.
#[derive(Debug, Default)]
pub struct TractBackend {
    live: AtomicUsize,
}

impl TractBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load and optimize an ONNX graph.
    ///
    /// `input_shape` pins the input fact, which networks with free spatial dimensions need
    /// before tract can optimize them. When optimization fails the decluttered graph is used.
    pub fn load_network<P: AsRef<Path>>(
        &self,
        name: &str,
        model_path: P,
        input_shape: Option<&[usize]>,
    ) -> Result<TractNetwork> {
        let path = model_path.as_ref();
        anyhow::ensure!(path.exists(), "model file not found: {}", path.display());

        let runnable = match load_runnable_model(path, input_shape, true) {
            Ok(model) => {
                debug!("{name} model {} optimized successfully", path.display());
                model
            }
            Err(opt_err) => {
                let optimize_msg = format!("{opt_err}");
                let mut chain_msg = String::new();
                for cause in opt_err.chain() {
                    let _ = writeln!(&mut chain_msg, "  - {cause}");
                }
                warn!(
                    "{name} model {} failed optimized load ({optimize_msg}); falling back to decluttered graph.\nError chain:\n{}",
                    path.display(),
                    chain_msg.trim_end()
                );
                let decluttered = load_runnable_model(path, input_shape, false).with_context(|| {
                    format!("fallback to decluttered {name} graph failed after optimize error: {optimize_msg}")
                })?;
                debug!("{name} model {} running in decluttered mode", path.display());
                decluttered
            }
        };

        Ok(TractNetwork {
            name: name.to_string(),
            runnable,
        })
    }
}

fn load_runnable_model(
    path: &Path,
    input_shape: Option<&[usize]>,
    optimized: bool,
) -> Result<RunnableModel> {
    let mut model = tract_onnx::onnx()
        .model_for_path(path)
        .with_context(|| format!("failed to parse ONNX graph from {}", path.display()))?;
    if let Some(shape) = input_shape {
        model = model
            .with_input_fact(0, InferenceFact::dt_shape(f32::datum_type(), shape.to_vec()))
            .map_err(|e| anyhow::anyhow!("unable to set input shape {shape:?}: {e}"))?;
    }

    if optimized {
        model
            .into_optimized()
            .map_err(|e| anyhow::anyhow!("unable to optimize graph: {e}"))?
            .into_runnable()
            .map_err(|e| anyhow::anyhow!("unable to make graph runnable: {e}"))
    } else {
        model
            .into_typed()
            .map_err(|e| anyhow::anyhow!("unable to type-check graph: {e}"))?
            .into_decluttered()
            .map_err(|e| anyhow::anyhow!("unable to declutter graph: {e}"))?
            .into_runnable()
            .map_err(|e| anyhow::anyhow!("unable to make graph runnable: {e}"))
    }
}

impl Backend for TractBackend {
    type Tensor = TractTensor;
    type Network = TractNetwork;

    fn allocate(&self, shape: &[usize], data: Vec<f32>) -> BackendResult<TractTensor> {
        let tensor = Tensor::from_shape(shape, &data)?;
        self.live.fetch_add(1, Ordering::SeqCst);
        Ok(TractTensor(tensor))
    }

    fn forward(&self, network: &TractNetwork, input: &TractTensor) -> BackendResult<Vec<TractTensor>> {
        let outputs = network
            .runnable
            .run(tvec![input.0.clone().into()])
            .with_context(|| format!("{} execution failed", network.name))?;
        let tensors: Vec<TractTensor> = outputs
            .into_iter()
            .map(|value| TractTensor(value.into_tensor()))
            .collect();
        self.live.fetch_add(tensors.len(), Ordering::SeqCst);
        Ok(tensors)
    }

    fn read(&self, tensor: &TractTensor) -> BackendResult<ArrayD<f32>> {
        let values = tensor.0.as_slice::<f32>()?;
        Ok(ArrayD::from_shape_vec(IxDyn(tensor.0.shape()), values.to_vec())?)
    }

    fn dispose(&self, _tensor: &TractTensor) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }

    fn live_tensors(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }
}
