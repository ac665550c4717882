//! Network interface and state dicts
//!
//! Training, transfer, export and response code only see a network through
//! [`Network`]: named parameters plus forward and backward passes over one
//! trial. Parameter names are dotted module paths; the `core.` prefix marks
//! modules shared across animals, everything else (`perspective.`,
//! `modulation.`, `readout.`) is per-animal.

use ndarray::{Array1, Array2, Array3, ArrayView2, Axis};
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use crate::catalog::LinkKind;
use crate::{Error, Result};

/// Prefix of parameters shared across animals
pub const CORE_PREFIX: &str = "core.";

/// Array shapes of one dataset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataShape {
    /// Stimulus height
    pub height: usize,
    /// Stimulus width
    pub width: usize,
    /// Perspective channels
    pub perspectives: usize,
    /// Modulation channels
    pub modulations: usize,
    /// Recorded units
    pub units: usize,
}

impl DataShape {
    /// Pixels per frame
    #[must_use]
    pub const fn pixels(&self) -> usize {
        self.height * self.width
    }
}

/// Dense `f32` tensor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tensor {
    /// Dimensions
    pub shape: Vec<usize>,
    /// Row-major values
    pub data: Vec<f32>,
}

impl Tensor {
    /// All-zero tensor
    #[must_use]
    pub fn zeros(shape: &[usize]) -> Self {
        Self {
            shape: shape.to_vec(),
            data: vec![0.0; shape.iter().product()],
        }
    }

    /// Tensor from a matrix
    #[must_use]
    pub fn from_matrix(matrix: Array2<f32>) -> Self {
        let shape = matrix.shape().to_vec();
        let data = if matrix.is_standard_layout() {
            matrix.into_raw_vec_and_offset().0
        } else {
            matrix.iter().copied().collect()
        };
        Self { shape, data }
    }

    /// Tensor from a vector
    #[must_use]
    pub fn from_vector(vector: Array1<f32>) -> Self {
        Self {
            shape: vec![vector.len()],
            data: vector.to_vec(),
        }
    }

    /// View as a matrix.
    ///
    /// # Errors
    /// Returns `InvalidInput` if the tensor is not 2-D
    pub fn matrix(&self) -> Result<ArrayView2<'_, f32>> {
        match self.shape.as_slice() {
            &[rows, cols] => ArrayView2::from_shape((rows, cols), &self.data)
                .map_err(|e| Error::InvalidInput(format!("tensor shape {:?}: {e}", self.shape))),
            other => Err(Error::InvalidInput(format!("expected a matrix, got shape {other:?}"))),
        }
    }

    /// Euclidean norm
    #[must_use]
    pub fn norm(&self) -> f64 {
        self.data
            .iter()
            .map(|&v| f64::from(v) * f64::from(v))
            .sum::<f64>()
            .sqrt()
    }

    /// Element count
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// True when the tensor has no elements
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Named parameters in module registration order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateDict {
    entries: Vec<(String, Tensor)>,
}

impl StateDict {
    /// Empty state dict
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace `name`; a new name goes last.
    pub fn insert(&mut self, name: impl Into<String>, tensor: Tensor) {
        let name = name.into();
        match self.entries.iter_mut().find(|(n, _)| *n == name) {
            Some((_, slot)) => *slot = tensor,
            None => self.entries.push((name, tensor)),
        }
    }

    /// Tensor by name
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.entries.iter().find(|(n, _)| n == name).map(|(_, t)| t)
    }

    /// Mutable tensor by name
    pub fn get_mut(&mut self, name: &str) -> Option<&mut Tensor> {
        self.entries.iter_mut().find(|(n, _)| n == name).map(|(_, t)| t)
    }

    /// Tensor by name.
    ///
    /// # Errors
    /// Returns `InvalidInput` if absent
    pub fn require(&self, name: &str) -> Result<&Tensor> {
        self.get(name)
            .ok_or_else(|| Error::InvalidInput(format!("parameter `{name}` not found")))
    }

    /// Names in order
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(n, _)| n.as_str())
    }

    /// `(name, tensor)` pairs in order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Tensor)> {
        self.entries.iter().map(|(n, t)| (n.as_str(), t))
    }

    /// Entry count
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries whose name satisfies `keep`, order preserved.
    #[must_use]
    pub fn filter<F: Fn(&str) -> bool>(&self, keep: F) -> Self {
        Self {
            entries: self
                .entries
                .iter()
                .filter(|(n, _)| keep(n))
                .cloned()
                .collect(),
        }
    }

    /// Copy every entry of `other` into `self`; names must exist with equal shapes.
    ///
    /// # Errors
    /// Returns `InvalidInput` for unknown names or shape mismatches
    pub fn load(&mut self, other: &Self) -> Result<()> {
        for (name, tensor) in other.iter() {
            let slot = self
                .get_mut(name)
                .ok_or_else(|| Error::InvalidInput(format!("unexpected parameter `{name}`")))?;
            if slot.shape != tensor.shape {
                return Err(Error::InvalidInput(format!(
                    "parameter `{name}` has shape {:?}, got {:?}",
                    slot.shape, tensor.shape
                )));
            }
            slot.data.clone_from(&tensor.data);
        }
        Ok(())
    }

    /// Zero tensors with the same names and shapes
    #[must_use]
    pub fn zeros_like(&self) -> Self {
        Self {
            entries: self
                .entries
                .iter()
                .map(|(n, t)| (n.clone(), Tensor::zeros(&t.shape)))
                .collect(),
        }
    }

    /// Concatenate the listed tensors.
    ///
    /// # Errors
    /// Returns `InvalidInput` if a name is absent
    pub fn flatten(&self, names: &[String]) -> Result<Vec<f32>> {
        let mut out = Vec::new();
        for name in names {
            out.extend_from_slice(&self.require(name)?.data);
        }
        Ok(out)
    }

    /// Inverse of [`StateDict::flatten`].
    ///
    /// # Errors
    /// Returns `InvalidInput` if a name is absent or `values` has the wrong length
    pub fn unflatten(&mut self, names: &[String], values: &[f32]) -> Result<()> {
        let mut offset = 0;
        for name in names {
            let tensor = self
                .get_mut(name)
                .ok_or_else(|| Error::InvalidInput(format!("parameter `{name}` not found")))?;
            let end = offset + tensor.len();
            let chunk = values.get(offset..end).ok_or_else(|| {
                Error::InvalidInput(format!("flat buffer too short for `{name}`"))
            })?;
            tensor.data.copy_from_slice(chunk);
            offset = end;
        }
        if offset != values.len() {
            return Err(Error::InvalidInput(format!(
                "flat buffer has {} values, parameters take {offset}",
                values.len()
            )));
        }
        Ok(())
    }

    /// Add `scale * other` entry-wise for every name of `other`.
    ///
    /// # Errors
    /// Returns `InvalidInput` on unknown names or shape mismatches
    #[allow(clippy::cast_possible_truncation)]
    pub fn add_scaled(&mut self, other: &Self, scale: f64) -> Result<()> {
        for (name, tensor) in other.iter() {
            let slot = self
                .get_mut(name)
                .ok_or_else(|| Error::InvalidInput(format!("parameter `{name}` not found")))?;
            if slot.shape != tensor.shape {
                return Err(Error::InvalidInput(format!("shape mismatch for `{name}`")));
            }
            let scale = scale as f32;
            for (a, b) in slot.data.iter_mut().zip(&tensor.data) {
                *a += scale * b;
            }
        }
        Ok(())
    }

    /// Encode for a `.pt` file.
    ///
    /// # Errors
    /// Returns error if encoding fails
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Decode a `.pt` payload.
    ///
    /// # Errors
    /// Returns error if the payload does not decode
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// Model inputs of one trial
#[derive(Debug, Clone, PartialEq)]
pub struct Inputs {
    /// `[samples, pixels]`, scaled to `[0, 1]`
    pub stimuli: Array2<f32>,
    /// `[samples, perspectives]`
    pub perspectives: Array2<f32>,
    /// `[samples, modulations]`
    pub modulations: Array2<f32>,
}

impl Inputs {
    /// Assemble inputs; NaNs in the behavioral channels become 0.
    ///
    /// # Errors
    /// Returns `InvalidInput` if the sample counts differ
    pub fn new(stimuli: &Array3<u8>, perspectives: Array2<f32>, modulations: Array2<f32>) -> Result<Self> {
        let (samples, height, width) = stimuli.dim();
        if perspectives.nrows() != samples || modulations.nrows() != samples {
            return Err(Error::InvalidInput(format!(
                "stimuli have {samples} samples, perspectives {}, modulations {}",
                perspectives.nrows(),
                modulations.nrows()
            )));
        }
        let flat = stimuli
            .to_shape((samples, height * width))
            .map_err(|e| Error::InvalidInput(format!("stimulus reshape failed: {e}")))?
            .mapv(|v| f32::from(v) / 255.0);
        let clean = |a: Array2<f32>| a.mapv(|v| if v.is_finite() { v } else { 0.0 });
        Ok(Self {
            stimuli: flat,
            perspectives: clean(perspectives),
            modulations: clean(modulations),
        })
    }

    /// Sample count
    #[must_use]
    pub fn samples(&self) -> usize {
        self.stimuli.nrows()
    }
}

/// A trainable network over [`Inputs`].
pub trait Network: Send + Sync {
    /// Data shape the network was built for
    fn shape(&self) -> DataShape;

    /// Independent core streams
    fn streams(&self) -> usize;

    /// Parameters
    fn parameters(&self) -> &StateDict;

    /// Mutable parameters
    fn parameters_mut(&mut self) -> &mut StateDict;

    /// Predicted `[samples, units]` responses.
    ///
    /// # Errors
    /// Returns `InvalidInput` for inputs of the wrong shape or an unknown stream
    fn forward(&self, stream: usize, inputs: &Inputs) -> Result<Array2<f32>>;

    /// Parameter gradients given `d_output = dL/d forward(...)`.
    ///
    /// # Errors
    /// Returns `InvalidInput` for inputs of the wrong shape or an unknown stream
    fn backward(&self, stream: usize, inputs: &Inputs, d_output: ArrayView2<'_, f32>) -> Result<StateDict>;
}

/// Network architecture
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum NetworkKind {
    /// One `tanh` hidden layer per stream feeding a linear readout
    Linear {
        /// Hidden width
        hidden: usize,
        /// Core streams
        streams: usize,
        /// Uniform init bound, divided by `sqrt(fan_in)`
        init_scale: f64,
    },
}

impl LinkKind for NetworkKind {
    const TABLE: &'static str = "network";

    fn type_tag(&self) -> &'static str {
        "linear"
    }
}

impl NetworkKind {
    /// Build a freshly initialized network for `shape`.
    ///
    /// # Errors
    /// Returns `InvalidInput` for a zero hidden width or stream count
    pub fn build(&self, shape: DataShape, rng: &mut ChaCha8Rng) -> Result<Box<dyn Network>> {
        match self {
            Self::Linear {
                hidden,
                streams,
                init_scale,
            } => Ok(Box::new(LinearNetwork::new(shape, *hidden, *streams, *init_scale, rng)?)),
        }
    }
}

/// Reference network: `y = W_r tanh(W_c[s] x + b_c[s] + W_p p + W_m m) + b_r`.
#[derive(Debug, Clone)]
pub struct LinearNetwork {
    shape: DataShape,
    hidden: usize,
    streams: usize,
    parameters: StateDict,
}

#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
fn uniform(rng: &mut ChaCha8Rng, rows: usize, cols: usize, scale: f64) -> Tensor {
    let bound = if cols == 0 { 0.0 } else { scale / (cols as f64).sqrt() };
    let data = (0..rows * cols)
        .map(|_| if bound > 0.0 { rng.gen_range(-bound..bound) as f32 } else { 0.0 })
        .collect();
    Tensor {
        shape: vec![rows, cols],
        data,
    }
}

impl LinearNetwork {
    /// Initialize with uniform weights and zero biases.
    ///
    /// # Errors
    /// Returns `InvalidInput` for a zero hidden width or stream count
    pub fn new(
        shape: DataShape,
        hidden: usize,
        streams: usize,
        init_scale: f64,
        rng: &mut ChaCha8Rng,
    ) -> Result<Self> {
        if hidden == 0 || streams == 0 {
            return Err(Error::InvalidInput(format!(
                "network needs hidden > 0 and streams > 0, got {hidden} and {streams}"
            )));
        }
        let mut parameters = StateDict::new();
        for s in 0..streams {
            parameters.insert(format!("core.{s}.weight"), uniform(rng, hidden, shape.pixels(), init_scale));
            parameters.insert(format!("core.{s}.bias"), Tensor::zeros(&[hidden]));
        }
        parameters.insert("perspective.weight", uniform(rng, hidden, shape.perspectives, init_scale));
        parameters.insert("modulation.weight", uniform(rng, hidden, shape.modulations, init_scale));
        parameters.insert("readout.weight", uniform(rng, shape.units, hidden, init_scale));
        parameters.insert("readout.bias", Tensor::zeros(&[shape.units]));
        Ok(Self {
            shape,
            hidden,
            streams,
            parameters,
        })
    }

    /// Hidden width
    #[must_use]
    pub const fn hidden(&self) -> usize {
        self.hidden
    }

    fn check(&self, stream: usize, inputs: &Inputs) -> Result<()> {
        if stream >= self.streams {
            return Err(Error::InvalidInput(format!(
                "stream {stream} out of {}",
                self.streams
            )));
        }
        let expected = (self.shape.pixels(), self.shape.perspectives, self.shape.modulations);
        let got = (
            inputs.stimuli.ncols(),
            inputs.perspectives.ncols(),
            inputs.modulations.ncols(),
        );
        if expected != got {
            return Err(Error::InvalidInput(format!(
                "inputs have (pixels, perspectives, modulations) = {got:?}, network expects {expected:?}"
            )));
        }
        Ok(())
    }

    fn vector(&self, name: &str) -> Result<ndarray::ArrayView1<'_, f32>> {
        Ok(ndarray::ArrayView1::from(&self.parameters.require(name)?.data[..]))
    }

    fn hidden_activity(&self, stream: usize, inputs: &Inputs) -> Result<Array2<f32>> {
        let core = self.parameters.require(&format!("core.{stream}.weight"))?.matrix()?;
        let bias = self.vector(&format!("core.{stream}.bias"))?;
        let perspective = self.parameters.require("perspective.weight")?.matrix()?;
        let modulation = self.parameters.require("modulation.weight")?.matrix()?;

        let mut z = inputs.stimuli.dot(&core.t());
        z += &inputs.perspectives.dot(&perspective.t());
        z += &inputs.modulations.dot(&modulation.t());
        z += &bias;
        Ok(z.mapv(f32::tanh))
    }
}

impl Network for LinearNetwork {
    fn shape(&self) -> DataShape {
        self.shape
    }

    fn streams(&self) -> usize {
        self.streams
    }

    fn parameters(&self) -> &StateDict {
        &self.parameters
    }

    fn parameters_mut(&mut self) -> &mut StateDict {
        &mut self.parameters
    }

    fn forward(&self, stream: usize, inputs: &Inputs) -> Result<Array2<f32>> {
        self.check(stream, inputs)?;
        let h = self.hidden_activity(stream, inputs)?;
        let readout = self.parameters.require("readout.weight")?.matrix()?;
        let mut y = h.dot(&readout.t());
        y += &self.vector("readout.bias")?;
        Ok(y)
    }

    fn backward(&self, stream: usize, inputs: &Inputs, d_output: ArrayView2<'_, f32>) -> Result<StateDict> {
        self.check(stream, inputs)?;
        if d_output.dim() != (inputs.samples(), self.shape.units) {
            return Err(Error::InvalidInput(format!(
                "output gradient has shape {:?}, expected ({}, {})",
                d_output.dim(),
                inputs.samples(),
                self.shape.units
            )));
        }
        let h = self.hidden_activity(stream, inputs)?;
        let readout = self.parameters.require("readout.weight")?.matrix()?;

        let d_hidden = d_output.dot(&readout);
        let d_z = d_hidden * &h.mapv(|v| 1.0 - v * v);

        let mut grads = self.parameters.zeros_like();
        grads.insert("readout.weight", Tensor::from_matrix(d_output.t().dot(&h)));
        grads.insert("readout.bias", Tensor::from_vector(d_output.sum_axis(Axis(0))));
        grads.insert(format!("core.{stream}.weight"), Tensor::from_matrix(d_z.t().dot(&inputs.stimuli)));
        grads.insert(format!("core.{stream}.bias"), Tensor::from_vector(d_z.sum_axis(Axis(0))));
        grads.insert("perspective.weight", Tensor::from_matrix(d_z.t().dot(&inputs.perspectives)));
        grads.insert("modulation.weight", Tensor::from_matrix(d_z.t().dot(&inputs.modulations)));
        Ok(grads)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn shape() -> DataShape {
        DataShape {
            height: 2,
            width: 2,
            perspectives: 1,
            modulations: 2,
            units: 3,
        }
    }

    fn inputs(samples: usize) -> Inputs {
        let stimuli = Array3::from_shape_fn((samples, 2, 2), |(s, i, j)| (((s * 7 + i * 3 + j * 5) * 20) % 256) as u8);
        let perspectives = Array2::from_shape_fn((samples, 1), |(s, _)| s as f32 * 0.1);
        let modulations = Array2::from_shape_fn((samples, 2), |(s, c)| if c == 0 { f32::NAN } else { s as f32 });
        Inputs::new(&stimuli, perspectives, modulations).unwrap()
    }

    #[test]
    fn test_init_is_seeded_and_named() {
        let a = NetworkKind::Linear { hidden: 4, streams: 2, init_scale: 1.0 }
            .build(shape(), &mut ChaCha8Rng::seed_from_u64(3))
            .unwrap();
        let b = NetworkKind::Linear { hidden: 4, streams: 2, init_scale: 1.0 }
            .build(shape(), &mut ChaCha8Rng::seed_from_u64(3))
            .unwrap();
        assert_eq!(a.parameters(), b.parameters());
        let names: Vec<&str> = a.parameters().names().collect();
        assert_eq!(
            names,
            vec![
                "core.0.weight",
                "core.0.bias",
                "core.1.weight",
                "core.1.bias",
                "perspective.weight",
                "modulation.weight",
                "readout.weight",
                "readout.bias"
            ]
        );
    }

    #[test]
    fn test_inputs_clean_nans() {
        let x = inputs(3);
        assert!(x.modulations.iter().all(|v| v.is_finite()));
        assert_eq!(x.stimuli.dim(), (3, 4));
    }

    #[test]
    fn test_backward_matches_finite_differences() {
        let mut rng = ChaCha8Rng::seed_from_u64(11);
        let mut net = LinearNetwork::new(shape(), 3, 1, 1.0, &mut rng).unwrap();
        let x = inputs(4);
        // loss = sum(y), so dL/dy = 1
        let ones = Array2::<f32>::ones((4, 3));
        let grads = net.backward(0, &x, ones.view()).unwrap();

        let eps = 1e-3f32;
        for name in ["readout.weight", "core.0.weight", "perspective.weight"] {
            let analytic = grads.require(name).unwrap().data[1];
            net.parameters_mut().get_mut(name).unwrap().data[1] += eps;
            let up: f32 = net.forward(0, &x).unwrap().sum();
            net.parameters_mut().get_mut(name).unwrap().data[1] -= 2.0 * eps;
            let down: f32 = net.forward(0, &x).unwrap().sum();
            net.parameters_mut().get_mut(name).unwrap().data[1] += eps;
            let numeric = (up - down) / (2.0 * eps);
            assert!((analytic - numeric).abs() < 1e-2, "{name}: {analytic} vs {numeric}");
        }
    }

    #[test]
    fn test_flatten_roundtrip_and_load() {
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let net = LinearNetwork::new(shape(), 2, 1, 1.0, &mut rng).unwrap();
        let names = vec!["readout.weight".to_string(), "readout.bias".to_string()];
        let flat = net.parameters().flatten(&names).unwrap();
        assert_eq!(flat.len(), 3 * 2 + 3);

        let mut copy = net.parameters().zeros_like();
        copy.unflatten(&names, &flat).unwrap();
        assert_eq!(copy.get("readout.weight"), net.parameters().get("readout.weight"));
        assert!(copy.unflatten(&names, &flat[1..]).is_err());

        let core = net.parameters().filter(|n| n.starts_with(CORE_PREFIX));
        assert_eq!(core.len(), 2);
        copy.load(&core).unwrap();
        assert_eq!(copy.get("core.0.weight"), net.parameters().get("core.0.weight"));
    }

    #[test]
    fn test_wrong_inputs_rejected() {
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let net = LinearNetwork::new(shape(), 2, 1, 1.0, &mut rng).unwrap();
        assert!(net.forward(1, &inputs(2)).is_err());
        let wrong = Inputs::new(
            &Array3::zeros((2, 3, 3)),
            Array2::zeros((2, 1)),
            Array2::zeros((2, 2)),
        )
        .unwrap();
        assert!(net.forward(0, &wrong).is_err());
    }
}
