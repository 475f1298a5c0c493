use anyhow::{anyhow, Result};
use ndarray::{s, Array, Array1, Array2, Array3, ArrayView2, Axis, Dimension, ShapeBuilder};
use rand::Rng;
use serde::{Deserialize, Serialize};

const KERNEL: usize = 3;
const HIDDEN_1: usize = 32;
const HIDDEN_2: usize = 64;

/// Dilation and symmetric zero padding of one convolution
#[derive(Debug, Clone, Copy)]
struct ConvSpec {
    dilation: usize,
    padding: usize,
}

const CONV_1: ConvSpec = ConvSpec { dilation: 1, padding: 2 };
const CONV_2: ConvSpec = ConvSpec { dilation: 2, padding: 4 };

/// Trainable parameters of the temporal convolutional network
///
/// Conv1d(F->32, k=3, d=1, p=2) -> ReLU -> Conv1d(32->64, k=3, d=2, p=4) -> ReLU
/// -> last time step -> Linear(64->T)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TcnParams {
    /// (32, features, 3)
    pub conv1_weight: Array3<f64>,
    pub conv1_bias: Array1<f64>,
    /// (64, 32, 3)
    pub conv2_weight: Array3<f64>,
    pub conv2_bias: Array1<f64>,
    /// (targets, 64)
    pub fc_weight: Array2<f64>,
    pub fc_bias: Array1<f64>,
}

impl TcnParams {
    /// Fresh parameters, uniform in +-1/sqrt(fan_in)
    pub fn init<R: Rng>(n_inputs: usize, n_outputs: usize, rng: &mut R) -> Self {
        let c1 = n_inputs * KERNEL;
        let c2 = HIDDEN_1 * KERNEL;
        Self {
            conv1_weight: uniform((HIDDEN_1, n_inputs, KERNEL), c1, rng),
            conv1_bias: uniform(HIDDEN_1, c1, rng),
            conv2_weight: uniform((HIDDEN_2, HIDDEN_1, KERNEL), c2, rng),
            conv2_bias: uniform(HIDDEN_2, c2, rng),
            fc_weight: uniform((n_outputs, HIDDEN_2), HIDDEN_2, rng),
            fc_bias: uniform(n_outputs, HIDDEN_2, rng),
        }
    }

    pub fn zeros_like(&self) -> Self {
        Self {
            conv1_weight: Array3::zeros(self.conv1_weight.raw_dim()),
            conv1_bias: Array1::zeros(self.conv1_bias.raw_dim()),
            conv2_weight: Array3::zeros(self.conv2_weight.raw_dim()),
            conv2_bias: Array1::zeros(self.conv2_bias.raw_dim()),
            fc_weight: Array2::zeros(self.fc_weight.raw_dim()),
            fc_bias: Array1::zeros(self.fc_bias.raw_dim()),
        }
    }

    pub fn n_inputs(&self) -> usize {
        self.conv1_weight.len_of(Axis(1))
    }

    pub fn n_outputs(&self) -> usize {
        self.fc_weight.nrows()
    }

    pub fn num_parameters(&self) -> usize {
        self.conv1_weight.len()
            + self.conv1_bias.len()
            + self.conv2_weight.len()
            + self.conv2_bias.len()
            + self.fc_weight.len()
            + self.fc_bias.len()
    }

    /// Check every tensor against the architecture for the given input/output widths
    pub fn validate(&self, n_inputs: usize, n_outputs: usize) -> Result<()> {
        let checks: [(&str, &[usize], Vec<usize>); 6] = [
            ("conv1_weight", self.conv1_weight.shape(), vec![HIDDEN_1, n_inputs, KERNEL]),
            ("conv1_bias", self.conv1_bias.shape(), vec![HIDDEN_1]),
            ("conv2_weight", self.conv2_weight.shape(), vec![HIDDEN_2, HIDDEN_1, KERNEL]),
            ("conv2_bias", self.conv2_bias.shape(), vec![HIDDEN_2]),
            ("fc_weight", self.fc_weight.shape(), vec![n_outputs, HIDDEN_2]),
            ("fc_bias", self.fc_bias.shape(), vec![n_outputs]),
        ];

        for (name, actual, expected) in checks {
            if actual != expected.as_slice() {
                return Err(anyhow!(
                    "{} has shape {:?}, expected {:?}",
                    name,
                    actual,
                    expected
                ));
            }
        }
        Ok(())
    }
}

/// Intermediate values of one sample's forward pass, kept for backprop
struct Activations {
    input_padded: Array2<f64>,
    z1: Array2<f64>,
    a1_padded: Array2<f64>,
    z2: Array2<f64>,
    hidden: Array1<f64>,
    output: Array1<f64>,
}

/// Temporal convolutional network over (seq_len, features) windows
#[derive(Debug, Clone, PartialEq)]
pub struct Tcn {
    params: TcnParams,
}

impl Tcn {
    pub fn new(params: TcnParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &TcnParams {
        &self.params
    }

    pub fn params_mut(&mut self) -> &mut TcnParams {
        &mut self.params
    }

    pub fn into_params(self) -> TcnParams {
        self.params
    }

    /// Predictions for a batch of windows, shape (samples, targets)
    pub fn predict(&self, x: &Array3<f64>) -> Result<Array2<f64>> {
        self.check_input(x)?;
        let n = x.len_of(Axis(0));
        let mut out = Array2::zeros((n, self.params.n_outputs()));
        for (i, sample) in x.outer_iter().enumerate() {
            let acts = self.forward_sample(sample);
            out.row_mut(i).assign(&acts.output);
        }
        Ok(out)
    }

    /// Mean squared error of the batch and its gradient w.r.t. every parameter
    pub fn loss_and_grads(&self, x: &Array3<f64>, y: &Array2<f64>) -> Result<(f64, TcnParams)> {
        self.check_input(x)?;
        let n = x.len_of(Axis(0));
        if y.dim() != (n, self.params.n_outputs()) {
            return Err(anyhow!(
                "Targets have shape {:?}, expected ({}, {})",
                y.dim(),
                n,
                self.params.n_outputs()
            ));
        }
        if n == 0 {
            return Err(anyhow!("Cannot compute loss on an empty batch"));
        }

        let p = &self.params;
        let mut grads = p.zeros_like();
        let denom = (n * p.n_outputs()) as f64;
        let mut loss = 0.0;

        for (sample, target) in x.outer_iter().zip(y.outer_iter()) {
            let acts = self.forward_sample(sample);
            let diff = &acts.output - &target;
            loss += diff.mapv(|d| d * d).sum();

            // dL/d(output) for mean-reduced MSE
            let d_out = diff.mapv(|d| 2.0 * d / denom);

            // Linear head
            let d_out_col = d_out.view().insert_axis(Axis(1));
            let hidden_row = acts.hidden.view().insert_axis(Axis(0));
            grads.fc_weight += &d_out_col.dot(&hidden_row);
            grads.fc_bias += &d_out;
            let d_hidden = p.fc_weight.t().dot(&d_out);

            // Only the last time step of the second conv feeds the head
            let last = acts.z2.ncols() - 1;
            let mut d_z2 = Array2::<f64>::zeros(acts.z2.raw_dim());
            for (c, &g) in d_hidden.iter().enumerate() {
                if acts.z2[[c, last]] > 0.0 {
                    d_z2[[c, last]] = g;
                }
            }

            let d_a1_padded = conv_backward(
                &acts.a1_padded,
                &p.conv2_weight,
                &d_z2,
                CONV_2,
                &mut grads.conv2_weight,
                &mut grads.conv2_bias,
            );
            let l1 = acts.z1.ncols();
            let mut d_z1 = d_a1_padded
                .slice(s![.., CONV_2.padding..CONV_2.padding + l1])
                .to_owned();
            d_z1.zip_mut_with(&acts.z1, |g, &z| {
                if z <= 0.0 {
                    *g = 0.0;
                }
            });

            conv_backward(
                &acts.input_padded,
                &p.conv1_weight,
                &d_z1,
                CONV_1,
                &mut grads.conv1_weight,
                &mut grads.conv1_bias,
            );
        }

        Ok((loss / denom, grads))
    }

    fn check_input(&self, x: &Array3<f64>) -> Result<()> {
        let (_, seq_len, n_features) = x.dim();
        if n_features != self.params.n_inputs() {
            return Err(anyhow!(
                "Model expects {} features, windows have {}",
                self.params.n_inputs(),
                n_features
            ));
        }
        if seq_len == 0 {
            return Err(anyhow!("Windows must have at least one time step"));
        }
        Ok(())
    }

    /// `sample` is (seq_len, features); convolutions run over time with features as channels
    fn forward_sample(&self, sample: ArrayView2<f64>) -> Activations {
        let p = &self.params;

        let input_padded = pad_time(sample.t(), CONV_1.padding);
        let z1 = conv_forward(&input_padded, &p.conv1_weight, &p.conv1_bias, CONV_1);
        let a1 = z1.mapv(relu);

        let a1_padded = pad_time(a1.view(), CONV_2.padding);
        let z2 = conv_forward(&a1_padded, &p.conv2_weight, &p.conv2_bias, CONV_2);

        let hidden = z2.column(z2.ncols() - 1).mapv(relu);
        let output = p.fc_weight.dot(&hidden) + &p.fc_bias;

        Activations { input_padded, z1, a1_padded, z2, hidden, output }
    }
}

fn uniform<Sh, D, R>(shape: Sh, fan_in: usize, rng: &mut R) -> Array<f64, D>
where
    Sh: ShapeBuilder<Dim = D>,
    D: Dimension,
    R: Rng,
{
    let bound = 1.0 / (fan_in as f64).sqrt();
    Array::from_shape_simple_fn(shape, || rng.gen_range(-bound..bound))
}

fn relu(v: f64) -> f64 {
    v.max(0.0)
}

/// Zero-pad (channels, time) on both ends of the time axis
fn pad_time(input: ArrayView2<f64>, padding: usize) -> Array2<f64> {
    let (channels, len) = input.dim();
    let mut padded = Array2::zeros((channels, len + 2 * padding));
    padded.slice_mut(s![.., padding..padding + len]).assign(&input);
    padded
}

fn output_len(padded_len: usize, spec: ConvSpec) -> usize {
    padded_len - spec.dilation * (KERNEL - 1)
}

/// Dilated 1-D convolution of an already padded (channels, time) input
fn conv_forward(
    padded: &Array2<f64>,
    weight: &Array3<f64>,
    bias: &Array1<f64>,
    spec: ConvSpec,
) -> Array2<f64> {
    let out_len = output_len(padded.ncols(), spec);
    let mut out = Array2::zeros((weight.len_of(Axis(0)), out_len));

    for k in 0..KERNEL {
        let offset = k * spec.dilation;
        let tap = padded.slice(s![.., offset..offset + out_len]);
        out += &weight.slice(s![.., .., k]).dot(&tap);
    }
    out += &bias.view().insert_axis(Axis(1));
    out
}

/// Accumulate weight/bias gradients and return the gradient w.r.t. the padded input
fn conv_backward(
    padded: &Array2<f64>,
    weight: &Array3<f64>,
    d_out: &Array2<f64>,
    spec: ConvSpec,
    d_weight: &mut Array3<f64>,
    d_bias: &mut Array1<f64>,
) -> Array2<f64> {
    let out_len = d_out.ncols();
    let mut d_padded = Array2::zeros(padded.raw_dim());

    for k in 0..KERNEL {
        let offset = k * spec.dilation;
        let tap = padded.slice(s![.., offset..offset + out_len]);

        let mut dw = d_weight.slice_mut(s![.., .., k]);
        dw += &d_out.dot(&tap.t());

        let mut d_tap = d_padded.slice_mut(s![.., offset..offset + out_len]);
        d_tap += &weight.slice(s![.., .., k]).t().dot(d_out);
    }
    *d_bias += &d_out.sum_axis(Axis(1));
    d_padded
}
