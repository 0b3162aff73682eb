//! Inference-only building blocks for the detection heads.
//!
//! Weights are initialised like PyTorch's defaults (uniform in `±1/sqrt(fan_in)`) from a seeded
//! generator, batch norms start from identity statistics. Dropout is the identity at inference
//! time and is therefore not represented.

use ndarray::{
    s, Array, Array1, Array2, Array4, ArrayView2, ArrayView4, Axis, Dimension, RemoveAxis,
};
use ndarray_rand::rand::rngs::StdRng;
use ndarray_rand::rand::SeedableRng;
use ndarray_rand::rand_distr::Uniform;
use ndarray_rand::RandomExt;

use crate::error::{Error, Result};

pub type Rng = StdRng;

pub fn seeded_rng(seed: u64) -> Rng {
    StdRng::seed_from_u64(seed)
}

fn uniform_bound(fan_in: usize) -> Uniform<f32> {
    let bound = 1.0 / (fan_in.max(1) as f32).sqrt();
    Uniform::new_inclusive(-bound, bound)
}

pub fn relu<D: Dimension>(x: Array<f32, D>) -> Array<f32, D> {
    x.mapv_into(|v| v.max(0.0))
}

/// Scalar logistic function, shared by the heads and the losses.
pub fn logistic(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

pub fn sigmoid<D: Dimension>(x: Array<f32, D>) -> Array<f32, D> {
    x.mapv_into(logistic)
}

/// Fully connected layer, `y = x W^T + b`.
#[derive(Debug, Clone)]
pub struct Linear {
    pub weight: Array2<f32>,
    pub bias: Array1<f32>,
}

impl Linear {
    pub fn new(in_features: usize, out_features: usize, rng: &mut Rng) -> Self {
        let distribution = uniform_bound(in_features);
        Linear {
            weight: Array2::random_using((out_features, in_features), distribution, rng),
            bias: Array1::random_using(out_features, distribution, rng),
        }
    }

    pub fn in_features(&self) -> usize {
        self.weight.ncols()
    }

    pub fn out_features(&self) -> usize {
        self.weight.nrows()
    }

    /// `x` is `batch x in_features`.
    pub fn forward(&self, x: ArrayView2<f32>) -> Result<Array2<f32>> {
        if x.ncols() != self.in_features() {
            return Err(Error::shape("linear input", self.in_features(), x.ncols()));
        }
        Ok(x.dot(&self.weight.t()) + &self.bias)
    }
}

/// Square 2d convolution with zero padding.
#[derive(Debug, Clone)]
pub struct Conv2d {
    /// `out_channels x in_channels x kernel x kernel`.
    pub weight: Array4<f32>,
    pub bias: Array1<f32>,
    pub stride: usize,
    pub padding: usize,
}

impl Conv2d {
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        kernel: usize,
        stride: usize,
        padding: usize,
        rng: &mut Rng,
    ) -> Self {
        let distribution = uniform_bound(in_channels * kernel * kernel);
        Conv2d {
            weight: Array4::random_using(
                (out_channels, in_channels, kernel, kernel),
                distribution,
                rng,
            ),
            bias: Array1::random_using(out_channels, distribution, rng),
            stride: stride.max(1),
            padding,
        }
    }

    pub fn in_channels(&self) -> usize {
        self.weight.dim().1
    }

    pub fn out_channels(&self) -> usize {
        self.weight.dim().0
    }

    fn kernel(&self) -> usize {
        self.weight.dim().2
    }

    /// Spatial output size for an input of side `size`.
    pub fn output_size(&self, size: usize) -> Option<usize> {
        let padded = size + 2 * self.padding;
        (padded >= self.kernel()).then(|| (padded - self.kernel()) / self.stride + 1)
    }

    /// `x` is `batch x in_channels x height x width`.
    pub fn forward(&self, x: ArrayView4<f32>) -> Result<Array4<f32>> {
        let (batch, channels, height, width) = x.dim();
        if channels != self.in_channels() {
            return Err(Error::shape("conv2d input channels", self.in_channels(), channels));
        }
        let (Some(out_h), Some(out_w)) = (self.output_size(height), self.output_size(width)) else {
            return Err(Error::shape(
                "conv2d input size",
                format!("at least {} after padding", self.kernel()),
                (height, width),
            ));
        };

        let k = self.kernel();
        let p = self.padding;
        let weight = self
            .weight
            .view()
            .into_shape((self.out_channels(), channels * k * k))
            .map_err(|_| Error::shape("conv2d weight", "contiguous", "strided"))?;

        let mut output = Array4::<f32>::zeros((batch, self.out_channels(), out_h, out_w));
        let mut padded = Array2::<f32>::zeros((height + 2 * p, width + 2 * p));

        for (image, mut out) in x.outer_iter().zip(output.outer_iter_mut()) {
            // im2col: one column per output position, rows ordered (channel, ky, kx)
            let mut columns = Array2::<f32>::zeros((channels * k * k, out_h * out_w));
            for (c, plane) in image.outer_iter().enumerate() {
                padded
                    .slice_mut(s![p..p + height, p..p + width])
                    .assign(&plane);
                for ky in 0..k {
                    for kx in 0..k {
                        let row = (c * k + ky) * k + kx;
                        for oy in 0..out_h {
                            for ox in 0..out_w {
                                columns[[row, oy * out_w + ox]] =
                                    padded[[oy * self.stride + ky, ox * self.stride + kx]];
                            }
                        }
                    }
                }
            }

            let result = weight.dot(&columns) + &self.bias.view().insert_axis(Axis(1));
            let result = result
                .into_shape((self.out_channels(), out_h, out_w))
                .map_err(|_| Error::shape("conv2d output", "contiguous", "strided"))?;
            out.assign(&result);
        }

        Ok(output)
    }
}

/// Batch normalisation with frozen statistics, over axis 1 of its input.
#[derive(Debug, Clone)]
pub struct BatchNorm {
    pub gamma: Array1<f32>,
    pub beta: Array1<f32>,
    pub running_mean: Array1<f32>,
    pub running_var: Array1<f32>,
    pub eps: f32,
}

impl BatchNorm {
    pub fn new(features: usize) -> Self {
        BatchNorm {
            gamma: Array1::ones(features),
            beta: Array1::zeros(features),
            running_mean: Array1::zeros(features),
            running_var: Array1::ones(features),
            eps: 1e-5,
        }
    }

    pub fn features(&self) -> usize {
        self.gamma.len()
    }

    /// Works on `batch x features` as well as `batch x channels x height x width`.
    pub fn forward<D>(&self, mut x: Array<f32, D>) -> Result<Array<f32, D>>
    where
        D: Dimension + RemoveAxis,
    {
        if x.ndim() < 2 || x.len_of(Axis(1)) != self.features() {
            return Err(Error::shape("batch norm input", self.features(), x.shape().to_vec()));
        }

        for (c, mut lane) in x.axis_iter_mut(Axis(1)).enumerate() {
            let scale = self.gamma[c] / (self.running_var[c] + self.eps).sqrt();
            let shift = self.beta[c] - self.running_mean[c] * scale;
            lane.mapv_inplace(|v| v * scale + shift);
        }

        Ok(x)
    }
}

#[cfg(test)]
mod tests {
    use ndarray::{array, Array1, Array2, Array4};

    use super::{logistic, relu, seeded_rng, sigmoid, BatchNorm, Conv2d, Linear};

    #[test]
    fn test_linear() {
        let mut rng = seeded_rng(0);
        let mut linear = Linear::new(3, 2, &mut rng);
        linear.weight = array![[1.0, 0.0, -1.0], [0.5, 0.5, 0.5]];
        linear.bias = array![0.0, 1.0];

        let y = linear.forward(array![[1.0, 2.0, 3.0]].view()).unwrap();
        assert_eq!(y, array![[-2.0, 4.0]]);
        assert!(linear.forward(array![[1.0, 2.0]].view()).is_err());
    }

    #[test]
    fn test_init_is_seeded_and_bounded() {
        let a = Linear::new(16, 4, &mut seeded_rng(7));
        let b = Linear::new(16, 4, &mut seeded_rng(7));

        assert_eq!(a.weight, b.weight);
        assert!(a.weight.iter().all(|w| w.abs() <= 0.25));
    }

    #[test]
    fn test_conv_output_sizes() {
        let conv = Conv2d::new(2, 3, 3, 2, 1, &mut seeded_rng(0));

        assert_eq!(conv.output_size(7), Some(4));
        assert_eq!(conv.output_size(4), Some(2));
        assert_eq!(conv.output_size(2), Some(1));

        let y = conv.forward(Array4::<f32>::zeros((2, 2, 7, 7)).view()).unwrap();
        assert_eq!(y.dim(), (2, 3, 4, 4));
    }

    #[test]
    fn test_conv_known_values() {
        let mut conv = Conv2d::new(1, 1, 3, 1, 1, &mut seeded_rng(0));
        conv.weight = Array4::ones((1, 1, 3, 3));
        conv.bias = array![0.5];

        let x = Array4::from_shape_vec((1, 1, 2, 2), vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        let y = conv.forward(x.view()).unwrap();

        // every output sees the whole 2x2 input through the padded 3x3 window
        assert_eq!(y, Array4::from_elem((1, 1, 2, 2), 10.5));
    }

    #[test]
    fn test_conv_rejects_wrong_channels() {
        let conv = Conv2d::new(2, 3, 3, 2, 1, &mut seeded_rng(0));
        assert!(conv.forward(Array4::<f32>::zeros((1, 3, 7, 7)).view()).is_err());
    }

    #[test]
    fn test_batch_norm() {
        let mut norm = BatchNorm::new(2);
        norm.running_mean = array![1.0, 0.0];
        norm.running_var = array![4.0 - 1e-5, 1.0 - 1e-5];
        norm.beta = array![0.0, 3.0];

        let y = norm.forward(array![[3.0, 1.0], [5.0, -1.0]]).unwrap();
        let expected = array![[1.0, 4.0], [2.0, 2.0]];
        assert!(y.iter().zip(expected.iter()).all(|(a, b)| (a - b).abs() < 1e-5));

        let x = Array4::<f32>::ones((1, 2, 3, 3));
        assert_eq!(norm.forward(x).unwrap().dim(), (1, 2, 3, 3));
        assert!(norm.forward(Array2::<f32>::zeros((1, 3))).is_err());
    }

    #[test]
    fn test_activations() {
        assert_eq!(relu(array![-1.0, 2.0]), array![0.0, 2.0]);
        assert_eq!(sigmoid(Array1::<f32>::zeros(2)), array![0.5, 0.5]);
        assert_eq!(logistic(0.0), 0.5);
        assert!((logistic(2.0) + logistic(-2.0) - 1.0).abs() < 1e-6);
    }
}
