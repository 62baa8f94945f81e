// Convolution layer with a tied-weight transposed pass.
//
// The forward pass is candle_nn's `Conv2d` over the (seq, pitch) plane,
// optionally batch-normalised, then activated. The deconvolution pass feeds
// the same kernel to `conv_transpose2d`, which is the adjoint of the forward
// correlation: the decoder maps a code back to the encoder input's shape
// without parameters of its own beyond a per-channel bias.
//
// Weights are drawn from the caller's `ComposerRng`. Dropout masks come from
// candle's own generator and only apply in training passes.

use super::activation::Activation;
use super::{gaussian_var, zeros_var};
use crate::error::{ComposerError, Result};
use candle_core::{DType, Device, Module, ModuleT, Tensor, Var};
use candle_nn::{BatchNorm, Conv2d, Conv2dConfig};
use composer_prng::ComposerRng;

const BATCH_NORM_EPS: f64 = 1e-5;

/// Shape and initialisation of one convolution layer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CnnGraph {
    pub activation: Activation,
    pub filter_num: usize,
    pub channel: usize,
    pub kernel_size: usize,
    /// Std of the initial Gaussian weights.
    pub scale: f64,
    pub stride: usize,
    pub pad: usize,
    pub batch_norm: bool,
}

impl CnnGraph {
    pub fn new(
        activation: Activation,
        filter_num: usize,
        channel: usize,
        kernel_size: usize,
        scale: f64,
        stride: usize,
        pad: usize,
    ) -> Self {
        CnnGraph {
            activation,
            filter_num,
            channel,
            kernel_size,
            scale,
            stride,
            pad,
            batch_norm: false,
        }
    }

    pub fn with_batch_norm(mut self) -> Self {
        self.batch_norm = true;
        self
    }

    /// Output spatial size for an input of `size`, if the kernel fits.
    pub fn output_size(&self, size: usize) -> Option<usize> {
        let padded = size + 2 * self.pad;
        (padded >= self.kernel_size).then(|| (padded - self.kernel_size) / self.stride + 1)
    }

    /// Size `conv_transpose2d` produces from `size` without output padding.
    fn transposed_size(&self, size: usize) -> Option<usize> {
        ((size.max(1) - 1) * self.stride + self.kernel_size).checked_sub(2 * self.pad)
    }
}

/// Per-channel batch normalisation with learnable scale and shift.
#[derive(Debug)]
struct Norm {
    layer: BatchNorm,
    gamma: Var,
    beta: Var,
}

impl Norm {
    fn new(features: usize) -> Result<Self> {
        let gamma = Var::ones(features, DType::F32, &Device::Cpu)?;
        let beta = zeros_var(features)?;
        let layer = BatchNorm::new(
            features,
            Tensor::zeros(features, DType::F32, &Device::Cpu)?,
            Tensor::ones(features, DType::F32, &Device::Cpu)?,
            gamma.as_tensor().clone(),
            beta.as_tensor().clone(),
            BATCH_NORM_EPS,
        )?;
        Ok(Norm { layer, gamma, beta })
    }
}

/// A convolution layer and its parameters.
#[derive(Debug)]
pub struct ConvolutionLayer {
    pub graph: CnnGraph,
    conv: Conv2d,
    weight: Var,
    bias: Var,
    /// One per input channel, used by the deconvolution pass.
    deconv_bias: Var,
    norm: Option<Norm>,
    dropout_rate: f64,
}

impl ConvolutionLayer {
    pub fn new(graph: CnnGraph, rng: &mut ComposerRng) -> Result<Self> {
        let weight = gaussian_var(
            &[
                graph.filter_num,
                graph.channel,
                graph.kernel_size,
                graph.kernel_size,
            ],
            graph.scale,
            rng,
        )?;
        let bias = zeros_var(graph.filter_num)?;
        let deconv_bias = zeros_var(graph.channel)?;
        let conv = Conv2d::new(
            weight.as_tensor().clone(),
            Some(bias.as_tensor().clone()),
            Conv2dConfig {
                padding: graph.pad,
                stride: graph.stride,
                ..Default::default()
            },
        );
        let norm = if graph.batch_norm {
            Some(Norm::new(graph.filter_num)?)
        } else {
            None
        };
        Ok(ConvolutionLayer {
            graph,
            conv,
            weight,
            bias,
            deconv_bias,
            norm,
            dropout_rate: 0.0,
        })
    }

    pub fn set_dropout_rate(&mut self, rate: f64) {
        self.dropout_rate = rate;
    }

    /// Every trainable variable of the layer.
    pub fn vars(&self) -> Vec<Var> {
        let mut vars = vec![
            self.weight.clone(),
            self.bias.clone(),
            self.deconv_bias.clone(),
        ];
        if let Some(norm) = &self.norm {
            vars.push(norm.gamma.clone());
            vars.push(norm.beta.clone());
        }
        vars
    }

    /// `[filter_num, channel, kernel_size, kernel_size]`.
    pub fn weight(&self) -> &Tensor {
        self.weight.as_tensor()
    }

    /// Output shape for an input of `shape`.
    pub fn output_shape(&self, shape: [usize; 4]) -> Result<[usize; 4]> {
        let [batch, channels, rows, cols] = shape;
        let mismatch = || ComposerError::ShapeMismatch {
            context: "ConvolutionLayer input",
            expected: vec![batch, self.graph.channel, rows, cols],
            actual: shape.to_vec(),
        };
        if channels != self.graph.channel {
            return Err(mismatch());
        }
        let out_h = self.graph.output_size(rows).ok_or_else(mismatch)?;
        let out_w = self.graph.output_size(cols).ok_or_else(mismatch)?;
        Ok([batch, self.graph.filter_num, out_h, out_w])
    }

    /// Convolution, optional batch norm, activation and (in training)
    /// dropout. Batch norm uses batch statistics when `train` and the
    /// running statistics otherwise.
    pub fn forward_t(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let (n, c, h, w) = x.dims4()?;
        self.output_shape([n, c, h, w])?;
        let mut z = self.conv.forward(x)?;
        if let Some(norm) = &self.norm {
            z = norm.layer.forward_t(&z, train)?;
        }
        let a = self.graph.activation.apply(&z)?;
        if train && self.dropout_rate > 0.0 {
            Ok(candle_nn::ops::dropout(&a, self.dropout_rate as f32)?)
        } else {
            Ok(a)
        }
    }

    /// Transposed convolution with the forward kernel, back to a
    /// `[N, channel, rows, cols]` map, then activation.
    pub fn deconvolve(&self, code: &Tensor, (rows, cols): (usize, usize)) -> Result<Tensor> {
        let (n, filters, h, w) = code.dims4()?;
        let mismatch = || ComposerError::ShapeMismatch {
            context: "ConvolutionLayer::deconvolve",
            expected: vec![n, self.graph.filter_num, h, w],
            actual: vec![n, filters, h, w],
        };
        if filters != self.graph.filter_num {
            return Err(mismatch());
        }
        let extra = |size: usize, target: usize| {
            self.graph
                .transposed_size(size)
                .and_then(|base| target.checked_sub(base))
                .filter(|&extra| extra < self.graph.stride.max(1))
        };
        let output_padding = match (extra(h, rows), extra(w, cols)) {
            (Some(a), Some(b)) if a == b => a,
            _ => {
                return Err(ComposerError::ShapeMismatch {
                    context: "ConvolutionLayer::deconvolve target",
                    expected: vec![rows, cols],
                    actual: vec![
                        self.graph.transposed_size(h).unwrap_or(0),
                        self.graph.transposed_size(w).unwrap_or(0),
                    ],
                });
            }
        };
        let v = code
            .conv_transpose2d(
                self.weight.as_tensor(),
                self.graph.pad,
                output_padding,
                self.graph.stride,
                1,
            )?
            .broadcast_add(&self.deconv_bias.reshape((1, self.graph.channel, 1, 1))?)?;
        self.graph.activation.apply(&v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn random_tensor(shape: [usize; 4], rng: &mut ComposerRng) -> Tensor {
        let data: Vec<f32> = (0..shape.iter().product())
            .map(|_| rng.range_f64(-1.0, 1.0) as f32)
            .collect();
        Tensor::from_vec(data, &shape, &Device::Cpu).unwrap()
    }

    fn layer(activation: Activation, stride: usize, pad: usize, seed: u64) -> ConvolutionLayer {
        let graph = CnnGraph::new(activation, 3, 2, 3, 0.3, stride, pad);
        ConvolutionLayer::new(graph, &mut ComposerRng::new(seed)).unwrap()
    }

    fn values(t: &Tensor) -> Vec<f32> {
        t.flatten_all().unwrap().to_vec1::<f32>().unwrap()
    }

    fn dot(a: &Tensor, b: &Tensor) -> f32 {
        (a * b).unwrap().sum_all().unwrap().to_scalar::<f32>().unwrap()
    }

    #[test]
    fn test_same_padding_preserves_shape() {
        let l = layer(Activation::Tanh, 1, 1, 1);
        assert_eq!(l.output_shape([4, 2, 4, 12]).unwrap(), [4, 3, 4, 12]);
        assert!(l.output_shape([4, 5, 4, 12]).is_err());
        let strided = layer(Activation::Tanh, 2, 0, 1);
        assert_eq!(strided.output_shape([1, 2, 7, 9]).unwrap(), [1, 3, 3, 4]);

        let x = random_tensor([4, 2, 4, 12], &mut ComposerRng::new(2));
        assert_eq!(l.forward_t(&x, false).unwrap().dims(), &[4, 3, 4, 12]);
        let wrong = random_tensor([4, 5, 4, 12], &mut ComposerRng::new(2));
        assert!(matches!(
            l.forward_t(&wrong, false),
            Err(ComposerError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_same_seed_same_weights() {
        let a = layer(Activation::Tanh, 1, 1, 5);
        let b = layer(Activation::Tanh, 1, 1, 5);
        let c = layer(Activation::Tanh, 1, 1, 6);
        assert_eq!(values(a.weight()), values(b.weight()));
        assert_ne!(values(a.weight()), values(c.weight()));
        assert_eq!(a.vars().len(), 3);
    }

    #[test]
    fn test_identity_kernel_copies_input() {
        let graph = CnnGraph::new(Activation::Identity, 1, 1, 3, 0.0, 1, 1);
        let l = ConvolutionLayer::new(graph, &mut ComposerRng::new(0)).unwrap();
        let mut kernel = vec![0.0f32; 9];
        kernel[4] = 1.0;
        l.weight
            .set(&Tensor::from_vec(kernel, (1, 1, 3, 3), &Device::Cpu).unwrap())
            .unwrap();
        let x = random_tensor([2, 1, 3, 5], &mut ComposerRng::new(4));
        let y = l.forward_t(&x, false).unwrap();
        assert_eq!(values(&y), values(&x));
    }

    #[test]
    fn test_deconvolution_is_the_adjoint_of_convolution() {
        // With identity activation and zero biases, <conv(x), u> = <x, deconv(u)>.
        for (stride, pad, rows, cols) in [(1, 1, 4, 6), (2, 0, 7, 9)] {
            let l = layer(Activation::Identity, stride, pad, 7);
            let mut rng = ComposerRng::new(11);
            let x = random_tensor([2, 2, rows, cols], &mut rng);
            let y = l.forward_t(&x, false).unwrap();
            let u = random_tensor(l.output_shape([2, 2, rows, cols]).unwrap(), &mut rng);
            let back = l.deconvolve(&u, (rows, cols)).unwrap();
            assert_eq!(back.dims(), x.dims());
            let lhs = dot(&y, &u);
            let rhs = dot(&x, &back);
            assert!((lhs - rhs).abs() < 1e-4, "{lhs} vs {rhs}");
        }
    }

    #[test]
    fn test_deconvolve_rejects_wrong_shapes() {
        let l = layer(Activation::Tanh, 1, 1, 3);
        let code = random_tensor([1, 2, 4, 5], &mut ComposerRng::new(1));
        assert!(l.deconvolve(&code, (4, 5)).is_err());
        let code = random_tensor([1, 3, 4, 5], &mut ComposerRng::new(1));
        assert!(l.deconvolve(&code, (4, 5)).is_ok());
        assert!(l.deconvolve(&code, (9, 5)).is_err());
    }

    #[test]
    fn test_gradients_reach_the_shared_kernel() {
        let l = layer(Activation::Tanh, 1, 1, 9);
        let x = random_tensor([2, 2, 3, 4], &mut ComposerRng::new(2));
        let code = l.forward_t(&x, true).unwrap();
        let back = l.deconvolve(&code, (3, 4)).unwrap();
        let loss = candle_nn::loss::mse(&back, &x).unwrap();
        let grads = loss.backward().unwrap();
        for var in l.vars() {
            let grad = grads.get(var.as_tensor()).expect("every variable takes part");
            assert_eq!(grad.dims(), var.dims());
        }
        let kernel_grad = values(grads.get(l.weight()).unwrap());
        assert!(kernel_grad.iter().any(|g| *g != 0.0));
    }

    #[test]
    fn test_batch_norm_switches_statistics() {
        let graph = CnnGraph::new(Activation::Identity, 2, 1, 3, 0.5, 1, 1).with_batch_norm();
        let l = ConvolutionLayer::new(graph, &mut ComposerRng::new(3)).unwrap();
        assert_eq!(l.vars().len(), 5);
        let x = (random_tensor([4, 1, 4, 6], &mut ComposerRng::new(8)) + 3.0).unwrap();

        // Training: batch statistics, so every channel is centred.
        let train = l.forward_t(&x, true).unwrap();
        let channel_means = train.mean_keepdim(0).unwrap().mean_keepdim(2).unwrap();
        let channel_means = channel_means.mean_keepdim(3).unwrap();
        assert!(values(&channel_means).iter().all(|m| m.abs() < 1e-4));

        // Evaluation: running statistics, which one update has only nudged.
        let eval = l.forward_t(&x, false).unwrap();
        let eval_again = l.forward_t(&x, false).unwrap();
        assert_eq!(values(&eval), values(&eval_again));
        assert_ne!(values(&eval), values(&train));
    }

    #[test]
    fn test_dropout_only_in_training() {
        let mut l = layer(Activation::Identity, 1, 1, 5);
        l.set_dropout_rate(0.5);
        let x = random_tensor([2, 2, 4, 6], &mut ComposerRng::new(1));
        let eval_a = values(&l.forward_t(&x, false).unwrap());
        let eval_b = values(&l.forward_t(&x, false).unwrap());
        assert_eq!(eval_a, eval_b);
        let train = values(&l.forward_t(&x, true).unwrap());
        assert!(train.iter().filter(|&&v| v == 0.0).count() > 0);
    }
}
