use ndarray::{Array4, ArrayView4, Axis};
use ndarray_rand::rand_distr::Uniform;
use ndarray_rand::RandomExt;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rayon::prelude::*;

use super::config::{Activation, Padding};

/// Couche de convolution 2D, passe avant uniquement, disposition { b, h, w, c }
pub struct ConvLayer {
    pub weights: Array4<f32>,
    pub biases: Vec<f32>,
    pub stride: usize,
    pub padding: Padding,
    pub activation: Activation,
}

impl ConvLayer {
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        stride: usize,
        padding: Padding,
        activation: Activation,
        seed: u64,
    ) -> Self {
        // Initialisation He
        let scale = (2.0 / (in_channels * kernel_size * kernel_size) as f32).sqrt();
        let mut rng = StdRng::seed_from_u64(seed);
        let weights = Array4::random_using(
            (out_channels, in_channels, kernel_size, kernel_size),
            Uniform::new(-scale, scale),
            &mut rng,
        );

        Self {
            weights,
            biases: vec![0.0; out_channels],
            stride,
            padding,
            activation,
        }
    }

    pub fn forward(&self, input: &ArrayView4<f32>) -> Result<Array4<f32>, String> {
        let (batch_size, in_height, in_width, in_channels) = input.dim();
        let (out_channels, _, kernel_size, _) = self.weights.dim();

        let (out_height, pad_h) = conv_extent(in_height, kernel_size, self.stride, self.padding)?;
        let (out_width, pad_w) = conv_extent(in_width, kernel_size, self.stride, self.padding)?;

        let mut output = Array4::zeros((batch_size, out_height, out_width, out_channels));

        // Convolution parallélisée par batch
        output
            .axis_iter_mut(Axis(0))
            .into_par_iter()
            .enumerate()
            .for_each(|(b, mut out_batch)| {
                for oh in 0..out_height {
                    for ow in 0..out_width {
                        for oc in 0..out_channels {
                            let mut sum = 0.0;

                            for kh in 0..kernel_size {
                                for kw in 0..kernel_size {
                                    let ih = (oh * self.stride + kh) as isize - pad_h as isize;
                                    let iw = (ow * self.stride + kw) as isize - pad_w as isize;

                                    if ih < 0
                                        || iw < 0
                                        || ih >= in_height as isize
                                        || iw >= in_width as isize
                                    {
                                        continue;
                                    }

                                    for ic in 0..in_channels {
                                        sum += input[[b, ih as usize, iw as usize, ic]]
                                            * self.weights[[oc, ic, kh, kw]];
                                    }
                                }
                            }

                            out_batch[[oh, ow, oc]] = sum + self.biases[oc];
                        }
                    }
                }
            });

        Ok(apply_activation(&output, self.activation))
    }
}

/// Taille de sortie et remplissage avant d'un axe spatial balayé par fenêtre
pub fn conv_extent(
    input: usize,
    kernel: usize,
    stride: usize,
    padding: Padding,
) -> Result<(usize, usize), String> {
    match padding {
        Padding::Valid => {
            if kernel > input {
                return Err(format!(
                    "noyau {} plus grand que l'axe d'entrée {} en remplissage VALID",
                    kernel, input
                ));
            }
            Ok(((input - kernel) / stride + 1, 0))
        }
        Padding::Same => {
            let out = (input + stride - 1) / stride;
            let pad_total = ((out - 1) * stride + kernel).saturating_sub(input);
            Ok((out, pad_total / 2))
        }
    }
}

pub fn apply_activation(x: &Array4<f32>, activation: Activation) -> Array4<f32> {
    match activation {
        Activation::ReLU => x.mapv(|v| v.max(0.0)),
        Activation::LeakyReLU(alpha) => x.mapv(|v| if v > 0.0 { v } else { alpha * v }),
        Activation::Sigmoid => x.mapv(|v| 1.0 / (1.0 + (-v).exp())),
        Activation::Tanh => x.mapv(|v| v.tanh()),
        Activation::None => x.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array4;

    #[test]
    fn test_valid_padding_shrinks_output() {
        let conv = ConvLayer::new(1, 4, 3, 1, Padding::Valid, Activation::ReLU, 0);
        let input = Array4::ones((1, 8, 8, 1));

        let output = conv.forward(&input.view()).unwrap();

        assert_eq!(output.dim(), (1, 6, 6, 4));
    }

    #[test]
    fn test_same_padding_preserves_extent() {
        let conv = ConvLayer::new(2, 3, 3, 1, Padding::Same, Activation::None, 0);
        let input = Array4::ones((2, 5, 5, 2));

        let output = conv.forward(&input.view()).unwrap();

        assert_eq!(output.dim(), (2, 5, 5, 3));
    }

    #[test]
    fn test_stride_two() {
        let conv = ConvLayer::new(1, 1, 3, 2, Padding::Same, Activation::None, 0);
        let input = Array4::ones((1, 8, 8, 1));

        let output = conv.forward(&input.view()).unwrap();

        assert_eq!(output.dim(), (1, 4, 4, 1));
    }

    #[test]
    fn test_sigmoid_bounds_output() {
        let conv = ConvLayer::new(1, 2, 3, 1, Padding::Same, Activation::Sigmoid, 1);
        let input = Array4::from_elem((1, 4, 4, 1), 3.0);

        let output = conv.forward(&input.view()).unwrap();

        assert!(output.iter().all(|&v| v > 0.0 && v < 1.0));
    }

    #[test]
    fn test_valid_padding_rejects_kernel_larger_than_input() {
        let conv = ConvLayer::new(1, 2, 3, 1, Padding::Valid, Activation::None, 0);
        let input = Array4::ones((1, 2, 2, 1));

        assert!(conv.forward(&input.view()).is_err());
    }

    #[test]
    fn test_same_padding_accepts_kernel_larger_than_input() {
        let conv = ConvLayer::new(1, 1, 3, 1, Padding::Same, Activation::None, 0);
        let input = Array4::ones((1, 2, 2, 1));

        let output = conv.forward(&input.view()).unwrap();

        assert_eq!(output.dim(), (1, 2, 2, 1));
    }
}
