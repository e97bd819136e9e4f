use ndarray::{ArrayD, IxDyn};

use super::ops::expect_rank;
use super::variables::{Initializer, ParamStore};

/// Fonction de comparaison paire à paire sur les poses
///
/// Réduit les axes de représentation: { b, o, w, h, i, rep0, rep1 } x 2
/// -> { b, o, w, h, i }
pub trait Metric: Send + Sync {
    fn name(&self) -> &str;
    fn take(&self, a: &ArrayD<f32>, b: &ArrayD<f32>) -> Result<ArrayD<f32>, String>;
}

/// Noyau de similarité, même contrat de forme que Metric mais avec accès
/// au registre de paramètres (les mélanges de noyaux sont appris)
pub trait Kernel: Send + Sync {
    fn name(&self) -> &str;
    fn take(
        &self,
        params: &mut ParamStore,
        a: &ArrayD<f32>,
        b: &ArrayD<f32>,
    ) -> Result<ArrayD<f32>, String>;
}

fn check_pair(a: &ArrayD<f32>, b: &ArrayD<f32>, what: &str) -> Result<(), String> {
    expect_rank(a, 7, what)?;
    expect_rank(b, 7, what)?;
    if a.shape() != b.shape() {
        return Err(format!(
            "{}: les deux opérandes doivent avoir la même shape ({:?} vs {:?})",
            what,
            a.shape(),
            b.shape()
        ));
    }
    Ok(())
}

/// Réduction des axes de représentation par une fonction d'accumulation
fn rep_reduce<F>(a: &ArrayD<f32>, b: &ArrayD<f32>, accumulate: F) -> ArrayD<f32>
where
    F: Fn(f32, f32) -> f32,
{
    let shape = a.shape().to_vec();
    let (batch, out_caps, width, height, mult) =
        (shape[0], shape[1], shape[2], shape[3], shape[4]);
    let (rep0, rep1) = (shape[5], shape[6]);

    let mut out = ArrayD::<f32>::zeros(IxDyn(&[batch, out_caps, width, height, mult]));

    for bb in 0..batch {
        for o in 0..out_caps {
            for w in 0..width {
                for h in 0..height {
                    for i in 0..mult {
                        let mut acc = 0.0;
                        for u in 0..rep0 {
                            for v in 0..rep1 {
                                let idx = [bb, o, w, h, i, u, v];
                                acc += accumulate(a[&idx[..]], b[&idx[..]]);
                            }
                        }
                        out[[bb, o, w, h, i]] = acc;
                    }
                }
            }
        }
    }

    out
}

/// Distance euclidienne au carré entre poses
pub struct SquaredDistanceMetric;

impl Metric for SquaredDistanceMetric {
    fn name(&self) -> &str {
        "squared_distance"
    }

    fn take(&self, a: &ArrayD<f32>, b: &ArrayD<f32>) -> Result<ArrayD<f32>, String> {
        check_pair(a, b, "squared_distance")?;
        Ok(rep_reduce(a, b, |x, y| (x - y) * (x - y)))
    }
}

/// Accord par produit scalaire des représentations
pub struct DotProductKernel;

impl Kernel for DotProductKernel {
    fn name(&self) -> &str {
        "dotprod"
    }

    fn take(
        &self,
        _params: &mut ParamStore,
        a: &ArrayD<f32>,
        b: &ArrayD<f32>,
    ) -> Result<ArrayD<f32>, String> {
        check_pair(a, b, "dotprod")?;
        Ok(rep_reduce(a, b, |x, y| x * y))
    }
}

/// Le produit scalaire est aussi une métrique valide
impl Metric for DotProductKernel {
    fn name(&self) -> &str {
        "dotprod"
    }

    fn take(&self, a: &ArrayD<f32>, b: &ArrayD<f32>) -> Result<ArrayD<f32>, String> {
        check_pair(a, b, "dotprod")?;
        Ok(rep_reduce(a, b, |x, y| x * y))
    }
}

/// Noyau gaussien exp(-||a - b||² / (2 γ²))
pub struct GaussianKernel {
    pub gamma: f32,
}

impl GaussianKernel {
    pub fn new(gamma: f32) -> Self {
        Self { gamma }
    }
}

impl Kernel for GaussianKernel {
    fn name(&self) -> &str {
        "gaussian"
    }

    fn take(
        &self,
        _params: &mut ParamStore,
        a: &ArrayD<f32>,
        b: &ArrayD<f32>,
    ) -> Result<ArrayD<f32>, String> {
        check_pair(a, b, "gaussian")?;
        let dist = rep_reduce(a, b, |x, y| (x - y) * (x - y));
        let denom = 2.0 * self.gamma * self.gamma;
        Ok(dist.mapv(|d| (-d / denom).exp()))
    }
}

/// Mélange de noyaux pondéré par des coefficients appris (softmax)
pub struct KernelMix {
    kernels: Vec<Box<dyn Kernel>>,
    name: String,
}

impl KernelMix {
    pub fn new(kernels: Vec<Box<dyn Kernel>>, name: &str) -> Result<Self, String> {
        if kernels.is_empty() {
            return Err("KernelMix requiert au moins un noyau".to_string());
        }
        Ok(Self {
            name: format!("kernelmix{}{}", kernels.len(), name),
            kernels,
        })
    }
}

impl Kernel for KernelMix {
    fn name(&self) -> &str {
        &self.name
    }

    fn take(
        &self,
        params: &mut ParamStore,
        a: &ArrayD<f32>,
        b: &ArrayD<f32>,
    ) -> Result<ArrayD<f32>, String> {
        check_pair(a, b, "kernelmix")?;

        let mut components = Vec::with_capacity(self.kernels.len());
        for kernel in &self.kernels {
            components.push(kernel.take(params, a, b)?);
        }

        // Coefficients de mélange appris, normalisés par softmax
        let raw = params.weight_variable(
            &[self.kernels.len()],
            "mixing_coefficients",
            Initializer::Ones,
        );

        let max_val = raw.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
        let exps: Vec<f32> = raw.iter().map(|&v| (v - max_val).exp()).collect();
        let exp_sum: f32 = exps.iter().sum();

        let mut mixed = ArrayD::<f32>::zeros(components[0].raw_dim());
        for (component, &e) in components.iter().zip(exps.iter()) {
            mixed = mixed + component * (e / exp_sum);
        }

        Ok(mixed)
    }
}

/// Mélange d'un même noyau répété `degree` fois
pub struct MonoKernelMix;

impl MonoKernelMix {
    pub fn new<K>(make_kernel: K, degree: usize, name: &str) -> Result<KernelMix, String>
    where
        K: Fn() -> Box<dyn Kernel>,
    {
        if degree == 0 {
            return Err("MonoKernelMix requiert un degré >= 1".to_string());
        }
        let kernels = (0..degree).map(|_| make_kernel()).collect();
        KernelMix::new(kernels, &format!("monokernel{}", name))
    }
}
