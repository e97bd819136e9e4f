use ndarray::{ArrayD, Ix4, IxDyn};

use super::config::{Activation, Padding};
use super::layers::{conv_extent, ConvLayer};
use super::ops::expect_rank;
use super::routing::Routing;
use super::transform::Transform;

/// Vérifie le contrat de frontière d'un couple (poses, activations):
/// poses rang 6 { batch, w, h, profondeur, rep0, rep1 },
/// activations rang 4 avec les quatre premiers axes identiques
fn check_pair(poses: &ArrayD<f32>, activations: &ArrayD<f32>, what: &str) -> Result<(), String> {
    expect_rank(poses, 6, &format!("poses {}", what))?;
    expect_rank(activations, 4, &format!("activations {}", what))?;

    if poses.shape()[..4] != activations.shape()[..4] {
        return Err(format!(
            "{}: poses {:?} et activations {:?} incompatibles sur batch/w/h/profondeur",
            what,
            poses.shape(),
            activations.shape()
        ));
    }

    Ok(())
}

/// Couche de capsules convolutive: champ réceptif, transformation en votes,
/// puis routage par accord
pub struct CapsuleLayer {
    routing: Box<dyn Routing>,
    transform: Box<dyn Transform>,
    kernel_size: usize,
    stride: usize,
    padding: Padding,
    iterations: usize,
    pub name: String,
}

impl CapsuleLayer {
    pub fn new(
        routing: Box<dyn Routing>,
        transform: Box<dyn Transform>,
        kernel_size: usize,
        stride: usize,
        padding: Padding,
        iterations: usize,
        name: &str,
    ) -> Result<Self, String> {
        if kernel_size == 0 || stride == 0 {
            return Err("kernel_size et stride doivent être >= 1".to_string());
        }

        Ok(Self {
            routing,
            transform,
            kernel_size,
            stride,
            padding,
            iterations,
            name: format!("CapsuleLayer{}", name),
        })
    }

    /// Empile les fenêtres glissantes de poses et d'activations
    ///
    /// poses { b, w, h, d, rep0, rep1 } -> { b, new_w, new_h, d * k², rep0, rep1 }
    /// activations { b, w, h, d } -> { b, new_w, new_h, d * k² }
    ///
    /// Un emplacement de fenêtre (kw, kh, d) hors image (remplissage SAME)
    /// reste à zéro.
    fn receptive_field(
        &self,
        poses: &ArrayD<f32>,
        activations: &ArrayD<f32>,
    ) -> Result<(ArrayD<f32>, ArrayD<f32>), String> {
        let pshape = poses.shape().to_vec();
        let (batch, width, height, depth) = (pshape[0], pshape[1], pshape[2], pshape[3]);
        let (rep0, rep1) = (pshape[4], pshape[5]);
        let k = self.kernel_size;

        let (new_w, pad_w) = conv_extent(width, k, self.stride, self.padding)
            .map_err(|e| format!("{}: {}", self.name, e))?;
        let (new_h, pad_h) = conv_extent(height, k, self.stride, self.padding)
            .map_err(|e| format!("{}: {}", self.name, e))?;
        let slots = depth * k * k;

        let mut patched_poses =
            ArrayD::<f32>::zeros(IxDyn(&[batch, new_w, new_h, slots, rep0, rep1]));
        let mut patched_activations = ArrayD::<f32>::zeros(IxDyn(&[batch, new_w, new_h, slots]));

        for b in 0..batch {
            for nw in 0..new_w {
                for nh in 0..new_h {
                    for kw in 0..k {
                        for kh in 0..k {
                            let iw = (nw * self.stride + kw) as isize - pad_w as isize;
                            let ih = (nh * self.stride + kh) as isize - pad_h as isize;

                            if iw < 0 || ih < 0 || iw >= width as isize || ih >= height as isize {
                                continue;
                            }
                            let (iw, ih) = (iw as usize, ih as usize);

                            for d in 0..depth {
                                let slot = (kw * k + kh) * depth + d;

                                patched_activations[[b, nw, nh, slot]] =
                                    activations[[b, iw, ih, d]];
                                for u in 0..rep0 {
                                    for v in 0..rep1 {
                                        patched_poses[&[b, nw, nh, slot, u, v][..]] =
                                            poses[&[b, iw, ih, d, u, v][..]];
                                    }
                                }
                            }
                        }
                    }
                }
            }
        }

        Ok((patched_poses, patched_activations))
    }

    /// Passe avant: poses et activations de bas niveau vers poses et
    /// activations de plus haut niveau
    pub fn inference(
        &mut self,
        poses: &ArrayD<f32>,
        activations: &ArrayD<f32>,
    ) -> Result<(ArrayD<f32>, ArrayD<f32>), String> {
        check_pair(poses, activations, "d'entrée")?;

        let batch = poses.shape()[0];

        let (patched_poses, patched_activations) = self.receptive_field(poses, activations)?;

        let (votes, vote_activations) = self
            .transform
            .translate(&patched_poses, &patched_activations)?;

        let (higher_poses, higher_activations) =
            self.routing.fit(&votes, &vote_activations, self.iterations)?;

        // Le contrat de sortie est symétrique au contrat d'entrée
        check_pair(&higher_poses, &higher_activations, "de sortie")?;
        if higher_poses.shape()[0] != batch {
            return Err(format!(
                "{}: batch non préservé ({} -> {})",
                self.name,
                batch,
                higher_poses.shape()[0]
            ));
        }

        Ok((higher_poses, higher_activations))
    }

    pub fn routing(&self) -> &dyn Routing {
        self.routing.as_ref()
    }
}

/// Couche de capsules entièrement connectée: toutes les positions spatiales
/// sont aplaties en un seul groupe avant l'inférence convolutive 1x1
pub struct FullyConnectedCapsuleLayer {
    inner: CapsuleLayer,
}

impl FullyConnectedCapsuleLayer {
    pub fn new(
        routing: Box<dyn Routing>,
        transform: Box<dyn Transform>,
        iterations: usize,
        name: &str,
    ) -> Result<Self, String> {
        let inner = CapsuleLayer::new(
            routing,
            transform,
            1,
            1,
            Padding::Valid,
            iterations,
            &format!("FullyConnected/{}", name),
        )?;
        Ok(Self { inner })
    }

    pub fn inference(
        &mut self,
        poses: &ArrayD<f32>,
        activations: &ArrayD<f32>,
    ) -> Result<(ArrayD<f32>, ArrayD<f32>), String> {
        check_pair(poses, activations, "d'entrée")?;

        let pshape = poses.shape().to_vec();
        let (batch, width, height, depth) = (pshape[0], pshape[1], pshape[2], pshape[3]);
        let (rep0, rep1) = (pshape[4], pshape[5]);
        let flat = width * height * depth;

        let poses = poses
            .to_owned()
            .into_shape(IxDyn(&[batch, 1, 1, flat, rep0, rep1]))
            .map_err(|e| format!("aplatissement des poses: {}", e))?;
        let activations = activations
            .to_owned()
            .into_shape(IxDyn(&[batch, 1, 1, flat]))
            .map_err(|e| format!("aplatissement des activations: {}", e))?;

        self.inner.inference(&poses, &activations)
    }

    pub fn routing(&self) -> &dyn Routing {
        self.inner.routing()
    }
}

/// Couche terminale de classification: une paire (pose, activation) par
/// classe, activations optionnellement normalisées en distribution
pub struct CapsuleClassLayer {
    normalized: bool,
    pub name: String,
}

impl CapsuleClassLayer {
    pub fn new(normalized: bool, name: &str) -> Self {
        Self {
            normalized,
            name: format!("toClassLayer/{}", name),
        }
    }

    /// poses { b, w, h, d, rep0, rep1 } -> { b, w*h*d, rep0, rep1 }
    /// activations { b, w, h, d } -> { b, w*h*d }
    pub fn inference(
        &self,
        poses: &ArrayD<f32>,
        activations: &ArrayD<f32>,
    ) -> Result<(ArrayD<f32>, ArrayD<f32>), String> {
        check_pair(poses, activations, "d'entrée")?;

        let pshape = poses.shape().to_vec();
        let (batch, flat) = (pshape[0], pshape[1] * pshape[2] * pshape[3]);
        let (rep0, rep1) = (pshape[4], pshape[5]);

        let poses = poses
            .to_owned()
            .into_shape(IxDyn(&[batch, flat, rep0, rep1]))
            .map_err(|e| format!("aplatissement des poses: {}", e))?;
        let mut activations = activations
            .to_owned()
            .into_shape(IxDyn(&[batch, flat]))
            .map_err(|e| format!("aplatissement des activations: {}", e))?;

        if self.normalized {
            activations = super::ops::softmax_axis(&activations, 1);
        }

        Ok((poses, activations))
    }
}

/// Première couche: convertit une carte de caractéristiques brute en
/// capsules initiales par deux convolutions parallèles
pub struct PrimaryCapsuleLayer {
    groups: usize,
    pose_dim: (usize, usize),
    conv_pose: ConvLayer,
    conv_activation: ConvLayer,
}

impl PrimaryCapsuleLayer {
    pub fn new(
        in_channels: usize,
        groups: usize,
        pose_dim: (usize, usize),
        kernel_size: usize,
        seed: u64,
    ) -> Self {
        let conv_pose = ConvLayer::new(
            in_channels,
            groups * pose_dim.0 * pose_dim.1,
            kernel_size,
            1,
            Padding::Same,
            Activation::ReLU,
            seed,
        );
        let conv_activation = ConvLayer::new(
            in_channels,
            groups,
            kernel_size,
            1,
            Padding::Same,
            Activation::Sigmoid,
            seed.wrapping_add(1),
        );

        Self {
            groups,
            pose_dim,
            conv_pose,
            conv_activation,
        }
    }

    /// input { b, w, h, canaux } -> poses { b, w, h, groups, rep0, rep1 },
    /// activations { b, w, h, groups }
    pub fn inference(&self, input: &ArrayD<f32>) -> Result<(ArrayD<f32>, ArrayD<f32>), String> {
        expect_rank(input, 4, "carte de caractéristiques")?;

        let input = input
            .to_owned()
            .into_dimensionality::<Ix4>()
            .map_err(|e| format!("carte de caractéristiques: {}", e))?;

        let raw_poses = self.conv_pose.forward(&input.view())?;
        let activations = self.conv_activation.forward(&input.view())?;

        let (batch, width, height, _) = raw_poses.dim();
        let poses = raw_poses
            .into_dyn()
            .into_shape(IxDyn(&[
                batch,
                width,
                height,
                self.groups,
                self.pose_dim.0,
                self.pose_dim.1,
            ]))
            .map_err(|e| format!("mise en forme des poses primaires: {}", e))?;

        Ok((poses, activations.into_dyn()))
    }
}
