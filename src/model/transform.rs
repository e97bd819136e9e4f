use ndarray::{ArrayD, IxDyn};

use super::ops::expect_rank;
use super::variables::{Initializer, ParamStore};

/// Transformation des poses d'un champ réceptif en votes par capsule de sortie
///
/// poses :: { batch, new_w, new_h, multiplicité, rep0, rep1 }
/// activations :: { batch, new_w, new_h, multiplicité }
/// -> votes :: { batch, out_caps, new_w, new_h, multiplicité, rep0, rep1 }
///    activations :: { batch, out_caps, new_w, new_h, multiplicité }
pub trait Transform: Send + Sync {
    fn translate(
        &mut self,
        poses: &ArrayD<f32>,
        activations: &ArrayD<f32>,
    ) -> Result<(ArrayD<f32>, ArrayD<f32>), String>;
}

/// Transformation linéaire apprise: une matrice par (capsule de sortie, slot)
/// appliquée à droite de la représentation de pose
pub struct LinearTransform {
    output_capsules: usize,
    store: ParamStore,
}

impl LinearTransform {
    pub fn new(output_capsules: usize, seed: u64) -> Self {
        Self {
            output_capsules,
            store: ParamStore::new("LinearTransform", seed),
        }
    }
}

impl Transform for LinearTransform {
    fn translate(
        &mut self,
        poses: &ArrayD<f32>,
        activations: &ArrayD<f32>,
    ) -> Result<(ArrayD<f32>, ArrayD<f32>), String> {
        expect_rank(poses, 6, "poses du champ réceptif")?;
        expect_rank(activations, 4, "activations du champ réceptif")?;

        let pshape = poses.shape().to_vec();
        let (batch, width, height, mult) = (pshape[0], pshape[1], pshape[2], pshape[3]);
        let (rep0, rep1) = (pshape[4], pshape[5]);

        if activations.shape() != &pshape[..4] {
            return Err(format!(
                "activations {:?} incompatibles avec les poses {:?}",
                activations.shape(),
                poses.shape()
            ));
        }

        let out_caps = self.output_capsules;

        // Une matrice rep1 x rep1 par (capsule de sortie, slot d'entrée)
        let weights = self.store.weight_variable(
            &[out_caps, mult, rep1, rep1],
            "vote_transform",
            Initializer::He(rep1),
        );

        let mut votes =
            ArrayD::<f32>::zeros(IxDyn(&[batch, out_caps, width, height, mult, rep0, rep1]));

        for b in 0..batch {
            for o in 0..out_caps {
                for w in 0..width {
                    for h in 0..height {
                        for i in 0..mult {
                            for u in 0..rep0 {
                                for v2 in 0..rep1 {
                                    let mut sum = 0.0;
                                    for v in 0..rep1 {
                                        sum += poses[&[b, w, h, i, u, v][..]]
                                            * weights[[o, i, v, v2]];
                                    }
                                    votes[&[b, o, w, h, i, u, v2][..]] = sum;
                                }
                            }
                        }
                    }
                }
            }
        }

        // Les activations sont diffusées vers chaque capsule de sortie
        let mut tiled = ArrayD::<f32>::zeros(IxDyn(&[batch, out_caps, width, height, mult]));
        for b in 0..batch {
            for o in 0..out_caps {
                for w in 0..width {
                    for h in 0..height {
                        for i in 0..mult {
                            tiled[[b, o, w, h, i]] = activations[[b, w, h, i]];
                        }
                    }
                }
            }
        }

        Ok((votes, tiled))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_translate_shapes() {
        let mut transform = LinearTransform::new(3, 11);
        let poses = ArrayD::ones(IxDyn(&[2, 2, 2, 4, 4, 4]));
        let activations = ArrayD::ones(IxDyn(&[2, 2, 2, 4]));

        let (votes, acts) = transform.translate(&poses, &activations).unwrap();

        assert_eq!(votes.shape(), &[2, 3, 2, 2, 4, 4, 4]);
        assert_eq!(acts.shape(), &[2, 3, 2, 2, 4]);
    }

    #[test]
    fn test_translate_reuses_weights() {
        let mut transform = LinearTransform::new(2, 11);
        let poses = ArrayD::ones(IxDyn(&[1, 1, 1, 2, 2, 2]));
        let activations = ArrayD::ones(IxDyn(&[1, 1, 1, 2]));

        let (v1, _) = transform.translate(&poses, &activations).unwrap();
        let (v2, _) = transform.translate(&poses, &activations).unwrap();

        // Même registre, même matrice: votes identiques
        assert_eq!(v1, v2);
    }

    #[test]
    fn test_translate_rejects_bad_rank() {
        let mut transform = LinearTransform::new(2, 11);
        let poses = ArrayD::ones(IxDyn(&[1, 1, 2, 2, 2]));
        let activations = ArrayD::ones(IxDyn(&[1, 1, 1, 2]));

        assert!(transform.translate(&poses, &activations).is_err());
    }
}
