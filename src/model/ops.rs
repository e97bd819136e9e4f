use ndarray::{concatenate, ArrayD, Axis, IxDyn};
use rayon::prelude::*;

/// Vérifie le rang d'un tenseur avec un message descriptif
pub fn expect_rank(tensor: &ArrayD<f32>, rank: usize, what: &str) -> Result<(), String> {
    if tensor.ndim() != rank {
        return Err(format!(
            "{} doit être un tenseur de rang {} (reçu: rang {}, shape {:?})",
            what,
            rank,
            tensor.ndim(),
            tensor.shape()
        ));
    }
    Ok(())
}

/// Softmax stabilisé le long d'un axe (soustraction du max)
pub fn softmax_axis(tensor: &ArrayD<f32>, axis: usize) -> ArrayD<f32> {
    let mut result = tensor.to_owned();

    result
        .lanes_mut(Axis(axis))
        .into_iter()
        .for_each(|mut lane| {
            // Trouver le max pour la stabilité numérique
            let mut max_val = f32::NEG_INFINITY;
            for &v in lane.iter() {
                max_val = max_val.max(v);
            }

            // Calculer exp et somme
            let mut exp_sum = 0.0;
            for v in lane.iter_mut() {
                *v = (*v - max_val).exp();
                exp_sum += *v;
            }

            // Normaliser
            for v in lane.iter_mut() {
                *v /= exp_sum + 1e-8;
            }
        });

    result
}

/// Normalisation par la somme le long d'un axe: c = r / (somme + epsilon)
pub fn sum_normalize_axis(tensor: &ArrayD<f32>, axis: usize, epsilon: f32) -> ArrayD<f32> {
    let mut result = tensor.to_owned();

    result
        .lanes_mut(Axis(axis))
        .into_iter()
        .for_each(|mut lane| {
            let sum: f32 = lane.iter().sum();
            for v in lane.iter_mut() {
                *v /= sum + epsilon;
            }
        });

    result
}

/// Sigmoïde élément par élément
pub fn sigmoid(tensor: &ArrayD<f32>) -> ArrayD<f32> {
    tensor.mapv(|v| 1.0 / (1.0 + (-v).exp()))
}

/// Somme le long d'un axe en conservant la dimension
pub fn reduce_sum_keepdims(tensor: &ArrayD<f32>, axis: usize) -> ArrayD<f32> {
    tensor.sum_axis(Axis(axis)).insert_axis(Axis(axis))
}

/// Répète un tenseur le long d'un axe de taille 1
pub fn tile_axis(tensor: &ArrayD<f32>, axis: usize, reps: usize) -> Result<ArrayD<f32>, String> {
    if tensor.shape()[axis] != 1 {
        return Err(format!(
            "tile_axis attend une dimension de taille 1 sur l'axe {} (shape {:?})",
            axis,
            tensor.shape()
        ));
    }

    let views: Vec<_> = (0..reps).map(|_| tensor.view()).collect();
    concatenate(Axis(axis), &views).map_err(|e| format!("tile_axis: {}", e))
}

/// Somme des votes pondérée par les coefficients de couplage
///
/// c :: { batch, out_caps, w, h, multiplicité }
/// votes :: { batch, out_caps, w, h, multiplicité, rep0, rep1 }
/// sortie :: { batch, out_caps, w, h, 1, rep0, rep1 }
pub fn weighted_vote_sum(c: &ArrayD<f32>, votes: &ArrayD<f32>) -> Result<ArrayD<f32>, String> {
    expect_rank(votes, 7, "votes")?;
    expect_rank(c, 5, "coefficients")?;

    let vshape = votes.shape().to_vec();
    let (batch, out_caps, width, height, mult) =
        (vshape[0], vshape[1], vshape[2], vshape[3], vshape[4]);
    let (rep0, rep1) = (vshape[5], vshape[6]);

    if c.shape() != &vshape[..5] {
        return Err(format!(
            "coefficients {:?} incompatibles avec les votes {:?}",
            c.shape(),
            votes.shape()
        ));
    }

    let mut poses = ArrayD::<f32>::zeros(IxDyn(&[batch, out_caps, width, height, 1, rep0, rep1]));

    // Parallélisation par batch
    poses
        .axis_iter_mut(Axis(0))
        .into_par_iter()
        .enumerate()
        .for_each(|(b, mut pose_batch)| {
            for o in 0..out_caps {
                for w in 0..width {
                    for h in 0..height {
                        for u in 0..rep0 {
                            for v in 0..rep1 {
                                let mut sum = 0.0;

                                for i in 0..mult {
                                    let coeff = c[[b, o, w, h, i]];
                                    let vote = votes[&[b, o, w, h, i, u, v][..]];
                                    sum += coeff * vote;
                                }

                                pose_batch[&[o, w, h, 0, u, v][..]] = sum;
                            }
                        }
                    }
                }
            }
        });

    Ok(poses)
}

/// Réorganise les poses agrégées vers la convention de sortie de couche
///
/// { batch, out_caps, w, h, 1, rep0, rep1 } -> { batch, w, h, out_caps, rep0, rep1 }
pub fn finalize_poses(poses: &ArrayD<f32>) -> Result<ArrayD<f32>, String> {
    expect_rank(poses, 7, "poses agrégées")?;
    let shape = poses.shape().to_vec();
    if shape[4] != 1 {
        return Err(format!(
            "l'axe de multiplicité des poses agrégées doit être 1 (shape {:?})",
            shape
        ));
    }

    let (batch, out_caps, width, height) = (shape[0], shape[1], shape[2], shape[3]);
    let (rep0, rep1) = (shape[5], shape[6]);

    let mut out = ArrayD::<f32>::zeros(IxDyn(&[batch, width, height, out_caps, rep0, rep1]));

    for b in 0..batch {
        for o in 0..out_caps {
            for w in 0..width {
                for h in 0..height {
                    for u in 0..rep0 {
                        for v in 0..rep1 {
                            out[[b, w, h, o, u, v]] = poses[&[b, o, w, h, 0, u, v][..]];
                        }
                    }
                }
            }
        }
    }

    Ok(out)
}

/// Réorganise les probabilités vers la convention de sortie de couche
///
/// { batch, out_caps, w, h, 1 } -> { batch, w, h, out_caps }
pub fn finalize_probabilities(probabilities: &ArrayD<f32>) -> Result<ArrayD<f32>, String> {
    expect_rank(probabilities, 5, "probabilités")?;
    let shape = probabilities.shape().to_vec();
    if shape[4] != 1 {
        return Err(format!(
            "l'axe de multiplicité des probabilités doit être 1 (shape {:?})",
            shape
        ));
    }

    let (batch, out_caps, width, height) = (shape[0], shape[1], shape[2], shape[3]);

    let mut out = ArrayD::<f32>::zeros(IxDyn(&[batch, width, height, out_caps]));

    for b in 0..batch {
        for o in 0..out_caps {
            for w in 0..width {
                for h in 0..height {
                    out[[b, w, h, o]] = probabilities[[b, o, w, h, 0]];
                }
            }
        }
    }

    Ok(out)
}
