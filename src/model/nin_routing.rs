use ndarray::{Array1, Array2, ArrayD, Ix1, Ix2, IxDyn};

use super::config::RoutingConfig;
use super::metric::Metric;
use super::routing::{RoutingProcedure, RoutingRule, RuleState};
use super::variables::{Initializer, ParamStore};

/// Couche dense créée-ou-réutilisée dans le registre de paramètres
fn dense(
    params: &mut ParamStore,
    input: &Array2<f32>,
    units: usize,
    name: &str,
    relu: bool,
) -> Result<Array2<f32>, String> {
    let in_dim = input.ncols();

    let weights = params
        .weight_variable(&[in_dim, units], &format!("{}/w", name), Initializer::He(in_dim))
        .into_dimensionality::<Ix2>()
        .map_err(|e| format!("dense {}: {}", name, e))?;
    let bias = params
        .bias_variable(&[units], &format!("{}/b", name))
        .into_dimensionality::<Ix1>()
        .map_err(|e| format!("dense {}: {}", name, e))?;

    let mut out = input.dot(&weights) + &bias;
    if relu {
        out.mapv_inplace(|v| v.max(0.0));
    }

    Ok(out)
}

/// Règle de routage apprise: de petits réseaux denses remplacent les
/// formules fermées de compatibilité et d'activation
///
/// L'état auxiliaire est un vecteur caché de taille `degree` par
/// (batch, capsule de sortie, position), propagé d'une itération à l'autre.
pub struct NiNRule {
    degree: usize,
    compatibility_layers: Vec<usize>,
    activation_layers: Vec<usize>,
    activate: bool,
    name: String,
}

impl NiNRule {
    pub fn new(
        degree: usize,
        compatibility_layers: Vec<usize>,
        activation_layers: Vec<usize>,
        activate: bool,
        name: &str,
    ) -> Self {
        Self {
            degree,
            compatibility_layers,
            activation_layers,
            activate,
            name: format!("NiNRouting_{}", name),
        }
    }

    /// État caché nul { batch, out_caps, w, h, 1, degree }
    fn zero_state(&self, votes: &ArrayD<f32>) -> ArrayD<f32> {
        let vshape = votes.shape();
        ArrayD::zeros(IxDyn(&[vshape[0], vshape[1], vshape[2], vshape[3], 1, self.degree]))
    }
}

impl RoutingRule for NiNRule {
    fn name(&self) -> &str {
        &self.name
    }

    fn compatibility(
        &mut self,
        params: &mut ParamStore,
        state: RuleState,
        c: Option<&ArrayD<f32>>,
        votes: &ArrayD<f32>,
        poses: Option<&ArrayD<f32>>,
        _probabilities: Option<&ArrayD<f32>>,
        activations: &ArrayD<f32>,
        _it: usize,
    ) -> Result<(ArrayD<f32>, RuleState), String> {
        let vshape = votes.shape().to_vec();
        let (batch, out_caps, width, height, mult) =
            (vshape[0], vshape[1], vshape[2], vshape[3], vshape[4]);
        let rep_len = vshape[5] * vshape[6];

        let poses = poses.ok_or_else(|| {
            "NiNRouting nécessite une pose agrégée antérieure (squelette itératif)".to_string()
        })?;
        let s = match state {
            Some(s) => s,
            None => self.zero_state(votes),
        };

        // Vecteur d'entrée par position: concat(h, pose, activation, vote, r)
        let features = self.degree + rep_len + 1 + rep_len + 1;
        let rows = batch * out_caps * width * height * mult;
        let mut stacked = Array2::<f32>::zeros((rows, features));

        let mut row = 0;
        for b in 0..batch {
            for o in 0..out_caps {
                for w in 0..width {
                    for h in 0..height {
                        for i in 0..mult {
                            let mut col = 0;

                            for d in 0..self.degree {
                                stacked[[row, col]] = s[&[b, o, w, h, 0, d][..]];
                                col += 1;
                            }
                            for u in 0..vshape[5] {
                                for v in 0..vshape[6] {
                                    stacked[[row, col]] = poses[&[b, o, w, h, 0, u, v][..]];
                                    col += 1;
                                }
                            }
                            stacked[[row, col]] = activations[[b, o, w, h, i]];
                            col += 1;
                            for u in 0..vshape[5] {
                                for v in 0..vshape[6] {
                                    stacked[[row, col]] = votes[&[b, o, w, h, i, u, v][..]];
                                    col += 1;
                                }
                            }
                            stacked[[row, col]] = match c {
                                Some(c) => c[[b, o, w, h, i]],
                                None => 0.0,
                            };

                            row += 1;
                        }
                    }
                }
            }
        }

        // Pile dense + ReLU puis tête (degree + 1): [h', r]
        let mut hidden = stacked;
        for (k, &units) in self.compatibility_layers.iter().enumerate() {
            hidden = dense(params, &hidden, units, &format!("compatibility/l_{}", k), true)?;
        }
        let head = dense(params, &hidden, self.degree + 1, "compatibility/l_final", false)?;

        // Nouvel état caché sommé sur la multiplicité, compatibilité scalaire
        let mut new_state = self.zero_state(votes);
        let mut r = ArrayD::<f32>::zeros(IxDyn(&[batch, out_caps, width, height, mult]));

        let mut row = 0;
        for b in 0..batch {
            for o in 0..out_caps {
                for w in 0..width {
                    for h in 0..height {
                        for i in 0..mult {
                            for d in 0..self.degree {
                                new_state[&[b, o, w, h, 0, d][..]] += head[[row, d]];
                            }
                            r[[b, o, w, h, i]] = head[[row, self.degree]];
                            row += 1;
                        }
                    }
                }
            }
        }

        Ok((r, Some(new_state)))
    }

    fn activation(
        &mut self,
        params: &mut ParamStore,
        state: RuleState,
        _c: &ArrayD<f32>,
        votes: &ArrayD<f32>,
        _poses: &ArrayD<f32>,
        _activations: &ArrayD<f32>,
    ) -> Result<(ArrayD<f32>, RuleState), String> {
        let vshape = votes.shape().to_vec();
        let (batch, out_caps, width, height) = (vshape[0], vshape[1], vshape[2], vshape[3]);

        // Premier appel: l'état caché démarre à zéro
        let s = match state {
            Some(s) => s,
            None => self.zero_state(votes),
        };

        let rows = batch * out_caps * width * height;
        let mut flat = Array2::<f32>::zeros((rows, self.degree));

        let mut row = 0;
        for b in 0..batch {
            for o in 0..out_caps {
                for w in 0..width {
                    for h in 0..height {
                        for d in 0..self.degree {
                            flat[[row, d]] = s[&[b, o, w, h, 0, d][..]];
                        }
                        row += 1;
                    }
                }
            }
        }

        let mut hidden = flat;
        for (k, &units) in self.activation_layers.iter().enumerate() {
            hidden = dense(params, &hidden, units, &format!("activation/l_{}", k), true)?;
        }

        let head = if self.activate {
            let logits = dense(params, &hidden, 1, "activation/l_final", false)?;
            logits.mapv(|v| 1.0 / (1.0 + (-v).exp()))
        } else {
            dense(params, &hidden, 1, "activation/l_final_logits", false)?
        };

        let mut probabilities = ArrayD::<f32>::zeros(IxDyn(&[batch, out_caps, width, height, 1]));
        let mut row = 0;
        for b in 0..batch {
            for o in 0..out_caps {
                for w in 0..width {
                    for h in 0..height {
                        probabilities[[b, o, w, h, 0]] = head[[row, 0]];
                        row += 1;
                    }
                }
            }
        }

        Ok((probabilities, Some(s)))
    }
}

/// Routage NiN sur le squelette itératif complet
#[allow(clippy::too_many_arguments)]
pub fn nin_routing(
    metric: Box<dyn Metric>,
    degree: usize,
    compatibility_layers: Vec<usize>,
    activation_layers: Vec<usize>,
    activate: bool,
    name: &str,
    config: RoutingConfig,
) -> RoutingProcedure {
    let rule = NiNRule::new(degree, compatibility_layers, activation_layers, activate, name);
    RoutingProcedure::new(Box::new(rule), metric, config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::metric::SquaredDistanceMetric;
    use crate::model::routing::Routing;

    fn sample_inputs() -> (ArrayD<f32>, ArrayD<f32>) {
        let mut votes = ArrayD::zeros(IxDyn(&[1, 2, 2, 2, 3, 2, 2]));
        for (n, v) in votes.iter_mut().enumerate() {
            *v = (n as f32 * 0.1).sin();
        }
        let activations = ArrayD::ones(IxDyn(&[1, 2, 2, 2, 3]));
        (votes, activations)
    }

    fn sample_procedure(seed: u64) -> RoutingProcedure {
        nin_routing(
            Box::new(SquaredDistanceMetric),
            4,
            vec![8],
            vec![8],
            true,
            "test",
            RoutingConfig {
                design_iterations: 2,
                seed,
                ..RoutingConfig::default()
            },
        )
    }

    #[test]
    fn test_fit_shapes() {
        let (votes, activations) = sample_inputs();
        let mut routing = sample_procedure(3);

        let (poses, probabilities) = routing.fit(&votes, &activations, 0).unwrap();

        assert_eq!(poses.shape(), &[1, 2, 2, 2, 2, 2]);
        assert_eq!(probabilities.shape(), &[1, 2, 2, 2]);
        assert!(probabilities.iter().all(|&p| p > 0.0 && p < 1.0));
    }

    #[test]
    fn test_deterministic_given_seed() {
        let (votes, activations) = sample_inputs();
        let mut first = sample_procedure(3);
        let mut second = sample_procedure(3);

        let (p1, a1) = first.fit(&votes, &activations, 2).unwrap();
        let (p2, a2) = second.fit(&votes, &activations, 2).unwrap();

        assert_eq!(p1, p2);
        assert_eq!(a1, a2);
    }

    #[test]
    fn test_hidden_state_threaded_through_iterations() {
        let (votes, activations) = sample_inputs();
        let mut routing = sample_procedure(3);
        routing.enable_inspection();

        routing.fit(&votes, &activations, 2).unwrap();

        // L'activation initiale matérialise l'état caché à zéro,
        // la compatibilité le remplace ensuite
        let s0 = routing.inspection().get("s0").unwrap();
        let s1 = routing.inspection().get("s1").unwrap();
        assert_eq!(s0.shape(), &[1, 2, 2, 2, 1, 4]);
        assert!(s0.iter().all(|&v| v == 0.0));
        assert!(s1.iter().any(|&v| v != 0.0));
    }

    #[test]
    fn test_dense_reuses_parameters_across_iterations() {
        let (votes, activations) = sample_inputs();
        let mut one = sample_procedure(9);
        let mut three = sample_procedure(9);

        one.fit(&votes, &activations, 1).unwrap();
        three.fit(&votes, &activations, 3).unwrap();

        // Plus d'itérations ne créent aucun paramètre supplémentaire
        assert_eq!(one.params_len(), three.params_len());
    }
}
