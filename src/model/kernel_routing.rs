use ndarray::{ArrayD, IxDyn};

use super::config::{CompatibilityPolicy, RoutingConfig};
use super::metric::{Kernel, Metric};
use super::ops;
use super::routing::{RoutingRule, RuleState, SimplifiedRoutingProcedure};
use super::variables::{Initializer, ParamStore};

/// Règle de routage par noyau: la compatibilité d'un vote est son accord
/// (similarité noyau) avec la pose agrégée courante, pondéré par
/// l'activation d'entrée
pub struct KernelRule {
    kernel: Box<dyn Kernel>,
    policy: CompatibilityPolicy,
    activate: bool,
    prior: bool,
    name: String,
    // Accord mémorisé entre compatibilité et activation d'une même passe
    agreement: Option<ArrayD<f32>>,
}

impl KernelRule {
    pub fn new(
        kernel: Box<dyn Kernel>,
        policy: CompatibilityPolicy,
        activate: bool,
        prior: bool,
        name: &str,
    ) -> Self {
        let base = if prior {
            format!("KernelRoutingwithPrior{}", name)
        } else {
            format!("KernelRouting{}", name)
        };
        Self {
            kernel,
            policy,
            activate,
            prior,
            name: base,
            agreement: None,
        }
    }

    /// Pose de référence diffusée sur l'axe de multiplicité
    ///
    /// Sans pose agrégée antérieure (passe unique), la moyenne non pondérée
    /// des votes sert de référence.
    fn reference_poses(
        &self,
        poses: Option<&ArrayD<f32>>,
        votes: &ArrayD<f32>,
    ) -> Result<ArrayD<f32>, String> {
        let mult = votes.shape()[4];

        match poses {
            Some(p) => ops::tile_axis(p, 4, mult),
            None => {
                let mean = ops::reduce_sum_keepdims(votes, 4) / mult as f32;
                ops::tile_axis(&mean, 4, mult)
            }
        }
    }

    fn compute_agreement(
        &self,
        params: &mut ParamStore,
        poses: Option<&ArrayD<f32>>,
        votes: &ArrayD<f32>,
    ) -> Result<ArrayD<f32>, String> {
        let tiled = self.reference_poses(poses, votes)?;
        self.kernel.take(params, &tiled, votes)
    }
}

impl RoutingRule for KernelRule {
    fn name(&self) -> &str {
        &self.name
    }

    fn initial_coefficients(&self, activations: &ArrayD<f32>) -> Option<ArrayD<f32>> {
        // Variante avec a priori: les activations d'entrée amorcent c
        if self.prior {
            Some(activations.to_owned())
        } else {
            None
        }
    }

    fn compatibility(
        &mut self,
        params: &mut ParamStore,
        state: RuleState,
        _c: Option<&ArrayD<f32>>,
        votes: &ArrayD<f32>,
        poses: Option<&ArrayD<f32>>,
        _probabilities: Option<&ArrayD<f32>>,
        activations: &ArrayD<f32>,
        _it: usize,
    ) -> Result<(ArrayD<f32>, RuleState), String> {
        let agreement = self.compute_agreement(params, poses, votes)?;

        let r = match self.policy {
            CompatibilityPolicy::Scaled => {
                let alpha = params.weight_variable(&[], "alpha", Initializer::Constant(1.0));
                let a = alpha[IxDyn(&[])];
                activations * &agreement / (a * a)
            }
            CompatibilityPolicy::Annealed => {
                let alpha = params.weight_variable(&[], "alpha", Initializer::Constant(1.0));
                let beta = params.weight_variable(&[], "beta", Initializer::Constant(1.0));
                // Scalaires élevés au carré: température toujours positive
                let a2 = alpha[IxDyn(&[])].powi(2);
                let b2 = beta[IxDyn(&[])].powi(2);
                let temperature = a2 + b2;

                let weighted = activations.mapv(|a| a.max(0.0).powf(b2 / temperature));
                weighted * agreement.mapv(|g| (g / temperature).exp())
            }
        };

        self.agreement = Some(agreement);
        Ok((r, state))
    }

    fn activation(
        &mut self,
        params: &mut ParamStore,
        state: RuleState,
        c: &ArrayD<f32>,
        votes: &ArrayD<f32>,
        poses: &ArrayD<f32>,
        _activations: &ArrayD<f32>,
    ) -> Result<(ArrayD<f32>, RuleState), String> {
        let agreement = match self.agreement.take() {
            Some(a) => a,
            None => self.compute_agreement(params, Some(poses), votes)?,
        };

        // Accord total sous les coefficients courants
        let raw = ops::reduce_sum_keepdims(&(c * &agreement), 4);

        let theta1 = params.weight_variable(&[1], "theta1", Initializer::Constant(1.0));
        let theta2 = params.bias_variable(&[1], "theta2");
        let (t1, t2) = (theta1[[0]], theta2[[0]]);

        let logits = raw.mapv(|v| t1 * v + t2);
        let activation = if self.activate {
            ops::sigmoid(&logits)
        } else {
            logits
        };

        Ok((activation, state))
    }
}

/// Routage par noyau sur le squelette simplifié
pub fn kernel_routing(
    kernel: Box<dyn Kernel>,
    metric: Box<dyn Metric>,
    policy: CompatibilityPolicy,
    activate: bool,
    name: &str,
    config: RoutingConfig,
) -> SimplifiedRoutingProcedure {
    let rule = KernelRule::new(kernel, policy, activate, false, name);
    SimplifiedRoutingProcedure::new(Box::new(rule), metric, config)
}

/// Routage par noyau amorcé par les activations d'entrée
pub fn kernel_routing_with_prior(
    kernel: Box<dyn Kernel>,
    metric: Box<dyn Metric>,
    policy: CompatibilityPolicy,
    activate: bool,
    name: &str,
    config: RoutingConfig,
) -> SimplifiedRoutingProcedure {
    let rule = KernelRule::new(kernel, policy, activate, true, name);
    SimplifiedRoutingProcedure::new(Box::new(rule), metric, config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::metric::{DotProductKernel, SquaredDistanceMetric};
    use crate::model::routing::Routing;

    /// Votes en rampe du scénario de référence:
    /// batch=1, out_caps=1, w=h=2, multiplicité=3, repdim=[4,1]
    fn ramp_votes() -> ArrayD<f32> {
        let mut votes = ArrayD::zeros(IxDyn(&[1, 1, 2, 2, 3, 4, 1]));
        for (n, v) in votes.iter_mut().enumerate() {
            *v = n as f32 * 0.01;
        }
        votes
    }

    fn scenario_procedure(seed: u64) -> SimplifiedRoutingProcedure {
        kernel_routing(
            Box::new(DotProductKernel),
            Box::new(SquaredDistanceMetric),
            CompatibilityPolicy::Scaled,
            true,
            "",
            RoutingConfig {
                seed,
                ..RoutingConfig::default()
            },
        )
    }

    #[test]
    fn test_scenario_shapes_and_bounds() {
        let votes = ramp_votes();
        let activations = ArrayD::ones(IxDyn(&[1, 1, 2, 2, 3]));
        let mut routing = scenario_procedure(42);

        let (poses, probabilities) = routing.fit(&votes, &activations, 1).unwrap();

        assert_eq!(poses.shape(), &[1, 2, 2, 1, 4, 1]);
        assert_eq!(probabilities.shape(), &[1, 2, 2, 1]);
        // Activations bornées par la sigmoïde
        assert!(probabilities.iter().all(|&p| p > 0.0 && p < 1.0));
    }

    #[test]
    fn test_scenario_deterministic_given_seed() {
        let votes = ramp_votes();
        let activations = ArrayD::ones(IxDyn(&[1, 1, 2, 2, 3]));

        let mut first = scenario_procedure(42);
        let mut second = scenario_procedure(42);

        let (p1, a1) = first.fit(&votes, &activations, 1).unwrap();
        let (p2, a2) = second.fit(&votes, &activations, 1).unwrap();

        assert_eq!(p1, p2);
        assert_eq!(a1, a2);
    }

    #[test]
    fn test_scenario_hand_computed_first_position() {
        // Une itération, alpha=1, theta1=1, theta2=0: toutes les valeurs
        // se recalculent à la main à partir des formules
        let votes = ramp_votes();
        let activations = ArrayD::ones(IxDyn(&[1, 1, 2, 2, 3]));
        let mut routing = scenario_procedure(42);

        let (poses, _) = routing.fit(&votes, &activations, 1).unwrap();

        // Position (w=0, h=0): en ordre ligne-major, votes_i[u] = 0.01 * (4 i + u)
        let vote = |i: usize, u: usize| 0.01 * (4.0 * i as f32 + u as f32);

        // c0 uniforme = 1/3; pose0[u] = moyenne des votes
        let pose0: Vec<f32> = (0..4)
            .map(|u| (0..3).map(|i| vote(i, u) / 3.0).sum())
            .collect();

        // accord_i = <pose0, vote_i>; c1_i = 1 * accord_i; pose1 = somme
        // pondérée directe (squelette simplifié, pas de renormalisation)
        let agreement: Vec<f32> = (0..3)
            .map(|i| (0..4).map(|u| pose0[u] * vote(i, u)).sum())
            .collect();
        let expected: Vec<f32> = (0..4)
            .map(|u| (0..3).map(|i| agreement[i] * vote(i, u)).sum())
            .collect();

        for u in 0..4 {
            assert!((poses[[0, 0, 0, 0, u, 0]] - expected[u]).abs() < 1e-5);
        }
    }

    #[test]
    fn test_prior_seeds_with_activations() {
        let rule = KernelRule::new(
            Box::new(DotProductKernel),
            CompatibilityPolicy::Scaled,
            true,
            true,
            "",
        );
        let activations = ArrayD::from_elem(IxDyn(&[1, 2, 1, 1, 3]), 0.25);

        let seed = rule.initial_coefficients(&activations).unwrap();

        assert_eq!(seed, activations);
    }

    #[test]
    fn test_no_prior_uses_uniform_seed() {
        let rule = KernelRule::new(
            Box::new(DotProductKernel),
            CompatibilityPolicy::Scaled,
            true,
            false,
            "",
        );
        let activations = ArrayD::ones(IxDyn(&[1, 2, 1, 1, 3]));

        assert!(rule.initial_coefficients(&activations).is_none());
    }

    #[test]
    fn test_annealed_policy_stays_finite() {
        let votes = ramp_votes();
        let activations = ArrayD::ones(IxDyn(&[1, 1, 2, 2, 3]));
        let mut routing = kernel_routing(
            Box::new(DotProductKernel),
            Box::new(SquaredDistanceMetric),
            CompatibilityPolicy::Annealed,
            true,
            "",
            RoutingConfig::default(),
        );

        let (poses, probabilities) = routing.fit(&votes, &activations, 2).unwrap();

        assert!(poses.iter().all(|v| v.is_finite()));
        assert!(probabilities.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_unbounded_activation_is_affine() {
        // activate=false: l'activation reste un logit non borné
        let votes = ramp_votes();
        let activations = ArrayD::ones(IxDyn(&[1, 1, 2, 2, 3]));
        let mut bounded = scenario_procedure(42);
        let mut unbounded = kernel_routing(
            Box::new(DotProductKernel),
            Box::new(SquaredDistanceMetric),
            CompatibilityPolicy::Scaled,
            false,
            "",
            RoutingConfig::default(),
        );

        let (_, pb) = bounded.fit(&votes, &activations, 1).unwrap();
        let (_, pu) = unbounded.fit(&votes, &activations, 1).unwrap();

        assert!(pb.iter().all(|&p| p < 1.0));
        // Le logit brut du scénario dépasse 1 sur au moins une position
        assert!(pu.iter().any(|&p| p > 1.0));
    }
}
