use ndarray::{ArrayD, IxDyn};
use std::collections::HashMap;

use super::config::{Normalization, RoutingConfig};
use super::metric::Metric;
use super::ops;
use super::variables::ParamStore;

/// État auxiliaire opaque d'une règle de routage, transmis tel quel
/// d'une itération à la suivante par le squelette
pub type RuleState = Option<ArrayD<f32>>;

/// Stratégie de routage: une règle fournit la mise à jour de compatibilité
/// et le calcul d'activation, le squelette fournit la boucle de point fixe
///
/// votes :: { batch, out_caps, new_w, new_h, multiplicité, rep0, rep1 }
/// activations, c :: { batch, out_caps, new_w, new_h, multiplicité }
/// poses :: { batch, out_caps, new_w, new_h, 1, rep0, rep1 }
/// probabilités :: { batch, out_caps, new_w, new_h, 1 }
pub trait RoutingRule: Send + Sync {
    fn name(&self) -> &str;

    /// État auxiliaire initial (None pour les règles sans état)
    fn initial_state(&self) -> RuleState {
        None
    }

    /// Amorçage des coefficients; None = graine uniforme 1/32 normalisée
    fn initial_coefficients(&self, _activations: &ArrayD<f32>) -> Option<ArrayD<f32>> {
        None
    }

    /// Nouveaux coefficients de couplage à partir de l'état courant
    #[allow(clippy::too_many_arguments)]
    fn compatibility(
        &mut self,
        params: &mut ParamStore,
        state: RuleState,
        c: Option<&ArrayD<f32>>,
        votes: &ArrayD<f32>,
        poses: Option<&ArrayD<f32>>,
        probabilities: Option<&ArrayD<f32>>,
        activations: &ArrayD<f32>,
        it: usize,
    ) -> Result<(ArrayD<f32>, RuleState), String>;

    /// Activation des capsules de sortie sous les coefficients courants
    fn activation(
        &mut self,
        params: &mut ParamStore,
        state: RuleState,
        c: &ArrayD<f32>,
        votes: &ArrayD<f32>,
        poses: &ArrayD<f32>,
        activations: &ArrayD<f32>,
    ) -> Result<(ArrayD<f32>, RuleState), String>;
}

/// Interface commune des procédures de routage
pub trait Routing: Send + Sync {
    fn name(&self) -> &str;

    /// Ajuste les coefficients de couplage et retourne (poses, activations)
    ///
    /// iterations = 0 utilise le nombre d'itérations de conception;
    /// toute autre valeur exécute exactement ce nombre de raffinements.
    fn fit(
        &mut self,
        votes: &ArrayD<f32>,
        activations: &ArrayD<f32>,
        iterations: usize,
    ) -> Result<(ArrayD<f32>, ArrayD<f32>), String>;
}

/// Trace d'inspection: tenseurs intermédiaires nommés, jamais relus
/// par l'algorithme
#[derive(Default)]
pub struct Inspection {
    enabled: bool,
    records: HashMap<String, ArrayD<f32>>,
}

impl Inspection {
    pub fn enable(&mut self) {
        self.enabled = true;
    }

    fn record(&mut self, key: &str, tensor: &ArrayD<f32>) {
        if self.enabled {
            self.records.insert(key.to_string(), tensor.clone());
        }
    }

    pub fn get(&self, key: &str) -> Option<&ArrayD<f32>> {
        self.records.get(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.records.keys()
    }
}

/// Socle partagé des trois squelettes: validation, normalisation,
/// amorçage des coefficients et agrégation des votes
struct ProcedureCore {
    name: String,
    config: RoutingConfig,
    params: ParamStore,
    inspection: Inspection,
}

impl ProcedureCore {
    fn new(prefix: &str, rule_name: &str, config: RoutingConfig) -> Self {
        let name = format!("{}{}", prefix, rule_name);
        let params = ParamStore::new(&name, config.seed).verbose(config.verbose);
        Self {
            name,
            config,
            params,
            inspection: Inspection::default(),
        }
    }

    fn validate(votes: &ArrayD<f32>, activations: &ArrayD<f32>) -> Result<(), String> {
        ops::expect_rank(votes, 7, "votes")?;
        ops::expect_rank(activations, 5, "activations")?;
        if votes.shape()[..5] != *activations.shape() {
            return Err(format!(
                "votes {:?} et activations {:?} incompatibles sur les 5 premiers axes",
                votes.shape(),
                activations.shape()
            ));
        }
        Ok(())
    }

    fn normalize(&self, r: &ArrayD<f32>) -> ArrayD<f32> {
        match self.config.normalization {
            Normalization::Softmax => ops::softmax_axis(r, 4),
            Normalization::SumNormalize => ops::sum_normalize_axis(r, 4, self.config.epsilon),
        }
    }

    /// Graine des coefficients: a priori de la règle, sinon constante 1/32
    /// normalisée le long de la multiplicité
    fn seed_coefficients(&self, rule: &dyn RoutingRule, activations: &ArrayD<f32>) -> ArrayD<f32> {
        if let Some(prior) = rule.initial_coefficients(activations) {
            return prior;
        }

        let r = ArrayD::from_elem(activations.raw_dim(), 1.0 / 32.0);
        self.normalize(&r)
    }

    /// Agrégation des votes sous les coefficients courants
    ///
    /// renormalize: division par la somme des coefficients plus epsilon
    /// (le squelette simplifié s'en passe)
    fn aggregate(
        &mut self,
        c: &ArrayD<f32>,
        votes: &ArrayD<f32>,
        renormalize: bool,
    ) -> Result<ArrayD<f32>, String> {
        let mut poses = ops::weighted_vote_sum(c, votes)?;

        if renormalize {
            // Garde epsilon: évite une division par une somme quasi nulle
            let norm = ops::reduce_sum_keepdims(c, 4) + self.config.epsilon;
            let norm = norm
                .insert_axis(ndarray::Axis(5))
                .insert_axis(ndarray::Axis(6));
            poses = poses / &norm;
        }

        if self.config.bias {
            let vshape = votes.shape().to_vec();
            let bias_shape = [1, vshape[1], vshape[2], vshape[3], 1, vshape[5], vshape[6]];
            let bias = self.params.bias_variable(&bias_shape, "voting_bias");
            poses = poses + &bias;
        }

        Ok(poses)
    }

    fn resolve_iterations(&self, iterations: usize) -> usize {
        if iterations == 0 {
            self.config.design_iterations
        } else {
            iterations
        }
    }

    fn finalize(
        &self,
        poses: &ArrayD<f32>,
        probabilities: &ArrayD<f32>,
    ) -> Result<(ArrayD<f32>, ArrayD<f32>), String> {
        let out_poses = ops::finalize_poses(poses)?;
        let out_probs = ops::finalize_probabilities(probabilities)?;

        if self.config.verbose {
            println!(
                "   🔍 Routage {}: poses {:?}, activations {:?}",
                self.name,
                out_poses.shape(),
                out_probs.shape()
            );
        }

        Ok((out_poses, out_probs))
    }
}

/// Procédure de routage itérative complète
///
/// INIT: graine des coefficients, pose et activation initiales.
/// REFINE x k: compatibilité -> agrégation renormalisée -> activation.
/// FINALIZE: réorganisation des axes vers la convention de sortie.
pub struct RoutingProcedure {
    core: ProcedureCore,
    rule: Box<dyn RoutingRule>,
    metric: Box<dyn Metric>,
}

impl RoutingProcedure {
    pub fn new(rule: Box<dyn RoutingRule>, metric: Box<dyn Metric>, config: RoutingConfig) -> Self {
        let core = ProcedureCore::new("RoutingProcedure", rule.name(), config);
        Self { core, rule, metric }
    }

    pub fn metric(&self) -> &dyn Metric {
        self.metric.as_ref()
    }

    pub fn rule(&self) -> &dyn RoutingRule {
        self.rule.as_ref()
    }

    pub fn enable_inspection(&mut self) {
        self.core.inspection.enable();
    }

    /// Nombre de paramètres appris distincts créés jusqu'ici
    pub fn params_len(&self) -> usize {
        self.core.params.len()
    }

    pub fn inspection(&self) -> &Inspection {
        &self.core.inspection
    }
}

impl Routing for RoutingProcedure {
    fn name(&self) -> &str {
        &self.core.name
    }

    fn fit(
        &mut self,
        votes: &ArrayD<f32>,
        activations: &ArrayD<f32>,
        iterations: usize,
    ) -> Result<(ArrayD<f32>, ArrayD<f32>), String> {
        ProcedureCore::validate(votes, activations)?;

        // INIT
        let mut s = self.rule.initial_state();
        let mut c = self.core.seed_coefficients(self.rule.as_ref(), activations);
        let mut poses = self.core.aggregate(&c, votes, true)?;
        self.core.inspection.record("poses0", &poses);

        let (mut probabilities, new_s) =
            self.rule
                .activation(&mut self.core.params, s, &c, votes, &poses, activations)?;
        s = new_s;

        // REFINE x k
        let iters = self.core.resolve_iterations(iterations);
        for it in 0..iters {
            self.core.inspection.record(&format!("c{}", it), &c);
            if let Some(state) = &s {
                self.core.inspection.record(&format!("s{}", it), state);
            }

            let (new_c, new_s) = self.rule.compatibility(
                &mut self.core.params,
                s,
                Some(&c),
                votes,
                Some(&poses),
                Some(&probabilities),
                activations,
                it,
            )?;
            c = new_c;
            s = new_s;

            poses = self.core.aggregate(&c, votes, true)?;

            let (new_probabilities, new_s) =
                self.rule
                    .activation(&mut self.core.params, s, &c, votes, &poses, activations)?;
            probabilities = new_probabilities;
            s = new_s;

            self.core
                .inspection
                .record(&format!("poses{}", it + 1), &poses);
        }
        self.core.inspection.record("cfinal", &c);

        // FINALIZE
        self.core.finalize(&poses, &probabilities)
    }
}

/// Procédure simplifiée: agrégation par somme pondérée directe (sans
/// renormalisation) et activation unique calculée après la boucle
pub struct SimplifiedRoutingProcedure {
    core: ProcedureCore,
    rule: Box<dyn RoutingRule>,
    metric: Box<dyn Metric>,
}

impl SimplifiedRoutingProcedure {
    pub fn new(rule: Box<dyn RoutingRule>, metric: Box<dyn Metric>, config: RoutingConfig) -> Self {
        let core = ProcedureCore::new("SimplifiedRoutingProcedure", rule.name(), config);
        Self { core, rule, metric }
    }

    pub fn metric(&self) -> &dyn Metric {
        self.metric.as_ref()
    }

    pub fn rule(&self) -> &dyn RoutingRule {
        self.rule.as_ref()
    }

    pub fn enable_inspection(&mut self) {
        self.core.inspection.enable();
    }

    /// Nombre de paramètres appris distincts créés jusqu'ici
    pub fn params_len(&self) -> usize {
        self.core.params.len()
    }

    pub fn inspection(&self) -> &Inspection {
        &self.core.inspection
    }
}

impl Routing for SimplifiedRoutingProcedure {
    fn name(&self) -> &str {
        &self.core.name
    }

    fn fit(
        &mut self,
        votes: &ArrayD<f32>,
        activations: &ArrayD<f32>,
        iterations: usize,
    ) -> Result<(ArrayD<f32>, ArrayD<f32>), String> {
        ProcedureCore::validate(votes, activations)?;

        // INIT (pas d'activation initiale: elle est un résumé final)
        let mut s = self.rule.initial_state();
        let mut c = self.core.seed_coefficients(self.rule.as_ref(), activations);
        let mut poses = self.core.aggregate(&c, votes, false)?;
        self.core.inspection.record("poses0", &poses);

        // REFINE x k
        let iters = self.core.resolve_iterations(iterations);
        for it in 0..iters {
            self.core.inspection.record(&format!("c{}", it), &c);

            let (new_c, new_s) = self.rule.compatibility(
                &mut self.core.params,
                s,
                Some(&c),
                votes,
                Some(&poses),
                None,
                activations,
                it,
            )?;
            c = new_c;
            s = new_s;

            poses = self.core.aggregate(&c, votes, false)?;
            self.core
                .inspection
                .record(&format!("poses{}", it + 1), &poses);
        }
        self.core.inspection.record("cfinal", &c);

        let (probabilities, _s) =
            self.rule
                .activation(&mut self.core.params, s, &c, votes, &poses, activations)?;

        // FINALIZE
        self.core.finalize(&poses, &probabilities)
    }
}

/// Procédure non itérative: une seule passe de compatibilité, une seule
/// normalisation, une seule agrégation et une seule activation
pub struct HyperSimplifiedRoutingProcedure {
    core: ProcedureCore,
    rule: Box<dyn RoutingRule>,
    metric: Box<dyn Metric>,
}

impl HyperSimplifiedRoutingProcedure {
    pub fn new(rule: Box<dyn RoutingRule>, metric: Box<dyn Metric>, config: RoutingConfig) -> Self {
        let core = ProcedureCore::new("HyperSimplifiedRoutingProcedure", rule.name(), config);
        Self { core, rule, metric }
    }

    pub fn metric(&self) -> &dyn Metric {
        self.metric.as_ref()
    }

    pub fn rule(&self) -> &dyn RoutingRule {
        self.rule.as_ref()
    }

    pub fn enable_inspection(&mut self) {
        self.core.inspection.enable();
    }

    /// Nombre de paramètres appris distincts créés jusqu'ici
    pub fn params_len(&self) -> usize {
        self.core.params.len()
    }

    pub fn inspection(&self) -> &Inspection {
        &self.core.inspection
    }
}

impl Routing for HyperSimplifiedRoutingProcedure {
    fn name(&self) -> &str {
        &self.core.name
    }

    fn fit(
        &mut self,
        votes: &ArrayD<f32>,
        activations: &ArrayD<f32>,
        _iterations: usize,
    ) -> Result<(ArrayD<f32>, ArrayD<f32>), String> {
        ProcedureCore::validate(votes, activations)?;

        // Passe unique: la règle n'a aucune itération antérieure
        let s = self.rule.initial_state();
        let (r, s) = self.rule.compatibility(
            &mut self.core.params,
            s,
            None,
            votes,
            None,
            None,
            activations,
            0,
        )?;

        let c = self.core.normalize(&r);
        self.core.inspection.record("cfinal", &c);

        let poses = self.core.aggregate(&c, votes, true)?;
        self.core.inspection.record("poses0", &poses);

        let (probabilities, _s) =
            self.rule
                .activation(&mut self.core.params, s, &c, votes, &poses, activations)?;

        self.core.finalize(&poses, &probabilities)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::metric::SquaredDistanceMetric;
    use crate::model::ops;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Règle de test: compte les passes et renvoie des valeurs constantes
    struct CountingRule {
        compatibility_calls: Arc<AtomicUsize>,
        activation_calls: Arc<AtomicUsize>,
    }

    impl CountingRule {
        fn new() -> (Self, Arc<AtomicUsize>, Arc<AtomicUsize>) {
            let compat = Arc::new(AtomicUsize::new(0));
            let act = Arc::new(AtomicUsize::new(0));
            (
                Self {
                    compatibility_calls: compat.clone(),
                    activation_calls: act.clone(),
                },
                compat,
                act,
            )
        }
    }

    impl RoutingRule for CountingRule {
        fn name(&self) -> &str {
            "Counting"
        }

        fn compatibility(
            &mut self,
            _params: &mut ParamStore,
            state: RuleState,
            _c: Option<&ArrayD<f32>>,
            _votes: &ArrayD<f32>,
            _poses: Option<&ArrayD<f32>>,
            _probabilities: Option<&ArrayD<f32>>,
            activations: &ArrayD<f32>,
            _it: usize,
        ) -> Result<(ArrayD<f32>, RuleState), String> {
            self.compatibility_calls.fetch_add(1, Ordering::SeqCst);
            Ok((activations.to_owned(), state))
        }

        fn activation(
            &mut self,
            _params: &mut ParamStore,
            state: RuleState,
            c: &ArrayD<f32>,
            _votes: &ArrayD<f32>,
            _poses: &ArrayD<f32>,
            _activations: &ArrayD<f32>,
        ) -> Result<(ArrayD<f32>, RuleState), String> {
            self.activation_calls.fetch_add(1, Ordering::SeqCst);
            Ok((ops::reduce_sum_keepdims(c, 4), state))
        }
    }

    fn sample_inputs() -> (ArrayD<f32>, ArrayD<f32>) {
        let votes = ArrayD::from_elem(IxDyn(&[2, 3, 2, 2, 4, 2, 2]), 0.5);
        let activations = ArrayD::ones(IxDyn(&[2, 3, 2, 2, 4]));
        (votes, activations)
    }

    #[test]
    fn test_fit_output_shapes() {
        let (votes, activations) = sample_inputs();
        let (rule, _, _) = CountingRule::new();
        let mut routing = RoutingProcedure::new(
            Box::new(rule),
            Box::new(SquaredDistanceMetric),
            RoutingConfig {
                design_iterations: 2,
                ..RoutingConfig::default()
            },
        );

        let (poses, probabilities) = routing.fit(&votes, &activations, 0).unwrap();

        assert_eq!(poses.shape(), &[2, 2, 2, 3, 2, 2]);
        assert_eq!(probabilities.shape(), &[2, 2, 2, 3]);
    }

    #[test]
    fn test_initial_coefficients_sum_to_one() {
        let activations = ArrayD::ones(IxDyn(&[2, 3, 2, 2, 4]));
        let (rule, _, _) = CountingRule::new();
        let routing = RoutingProcedure::new(
            Box::new(rule),
            Box::new(SquaredDistanceMetric),
            RoutingConfig::default(),
        );

        let (seed_rule, _, _) = CountingRule::new();
        let c = routing.core.seed_coefficients(&seed_rule, &activations);

        for b in 0..2 {
            for o in 0..3 {
                for w in 0..2 {
                    for h in 0..2 {
                        let sum: f32 = (0..4).map(|i| c[[b, o, w, h, i]]).sum();
                        assert!((sum - 1.0).abs() < 1e-5);
                    }
                }
            }
        }
    }

    #[test]
    fn test_explicit_iterations_override_design_count() {
        let (votes, activations) = sample_inputs();
        let (rule, compat, act) = CountingRule::new();
        let mut routing = RoutingProcedure::new(
            Box::new(rule),
            Box::new(SquaredDistanceMetric),
            RoutingConfig {
                design_iterations: 3,
                ..RoutingConfig::default()
            },
        );

        routing.fit(&votes, &activations, 5).unwrap();

        assert_eq!(compat.load(Ordering::SeqCst), 5);
        // Une activation initiale + une par raffinement
        assert_eq!(act.load(Ordering::SeqCst), 6);
    }

    #[test]
    fn test_zero_iterations_use_design_count() {
        let (votes, activations) = sample_inputs();
        let (rule, compat, _) = CountingRule::new();
        let mut routing = RoutingProcedure::new(
            Box::new(rule),
            Box::new(SquaredDistanceMetric),
            RoutingConfig {
                design_iterations: 3,
                ..RoutingConfig::default()
            },
        );

        routing.fit(&votes, &activations, 0).unwrap();

        assert_eq!(compat.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_simplified_single_activation() {
        let (votes, activations) = sample_inputs();
        let (rule, compat, act) = CountingRule::new();
        let mut routing = SimplifiedRoutingProcedure::new(
            Box::new(rule),
            Box::new(SquaredDistanceMetric),
            RoutingConfig::default(),
        );

        let (poses, probabilities) = routing.fit(&votes, &activations, 2).unwrap();

        assert_eq!(poses.shape(), &[2, 2, 2, 3, 2, 2]);
        assert_eq!(probabilities.shape(), &[2, 2, 2, 3]);
        assert_eq!(compat.load(Ordering::SeqCst), 2);
        // L'activation est un résumé final, calculée une seule fois
        assert_eq!(act.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_hyper_simplified_single_pass() {
        let (votes, activations) = sample_inputs();
        let (rule, compat, act) = CountingRule::new();
        let mut routing = HyperSimplifiedRoutingProcedure::new(
            Box::new(rule),
            Box::new(SquaredDistanceMetric),
            RoutingConfig::default(),
        );

        let (poses, probabilities) = routing.fit(&votes, &activations, 0).unwrap();

        // Même convention de sortie que le squelette complet
        assert_eq!(poses.shape(), &[2, 2, 2, 3, 2, 2]);
        assert_eq!(probabilities.shape(), &[2, 2, 2, 3]);
        assert_eq!(compat.load(Ordering::SeqCst), 1);
        assert_eq!(act.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_fit_rejects_bad_ranks() {
        let votes = ArrayD::zeros(IxDyn(&[2, 3, 2, 2, 4, 2]));
        let activations = ArrayD::ones(IxDyn(&[2, 3, 2, 2, 4]));
        let (rule, _, _) = CountingRule::new();
        let mut routing = RoutingProcedure::new(
            Box::new(rule),
            Box::new(SquaredDistanceMetric),
            RoutingConfig::default(),
        );

        assert!(routing.fit(&votes, &activations, 0).is_err());
    }

    #[test]
    fn test_fit_rejects_mismatched_activations() {
        let votes = ArrayD::zeros(IxDyn(&[2, 3, 2, 2, 4, 2, 2]));
        let activations = ArrayD::ones(IxDyn(&[2, 3, 2, 2, 5]));
        let (rule, _, _) = CountingRule::new();
        let mut routing = RoutingProcedure::new(
            Box::new(rule),
            Box::new(SquaredDistanceMetric),
            RoutingConfig::default(),
        );

        assert!(routing.fit(&votes, &activations, 0).is_err());
    }

    #[test]
    fn test_inspection_records_when_enabled() {
        let (votes, activations) = sample_inputs();
        let (rule, _, _) = CountingRule::new();
        let mut routing = RoutingProcedure::new(
            Box::new(rule),
            Box::new(SquaredDistanceMetric),
            RoutingConfig {
                design_iterations: 2,
                ..RoutingConfig::default()
            },
        );
        routing.enable_inspection();

        routing.fit(&votes, &activations, 0).unwrap();

        assert!(routing.inspection().get("poses0").is_some());
        assert!(routing.inspection().get("c0").is_some());
        assert!(routing.inspection().get("cfinal").is_some());
    }

    #[test]
    fn test_renormalized_aggregation_divides_by_coefficient_sum() {
        // batch=1, out=1, w=h=1, multiplicité=2, repdim=[2,2]
        let mut votes = ArrayD::zeros(IxDyn(&[1, 1, 1, 1, 2, 2, 2]));
        for u in 0..2 {
            for v in 0..2 {
                votes[&[0, 0, 0, 0, 0, u, v][..]] = 1.0;
                votes[&[0, 0, 0, 0, 1, u, v][..]] = 2.0;
            }
        }
        let mut c = ArrayD::zeros(IxDyn(&[1, 1, 1, 1, 2]));
        c[[0, 0, 0, 0, 0]] = 0.3;
        c[[0, 0, 0, 0, 1]] = 0.7;

        let (rule, _, _) = CountingRule::new();
        let mut routing = RoutingProcedure::new(
            Box::new(rule),
            Box::new(SquaredDistanceMetric),
            RoutingConfig::default(),
        );

        let poses = routing.core.aggregate(&c, &votes, true).unwrap();

        assert_eq!(poses.shape(), &[1, 1, 1, 1, 1, 2, 2]);
        // (0.3 * 1 + 0.7 * 2) / (1.0 + epsilon) ~= 1.7
        assert!((poses[&[0, 0, 0, 0, 0, 0, 0][..]] - 1.7).abs() < 1e-4);
    }
}
