use ndarray::{ArrayD, IxDyn};
use ndarray_rand::rand_distr::Uniform;
use ndarray_rand::RandomExt;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::HashMap;

/// Initialisation d'un paramètre appris
#[derive(Debug, Clone, Copy)]
pub enum Initializer {
    Constant(f32),
    Zeros,
    Ones,
    /// Uniforme symétrique dans [-limite, limite]
    RandomUniform(f32),
    /// Initialisation He à partir du fan-in
    He(usize),
}

/// Registre explicite de paramètres appris, clé = scope/nom
///
/// Remplace le variable scope global: chaque procédure de routage ou
/// transformation possède son propre registre. Un paramètre est créé au
/// premier accès puis réutilisé à l'identique, quelle que soit l'itération.
pub struct ParamStore {
    scope: String,
    params: HashMap<String, ArrayD<f32>>,
    rng: StdRng,
    verbose: bool,
}

impl ParamStore {
    pub fn new(scope: &str, seed: u64) -> Self {
        Self {
            scope: scope.to_string(),
            params: HashMap::new(),
            rng: StdRng::seed_from_u64(seed),
            verbose: false,
        }
    }

    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    fn key(&self, name: &str) -> String {
        format!("{}/{}", self.scope, name)
    }

    fn initialize(&mut self, shape: &[usize], init: Initializer) -> ArrayD<f32> {
        let dim = IxDyn(shape);
        match init {
            Initializer::Constant(value) => ArrayD::from_elem(dim, value),
            Initializer::Zeros => ArrayD::zeros(dim),
            Initializer::Ones => ArrayD::ones(dim),
            Initializer::RandomUniform(limit) => {
                ArrayD::random_using(dim, Uniform::new(-limit, limit), &mut self.rng)
            }
            Initializer::He(fan_in) => {
                let scale = (2.0 / fan_in.max(1) as f32).sqrt();
                ArrayD::random_using(dim, Uniform::new(-scale, scale), &mut self.rng)
            }
        }
    }

    /// Crée ou réutilise un paramètre de poids
    pub fn weight_variable(&mut self, shape: &[usize], name: &str, init: Initializer) -> ArrayD<f32> {
        let key = self.key(name);

        if !self.params.contains_key(&key) {
            let value = self.initialize(shape, init);
            if self.verbose {
                println!("   ➕ Poids créé: {} {:?}", key, shape);
            }
            self.params.insert(key.clone(), value);
        }

        self.params[&key].clone()
    }

    /// Crée ou réutilise un biais (initialisé à zéro)
    pub fn bias_variable(&mut self, shape: &[usize], name: &str) -> ArrayD<f32> {
        self.weight_variable(shape, name, Initializer::Zeros)
    }

    /// Nombre de paramètres distincts créés
    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }
}
