use ndarray::{ArrayD, Ix4, IxDyn};

use super::capsule::{
    CapsuleClassLayer, CapsuleLayer, FullyConnectedCapsuleLayer, PrimaryCapsuleLayer,
};
use super::config::NetworkConfig;
use super::layers::ConvLayer;

/// Une couche assemblée du réseau
pub enum NetworkLayer {
    Conv(ConvLayer),
    Primary(PrimaryCapsuleLayer),
    Capsules(CapsuleLayer),
    FullyConnected(FullyConnectedCapsuleLayer),
    Class(CapsuleClassLayer),
}

/// Signal circulant entre couches: carte de caractéristiques brute avant la
/// couche primaire, couple (poses, activations) ensuite
enum Signal {
    Features(ArrayD<f32>),
    Capsules {
        poses: ArrayD<f32>,
        activations: ArrayD<f32>,
    },
}

/// Sortie du réseau: poses et activations de la dernière couche
#[derive(Debug, Clone)]
pub struct NetworkOutput {
    pub poses: ArrayD<f32>,
    pub activations: ArrayD<f32>,
}

/// Réseau de capsules principal, passe avant uniquement
pub struct CapsuleNetwork {
    pub config: NetworkConfig,
    pub layers: Vec<NetworkLayer>,
}

impl CapsuleNetwork {
    pub fn new(config: NetworkConfig, layers: Vec<NetworkLayer>) -> Self {
        Self { config, layers }
    }

    /// Passe avant: carte d'entrée { batch, w, h, canaux } vers les poses et
    /// activations de la dernière couche
    pub fn forward(&mut self, input: &ArrayD<f32>) -> Result<NetworkOutput, String> {
        let mut signal = Signal::Features(input.to_owned());

        for (idx, layer) in self.layers.iter_mut().enumerate() {
            signal = match (layer, signal) {
                (NetworkLayer::Conv(conv), Signal::Features(features)) => {
                    let features = features
                        .into_dimensionality::<Ix4>()
                        .map_err(|e| format!("couche {}: {}", idx, e))?;
                    let out = conv
                        .forward(&features.view())
                        .map_err(|e| format!("couche {}: {}", idx, e))?;
                    Signal::Features(out.into_dyn())
                }
                (NetworkLayer::Primary(primary), Signal::Features(features)) => {
                    let (poses, activations) = primary.inference(&features)?;
                    Signal::Capsules { poses, activations }
                }
                (NetworkLayer::Capsules(caps), Signal::Capsules { poses, activations }) => {
                    let (poses, activations) = caps.inference(&poses, &activations)?;
                    Signal::Capsules { poses, activations }
                }
                (
                    NetworkLayer::FullyConnected(fc),
                    Signal::Capsules { poses, activations },
                ) => {
                    let (poses, activations) = fc.inference(&poses, &activations)?;
                    Signal::Capsules { poses, activations }
                }
                (NetworkLayer::Class(class), Signal::Capsules { poses, activations }) => {
                    let (poses, activations) = class.inference(&poses, &activations)?;
                    Signal::Capsules { poses, activations }
                }
                (_, Signal::Features(_)) => {
                    return Err(format!(
                        "couche {}: une couche de capsules exige un couple (poses, activations)",
                        idx
                    ));
                }
                (_, Signal::Capsules { .. }) => {
                    return Err(format!(
                        "couche {}: une convolution exige une carte de caractéristiques brute",
                        idx
                    ));
                }
            };
        }

        match signal {
            Signal::Capsules { poses, activations } => Ok(NetworkOutput { poses, activations }),
            Signal::Features(_) => {
                Err("Le réseau doit contenir au moins une couche de capsules".to_string())
            }
        }
    }

    /// Classe prédite par échantillon: l'activation de classe la plus forte
    ///
    /// Suppose une couche terminale de classification (activations rang 2).
    pub fn predict(&mut self, input: &ArrayD<f32>) -> Result<Vec<usize>, String> {
        let output = self.forward(input)?;

        if output.activations.ndim() != 2 {
            return Err(format!(
                "predict exige des activations de classe rang 2, reçu rang {}",
                output.activations.ndim()
            ));
        }

        let (batch, classes) = (output.activations.shape()[0], output.activations.shape()[1]);
        let mut predictions = Vec::with_capacity(batch);

        for b in 0..batch {
            let mut best = 0;
            for c in 1..classes {
                if output.activations[[b, c]] > output.activations[[b, best]] {
                    best = c;
                }
            }
            predictions.push(best);
        }

        Ok(predictions)
    }

    /// Diagnostic rapide: une passe avant sur un batch nul
    pub fn diagnostic(&mut self) -> Result<NetworkOutput, String> {
        println!("🔍 DIAGNOSTIC RAPIDE");
        println!("   Couches: {}", self.layers.len());
        println!("   Input shape: {:?}", self.config.input_shape);

        let (h, w, c) = self.config.input_shape;
        let test_input = ArrayD::zeros(IxDyn(&[1, h, w, c]));

        let output = self.forward(&test_input)?;
        println!("   Poses: {:?}", output.poses.shape());
        println!("   Activations: {:?}", output.activations.shape());
        println!("✅ Modèle opérationnel");

        Ok(output)
    }
}
