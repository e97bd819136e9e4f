use serde::{Deserialize, Serialize};

/// Fonction d'activation élément par élément
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub enum Activation {
    ReLU,
    LeakyReLU(f32),
    Sigmoid,
    Tanh,
    None,
}

/// Mode de remplissage des extractions de fenêtres et convolutions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Padding {
    Valid,
    Same,
}

impl Padding {
    pub fn parse(value: &str) -> Result<Self, String> {
        match value {
            "VALID" => Ok(Padding::Valid),
            "SAME" => Ok(Padding::Same),
            other => Err(format!("padding invalide: {} (attendu VALID ou SAME)", other)),
        }
    }
}

/// Normalisation des coefficients le long de l'axe de multiplicité
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Normalization {
    Softmax,
    /// Division par la somme plus epsilon
    SumNormalize,
}

/// Les deux formules de compatibilité du routage par noyau
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompatibilityPolicy {
    /// activations * accord / alpha²
    Scaled,
    /// activations^(beta²/(alpha²+beta²)) * exp(accord/(alpha²+beta²))
    Annealed,
}

/// Paramètres communs des procédures de routage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingConfig {
    pub design_iterations: usize,
    pub normalization: Normalization,
    pub epsilon: f32,
    pub bias: bool,
    pub verbose: bool,
    pub seed: u64,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            design_iterations: 3,
            normalization: Normalization::Softmax,
            epsilon: 1e-6,
            bias: false,
            verbose: false,
            seed: 42,
        }
    }
}

impl RoutingConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.design_iterations == 0 {
            return Err("design_iterations doit être >= 1".to_string());
        }
        if self.epsilon <= 0.0 {
            return Err("epsilon doit être strictement positif".to_string());
        }
        Ok(())
    }
}

/// Choix de la règle de routage d'une couche de capsules
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RoutingKind {
    Kernel {
        policy: CompatibilityPolicy,
        prior: bool,
        activate: bool,
    },
    NiN {
        degree: usize,
        compatibility_layers: Vec<usize>,
        activation_layers: Vec<usize>,
        activate: bool,
    },
}

/// Configuration d'une couche du réseau
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum LayerConfig {
    Conv2d {
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        stride: usize,
        padding: Padding,
        activation: Activation,
    },
    PrimaryCapsules {
        groups: usize,
        pose_dim: (usize, usize),
        kernel_size: usize,
    },
    ConvCapsules {
        output_capsules: usize,
        kernel_size: usize,
        stride: usize,
        padding: Padding,
        routing: RoutingKind,
    },
    FullyConnectedCapsules {
        output_capsules: usize,
        routing: RoutingKind,
    },
    ClassCapsules {
        normalized: bool,
    },
}

/// Configuration du réseau complet (entrée en disposition { h, w, canaux })
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub input_shape: (usize, usize, usize),
    pub layers: Vec<LayerConfig>,
    pub routing: RoutingConfig,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            input_shape: (16, 16, 1),
            layers: vec![
                LayerConfig::Conv2d {
                    in_channels: 1,
                    out_channels: 16,
                    kernel_size: 3,
                    stride: 1,
                    padding: Padding::Same,
                    activation: Activation::ReLU,
                },
                LayerConfig::PrimaryCapsules {
                    groups: 8,
                    pose_dim: (4, 4),
                    kernel_size: 1,
                },
                LayerConfig::ConvCapsules {
                    output_capsules: 10,
                    kernel_size: 3,
                    stride: 2,
                    padding: Padding::Valid,
                    routing: RoutingKind::Kernel {
                        policy: CompatibilityPolicy::Scaled,
                        prior: false,
                        activate: true,
                    },
                },
                LayerConfig::ClassCapsules { normalized: true },
            ],
            routing: RoutingConfig::default(),
        }
    }
}

impl NetworkConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.layers.is_empty() {
            return Err("Le réseau doit avoir au moins une couche".to_string());
        }

        self.routing.validate()?;

        for (idx, layer) in self.layers.iter().enumerate() {
            match layer {
                LayerConfig::Conv2d {
                    in_channels,
                    out_channels,
                    kernel_size,
                    stride,
                    ..
                } => {
                    if *in_channels == 0 || *out_channels == 0 {
                        return Err(format!("couche {}: canaux nuls", idx));
                    }
                    if *kernel_size == 0 || *stride == 0 {
                        return Err(format!("couche {}: kernel_size et stride doivent être >= 1", idx));
                    }
                }
                LayerConfig::PrimaryCapsules {
                    groups, pose_dim, kernel_size,
                } => {
                    if *groups == 0 {
                        return Err(format!("couche {}: groups doit être >= 1", idx));
                    }
                    if pose_dim.0 == 0 || pose_dim.1 == 0 {
                        return Err(format!("couche {}: pose_dim nul", idx));
                    }
                    if *kernel_size == 0 {
                        return Err(format!("couche {}: kernel_size doit être >= 1", idx));
                    }
                }
                LayerConfig::ConvCapsules {
                    output_capsules,
                    kernel_size,
                    stride,
                    routing,
                    ..
                } => {
                    if *output_capsules == 0 {
                        return Err(format!("couche {}: output_capsules doit être >= 1", idx));
                    }
                    if *kernel_size == 0 || *stride == 0 {
                        return Err(format!("couche {}: kernel_size et stride doivent être >= 1", idx));
                    }
                    Self::validate_routing(idx, routing)?;
                }
                LayerConfig::FullyConnectedCapsules {
                    output_capsules,
                    routing,
                } => {
                    if *output_capsules == 0 {
                        return Err(format!("couche {}: output_capsules doit être >= 1", idx));
                    }
                    Self::validate_routing(idx, routing)?;
                }
                LayerConfig::ClassCapsules { .. } => {}
            }
        }

        Ok(())
    }

    fn validate_routing(idx: usize, routing: &RoutingKind) -> Result<(), String> {
        if let RoutingKind::NiN { degree, .. } = routing {
            if *degree == 0 {
                return Err(format!("couche {}: degree doit être >= 1", idx));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(NetworkConfig::default().validate().is_ok());
    }

    #[test]
    fn test_empty_network_rejected() {
        let config = NetworkConfig {
            layers: vec![],
            ..NetworkConfig::default()
        };

        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_iterations_rejected() {
        let config = NetworkConfig {
            routing: RoutingConfig {
                design_iterations: 0,
                ..RoutingConfig::default()
            },
            ..NetworkConfig::default()
        };

        assert!(config.validate().is_err());
    }

    #[test]
    fn test_padding_parse() {
        assert_eq!(Padding::parse("VALID").unwrap(), Padding::Valid);
        assert_eq!(Padding::parse("SAME").unwrap(), Padding::Same);
        assert!(Padding::parse("CIRCULAR").is_err());
    }

    #[test]
    fn test_config_roundtrip_json() {
        let config = NetworkConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let back: NetworkConfig = serde_json::from_str(&json).unwrap();

        assert_eq!(back.layers.len(), config.layers.len());
    }
}
