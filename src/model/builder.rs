use super::capsule::{
    CapsuleClassLayer, CapsuleLayer, FullyConnectedCapsuleLayer, PrimaryCapsuleLayer,
};
use super::config::{LayerConfig, NetworkConfig, RoutingConfig, RoutingKind};
use super::core::{CapsuleNetwork, NetworkLayer};
use super::kernel_routing::{kernel_routing, kernel_routing_with_prior};
use super::layers::ConvLayer;
use super::metric::{DotProductKernel, SquaredDistanceMetric};
use super::nin_routing::nin_routing;
use super::routing::Routing;
use super::transform::LinearTransform;

/// Constructeur de modèle
pub struct ModelBuilder {
    config: Option<NetworkConfig>,
}

impl ModelBuilder {
    pub fn new() -> Self {
        Self { config: None }
    }

    pub fn with_config(mut self, config: NetworkConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn build(self) -> Result<CapsuleNetwork, String> {
        let config = self
            .config
            .ok_or_else(|| "Configuration réseau requise".to_string())?;

        config.validate()?;

        let layers = Self::build_layers(&config)?;

        Ok(CapsuleNetwork::new(config, layers))
    }

    fn build_layers(config: &NetworkConfig) -> Result<Vec<NetworkLayer>, String> {
        let mut layers = Vec::new();
        let base_seed = config.routing.seed;

        for (i, layer_config) in config.layers.iter().enumerate() {
            // Graine décalée par couche: poids distincts, réseau reproductible
            let seed = base_seed.wrapping_add(i as u64 * 1000);

            let layer = match layer_config {
                LayerConfig::Conv2d {
                    in_channels,
                    out_channels,
                    kernel_size,
                    stride,
                    padding,
                    activation,
                } => NetworkLayer::Conv(ConvLayer::new(
                    *in_channels,
                    *out_channels,
                    *kernel_size,
                    *stride,
                    *padding,
                    *activation,
                    seed,
                )),

                LayerConfig::PrimaryCapsules {
                    groups,
                    pose_dim,
                    kernel_size,
                } => {
                    let in_channels = Self::incoming_channels(config, i)?;
                    NetworkLayer::Primary(PrimaryCapsuleLayer::new(
                        in_channels,
                        *groups,
                        *pose_dim,
                        *kernel_size,
                        seed,
                    ))
                }

                LayerConfig::ConvCapsules {
                    output_capsules,
                    kernel_size,
                    stride,
                    padding,
                    routing,
                } => {
                    let procedure =
                        Self::build_routing(routing, &config.routing, &format!("layer_{}", i));
                    NetworkLayer::Capsules(CapsuleLayer::new(
                        procedure,
                        Box::new(LinearTransform::new(*output_capsules, seed)),
                        *kernel_size,
                        *stride,
                        *padding,
                        0,
                        &format!("_{}", i),
                    )?)
                }

                LayerConfig::FullyConnectedCapsules {
                    output_capsules,
                    routing,
                } => {
                    let procedure =
                        Self::build_routing(routing, &config.routing, &format!("layer_{}", i));
                    NetworkLayer::FullyConnected(FullyConnectedCapsuleLayer::new(
                        procedure,
                        Box::new(LinearTransform::new(*output_capsules, seed)),
                        0,
                        &format!("_{}", i),
                    )?)
                }

                LayerConfig::ClassCapsules { normalized } => {
                    NetworkLayer::Class(CapsuleClassLayer::new(*normalized, &format!("_{}", i)))
                }
            };

            layers.push(layer);
        }

        Ok(layers)
    }

    /// Canaux sortants de la couche précédant la couche primaire
    fn incoming_channels(config: &NetworkConfig, idx: usize) -> Result<usize, String> {
        if idx == 0 {
            return Ok(config.input_shape.2);
        }
        match &config.layers[idx - 1] {
            LayerConfig::Conv2d { out_channels, .. } => Ok(*out_channels),
            other => Err(format!(
                "couche {}: PrimaryCapsules doit suivre l'entrée ou une Conv2d, pas {:?}",
                idx, other
            )),
        }
    }

    fn build_routing(
        kind: &RoutingKind,
        config: &RoutingConfig,
        name: &str,
    ) -> Box<dyn Routing> {
        match kind {
            RoutingKind::Kernel {
                policy,
                prior,
                activate,
            } => {
                if *prior {
                    Box::new(kernel_routing_with_prior(
                        Box::new(DotProductKernel),
                        Box::new(SquaredDistanceMetric),
                        *policy,
                        *activate,
                        name,
                        config.clone(),
                    ))
                } else {
                    Box::new(kernel_routing(
                        Box::new(DotProductKernel),
                        Box::new(SquaredDistanceMetric),
                        *policy,
                        *activate,
                        name,
                        config.clone(),
                    ))
                }
            }
            RoutingKind::NiN {
                degree,
                compatibility_layers,
                activation_layers,
                activate,
            } => Box::new(nin_routing(
                Box::new(SquaredDistanceMetric),
                *degree,
                compatibility_layers.clone(),
                activation_layers.clone(),
                *activate,
                name,
                config.clone(),
            )),
        }
    }
}

impl Default for ModelBuilder {
    fn default() -> Self {
        Self::new()
    }
}
