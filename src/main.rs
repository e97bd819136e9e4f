mod model;

use ndarray::{ArrayD, IxDyn};

use model::{
    config::{
        Activation, CompatibilityPolicy, LayerConfig, NetworkConfig, Padding, RoutingConfig,
        RoutingKind,
    },
    ModelBuilder,
};

fn main() {
    println!("🚀 CAPSNET - ROUTAGE PAR ACCORD");
    println!("===============================\n");

    // Configuration du réseau
    let network_config = NetworkConfig {
        input_shape: (16, 16, 1),
        layers: vec![
            // Couche convolutive d'entrée
            LayerConfig::Conv2d {
                in_channels: 1,
                out_channels: 16,
                kernel_size: 3,
                stride: 1,
                padding: Padding::Same,
                activation: Activation::ReLU,
            },
            // Capsules primaires
            LayerConfig::PrimaryCapsules {
                groups: 8,
                pose_dim: (4, 4),
                kernel_size: 1,
            },
            // Capsules convolutives routées par noyau
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
            // Capsules entièrement connectées routées par NiN
            LayerConfig::FullyConnectedCapsules {
                output_capsules: 4,
                routing: RoutingKind::NiN {
                    degree: 4,
                    compatibility_layers: vec![16],
                    activation_layers: vec![16],
                    activate: true,
                },
            },
            // Couche terminale de classification
            LayerConfig::ClassCapsules { normalized: true },
        ],
        routing: RoutingConfig {
            design_iterations: 3,
            verbose: true,
            ..RoutingConfig::default()
        },
    };

    // Construction du modèle
    println!("🏗️  Construction du modèle...");
    let mut model = ModelBuilder::new()
        .with_config(network_config)
        .build()
        .expect("Erreur lors de la construction du modèle");

    println!("✅ Modèle construit avec succès\n");

    // Diagnostic
    model
        .diagnostic()
        .expect("Erreur lors du diagnostic du modèle");
    println!();

    // Passe avant sur un batch synthétique
    println!("🔮 Passe avant sur un batch synthétique...");
    let mut input = ArrayD::zeros(IxDyn(&[4, 16, 16, 1]));
    for (n, v) in input.iter_mut().enumerate() {
        *v = (n as f32 * 0.07).sin().abs();
    }

    let output = model
        .forward(&input)
        .expect("Erreur lors de la passe avant");

    println!("✅ Sortie:");
    println!("   Poses: {:?}", output.poses.shape());
    println!("   Activations: {:?}", output.activations.shape());

    let predictions = model
        .predict(&input)
        .expect("Erreur lors de la prédiction");
    println!("   Classes prédites: {:?}", predictions);

    println!("\n🎉 TERMINÉ !");
}
