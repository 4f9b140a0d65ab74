// THEORY:
// The numeric core of the engine. Each module owns one stage of the diffusion
// inspection chain and knows nothing about files, threads, or reports; those live
// in `pipeline` and `parallel_pipeline`.
//
// Key architectural principles:
// 1.  **Bottom-up layering**: `tensor` and `noise` have no siblings as dependencies;
//     every later module builds only on the ones listed above it.
// 2.  **Explicit randomness**: nothing here draws from a global RNG. Every stochastic
//     call receives a `NoiseSource` from the caller.

pub mod tensor;
pub mod noise;
pub mod noise_scheduler;
pub mod latent_codec;
pub mod feature_backbone;
pub mod denoiser;
pub mod model_state;
pub mod trajectory;
pub mod memory_bank;
pub mod anomaly_map;
pub mod threshold;
pub mod domain_adapter;
