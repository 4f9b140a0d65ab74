// THEORY:
// `ModelState` is everything that was learned: the backbone weights, the denoiser
// template, and optionally an exponential-moving-average shadow of the trainable
// parts of both. It is an explicitly owned value. Fitting and domain adaptation take
// it by `&mut`, inference reads it, and nothing else holds a copy.
//
// Key architectural principles:
// 1.  **Versioned**: every fit or adaptation that changes weights bumps `version`,
//     which is surfaced in evaluation reports.
// 2.  **Snapshot / restore**: a caller that wants rollback takes a `snapshot()`
//     before adapting and `restore()`s it if the outcome is unacceptable.
// 3.  **EMA shadow**: only trainable parameters are averaged (the template, and each
//     layer's γ and β). Frozen kernels and running statistics are read from the
//     live weights. When a shadow exists, inference uses it.
// 4.  **Plain serde**: persistence format and location belong to the caller. The
//     JSON helpers exist for the common case.

use crate::core_modules::denoiser::TemplateWeights;
use crate::core_modules::feature_backbone::BackboneWeights;
use crate::core_modules::tensor::tensor::Tensor3;
use crate::error::{InspectError, Result};
use ndarray::Array1;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Averaged copy of the trainable parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmaShadow {
    pub rate: f32,
    /// Number of updates folded in so far; drives the warmup decay.
    pub updates: u64,
    pub template: Tensor3,
    pub gammas: Vec<Array1<f32>>,
    pub betas: Vec<Array1<f32>>,
}

impl EmaShadow {
    fn from_weights(rate: f32, backbone: &BackboneWeights, denoiser: &TemplateWeights) -> Self {
        Self {
            rate,
            updates: 0,
            template: denoiser.template.clone(),
            gammas: backbone.layers.iter().map(|l| l.gamma.clone()).collect(),
            betas: backbone.layers.iter().map(|l| l.beta.clone()).collect(),
        }
    }

    /// `min(rate, (1 + n) / (10 + n))`: early updates move the shadow faster.
    pub fn decay(&self) -> f32 {
        let n = self.updates as f32;
        self.rate.min((1.0 + n) / (10.0 + n))
    }

    fn blend_template(&mut self, template: &Tensor3, decay: f32) {
        self.template
            .zip_mut_with(template, |s, &v| *s = decay * *s + (1.0 - decay) * v);
    }

    fn blend_backbone(&mut self, backbone: &BackboneWeights, decay: f32) {
        for (index, layer) in backbone.layers.iter().enumerate() {
            if let Some(gamma) = self.gammas.get_mut(index) {
                gamma.zip_mut_with(&layer.gamma, |s, &v| *s = decay * *s + (1.0 - decay) * v);
            }
            if let Some(beta) = self.betas.get_mut(index) {
                beta.zip_mut_with(&layer.beta, |s, &v| *s = decay * *s + (1.0 - decay) * v);
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelState {
    pub version: u64,
    pub backbone: BackboneWeights,
    pub denoiser: TemplateWeights,
    pub ema: Option<EmaShadow>,
}

impl ModelState {
    pub fn new(backbone: BackboneWeights, denoiser: TemplateWeights) -> Self {
        Self {
            version: 0,
            backbone,
            denoiser,
            ema: None,
        }
    }

    pub fn snapshot(&self) -> ModelState {
        self.clone()
    }

    pub fn restore(&mut self, snapshot: ModelState) {
        tracing::info!(from = self.version, to = snapshot.version, "model state restored");
        *self = snapshot;
    }

    pub fn bump_version(&mut self) {
        self.version += 1;
    }

    /// Starts an EMA shadow from the current weights, replacing any existing one.
    pub fn enable_ema(&mut self, rate: f32) {
        self.ema = Some(EmaShadow::from_weights(rate, &self.backbone, &self.denoiser));
    }

    /// Folds the current template into the shadow. No-op without a shadow.
    pub fn update_template_ema(&mut self) {
        if let Some(shadow) = self.ema.as_mut() {
            let decay = shadow.decay();
            shadow.blend_template(&self.denoiser.template, decay);
            shadow.updates += 1;
        }
    }

    /// Folds the current backbone affine parameters into the shadow. No-op without a shadow.
    pub fn update_backbone_ema(&mut self) {
        if let Some(shadow) = self.ema.as_mut() {
            let decay = shadow.decay();
            shadow.blend_backbone(&self.backbone, decay);
            shadow.updates += 1;
        }
    }

    /// Template inference should use.
    pub fn effective_denoiser(&self) -> TemplateWeights {
        match &self.ema {
            Some(shadow) => TemplateWeights {
                template: shadow.template.clone(),
            },
            None => self.denoiser.clone(),
        }
    }

    /// Backbone inference should use: live kernels and statistics, shadowed γ and β.
    pub fn effective_backbone(&self) -> BackboneWeights {
        let mut weights = self.backbone.clone();
        if let Some(shadow) = &self.ema {
            for (index, layer) in weights.layers.iter_mut().enumerate() {
                if let Some(gamma) = shadow.gammas.get(index) {
                    layer.gamma.assign(gamma);
                }
                if let Some(beta) = shadow.betas.get(index) {
                    layer.beta.assign(beta);
                }
            }
        }
        weights
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| InspectError::io(parent, e))?;
            }
        }
        std::fs::write(path, self.to_json()?).map_err(|e| InspectError::io(path, e))?;
        tracing::info!(path = %path.display(), version = self.version, "model state saved");
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| InspectError::io(path, e))?;
        Self::from_json(&text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_modules::feature_backbone::FeatureBackbone;
    use crate::core_modules::noise::{NoiseKind, NoiseSource};

    fn state() -> ModelState {
        let mut noise = NoiseSource::from_seed(2, NoiseKind::Gaussian);
        let backbone = FeatureBackbone::new(3, &[2, 4], &mut noise).unwrap();
        ModelState::new(
            backbone.weights().clone(),
            TemplateWeights {
                template: Tensor3::zeros((3, 4, 4)),
            },
        )
    }

    #[test]
    fn restore_rolls_back_weights_and_version() {
        let mut model = state();
        let snapshot = model.snapshot();
        model.backbone.layers[0].gamma.fill(3.0);
        model.bump_version();
        model.restore(snapshot.clone());
        assert_eq!(model, snapshot);
    }

    #[test]
    fn ema_warmup_decay_grows_towards_rate() {
        let mut model = state();
        model.enable_ema(0.999);
        let shadow = model.ema.as_ref().unwrap();
        assert!((shadow.decay() - 0.1).abs() < 1e-6);
        model.denoiser.template.fill(1.0);
        model.update_template_ema();
        let shadow = model.ema.as_ref().unwrap();
        assert!((shadow.template[[0, 0, 0]] - 0.9).abs() < 1e-6);
        assert!(shadow.decay() > 0.1);
    }

    #[test]
    fn ema_never_touches_kernels() {
        let mut model = state();
        model.enable_ema(0.5);
        model.backbone.layers[1].beta.fill(2.0);
        model.update_backbone_ema();
        let effective = model.effective_backbone();
        assert_eq!(effective.layers[1].kernel, model.backbone.layers[1].kernel);
        assert!(effective.layers[1].beta.iter().all(|b| *b > 0.0 && *b < 2.0));
    }

    #[test]
    fn json_round_trip_through_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("model.json");
        let mut model = state();
        model.enable_ema(0.9);
        model.bump_version();
        model.save(&path).unwrap();
        assert_eq!(ModelState::load(&path).unwrap(), model);
    }
}
