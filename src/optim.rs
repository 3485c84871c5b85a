use anyhow::{Context, Result};
use candle_core::backprop::GradStore;
use candle_core::{Device, Tensor, Var};
use candle_nn::{ParamsAdamW, VarMap};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

// =============================================================================
// AdamW with persistent moments
// =============================================================================
//
// The update rule is the one of `candle_nn::AdamW`. That optimizer keeps its
// moments private, so they are held here as named `Var`s to be written and
// read back with the weights.

struct VarAdamW {
    name: String,
    var: Var,
    first_moment: Var,
    second_moment: Var,
}

/// AdamW whose moment estimates can be written next to the weights, so a
/// resumed run continues with the same optimizer state. `weight_decay = 0`
/// gives plain Adam.
pub struct AdamW {
    vars: Vec<VarAdamW>,
    step_t: usize,
    params: ParamsAdamW,
}

/// Hyperparameters stored alongside the moments.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OptimizerHyper {
    pub lr: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub eps: f64,
    pub weight_decay: f64,
}

impl From<&ParamsAdamW> for OptimizerHyper {
    fn from(params: &ParamsAdamW) -> Self {
        Self {
            lr: params.lr,
            beta1: params.beta1,
            beta2: params.beta2,
            eps: params.eps,
            weight_decay: params.weight_decay,
        }
    }
}

impl From<OptimizerHyper> for ParamsAdamW {
    fn from(h: OptimizerHyper) -> Self {
        ParamsAdamW {
            lr: h.lr,
            beta1: h.beta1,
            beta2: h.beta2,
            eps: h.eps,
            weight_decay: h.weight_decay,
        }
    }
}

impl AdamW {
    /// Tracks every float variable of `varmap`, ordered by name.
    pub fn from_varmap(varmap: &VarMap, params: ParamsAdamW) -> Result<Self> {
        let data = varmap
            .data()
            .lock()
            .map_err(|_| anyhow::anyhow!("Failed to lock varmap for optimizer setup"))?;
        let mut named: Vec<(String, Var)> = data
            .iter()
            .filter(|(_, var)| var.dtype().is_float())
            .map(|(name, var)| (name.clone(), var.clone()))
            .collect();
        named.sort_by(|a, b| a.0.cmp(&b.0));

        let vars = named
            .into_iter()
            .map(|(name, var)| {
                let first_moment = Var::zeros(var.shape(), var.dtype(), var.device())?;
                let second_moment = Var::zeros(var.shape(), var.dtype(), var.device())?;
                Ok(VarAdamW {
                    name,
                    var,
                    first_moment,
                    second_moment,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            vars,
            step_t: 0,
            params,
        })
    }

    pub fn params(&self) -> &ParamsAdamW {
        &self.params
    }

    pub fn set_params(&mut self, params: ParamsAdamW) {
        self.params = params;
    }

    pub fn learning_rate(&self) -> f64 {
        self.params.lr
    }

    pub fn set_learning_rate(&mut self, lr: f64) {
        self.params.lr = lr;
    }

    pub fn step_count(&self) -> usize {
        self.step_t
    }

    pub fn vars(&self) -> Vec<Var> {
        self.vars.iter().map(|v| v.var.clone()).collect()
    }

    /// Zero both moments and the step counter.
    pub fn reset(&mut self) -> Result<()> {
        self.step_t = 0;
        for v in &self.vars {
            v.first_moment.set(&v.first_moment.as_tensor().zeros_like()?)?;
            v.second_moment.set(&v.second_moment.as_tensor().zeros_like()?)?;
        }
        Ok(())
    }

    pub fn step(&mut self, grads: &GradStore) -> Result<()> {
        self.step_t += 1;
        let lr = self.params.lr;
        let lr_lambda = lr * self.params.weight_decay;
        let beta1 = self.params.beta1;
        let beta2 = self.params.beta2;
        let scale_m = 1f64 / (1f64 - beta1.powi(self.step_t as i32));
        let scale_v = 1f64 / (1f64 - beta2.powi(self.step_t as i32));
        for var in self.vars.iter() {
            let theta = &var.var;
            let m = &var.first_moment;
            let v = &var.second_moment;
            if let Some(g) = grads.get(theta) {
                let next_m = ((m.as_tensor() * beta1)? + (g * (1.0 - beta1))?)?;
                let next_v = ((v.as_tensor() * beta2)? + (g.sqr()? * (1.0 - beta2))?)?;
                let m_hat = (&next_m * scale_m)?;
                let v_hat = (&next_v * scale_v)?;
                let next_theta = (theta.as_tensor() * (1f64 - lr_lambda))?;
                let adjusted_grad = (m_hat / (v_hat.sqrt()? + self.params.eps)?)?;
                let next_theta = (next_theta - (adjusted_grad * lr)?)?;
                m.set(&next_m)?;
                v.set(&next_v)?;
                theta.set(&next_theta)?;
            }
        }
        Ok(())
    }

    /// Moments keyed by variable name plus the step counter, as safetensors.
    /// Hyperparameters go to a JSON sidecar (`<file>.json`).
    pub fn save_state<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let mut tensors = HashMap::new();
        tensors.insert(
            "adamw.step_t".to_string(),
            Tensor::from_slice(&[self.step_t as u32], 1, &Device::Cpu)?,
        );
        for var in &self.vars {
            tensors.insert(
                format!("adamw.m.{}", var.name),
                var.first_moment.as_tensor().detach(),
            );
            tensors.insert(
                format!("adamw.v.{}", var.name),
                var.second_moment.as_tensor().detach(),
            );
        }
        candle_core::safetensors::save(&tensors, path)?;
        let hyper = OptimizerHyper::from(&self.params);
        std::fs::write(hyper_path(path), serde_json::to_vec(&hyper)?)?;
        Ok(())
    }

    /// All-or-nothing: on error the current moments are left untouched.
    pub fn load_state<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let path = path.as_ref();
        let device = self
            .vars
            .first()
            .map(|v| v.var.device().clone())
            .unwrap_or(Device::Cpu);
        let tensors = candle_core::safetensors::load(path, &device)
            .with_context(|| format!("Failed to read optimizer state {}", path.display()))?;
        let step_t = tensors
            .get("adamw.step_t")
            .context("Missing adamw.step_t in optimizer state")?
            .to_vec1::<u32>()?;

        let mut staged = Vec::with_capacity(self.vars.len());
        for var in &self.vars {
            let m = tensors
                .get(&format!("adamw.m.{}", var.name))
                .with_context(|| format!("Missing first moment for {}", var.name))?;
            let v = tensors
                .get(&format!("adamw.v.{}", var.name))
                .with_context(|| format!("Missing second moment for {}", var.name))?;
            if m.shape() != var.var.shape() || v.shape() != var.var.shape() {
                anyhow::bail!("Optimizer moment shape mismatch for {}", var.name);
            }
            staged.push((m.to_dtype(var.var.dtype())?, v.to_dtype(var.var.dtype())?));
        }
        let hyper = match std::fs::read(hyper_path(path)) {
            Ok(bytes) => Some(
                serde_json::from_slice::<OptimizerHyper>(&bytes)
                    .context("Failed to parse optimizer hyperparameters")?,
            ),
            Err(_) => None,
        };

        for (var, (m, v)) in self.vars.iter().zip(staged) {
            var.first_moment.set(&m)?;
            var.second_moment.set(&v)?;
        }
        self.step_t = step_t.first().copied().unwrap_or(0) as usize;
        if let Some(hyper) = hyper {
            self.params = hyper.into();
        }
        Ok(())
    }
}

fn hyper_path(path: &Path) -> std::path::PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".json");
    path.with_file_name(name)
}

// =============================================================================
// Gradient clipping
// =============================================================================

/// Rescale gradients in place so their global L2 norm is at most `max_norm`.
/// Returns the norm measured before clipping. `max_norm <= 0` disables it.
pub fn clip_grad_norm(grads: &mut GradStore, vars: &[Var], max_norm: f64) -> Result<f64> {
    let mut total_norm_sq = 0.0f64;
    for var in vars {
        if let Some(g) = grads.get(var.as_tensor()) {
            total_norm_sq += g
                .sqr()?
                .sum_all()?
                .to_dtype(candle_core::DType::F64)?
                .to_scalar::<f64>()?;
        }
    }
    let total_norm = total_norm_sq.sqrt();
    if max_norm > 0.0 && total_norm > max_norm {
        let clip_coef = max_norm / (total_norm + 1e-6);
        for var in vars {
            if let Some(g) = grads.get(var.as_tensor()) {
                let clipped = (g * clip_coef)?;
                grads.insert(var.as_tensor(), clipped);
            }
        }
    }
    Ok(total_norm)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;
    use candle_nn::{Init, VarBuilder};

    fn tiny_varmap() -> VarMap {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        vb.get_with_hints(3, "w", Init::Const(1.0)).unwrap();
        varmap
    }

    fn quadratic_grads(varmap: &VarMap, scale: f64) -> (GradStore, Vec<Var>) {
        let vars = varmap.all_vars();
        let loss = (vars[0].as_tensor().sqr().unwrap() * scale)
            .unwrap()
            .sum_all()
            .unwrap();
        (loss.backward().unwrap(), vars)
    }

    #[test]
    fn test_clip_reports_pre_clip_norm() {
        let varmap = tiny_varmap();
        let (mut grads, vars) = quadratic_grads(&varmap, 1.0);
        // d/dw sum(w^2) = 2w = [2,2,2] -> norm sqrt(12)
        let norm = clip_grad_norm(&mut grads, &vars, 1.0).unwrap();
        assert!((norm - 12f64.sqrt()).abs() < 1e-5);
        let clipped = grads.get(vars[0].as_tensor()).unwrap();
        let clipped_norm: f32 = clipped.sqr().unwrap().sum_all().unwrap().to_scalar().unwrap();
        assert!((clipped_norm.sqrt() - 1.0).abs() < 1e-3);
    }

    #[test]
    fn test_clip_leaves_small_gradients() {
        let varmap = tiny_varmap();
        let (mut grads, vars) = quadratic_grads(&varmap, 0.01);
        clip_grad_norm(&mut grads, &vars, 5.0).unwrap();
        let g: Vec<f32> = grads.get(vars[0].as_tensor()).unwrap().to_vec1().unwrap();
        assert!(g.iter().all(|x| (x - 0.02).abs() < 1e-6));
    }

    #[test]
    fn test_step_matches_candle_adamw() {
        use candle_nn::Optimizer;

        let params = ParamsAdamW {
            lr: 0.05,
            weight_decay: 0.01,
            ..Default::default()
        };
        let ours_map = tiny_varmap();
        let mut ours = AdamW::from_varmap(&ours_map, params.clone()).unwrap();
        let candle_map = tiny_varmap();
        let mut reference = candle_nn::AdamW::new(candle_map.all_vars(), params).unwrap();

        for _ in 0..3 {
            let (grads, _) = quadratic_grads(&ours_map, 1.0);
            ours.step(&grads).unwrap();
            let (grads, _) = quadratic_grads(&candle_map, 1.0);
            reference.step(&grads).unwrap();
        }
        let a: Vec<f32> = ours_map.all_vars()[0].as_tensor().to_vec1().unwrap();
        let b: Vec<f32> = candle_map.all_vars()[0].as_tensor().to_vec1().unwrap();
        for (x, y) in a.iter().zip(&b) {
            assert!((x - y).abs() < 1e-6, "{x} != {y}");
        }
    }

    #[test]
    fn test_step_moves_towards_minimum() {
        let varmap = tiny_varmap();
        let mut opt = AdamW::from_varmap(
            &varmap,
            ParamsAdamW {
                lr: 0.1,
                weight_decay: 0.0,
                ..Default::default()
            },
        )
        .unwrap();
        let (grads, vars) = quadratic_grads(&varmap, 1.0);
        opt.step(&grads).unwrap();
        let w: Vec<f32> = vars[0].as_tensor().to_vec1().unwrap();
        assert!(w.iter().all(|x| *x < 1.0));
        assert_eq!(opt.step_count(), 1);
    }

    #[test]
    fn test_state_round_trip_and_reset() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("optimizer.checkpoint");
        let varmap = tiny_varmap();
        let mut opt = AdamW::from_varmap(&varmap, ParamsAdamW::default()).unwrap();
        let (grads, _) = quadratic_grads(&varmap, 1.0);
        opt.step(&grads).unwrap();
        opt.step(&grads).unwrap();
        opt.set_learning_rate(0.5);
        opt.save_state(&path).unwrap();

        let mut fresh = AdamW::from_varmap(&varmap, ParamsAdamW::default()).unwrap();
        fresh.load_state(&path).unwrap();
        assert_eq!(fresh.step_count(), 2);
        assert!((fresh.learning_rate() - 0.5).abs() < 1e-12);

        fresh.reset().unwrap();
        assert_eq!(fresh.step_count(), 0);
    }

    #[test]
    fn test_failed_load_keeps_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("optimizer.checkpoint");
        std::fs::write(&path, b"not safetensors").unwrap();
        let varmap = tiny_varmap();
        let mut opt = AdamW::from_varmap(&varmap, ParamsAdamW::default()).unwrap();
        let (grads, _) = quadratic_grads(&varmap, 1.0);
        opt.step(&grads).unwrap();
        assert!(opt.load_state(&path).is_err());
        assert_eq!(opt.step_count(), 1);
    }
}
