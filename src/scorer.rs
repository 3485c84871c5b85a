use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::Write;

use anyhow::{Context, Result, anyhow, bail};
use candle_core::{DType, Tensor};
use candle_nn::{ParamsAdamW, VarBuilder, VarMap};

use crate::backend::{
    LoadCheckpointPayload, LoadEmbeddingPayload, LossReport, OptimizerSettings,
    SaveFirstLastPayload, ScoringBackend, TrainStepPayload, UpdateCommand, UpdateOutcome,
};
use crate::checkpoint::{GenerationalCheckpoint, Slot};
use crate::config::PpoConfig;
use crate::context::ExecContext;
use crate::drrn::encode_candidates;
use crate::encoder::Encoder;
use crate::model::{ActionHeads, DrrnNet, ValueHead};
use crate::optim::{AdamW, clip_grad_norm};
use crate::ppo::{PpoTargets, categorical, ppo_loss};
use crate::prompt::diagnostic_prompts;
use crate::rollout::{Scored, Scorer, softmax};

pub const PRETRAINED_FILE: &str = "model.safetensors";
pub const DISTRIBUTION_FILE: &str = "distrib.csv";

/// In-process scoring backend: a [`DrrnNet`] scores every candidate and a
/// [`ValueHead`] on the state encoding estimates its value. With
/// [`ActionHeads`] the candidates are instead scored from the state encoding
/// as a fixed action list.
pub struct LocalScorer {
    ctx: ExecContext,
    varmap: VarMap,
    net: DrrnNet,
    value_head: ValueHead,
    action_heads: Option<ActionHeads>,
    encoder: Box<dyn Encoder>,
    optimizer: AdamW,
    embedding_loaded: bool,
    checkpoint_loaded: bool,
    first_last_saved: bool,
}

impl LocalScorer {
    pub fn new(ctx: ExecContext, encoder: Box<dyn Encoder>, config: &PpoConfig) -> Result<Self> {
        Self::build(ctx, encoder, config, None)
    }

    /// Scores `n_actions` fixed actions with [`ActionHeads`]; every candidate
    /// list must then hold exactly `n_actions` entries.
    pub fn with_action_heads(
        ctx: ExecContext,
        encoder: Box<dyn Encoder>,
        config: &PpoConfig,
        n_actions: usize,
    ) -> Result<Self> {
        Self::build(ctx, encoder, config, Some(n_actions))
    }

    fn build(
        ctx: ExecContext,
        encoder: Box<dyn Encoder>,
        config: &PpoConfig,
        n_actions: Option<usize>,
    ) -> Result<Self> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &ctx.device);
        let net = DrrnNet::new(
            vb.clone(),
            encoder.vocab_size(),
            config.embedding_dim,
            config.hidden_dim,
        )?;
        let value_head = ValueHead::new(vb.pp("value_head"), config.hidden_dim, config.value_hidden_dim)?;
        let action_heads = n_actions
            .map(|n| ActionHeads::new(vb.pp("action_heads"), config.hidden_dim, config.value_hidden_dim, n))
            .transpose()?;
        let optimizer = AdamW::from_varmap(
            &varmap,
            adam_params(OptimizerSettings {
                lr: config.lr,
                beta1: config.beta1,
                beta2: config.beta2,
                adam_eps: config.adam_eps,
            }),
        )?;
        Ok(Self {
            ctx,
            varmap,
            net,
            value_head,
            action_heads,
            encoder,
            optimizer,
            embedding_loaded: false,
            checkpoint_loaded: false,
            first_last_saved: false,
        })
    }

    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    pub fn optimizer(&self) -> &AdamW {
        &self.optimizer
    }

    fn encode_contexts(&self, contexts: &[String]) -> Vec<Vec<u32>> {
        contexts.iter().map(|c| self.encoder.encode(c)).collect()
    }

    /// Candidate logits per context and the `(batch,)` value tensor.
    fn forward(&self, contexts: &[String], candidates: &[Vec<String>]) -> Result<(Vec<Tensor>, Tensor)> {
        let states = self.encode_contexts(contexts);
        let state_refs: Vec<&[u32]> = states.iter().map(|s| s.as_slice()).collect();
        let encoded = self.net.encode_states(&state_refs)?;
        let logits = match &self.action_heads {
            Some(heads) => {
                if candidates.len() != contexts.len() {
                    bail!("{} contexts but {} candidate lists", contexts.len(), candidates.len());
                }
                if let Some(c) = candidates.iter().find(|c| c.len() != heads.n_actions()) {
                    bail!(
                        "action heads score {} actions but {} candidates were given",
                        heads.n_actions(),
                        c.len()
                    );
                }
                let scores = heads.forward(&encoded)?;
                (0..contexts.len())
                    .map(|i| scores.get(i))
                    .collect::<candle_core::Result<Vec<_>>>()?
            }
            None => {
                let acts = encode_candidates(self.encoder.as_ref(), candidates);
                let act_refs: Vec<&[Vec<u32>]> = acts.iter().map(|a| a.as_slice()).collect();
                self.net.forward_encoded(&encoded, &act_refs)?
            }
        };
        let values = self.value_head.forward(&encoded)?;
        Ok((logits, values))
    }

    /// Appends the softmax over the candidates of every diagnostic prompt as one
    /// row of `distrib.csv`.
    fn write_distribution(&self, payload: &TrainStepPayload) -> Result<()> {
        let Some(subgoals) = payload.candidates.first() else {
            return Ok(());
        };
        let prompts = diagnostic_prompts(subgoals, payload.template_test);
        let candidates = vec![subgoals.clone(); prompts.len()];
        let row: Vec<String> = self
            .score(&prompts, &candidates)?
            .iter()
            .flat_map(|s| softmax(&s.logits))
            .map(|p| p.to_string())
            .collect();

        std::fs::create_dir_all(&payload.experiment_path)
            .with_context(|| format!("Failed to create {}", payload.experiment_path.display()))?;
        let path = payload.experiment_path.join(DISTRIBUTION_FILE);
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("Failed to open {}", path.display()))?;
        writeln!(file, "{}", row.join(","))?;
        Ok(())
    }

    fn train_step(&mut self, payload: &TrainStepPayload) -> Result<LossReport> {
        let n = payload.contexts.len();
        if n == 0 {
            bail!("empty training minibatch");
        }
        for (name, len) in [
            ("candidates", payload.candidates.len()),
            ("actions", payload.actions.len()),
            ("old_values", payload.old_values.len()),
            ("old_log_probs", payload.old_log_probs.len()),
            ("advantages", payload.advantages.len()),
            ("returns", payload.returns.len()),
        ] {
            if len != n {
                bail!("minibatch has {n} contexts but {len} {name}");
            }
        }
        let width = payload.candidates[0].len();
        if payload.candidates.iter().any(|c| c.len() != width) {
            bail!("every context of a minibatch needs the same number of candidates");
        }
        if let Some(&a) = payload.actions.iter().find(|&&a| a >= width) {
            bail!("action {a} out of range for {width} candidates");
        }

        if payload.first_call && self.ctx.is_coordinator() {
            self.write_distribution(payload)?;
        }

        let device = &self.ctx.device;
        let (logits, values) = self.forward(&payload.contexts, &payload.candidates)?;
        let logits = Tensor::stack(&logits, 0)?;
        let actions: Vec<u32> = payload.actions.iter().map(|&a| a as u32).collect();
        let actions = Tensor::from_vec(actions, n, device)?;
        let targets = PpoTargets {
            old_log_probs: Tensor::new(payload.old_log_probs.as_slice(), device)?,
            advantages: Tensor::new(payload.advantages.as_slice(), device)?,
            old_values: Tensor::new(payload.old_values.as_slice(), device)?,
            returns: Tensor::new(payload.returns.as_slice(), device)?,
        };
        let (log_prob, entropy) = categorical(&logits, &actions)?;
        let losses = ppo_loss(&log_prob, &entropy, &values, &targets, &payload.hyper)?;

        let mut grads = losses.loss.backward()?;
        let vars = self.optimizer.vars();
        let grad_norm = clip_grad_norm(&mut grads, &vars, payload.hyper.max_grad_norm)?;
        self.optimizer.step(&grads)?;

        if payload.first_call && self.ctx.is_coordinator() {
            GenerationalCheckpoint::new(&payload.checkpoint_dir).rotate_and_save(&self.varmap, &self.optimizer)?;
        }

        Ok(LossReport {
            loss: losses.loss.to_scalar()?,
            entropy: losses.entropy.to_scalar()?,
            policy_loss: losses.policy_loss.to_scalar()?,
            value_loss: losses.value_loss.to_scalar()?,
            grad_norm: grad_norm as f32,
        })
    }

    /// Copies every tensor of the pretrained file whose name contains
    /// `embed` into the variable of the same name.
    fn load_embedding(&mut self, payload: &LoadEmbeddingPayload) -> Result<UpdateOutcome> {
        if self.embedding_loaded {
            return Ok(UpdateOutcome::Applied);
        }
        let path = payload.llm_path.join(PRETRAINED_FILE);
        let pretrained: HashMap<String, Tensor> = candle_core::safetensors::load(&path, &self.ctx.device)
            .with_context(|| format!("Failed to read {}", path.display()))?;

        let mut copied = 0;
        {
            let data = self
                .varmap
                .data()
                .lock()
                .map_err(|_| anyhow!("variable map lock poisoned"))?;
            for (name, var) in data.iter().filter(|(name, _)| name.contains("embed")) {
                let Some(tensor) = pretrained.get(name) else {
                    continue;
                };
                if tensor.dims() != var.dims() {
                    bail!(
                        "pretrained {name} has shape {:?}, expected {:?}",
                        tensor.dims(),
                        var.dims()
                    );
                }
                var.set(&tensor.to_dtype(var.dtype())?)?;
                copied += 1;
            }
        }
        if copied == 0 {
            bail!("no embedding tensors found in {}", path.display());
        }
        tracing::info!(tensors = copied, path = %path.display(), "loaded pretrained embeddings");
        self.embedding_loaded = true;

        self.optimizer.set_params(adam_params(payload.optimizer));
        if self.ctx.is_coordinator() {
            GenerationalCheckpoint::new(&payload.checkpoint_dir).save_first_last(&self.varmap, &self.optimizer)?;
            self.first_last_saved = true;
        }
        Ok(UpdateOutcome::Applied)
    }

    fn load_checkpoint(&mut self, payload: &LoadCheckpointPayload) -> Result<UpdateOutcome> {
        if self.checkpoint_loaded {
            return Ok(UpdateOutcome::Applied);
        }
        let slot = GenerationalCheckpoint::new(&payload.checkpoint_dir).load(&mut self.varmap, &mut self.optimizer)?;
        if slot == Slot::Backup {
            tracing::warn!(dir = %payload.checkpoint_dir.display(), "resumed from backup generation");
        }
        self.checkpoint_loaded = true;
        Ok(UpdateOutcome::Applied)
    }

    fn save_first_last(&mut self, payload: &SaveFirstLastPayload) -> Result<UpdateOutcome> {
        if self.first_last_saved {
            return Ok(UpdateOutcome::Applied);
        }
        self.optimizer.set_params(adam_params(payload.optimizer));
        if self.ctx.is_coordinator() {
            GenerationalCheckpoint::new(&payload.checkpoint_dir).save_first_last(&self.varmap, &self.optimizer)?;
        }
        self.first_last_saved = true;
        Ok(UpdateOutcome::Applied)
    }
}

fn adam_params(settings: OptimizerSettings) -> ParamsAdamW {
    ParamsAdamW {
        lr: settings.lr,
        beta1: settings.beta1,
        beta2: settings.beta2,
        eps: settings.adam_eps,
        weight_decay: 0.0,
    }
}

impl Scorer for LocalScorer {
    fn score(&self, contexts: &[String], candidates: &[Vec<String>]) -> Result<Vec<Scored>> {
        let (logits, values) = self.forward(contexts, candidates)?;
        let values: Vec<f32> = values.to_vec1()?;
        logits
            .into_iter()
            .zip(values)
            .map(|(l, v)| {
                Ok(Scored {
                    logits: l.to_vec1()?,
                    value: Some(v),
                })
            })
            .collect()
    }
}

impl ScoringBackend for LocalScorer {
    fn value_of(&self, contexts: &[String], _candidates: &[Vec<String>]) -> Result<Vec<f32>> {
        let states = self.encode_contexts(contexts);
        let state_refs: Vec<&[u32]> = states.iter().map(|s| s.as_slice()).collect();
        let values = self
            .value_head
            .forward(&self.net.encode_states(&state_refs)?)?;
        Ok(values.to_vec1()?)
    }

    fn update(&mut self, command: UpdateCommand) -> Result<UpdateOutcome> {
        match command {
            UpdateCommand::TrainStep(payload) => Ok(UpdateOutcome::Trained(self.train_step(&payload)?)),
            UpdateCommand::LoadEmbedding(payload) => self.load_embedding(&payload),
            UpdateCommand::LoadCheckpoint(payload) => self.load_checkpoint(&payload),
            UpdateCommand::SaveFirstLast(payload) => self.save_first_last(&payload),
        }
    }
}
