use anyhow::{Result, bail};
use candle_core::{Device, Tensor};
use candle_nn::rnn::{GRU, GRUConfig, RNN};
use candle_nn::{Embedding, Linear, Module, VarBuilder};

use crate::encoder::PAD_ID;

// =============================================================================
// DRRN network (candle)
// =============================================================================

/// Scores every candidate action of a state.
///
/// Shared embedding, one GRU for the state tokens and one for the action
/// tokens; `[state ; action]` goes through `Linear -> ReLU -> Linear(1)`.
pub struct DrrnNet {
    embedding: Embedding,
    obs_encoder: GRU,
    act_encoder: GRU,
    hidden: Linear,
    act_scorer: Linear,
    hidden_dim: usize,
    device: Device,
}

impl DrrnNet {
    pub fn new(vb: VarBuilder, vocab_size: usize, embedding_dim: usize, hidden_dim: usize) -> Result<Self> {
        let device = vb.device().clone();
        let embedding = candle_nn::embedding(vocab_size, embedding_dim, vb.pp("embedding"))?;
        let obs_encoder = candle_nn::rnn::gru(
            embedding_dim,
            hidden_dim,
            GRUConfig::default(),
            vb.pp("obs_encoder"),
        )?;
        let act_encoder = candle_nn::rnn::gru(
            embedding_dim,
            hidden_dim,
            GRUConfig::default(),
            vb.pp("act_encoder"),
        )?;
        let hidden = candle_nn::linear(2 * hidden_dim, hidden_dim, vb.pp("hidden"))?;
        let act_scorer = candle_nn::linear(hidden_dim, 1, vb.pp("act_scorer"))?;
        Ok(Self {
            embedding,
            obs_encoder,
            act_encoder,
            hidden,
            act_scorer,
            hidden_dim,
            device,
        })
    }

    pub fn hidden_dim(&self) -> usize {
        self.hidden_dim
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Right-pads the batch with `PAD_ID`, runs `gru` over it and keeps the
    /// hidden state at each sequence's last real token. Empty sequences are
    /// read as a single pad token.
    fn encode_sequences(&self, seqs: &[&[u32]], gru: &GRU) -> Result<Tensor> {
        let batch = seqs.len();
        let max_len = seqs.iter().map(|s| s.len()).max().unwrap_or(0).max(1);
        let mut ids = Vec::with_capacity(batch * max_len);
        let mut last = Vec::with_capacity(batch);
        for (b, seq) in seqs.iter().enumerate() {
            ids.extend_from_slice(seq);
            ids.extend(std::iter::repeat_n(PAD_ID, max_len - seq.len()));
            last.push((b * max_len + seq.len().max(1) - 1) as u32);
        }
        let ids = Tensor::from_vec(ids, (batch, max_len), &self.device)?;
        let embedded = self.embedding.forward(&ids)?;
        let states = gru.seq(&embedded)?;
        let hs = gru.states_to_tensor(&states)?;
        let flat = hs.reshape((batch * max_len, self.hidden_dim))?;
        let last = Tensor::from_vec(last, batch, &self.device)?;
        Ok(flat.index_select(&last, 0)?)
    }

    /// State encodings, `(batch, hidden_dim)`.
    pub fn encode_states(&self, states: &[&[u32]]) -> Result<Tensor> {
        if states.is_empty() {
            bail!("cannot encode an empty batch of states");
        }
        self.encode_sequences(states, &self.obs_encoder)
    }

    /// One score vector per state, its length the number of that state's
    /// candidates.
    pub fn forward(&self, states: &[&[u32]], acts: &[&[Vec<u32>]]) -> Result<Vec<Tensor>> {
        if states.len() != acts.len() {
            bail!("{} states but {} candidate lists", states.len(), acts.len());
        }
        let state_out = self.encode_states(states)?;
        self.forward_encoded(&state_out, acts)
    }

    /// Same as [`Self::forward`] from `(batch, hidden)` encodings already
    /// produced by [`Self::encode_states`], so other heads can share them.
    pub fn forward_encoded(&self, state_out: &Tensor, acts: &[&[Vec<u32>]]) -> Result<Vec<Tensor>> {
        let batch = state_out.dim(0)?;
        if batch != acts.len() {
            bail!("{batch} states but {} candidate lists", acts.len());
        }
        if acts.iter().any(|a| a.is_empty()) {
            bail!("every state needs at least one candidate action");
        }
        let sizes: Vec<usize> = acts.iter().map(|a| a.len()).collect();
        let flat_acts: Vec<&[u32]> = acts
            .iter()
            .flat_map(|cands| cands.iter().map(|a| a.as_slice()))
            .collect();
        let total = flat_acts.len();

        let act_out = self.encode_sequences(&flat_acts, &self.act_encoder)?;

        let repeat: Vec<u32> = sizes
            .iter()
            .enumerate()
            .flat_map(|(i, &n)| std::iter::repeat_n(i as u32, n))
            .collect();
        let repeat = Tensor::from_vec(repeat, total, &self.device)?;
        let state_out = state_out.index_select(&repeat, 0)?;

        let z = Tensor::cat(&[&state_out, &act_out], 1)?;
        let z = self.hidden.forward(&z)?.relu()?;
        let q = self.act_scorer.forward(&z)?.squeeze(1)?;

        let mut out = Vec::with_capacity(sizes.len());
        let mut offset = 0;
        for n in sizes {
            out.push(q.narrow(0, offset, n)?);
            offset += n;
        }
        Ok(out)
    }
}

// =============================================================================
// Value head
// =============================================================================

/// Sigmoid MLP on top of a state encoding, producing one value per state.
pub struct ValueHead {
    fc1: Linear,
    fc2: Linear,
    out: Linear,
}

impl ValueHead {
    pub fn new(vb: VarBuilder, input_dim: usize, hidden_dim: usize) -> Result<Self> {
        Ok(Self {
            fc1: candle_nn::linear(input_dim, hidden_dim, vb.pp("fc1"))?,
            fc2: candle_nn::linear(hidden_dim, hidden_dim, vb.pp("fc2"))?,
            out: candle_nn::linear(hidden_dim, 1, vb.pp("out"))?,
        })
    }

    /// `(batch, input_dim)` -> `(batch,)`
    pub fn forward(&self, x: &Tensor) -> candle_core::Result<Tensor> {
        let h = candle_nn::ops::sigmoid(&self.fc1.forward(x)?)?;
        let h = candle_nn::ops::sigmoid(&self.fc2.forward(&h)?)?;
        self.out.forward(&h)?.squeeze(1)
    }
}

// =============================================================================
// Action heads
// =============================================================================

/// Sigmoid MLP scoring a fixed action list from the state encoding alone,
/// one logit per action. Replaces candidate scoring when enabled.
pub struct ActionHeads {
    fc1: Linear,
    fc2: Linear,
    out: Linear,
    n_actions: usize,
}

impl ActionHeads {
    pub fn new(vb: VarBuilder, input_dim: usize, hidden_dim: usize, n_actions: usize) -> Result<Self> {
        if n_actions == 0 {
            bail!("action heads need at least one action");
        }
        Ok(Self {
            fc1: candle_nn::linear(input_dim, hidden_dim, vb.pp("fc1"))?,
            fc2: candle_nn::linear(hidden_dim, hidden_dim, vb.pp("fc2"))?,
            out: candle_nn::linear(hidden_dim, n_actions, vb.pp("out"))?,
            n_actions,
        })
    }

    pub fn n_actions(&self) -> usize {
        self.n_actions
    }

    /// `(batch, input_dim)` -> `(batch, n_actions)`
    pub fn forward(&self, x: &Tensor) -> candle_core::Result<Tensor> {
        let h = candle_nn::ops::sigmoid(&self.fc1.forward(x)?)?;
        let h = candle_nn::ops::sigmoid(&self.fc2.forward(&h)?)?;
        self.out.forward(&h)
    }
}
