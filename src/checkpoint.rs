use anyhow::{Context, Result};
use candle_nn::VarMap;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::path::{Path, PathBuf};

use crate::optim::AdamW;
use crate::replay::PrioritizedReplay;

pub const MODEL_FILE: &str = "model.checkpoint";
pub const OPTIMIZER_FILE: &str = "optimizer.checkpoint";
pub const MEMORY_FILE: &str = "memory.pkl";
pub const STATUS_FILE: &str = "status.json";

// =============================================================================
// DRRN checkpoint
// =============================================================================

/// Weights, optimizer moments and replay memory in one experiment directory.
#[derive(Debug, Clone)]
pub struct DrrnCheckpoint {
    dir: PathBuf,
}

impl DrrnCheckpoint {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn exists(&self) -> bool {
        self.dir.join(MODEL_FILE).exists()
    }

    pub fn save(&self, varmap: &VarMap, optimizer: &AdamW, memory: &PrioritizedReplay) -> Result<()> {
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("Failed to create {}", self.dir.display()))?;
        varmap.save(self.dir.join(MODEL_FILE))?;
        optimizer.save_state(self.dir.join(OPTIMIZER_FILE))?;
        memory.save(self.dir.join(MEMORY_FILE))?;
        tracing::info!(dir = %self.dir.display(), transitions = memory.len(), "saved checkpoint");
        Ok(())
    }

    /// Restores the weights (fatal on failure), then the memory and the
    /// optimizer. A broken memory yields `None`; a broken optimizer state
    /// leaves the optimizer reset.
    pub fn load(&self, varmap: &mut VarMap, optimizer: &mut AdamW) -> Result<Option<PrioritizedReplay>> {
        let model_path = self.dir.join(MODEL_FILE);
        varmap
            .load(&model_path)
            .with_context(|| format!("Failed to load weights from {}", model_path.display()))?;

        let memory = match PrioritizedReplay::load(self.dir.join(MEMORY_FILE)) {
            Ok(memory) => Some(memory),
            Err(err) => {
                tracing::warn!(error = %err, "replay memory load failed, an empty memory will be used instead");
                None
            }
        };
        if let Err(err) = optimizer.load_state(self.dir.join(OPTIMIZER_FILE)) {
            tracing::warn!(error = %err, "optimizer state load failed, continuing with fresh optimizer state");
            optimizer.reset()?;
        }
        tracing::info!(dir = %self.dir.display(), "loaded checkpoint");
        Ok(memory)
    }
}

// =============================================================================
// Two-generation checkpoint
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    Last,
    Backup,
}

/// `last/` and `backup/` directories, each holding weights and optimizer
/// state. Every write first copies `last` over `backup`, so one interrupted
/// write can always be rolled back.
#[derive(Debug, Clone)]
pub struct GenerationalCheckpoint {
    root: PathBuf,
}

impl GenerationalCheckpoint {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn last_dir(&self) -> PathBuf {
        self.root.join("last")
    }

    pub fn backup_dir(&self) -> PathBuf {
        self.root.join("backup")
    }

    pub fn has_last(&self) -> bool {
        self.last_dir().join(MODEL_FILE).exists()
    }

    pub fn create_dirs(&self) -> Result<()> {
        for dir in [self.last_dir(), self.backup_dir()] {
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("Failed to create {}", dir.display()))?;
        }
        Ok(())
    }

    /// First `last` generation, written before any training step.
    pub fn save_first_last(&self, varmap: &VarMap, optimizer: &AdamW) -> Result<()> {
        self.create_dirs()?;
        write_slot(&self.last_dir(), varmap, optimizer)
    }

    pub fn rotate_and_save(&self, varmap: &VarMap, optimizer: &AdamW) -> Result<()> {
        self.create_dirs()?;
        if self.has_last() {
            copy_dir(&self.last_dir(), &self.backup_dir())?;
        }
        write_slot(&self.last_dir(), varmap, optimizer)
    }

    /// Loads `last`, or `backup` when `last` is unreadable, in which case
    /// `last` is repaired from `backup`.
    pub fn load(&self, varmap: &mut VarMap, optimizer: &mut AdamW) -> Result<Slot> {
        match read_slot(&self.last_dir(), varmap, optimizer) {
            Ok(()) => Ok(Slot::Last),
            Err(err) => {
                tracing::warn!(error = %err, "last checkpoint unreadable, falling back to backup");
                read_slot(&self.backup_dir(), varmap, optimizer)
                    .context("Both last and backup checkpoints are unreadable")?;
                copy_dir(&self.backup_dir(), &self.last_dir())?;
                Ok(Slot::Backup)
            }
        }
    }
}

fn write_slot(dir: &Path, varmap: &VarMap, optimizer: &AdamW) -> Result<()> {
    varmap.save(dir.join(MODEL_FILE))?;
    optimizer.save_state(dir.join(OPTIMIZER_FILE))?;
    Ok(())
}

fn read_slot(dir: &Path, varmap: &mut VarMap, optimizer: &mut AdamW) -> Result<()> {
    let model_path = dir.join(MODEL_FILE);
    varmap
        .load(&model_path)
        .with_context(|| format!("Failed to load weights from {}", model_path.display()))?;
    optimizer.load_state(dir.join(OPTIMIZER_FILE))?;
    Ok(())
}

/// Copies every file of `src` into `dest`, overwriting existing files.
pub fn copy_dir(src: &Path, dest: &Path) -> Result<()> {
    std::fs::create_dir_all(dest).with_context(|| format!("Failed to create {}", dest.display()))?;
    for entry in std::fs::read_dir(src).with_context(|| format!("Failed to read {}", src.display()))? {
        let entry = entry?;
        let target = dest.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), &target).with_context(|| {
                format!("Failed to copy {} to {}", entry.path().display(), target.display())
            })?;
        }
    }
    Ok(())
}

// =============================================================================
// Run status
// =============================================================================

/// Progress counters persisted after every update so a run can resume.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    pub i: usize,
    pub num_episodes: usize,
    pub num_frames: usize,
}

impl Status {
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
        let status = serde_json::from_reader(std::io::BufReader::new(file))
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        Ok(status)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let file = File::create(path).with_context(|| format!("Failed to create {}", path.display()))?;
        serde_json::to_writer(std::io::BufWriter::new(file), self)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replay::{TokenState, Transition};
    use candle_core::{DType, Device};
    use candle_nn::{Init, ParamsAdamW, VarBuilder};

    fn varmap_with(value: f64) -> VarMap {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        vb.get_with_hints(2, "w", Init::Const(value)).unwrap();
        varmap
    }

    fn weight(varmap: &VarMap) -> Vec<f32> {
        varmap.all_vars()[0].as_tensor().to_vec1().unwrap()
    }

    fn set_weight(varmap: &VarMap, value: f32) {
        let var = &varmap.all_vars()[0];
        var.set(&candle_core::Tensor::new(&[value, value], &Device::Cpu).unwrap())
            .unwrap();
    }

    #[test]
    fn test_drrn_round_trip_and_missing_memory() {
        let dir = tempfile::tempdir().unwrap();
        let ckpt = DrrnCheckpoint::new(dir.path().join("expe"));
        let varmap = varmap_with(0.5);
        let optimizer = AdamW::from_varmap(&varmap, ParamsAdamW::default()).unwrap();
        let mut memory = PrioritizedReplay::new(4, 0.0);
        memory.push_transition(
            false,
            Transition {
                state: TokenState(vec![1, 2]),
                action: vec![3],
                reward: 1.0,
                next_state: TokenState(vec![2, 3]),
                next_actions: vec![vec![3], vec![4]],
                done: true,
            },
        );
        ckpt.save(&varmap, &optimizer, &memory).unwrap();

        let mut restored = varmap_with(0.0);
        let mut opt = AdamW::from_varmap(&restored, ParamsAdamW::default()).unwrap();
        let loaded = ckpt.load(&mut restored, &mut opt).unwrap().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(weight(&restored), vec![0.5, 0.5]);

        std::fs::write(ckpt.dir().join(MEMORY_FILE), b"garbage").unwrap();
        std::fs::write(ckpt.dir().join(OPTIMIZER_FILE), b"garbage").unwrap();
        assert!(ckpt.load(&mut restored, &mut opt).unwrap().is_none());
        assert_eq!(opt.step_count(), 0);
    }

    #[test]
    fn test_drrn_missing_weights_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let ckpt = DrrnCheckpoint::new(dir.path());
        let mut varmap = varmap_with(0.0);
        let mut opt = AdamW::from_varmap(&varmap, ParamsAdamW::default()).unwrap();
        assert!(ckpt.load(&mut varmap, &mut opt).is_err());
    }

    #[test]
    fn test_rotation_keeps_previous_generation() {
        let dir = tempfile::tempdir().unwrap();
        let ckpt = GenerationalCheckpoint::new(dir.path());
        let varmap = varmap_with(1.0);
        let opt = AdamW::from_varmap(&varmap, ParamsAdamW::default()).unwrap();
        ckpt.save_first_last(&varmap, &opt).unwrap();
        set_weight(&varmap, 2.0);
        ckpt.rotate_and_save(&varmap, &opt).unwrap();

        let mut restored = varmap_with(0.0);
        let mut restored_opt = AdamW::from_varmap(&restored, ParamsAdamW::default()).unwrap();
        read_slot(&ckpt.backup_dir(), &mut restored, &mut restored_opt).unwrap();
        assert_eq!(weight(&restored), vec![1.0, 1.0]);
        read_slot(&ckpt.last_dir(), &mut restored, &mut restored_opt).unwrap();
        assert_eq!(weight(&restored), vec![2.0, 2.0]);
    }

    #[test]
    fn test_corrupted_last_falls_back_and_repairs() {
        let dir = tempfile::tempdir().unwrap();
        let ckpt = GenerationalCheckpoint::new(dir.path());
        let varmap = varmap_with(1.0);
        let opt = AdamW::from_varmap(&varmap, ParamsAdamW::default()).unwrap();
        ckpt.save_first_last(&varmap, &opt).unwrap();
        set_weight(&varmap, 2.0);
        ckpt.rotate_and_save(&varmap, &opt).unwrap();
        std::fs::write(ckpt.last_dir().join(MODEL_FILE), b"truncated").unwrap();

        let mut restored = varmap_with(0.0);
        let mut restored_opt = AdamW::from_varmap(&restored, ParamsAdamW::default()).unwrap();
        assert_eq!(ckpt.load(&mut restored, &mut restored_opt).unwrap(), Slot::Backup);
        assert_eq!(weight(&restored), vec![1.0, 1.0]);
        // last now mirrors backup
        assert_eq!(ckpt.load(&mut restored, &mut restored_opt).unwrap(), Slot::Last);
    }

    #[test]
    fn test_both_generations_broken_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let ckpt = GenerationalCheckpoint::new(dir.path());
        ckpt.create_dirs().unwrap();
        let mut varmap = varmap_with(0.0);
        let mut opt = AdamW::from_varmap(&varmap, ParamsAdamW::default()).unwrap();
        assert!(ckpt.load(&mut varmap, &mut opt).is_err());
    }

    #[test]
    fn test_status_resume() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(STATUS_FILE);
        assert_eq!(Status::load_or_default(&path).unwrap(), Status::default());
        let status = Status {
            i: 3,
            num_episodes: 7,
            num_frames: 96,
        };
        status.save(&path).unwrap();
        assert_eq!(Status::load_or_default(&path).unwrap(), status);
    }
}
