use candle_core::Device;

/// Execution context threaded through every constructor that touches tensors
/// or shared side effects (checkpoints, diagnostic files).
///
/// `rank`/`world_size` describe this process inside a group of cooperating
/// workers; only `coordinator_rank` performs stateful writes.
#[derive(Debug, Clone)]
pub struct ExecContext {
    pub device: Device,
    pub rank: usize,
    pub world_size: usize,
    pub coordinator_rank: usize,
}

impl ExecContext {
    pub fn cpu() -> Self {
        Self {
            device: Device::Cpu,
            rank: 0,
            world_size: 1,
            coordinator_rank: 0,
        }
    }

    /// Metal on Apple Silicon when available, else CPU.
    pub fn best_available(force_cpu: bool) -> Self {
        let device = if force_cpu {
            Device::Cpu
        } else {
            Device::new_metal(0).unwrap_or(Device::Cpu)
        };
        Self {
            device,
            ..Self::cpu()
        }
    }

    pub fn with_rank(mut self, rank: usize, world_size: usize, coordinator_rank: usize) -> Self {
        self.rank = rank;
        self.world_size = world_size.max(1);
        self.coordinator_rank = coordinator_rank;
        self
    }

    pub fn is_coordinator(&self) -> bool {
        self.rank == self.coordinator_rank
    }
}
