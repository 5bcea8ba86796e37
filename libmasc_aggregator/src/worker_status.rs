/// The stage of the run a status message refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Phase {
    #[default]
    Particles,
    TimeBins,
}

#[derive(Debug, Clone, Default)]
pub struct WorkerStatus {
    /// Fraction of the worker's share which is done, in [0, 1]
    pub progress: f32,
    pub worker_id: usize,
    pub phase: Phase,
}

impl WorkerStatus {
    pub fn new(progress: f32, worker_id: usize, phase: Phase) -> Self {
        Self {
            progress,
            worker_id,
            phase,
        }
    }
}
