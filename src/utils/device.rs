use std::fmt;

/// Where classifier computation runs. Resolved once at startup and passed
/// explicitly to the classifier and the evaluation loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Device {
    Cpu,
    /// Instance encoding is spread over a dedicated worker pool.
    Accelerated { threads: usize },
}

impl Device {
    pub fn resolve(disable_acceleration: bool, threads: usize) -> Self {
        if disable_acceleration || !Self::accelerator_available(threads) {
            Device::Cpu
        } else {
            Device::Accelerated { threads }
        }
    }

    pub fn accelerator_available(threads: usize) -> bool {
        threads > 1
    }

    pub fn is_accelerated(&self) -> bool {
        matches!(self, Device::Accelerated { .. })
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => write!(f, "cpu"),
            Device::Accelerated { threads } => write!(f, "accelerated ({} threads)", threads),
        }
    }
}
