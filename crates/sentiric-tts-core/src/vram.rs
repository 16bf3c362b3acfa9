//! Device-memory pressure management.
//!
//! The model runtime does not return every per-call allocation to the device,
//! so the inference worker periodically asks the primitive to release its
//! cached memory. Nothing happens on CPU.

use crate::config::VramConfig;
use crate::inference::InferencePrimitive;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// Why a reclaim cycle ran
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ReclaimReason {
    /// Low-resource mode reclaims after every inference
    LowResourceMode,
    /// Periodic reclaim every `cleanup_interval` inferences
    Interval,
    /// Measured usage crossed the threshold
    Pressure {
        /// Used/total ratio that triggered the reclaim
        ratio: f32,
    },
    /// Explicit request, e.g. before retrying after out-of-memory
    Forced,
}

impl fmt::Display for ReclaimReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LowResourceMode => write!(f, "low-resource mode"),
            Self::Interval => write!(f, "periodic interval"),
            Self::Pressure { ratio } => write!(f, "memory pressure ({:.0}%)", ratio * 100.0),
            Self::Forced => write!(f, "forced"),
        }
    }
}

/// Tracks completed inferences and triggers reclaim cycles
#[derive(Debug)]
pub struct VramPressureManager {
    config: VramConfig,
    completed: u64,
    reclaims: Arc<AtomicU64>,
}

impl VramPressureManager {
    /// Create a manager
    #[must_use]
    pub fn new(config: VramConfig) -> Self {
        Self {
            config,
            completed: 0,
            reclaims: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Shared reclaim counter, readable from outside the worker
    #[must_use]
    pub fn reclaim_counter(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.reclaims)
    }

    /// Inferences completed so far
    #[must_use]
    pub const fn completed(&self) -> u64 {
        self.completed
    }

    /// Record one completed inference and reclaim if a trigger fires.
    ///
    /// Must be called on the inference worker, right after the primitive
    /// returns.
    pub fn after_inference(
        &mut self,
        primitive: &mut dyn InferencePrimitive,
    ) -> Option<ReclaimReason> {
        self.completed += 1;

        if !primitive.device().is_accelerator() {
            return None;
        }

        let reason = if self.config.low_resource_mode {
            Some(ReclaimReason::LowResourceMode)
        } else if self.config.cleanup_interval > 0
            && self.completed % self.config.cleanup_interval == 0
        {
            Some(ReclaimReason::Interval)
        } else {
            primitive
                .memory_usage()
                .map(|usage| usage.ratio())
                .filter(|&ratio| ratio > self.config.memory_threshold)
                .map(|ratio| ReclaimReason::Pressure { ratio })
        };

        if let Some(reason) = reason {
            self.reclaim(primitive, reason);
        }
        reason
    }

    /// Reclaim unconditionally (accelerators only)
    pub fn force_reclaim(&mut self, primitive: &mut dyn InferencePrimitive) {
        if primitive.device().is_accelerator() {
            self.reclaim(primitive, ReclaimReason::Forced);
        }
    }

    fn reclaim(&self, primitive: &mut dyn InferencePrimitive, reason: ReclaimReason) {
        let before = primitive.memory_usage();
        primitive.release_device_cache();
        self.reclaims.fetch_add(1, Ordering::Relaxed);

        match (before, primitive.memory_usage()) {
            (Some(before), Some(after)) => info!(
                "Reclaimed device memory ({}): {} -> {} MiB",
                reason,
                before.used_bytes / (1024 * 1024),
                after.used_bytes / (1024 * 1024)
            ),
            _ => debug!("Reclaimed device memory ({})", reason),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::{
        ChunkIter, ComputeDevice, InferenceParams, InferenceResult, MemoryUsage, SpeakerLatents,
    };
    use std::path::PathBuf;

    struct Device {
        device: ComputeDevice,
        used: u64,
        releases: usize,
    }

    impl Device {
        fn new(device: ComputeDevice, used: u64) -> Self {
            Self {
                device,
                used,
                releases: 0,
            }
        }
    }

    impl InferencePrimitive for Device {
        fn bind_device(&mut self, device: ComputeDevice) -> InferenceResult<()> {
            self.device = device;
            Ok(())
        }

        fn device(&self) -> ComputeDevice {
            self.device
        }

        fn inference(
            &mut self,
            _text: &str,
            _language: &str,
            _latents: &SpeakerLatents,
            _params: &InferenceParams,
        ) -> InferenceResult<Vec<f32>> {
            Ok(Vec::new())
        }

        fn inference_stream<'a>(
            &'a mut self,
            _text: &str,
            _language: &str,
            _latents: &SpeakerLatents,
            _params: &InferenceParams,
        ) -> InferenceResult<ChunkIter<'a>> {
            Ok(Box::new(std::iter::empty()))
        }

        fn conditioning_latents(&mut self, _paths: &[PathBuf]) -> InferenceResult<SpeakerLatents> {
            Ok(SpeakerLatents::from_vectors(vec![0.0], vec![0.0]))
        }

        fn memory_usage(&self) -> Option<MemoryUsage> {
            self.device.is_accelerator().then_some(MemoryUsage {
                used_bytes: self.used,
                total_bytes: 100,
            })
        }

        fn release_device_cache(&mut self) {
            self.releases += 1;
            self.used = 10;
        }
    }

    #[test]
    fn test_cpu_is_noop() {
        let mut manager = VramPressureManager::new(VramConfig {
            low_resource_mode: true,
            ..VramConfig::default()
        });
        let mut cpu = Device::new(ComputeDevice::Cpu, 99);
        for _ in 0..20 {
            assert_eq!(manager.after_inference(&mut cpu), None);
        }
        manager.force_reclaim(&mut cpu);
        assert_eq!(cpu.releases, 0);
        assert_eq!(manager.completed(), 20);
    }

    #[test]
    fn test_interval_trigger() {
        let mut manager = VramPressureManager::new(VramConfig {
            cleanup_interval: 3,
            memory_threshold: 0.95,
            low_resource_mode: false,
        });
        let mut gpu = Device::new(ComputeDevice::Cuda, 10);

        let reasons: Vec<_> = (0..6).map(|_| manager.after_inference(&mut gpu)).collect();
        assert_eq!(
            reasons,
            vec![None, None, Some(ReclaimReason::Interval), None, None, Some(ReclaimReason::Interval)]
        );
        assert_eq!(gpu.releases, 2);
        assert_eq!(manager.reclaim_counter().load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_pressure_trigger() {
        let mut manager = VramPressureManager::new(VramConfig {
            cleanup_interval: 0,
            memory_threshold: 0.85,
            low_resource_mode: false,
        });
        let mut gpu = Device::new(ComputeDevice::Cuda, 90);

        assert_eq!(
            manager.after_inference(&mut gpu),
            Some(ReclaimReason::Pressure { ratio: 0.9 })
        );
        assert_eq!(manager.after_inference(&mut gpu), None);
    }

    #[test]
    fn test_low_resource_mode_reclaims_every_time() {
        let mut manager = VramPressureManager::new(VramConfig {
            low_resource_mode: true,
            ..VramConfig::default()
        });
        let mut gpu = Device::new(ComputeDevice::Cuda, 10);
        for _ in 0..4 {
            assert_eq!(
                manager.after_inference(&mut gpu),
                Some(ReclaimReason::LowResourceMode)
            );
        }
        manager.force_reclaim(&mut gpu);
        assert_eq!(gpu.releases, 5);
    }
}
