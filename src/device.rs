//! Device detection, workload allocation, and the concurrent memory budget
//!
//! Pure decision component: it makes no native calls and holds no mutable
//! state after detection. The workload→device mapping is declarative and the
//! budget check is a pure function of the catalog and footprint table, so
//! identical inputs always produce identical answers.

use crate::config::DeviceConfig;
use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, info, warn};

/// Compute device category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceKind {
    /// A named group of CPU cores
    CpuCoreGroup,
    /// Neural accelerator (NPU/APU)
    Accelerator,
    /// Integrated GPU
    Gpu,
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceKind::CpuCoreGroup => write!(f, "cpu"),
            DeviceKind::Accelerator => write!(f, "npu"),
            DeviceKind::Gpu => write!(f, "gpu"),
        }
    }
}

/// Category of compute work used as the unit of device assignment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WorkloadKind {
    /// Decode-heavy autoregressive LLM work
    LlmDecode,
    /// Image classifier inference
    ImageClassification,
    /// Text-embedding inference
    TextEmbedding,
}

impl WorkloadKind {
    /// The workload kinds the system intends to run concurrently.
    pub const ALL: [WorkloadKind; 3] = [
        WorkloadKind::LlmDecode,
        WorkloadKind::ImageClassification,
        WorkloadKind::TextEmbedding,
    ];
}

impl fmt::Display for WorkloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkloadKind::LlmDecode => write!(f, "llm-decode"),
            WorkloadKind::ImageClassification => write!(f, "image-classification"),
            WorkloadKind::TextEmbedding => write!(f, "text-embedding"),
        }
    }
}

/// Static description of one detected device. Detected once per boot and
/// never mutated during a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    pub kind: DeviceKind,
    pub name: String,
    pub available: bool,
    /// Memory ceiling for workloads resident on this device, in bytes
    pub memory_ceiling_bytes: u64,
    /// Coarse throughput figure in GOPS, for the diagnostics screen
    pub throughput_gops: f32,
}

/// The allocator's answer for one workload kind. Recomputed deterministically
/// from the catalog on every call, never cached.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocationDecision {
    pub workload: WorkloadKind,
    pub device: DeviceKind,
    pub device_name: String,
    /// Specific core indices for CPU-bound workloads, empty otherwise
    pub cpu_cores: Vec<usize>,
    pub use_fused_kernels: bool,
    pub use_preallocated_buffers: bool,
    pub memory_footprint_bytes: u64,
}

/// Capability-detection seam for the accelerator heuristic.
///
/// The default implementation matches hardware-platform family strings; a
/// platform with an authoritative query can substitute its own probe without
/// touching the allocation logic. False negatives (no accelerator detected
/// although one exists) are the safe failure mode; the heuristic never
/// guesses "available".
pub trait PlatformProbe: Send + Sync {
    /// SoC/board family identifier, if the platform exposes one
    fn soc_family(&self) -> Option<String>;
    /// Hardware identifier, if the platform exposes one
    fn hardware(&self) -> Option<String>;
}

/// Hardware-platform families known to carry a neural accelerator:
/// Qualcomm Snapdragon (8 Gen 3 "pineapple", 8 Gen 2 "kalama", 8 Gen 1
/// "taro"), Samsung Exynos, MediaTek Dimensity, Google Tensor.
const ACCELERATOR_FAMILIES: &[&str] = &[
    "pineapple", "kalama", "taro", "qcom", "exynos", "mt68", "mt69", "tensor",
];

/// Probe that reads the kernel's device identifiers.
pub struct SysfsProbe;

impl PlatformProbe for SysfsProbe {
    fn soc_family(&self) -> Option<String> {
        std::fs::read_to_string("/sys/firmware/devicetree/base/compatible")
            .ok()
            .map(|s| s.to_lowercase())
    }

    fn hardware(&self) -> Option<String> {
        let cpuinfo = std::fs::read_to_string("/proc/cpuinfo").ok()?;
        cpuinfo
            .lines()
            .find(|l| l.starts_with("Hardware"))
            .and_then(|l| l.split(':').nth(1))
            .map(|s| s.trim().to_lowercase())
    }
}

fn accelerator_detected(probe: &dyn PlatformProbe) -> bool {
    let mut haystacks = Vec::new();
    if let Some(family) = probe.soc_family() {
        haystacks.push(family);
    }
    if let Some(hw) = probe.hardware() {
        haystacks.push(hw);
    }
    if haystacks.is_empty() {
        warn!("No platform identifiers readable, assuming no accelerator");
        return false;
    }
    let hit = haystacks
        .iter()
        .any(|h| ACCELERATOR_FAMILIES.iter().any(|f| h.contains(f)));
    if hit {
        info!("Accelerator-capable platform detected");
    } else {
        debug!("Platform identifiers matched no accelerator family");
    }
    hit
}

/// Device allocation manager.
///
/// Holds the detected catalog, the core partition, and the static footprint
/// table; all answers are derived from those without side effects.
pub struct DeviceAllocator {
    devices: Vec<DeviceDescriptor>,
    performance_cores: Vec<usize>,
    efficiency_cores: Vec<usize>,
    llm_footprint_bytes: u64,
    classifier_footprint_bytes: u64,
    embedding_footprint_bytes: u64,
    total_budget_bytes: u64,
}

impl DeviceAllocator {
    /// Detect devices once and build the allocator from configuration.
    pub fn detect(probe: &dyn PlatformProbe, config: &DeviceConfig) -> Self {
        let budget = config.total_budget_mb * 1024 * 1024;
        let npu_available = accelerator_detected(probe);
        let family = probe
            .soc_family()
            .or_else(|| probe.hardware())
            .unwrap_or_else(|| "unknown".to_string());

        let devices = vec![
            DeviceDescriptor {
                kind: DeviceKind::CpuCoreGroup,
                name: format!(
                    "cpu ({} perf + {} eff cores)",
                    config.performance_cores.len(),
                    config.efficiency_cores.len()
                ),
                available: true,
                memory_ceiling_bytes: budget,
                throughput_gops: 50.0,
            },
            DeviceDescriptor {
                kind: DeviceKind::Accelerator,
                name: format!("npu ({})", family.trim_end_matches('\0').trim()),
                available: npu_available,
                memory_ceiling_bytes: 512 * 1024 * 1024,
                throughput_gops: 400.0,
            },
            // Integrated GPU on the same architecture family as the CPU.
            DeviceDescriptor {
                kind: DeviceKind::Gpu,
                name: "integrated gpu".to_string(),
                available: true,
                memory_ceiling_bytes: 1024 * 1024 * 1024,
                throughput_gops: 150.0,
            },
        ];

        Self::with_catalog(devices, config)
    }

    /// Build the allocator from an explicit catalog. Used by the detection
    /// path above and by tests with mocked catalogs.
    pub fn with_catalog(devices: Vec<DeviceDescriptor>, config: &DeviceConfig) -> Self {
        Self {
            devices,
            performance_cores: config.performance_cores.clone(),
            efficiency_cores: config.efficiency_cores.clone(),
            llm_footprint_bytes: config.llm_footprint_mb * 1024 * 1024,
            classifier_footprint_bytes: config.classifier_footprint_mb * 1024 * 1024,
            embedding_footprint_bytes: config.embedding_footprint_mb * 1024 * 1024,
            total_budget_bytes: config.total_budget_mb * 1024 * 1024,
        }
    }

    /// The detected device catalog.
    pub fn devices(&self) -> &[DeviceDescriptor] {
        &self.devices
    }

    fn device(&self, kind: DeviceKind) -> Option<&DeviceDescriptor> {
        self.devices.iter().find(|d| d.kind == kind)
    }

    fn accelerator_available(&self) -> bool {
        self.device(DeviceKind::Accelerator)
            .map(|d| d.available)
            .unwrap_or(false)
    }

    fn footprint(&self, workload: WorkloadKind) -> u64 {
        match workload {
            WorkloadKind::LlmDecode => self.llm_footprint_bytes,
            WorkloadKind::ImageClassification => self.classifier_footprint_bytes,
            WorkloadKind::TextEmbedding => self.embedding_footprint_bytes,
        }
    }

    /// Fixed workload→device mapping.
    ///
    /// LLM decode owns the performance cores, embeddings the efficiency
    /// cores, so the two never contend. The classifier rides the accelerator
    /// when one was detected and falls back to the efficiency cores
    /// otherwise.
    pub fn allocate(&self, workload: WorkloadKind) -> AllocationDecision {
        let decision = match workload {
            WorkloadKind::LlmDecode => AllocationDecision {
                workload,
                device: DeviceKind::CpuCoreGroup,
                device_name: self.device_name(DeviceKind::CpuCoreGroup),
                cpu_cores: self.performance_cores.clone(),
                use_fused_kernels: false,
                use_preallocated_buffers: true,
                memory_footprint_bytes: self.footprint(workload),
            },
            WorkloadKind::ImageClassification => {
                if self.accelerator_available() {
                    AllocationDecision {
                        workload,
                        device: DeviceKind::Accelerator,
                        device_name: self.device_name(DeviceKind::Accelerator),
                        cpu_cores: vec![],
                        use_fused_kernels: true,
                        use_preallocated_buffers: true,
                        memory_footprint_bytes: self.footprint(workload),
                    }
                } else {
                    AllocationDecision {
                        workload,
                        device: DeviceKind::CpuCoreGroup,
                        device_name: self.device_name(DeviceKind::CpuCoreGroup),
                        cpu_cores: self.efficiency_cores.clone(),
                        use_fused_kernels: false,
                        use_preallocated_buffers: true,
                        memory_footprint_bytes: self.footprint(workload),
                    }
                }
            }
            WorkloadKind::TextEmbedding => AllocationDecision {
                workload,
                device: DeviceKind::CpuCoreGroup,
                device_name: self.device_name(DeviceKind::CpuCoreGroup),
                cpu_cores: self.efficiency_cores.clone(),
                use_fused_kernels: false,
                use_preallocated_buffers: true,
                memory_footprint_bytes: self.footprint(workload),
            },
        };
        debug!(
            "Allocated {} to {} (cores {:?})",
            decision.workload, decision.device, decision.cpu_cores
        );
        decision
    }

    fn device_name(&self, kind: DeviceKind) -> String {
        self.device(kind)
            .map(|d| d.name.clone())
            .unwrap_or_else(|| kind.to_string())
    }

    /// Pure check: do the workloads intended to run concurrently fit under
    /// the combined memory ceiling? `false` means the caller must serialize
    /// the models instead of running them side by side.
    pub fn check_concurrent_memory_budget(&self) -> bool {
        let total: u64 = WorkloadKind::ALL.iter().map(|w| self.footprint(*w)).sum();
        total <= self.total_budget_bytes
    }

    /// Budget check as a hard gate, for callers about to enable concurrent
    /// execution. On failure the caller serializes the workloads instead.
    pub fn ensure_concurrent_budget(&self) -> Result<()> {
        if self.check_concurrent_memory_budget() {
            return Ok(());
        }
        let total: u64 = WorkloadKind::ALL.iter().map(|w| self.footprint(*w)).sum();
        Err(crate::error::EngineError::budget(format!(
            "Concurrent footprints total {}, budget is {}; serialize the workloads",
            crate::utils::format_bytes(total as usize),
            crate::utils::format_bytes(self.total_budget_bytes as usize),
        )))
    }

    /// Memory headroom (or shortfall) under the budget, for diagnostics.
    pub fn budget_headroom_bytes(&self) -> i64 {
        let total: u64 = WorkloadKind::ALL.iter().map(|w| self.footprint(*w)).sum();
        self.total_budget_bytes as i64 - total as i64
    }

    /// Human-readable report of assignments and the budget check, for the
    /// settings/diagnostics screen.
    pub fn allocation_summary(&self) -> String {
        use crate::utils::format_bytes;

        let mut report = String::from("Device allocation\n=================\n");
        for device in &self.devices {
            report.push_str(&format!(
                "{}: {} ({}, ceiling {})\n",
                device.kind,
                device.name,
                if device.available {
                    "available"
                } else {
                    "unavailable"
                },
                format_bytes(device.memory_ceiling_bytes as usize),
            ));
        }
        report.push('\n');
        for workload in WorkloadKind::ALL {
            let d = self.allocate(workload);
            if d.cpu_cores.is_empty() {
                report.push_str(&format!(
                    "{} -> {} ({})\n",
                    d.workload,
                    d.device,
                    format_bytes(d.memory_footprint_bytes as usize)
                ));
            } else {
                report.push_str(&format!(
                    "{} -> {} cores {:?} ({})\n",
                    d.workload,
                    d.device,
                    d.cpu_cores,
                    format_bytes(d.memory_footprint_bytes as usize)
                ));
            }
        }
        let fits = self.check_concurrent_memory_budget();
        report.push_str(&format!(
            "\nConcurrent budget: {} of {} -> {}\n",
            format_bytes(
                WorkloadKind::ALL
                    .iter()
                    .map(|w| self.footprint(*w))
                    .sum::<u64>() as usize
            ),
            format_bytes(self.total_budget_bytes as usize),
            if fits { "OK" } else { "EXCEEDED (serialize)" }
        ));
        report
    }

    /// Convenience: detection result as JSON for diagnostics tooling.
    pub fn catalog_json(&self) -> Result<String> {
        serde_json::to_string_pretty(&self.devices)
            .map_err(|e| crate::error::EngineError::config(e.to_string()))
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// Probe with canned identifiers.
    pub struct FakeProbe {
        pub family: Option<String>,
    }

    impl PlatformProbe for FakeProbe {
        fn soc_family(&self) -> Option<String> {
            self.family.clone()
        }

        fn hardware(&self) -> Option<String> {
            None
        }
    }
}
