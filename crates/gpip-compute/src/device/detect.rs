//! Which devices this build can open, and which one [`Backend::Auto`] picks.

use std::fmt::Write as _;

use super::Backend;

/// Order `Auto` tries concrete backends in.
pub const AUTO_ORDER: [Backend; 2] = [Backend::Wgpu, Backend::Cpu];

/// A compiled-in backend as found on this machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendInfo {
    pub backend: Backend,
    /// What a device of this backend runs on; `None` if it cannot be opened.
    pub device: Option<String>,
}

impl BackendInfo {
    pub fn is_available(&self) -> bool {
        self.device.is_some()
    }
}

fn compiled_in(backend: Backend) -> bool {
    match backend {
        Backend::Wgpu => cfg!(feature = "wgpu"),
        _ => true,
    }
}

fn locate(backend: Backend) -> Option<String> {
    match backend {
        Backend::Cpu => Some(format!("host, {} rayon threads", rayon::current_num_threads())),
        #[cfg(feature = "wgpu")]
        Backend::Wgpu => super::WgpuDevice::find_adapter()
            .map(|a| format!("{} ({:?}, {:?})", a.name, a.backend, a.device_type)),
        _ => None,
    }
}

/// Compiled-in backends in [`AUTO_ORDER`].
pub fn detect_backends() -> Vec<BackendInfo> {
    AUTO_ORDER
        .into_iter()
        .filter(|&b| compiled_in(b))
        .map(|backend| BackendInfo { backend, device: locate(backend) })
        .collect()
}

/// First available backend in [`AUTO_ORDER`]. The CPU device always is.
pub fn select_best_backend() -> Backend {
    detect_backends()
        .into_iter()
        .find(BackendInfo::is_available)
        .map_or(Backend::Cpu, |info| info.backend)
}

/// One line per compiled-in backend, e.g. `cpu   host, 8 rayon threads`.
pub fn describe_backends() -> String {
    let mut out = String::new();
    for info in detect_backends() {
        let device = info.device.as_deref().unwrap_or("unavailable");
        let _ = writeln!(out, "{:<5} {device}", info.backend.name());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detection_follows_auto_order() {
        let found = detect_backends();
        let cpu = found.iter().find(|b| b.backend == Backend::Cpu).unwrap();
        assert!(cpu.is_available());
        assert_eq!(found.last().map(|b| b.backend), Some(Backend::Cpu));
        assert_eq!(found.len(), if cfg!(feature = "wgpu") { 2 } else { 1 });
    }

    #[test]
    fn test_best_is_available() {
        let best = select_best_backend();
        assert_ne!(best, Backend::Auto);
        assert!(best.is_available());
        #[cfg(not(feature = "wgpu"))]
        assert_eq!(best, Backend::Cpu);
    }

    #[test]
    fn test_describe() {
        let text = describe_backends();
        let cpu = text.lines().find(|l| l.starts_with("cpu")).unwrap();
        assert!(cpu.contains("rayon threads"), "{cpu}");
    }
}
