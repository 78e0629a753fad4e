//! Host capability checks run before every start.
//!
//! - Architecture: the binary must run natively (no Rosetta, no WOW64).
//! - Virtualization: Hypervisor.framework on macOS, KVM on Linux, WSL on
//!   Windows.
//!
//! Both checks fail with fatal errors carrying a remediation hint.

use crate::process::CommandRunner;
use async_trait::async_trait;
use nodevm_core::error::{Result, VmError};
use std::path::Path;

/// Information about virtualization support.
#[derive(Debug, Clone)]
pub struct VirtualizationSupport {
    /// Human-readable description of the virtualization backend.
    pub backend: String,
    /// Additional details about the support.
    pub details: String,
}

/// Host checks the lifecycle runs before booting.
#[async_trait]
pub trait HostCapabilities: Send + Sync {
    /// Fail when the binary is emulated on a foreign architecture.
    async fn check_architecture(&self) -> Result<()>;

    /// Fail when hardware virtualization is unavailable.
    async fn check_virtualization(&self) -> Result<VirtualizationSupport>;
}

/// Checks against the real host.
pub struct NativeHost {
    runner: CommandRunner,
}

impl NativeHost {
    pub fn new(runner: CommandRunner) -> Self {
        Self { runner }
    }
}

#[async_trait]
impl HostCapabilities for NativeHost {
    async fn check_architecture(&self) -> Result<()> {
        let host = self.host_arch().await?;
        let binary = normalize_arch(std::env::consts::ARCH);
        tracing::debug!(host = %host, binary = %binary, "Architecture check");

        if host != binary {
            return Err(VmError::fatal_with_hint(
                format!(
                    "This build of nodevm is for {} but the host is {}",
                    binary, host
                ),
                format!("Install the {} build of nodevm", host),
            ));
        }
        Ok(())
    }

    async fn check_virtualization(&self) -> Result<VirtualizationSupport> {
        if cfg!(target_os = "windows") {
            return self
                .runner
                .run(Path::new("wsl.exe"), &["--status"], true)
                .await
                .map(|_| VirtualizationSupport {
                    backend: "WSL2".to_string(),
                    details: "Windows Subsystem for Linux is available".to_string(),
                })
                .map_err(|e| {
                    VmError::fatal_with_hint(
                        format!("WSL is not available: {}", e),
                        "Enable WSL with: wsl --install --no-distribution",
                    )
                });
        }

        check_virtualization_support().await
    }
}

impl NativeHost {
    /// Architecture of the host, regardless of how this binary runs.
    async fn host_arch(&self) -> Result<String> {
        if cfg!(target_os = "macos") {
            // 1 when the process runs under Rosetta translation
            let translated = self
                .runner
                .run(
                    Path::new("sysctl"),
                    &["-n", "sysctl.proc_translated"],
                    true,
                )
                .await
                .map(|out| out.stdout.trim() == "1")
                .unwrap_or(false);
            return Ok(if translated {
                "aarch64".to_string()
            } else {
                normalize_arch(std::env::consts::ARCH)
            });
        }

        if cfg!(target_os = "windows") {
            let arch = std::env::var("PROCESSOR_ARCHITEW6432")
                .or_else(|_| std::env::var("PROCESSOR_ARCHITECTURE"))
                .unwrap_or_else(|_| std::env::consts::ARCH.to_string());
            return Ok(normalize_arch(&arch));
        }

        let out = self.runner.run(Path::new("uname"), &["-m"], false).await?;
        Ok(normalize_arch(out.stdout.trim()))
    }
}

/// Map the various spellings of an architecture onto Rust's names.
pub fn normalize_arch(arch: &str) -> String {
    match arch.to_ascii_lowercase().as_str() {
        "arm64" | "aarch64" => "aarch64".to_string(),
        "amd64" | "x86_64" | "x64" => "x86_64".to_string(),
        other => other.to_string(),
    }
}

/// Check if the current host supports hardware virtualization.
pub async fn check_virtualization_support() -> Result<VirtualizationSupport> {
    #[cfg(target_os = "macos")]
    {
        check_macos_hypervisor().await
    }

    #[cfg(target_os = "linux")]
    {
        check_linux_kvm()
    }

    #[cfg(not(any(target_os = "macos", target_os = "linux")))]
    {
        Err(VmError::fatal(
            "Unsupported platform: nodevm requires macOS, Linux or Windows",
        ))
    }
}

/// Check for Hypervisor.framework support on macOS.
#[cfg(target_os = "macos")]
async fn check_macos_hypervisor() -> Result<VirtualizationSupport> {
    let output = tokio::process::Command::new("sysctl")
        .arg("kern.hv_support")
        .output()
        .await
        .map_err(|e| VmError::fatal(format!("Failed to run sysctl: {}", e)))?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    // "kern.hv_support: 1" when supported
    let value = stdout.split(':').nth(1).map(|s| s.trim()).unwrap_or("0");

    if output.status.success() && value == "1" {
        Ok(VirtualizationSupport {
            backend: "Hypervisor.framework".to_string(),
            details: "Hardware virtualization is available".to_string(),
        })
    } else {
        Err(VmError::fatal_with_hint(
            "Hypervisor.framework is not available on this system",
            "nodevm cannot run inside another virtual machine without nested virtualization",
        ))
    }
}

/// Check for KVM support on Linux.
#[cfg(target_os = "linux")]
fn check_linux_kvm() -> Result<VirtualizationSupport> {
    let kvm_path = Path::new("/dev/kvm");

    if !kvm_path.exists() {
        return Err(VmError::fatal_with_hint(
            "KVM is not available: /dev/kvm not found",
            "Ensure KVM kernel modules are loaded (modprobe kvm kvm_intel or kvm_amd)",
        ));
    }

    match std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open(kvm_path)
    {
        Ok(_) => Ok(VirtualizationSupport {
            backend: "KVM".to_string(),
            details: "Linux KVM hardware virtualization is available".to_string(),
        }),
        Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
            Err(VmError::fatal_with_hint(
                format!("KVM access denied: {}", e),
                "Add your user to the 'kvm' group: sudo usermod -aG kvm $USER",
            ))
        }
        Err(e) => Err(VmError::fatal(format!("Failed to access /dev/kvm: {}", e))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::DiagnosticsLog;

    #[test]
    fn test_normalize_arch() {
        assert_eq!(normalize_arch("arm64"), "aarch64");
        assert_eq!(normalize_arch("AMD64"), "x86_64");
        assert_eq!(normalize_arch("x86_64"), "x86_64");
        assert_eq!(normalize_arch("riscv64"), "riscv64");
    }

    #[tokio::test]
    async fn test_native_architecture_matches() {
        // A natively built test binary always matches its host.
        let host = NativeHost::new(CommandRunner::new(DiagnosticsLog::new()));
        host.check_architecture().await.unwrap();
    }

    #[tokio::test]
    async fn test_check_virtualization_support() {
        // Depends on the host; only the error shape is asserted.
        if let Err(e) = check_virtualization_support().await {
            assert!(e.is_fatal());
        }
    }
}
