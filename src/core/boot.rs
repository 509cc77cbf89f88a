//! Boot test of a produced image under QEMU/KVM
//!
//! UEFI firmware, no network card, and a scratch disk to install onto.

use std::path::{Path, PathBuf};

use crate::config::defaults;
use crate::core::builddir::BuildDirectory;
use crate::error::ToolInvocationError;
use crate::infra::process::{CommandRunner, CommandSpec};

const DISK_NAME: &str = "test.qcow2";

/// QEMU invocation for one image
#[derive(Debug, Clone)]
pub struct BootPlan {
    pub iso: PathBuf,
    pub disk: PathBuf,
    pub ovmf_code: PathBuf,
    pub ovmf_vars: PathBuf,
    pub memory_mb: u32,
}

impl BootPlan {
    /// Plan a boot of the newest image in `dir`
    pub fn for_build_dir(dir: &BuildDirectory) -> Option<Self> {
        Some(Self::new(dir.latest_iso()?, dir.root()))
    }

    pub fn new(iso: PathBuf, build_root: &Path) -> Self {
        Self {
            iso,
            disk: build_root.join(DISK_NAME),
            ovmf_code: PathBuf::from(defaults::OVMF_CODE),
            ovmf_vars: PathBuf::from(defaults::OVMF_VARS),
            memory_mb: defaults::BOOT_MEMORY_MB,
        }
    }

    fn disk_command(&self) -> CommandSpec {
        CommandSpec::new("qemu-img")
            .args(["create", "-f", "qcow2"])
            .arg(&self.disk)
            .arg(defaults::BOOT_DISK_SIZE)
    }

    fn qemu_command(&self) -> CommandSpec {
        CommandSpec::new("qemu-system-x86_64")
            .args(["-cpu", "host", "-enable-kvm", "-machine", "q35,accel=kvm"])
            .args(["-device", "intel-iommu"])
            .arg("-m")
            .arg(self.memory_mb.to_string())
            .args(["-nic", "none"])
            .arg("-drive")
            .arg(format!(
                "if=pflash,format=raw,readonly=on,file={}",
                self.ovmf_code.display()
            ))
            .arg("-drive")
            .arg(format!(
                "if=pflash,format=raw,readonly=on,file={}",
                self.ovmf_vars.display()
            ))
            .args(["-device", "virtio-scsi-pci,bus=pcie.0,id=scsi0"])
            .args(["-device", "scsi-hd,drive=hdd0,bus=scsi0.0,id=scsi0.0,bootindex=2"])
            .arg("-drive")
            .arg(format!(
                "file={},if=none,format=qcow2,discard=unmap,aio=native,cache=none,id=hdd0",
                self.disk.display()
            ))
            .args(["-device", "virtio-scsi-pci,bus=pcie.0,id=scsi1"])
            .args(["-device", "scsi-cd,drive=cdrom0,bus=scsi1.0,bootindex=1"])
            .arg("-drive")
            .arg(format!(
                "file={},media=cdrom,if=none,format=raw,cache=none,id=cdrom0",
                self.iso.display()
            ))
    }

    /// Create the scratch disk if needed and boot
    pub fn run(&self, runner: &dyn CommandRunner) -> Result<(), ToolInvocationError> {
        if !self.disk.exists() {
            tracing::info!("Creating {} scratch disk {}", defaults::BOOT_DISK_SIZE, self.disk.display());
            runner.run(&self.disk_command())?.check("qemu-img")?;
        }
        tracing::info!("Booting {}", self.iso.display());
        runner.run(&self.qemu_command())?.check("qemu-system-x86_64")?;
        Ok(())
    }
}
