//! Sandbox VM configuration and QEMU command line construction

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::session::SharedFolders;

/// Boot and lifecycle settings for the sandbox VM
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct VmConfig {
    /// Run shell tools inside the VM instead of on the host
    pub enabled: bool,
    pub qemu_binary: String,
    pub machine: String,
    /// QEMU accelerator list, tried in order (e.g., "kvm:tcg")
    pub accel: String,
    pub kernel_path: PathBuf,
    pub kernel_args: String,
    pub initrd_path: Option<PathBuf>,
    pub rootfs_path: Option<PathBuf>,
    pub cpus: u32,
    pub memory_mib: u32,
    /// Host directories exported to the guest as /mnt/share{i}
    pub shared_folders: Vec<PathBuf>,
    /// Where QMP sockets are created (system temp dir if unset)
    pub runtime_dir: Option<PathBuf>,
    pub startup_timeout_secs: u64,
    pub command_timeout_secs: u64,
    pub idle_timeout_secs: u64,
    pub idle_poll_secs: u64,
    /// Keep the VM running between tasks, stopping it only when idle
    pub keep_warm: bool,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            qemu_binary: "qemu-system-x86_64".to_string(),
            machine: "q35".to_string(),
            accel: "kvm:tcg".to_string(),
            kernel_path: PathBuf::from("/var/lib/agentvisor/vmlinuz"),
            kernel_args: "console=ttyS0 root=/dev/vda rw quiet".to_string(),
            initrd_path: None,
            rootfs_path: Some(PathBuf::from("/var/lib/agentvisor/rootfs.ext4")),
            cpus: 2,
            memory_mib: 2048,
            shared_folders: Vec::new(),
            runtime_dir: None,
            startup_timeout_secs: 60,
            command_timeout_secs: 120,
            idle_timeout_secs: 300,
            idle_poll_secs: 30,
            keep_warm: false,
        }
    }
}

impl VmConfig {
    pub fn shared(&self) -> SharedFolders {
        SharedFolders::new(self.shared_folders.clone())
    }

    /// QEMU arguments: serial console on stdio, QMP on `qmp_socket`, one 9p
    /// export per shared folder tagged `share{i}`
    pub fn qemu_args(&self, qmp_socket: &Path) -> Vec<String> {
        let mut args = vec![
            "-machine".to_string(),
            format!("{},accel={}", self.machine, self.accel),
            "-smp".to_string(),
            self.cpus.to_string(),
            "-m".to_string(),
            self.memory_mib.to_string(),
            "-kernel".to_string(),
            self.kernel_path.display().to_string(),
            "-append".to_string(),
            self.kernel_args.clone(),
        ];
        if let Some(initrd) = &self.initrd_path {
            args.push("-initrd".to_string());
            args.push(initrd.display().to_string());
        }
        if let Some(rootfs) = &self.rootfs_path {
            args.push("-drive".to_string());
            args.push(format!("file={},format=raw,if=virtio", rootfs.display()));
        }
        args.extend([
            "-netdev".to_string(),
            "user,id=net0".to_string(),
            "-device".to_string(),
            "virtio-net-pci,netdev=net0".to_string(),
        ]);
        for (i, folder) in self.shared_folders.iter().enumerate() {
            args.push("-virtfs".to_string());
            args.push(format!(
                "local,path={},mount_tag=share{},security_model=mapped-xattr,id=share{}",
                folder.display(),
                i,
                i
            ));
        }
        args.extend([
            "-display".to_string(),
            "none".to_string(),
            "-monitor".to_string(),
            "none".to_string(),
            "-serial".to_string(),
            "stdio".to_string(),
            "-qmp".to_string(),
            format!("unix:{},server=on,wait=off", qmp_socket.display()),
            "-no-reboot".to_string(),
        ]);
        args
    }
}
