//! Default configuration values

/// Default archiso template adapted into the offline medium
pub const DEFAULT_TEMPLATE: &str = "releng";

/// Directory holding the archiso templates shipped by the `archiso` package
pub const DEFAULT_TEMPLATE_ROOT: &str = "/usr/share/archiso/configs";

/// Default name of the repository embedded in the ISO
pub const DEFAULT_REPO_NAME: &str = "localrepo";

/// Default build directory (relative to the working directory)
pub const DEFAULT_BUILD_DIR: &str = "./archiso_offline";

/// Default user that builds AUR packages
pub const DEFAULT_BUILD_USER: &str = "aoffline_usr";

/// Default branch of the installer tool when cloned into the ISO
pub const DEFAULT_INSTALLER_BRANCH: &str = "master";

/// Default project config file looked up in the working directory
pub const PROJECT_CONFIG_FILE: &str = "archoffline.toml";

/// System pacman mirror list reused by the `copy` mirror keyword
pub const SYSTEM_MIRRORLIST: &str = "/etc/pacman.d/mirrorlist";

/// Directory for sudoers drop-in files
pub const SUDOERS_DIR: &str = "/etc/sudoers.d";

/// Main sudoers file, scanned for pre-existing grants
pub const SUDOERS_FILE: &str = "/etc/sudoers";

/// Maximum number of ranked mirrors kept for a region
pub const MAX_REGION_MIRRORS: usize = 10;

/// Maximum number of download retry attempts
pub const MAX_DOWNLOAD_RETRIES: u32 = 3;

/// Official repositories pointed at the resolved mirror
pub const OFFICIAL_REPOS: &[&str] = &["core", "extra"];

/// Repository sections stripped from the ISO pacman.conf
///
/// `community` was merged into `extra` upstream but older templates still
/// carry the section.
pub const STRIPPED_REPOS: &[&str] = &["core", "extra", "community", "multilib"];

/// Size of the scratch disk used by `archoffline boot`
pub const BOOT_DISK_SIZE: &str = "15G";

/// Memory given to the boot-test virtual machine
pub const BOOT_MEMORY_MB: u32 = 2048;

/// OVMF firmware code image used by the boot test
pub const OVMF_CODE: &str = "/usr/share/ovmf/x64/OVMF_CODE.fd";

/// OVMF firmware variables image used by the boot test
pub const OVMF_VARS: &str = "/usr/share/ovmf/x64/OVMF_VARS.fd";

/// Directory (under the ISO's `/root`) the installer tool is cloned into
pub const INSTALLER_DIR: &str = "archinstall-git";

/// Directory inside the installer clone that receives extra profiles
pub const INSTALLER_PROFILE_DIR: &str = "archinstall/default_profiles";

/// Autorun command used when the installer is cloned without an explicit one
pub const DEFAULT_INSTALLER_AUTORUN: &str = "cd /root/archinstall-git && python -m archinstall";
