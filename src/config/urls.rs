//! Upstream service URLs

/// Arch Linux mirror status (JSON)
pub const MIRROR_STATUS: &str = "https://archlinux.org/mirrors/status/json/";

/// AUR RPC endpoint used to resolve package names
pub const AUR_RPC_INFO: &str = "https://aur.archlinux.org/rpc/v5/info";

/// AUR snapshot tarball base URL (`<base>/<pkgbase>.tar.gz`)
pub const AUR_SNAPSHOT: &str = "https://aur.archlinux.org/cgit/aur.git/snapshot";

/// Installer tool repository cloned by `--archinstall`
pub const ARCHINSTALL_GIT: &str = "https://github.com/archlinux/archinstall.git";
