//! Read-only provider of the file payloads nbc installs into images. The
//! bytes are compiled in; nothing here depends on the host filesystem.

/// dracut `module-setup.sh` for the etc-overlay module.
pub fn dracut_module_setup() -> &'static str {
    include_str!("../assets/dracut/module-setup.sh")
}

/// The pre-pivot hook that mounts the /etc overlay.
pub fn dracut_overlay_hook() -> &'static str {
    include_str!("../assets/dracut/etc-overlay-mount.sh")
}

/// tmpfiles.d fragment creating the runtime marker on every boot.
pub fn tmpfiles_conf() -> &'static str {
    include_str!("../assets/tmpfiles/nbc.conf")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_assets_are_coherent() {
        assert!(dracut_module_setup().contains("etc-overlay-mount.sh"));
        assert!(dracut_overlay_hook().contains("lowerdir=/sysroot/.etc.lower"));
        assert!(dracut_overlay_hook().contains("upperdir=/sysroot/var/lib/nbc/etc-overlay/upper"));
        assert_eq!(tmpfiles_conf(), "f /run/nbc-booted 0644 root root - nbc\n");
    }
}
