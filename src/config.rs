//! Process environment snapshot.
//!
//! All tunables are read exactly once, by the embedder, before any device
//! is created. Render threads only ever see the resulting [`EnvConfig`]
//! value, never the environment itself.

use std::path::{Path, PathBuf};

/// Highest swapchain depth any strategy will use.
pub const MAX_BUFFERING: usize = 4;

/// Snapshot of the `SCANOUT_*` environment variables.
#[derive(Debug, Clone, Default)]
pub struct EnvConfig {
    /// `SCANOUT_FORCE_LEGACY_API` - never request the atomic client cap.
    pub force_legacy_api: bool,
    /// `SCANOUT_FORCE_LEGACY_CURSOR` - drive the cursor through the legacy ioctls.
    pub force_legacy_cursor: bool,
    /// `SCANOUT_FORCE_GL_ALLOCATION` - CPU strategy allocates through the paint stack.
    pub force_gl_allocation: bool,
    /// `SCANOUT_ENABLE_WRITEBACK_CONNECTORS` - request the writeback client cap.
    pub enable_writeback_connectors: bool,
    /// `SCANOUT_DISABLE_CUSTOM_SCANOUT` - refuse user-provided scanout buffers.
    pub disable_custom_scanout: bool,
    /// `SCANOUT_DISABLE_CURSOR` - report no cursor capability anywhere.
    pub disable_cursor: bool,
    /// `SCANOUT_NVIDIA_CURSOR` - opt into hardware cursors on the nvidia driver.
    pub nvidia_cursor: bool,
    /// `SCANOUT_RENDER_MODE_{SELF,PRIME,DUMB,CPU}_FB_COUNT` in strategy order.
    pub fb_count: [Option<usize>; 4],
    /// `SCANOUT_DEVICE_BLACKLIST` - colon separated node paths to skip.
    pub device_blacklist: Vec<PathBuf>,
}

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|x| x == "1" || x.to_lowercase() == "true" || x.to_lowercase() == "yes" || x.to_lowercase() == "y")
        .unwrap_or(false)
}

fn env_fb_count(name: &str) -> Option<usize> {
    let count: usize = std::env::var(name).ok()?.parse().ok()?;
    if (1..=MAX_BUFFERING).contains(&count) {
        Some(count)
    } else {
        None
    }
}

impl EnvConfig {
    /// Snapshot the current process environment.
    pub fn from_env() -> Self {
        EnvConfig {
            force_legacy_api: env_flag("SCANOUT_FORCE_LEGACY_API"),
            force_legacy_cursor: env_flag("SCANOUT_FORCE_LEGACY_CURSOR"),
            force_gl_allocation: env_flag("SCANOUT_FORCE_GL_ALLOCATION"),
            enable_writeback_connectors: env_flag("SCANOUT_ENABLE_WRITEBACK_CONNECTORS"),
            disable_custom_scanout: env_flag("SCANOUT_DISABLE_CUSTOM_SCANOUT"),
            disable_cursor: env_flag("SCANOUT_DISABLE_CURSOR"),
            nvidia_cursor: env_flag("SCANOUT_NVIDIA_CURSOR"),
            fb_count: [
                env_fb_count("SCANOUT_RENDER_MODE_SELF_FB_COUNT"),
                env_fb_count("SCANOUT_RENDER_MODE_PRIME_FB_COUNT"),
                env_fb_count("SCANOUT_RENDER_MODE_DUMB_FB_COUNT"),
                env_fb_count("SCANOUT_RENDER_MODE_CPU_FB_COUNT"),
            ],
            device_blacklist: std::env::var("SCANOUT_DEVICE_BLACKLIST")
                .map(|list| list.split(':').filter(|s| !s.is_empty()).map(PathBuf::from).collect())
                .unwrap_or_default(),
        }
    }

    /// Whether the node at `path` is blacklisted and should be skipped by
    /// the enumerating caller.
    pub fn is_device_blacklisted(&self, path: &Path) -> bool {
        self.device_blacklist.iter().any(|p| p == path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_parsing() {
        std::env::set_var("SCANOUT_TEST_FLAG_A", "1");
        std::env::set_var("SCANOUT_TEST_FLAG_B", "yes");
        std::env::set_var("SCANOUT_TEST_FLAG_C", "0");
        assert!(env_flag("SCANOUT_TEST_FLAG_A"));
        assert!(env_flag("SCANOUT_TEST_FLAG_B"));
        assert!(!env_flag("SCANOUT_TEST_FLAG_C"));
        assert!(!env_flag("SCANOUT_TEST_FLAG_UNSET"));
    }

    #[test]
    fn fb_count_clamping() {
        std::env::set_var("SCANOUT_TEST_FB_OK", "3");
        std::env::set_var("SCANOUT_TEST_FB_LOW", "0");
        std::env::set_var("SCANOUT_TEST_FB_HIGH", "9");
        std::env::set_var("SCANOUT_TEST_FB_JUNK", "two");
        assert_eq!(env_fb_count("SCANOUT_TEST_FB_OK"), Some(3));
        assert_eq!(env_fb_count("SCANOUT_TEST_FB_LOW"), None);
        assert_eq!(env_fb_count("SCANOUT_TEST_FB_HIGH"), None);
        assert_eq!(env_fb_count("SCANOUT_TEST_FB_JUNK"), None);
    }

    #[test]
    fn blacklist_lookup() {
        let config = EnvConfig {
            device_blacklist: vec![PathBuf::from("/dev/dri/card1")],
            ..Default::default()
        };
        assert!(config.is_device_blacklisted(Path::new("/dev/dri/card1")));
        assert!(!config.is_device_blacklisted(Path::new("/dev/dri/card0")));
    }
}
