//! Global config singleton. Loads settings.json once; every caller going through
//! `ensure_loaded()` gets the same instance.

use std::path::PathBuf;
use std::sync::OnceLock;

/// Root directory for config: settings.json lives next to the workspace root.
fn config_root() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("..")
}

static CONFIG: OnceLock<Config> = OnceLock::new();

/// Per-UID resource caps enforced by the sandbox dispatcher. `max_file_size_mb`
/// is not checked by `check_limits` (there's no hook point to inspect a
/// write's size from outside the container) but is applied as a `ulimit -f`
/// on the interactive shell at spawn time.
#[derive(Debug, Clone, Copy)]
pub struct ResourceLimits {
    pub max_processes: u32,
    pub max_memory_mb: u64,
    pub max_cpu_percent: f64,
    pub max_disk_mb: u64,
    pub max_file_size_mb: u64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_processes: 32,
            max_memory_mb: 512,
            max_cpu_percent: 200.0,
            max_disk_mb: 1024,
            max_file_size_mb: 100,
        }
    }
}

/// Cached config from settings.json.
pub struct Config {
    /// Name of the container all sandboxed commands and interactive shells run inside.
    pub container_name: String,
    /// Base added to the UID hash modulus: `UID = uid_base + (hash(owner_id) mod uid_modulus)`.
    pub uid_base: u32,
    pub uid_modulus: u32,
    /// Directory under which per-user home directories are created, e.g. `/home`.
    pub home_base: PathBuf,
    pub limits: ResourceLimits,
    /// Framebuffer width/height in columns/rows.
    pub fb_width: u16,
    pub fb_height: u16,
    /// Scrollback capacity in rows.
    pub scrollback_rows: usize,
    /// Minimum interval between non-bell surface publishes, in milliseconds.
    pub min_publish_interval_ms: u64,
    /// Hold duration for a bell flash, in milliseconds.
    pub flash_hold_ms: u64,
    /// Hard per-call timeout for one-shot `execute`, in seconds.
    pub exec_timeout_secs: u64,
}

/// Ensure config is loaded (idempotent). Loads settings.json on first call; returns the same instance afterwards.
pub fn ensure_loaded() -> &'static Config {
    CONFIG.get_or_init(|| {
        let path = config_root().join("settings.json");
        load_settings_from(&path)
    })
}

fn load_settings_from(path: &std::path::Path) -> Config {
    let Ok(data) = std::fs::read_to_string(path) else {
        return Config::default();
    };
    let Ok(root) = serde_json::from_str::<serde_json::Value>(&data) else {
        return Config::default();
    };

    let sandbox = root.get("sandbox");

    let container_name = sandbox
        .and_then(|s| s.get("container_name"))
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "shellmux".to_string());

    let uid_base = sandbox
        .and_then(|s| s.get("uid_base"))
        .and_then(|v| v.as_u64())
        .map(|v| v as u32)
        .unwrap_or(1000);

    let uid_modulus = sandbox
        .and_then(|s| s.get("uid_modulus"))
        .and_then(|v| v.as_u64())
        .map(|v| v as u32)
        .unwrap_or(2_147_483_147);

    let home_base = sandbox
        .and_then(|s| s.get("home_base"))
        .and_then(|v| v.as_str())
        .map(PathBuf::from)
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| PathBuf::from("/home"));

    let limits = sandbox
        .and_then(|s| s.get("limits"))
        .map(|l| ResourceLimits {
            max_processes: l
                .get("max_processes")
                .and_then(|v| v.as_u64())
                .map(|v| v as u32)
                .unwrap_or_else(|| ResourceLimits::default().max_processes),
            max_memory_mb: l
                .get("max_memory_mb")
                .and_then(|v| v.as_u64())
                .unwrap_or_else(|| ResourceLimits::default().max_memory_mb),
            max_cpu_percent: l
                .get("max_cpu_percent")
                .and_then(|v| v.as_f64())
                .unwrap_or_else(|| ResourceLimits::default().max_cpu_percent),
            max_disk_mb: l
                .get("max_disk_mb")
                .and_then(|v| v.as_u64())
                .unwrap_or_else(|| ResourceLimits::default().max_disk_mb),
            max_file_size_mb: l
                .get("max_file_size_mb")
                .and_then(|v| v.as_u64())
                .unwrap_or_else(|| ResourceLimits::default().max_file_size_mb),
        })
        .unwrap_or_default();

    let framebuffer = root.get("framebuffer");
    let fb_width = framebuffer
        .and_then(|f| f.get("width"))
        .and_then(|v| v.as_u64())
        .map(|v| v as u16)
        .unwrap_or(80);
    let fb_height = framebuffer
        .and_then(|f| f.get("height"))
        .and_then(|v| v.as_u64())
        .map(|v| v as u16)
        .unwrap_or(24);
    let scrollback_rows = framebuffer
        .and_then(|f| f.get("scrollback_rows"))
        .and_then(|v| v.as_u64())
        .map(|v| v as usize)
        .unwrap_or(1000);

    let coalescer = root.get("coalescer");
    let min_publish_interval_ms = coalescer
        .and_then(|c| c.get("min_publish_interval_ms"))
        .and_then(|v| v.as_u64())
        .unwrap_or(100);
    let flash_hold_ms = coalescer
        .and_then(|c| c.get("flash_hold_ms"))
        .and_then(|v| v.as_u64())
        .unwrap_or(150);

    let exec_timeout_secs = sandbox
        .and_then(|s| s.get("exec_timeout_secs"))
        .and_then(|v| v.as_u64())
        .unwrap_or(30);

    Config {
        container_name,
        uid_base,
        uid_modulus,
        home_base,
        limits,
        fb_width,
        fb_height,
        scrollback_rows,
        min_publish_interval_ms,
        flash_hold_ms,
        exec_timeout_secs,
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            container_name: "shellmux".to_string(),
            uid_base: 1000,
            uid_modulus: 2_147_483_147,
            home_base: PathBuf::from("/home"),
            limits: ResourceLimits::default(),
            fb_width: 80,
            fb_height: 24,
            scrollback_rows: 1000,
            min_publish_interval_ms: 100,
            flash_hold_ms: 150,
            exec_timeout_secs: 30,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let config = load_settings_from(std::path::Path::new("/nonexistent/settings.json"));
        assert_eq!(config.container_name, "shellmux");
        assert_eq!(config.fb_width, 80);
        assert_eq!(config.fb_height, 24);
        assert_eq!(config.uid_modulus, 2_147_483_147);
    }

    #[test]
    fn partial_overrides_leave_the_rest_at_default() {
        let dir = std::env::temp_dir().join(format!("shellmux-config-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("settings.json");
        std::fs::write(
            &path,
            r#"{"sandbox": {"container_name": "my-box", "limits": {"max_processes": 8}}, "framebuffer": {"width": 120}}"#,
        )
        .unwrap();

        let config = load_settings_from(&path);
        assert_eq!(config.container_name, "my-box");
        assert_eq!(config.limits.max_processes, 8);
        // untouched fields keep their defaults
        assert_eq!(config.limits.max_memory_mb, ResourceLimits::default().max_memory_mb);
        assert_eq!(config.limits.max_file_size_mb, ResourceLimits::default().max_file_size_mb);
        assert_eq!(config.fb_width, 120);
        assert_eq!(config.fb_height, 24);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn malformed_json_falls_back_to_defaults() {
        let dir = std::env::temp_dir().join(format!("shellmux-config-test-bad-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("settings.json");
        std::fs::write(&path, "{not json").unwrap();

        let config = load_settings_from(&path);
        assert_eq!(config.container_name, "shellmux");

        std::fs::remove_dir_all(&dir).ok();
    }
}
