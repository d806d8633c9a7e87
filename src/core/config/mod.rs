use serde::Deserialize;
use std::fs;

fn default_console_port() -> u16 {
    5000
}

fn default_memory_kw() -> usize {
    512
}

fn default_memory_mb() -> usize {
    16
}

fn default_dz_lines() -> usize {
    8
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BootDevice {
    Disk,
    Tape,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Ks10Config {
    /// Physical memory in kilowords (36-bit), up to 1024.
    #[serde(default = "default_memory_kw")]
    pub memory_kw: usize,
    pub boot_device: Option<BootDevice>,
    pub boot_image: Option<String>,
    /// File number to position to for tape boots.
    #[serde(default)]
    pub boot_file: usize,
}

impl Default for Ks10Config {
    fn default() -> Self {
        Self {
            memory_kw: default_memory_kw(),
            boot_device: None,
            boot_image: None,
            boot_file: 0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct VaxConfig {
    /// Physical memory in megabytes, up to 64.
    #[serde(default = "default_memory_mb")]
    pub memory_mb: usize,
    pub rom_image: Option<String>,
    pub disk_image: Option<String>,
}

impl Default for VaxConfig {
    fn default() -> Self {
        Self {
            memory_mb: default_memory_mb(),
            rom_image: None,
            disk_image: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NetConfig {
    /// Station address burned into the DEQNA PROM, colon-separated.
    pub mac: Option<String>,
    /// Host TUN/TAP interface carrying raw frames.
    pub tap: Option<String>,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            mac: None,
            tap: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_console_port")]
    pub console_port: u16,
    #[serde(default = "default_dz_lines")]
    pub dz_lines: usize,
    #[serde(default)]
    pub ks10: Ks10Config,
    #[serde(default)]
    pub vax: VaxConfig,
    #[serde(default)]
    pub net: NetConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            console_port: default_console_port(),
            dz_lines: default_dz_lines(),
            ks10: Ks10Config::default(),
            vax: VaxConfig::default(),
            net: NetConfig::default(),
        }
    }
}

impl Config {
    pub fn load(path: &str) -> Result<Self, String> {
        let text = fs::read_to_string(path)
            .map_err(|e| format!("can't read config {path}: {e}"))?;
        serde_yaml::from_str(&text).map_err(|e| format!("bad config {path}: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert_eq!(config.console_port, 5000);
        assert_eq!(config.ks10.memory_kw, 512);
        assert_eq!(config.vax.memory_mb, 16);
    }

    #[test]
    fn partial_yaml_fills_defaults() {
        let config: Config = serde_yaml::from_str("console_port: 5010\nks10:\n  memory_kw: 1024\n").unwrap();
        assert_eq!(config.console_port, 5010);
        assert_eq!(config.ks10.memory_kw, 1024);
        assert_eq!(config.dz_lines, 8);
    }
}
