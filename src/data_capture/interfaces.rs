//! Interface discovery from sysfs.

use std::fs;
use std::path::Path;

use serde::Serialize;

const SYS_NET: &str = "/sys/class/net";

/// Pseudo interface capturing on all devices.
pub const ANY_INTERFACE: &str = "any";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InterfaceInfo {
    pub name: String,
    pub up: bool,
    pub mac: Option<String>,
}

pub fn list_interfaces() -> Vec<String> {
    list_interfaces_in(Path::new(SYS_NET))
}

pub fn interface_exists(name: &str) -> bool {
    name == ANY_INTERFACE || Path::new(SYS_NET).join(name).exists()
}

pub fn interface_info(name: &str) -> Option<InterfaceInfo> {
    interface_info_in(Path::new(SYS_NET), name)
}

fn list_interfaces_in(base: &Path) -> Vec<String> {
    let mut names: Vec<String> = match fs::read_dir(base) {
        Ok(entries) => entries
            .flatten()
            .filter_map(|e| e.file_name().to_str().map(str::to_string))
            .collect(),
        Err(_) => Vec::new(),
    };
    names.sort();
    names
}

fn interface_info_in(base: &Path, name: &str) -> Option<InterfaceInfo> {
    let dir = base.join(name);
    if !dir.exists() {
        return None;
    }
    let read = |file: &str| {
        fs::read_to_string(dir.join(file))
            .ok()
            .map(|s| s.trim().to_string())
    };
    // "unknown" is what most virtual devices report while passing traffic.
    let up = matches!(read("operstate").as_deref(), Some("up") | Some("unknown"));
    let mac = read("address").filter(|m| !m.is_empty());
    Some(InterfaceInfo {
        name: name.to_string(),
        up,
        mac,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn reads_fake_sysfs_tree() {
        let tmp = TempDir::new().unwrap();
        for (name, state) in [("eth0", "up"), ("lo", "unknown"), ("wlan0", "down")] {
            let dir = tmp.path().join(name);
            fs::create_dir_all(&dir).unwrap();
            fs::write(dir.join("operstate"), format!("{}\n", state)).unwrap();
            fs::write(dir.join("address"), "aa:bb:cc:dd:ee:ff\n").unwrap();
        }
        assert_eq!(list_interfaces_in(tmp.path()), vec!["eth0", "lo", "wlan0"]);
        assert!(interface_info_in(tmp.path(), "lo").unwrap().up);
        let wlan = interface_info_in(tmp.path(), "wlan0").unwrap();
        assert!(!wlan.up);
        assert_eq!(wlan.mac.as_deref(), Some("aa:bb:cc:dd:ee:ff"));
        assert!(interface_info_in(tmp.path(), "eth9").is_none());
    }

    #[test]
    fn any_always_exists() {
        assert!(interface_exists(ANY_INTERFACE));
    }
}
