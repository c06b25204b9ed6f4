//! Read-only catalog of preset commands.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// One preset command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Preset {
    pub label: String,
    pub command: String,
    pub description: String,
    pub category: String,
}

/// Name → preset lookup table.
///
/// Serializes as a JSON object keyed by preset name.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PresetCatalog {
    presets: BTreeMap<String, Preset>,
}

impl PresetCatalog {
    /// Catalog from explicit entries.
    #[must_use]
    pub fn new(presets: impl IntoIterator<Item = (String, Preset)>) -> Self {
        Self {
            presets: presets.into_iter().collect(),
        }
    }

    /// Built-in dashboard presets.
    #[must_use]
    pub fn builtin() -> Self {
        const BUILTIN: &[(&str, &str, &str, &str, &str)] = &[
            (
                "node_status",
                "Node Status",
                "npx @nosana/cli@latest node view",
                "Display current Nosana node information",
                "nosana",
            ),
            (
                "nosana_version",
                "Nosana Version",
                "npx @nosana/cli@latest --version",
                "Show Nosana CLI version",
                "nosana",
            ),
            (
                "gpu_info",
                "GPU Info",
                "nvidia-smi",
                "Full NVIDIA GPU diagnostic output",
                "gpu",
            ),
            (
                "gpu_processes",
                "GPU Processes",
                "nvidia-smi --query-compute-apps=pid,name,used_memory --format=csv",
                "Show processes using GPU memory",
                "gpu",
            ),
            ("disk_usage", "Disk Usage", "df -h", "Show disk space usage", "system"),
            ("memory_usage", "Memory Usage", "free -h", "Show RAM usage", "system"),
            (
                "docker_ps",
                "Docker Containers",
                "docker ps --format 'table {{.Names}}\\t{{.Status}}\\t{{.Image}}'",
                "List running Docker containers",
                "docker",
            ),
            (
                "system_uptime",
                "System Uptime",
                "uptime",
                "Show system uptime and load averages",
                "system",
            ),
            (
                "os_info",
                "OS Info",
                "cat /etc/os-release",
                "Show operating system details",
                "system",
            ),
            (
                "network_info",
                "Network Info",
                "ip addr show",
                "Show network interface configuration",
                "system",
            ),
        ];

        Self::new(BUILTIN.iter().map(|(name, label, command, description, category)| {
            (
                (*name).to_string(),
                Preset {
                    label: (*label).to_string(),
                    command: (*command).to_string(),
                    description: (*description).to_string(),
                    category: (*category).to_string(),
                },
            )
        }))
    }

    /// Look up a preset by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Preset> {
        self.presets.get(name)
    }

    /// Presets in a category, ordered by name.
    pub fn in_category<'a>(&'a self, category: &'a str) -> impl Iterator<Item = (&'a str, &'a Preset)> {
        self.presets
            .iter()
            .filter(move |(_, p)| p.category == category)
            .map(|(name, p)| (name.as_str(), p))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.presets.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.presets.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_lookup() {
        let catalog = PresetCatalog::builtin();
        assert_eq!(catalog.len(), 10);
        assert_eq!(catalog.get("disk_usage").unwrap().command, "df -h");
        assert!(catalog.get("nope").is_none());
        assert_eq!(catalog.in_category("gpu").count(), 2);
    }

    #[test]
    fn test_serializes_as_object_keyed_by_name() {
        let value = serde_json::to_value(PresetCatalog::builtin()).unwrap();
        assert_eq!(value["memory_usage"]["label"], "Memory Usage");
        assert_eq!(value["docker_ps"]["category"], "docker");
    }
}
