use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde_json::Value;
use tracing::{info, warn};

use crate::error::ConfigError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Lsr,
    Dvr,
    Dijkstra,
    Flooding,
}

impl Protocol {
    fn parse(raw: &str) -> Self {
        match raw.to_ascii_lowercase().as_str() {
            "dvr" => Protocol::Dvr,
            "dijkstra" => Protocol::Dijkstra,
            "flooding" => Protocol::Flooding,
            "lsr" => Protocol::Lsr,
            other => {
                warn!(proto = %other, "unrecognized PROTO value, defaulting to lsr");
                Protocol::Lsr
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub section: String,
    pub topo_id: String,
    pub my_id: String,
    pub hello_interval_sec: f64,
    pub info_interval_sec: f64,
    pub hello_timeout_sec: f64,
    pub log_level: String,
    pub protocol: Protocol,
    pub transport: String,
    pub names_cfg: BTreeMap<String, String>,
    pub topo_cfg: BTreeMap<String, Value>,
    pub neighbor_ids: Vec<String>,
    pub neighbor_weights: BTreeMap<String, f64>,
    pub neighbor_map: BTreeMap<String, String>,
}

impl NodeConfig {
    /// Loads `names.json`/`topo.json`, then layers in environment variables
    /// (an optional dotenv-style `env_path` is read first so it can supply
    /// values the real environment doesn't already set). Grounded on the
    /// reference implementation's `Node._load_configs`.
    pub fn load(env_path: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = env_path {
            apply_dotenv_file(path)?;
        }

        let section = env_or("SECTION", "sec10");
        let topo_id = env_or("TOPO", "topo1");
        let my_id = env_or("NODE", "A");
        let names_path = env_or("NAMES_PATH", "./configs/names.json");
        let topo_path = env_or("TOPO_PATH", "./configs/topo.json");
        let hello_interval_sec = env_f64("HELLO_INTERVAL_SEC", 5.0);
        let info_interval_sec = env_f64("INFO_INTERVAL_SEC", 12.0);
        let hello_timeout_sec = env_f64("HELLO_TIMEOUT_SEC", 20.0);
        let log_level = env_or("LOG_LEVEL", "info");
        let protocol = Protocol::parse(&env_or("PROTO", "lsr"));
        let transport = env_or("TRANSPORT", "in-process").to_lowercase();
        if transport != "in-process" {
            warn!(requested = %transport, "this crate only ships the in-process transport; using it anyway");
        }

        let names_doc = load_envelope(&names_path, "names")?;
        let topo_doc = load_envelope(&topo_path, "topo")?;

        let names_cfg: BTreeMap<String, String> = names_doc
            .as_object()
            .into_iter()
            .flat_map(|obj| obj.iter())
            .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
            .collect();

        let topo_cfg: BTreeMap<String, Value> = topo_doc
            .as_object()
            .into_iter()
            .flat_map(|obj| obj.iter())
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let raw_neighbors = topo_cfg.get(&my_id).cloned().unwrap_or(Value::Array(Vec::new()));
        let neighbor_weights = normalize_neighbor_weights(&raw_neighbors)?;
        let neighbor_ids: Vec<String> = neighbor_weights.keys().cloned().collect();
        let neighbor_map: BTreeMap<String, String> = neighbor_ids
            .iter()
            .filter_map(|id| names_cfg.get(id).map(|channel| (id.clone(), channel.clone())))
            .collect();

        if neighbor_map.is_empty() {
            warn!(node = %my_id, "this node has no neighbors mapped in names.json/topo.json");
        }

        info!(node = %my_id, neighbors = ?neighbor_ids, protocol = ?protocol, transport = %transport, "node configuration loaded");

        Ok(Self {
            section,
            topo_id,
            my_id,
            hello_interval_sec,
            info_interval_sec,
            hello_timeout_sec,
            log_level,
            protocol,
            transport,
            names_cfg,
            topo_cfg,
            neighbor_ids,
            neighbor_weights,
            neighbor_map,
        })
    }

    pub fn my_channel(&self) -> String {
        self.names_cfg
            .get(&self.my_id)
            .cloned()
            .unwrap_or_else(|| format!("{}.{}.{}", self.section, self.topo_id, self.my_id))
    }

    /// The whole network's neighbor lists, unit-cost, for the static
    /// Dijkstra protocol (which ignores `topo.json`'s weights entirely).
    pub fn static_topology(&self) -> BTreeMap<String, Vec<String>> {
        self.topo_cfg
            .iter()
            .map(|(node, raw)| {
                let neighbors = match raw {
                    Value::Object(map) => map.keys().cloned().collect(),
                    Value::Array(items) => items.iter().filter_map(Value::as_str).map(str::to_string).collect(),
                    _ => Vec::new(),
                };
                (node.clone(), neighbors)
            })
            .collect()
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_f64(key: &str, default: f64) -> f64 {
    std::env::var(key)
        .ok()
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(default)
}

fn load_envelope(path: &str, expected_type: &'static str) -> Result<Value, ConfigError> {
    let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_string(),
        source,
    })?;
    let doc: Value = serde_json::from_str(&text).map_err(|source| ConfigError::InvalidJson {
        path: path.to_string(),
        source,
    })?;
    let matches_type = doc.get("type").and_then(Value::as_str) == Some(expected_type);
    let config = doc.get("config").cloned();
    match (matches_type, config) {
        (true, Some(config)) => Ok(config),
        _ => Err(ConfigError::MissingEnvelope {
            path: path.to_string(),
            expected_type,
        }),
    }
}

/// Accepts a bare list of neighbor ids (implying unit cost) or a `{id:
/// cost}` map (every cost must be `> 0`).
fn normalize_neighbor_weights(raw: &Value) -> Result<BTreeMap<String, f64>, ConfigError> {
    match raw {
        Value::Object(map) => map
            .iter()
            .map(|(neighbor, cost)| {
                let cost = cost.as_f64().ok_or_else(|| ConfigError::InvalidNeighborWeight {
                    neighbor: neighbor.clone(),
                    reason: "not a number".to_string(),
                })?;
                if cost <= 0.0 {
                    return Err(ConfigError::InvalidNeighborWeight {
                        neighbor: neighbor.clone(),
                        reason: format!("must be > 0, got {cost}"),
                    });
                }
                Ok((neighbor.clone(), cost))
            })
            .collect(),
        Value::Array(items) => Ok(items
            .iter()
            .filter_map(Value::as_str)
            .map(|id| (id.to_string(), 1.0))
            .collect()),
        _ => Err(ConfigError::InvalidNeighborWeight {
            neighbor: "*".to_string(),
            reason: "topo.json entry must be a list or a map of weights".to_string(),
        }),
    }
}

/// Parses a minimal `.env`-style file (`KEY=VALUE` per line, `#` comments,
/// blank lines ignored) and sets each key in the process environment if it
/// isn't already set, mirroring `python-dotenv`'s default "don't override"
/// behavior.
pub fn apply_dotenv(path: &Path) -> Result<(), ConfigError> {
    apply_dotenv_file(path)
}

fn apply_dotenv_file(path: &Path) -> Result<(), ConfigError> {
    let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })?;
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        let value = value.trim().trim_matches('"');
        if std::env::var(key).is_err() {
            std::env::set_var(key, value);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_file(dir: &tempfile::TempDir, name: &str, contents: &str) -> std::path::PathBuf {
        let path = dir.path().join(name);
        let mut file = fs::File::create(&path).unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        path
    }

    #[test]
    fn list_topology_implies_unit_cost() {
        let weights = normalize_neighbor_weights(&serde_json::json!(["B", "C"])).unwrap();
        assert_eq!(weights["B"], 1.0);
        assert_eq!(weights["C"], 1.0);
    }

    #[test]
    fn zero_or_negative_weight_is_rejected() {
        assert!(normalize_neighbor_weights(&serde_json::json!({"B": 0.0})).is_err());
        assert!(normalize_neighbor_weights(&serde_json::json!({"B": -2.0})).is_err());
    }

    #[test]
    fn missing_envelope_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(&dir, "names.json", r#"{"config": {}}"#);
        let err = load_envelope(path.to_str().unwrap(), "names").unwrap_err();
        assert!(matches!(err, ConfigError::MissingEnvelope { .. }));
    }

    #[test]
    fn load_builds_neighbor_map_from_names_and_topo() {
        let dir = tempfile::tempdir().unwrap();
        let names_path = write_file(
            &dir,
            "names.json",
            r#"{"type":"names","config":{"A":"sec10.topo1.A","B":"sec10.topo1.B"}}"#,
        );
        let topo_path = write_file(
            &dir,
            "topo.json",
            r#"{"type":"topo","config":{"A":{"B":2.0},"B":{"A":2.0}}}"#,
        );

        std::env::set_var("NODE", "A");
        std::env::set_var("NAMES_PATH", names_path.to_str().unwrap());
        std::env::set_var("TOPO_PATH", topo_path.to_str().unwrap());
        std::env::set_var("PROTO", "dvr");

        let cfg = NodeConfig::load(None).unwrap();
        assert_eq!(cfg.neighbor_map["B"], "sec10.topo1.B");
        assert_eq!(cfg.neighbor_weights["B"], 2.0);
        assert!(matches!(cfg.protocol, Protocol::Dvr));

        std::env::remove_var("NODE");
        std::env::remove_var("NAMES_PATH");
        std::env::remove_var("TOPO_PATH");
        std::env::remove_var("PROTO");
    }
}
