//! Load a flat `key -> value` config map from a `.properties`, `.yaml`/`.yml`
//! or `.json` file, mirroring `original_source/config/config.go`'s support
//! for all three formats picked by file extension.

use std::collections::HashMap;
use std::path::Path;

use serde_json::Value as JsonValue;
use serde_yaml::Value as YamlValue;

use crate::error::{ProxyError, Result};

pub fn load_file(path: impl AsRef<Path>) -> Result<HashMap<String, String>> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)?;
    match path.extension().and_then(|e| e.to_str()) {
        Some("yaml") | Some("yml") => load_yaml(&contents),
        Some("json") => load_json(&contents),
        Some("properties") | None => Ok(load_properties(&contents)),
        Some(other) => Err(ProxyError::Config(format!("unsupported config extension: {other}"))),
    }
}

/// Java-style `.properties`: one `key=value` or `key: value` per line,
/// blank lines and `#`/`!`-prefixed comments ignored.
pub fn load_properties(contents: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with('!') {
            continue;
        }
        let sep = line.find('=').or_else(|| line.find(':'));
        let Some(sep) = sep else { continue };
        let key = line[..sep].trim().to_string();
        let value = line[sep + 1..].trim().to_string();
        if !key.is_empty() {
            map.insert(key, value);
        }
    }
    map
}

pub fn load_json(contents: &str) -> Result<HashMap<String, String>> {
    let value: JsonValue = serde_json::from_str(contents)?;
    let mut map = HashMap::new();
    flatten_json("", &value, &mut map);
    Ok(map)
}

pub fn load_yaml(contents: &str) -> Result<HashMap<String, String>> {
    let value: YamlValue = serde_yaml::from_str(contents)?;
    let mut map = HashMap::new();
    flatten_yaml("", &value, &mut map);
    Ok(map)
}

fn flatten_json(prefix: &str, value: &JsonValue, out: &mut HashMap<String, String>) {
    match value {
        JsonValue::Object(obj) => {
            for (k, v) in obj {
                let key = if prefix.is_empty() { k.clone() } else { format!("{prefix}.{k}") };
                flatten_json(&key, v, out);
            }
        }
        JsonValue::Array(arr) => {
            for (i, v) in arr.iter().enumerate() {
                let key = format!("{prefix}.{i}");
                flatten_json(&key, v, out);
            }
        }
        JsonValue::String(s) => {
            out.insert(prefix.to_string(), s.clone());
        }
        JsonValue::Null => {}
        other => {
            out.insert(prefix.to_string(), other.to_string());
        }
    }
}

fn flatten_yaml(prefix: &str, value: &YamlValue, out: &mut HashMap<String, String>) {
    match value {
        YamlValue::Mapping(map) => {
            for (k, v) in map {
                let Some(k) = k.as_str() else { continue };
                let key = if prefix.is_empty() { k.to_string() } else { format!("{prefix}.{k}") };
                flatten_yaml(&key, v, out);
            }
        }
        YamlValue::Sequence(seq) => {
            for (i, v) in seq.iter().enumerate() {
                let key = format!("{prefix}.{i}");
                flatten_yaml(&key, v, out);
            }
        }
        YamlValue::String(s) => {
            out.insert(prefix.to_string(), s.clone());
        }
        YamlValue::Null => {}
        other => {
            if let Some(s) = yaml_scalar_to_string(other) {
                out.insert(prefix.to_string(), s);
            }
        }
    }
}

fn yaml_scalar_to_string(value: &YamlValue) -> Option<String> {
    match value {
        YamlValue::Bool(b) => Some(b.to_string()),
        YamlValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn properties_parses_equals_and_colon_forms() {
        let contents = "agent.server.port=9080\n# comment\nagent.server.ip: 0.0.0.0\n\nagent.upstream.id=u1\n";
        let map = load_properties(contents);
        assert_eq!(map.get("agent.server.port"), Some(&"9080".to_string()));
        assert_eq!(map.get("agent.server.ip"), Some(&"0.0.0.0".to_string()));
        assert_eq!(map.get("agent.upstream.id"), Some(&"u1".to_string()));
        assert_eq!(map.len(), 3);
    }

    #[test]
    fn json_is_flattened_with_dotted_keys() {
        let contents = r#"{"agent": {"server": {"port": "9080"}}}"#;
        let map = load_json(contents).unwrap();
        assert_eq!(map.get("agent.server.port"), Some(&"9080".to_string()));
    }

    #[test]
    fn yaml_is_flattened_with_dotted_keys() {
        let contents = "agent:\n  server:\n    port: \"9080\"\n";
        let map = load_yaml(contents).unwrap();
        assert_eq!(map.get("agent.server.port"), Some(&"9080".to_string()));
    }

    #[test]
    fn load_file_rejects_unknown_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conf.ini");
        std::fs::write(&path, "x=1").unwrap();
        assert!(load_file(&path).is_err());
    }
}
