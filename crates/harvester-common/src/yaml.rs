//! YAML parsing and merging utilities using yaml-rust2
//!
//! Documents are parsed into `serde_json::Value` so that typed deserialization
//! and deep merging share one representation. Serialization back to YAML goes
//! through serde_yaml; object keys come out sorted, which keeps merged
//! cloud-init output deterministic.

use serde_json::{Map, Number, Value};
use yaml_rust2::{Yaml, YamlLoader};

use crate::Error;

/// Error type for YAML parsing
#[derive(Debug, Clone)]
pub struct YamlError(String);

impl std::fmt::Display for YamlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for YamlError {}

impl From<YamlError> for Error {
    fn from(e: YamlError) -> Self {
        Error::serialization_for_kind("yaml", e.0)
    }
}

/// Parse a YAML string into a serde_json::Value.
///
/// For multi-document YAML, returns only the first document.
/// Returns `Value::Null` for empty input.
pub fn parse_yaml(input: &str) -> Result<Value, YamlError> {
    let docs = YamlLoader::load_from_str(input).map_err(|e| YamlError(e.to_string()))?;
    match docs.into_iter().next() {
        Some(doc) => yaml_to_json(doc),
        None => Ok(Value::Null),
    }
}

/// Parse a YAML document that must be a mapping (or empty).
///
/// Empty documents and explicit nulls become an empty map.
pub fn parse_yaml_mapping(input: &str) -> Result<Map<String, Value>, YamlError> {
    match parse_yaml(input)? {
        Value::Null => Ok(Map::new()),
        Value::Object(map) => Ok(map),
        other => Err(YamlError(format!(
            "expected a YAML mapping, got {}",
            type_name(&other)
        ))),
    }
}

/// Serialize a value to YAML text.
pub fn to_yaml(value: &Value) -> Result<String, Error> {
    Ok(serde_yaml::to_string(value)?)
}

/// Deep-merge `src` into `dst` with append-slice semantics.
///
/// - mappings merge recursively
/// - sequences are concatenated, `src` items first
/// - any other non-null `src` value replaces the `dst` value
///
/// A null `src` leaves `dst` untouched, so merging an empty document is a
/// no-op.
pub fn merge_append(dst: &mut Value, src: Value) {
    match (dst, src) {
        (_, Value::Null) => {}
        (Value::Object(dst_map), Value::Object(src_map)) => {
            for (key, src_value) in src_map {
                match dst_map.get_mut(&key) {
                    Some(dst_value) => merge_append(dst_value, src_value),
                    None => {
                        dst_map.insert(key, src_value);
                    }
                }
            }
        }
        (Value::Array(dst_items), Value::Array(mut src_items)) => {
            src_items.append(dst_items);
            *dst_items = src_items;
        }
        (dst, src) => *dst = src,
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "sequence",
        Value::Object(_) => "mapping",
    }
}

/// Convert a yaml_rust2::Yaml value to serde_json::Value
fn yaml_to_json(yaml: Yaml) -> Result<Value, YamlError> {
    match yaml {
        Yaml::Null => Ok(Value::Null),
        Yaml::Boolean(b) => Ok(Value::Bool(b)),
        Yaml::Integer(i) => Ok(Value::Number(i.into())),
        Yaml::Real(s) => {
            let f: f64 = s
                .parse()
                .map_err(|e: std::num::ParseFloatError| YamlError(e.to_string()))?;
            Ok(Number::from_f64(f)
                .map(Value::Number)
                .unwrap_or(Value::Null))
        }
        Yaml::String(s) => Ok(Value::String(s)),
        Yaml::Array(arr) => arr
            .into_iter()
            .map(yaml_to_json)
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Yaml::Hash(map) => map
            .into_iter()
            .map(|(k, v)| {
                let key = match k {
                    Yaml::String(s) => s,
                    Yaml::Integer(i) => i.to_string(),
                    Yaml::Real(r) => r,
                    Yaml::Boolean(b) => b.to_string(),
                    Yaml::Null => "null".to_string(),
                    _ => return Err(YamlError("unsupported YAML key type".to_string())),
                };
                yaml_to_json(v).map(|v| (key, v))
            })
            .collect::<Result<Map<String, Value>, _>>()
            .map(Value::Object),
        Yaml::Alias(_) => Err(YamlError("YAML aliases not supported".to_string())),
        Yaml::BadValue => Err(YamlError("bad YAML value".to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_yaml_nested() {
        let yaml = r#"
network:
  version: 1
  config:
    - type: physical
      name: enp1s0
"#;
        let result = parse_yaml(yaml).unwrap();
        assert_eq!(result["network"]["version"], 1);
        assert_eq!(result["network"]["config"][0]["name"], "enp1s0");
    }

    #[test]
    fn test_parse_yaml_empty() {
        assert_eq!(parse_yaml("").unwrap(), Value::Null);
        assert!(parse_yaml_mapping("").unwrap().is_empty());
    }

    #[test]
    fn test_parse_yaml_comment_only_is_empty() {
        assert!(parse_yaml_mapping("#cloud-config\n").unwrap().is_empty());
    }

    #[test]
    fn test_parse_yaml_mapping_rejects_sequence() {
        let err = parse_yaml_mapping("- a\n- b\n").unwrap_err();
        assert!(err.to_string().contains("sequence"));
    }

    #[test]
    fn test_parse_yaml_invalid() {
        assert!(parse_yaml("not: valid: yaml: {{").is_err());
    }

    #[test]
    fn test_merge_concatenates_sequences_source_first() {
        let mut dst = json!({"runcmd": ["a"], "packages": ["x"]});
        merge_append(&mut dst, json!({"runcmd": ["b", "c"]}));
        assert_eq!(dst, json!({"runcmd": ["b", "c", "a"], "packages": ["x"]}));
    }

    #[test]
    fn test_merge_source_scalar_wins() {
        let mut dst = json!({"package_update": false, "user": "rancher"});
        merge_append(&mut dst, json!({"package_update": true}));
        assert_eq!(dst, json!({"package_update": true, "user": "rancher"}));
    }

    #[test]
    fn test_merge_recurses_into_mappings() {
        let mut dst = json!({"chpasswd": {"expire": false, "list": ["a"]}});
        merge_append(&mut dst, json!({"chpasswd": {"list": ["b"]}}));
        assert_eq!(dst, json!({"chpasswd": {"expire": false, "list": ["b", "a"]}}));
    }

    #[test]
    fn test_merge_empty_source_is_noop() {
        let original = json!({"runcmd": ["a"], "ssh_pwauth": true});
        let mut dst = original.clone();
        merge_append(&mut dst, Value::Null);
        assert_eq!(dst, original);
        merge_append(&mut dst, json!({}));
        assert_eq!(dst, original);
    }

    #[test]
    fn test_to_yaml_sorts_keys() {
        let value = json!({"runcmd": ["sh install.sh"], "packages": ["qemu-guest-agent"]});
        let text = to_yaml(&value).unwrap();
        assert_eq!(
            text,
            "packages:\n- qemu-guest-agent\nruncmd:\n- sh install.sh\n"
        );
    }
}
