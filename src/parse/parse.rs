use super::spec::{ExecMode, OneOrMany, ProcessSpec, DEFAULT_KILL_TIMEOUT, MAX_INSTANCES};
use crate::error::ConfigError;
use nix::sys::signal::Signal;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_yaml::Value;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

/// One entry of the declarative file, as written. Fields stay untyped
/// here so that a missing or wrongly typed value is reported as
/// `InvalidField` with the entry it belongs to, instead of a bare serde
/// message about the whole document.
#[derive(Debug, Deserialize)]
struct AppEntry {
    name: Option<Value>,
    script: Option<Value>,
    args: Option<Value>,
    exec_interpreter: Option<Value>,
    exec_mode: Option<Value>,
    instances: Option<Value>,
    restart_delay: Option<Value>,
    cwd: Option<Value>,
    env: Option<Value>,
    out_file: Option<Value>,
    error_file: Option<Value>,
    kill_timeout: Option<Value>,
    stop_signal: Option<Value>,
    #[serde(flatten)]
    extra: BTreeMap<String, Value>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Document {
    Apps { apps: Vec<Value> },
    List(Vec<Value>),
}



/*
    @@@
    @load_file();
    . Reads the whole config file into a String; I/O errors carry the offending path.
    . Hands the text to load_str(), which does the parsing and validation.
*/
pub fn load_file(path: impl AsRef<Path>) -> Result<Vec<ProcessSpec>, ConfigError> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    load_str(&text)
}



/*
    @@@
    @load_str();
    . Accepts either a pm2-style `apps:` mapping or a bare list; JSON works too since it parses as YAML.
    . Resolves every entry into a ProcessSpec, failing on the first invalid field.
    . Rejects the whole document if two entries share a name. Nothing is launched here.
*/
pub fn load_str(text: &str) -> Result<Vec<ProcessSpec>, ConfigError> {
    let entries = match serde_yaml::from_str::<Document>(text)? {
        Document::Apps { apps } => apps,
        Document::List(list) => list,
    };

    let mut seen = HashSet::new();
    let mut specs = Vec::with_capacity(entries.len());
    for (index, raw) in entries.into_iter().enumerate() {
        let entry: AppEntry = serde_yaml::from_value(raw)
            .map_err(|e| ConfigError::invalid(&format!("#{index}"), "entry", format!("must be a mapping: {e}")))?;
        let spec = resolve_entry(index, entry)?;
        if !seen.insert(spec.name.clone()) {
            return Err(ConfigError::DuplicateName { name: spec.name });
        }
        specs.push(spec);
    }
    Ok(specs)
}

fn resolve_entry(index: usize, entry: AppEntry) -> Result<ProcessSpec, ConfigError> {
    let anonymous = format!("#{index}");
    let name = field::<String>(&anonymous, "name", entry.name)?
        .map(|n| n.trim().to_string())
        .unwrap_or_default();
    if name.is_empty() {
        return Err(ConfigError::invalid(&anonymous, "name", "must be a non-empty string"));
    }
    let label = name.as_str();

    for key in entry.extra.keys() {
        warn!(program = %label, field = %key, "Ignoring unsupported config field");
    }

    let script = field::<String>(label, "script", entry.script)?
        .map(|s| s.trim().to_string())
        .unwrap_or_default();
    if script.is_empty() {
        return Err(ConfigError::invalid(label, "script", "must be a non-empty string"));
    }

    let args = match entry.args.filter(|v| !v.is_null()) {
        None => None,
        Some(raw) => Some(
            serde_yaml::from_value::<OneOrMany<String>>(raw)
                .map_err(|_| ConfigError::invalid(label, "args", "expected a string or a list of strings"))?,
        ),
    };
    let mut arguments = match args {
        None => Vec::new(),
        Some(OneOrMany::One(raw)) => raw.split_whitespace().map(String::from).collect(),
        Some(OneOrMany::Many(list)) => list,
    };

    let interpreter = field::<String>(label, "exec_interpreter", entry.exec_interpreter)?;
    let executable = match interpreter.as_deref().map(str::trim) {
        None | Some("") | Some("none") => script,
        Some(interpreter) => {
            arguments.insert(0, script);
            interpreter.to_string()
        }
    };

    let mode = match field::<String>(label, "exec_mode", entry.exec_mode)?.as_deref().map(str::trim) {
        None | Some("fork_mode") | Some("fork") => ExecMode::Fork,
        Some("cluster_mode") | Some("cluster") => {
            return Err(ConfigError::invalid(label, "exec_mode", "cluster mode is reserved and not supported"));
        }
        Some(other) => {
            return Err(ConfigError::invalid(label, "exec_mode", format!("unknown mode `{other}`")));
        }
    };

    let instance_count = match field::<i64>(label, "instances", entry.instances)? {
        None => 1,
        Some(n) if (1..=MAX_INSTANCES as i64).contains(&n) => n as usize,
        Some(n) => {
            return Err(ConfigError::invalid(
                label,
                "instances",
                format!("must be between 1 and {MAX_INSTANCES}, got {n}"),
            ))
        }
    };

    let restart_delay = millis(label, "restart_delay", field(label, "restart_delay", entry.restart_delay)?)?
        .unwrap_or(Duration::ZERO);
    let kill_timeout = millis(label, "kill_timeout", field(label, "kill_timeout", entry.kill_timeout)?)?
        .unwrap_or(DEFAULT_KILL_TIMEOUT);

    let stop_signal = match field::<String>(label, "stop_signal", entry.stop_signal)? {
        None => Signal::SIGTERM,
        Some(raw) => parse_signal(&raw)
            .ok_or_else(|| ConfigError::invalid(label, "stop_signal", format!("unknown signal `{raw}`")))?,
    };

    let mut env = BTreeMap::new();
    for (key, value) in field::<BTreeMap<String, Value>>(label, "env", entry.env)?.unwrap_or_default() {
        let value = match value {
            Value::String(s) => s,
            Value::Number(n) => n.to_string(),
            Value::Bool(b) => b.to_string(),
            _ => return Err(ConfigError::invalid(label, "env", format!("value of `{key}` must be a scalar"))),
        };
        env.insert(key, value);
    }

    Ok(ProcessSpec {
        executable,
        arguments,
        mode,
        instance_count,
        restart_delay,
        cwd: non_empty_path(field(label, "cwd", entry.cwd)?),
        env,
        out_file: non_empty_path(field(label, "out_file", entry.out_file)?),
        error_file: non_empty_path(field(label, "error_file", entry.error_file)?),
        kill_timeout,
        stop_signal,
        name,
    })
}

/// Decodes one optional field; `null` counts as absent.
fn field<T: DeserializeOwned>(label: &str, name: &'static str, raw: Option<Value>) -> Result<Option<T>, ConfigError> {
    raw.filter(|v| !v.is_null())
        .map(|v| serde_yaml::from_value(v).map_err(|e| ConfigError::invalid(label, name, e.to_string())))
        .transpose()
}

fn millis(label: &str, field: &'static str, raw: Option<i64>) -> Result<Option<Duration>, ConfigError> {
    match raw {
        None => Ok(None),
        Some(ms) if ms >= 0 => Ok(Some(Duration::from_millis(ms as u64))),
        Some(ms) => Err(ConfigError::invalid(label, field, format!("must be >= 0 milliseconds, got {ms}"))),
    }
}

fn non_empty_path(raw: Option<String>) -> Option<PathBuf> {
    raw.filter(|s| !s.trim().is_empty()).map(PathBuf::from)
}

/// Accepts `TERM`, `SIGTERM` and `sigterm` alike.
pub fn parse_signal(raw: &str) -> Option<Signal> {
    let upper = raw.trim().to_uppercase();
    let name = if upper.starts_with("SIG") { upper } else { format!("SIG{upper}") };
    name.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAIR_RESERVE: &str = r#"
apps:
  - name: bloxroute_pair_reserve_cloud
    script: bloxroute_pair_reserve
    args: "-cert external_gateway_cert.pem -key external_gateway_key.pem"
    exec_interpreter: none
    exec_mode: fork_mode
    instances: 1
    restart_delay: 1000
  - name: fullnode_pair_reserve
    script: fullnode_pair_reserve
    exec_interpreter: none
    exec_mode: fork_mode
    instances: 2
    restart_delay: 1000
"#;

    fn invalid_field(text: &str) -> (String, &'static str) {
        match load_str(text) {
            Err(ConfigError::InvalidField { entry, field, .. }) => (entry, field),
            other => panic!("expected InvalidField, got {other:?}"),
        }
    }

    #[test]
    fn loads_pm2_style_apps() {
        let specs = load_str(PAIR_RESERVE).unwrap();
        assert_eq!(specs.len(), 2);

        let cloud = &specs[0];
        assert_eq!(cloud.name, "bloxroute_pair_reserve_cloud");
        assert_eq!(cloud.executable, "bloxroute_pair_reserve");
        assert_eq!(
            cloud.arguments,
            vec!["-cert", "external_gateway_cert.pem", "-key", "external_gateway_key.pem"]
        );
        assert_eq!(cloud.mode, ExecMode::Fork);
        assert_eq!(cloud.restart_delay, Duration::from_millis(1000));
        assert_eq!(cloud.kill_timeout, DEFAULT_KILL_TIMEOUT);
        assert_eq!(cloud.stop_signal, Signal::SIGTERM);

        assert!(specs[1].arguments.is_empty());
        assert_eq!(specs[1].instance_count, 2);
    }

    #[test]
    fn loads_bare_json_list_with_defaults() {
        let specs = load_str(r#"[{"name": "a", "script": "/bin/true"}]"#).unwrap();
        assert_eq!(specs[0].instance_count, 1);
        assert_eq!(specs[0].restart_delay, Duration::ZERO);
        assert!(specs[0].env.is_empty());
    }

    #[test]
    fn list_args_are_kept_verbatim() {
        let specs = load_str("- name: a\n  script: echo\n  args: [\"hello world\", x]\n").unwrap();
        assert_eq!(specs[0].arguments, vec!["hello world", "x"]);
    }

    #[test]
    fn interpreter_wraps_script() {
        let specs = load_str("- name: a\n  script: app.js\n  args: --port 80\n  exec_interpreter: node\n").unwrap();
        assert_eq!(specs[0].executable, "node");
        assert_eq!(specs[0].arguments, vec!["app.js", "--port", "80"]);
    }

    #[test]
    fn duplicate_names_fail() {
        let err = load_str("- {name: a, script: x}\n- {name: b, script: y}\n- {name: a, script: z}\n").unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateName { ref name } if name == "a"));
    }

    #[test]
    fn missing_name_is_reported_by_index() {
        assert_eq!(invalid_field("- {name: a, script: x}\n- {script: y}\n"), ("#1".to_string(), "name"));
    }

    #[test]
    fn empty_script_is_rejected() {
        assert_eq!(invalid_field("- {name: a, script: \"  \"}\n"), ("a".to_string(), "script"));
    }

    #[test]
    fn zero_instances_is_rejected() {
        assert_eq!(invalid_field("- {name: a, script: x, instances: 0}\n"), ("a".to_string(), "instances"));
    }

    #[test]
    fn instances_are_capped() {
        assert_eq!(
            invalid_field("- {name: a, script: x, instances: 1000000000000}\n"),
            ("a".to_string(), "instances")
        );
        let specs = load_str(&format!("- {{name: a, script: x, instances: {MAX_INSTANCES}}}\n")).unwrap();
        assert_eq!(specs[0].instance_count, MAX_INSTANCES);
    }

    #[test]
    fn wrongly_typed_fields_name_the_entry() {
        assert_eq!(invalid_field("- {name: a, script: x, instances: two}\n"), ("a".to_string(), "instances"));
        assert_eq!(
            invalid_field("- {name: a, script: x, restart_delay: \"1000\"}\n"),
            ("a".to_string(), "restart_delay")
        );
        assert_eq!(invalid_field("- {name: a, script: x, args: {k: v}}\n"), ("a".to_string(), "args"));
        assert_eq!(invalid_field("- {name: a, script: [x]}\n"), ("a".to_string(), "script"));
        assert_eq!(invalid_field("apps:\n  - {name: [a], script: x}\n"), ("#0".to_string(), "name"));
        assert_eq!(invalid_field("- {name: a, script: x}\n- 5\n"), ("#1".to_string(), "entry"));
    }

    #[test]
    fn null_fields_fall_back_to_defaults() {
        let specs = load_str("- {name: a, script: x, instances: ~, args: ~}\n").unwrap();
        assert_eq!(specs[0].instance_count, 1);
        assert!(specs[0].arguments.is_empty());
    }

    #[test]
    fn negative_delays_are_rejected() {
        assert_eq!(invalid_field("- {name: a, script: x, restart_delay: -5}\n").1, "restart_delay");
        assert_eq!(invalid_field("- {name: a, script: x, kill_timeout: -1}\n").1, "kill_timeout");
    }

    #[test]
    fn cluster_mode_is_reserved() {
        assert_eq!(invalid_field("- {name: a, script: x, exec_mode: cluster_mode}\n").1, "exec_mode");
        assert_eq!(invalid_field("- {name: a, script: x, exec_mode: swarm}\n").1, "exec_mode");
    }

    #[test]
    fn env_values_are_stringified() {
        let specs = load_str("- name: a\n  script: x\n  env: {PORT: 8080, DEBUG: true, MODE: prod}\n").unwrap();
        assert_eq!(specs[0].env["PORT"], "8080");
        assert_eq!(specs[0].env["DEBUG"], "true");
        assert_eq!(specs[0].env["MODE"], "prod");

        assert_eq!(invalid_field("- name: a\n  script: x\n  env: {LIST: [1, 2]}\n").1, "env");
    }

    #[test]
    fn stop_signal_accepts_short_names() {
        assert_eq!(parse_signal("TERM"), Some(Signal::SIGTERM));
        assert_eq!(parse_signal("sigint"), Some(Signal::SIGINT));
        assert_eq!(parse_signal("NOPE"), None);
        assert_eq!(invalid_field("- {name: a, script: x, stop_signal: NOPE}\n").1, "stop_signal");
    }

    #[test]
    fn malformed_document_is_a_parse_error() {
        assert!(matches!(load_str("apps: 3"), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn bundled_config_loads() {
        let specs = load_file(concat!(env!("CARGO_MANIFEST_DIR"), "/config/pair_reserve.yml")).unwrap();
        assert_eq!(specs.len(), 5);
        assert!(specs.iter().all(|s| s.restart_delay == Duration::from_millis(1000) && s.instance_count == 1));
        assert_eq!(specs[1].arguments.len(), 6);
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let err = load_file("/nonexistent/forkvisor.yml").unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
