//! Worker settings stored in `gauntlet-worker.toml`.
//!
//! The file is checked against a declarative schema: every entry names its section, key,
//! default value, check and an optional migrator that upgrades legacy spellings. Validation
//! never fails. Bad values fall back to their default, and every correction is reported as a
//! notice for the operator.

use std::{fs, path::Path};

use anyhow::{bail, Context};
use toml::{Table, Value};

use super::{
    expression::{self, max_to_upper},
    system::Compiler,
};

pub const CONFIG_FILE: &str = "gauntlet-worker.toml";

pub const DEFAULT_CONCURRENCY: &str = "max(1,min(3,MAX-1))";
pub const DEFAULT_MAX_MEMORY: &str = "MAX/2";

/// What the machine offers, as seen by the config checks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostFacts {
    pub max_cpus: u32,
    pub max_memory_mib: u64,
    pub compilers: Vec<Compiler>,
}

impl HostFacts {
    fn default_compiler(&self) -> String {
        self.compilers
            .iter()
            .find(|c| c.name == "g++")
            .or_else(|| self.compilers.first())
            .map(|c| c.name.clone())
            .unwrap_or_else(|| "g++".to_string())
    }
}

#[derive(Debug, Clone)]
enum Check {
    Text,
    Choice(Vec<String>),
    Integer,
    Bool,
    Concurrency { max_cpus: u32 },
    Memory { max_mib: u64 },
}

type Migrator = fn(&str) -> String;

#[derive(Clone)]
pub struct SchemaEntry {
    section: &'static str,
    key: &'static str,
    default: Value,
    check: Check,
    migrator: Option<Migrator>,
}

pub fn schema(facts: &HostFacts) -> Vec<SchemaEntry> {
    let entry = |section: &'static str, key: &'static str, default: Value, check: Check| SchemaEntry {
        section,
        key,
        default,
        check,
        migrator: None,
    };
    vec![
        entry("login", "username", Value::from(""), Check::Text),
        entry("login", "password", Value::from(""), Check::Text),
        entry(
            "parameters",
            "protocol",
            Value::from("http"),
            Check::Choice(vec!["http".into(), "https".into()]),
        ),
        entry("parameters", "host", Value::from("localhost"), Check::Text),
        entry("parameters", "port", Value::Integer(6543), Check::Integer),
        SchemaEntry {
            migrator: Some(max_to_upper as Migrator),
            ..entry(
                "parameters",
                "concurrency",
                Value::from(DEFAULT_CONCURRENCY),
                Check::Concurrency {
                    max_cpus: facts.max_cpus,
                },
            )
        },
        SchemaEntry {
            migrator: Some(max_to_upper as Migrator),
            ..entry(
                "parameters",
                "max_memory",
                Value::from(DEFAULT_MAX_MEMORY),
                Check::Memory {
                    max_mib: facts.max_memory_mib,
                },
            )
        },
        entry("parameters", "min_threads", Value::Integer(1), Check::Integer),
        entry("parameters", "fleet", Value::from(false), Check::Bool),
        entry(
            "parameters",
            "compiler",
            Value::from(facts.default_compiler()),
            Check::Choice(facts.compilers.iter().map(|c| c.name.clone()).collect()),
        ),
    ]
}

/// Resolves a concurrency expression to a core count.
///
/// At most `MAX - 1` cores unless the expression names `MAX` explicitly.
pub fn resolve_concurrency(expr: &str, max_cpus: u32) -> anyhow::Result<u32> {
    let value = expression::evaluate(expr, f64::from(max_cpus))?.round();
    if value < 1.0 {
        bail!("concurrency must be at least 1");
    }
    let max = f64::from(max_cpus);
    if value > max || (!expr.contains("MAX") && value >= max) {
        bail!(
            "You cannot have concurrency {value} but at most {max_cpus} with 'MAX' or {} otherwise",
            max_cpus.saturating_sub(1)
        );
    }
    Ok(value as u32)
}

/// Resolves a memory expression to MiB, clamped to what the machine has.
pub fn resolve_memory(expr: &str, max_mib: u64) -> anyhow::Result<u64> {
    let max = max_mib as f64;
    let value = expression::evaluate(expr, max)?;
    Ok(value.clamp(0.0, max).round() as u64)
}

fn value_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Integer(i) => Some(i.to_string()),
        Value::Float(f) => Some(f.to_string()),
        _ => None,
    }
}

fn parse_bool(text: &str) -> Option<bool> {
    match text.trim().to_lowercase().as_str() {
        "true" | "1" => Some(true),
        "false" | "0" => Some(false),
        _ => None,
    }
}

impl Check {
    /// The normalized value, or why it is unacceptable.
    fn apply(&self, value: &Value) -> Result<Value, String> {
        match self {
            Check::Text => match value {
                Value::String(_) => Ok(value.clone()),
                _ => Err("not a string".to_string()),
            },
            Check::Choice(choices) => match value {
                Value::String(s) if choices.contains(s) => Ok(value.clone()),
                _ => Err(format!("not in {choices:?}")),
            },
            Check::Integer => match value {
                Value::Integer(_) => Ok(value.clone()),
                Value::String(s) => s
                    .trim()
                    .parse::<i64>()
                    .map(Value::from)
                    .map_err(|_| "not an integer".to_string()),
                _ => Err("not an integer".to_string()),
            },
            Check::Bool => match value {
                Value::Boolean(_) => Ok(value.clone()),
                Value::String(s) => parse_bool(s)
                    .map(Value::from)
                    .ok_or_else(|| "not a boolean".to_string()),
                _ => Err("not a boolean".to_string()),
            },
            Check::Concurrency { max_cpus } => {
                let text = value_text(value).ok_or_else(|| "not an expression".to_string())?;
                resolve_concurrency(&text, *max_cpus).map_err(|e| format!("{e:#}"))?;
                Ok(Value::from(text))
            }
            Check::Memory { max_mib } => {
                let text = value_text(value).ok_or_else(|| "not an expression".to_string())?;
                resolve_memory(&text, *max_mib).map_err(|e| format!("{e:#}"))?;
                Ok(Value::from(text))
            }
        }
    }
}

/// Checks `table` against `schema`. Returns the corrected table and what was changed.
pub fn validate(table: &Table, schema: &[SchemaEntry]) -> (Table, Vec<String>) {
    let mut notices = Vec::new();
    let mut out = Table::new();

    for entry in schema {
        let current = match table.get(entry.section) {
            Some(Value::Table(section)) => section.get(entry.key).cloned(),
            _ => None,
        };
        let value = match current {
            None => entry.default.clone(),
            Some(mut value) => {
                if let (Some(migrate), Some(old)) = (entry.migrator, value.as_str()) {
                    let new = migrate(old);
                    if new != old {
                        notices.push(format!(
                            "Replacing the value '{old}' of config option '{}' by '{new}'",
                            entry.key
                        ));
                        value = Value::from(new);
                    }
                }
                match entry.check.apply(&value) {
                    Ok(normalized) => normalized,
                    Err(reason) => {
                        notices.push(format!(
                            "The value '{value}' of config option '{}' is invalid ({reason}). Replacing it by the default value '{}'",
                            entry.key, entry.default
                        ));
                        entry.default.clone()
                    }
                }
            }
        };
        if let Value::Table(section) = out
            .entry(entry.section)
            .or_insert_with(|| Value::Table(Table::new()))
        {
            section.insert(entry.key.to_string(), value);
        }
    }

    for (name, section) in table {
        if !schema.iter().any(|e| e.section == name) {
            notices.push(format!("Removing unknown config section '{name}'"));
            continue;
        }
        let Value::Table(section) = section else {
            notices.push(format!("Replacing malformed config section '{name}'"));
            continue;
        };
        for key in section.keys() {
            if !schema.iter().any(|e| e.section == name && e.key == key) {
                notices.push(format!("Removing unknown config option '{key}'"));
            }
        }
    }

    (out, notices)
}

/// Command line values that replace the file's.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub username: Option<String>,
    pub password: Option<String>,
    pub protocol: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub concurrency: Option<String>,
    pub max_memory: Option<String>,
    pub min_threads: Option<u32>,
    pub fleet: Option<bool>,
    pub compiler: Option<String>,
}

impl ConfigOverrides {
    pub fn apply(&self, table: &mut Table) {
        let mut set = |section: &str, key: &str, value: Option<Value>| {
            if let Some(value) = value {
                if let Value::Table(section) = table
                    .entry(section)
                    .or_insert_with(|| Value::Table(Table::new()))
                {
                    section.insert(key.to_string(), value);
                }
            }
        };
        set("login", "username", self.username.clone().map(Value::from));
        set("login", "password", self.password.clone().map(Value::from));
        set("parameters", "protocol", self.protocol.clone().map(Value::from));
        set("parameters", "host", self.host.clone().map(Value::from));
        set("parameters", "port", self.port.map(|p| Value::from(i64::from(p))));
        set("parameters", "concurrency", self.concurrency.clone().map(Value::from));
        set("parameters", "max_memory", self.max_memory.clone().map(Value::from));
        set("parameters", "min_threads", self.min_threads.map(|t| Value::from(i64::from(t))));
        set("parameters", "fleet", self.fleet.map(Value::from));
        set("parameters", "compiler", self.compiler.clone().map(Value::from));
    }
}

/// Fully resolved worker settings.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerConfig {
    pub username: String,
    pub password: String,
    pub protocol: String,
    pub host: String,
    pub port: u16,
    /// As written by the operator.
    pub concurrency_expr: String,
    pub concurrency: u32,
    pub max_memory_expr: String,
    /// MiB.
    pub max_memory: u64,
    pub min_threads: u32,
    pub fleet: bool,
    pub compiler: Compiler,
}

fn lookup<'a>(table: &'a Table, section: &str, key: &str) -> anyhow::Result<&'a Value> {
    table
        .get(section)
        .and_then(Value::as_table)
        .and_then(|s| s.get(key))
        .with_context(|| format!("missing config option '{section}.{key}'"))
}

fn text(table: &Table, section: &str, key: &str) -> anyhow::Result<String> {
    let value = lookup(table, section, key)?;
    value_text(value).with_context(|| format!("config option '{key}' must be a string"))
}

fn integer(table: &Table, section: &str, key: &str) -> anyhow::Result<i64> {
    match lookup(table, section, key)? {
        Value::Integer(i) => Ok(*i),
        Value::String(s) => s
            .trim()
            .parse()
            .with_context(|| format!("config option '{key}' must be an integer")),
        _ => bail!("config option '{key}' must be an integer"),
    }
}

impl WorkerConfig {
    /// Strict resolution: unlike [`validate`], a bad value is an error. Returns the port
    /// rewrite notice, if any.
    pub fn resolve(table: &Table, facts: &HostFacts) -> anyhow::Result<(WorkerConfig, Vec<String>)> {
        let mut notices = Vec::new();

        let protocol = text(table, "parameters", "protocol")?;
        if protocol != "http" && protocol != "https" {
            bail!("protocol must be http or https, not '{protocol}'");
        }
        let port = integer(table, "parameters", "port")?;
        let mut port = u16::try_from(port).with_context(|| format!("invalid port {port}"))?;
        if protocol == "http" && port == 443 {
            notices.push("Changing port to 80".to_string());
            port = 80;
        } else if protocol == "https" && port == 80 {
            notices.push("Changing port to 443".to_string());
            port = 443;
        }

        let concurrency_expr = max_to_upper(&text(table, "parameters", "concurrency")?);
        let concurrency = resolve_concurrency(&concurrency_expr, facts.max_cpus)
            .context("invalid concurrency")?;
        let max_memory_expr = max_to_upper(&text(table, "parameters", "max_memory")?);
        let max_memory =
            resolve_memory(&max_memory_expr, facts.max_memory_mib).context("invalid max_memory")?;

        let min_threads = integer(table, "parameters", "min_threads")?;
        let min_threads = u32::try_from(min_threads)
            .ok()
            .filter(|t| *t >= 1)
            .with_context(|| format!("min_threads must be at least 1, not {min_threads}"))?;

        let fleet = match lookup(table, "parameters", "fleet")? {
            Value::Boolean(b) => *b,
            Value::String(s) => parse_bool(s).context("fleet must be a boolean")?,
            _ => bail!("fleet must be a boolean"),
        };

        let compiler_name = text(table, "parameters", "compiler")?;
        let compiler = facts
            .compilers
            .iter()
            .find(|c| c.name == compiler_name)
            .cloned()
            .with_context(|| format!("compiler '{compiler_name}' is not available"))?;

        let config = WorkerConfig {
            username: text(table, "login", "username")?,
            password: text(table, "login", "password")?,
            protocol,
            host: text(table, "parameters", "host")?,
            port,
            concurrency_expr,
            concurrency,
            max_memory_expr,
            max_memory,
            min_threads,
            fleet,
            compiler,
        };
        Ok((config, notices))
    }

    pub fn to_table(&self) -> Table {
        let mut login = Table::new();
        login.insert("username".into(), Value::from(self.username.clone()));
        login.insert("password".into(), Value::from(self.password.clone()));

        let mut parameters = Table::new();
        parameters.insert("protocol".into(), Value::from(self.protocol.clone()));
        parameters.insert("host".into(), Value::from(self.host.clone()));
        parameters.insert("port".into(), Value::from(i64::from(self.port)));
        parameters.insert("concurrency".into(), Value::from(self.concurrency_expr.clone()));
        parameters.insert("max_memory".into(), Value::from(self.max_memory_expr.clone()));
        parameters.insert("min_threads".into(), Value::from(i64::from(self.min_threads)));
        parameters.insert("fleet".into(), Value::from(self.fleet));
        parameters.insert("compiler".into(), Value::from(self.compiler.name.clone()));

        let mut table = Table::new();
        table.insert("login".into(), Value::Table(login));
        table.insert("parameters".into(), Value::Table(parameters));
        table
    }

    pub fn remote(&self) -> String {
        format!("{}://{}:{}", self.protocol, self.host, self.port)
    }

    pub fn save(&self, worker_dir: &Path) -> anyhow::Result<()> {
        let path = worker_dir.join(CONFIG_FILE);
        let text = toml::to_string_pretty(&self.to_table())?;
        fs::write(&path, text).with_context(|| format!("could not write {}", path.display()))
    }
}

/// Reads the config file. A missing or unreadable file yields an empty table and a notice.
pub fn read_table(worker_dir: &Path) -> (Table, Vec<String>) {
    let path = worker_dir.join(CONFIG_FILE);
    if !path.exists() {
        return (Table::new(), vec![format!("Initializing {}", path.display())]);
    }
    match fs::read_to_string(&path)
        .map_err(anyhow::Error::from)
        .and_then(|text| text.parse::<Table>().map_err(anyhow::Error::from))
    {
        Ok(table) => (table, Vec::new()),
        Err(e) => (
            Table::new(),
            vec![format!("Could not read {}: {e:#}. Initializing it", path.display())],
        ),
    }
}

#[cfg(test)]
mod config_tests {
    use super::*;

    fn facts() -> HostFacts {
        HostFacts {
            max_cpus: 8,
            max_memory_mib: 16384,
            compilers: vec![
                Compiler {
                    name: "clang++".into(),
                    version: (16, 0, 0),
                },
                Compiler {
                    name: "g++".into(),
                    version: (12, 2, 0),
                },
            ],
        }
    }

    fn parse(text: &str) -> Table {
        text.parse().unwrap()
    }

    #[test]
    fn test_empty_file_gets_defaults() {
        let facts = facts();
        let (table, notices) = validate(&Table::new(), &schema(&facts));
        assert!(notices.is_empty());
        let (config, _) = WorkerConfig::resolve(&table, &facts).unwrap();
        assert_eq!(config.concurrency, 3);
        assert_eq!(config.max_memory, 8192);
        assert_eq!(config.compiler.name, "g++");
        assert_eq!(config.min_threads, 1);
        assert!(!config.fleet);
        assert_eq!(config.remote(), "http://localhost:6543");
    }

    #[test]
    fn test_invalid_values_fall_back_to_defaults() {
        let facts = facts();
        let table = parse(
            r#"
            [login]
            username = "alice"
            [parameters]
            protocol = "ftp"
            port = "8080"
            concurrency = "8"
            fleet = "yes"
            compiler = "icc"
            "#,
        );
        let (table, notices) = validate(&table, &schema(&facts));
        assert_eq!(notices.len(), 4, "{notices:?}");
        let (config, _) = WorkerConfig::resolve(&table, &facts).unwrap();
        assert_eq!(config.username, "alice");
        assert_eq!(config.protocol, "http");
        assert_eq!(config.port, 8080);
        assert_eq!(config.concurrency_expr, DEFAULT_CONCURRENCY);
        assert!(!config.fleet);
        assert_eq!(config.compiler.name, "g++");
    }

    #[test]
    fn test_legacy_max_is_migrated() {
        let facts = facts();
        let table = parse("[parameters]\nconcurrency = \"max - 2\"\nmax_memory = \"max/4\"\n");
        let (table, notices) = validate(&table, &schema(&facts));
        assert_eq!(notices.len(), 2);
        assert!(notices[0].contains("by 'MAX - 2'"));
        let (config, _) = WorkerConfig::resolve(&table, &facts).unwrap();
        assert_eq!(config.concurrency, 6);
        assert_eq!(config.max_memory, 4096);
    }

    #[test]
    fn test_unknown_entries_are_removed() {
        let facts = facts();
        let table = parse("[login]\ntoken = \"x\"\n[private]\nhw_seed = 3\n");
        let (table, notices) = validate(&table, &schema(&facts));
        assert!(notices.contains(&"Removing unknown config option 'token'".to_string()));
        assert!(notices.contains(&"Removing unknown config section 'private'".to_string()));
        assert!(table.get("private").is_none());
        assert!(table["login"].as_table().unwrap().get("token").is_none());
    }

    #[test]
    fn test_concurrency_limits() {
        assert_eq!(resolve_concurrency("7", 8).unwrap(), 7);
        assert!(resolve_concurrency("8", 8).is_err());
        assert_eq!(resolve_concurrency("MAX", 8).unwrap(), 8);
        assert!(resolve_concurrency("MAX+1", 8).is_err());
        assert!(resolve_concurrency("0", 8).is_err());
        assert_eq!(resolve_memory("MAX*2", 1000).unwrap(), 1000);
        assert_eq!(resolve_memory("-5", 1000).unwrap(), 0);
    }

    #[test]
    fn test_port_rewrite_and_overrides() {
        let facts = facts();
        let (mut table, _) = validate(&Table::new(), &schema(&facts));
        ConfigOverrides {
            protocol: Some("https".into()),
            port: Some(80),
            fleet: Some(true),
            concurrency: Some("MAX".into()),
            ..Default::default()
        }
        .apply(&mut table);
        let (config, notices) = WorkerConfig::resolve(&table, &facts).unwrap();
        assert_eq!(config.port, 443);
        assert_eq!(notices, vec!["Changing port to 443".to_string()]);
        assert!(config.fleet);
        assert_eq!(config.concurrency, 8);

        ConfigOverrides {
            concurrency: Some("12".into()),
            ..Default::default()
        }
        .apply(&mut table);
        assert!(WorkerConfig::resolve(&table, &facts).is_err());
    }

    #[test]
    fn test_save_and_reload() {
        let facts = facts();
        let dir = tempfile::tempdir().unwrap();
        let (table, _) = read_table(dir.path());
        let (table, _) = validate(&table, &schema(&facts));
        let (config, _) = WorkerConfig::resolve(&table, &facts).unwrap();
        config.save(dir.path()).unwrap();

        let (table, notices) = read_table(dir.path());
        assert!(notices.is_empty());
        let (table, notices) = validate(&table, &schema(&facts));
        assert!(notices.is_empty());
        assert_eq!(WorkerConfig::resolve(&table, &facts).unwrap().0, config);
    }
}
