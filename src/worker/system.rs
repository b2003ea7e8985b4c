//! Facts about the host: memory, cores, compilers, identity.

use std::{
    fs,
    path::Path,
    process::{Command, Stdio},
};

use anyhow::Context;
use tracing::{debug, info, warn};

use super::config::HostFacts;

pub const UNIQUE_KEY_FILE: &str = "uuid.txt";

/// Oldest usable g++ (major, minor).
const MIN_GCC: (u32, u32) = (7, 3);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Compiler {
    pub name: String,
    pub version: (u32, u32, u32),
}

/// Total physical memory in MiB.
pub fn total_memory_mib() -> u64 {
    let mut sys = sysinfo::System::new();
    sys.refresh_memory();
    sys.total_memory() / 1024 / 1024
}

pub fn cpu_count() -> u32 {
    num_cpus::get() as u32
}

pub fn uname() -> String {
    let name = sysinfo::System::name().unwrap_or_else(|| std::env::consts::OS.to_string());
    match sysinfo::System::kernel_version() {
        Some(kernel) => format!("{name} {kernel}"),
        None => name,
    }
}

pub fn architecture() -> String {
    std::env::consts::ARCH.to_string()
}

/// Probes the machine. Fails when a probe cannot give a usable answer.
pub fn probe_host() -> anyhow::Result<HostFacts> {
    let max_memory_mib = total_memory_mib();
    if max_memory_mib == 0 {
        anyhow::bail!("Unable to determine the amount of memory");
    }
    let max_cpus = cpu_count();
    let compilers = detect_compilers();
    if compilers.is_empty() {
        anyhow::bail!("No usable compilers found");
    }
    Ok(HostFacts {
        max_cpus,
        max_memory_mib,
        compilers,
    })
}

pub fn detect_compilers() -> Vec<Compiler> {
    let mut found = Vec::new();
    let probes: [(&str, fn(&str) -> Option<(u32, u32, u32)>); 2] =
        [("g++", parse_gcc_macros), ("clang++", parse_clang_macros)];
    for (name, parse) in probes {
        match macro_dump(name) {
            Ok(dump) => match parse(&dump) {
                Some(version) => {
                    info!(compiler = name, ?version, "Compiler found");
                    found.push(Compiler {
                        name: name.to_string(),
                        version,
                    });
                }
                None => warn!(compiler = name, "Compiler unusable"),
            },
            Err(e) => debug!(compiler = name, "Compiler not available: {e:#}"),
        }
    }
    found
}

fn macro_dump(program: &str) -> anyhow::Result<String> {
    let output = Command::new(program)
        .args(["-E", "-dM", "-"])
        .stdin(Stdio::null())
        .stderr(Stdio::null())
        .output()
        .with_context(|| format!("could not launch '{program}'"))?;
    if !output.status.success() {
        anyhow::bail!("'{program}' version query failed with {}", output.status);
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

fn macro_value(dump: &str, name: &str) -> Option<u32> {
    dump.lines().find_map(|line| {
        let mut parts = line.split_whitespace();
        match (parts.next(), parts.next(), parts.next()) {
            (Some("#define"), Some(n), Some(value)) if n == name => value.parse().ok(),
            _ => None,
        }
    })
}

/// Version of a real g++. `None` for clang posing as g++ or anything older than 7.3.
pub(crate) fn parse_gcc_macros(dump: &str) -> Option<(u32, u32, u32)> {
    if macro_value(dump, "__clang_major__").is_some() {
        return None;
    }
    let version = (
        macro_value(dump, "__GNUC__")?,
        macro_value(dump, "__GNUC_MINOR__")?,
        macro_value(dump, "__GNUC_PATCHLEVEL__")?,
    );
    ((version.0, version.1) >= MIN_GCC).then_some(version)
}

pub(crate) fn parse_clang_macros(dump: &str) -> Option<(u32, u32, u32)> {
    Some((
        macro_value(dump, "__clang_major__")?,
        macro_value(dump, "__clang_minor__")?,
        macro_value(dump, "__clang_patchlevel__")?,
    ))
}

/// The key identifying this worker directory, created on first use.
pub fn load_or_create_unique_key(worker_dir: &Path) -> anyhow::Result<String> {
    let path = worker_dir.join(UNIQUE_KEY_FILE);
    if let Ok(content) = fs::read_to_string(&path) {
        let key = content.trim();
        if uuid::Uuid::parse_str(key).is_ok() {
            return Ok(key.to_string());
        }
        warn!(path = %path.display(), "Ignoring malformed unique key");
    }
    let key = uuid::Uuid::new_v4().to_string();
    fs::write(&path, &key).with_context(|| format!("could not write {}", path.display()))?;
    info!(unique_key = %key, "New unique key");
    Ok(key)
}
