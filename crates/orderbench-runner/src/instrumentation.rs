//! Instrumentation kinds that can wrap benchmark commands on a worker.
//!
//! Each kind contributes environment variables, an optional setup command,
//! an optional wrapper appended to `INSTRUMENT`, and an optional remote
//! path whose contents are pulled back after the trials.

use std::collections::BTreeMap;

/// Remote file, relative to the login directory, that the merged environment
/// is uploaded to and sourced from.
pub const ENV_FILE: &str = "instr_env.txt";

const PERF_COUNTERS: &str = "task-clock, duration_time, cycles, inst_retired.any, bus-cycles, cache-misses, \
cache-references, branch-misses, mem-loads, mem-stores, LLC-load-misses, LLC-store-misses, \
L1-dcache-load-misses, L1-icache-load-misses, dTLB-load-misses, dTLB-store-misses, page-faults, \
alignment-faults, context-switches, cpu-migrations, major-faults, minor-faults, branch-load-misses, \
iTLB-load-misses, node-store-misses, node-load-misses";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstrumentationProfile {
    pub name: &'static str,
    pub env_vars: BTreeMap<String, String>,
    pub init_command: Option<String>,
    pub wrapper_command: Option<String>,
    pub results_path: Option<String>,
}

pub const KNOWN: &[&str] = &["perf", "pin_to_core"];

pub fn lookup(name: &str) -> Option<InstrumentationProfile> {
    match name {
        "perf" => Some(InstrumentationProfile {
            name: "perf",
            env_vars: BTreeMap::from([(
                "PERF_COUNTERS_STR".to_string(),
                PERF_COUNTERS.to_string(),
            )]),
            init_command: Some("cd instrumentation/perf && bash perf_setup.sh".to_string()),
            wrapper_command: Some(
                "/bin/bash $HOME/instrumentation/perf/perf_wrapper.sh".to_string(),
            ),
            results_path: Some("~/perf_results".to_string()),
        }),
        "pin_to_core" => Some(InstrumentationProfile {
            name: "pin_to_core",
            env_vars: BTreeMap::from([("NUM_CORES".to_string(), "1".to_string())]),
            init_command: None,
            wrapper_command: Some(
                "/bin/bash $HOME/instrumentation/pin_to_core/core_wrapper.sh".to_string(),
            ),
            results_path: None,
        }),
        _ => None,
    }
}

/// Resolves configured names; unknown names are rejected by config validation.
pub fn resolve(names: &[String]) -> Vec<InstrumentationProfile> {
    names.iter().filter_map(|n| lookup(n)).collect()
}

/// Merges the env vars of every profile, chaining wrappers into `INSTRUMENT`
/// in configuration order.
pub fn merged_env(profiles: &[InstrumentationProfile]) -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();
    for profile in profiles {
        for (k, v) in &profile.env_vars {
            env.insert(k.clone(), v.clone());
        }
        if let Some(wrapper) = &profile.wrapper_command {
            let chained = env.entry("INSTRUMENT".to_string()).or_default();
            if !chained.is_empty() {
                chained.push(' ');
            }
            chained.push_str(wrapper);
        }
    }
    env
}

pub fn render_env_file(env: &BTreeMap<String, String>) -> String {
    env.iter()
        .map(|(k, v)| format!("export {}=\"{}\"\n", k, v.replace('"', "\\\"")))
        .collect()
}

/// Prefix that loads the instrumentation environment before a benchmark runs.
pub fn command_prefix(profiles: &[InstrumentationProfile]) -> Option<String> {
    if profiles.is_empty() {
        None
    } else {
        Some(format!(". ~/{}", ENV_FILE))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_known_kind_resolves() {
        for name in KNOWN {
            assert!(lookup(name).is_some(), "{}", name);
        }
        assert!(lookup("strace").is_none());
    }

    #[test]
    fn wrappers_chain_in_order() {
        let profiles = resolve(&["pin_to_core".to_string(), "perf".to_string()]);
        let env = merged_env(&profiles);
        assert_eq!(
            env.get("INSTRUMENT").map(String::as_str),
            Some(
                "/bin/bash $HOME/instrumentation/pin_to_core/core_wrapper.sh \
                 /bin/bash $HOME/instrumentation/perf/perf_wrapper.sh"
            )
        );
        assert_eq!(env.get("NUM_CORES").map(String::as_str), Some("1"));
        assert!(env.contains_key("PERF_COUNTERS_STR"));
    }

    #[test]
    fn env_file_exports_each_var() {
        let env = BTreeMap::from([
            ("A".to_string(), "1".to_string()),
            ("B".to_string(), "say \"hi\"".to_string()),
        ]);
        assert_eq!(
            render_env_file(&env),
            "export A=\"1\"\nexport B=\"say \\\"hi\\\"\"\n"
        );
    }

    #[test]
    fn no_prefix_without_profiles() {
        assert_eq!(command_prefix(&[]), None);
        assert_eq!(
            command_prefix(&resolve(&["perf".to_string()])).as_deref(),
            Some(". ~/instr_env.txt")
        );
    }
}
