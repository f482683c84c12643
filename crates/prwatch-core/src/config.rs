use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;

const DEFAULT_API_URL: &str = "https://api.github.com";

/// Runtime configuration, read from the process environment with `.env` in
/// the working directory as a fallback.
#[derive(Debug, Clone)]
pub struct Config {
    pub github_token: String,
    pub github_api_url: String,
    pub pushover_token: String,
    pub pushover_user: String,
    pub data_dir: PathBuf,
    pub poll_interval_s: u64,

    // Remediation agent
    pub agent_enabled: bool,
    pub agent_bin: String,
    pub agent_timeout_s: u64,
    /// Local checkout the agent works in and the fix-commit check inspects.
    pub agent_workdir: PathBuf,

    /// Seconds between SIGTERM and SIGKILL when stopping a poller.
    pub stop_grace_s: u64,
}

fn parse_dotenv() -> HashMap<String, String> {
    let Ok(contents) = std::fs::read_to_string(".env") else {
        return HashMap::new();
    };
    parse_dotenv_str(&contents)
}

fn parse_dotenv_str(contents: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line = line.strip_prefix("export ").unwrap_or(line);
        if let Some((k, v)) = line.split_once('=') {
            let v = v.trim().trim_matches('"').trim_matches('\'');
            map.insert(k.trim().to_string(), v.to_string());
        }
    }
    map
}

fn get(key: &str, vars: &HashMap<String, String>) -> Option<String> {
    vars.get(key).cloned().filter(|v| !v.is_empty())
}

fn get_str(key: &str, vars: &HashMap<String, String>, default: &str) -> String {
    get(key, vars).unwrap_or_else(|| default.to_string())
}

fn get_bool(key: &str, vars: &HashMap<String, String>, default: bool) -> bool {
    match get(key, vars).as_deref() {
        Some("true") | Some("1") | Some("yes") => true,
        Some("false") | Some("0") | Some("no") => false,
        _ => default,
    }
}

fn get_u64(key: &str, vars: &HashMap<String, String>, default: u64) -> u64 {
    get(key, vars)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn resolve_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(rest);
        }
    }
    PathBuf::from(path)
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let mut vars = parse_dotenv();
        vars.extend(std::env::vars());
        Self::from_vars(&vars)
    }

    /// Build from an explicit variable map. Process env wins over `.env`
    /// because `from_env` inserts it last.
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self> {
        let github_token = get("GITHUB_TOKEN", vars)
            .or_else(|| get("GH_TOKEN", vars))
            .unwrap_or_default();

        let agent_workdir = match get("AGENT_WORKDIR", vars) {
            Some(p) => resolve_tilde(&p),
            None => std::env::current_dir()?,
        };

        let poll_interval_s = get_u64("POLL_INTERVAL_S", vars, 60);
        if poll_interval_s == 0 {
            anyhow::bail!("POLL_INTERVAL_S must be at least 1");
        }

        Ok(Self {
            github_token,
            github_api_url: get_str("GITHUB_API_URL", vars, DEFAULT_API_URL),
            pushover_token: get_str("PUSHOVER_TOKEN", vars, ""),
            pushover_user: get_str("PUSHOVER_USER", vars, ""),
            data_dir: resolve_tilde(&get_str("DATA_DIR", vars, "~/.prwatch")),
            poll_interval_s,
            agent_enabled: get_bool("AGENT_ENABLED", vars, true),
            agent_bin: get_str("AGENT_BIN", vars, "claude"),
            agent_timeout_s: get_u64("AGENT_TIMEOUT_S", vars, 1800),
            agent_workdir,
            stop_grace_s: get_u64("STOP_GRACE_S", vars, 5),
        })
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_s)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_s)
    }

    pub fn agent_timeout(&self) -> Duration {
        Duration::from_secs(self.agent_timeout_s)
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("prwatch.db")
    }

    pub fn state_dir(&self) -> PathBuf {
        self.data_dir.join("state")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn defaults_apply_when_unset() {
        let c = Config::from_vars(&vars(&[("DATA_DIR", "/tmp/pw")])).unwrap();
        assert_eq!(c.github_api_url, "https://api.github.com");
        assert_eq!(c.poll_interval_s, 60);
        assert!(c.agent_enabled);
        assert_eq!(c.agent_bin, "claude");
        assert_eq!(c.agent_timeout_s, 1800);
        assert_eq!(c.stop_grace_s, 5);
        assert_eq!(c.state_dir(), PathBuf::from("/tmp/pw/state"));
        assert_eq!(c.db_path(), PathBuf::from("/tmp/pw/prwatch.db"));
    }

    #[test]
    fn gh_token_is_a_fallback() {
        let c = Config::from_vars(&vars(&[("GH_TOKEN", "b")])).unwrap();
        assert_eq!(c.github_token, "b");
        let c = Config::from_vars(&vars(&[("GITHUB_TOKEN", "a"), ("GH_TOKEN", "b")])).unwrap();
        assert_eq!(c.github_token, "a");
    }

    #[test]
    fn parses_overrides() {
        let c = Config::from_vars(&vars(&[
            ("AGENT_ENABLED", "false"),
            ("POLL_INTERVAL_S", "15"),
            ("AGENT_WORKDIR", "/src/widgets"),
        ]))
        .unwrap();
        assert!(!c.agent_enabled);
        assert_eq!(c.poll_interval(), Duration::from_secs(15));
        assert_eq!(c.agent_workdir, PathBuf::from("/src/widgets"));
    }

    #[test]
    fn zero_interval_is_rejected() {
        assert!(Config::from_vars(&vars(&[("POLL_INTERVAL_S", "0")])).is_err());
    }

    #[test]
    fn dotenv_lines_are_parsed() {
        let m = parse_dotenv_str("# comment\nexport PUSHOVER_USER=\"u1\"\n\nPUSHOVER_TOKEN = t1\n");
        assert_eq!(m.get("PUSHOVER_USER").map(String::as_str), Some("u1"));
        assert_eq!(m.get("PUSHOVER_TOKEN").map(String::as_str), Some("t1"));
    }
}
