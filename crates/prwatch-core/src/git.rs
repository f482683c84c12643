use std::process::Command;

use anyhow::{anyhow, Context, Result};

pub struct ExecResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl ExecResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    pub fn combined_output(&self) -> String {
        if self.stderr.is_empty() {
            self.stdout.clone()
        } else {
            format!("{}\n{}", self.stdout, self.stderr)
        }
    }
}

/// Thin wrapper over the `git` CLI for one local checkout.
pub struct Git {
    pub repo_path: String,
}

impl Git {
    pub fn new(repo_path: impl Into<String>) -> Self {
        Self {
            repo_path: repo_path.into(),
        }
    }

    pub fn exec(&self, args: &[&str]) -> Result<ExecResult> {
        let output = Command::new("git")
            .arg("-C")
            .arg(&self.repo_path)
            .args(args)
            .output()
            .with_context(|| format!("failed to spawn git -C {} {}", self.repo_path, args.join(" ")))?;

        Ok(ExecResult {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code().unwrap_or(1),
        })
    }

    fn exec_trimmed(&self, args: &[&str]) -> Result<String> {
        let result = self.exec(args)?;
        if !result.success() {
            return Err(anyhow!(
                "git {} failed: {}",
                args.join(" "),
                result.combined_output()
            ));
        }
        Ok(result.stdout.trim().to_string())
    }

    pub fn rev_parse_head(&self) -> Result<String> {
        self.exec_trimmed(&["rev-parse", "HEAD"])
    }

    pub fn current_branch(&self) -> Result<String> {
        self.exec_trimmed(&["rev-parse", "--abbrev-ref", "HEAD"])
    }

    pub fn remote_url(&self, remote: &str) -> Result<String> {
        self.exec_trimmed(&["remote", "get-url", remote])
    }

    /// Subject lines of commits reachable from HEAD but not from `base`,
    /// newest first.
    pub fn commit_subjects_since(&self, base: &str) -> Result<Vec<String>> {
        let range = format!("{base}..HEAD");
        let out = self.exec_trimmed(&["log", "--format=%s", &range])?;
        Ok(out.lines().map(str::to_string).filter(|l| !l.is_empty()).collect())
    }
}

/// Extract `owner/name` from a GitHub remote URL (https or ssh form).
pub fn repo_from_remote_url(url: &str) -> Option<String> {
    let url = url.trim().trim_end_matches('/');
    let path = if let Some(rest) = url.strip_prefix("git@") {
        rest.split_once(':')?.1
    } else if let Some(idx) = url.find("://") {
        let after = &url[idx + 3..];
        after.split_once('/')?.1
    } else {
        return None;
    };
    let path = path.strip_suffix(".git").unwrap_or(path);
    let mut parts = path.rsplitn(3, '/');
    let name = parts.next().filter(|s| !s.is_empty())?;
    let owner = parts.next().filter(|s| !s.is_empty())?;
    Some(format!("{owner}/{name}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_https_and_ssh_remotes() {
        assert_eq!(
            repo_from_remote_url("https://github.com/acme/widgets.git").as_deref(),
            Some("acme/widgets")
        );
        assert_eq!(
            repo_from_remote_url("git@github.com:acme/widgets.git").as_deref(),
            Some("acme/widgets")
        );
        assert_eq!(
            repo_from_remote_url("ssh://git@github.example.com/acme/widgets").as_deref(),
            Some("acme/widgets")
        );
        assert_eq!(repo_from_remote_url("not a url"), None);
        assert_eq!(repo_from_remote_url("https://github.com/"), None);
    }

    #[test]
    fn exec_result_combined_output() {
        let r = ExecResult {
            stdout: "out".into(),
            stderr: String::new(),
            exit_code: 0,
        };
        assert!(r.success());
        assert_eq!(r.combined_output(), "out");
        let r = ExecResult {
            stdout: "out".into(),
            stderr: "err".into(),
            exit_code: 2,
        };
        assert!(!r.success());
        assert_eq!(r.combined_output(), "out\nerr");
    }
}
