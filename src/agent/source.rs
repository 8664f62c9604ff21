//! Workspace source retrieval on the machine.

use kled_protocol::WorkspaceSource;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, info};

use crate::error::{Error, Result};

/// How a git reference is checked out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GitRef {
    Branch(String),
    Commit(String),
    PullRequest(u64),
}

impl GitRef {
    /// Parse the part after `@` in a git source.
    pub fn parse(reference: &str) -> Self {
        if let Some(commit) = reference.strip_prefix("sha256:") {
            return GitRef::Commit(commit.to_string());
        }
        if let Some(number) = reference
            .strip_prefix("pr/")
            .and_then(|n| n.parse::<u64>().ok())
        {
            return GitRef::PullRequest(number);
        }
        GitRef::Branch(reference.to_string())
    }
}

/// URL git can clone: scheme-less `host/path` sources get `https://`.
pub fn clone_url(remote: &str) -> String {
    if remote.contains("://") || remote.starts_with("git@") {
        remote.to_string()
    } else {
        format!("https://{}", remote)
    }
}

/// Commands that fetch `remote` at `reference` into `dest`.
pub fn clone_plan(remote: &str, reference: Option<&str>, dest: &Path) -> Vec<Vec<String>> {
    let url = clone_url(remote);
    let dest = dest.display().to_string();
    let git_in = |args: &[&str]| {
        let mut argv = vec!["git".to_string(), "-C".to_string(), dest.clone()];
        argv.extend(args.iter().map(|a| a.to_string()));
        argv
    };

    match reference.map(GitRef::parse) {
        None => vec![vec!["git".into(), "clone".into(), url, dest.clone()]],
        Some(GitRef::Branch(branch)) => vec![vec![
            "git".into(),
            "clone".into(),
            "--branch".into(),
            branch,
            url,
            dest.clone(),
        ]],
        Some(GitRef::Commit(commit)) => vec![
            vec!["git".into(), "clone".into(), url, dest.clone()],
            git_in(&["checkout", "--detach", commit.as_str()]),
        ],
        Some(GitRef::PullRequest(number)) => {
            let branch = format!("pr-{}", number);
            let refspec = format!("pull/{}/head:{}", number, branch);
            vec![
                vec!["git".into(), "clone".into(), url, dest.clone()],
                git_in(&["fetch", "origin", refspec.as_str()]),
                git_in(&["checkout", branch.as_str()]),
            ]
        }
    }
}

async fn run_git(argv: &[String]) -> Result<()> {
    let Some((program, args)) = argv.split_first() else {
        return Ok(());
    };
    debug!(?argv, "running git");
    let output = Command::new(program)
        .args(args)
        .env("GIT_TERMINAL_PROMPT", "0")
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| Error::runtime(format!("failed to run git: {}", e)))?;
    if !output.status.success() {
        return Err(Error::runtime(format!(
            "{} failed: {}",
            argv.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(())
}

/// Make the source available on the machine.
///
/// Returns the source root, or `None` for image-only workspaces. Git
/// sources are cloned into `content_dir` once; an existing checkout is left
/// as it is.
pub async fn prepare(source: &WorkspaceSource, content_dir: &Path) -> Result<Option<PathBuf>> {
    match source {
        WorkspaceSource::Git { remote, reference } => {
            if content_dir.join(".git").exists() {
                debug!(dir = %content_dir.display(), "reusing existing checkout");
                return Ok(Some(content_dir.to_path_buf()));
            }
            if let Some(parent) = content_dir.parent() {
                std::fs::create_dir_all(parent)?;
            }
            // a clone that died halfway leaves a directory git refuses
            if content_dir.exists() {
                std::fs::remove_dir_all(content_dir)?;
            }

            info!(%remote, reference = ?reference, "cloning workspace source");
            for argv in clone_plan(remote, reference.as_deref(), content_dir) {
                run_git(&argv).await?;
            }
            Ok(Some(content_dir.to_path_buf()))
        }
        WorkspaceSource::Local { path } => {
            if !path.is_dir() {
                return Err(Error::config(format!(
                    "workspace folder not found: {}",
                    path.display()
                )));
            }
            Ok(Some(std::fs::canonicalize(path)?))
        }
        WorkspaceSource::Image { .. } => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_git_ref() {
        assert_eq!(GitRef::parse("main"), GitRef::Branch("main".into()));
        assert_eq!(GitRef::parse("sha256:abc"), GitRef::Commit("abc".into()));
        assert_eq!(GitRef::parse("pr/42"), GitRef::PullRequest(42));
        assert_eq!(GitRef::parse("pr/draft"), GitRef::Branch("pr/draft".into()));
    }

    #[test]
    fn test_clone_plan() {
        let dest = Path::new("/data/ws/content");
        let plan = clone_plan("github.com/kled-io/kled.git", Some("pr/7"), dest);
        assert_eq!(plan.len(), 3);
        assert_eq!(plan[0][2], "https://github.com/kled-io/kled.git");
        assert_eq!(plan[1][3..], ["fetch", "origin", "pull/7/head:pr-7"]);
        assert_eq!(plan[2][3..], ["checkout", "pr-7"]);

        let plan = clone_plan("git@github.com:kled-io/kled.git", Some("dev"), dest);
        assert_eq!(
            plan,
            vec![vec![
                "git",
                "clone",
                "--branch",
                "dev",
                "git@github.com:kled-io/kled.git",
                "/data/ws/content",
            ]]
        );
    }

    #[tokio::test]
    async fn test_prepare_local_and_image() {
        let dir = tempfile::tempdir().unwrap();
        let local = WorkspaceSource::Local {
            path: dir.path().to_path_buf(),
        };
        let root = prepare(&local, &dir.path().join("unused")).await.unwrap();
        assert_eq!(root, Some(std::fs::canonicalize(dir.path()).unwrap()));

        let missing = WorkspaceSource::Local {
            path: dir.path().join("missing"),
        };
        assert!(prepare(&missing, dir.path()).await.is_err());

        let image = WorkspaceSource::Image {
            image: "ubuntu".into(),
        };
        assert_eq!(prepare(&image, dir.path()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_prepare_keeps_existing_checkout() {
        let dir = tempfile::tempdir().unwrap();
        let content = dir.path().join("content");
        std::fs::create_dir_all(content.join(".git")).unwrap();
        let git = WorkspaceSource::Git {
            remote: "https://example.invalid/repo.git".into(),
            reference: None,
        };
        assert_eq!(prepare(&git, &content).await.unwrap(), Some(content));
    }
}
