//! Per-task git worktrees.
//!
//! A task's workspace lives at `<root>/<task_id>`. Creation never reuses or
//! repairs an existing directory, and a failed creation is not rolled back:
//! whatever was left behind is reclaimed by the sweeper.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use thiserror::Error;
use tracing::{debug, info, warn};

use taskfleet_core::{validate_branch_name, TaskId};

use crate::command::{CommandError, CommandRunner, CommandSpec};

const GIT_TIMEOUT: Duration = Duration::from_secs(120);

/// Lockfiles that trigger dependency installation, with their install argv.
const LOCKFILES: &[(&str, &str, &[&str])] = &[
    ("pnpm-lock.yaml", "pnpm", &["install", "--frozen-lockfile"]),
    ("yarn.lock", "yarn", &["install", "--frozen-lockfile"]),
    ("package-lock.json", "npm", &["ci"]),
];

/// Workspace errors.
#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("workspace already exists: {}", .0.display())]
    AlreadyExists(PathBuf),

    #[error("workspace not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("invalid base branch: {0}")]
    InvalidBranch(String),

    #[error(transparent)]
    Command(#[from] CommandError),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl WorkspaceError {
    fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// True when git does not recognise the directory as a worktree at all.
    pub fn is_not_a_worktree(&self) -> bool {
        match self {
            Self::Command(CommandError::Failed { stderr, .. }) => {
                stderr.contains("is not a working tree") || stderr.contains("not a git repository")
            }
            _ => false,
        }
    }
}

/// Per-task configuration file rendered into each workspace.
#[derive(Debug, Clone)]
pub struct ConfigTemplate {
    /// Template source with `${NAME}` placeholders.
    pub source: PathBuf,
    /// File name inside the workspace.
    pub file_name: String,
    /// Substitution values shared by every task.
    pub vars: HashMap<String, String>,
}

/// Per-call inputs for [`WorkspaceManager::create_workspace`].
#[derive(Debug, Clone, Default)]
pub struct CreateOptions {
    /// Repository checkout the worktree is added to.
    pub repo_dir: PathBuf,
    /// Short name for the task branch.
    pub slug: Option<String>,
}

/// Creates and removes task worktrees.
pub struct WorkspaceManager {
    runner: Arc<dyn CommandRunner>,
    root: PathBuf,
    install_timeout: Duration,
    template: Option<ConfigTemplate>,
}

impl WorkspaceManager {
    pub fn new(runner: Arc<dyn CommandRunner>, root: impl Into<PathBuf>, install_timeout: Duration) -> Self {
        Self {
            runner,
            root: root.into(),
            install_timeout,
            template: None,
        }
    }

    /// Builder method to render a config file into every new workspace.
    pub fn with_template(mut self, template: ConfigTemplate) -> Self {
        self.template = Some(template);
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Deterministic workspace path for a task.
    pub fn workspace_path(&self, task_id: &TaskId) -> PathBuf {
        self.root.join(task_id.as_str())
    }

    /// Existence check only.
    pub async fn workspace_exists(&self, task_id: &TaskId) -> bool {
        tokio::fs::try_exists(self.workspace_path(task_id))
            .await
            .unwrap_or(false)
    }

    /// Create the worktree for `task_id` from `base_branch`.
    pub async fn create_workspace(
        &self,
        task_id: &TaskId,
        base_branch: &str,
        options: &CreateOptions,
    ) -> Result<PathBuf, WorkspaceError> {
        let path = self.workspace_path(task_id);
        if self.workspace_exists(task_id).await {
            return Err(WorkspaceError::AlreadyExists(path));
        }

        self.check_branch_name(base_branch).await?;

        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|e| WorkspaceError::io(format!("create {}", self.root.display()), e))?;

        let repo = options.repo_dir.display().to_string();
        let branch = branch_name(task_id, options.slug.as_deref());

        info!(
            task_id = %task_id,
            repo = %repo,
            base_branch = %base_branch,
            branch = %branch,
            "Creating workspace"
        );

        self.runner
            .run_checked(
                &CommandSpec::new("git")
                    .args(["-C", repo.as_str(), "fetch", "--end-of-options", "origin", base_branch])
                    .timeout(GIT_TIMEOUT),
            )
            .await?;

        self.runner
            .run_checked(
                &CommandSpec::new("git")
                    .args(["-C", repo.as_str(), "worktree", "add", "-b"])
                    .arg(branch)
                    .arg(path.display().to_string())
                    .arg(format!("origin/{}", base_branch))
                    .timeout(GIT_TIMEOUT),
            )
            .await?;

        if let Some(template) = &self.template {
            self.write_config(task_id, &path, template).await?;
        }

        self.install_dependencies(task_id, &path).await?;

        info!(task_id = %task_id, path = %path.display(), "Workspace ready");
        Ok(path)
    }

    /// Local rules first, so nothing option-like ever reaches git, then
    /// `git check-ref-format` for the rest.
    async fn check_branch_name(&self, name: &str) -> Result<(), WorkspaceError> {
        validate_branch_name(name).map_err(|e| WorkspaceError::InvalidBranch(e.to_string()))?;

        let output = self
            .runner
            .run(&CommandSpec::new("git").args(["check-ref-format", "--branch", name]))
            .await?;
        if !output.success() {
            return Err(WorkspaceError::InvalidBranch(format!(
                "git rejects {:?}: {}",
                name,
                output.stderr.trim()
            )));
        }
        Ok(())
    }

    /// Remove the worktree for `task_id`.
    pub async fn remove_workspace(&self, task_id: &TaskId) -> Result<(), WorkspaceError> {
        let path = self.workspace_path(task_id);
        if !self.workspace_exists(task_id).await {
            return Err(WorkspaceError::NotFound(path));
        }
        self.remove_worktree_at(&path).await
    }

    /// Remove a worktree by path, via the repository that owns it.
    pub(crate) async fn remove_worktree_at(&self, path: &Path) -> Result<(), WorkspaceError> {
        let path_str = path.display().to_string();

        let common = self
            .runner
            .run_checked(&CommandSpec::new("git").args([
                "-C",
                path_str.as_str(),
                "rev-parse",
                "--path-format=absolute",
                "--git-common-dir",
            ]))
            .await?;
        let common_dir = PathBuf::from(common.stdout.trim());
        let repo = match common_dir.file_name() {
            Some(name) if name == ".git" => common_dir.parent().map(Path::to_path_buf).unwrap_or(common_dir),
            _ => common_dir,
        };
        let repo = repo.display().to_string();

        self.runner
            .run_checked(
                &CommandSpec::new("git")
                    .args(["-C", repo.as_str(), "worktree", "remove", "--force", path_str.as_str()])
                    .timeout(GIT_TIMEOUT),
            )
            .await?;

        if let Err(e) = self
            .runner
            .run_checked(&CommandSpec::new("git").args(["-C", repo.as_str(), "worktree", "prune"]))
            .await
        {
            warn!(repo = %repo, error = %e, "git worktree prune failed");
        }

        info!(path = %path_str, "Workspace removed");
        Ok(())
    }

    /// Render the template and move it into place atomically.
    async fn write_config(
        &self,
        task_id: &TaskId,
        workspace: &Path,
        template: &ConfigTemplate,
    ) -> Result<(), WorkspaceError> {
        let source = tokio::fs::read_to_string(&template.source)
            .await
            .map_err(|e| WorkspaceError::io(format!("read template {}", template.source.display()), e))?;

        let mut vars = template.vars.clone();
        vars.insert("TASK_ID".to_string(), task_id.as_str().to_string());
        let rendered = render_template(&source, &vars);

        let target = workspace.join(&template.file_name);
        let tmp = workspace.join(format!(".{}.tmp", template.file_name));
        tokio::fs::write(&tmp, rendered)
            .await
            .map_err(|e| WorkspaceError::io(format!("write {}", tmp.display()), e))?;
        tokio::fs::rename(&tmp, &target)
            .await
            .map_err(|e| WorkspaceError::io(format!("rename to {}", target.display()), e))?;

        debug!(task_id = %task_id, file = %target.display(), "Config file written");
        Ok(())
    }

    async fn install_dependencies(&self, task_id: &TaskId, workspace: &Path) -> Result<(), WorkspaceError> {
        for (lockfile, program, args) in LOCKFILES {
            if !tokio::fs::try_exists(workspace.join(lockfile)).await.unwrap_or(false) {
                continue;
            }

            info!(task_id = %task_id, lockfile = %lockfile, "Installing dependencies");
            self.runner
                .run_checked(
                    &CommandSpec::new(*program)
                        .args(args.iter().copied())
                        .current_dir(workspace)
                        .timeout(self.install_timeout),
                )
                .await?;
            return Ok(());
        }
        Ok(())
    }
}

/// Task branch name: `task/<slug>-<id>` or `task/<id>`. Task ids are
/// unique, so branch names are too.
pub fn branch_name(task_id: &TaskId, slug: Option<&str>) -> String {
    let slug = slug.map(sanitize_slug).filter(|s| !s.is_empty());
    match slug {
        Some(slug) => format!("task/{}-{}", slug, task_id),
        None => format!("task/{}", task_id),
    }
}

fn sanitize_slug(slug: &str) -> String {
    let mut out = String::new();
    for c in slug.chars() {
        let c = c.to_ascii_lowercase();
        if c.is_ascii_alphanumeric() {
            out.push(c);
        } else if !out.ends_with('-') {
            out.push('-');
        }
    }
    out.trim_matches('-').chars().take(48).collect()
}

static PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}").expect("placeholder pattern is valid"));

/// Replace `${NAME}` placeholders. Unknown names are left as they are.
pub fn render_template(source: &str, vars: &HashMap<String, String>) -> String {
    PLACEHOLDER
        .replace_all(source, |caps: &Captures| match vars.get(&caps[1]) {
            Some(value) => value.clone(),
            None => {
                warn!(name = %&caps[1], "Unknown template variable");
                caps[0].to_string()
            }
        })
        .into_owned()
}
