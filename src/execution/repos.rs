//! Git commands for cloning repositories into the shared volume

use crate::core::config::Repository;
use crate::execution::paths;

/// Git over SSH must not stop on unknown host keys in a throwaway container
pub const GIT_SSH_COMMAND: &str =
    "GIT_SSH_COMMAND=ssh -o UserKnownHostsFile=/dev/null -o StrictHostKeyChecking=no";

/// The git invocations needed to materialize one repository
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClonePlan {
    pub clone_command: Vec<String>,
    /// Present when a ref has to be checked out after cloning
    pub checkout: Option<RefCheckout>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefCheckout {
    /// Directory the fetch and checkout run in
    pub working_dir: String,
    pub fetch: Vec<String>,
    pub checkout: Vec<String>,
}

/// Build the git commands for `repo`, cloned below `workdir`.
/// Checking out a ref needs full history, so a ref disables `--depth 1`.
pub fn clone_plan(repo: &Repository, workdir: &str) -> ClonePlan {
    let git_ref = repo.git_ref();

    let mut clone_command = vec!["clone".to_string()];
    if repo.shallow && git_ref.is_none() {
        clone_command.push("--depth".to_string());
        clone_command.push("1".to_string());
    }
    clone_command.push(repo.location.clone());
    if let Some(dir) = repo.directory.as_deref().filter(|d| !d.is_empty()) {
        clone_command.push(dir.to_string());
    }

    let checkout = git_ref.map(|git_ref| RefCheckout {
        working_dir: paths::join(workdir, &repo.checkout_directory()),
        fetch: vec!["fetch".to_string(), "--all".to_string()],
        checkout: vec!["checkout".to_string(), git_ref.to_string()],
    });

    ClonePlan {
        clone_command,
        checkout,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn repo(location: &str) -> Repository {
        Repository {
            name: "app".to_string(),
            location: location.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_shallow_clone_without_ref() {
        let mut repo = repo("https://example.com/app.git");
        repo.shallow = true;
        repo.directory = Some("app".to_string());

        let plan = clone_plan(&repo, "/src");
        assert_eq!(plan.clone_command, vec!["clone", "--depth", "1", "https://example.com/app.git", "app"]);
        assert!(plan.checkout.is_none());
    }

    #[test]
    fn test_branch_disables_shallow() {
        let mut repo = repo("https://example.com/app.git");
        repo.shallow = true;
        repo.branch = Some("main".to_string());

        let plan = clone_plan(&repo, "/src");
        assert_eq!(plan.clone_command, vec!["clone", "https://example.com/app.git"]);
        let checkout = plan.checkout.unwrap();
        assert_eq!(checkout.working_dir, "/src/app");
        assert_eq!(checkout.fetch, vec!["fetch", "--all"]);
        assert_eq!(checkout.checkout, vec!["checkout", "main"]);
    }

    #[test]
    fn test_commit_checkout_in_explicit_directory() {
        let mut repo = repo("git@example.com:org/lib.git");
        repo.directory = Some("vendor/lib".to_string());
        repo.commit = Some("4f2a9c1".to_string());

        let plan = clone_plan(&repo, "/src");
        assert_eq!(plan.clone_command, vec!["clone", "git@example.com:org/lib.git", "vendor/lib"]);
        let checkout = plan.checkout.unwrap();
        assert_eq!(checkout.working_dir, "/src/vendor/lib");
        assert_eq!(checkout.checkout, vec!["checkout", "4f2a9c1"]);
    }

    #[test]
    fn test_dot_directory_checks_out_in_workdir() {
        let mut repo = repo("https://example.com/app.git");
        repo.directory = Some(".".to_string());
        repo.tag = Some("v1.0".to_string());

        let plan = clone_plan(&repo, "/src");
        assert_eq!(plan.clone_command, vec!["clone", "https://example.com/app.git", "."]);
        assert_eq!(plan.checkout.unwrap().working_dir, "/src");
    }
}
