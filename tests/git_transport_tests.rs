//! GitCli against real local repositories. Skipped when git is not installed.

mod common;

use common::{create_remote, git, git_available, push_commit};
use github_export::config::MirrorMode;
use github_export::{GitCli, GitTransport, Remote, TransportError};
use serial_test::serial;
use std::path::Path;
use std::time::Duration;
use tempfile::TempDir;

fn transport(mode: MirrorMode) -> GitCli {
    GitCli::new(mode, Duration::from_secs(60))
}

fn file_remote(path: &Path) -> Remote {
    Remote::plain(format!("file://{}", path.display())).default_branch(Some("main".to_string()))
}

#[tokio::test]
async fn test_mirror_clone_then_update_picks_up_new_commits() {
    if !git_available() {
        eprintln!("git not installed, skipping");
        return;
    }
    let root = TempDir::new().unwrap();
    let bare = create_remote(root.path(), "demo");
    let dest = root.path().join("backup/demo.git");
    let git_cli = transport(MirrorMode::Mirror);
    let remote = file_remote(&bare);

    git_cli.clone_repository(&remote, &dest).await.unwrap();

    assert!(git_cli.is_repository(&dest));
    assert!(!GitCli::staging_path(&dest).exists());
    assert_eq!(git(&dest, &["config", "--get", "remote.origin.url"]), remote.url);

    let head = push_commit(root.path(), "demo", "CHANGES.md");
    git_cli.update_repository(&remote, &dest).await.unwrap();

    assert_eq!(git(&dest, &["rev-parse", "refs/heads/main"]), head);
}

#[tokio::test]
async fn test_working_tree_clone_then_fast_forward() {
    if !git_available() {
        eprintln!("git not installed, skipping");
        return;
    }
    let root = TempDir::new().unwrap();
    let bare = create_remote(root.path(), "tree");
    let dest = root.path().join("backup/tree");
    let git_cli = transport(MirrorMode::WorkingTree);
    let remote = file_remote(&bare);

    git_cli.clone_repository(&remote, &dest).await.unwrap();
    assert!(git_cli.is_repository(&dest));
    assert!(dest.join("README.md").is_file());

    push_commit(root.path(), "tree", "NOTES.md");
    git_cli.update_repository(&remote, &dest).await.unwrap();

    assert!(dest.join("NOTES.md").is_file());
}

#[tokio::test]
async fn test_failed_clone_leaves_nothing_behind() {
    if !git_available() {
        eprintln!("git not installed, skipping");
        return;
    }
    let root = TempDir::new().unwrap();
    let dest = root.path().join("backup/missing.git");
    let git_cli = transport(MirrorMode::Mirror);
    let remote = Remote::plain(format!("file://{}", root.path().join("does-not-exist.git").display()));

    let err = git_cli.clone_repository(&remote, &dest).await.unwrap_err();

    assert!(matches!(err, TransportError::Git { operation: "clone", .. }));
    assert!(!dest.exists());
    assert!(!GitCli::staging_path(&dest).exists());
}

#[tokio::test]
async fn test_stale_staging_directory_is_replaced() {
    if !git_available() {
        eprintln!("git not installed, skipping");
        return;
    }
    let root = TempDir::new().unwrap();
    let bare = create_remote(root.path(), "stale");
    let dest = root.path().join("backup/stale.git");
    let staging = GitCli::staging_path(&dest);
    std::fs::create_dir_all(&staging).unwrap();
    std::fs::write(staging.join("leftover"), "from a crashed run").unwrap();

    transport(MirrorMode::Mirror)
        .clone_repository(&file_remote(&bare), &dest)
        .await
        .unwrap();

    assert!(dest.join("HEAD").is_file());
    assert!(!staging.exists());
}

#[tokio::test]
async fn test_update_of_missing_mirror_fails() {
    if !git_available() {
        eprintln!("git not installed, skipping");
        return;
    }
    let root = TempDir::new().unwrap();
    let bare = create_remote(root.path(), "gone");
    let dest = root.path().join("backup/gone.git");
    std::fs::create_dir_all(&dest).unwrap();

    let result = transport(MirrorMode::Mirror)
        .update_repository(&file_remote(&bare), &dest)
        .await;

    assert!(result.is_err());
}

#[tokio::test]
async fn test_working_tree_update_of_empty_remote_is_a_no_op() {
    if !git_available() {
        eprintln!("git not installed, skipping");
        return;
    }
    let root = TempDir::new().unwrap();
    let bare = root.path().join("empty.remote.git");
    git(root.path(), &["init", "--bare", bare.to_str().unwrap()]);
    let dest = root.path().join("backup/empty");
    let git_cli = transport(MirrorMode::WorkingTree);
    let remote = file_remote(&bare);

    git_cli.clone_repository(&remote, &dest).await.unwrap();
    git_cli.update_repository(&remote, &dest).await.unwrap();

    assert!(git_cli.is_repository(&dest));
}

#[tokio::test]
#[serial]
async fn test_hung_remote_times_out_and_leaves_nothing_behind() {
    if !git_available() {
        eprintln!("git not installed, skipping");
        return;
    }
    let root = TempDir::new().unwrap();
    let dest = root.path().join("backup/hung.git");
    let git_cli = GitCli::new(MirrorMode::Mirror, Duration::from_millis(500));
    let remote = Remote::plain("ssh://git@example.invalid/octocat/hung.git");

    // The ssh stand-in never answers; `#` swallows the arguments git appends
    std::env::set_var("GIT_SSH_COMMAND", "sleep 30 #");
    let result = git_cli.clone_repository(&remote, &dest).await;
    std::env::remove_var("GIT_SSH_COMMAND");

    assert!(matches!(result, Err(TransportError::Timeout { operation: "clone", .. })));
    assert!(!dest.exists());
    assert!(!GitCli::staging_path(&dest).exists());
}
