//! Stamps `--version` output with the commit, release tag and build time

use std::path::PathBuf;
use std::process::Command;

fn git(args: &[&str]) -> Option<String> {
    let output = Command::new("git").args(args).output().ok()?;
    if !output.status.success() {
        return None;
    }
    let text = String::from_utf8(output.stdout).ok()?;
    let text = text.trim();
    (!text.is_empty()).then(|| text.to_string())
}

/// Short commit hash, suffixed with `-dirty` for uncommitted changes
fn commit() -> String {
    let Some(hash) = git(&["rev-parse", "--short", "HEAD"]) else {
        return "unknown".to_string();
    };
    match git(&["status", "--porcelain", "--untracked-files=no"]) {
        Some(_) => format!("{}-dirty", hash),
        None => hash,
    }
}

fn main() {
    let stamps = [
        ("GIT_HASH", commit()),
        (
            "GIT_TAG",
            git(&["describe", "--tags", "--abbrev=0"])
                .unwrap_or_else(|| env!("CARGO_PKG_VERSION").to_string()),
        ),
        ("BUILD_TIME", chrono::Utc::now().to_rfc3339()),
    ];
    for (name, value) in stamps {
        println!("cargo:rustc-env={}={}", name, value);
    }

    // The crate sits below the repository root, so ask git where its state lives
    if let Some(git_dir) = git(&["rev-parse", "--absolute-git-dir"]).map(PathBuf::from) {
        for tracked in ["HEAD", "refs/tags", "index"] {
            println!("cargo:rerun-if-changed={}", git_dir.join(tracked).display());
        }
    }
    println!("cargo:rerun-if-changed=build.rs");
}
