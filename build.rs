use std::process::Command;

fn git(args: &[&str]) -> Option<Vec<u8>> {
    let output = Command::new("git").args(args).output().ok()?;
    output.status.success().then_some(output.stdout)
}

fn main() {
    // Get git revision, "unknown" outside a checkout
    let git_revision = match git(&["rev-parse", "--short", "HEAD"]) {
        Some(hash) => {
            let git_hash = String::from_utf8_lossy(&hash).trim().to_string();

            // Check if working directory is clean
            let is_dirty = git(&["status", "--porcelain"])
                .map(|status| !status.is_empty())
                .unwrap_or(false);
            if is_dirty {
                format!("{}-dirty", git_hash)
            } else {
                git_hash
            }
        }
        None => "unknown".to_string(),
    };

    // Set the GIT_REVISION environment variable for use in the code
    println!("cargo:rustc-env=GIT_REVISION={}", git_revision);

    // Rerun if .git directory changes
    println!("cargo:rerun-if-changed=.git/HEAD");
    println!("cargo:rerun-if-changed=.git/index");
}
