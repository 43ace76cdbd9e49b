use std::process::Command;

fn main() {
    println!("cargo:rerun-if-changed=.git/HEAD");

    // Builds from a source tarball have no git metadata; report "unknown".
    let git_tag = Command::new("git")
        .args(["describe", "--tags", "--always", "--broken"])
        .current_dir(env!("CARGO_MANIFEST_DIR"))
        .output()
        .ok()
        .filter(|output| output.status.success())
        .and_then(|output| String::from_utf8(output.stdout).ok())
        .map(|tag| tag.trim().to_string())
        .filter(|tag| !tag.is_empty())
        .unwrap_or_else(|| "unknown".to_string());

    println!("cargo:rustc-env=GIT_TAG={git_tag}");
}
