use std::process::Command;

/// Run a command and return its trimmed stdout, or "unknown".
fn capture(program: &str, args: &[&str]) -> String {
    Command::new(program)
        .args(args)
        .output()
        .ok()
        .filter(|o| o.status.success())
        .map(|o| String::from_utf8_lossy(&o.stdout).trim().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

fn main() {
    // Shown by `chatflow version`.
    let git_hash = capture("git", &["rev-parse", "--short", "HEAD"]);
    println!("cargo:rustc-env=CHATFLOW_GIT_HASH={}", git_hash);

    let build_date = capture("date", &["+%Y-%m-%d"]);
    println!("cargo:rustc-env=CHATFLOW_BUILD_DATE={}", build_date);

    println!("cargo:rerun-if-changed=.git/HEAD");
    println!("cargo:rerun-if-changed=.git/refs/");
}
