use std::process::Command;

/// Stamp the binary with the short commit hash and build date so
/// `pitchside --version` identifies exactly what is running.
fn main() {
    println!(
        "cargo:rustc-env=PITCHSIDE_GIT_HASH={}",
        capture("git", &["rev-parse", "--short", "HEAD"]).unwrap_or_else(|| "unknown".into())
    );
    println!(
        "cargo:rustc-env=PITCHSIDE_BUILD_DATE={}",
        capture("date", &["+%Y-%m-%d"]).unwrap_or_else(|| "unknown".into())
    );

    println!("cargo:rerun-if-changed=.git/HEAD");
    println!("cargo:rerun-if-changed=.git/refs/");
}

fn capture(program: &str, args: &[&str]) -> Option<String> {
    let output = Command::new(program).args(args).output().ok()?;
    if !output.status.success() {
        return None;
    }
    Some(String::from_utf8_lossy(&output.stdout).trim().to_string())
}
