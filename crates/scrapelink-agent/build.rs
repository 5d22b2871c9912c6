use std::process::Command;

fn git(args: &[&str]) -> Option<String> {
    let output = Command::new("git").args(args).output().ok()?;
    if !output.status.success() {
        return None;
    }
    String::from_utf8(output.stdout)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn main() {
    let commit = git(&["rev-parse", "--short", "HEAD"]).unwrap_or_else(|| "unknown".to_string());
    let built_at = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string();

    // Consumed by the agent's --version output
    println!("cargo:rustc-env=SCRAPELINK_COMMIT={}", commit);
    println!("cargo:rustc-env=SCRAPELINK_BUILT_AT={}", built_at);

    println!("cargo:rerun-if-changed=.git/HEAD");
}
