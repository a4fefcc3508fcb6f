use std::io;
use std::process::{Command, Stdio};

/// Exposes the git revision as `CONTENTCACHE_RELEASE`, if built from a checkout.
fn emit_release_var() -> io::Result<()> {
    let output = Command::new("git")
        .args(["describe", "--always", "--dirty=-modified"])
        .stderr(Stdio::inherit())
        .output()?;

    if !output.status.success() {
        return Err(io::Error::other(format!(
            "`git describe` failed: {}",
            output.status
        )));
    }

    let release = String::from_utf8_lossy(&output.stdout);
    println!("cargo:rustc-env=CONTENTCACHE_RELEASE={}", release.trim());
    println!("cargo:rerun-if-env-changed=CONTENTCACHE_RELEASE");

    Ok(())
}

fn main() {
    emit_release_var().ok();
}
