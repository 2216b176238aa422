use std::process::Command;

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rerun-if-env-changed=TUNNEL_VERSION");

    // Release builds may override the reported version via TUNNEL_VERSION.
    let version = std::env::var("TUNNEL_VERSION")
        .ok()
        .filter(|v| !v.trim().is_empty())
        .or_else(|| std::env::var("CARGO_PKG_VERSION").ok())
        .unwrap_or_else(|| "unreleased".to_string());
    println!("cargo:rustc-env=TUNNEL_VERSION={version}");

    let rustc = std::env::var("RUSTC").unwrap_or_else(|_| "rustc".to_string());
    let toolchain = Command::new(&rustc)
        .arg("--version")
        .output()
        .ok()
        .filter(|out| out.status.success())
        .map(|out| String::from_utf8_lossy(&out.stdout).trim().to_string())
        .unwrap_or_else(|| "rustc (unknown)".to_string());
    println!("cargo:rustc-env=TUNNEL_RUSTC={toolchain}");
}
