//! Build script for dsr-core.
//!
//! Exposes the target triple to `dsr-client info`.

fn main() {
    println!(
        "cargo:rustc-env=TARGET={}",
        std::env::var("TARGET").unwrap_or_else(|_| "unknown".to_string())
    );
    println!("cargo:rerun-if-env-changed=TARGET");
}
