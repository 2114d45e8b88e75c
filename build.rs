//! Build script for kv-arc-offload.

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
}
