use std::time::{SystemTime, UNIX_EPOCH};

fn emit_build_number() {
    let n = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    println!("cargo:rustc-env=YEASTRICTION_BUILD_N={n}");
}

fn main() {
    emit_build_number();
    println!("cargo:rerun-if-changed=build.rs");
}
