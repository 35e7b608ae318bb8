use std::{env, path::PathBuf};

fn main() {
    let target = env::var("TARGET").unwrap_or_default();
    let manifest_dir = env::var("CARGO_MANIFEST_DIR").expect("CARGO_MANIFEST_DIR not set");
    let kernel_dir = PathBuf::from(manifest_dir);

    if target.contains("i386") || target.contains("i686") || target == "x86-corvid" {
        let linker_script = kernel_dir.join("src/arch/x86/link.ld");
        println!("cargo:rustc-link-arg=-T{}", linker_script.display());
        println!("cargo:rustc-link-arg=-nostartfiles");
    }

    println!("cargo:rerun-if-changed=src/arch/x86/link.ld");
    println!("cargo:rerun-if-changed=x86-corvid.json");
}
