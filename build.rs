use std::env;
use std::path::PathBuf;

fn main() {
    // Generate C header for the FFI module using cbindgen
    let crate_dir = env::var("CARGO_MANIFEST_DIR").unwrap();
    let include_dir = PathBuf::from(&crate_dir).join("include");
    let output_path = include_dir.join("thumbjit.h");

    std::fs::create_dir_all(&include_dir).ok();

    let config = cbindgen::Config {
        language: cbindgen::Language::C,
        include_guard: Some("THUMBJIT_H".to_string()),
        ..Default::default()
    };

    if let Err(e) = cbindgen::Builder::new()
        .with_crate(&crate_dir)
        .with_config(config)
        .generate()
        .map(|bindings| bindings.write_to_file(&output_path))
    {
        eprintln!("Warning: Failed to generate C header: {}", e);
    }
    println!("cargo:rerun-if-changed=src/ffi");
}
