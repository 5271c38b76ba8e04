use std::env;
use std::path::PathBuf;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("cargo:rerun-if-changed=proto/geobridge.proto");
    let out_dir = PathBuf::from(env::var("OUT_DIR")?);
    tonic_build::configure()
        .file_descriptor_set_path(out_dir.join("geobridge_descriptor.bin"))
        .compile_protos(&["proto/geobridge.proto"], &["proto"])?;
    Ok(())
}
