use std::path::PathBuf;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Use the vendored protoc so the build does not depend on a system
    // protobuf installation.
    std::env::set_var("PROTOC", protoc_bin_vendored::protoc_bin_path()?);

    let out_dir = PathBuf::from(std::env::var("OUT_DIR")?);

    tonic_build::configure()
        .file_descriptor_set_path(out_dir.join("op_descriptor.bin"))
        .compile_protos(&["proto/op/v1/op.proto"], &["proto"])?;

    println!("cargo:rerun-if-changed=proto/op/v1/op.proto");
    Ok(())
}
