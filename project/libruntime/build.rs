fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("cargo:rerun-if-changed=proto/api.proto");
    tonic_build::configure()
        .build_server(false) // the runtime is the server
        .compile_protos(&["proto/api.proto"], &["proto"])?;
    Ok(())
}
