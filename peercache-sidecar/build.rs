//! Build script for the peercache sidecar
//!
//! Compiles the cache repository Protocol Buffer definition into the gRPC
//! server (served to peers) and client (used to call peers).

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tonic_prost_build::configure()
        .build_server(true)
        .build_client(true)
        .compile_protos(&["proto/cache_repository.proto"], &["proto"])?;

    println!("cargo:rerun-if-changed=proto/cache_repository.proto");

    Ok(())
}
