fn main() -> Result<(), Box<dyn std::error::Error>> {
    // CSI v1 subset plus the podmon vendor extension served on the same socket
    tonic_build::configure()
        .build_client(true)
        .build_server(true) // Fake drivers in tests serve these services
        .compile_protos(&["proto/csi.proto", "proto/podmon.proto"], &["proto/"])?;
    Ok(())
}
