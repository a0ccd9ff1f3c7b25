fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Compile the host/plugin RPC protocol
    tonic_prost_build::compile_protos("proto/plugin.proto")?;

    Ok(())
}
