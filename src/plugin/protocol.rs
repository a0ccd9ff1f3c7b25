//! Generated gRPC types for the host/plugin protocol (`proto/plugin.proto`)

tonic::include_proto!("releasepilot.plugin.v1");
