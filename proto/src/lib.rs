//! Generated gRPC bindings for the runner service.

tonic::include_proto!("runner");
