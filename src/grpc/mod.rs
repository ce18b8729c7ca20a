//! gRPC surface for the keyed limiter.

mod client;
mod convert;
mod server;
mod service;

pub use client::GrpcLimiterBackend;
pub use server::GrpcServer;
pub use service::RateLimiterServiceImpl;

// Include the generated protobuf code
pub mod proto {
    pub mod tollgate {
        pub mod limiter {
            pub mod v1 {
                tonic::include_proto!("tollgate.limiter.v1");
            }
        }
    }
}

// Re-export commonly used types
pub use proto::tollgate::limiter::v1::{
    rate_limiter_client::RateLimiterClient, rate_limiter_server::RateLimiterServer,
};
