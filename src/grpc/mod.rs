//! gRPC surface of the rate limit service.

mod server;
mod service;

pub use server::GrpcServer;
pub use service::RateLimitServiceImpl;

// Include the generated protobuf code
pub mod proto {
    pub mod tokengate {
        pub mod v1 {
            tonic::include_proto!("tokengate.v1");
        }
    }
}

// Re-export commonly used types
pub use proto::tokengate::v1::{
    rate_limit_service_client::RateLimitServiceClient,
    rate_limit_service_server::RateLimitServiceServer, InspectBucketRequest,
    InspectBucketResponse, RateLimitRequest, RateLimitResponse, ResetBucketRequest,
    ResetBucketResponse,
};
