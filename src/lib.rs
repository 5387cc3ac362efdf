//! Tokengate - Token-Bucket Rate Limiting Service
//!
//! This crate implements a token-bucket rate limiter that answers gRPC
//! decision requests. Buckets live either in process memory or in Redis,
//! where an atomic script keeps them consistent across service replicas.

pub mod config;
pub mod error;
pub mod grpc;
pub mod ratelimit;
