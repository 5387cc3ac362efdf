//! Rate limit service implementation.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tonic::{Request, Response, Status};
use tracing::{debug, info, instrument, warn};

use super::proto::tokengate::v1::{
    rate_limit_response::Code, rate_limit_service_server::RateLimitService, HeaderValue,
    InspectBucketRequest, InspectBucketResponse, RateLimitRequest, RateLimitResponse,
    ResetBucketRequest, ResetBucketResponse,
};

use crate::ratelimit::{Identifier, RateLimiter, Rejection, RequestContext};

/// HTTP status reported for an admitted call.
const STATUS_OK: u32 = 200;

/// Implementation of the Tokengate RateLimitService gRPC interface.
pub struct RateLimitServiceImpl {
    /// The rate limiter instance
    rate_limiter: Arc<RateLimiter>,
}

impl RateLimitServiceImpl {
    /// Create a new RateLimitServiceImpl with the given rate limiter.
    pub fn new(rate_limiter: Arc<RateLimiter>) -> Self {
        Self { rate_limiter }
    }
}

#[tonic::async_trait]
impl RateLimitService for RateLimitServiceImpl {
    /// Decide whether a call may proceed.
    ///
    /// Never fails because of the bucket store: store errors are absorbed
    /// by the limiter and the call is admitted.
    #[instrument(
        skip(self, request),
        fields(
            user_id = %request.get_ref().user_id,
            route = %request.get_ref().route,
            cost = request.get_ref().cost
        )
    )]
    async fn should_rate_limit(
        &self,
        request: Request<RateLimitRequest>,
    ) -> Result<Response<RateLimitResponse>, Status> {
        let peer = request.remote_addr();
        let req = request.into_inner();

        let ctx = RequestContext {
            user_id: non_empty(req.user_id),
            client_addr: client_addr(&req.client_addr, peer),
            route: non_empty(req.route),
        };

        // Zero means the configured per-request cost
        let cost = if req.cost == 0 { None } else { Some(req.cost) };
        let outcome = self.rate_limiter.check_with_cost(&ctx, cost).await;

        let (code, http_status, raw_body) = match &outcome.rejection {
            Some(rejection) => {
                let body = rejection
                    .to_json()
                    .map_err(|e| Status::internal(format!("failed to encode rejection: {}", e)))?;
                (Code::OverLimit, u32::from(Rejection::STATUS), body)
            }
            None => (Code::Ok, STATUS_OK, String::new()),
        };

        let response_headers_to_add = outcome
            .headers
            .map(|headers| {
                headers
                    .to_pairs()
                    .into_iter()
                    .map(|(key, value)| HeaderValue {
                        key: key.to_string(),
                        value,
                    })
                    .collect()
            })
            .unwrap_or_default();

        debug!(
            identifier = %outcome.identifier,
            code = ?code,
            remaining = outcome.decision.remaining,
            "Rate limit decision made"
        );

        Ok(Response::new(RateLimitResponse {
            code: code.into(),
            remaining_tokens: outcome.decision.remaining,
            wait_millis: outcome.decision.wait.as_millis() as u64,
            response_headers_to_add,
            http_status,
            raw_body,
        }))
    }

    /// Clear a bucket.
    #[instrument(skip(self, request), fields(identifier = %request.get_ref().identifier))]
    async fn reset_bucket(
        &self,
        request: Request<ResetBucketRequest>,
    ) -> Result<Response<ResetBucketResponse>, Status> {
        let identifier = admin_identifier(request.into_inner().identifier)?;

        self.rate_limiter.reset(&identifier).await.map_err(|e| {
            warn!(identifier = %identifier, error = %e, "Bucket reset failed");
            Status::unavailable(e.to_string())
        })?;

        info!(identifier = %identifier, "Bucket reset");
        Ok(Response::new(ResetBucketResponse {}))
    }

    /// Read a bucket without consuming tokens.
    #[instrument(skip(self, request), fields(identifier = %request.get_ref().identifier))]
    async fn inspect_bucket(
        &self,
        request: Request<InspectBucketRequest>,
    ) -> Result<Response<InspectBucketResponse>, Status> {
        let identifier = admin_identifier(request.into_inner().identifier)?;

        let snapshot = self.rate_limiter.inspect(&identifier).await.map_err(|e| {
            warn!(identifier = %identifier, error = %e, "Bucket inspection failed");
            Status::unavailable(e.to_string())
        })?;

        Ok(Response::new(InspectBucketResponse {
            tokens: snapshot.tokens,
            last_refill_at_unix_ms: snapshot.last_refill_at.timestamp_millis(),
            capacity: snapshot.capacity,
            refill_rate_per_second: snapshot.refill_rate_per_second,
        }))
    }
}

fn non_empty(value: String) -> Option<String> {
    if value.trim().is_empty() {
        None
    } else {
        Some(value)
    }
}

/// Caller address from the request, else the gRPC peer, else unspecified.
fn client_addr(claimed: &str, peer: Option<SocketAddr>) -> IpAddr {
    if let Ok(addr) = claimed.trim().parse::<IpAddr>() {
        return addr;
    }
    if !claimed.is_empty() {
        debug!(client_addr = %claimed, "Unparsable client address, using peer address");
    }
    peer.map(|peer| peer.ip())
        .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED))
}

fn admin_identifier(identifier: String) -> Result<Identifier, Status> {
    if identifier.is_empty() {
        warn!("Received bucket request with empty identifier");
        return Err(Status::invalid_argument("identifier is required"));
    }
    Ok(Identifier::new(identifier))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::{
        BucketConfig, EvictionPolicy, MemoryBackend, HEADER_LIMIT, HEADER_REMAINING,
        HEADER_TYPE,
    };

    fn service(capacity: u32) -> RateLimitServiceImpl {
        let config = BucketConfig::new(capacity, 0.001, 1).unwrap();
        let backend = Arc::new(MemoryBackend::new(config, EvictionPolicy::default()));
        RateLimitServiceImpl::new(Arc::new(RateLimiter::new(backend)))
    }

    fn request(user_id: &str, client_addr: &str) -> Request<RateLimitRequest> {
        Request::new(RateLimitRequest {
            user_id: user_id.to_string(),
            client_addr: client_addr.to_string(),
            route: "/api/v1/messages".to_string(),
            cost: 0,
        })
    }

    fn header<'a>(response: &'a RateLimitResponse, key: &str) -> Option<&'a str> {
        response
            .response_headers_to_add
            .iter()
            .find(|h| h.key == key)
            .map(|h| h.value.as_str())
    }

    #[test]
    fn test_client_addr_fallbacks() {
        let peer: SocketAddr = "10.1.2.3:5555".parse().unwrap();

        assert_eq!(
            client_addr("192.168.0.9", Some(peer)),
            "192.168.0.9".parse::<IpAddr>().unwrap()
        );
        assert_eq!(client_addr("", Some(peer)), peer.ip());
        assert_eq!(client_addr("garbage", Some(peer)), peer.ip());
        assert_eq!(client_addr("", None), IpAddr::V4(Ipv4Addr::UNSPECIFIED));
    }

    #[tokio::test]
    async fn test_valid_request_returns_ok() {
        let service = service(10);

        let response = service
            .should_rate_limit(request("", "10.0.0.1"))
            .await
            .unwrap()
            .into_inner();

        assert_eq!(response.code(), Code::Ok);
        assert_eq!(response.http_status, 200);
        assert!(response.raw_body.is_empty());
        assert_eq!(header(&response, HEADER_LIMIT), Some("10"));
        assert_eq!(header(&response, HEADER_REMAINING), Some("9"));
        assert_eq!(header(&response, HEADER_TYPE), Some("token-bucket"));
    }

    #[tokio::test]
    async fn test_over_limit_returns_rejection() {
        let service = service(1);

        service.should_rate_limit(request("u1", "")).await.unwrap();
        let response = service
            .should_rate_limit(request("u1", ""))
            .await
            .unwrap()
            .into_inner();

        assert_eq!(response.code(), Code::OverLimit);
        assert_eq!(response.http_status, 429);
        assert!(response.wait_millis > 900_000);
        assert_eq!(header(&response, HEADER_REMAINING), Some("0"));

        let body: serde_json::Value = serde_json::from_str(&response.raw_body).unwrap();
        assert_eq!(body["error"], "rate_limit_exceeded");
    }

    #[tokio::test]
    async fn test_explicit_cost_is_used() {
        let service = service(10);

        let mut req = request("u2", "");
        req.get_mut().cost = 7;
        let response = service.should_rate_limit(req).await.unwrap().into_inner();

        assert_eq!(response.code(), Code::Ok);
        assert_eq!(header(&response, HEADER_REMAINING), Some("3"));
    }

    #[tokio::test]
    async fn test_admin_requests_require_identifier() {
        let service = service(10);

        let result = service
            .reset_bucket(Request::new(ResetBucketRequest {
                identifier: String::new(),
            }))
            .await;
        assert_eq!(result.unwrap_err().code(), tonic::Code::InvalidArgument);

        let result = service
            .inspect_bucket(Request::new(InspectBucketRequest {
                identifier: String::new(),
            }))
            .await;
        assert_eq!(result.unwrap_err().code(), tonic::Code::InvalidArgument);
    }

    #[tokio::test]
    async fn test_inspect_and_reset_bucket() {
        let service = service(5);
        service.should_rate_limit(request("u3", "")).await.unwrap();

        let inspect = || {
            service.inspect_bucket(Request::new(InspectBucketRequest {
                identifier: "user:u3".to_string(),
            }))
        };

        let snapshot = inspect().await.unwrap().into_inner();
        assert!(snapshot.tokens >= 4.0 && snapshot.tokens < 4.1);
        assert_eq!(snapshot.capacity, 5);
        assert!(snapshot.last_refill_at_unix_ms > 0);

        service
            .reset_bucket(Request::new(ResetBucketRequest {
                identifier: "user:u3".to_string(),
            }))
            .await
            .unwrap();

        let snapshot = inspect().await.unwrap().into_inner();
        assert_eq!(snapshot.tokens, 5.0);
    }
}
