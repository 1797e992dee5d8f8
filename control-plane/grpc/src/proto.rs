//! The subset of Envoy's external authorization API (`envoy.service.auth.v3`) served by the
//! control plane.
//!
//! Field tags match the upstream protobuf definitions so that the messages are wire-compatible
//! with Envoy's `ext_authz` filter. Fields the control plane doesn't read are omitted and skipped
//! when decoding.

use std::collections::HashMap;

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CheckRequest {
    #[prost(message, optional, tag = "1")]
    pub attributes: Option<AttributeContext>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AttributeContext {
    #[prost(message, optional, tag = "4")]
    pub request: Option<attribute_context::Request>,
    #[prost(map = "string, string", tag = "10")]
    pub context_extensions: HashMap<String, String>,
}

pub mod attribute_context {
    use std::collections::HashMap;

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Request {
        #[prost(message, optional, tag = "2")]
        pub http: Option<HttpRequest>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct HttpRequest {
        #[prost(string, tag = "1")]
        pub id: String,
        #[prost(string, tag = "2")]
        pub method: String,
        #[prost(map = "string, string", tag = "3")]
        pub headers: HashMap<String, String>,
        /// The request target, including the query string.
        #[prost(string, tag = "4")]
        pub path: String,
        #[prost(string, tag = "5")]
        pub host: String,
        #[prost(string, tag = "6")]
        pub scheme: String,
        #[prost(string, tag = "10")]
        pub protocol: String,
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CheckResponse {
    #[prost(message, optional, tag = "1")]
    pub status: Option<rpc::Status>,
    #[prost(oneof = "check_response::HttpResponse", tags = "2, 3")]
    pub http_response: Option<check_response::HttpResponse>,
}

pub mod check_response {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum HttpResponse {
        #[prost(message, tag = "2")]
        DeniedResponse(super::DeniedHttpResponse),
        #[prost(message, tag = "3")]
        OkResponse(super::OkHttpResponse),
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DeniedHttpResponse {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct OkHttpResponse {}

/// `google.rpc`
pub mod rpc {
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Status {
        #[prost(int32, tag = "1")]
        pub code: i32,
        #[prost(string, tag = "2")]
        pub message: String,
    }
}

pub mod authorization_server {
    use super::{CheckRequest, CheckResponse};
    use tonic::codegen::*;

    pub const SERVICE_NAME: &str = "envoy.service.auth.v3.Authorization";

    const CHECK_PATH: &str = "/envoy.service.auth.v3.Authorization/Check";

    /// Performs authorization checks for proxied requests.
    #[async_trait]
    pub trait Authorization: Send + Sync + 'static {
        async fn check(
            &self,
            request: tonic::Request<CheckRequest>,
        ) -> Result<tonic::Response<CheckResponse>, tonic::Status>;
    }

    #[derive(Debug)]
    pub struct AuthorizationServer<T>(Arc<T>);

    struct CheckSvc<T>(Arc<T>);

    // === impl AuthorizationServer ===

    impl<T> AuthorizationServer<T> {
        pub fn new(inner: T) -> Self {
            Self(Arc::new(inner))
        }
    }

    impl<T> Clone for AuthorizationServer<T> {
        fn clone(&self) -> Self {
            Self(self.0.clone())
        }
    }

    impl<T, B> Service<http::Request<B>> for AuthorizationServer<T>
    where
        T: Authorization,
        B: Body + Send + 'static,
        B::Error: Into<StdError> + Send + 'static,
    {
        type Response = http::Response<tonic::body::Body>;
        type Error = std::convert::Infallible;
        type Future = BoxFuture<Self::Response, Self::Error>;

        fn poll_ready(&mut self, _: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }

        fn call(&mut self, req: http::Request<B>) -> Self::Future {
            if req.uri().path() != CHECK_PATH {
                return Box::pin(async move { Ok(unimplemented()) });
            }

            let inner = self.0.clone();
            Box::pin(async move {
                let mut grpc = tonic::server::Grpc::new(tonic::codec::ProstCodec::default());
                Ok(grpc.unary(CheckSvc(inner), req).await)
            })
        }
    }

    impl<T> tonic::server::NamedService for AuthorizationServer<T> {
        const NAME: &'static str = SERVICE_NAME;
    }

    // === impl CheckSvc ===

    impl<T: Authorization> tonic::server::UnaryService<CheckRequest> for CheckSvc<T> {
        type Response = CheckResponse;
        type Future = BoxFuture<tonic::Response<CheckResponse>, tonic::Status>;

        fn call(&mut self, request: tonic::Request<CheckRequest>) -> Self::Future {
            let inner = self.0.clone();
            Box::pin(async move { inner.check(request).await })
        }
    }

    fn unimplemented() -> http::Response<tonic::body::Body> {
        let mut rsp = http::Response::new(tonic::body::Body::default());
        let headers = rsp.headers_mut();
        headers.insert(
            tonic::Status::GRPC_STATUS,
            (tonic::Code::Unimplemented as i32).into(),
        );
        headers.insert(
            http::header::CONTENT_TYPE,
            tonic::metadata::GRPC_CONTENT_TYPE,
        );
        rsp
    }
}
