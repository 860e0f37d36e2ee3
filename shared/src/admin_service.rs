//! Health and readiness endpoints served on the admin listener.
use crate::http::make_boxed_error_response;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::service::Service;
use hyper::{Request, Response, StatusCode};
use std::convert::Infallible;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Readiness {
    /// Still loading. Healthy but not ready.
    Starting,
    Ready,
    /// Stopped serving for good. Neither healthy nor ready.
    Failed,
}

impl Readiness {
    fn health_status(&self) -> StatusCode {
        match self {
            Readiness::Starting | Readiness::Ready => StatusCode::OK,
            Readiness::Failed => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn ready_status(&self) -> StatusCode {
        match self {
            Readiness::Ready => StatusCode::OK,
            Readiness::Starting => StatusCode::SERVICE_UNAVAILABLE,
            Readiness::Failed => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

pub struct AdminService<F, E> {
    readiness: F,
    _error: PhantomData<E>,
}

impl<F, E> AdminService<F, E>
where
    F: Fn() -> Readiness,
{
    pub fn new(readiness: F) -> Self {
        Self {
            readiness,
            _error: PhantomData,
        }
    }

    fn respond(&self, path: &str) -> Response<BoxBody<Bytes, Infallible>> {
        let readiness = (self.readiness)();
        let status = match path {
            "/health" => readiness.health_status(),
            "/ready" => readiness.ready_status(),
            _ => StatusCode::NOT_FOUND,
        };
        match status {
            StatusCode::OK => Response::new(Full::new(Bytes::from("ok\n")).boxed()),
            _ => make_boxed_error_response(status),
        }
    }
}

impl<F, E> Service<Request<Incoming>> for AdminService<F, E>
where
    F: Fn() -> Readiness + Send + 'static,
    E: Send + 'static,
{
    type Response = Response<BoxBody<Bytes, Infallible>>;
    type Error = E;
    type Future =
        Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send + 'static>>;

    fn call(&self, req: Request<Incoming>) -> Self::Future {
        let response = self.respond(req.uri().path());
        Box::pin(async move { Ok(response) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    fn status(readiness: Readiness, path: &str) -> StatusCode {
        AdminService::<_, io::Error>::new(move || readiness)
            .respond(path)
            .status()
    }

    #[test]
    fn test_probes() {
        assert_eq!(status(Readiness::Starting, "/health"), StatusCode::OK);
        assert_eq!(
            status(Readiness::Starting, "/ready"),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(status(Readiness::Ready, "/ready"), StatusCode::OK);
        assert_eq!(
            status(Readiness::Failed, "/health"),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(status(Readiness::Ready, "/metrics"), StatusCode::NOT_FOUND);
    }
}
