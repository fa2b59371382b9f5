//! Bearer-token authentication
//!
//! Two static tokens exist: the consumer token guards the claim/release/read
//! scope, the admin token guards `/admin`. Each scope wraps its own
//! `BearerAuth` instance. Runs after the rate limiter, so bad tokens still
//! spend tokens.

use std::sync::Arc;

use actix_web::{
    body::EitherBody,
    dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform},
    error::ResponseError,
    Error, HttpMessage,
};
use futures::future::LocalBoxFuture;
use std::future::{ready, Ready};

use crate::error::ApiError;
use crate::middleware::request_id::RequestId;

#[derive(Clone)]
pub struct BearerAuth {
    token: Arc<String>,
}

impl BearerAuth {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: Arc::new(token.into()),
        }
    }
}

impl<S, B> Transform<S, ServiceRequest> for BearerAuth
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = Error;
    type Transform = BearerAuthService<S>;
    type InitError = ();
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(BearerAuthService {
            service,
            token: self.token.clone(),
        }))
    }
}

pub struct BearerAuthService<S> {
    service: S,
    token: Arc<String>,
}

impl<S, B> Service<ServiceRequest> for BearerAuthService<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let presented = req
            .headers()
            .get("Authorization")
            .and_then(|h| h.to_str().ok())
            .and_then(|h| h.strip_prefix("Bearer "));

        if presented != Some(self.token.as_str()) {
            let request_id = req
                .extensions()
                .get::<RequestId>()
                .map(|id| id.0.clone())
                .unwrap_or_default();
            let response = ApiError::unauthorized(&request_id).error_response();
            return Box::pin(ready(Ok(req.into_response(response).map_into_right_body())));
        }

        let fut = self.service.call(req);
        Box::pin(async move { fut.await.map(|res| res.map_into_left_body()) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::{test, web, App, HttpResponse};

    #[actix_web::test]
    async fn test_valid_token_admitted() {
        let app = test::init_service(
            App::new()
                .wrap(BearerAuth::new("secret"))
                .route("/", web::get().to(HttpResponse::Ok)),
        )
        .await;
        let res = test::call_service(
            &app,
            test::TestRequest::get()
                .uri("/")
                .insert_header(("Authorization", "Bearer secret"))
                .to_request(),
        )
        .await;
        assert!(res.status().is_success());
    }

    #[actix_web::test]
    async fn test_missing_or_wrong_token_rejected() {
        let app = test::init_service(
            App::new()
                .wrap(BearerAuth::new("secret"))
                .route("/", web::get().to(HttpResponse::Ok)),
        )
        .await;

        let res = test::call_service(&app, test::TestRequest::get().uri("/").to_request()).await;
        assert_eq!(res.status().as_u16(), 401);

        let res = test::call_service(
            &app,
            test::TestRequest::get()
                .uri("/")
                .insert_header(("Authorization", "Bearer nope"))
                .to_request(),
        )
        .await;
        assert_eq!(res.status().as_u16(), 401);

        let res = test::call_service(
            &app,
            test::TestRequest::get()
                .uri("/")
                .insert_header(("Authorization", "Basic secret"))
                .to_request(),
        )
        .await;
        assert_eq!(res.status().as_u16(), 401);
    }
}
