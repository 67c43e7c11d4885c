/// Bearer-token authentication middleware.
///
/// Every request under the API scope carries a bearer token that is looked up
/// in `api_tokens`. The resolved `AuthContext` (token id, scopes, rate limit)
/// is inserted into request extensions; handlers check scopes with
/// [`require_scope`]. Rate-limit enforcement itself lives with the gateway
/// collaborator, the context only carries the per-token budget.

use actix_web::{
    dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform},
    Error, HttpMessage,
};
use futures::future::{ready, Ready};
use sqlx::{PgPool, Row};
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;

use crate::error::AppError;
use crate::models::AuthContext;

pub struct BearerAuthMiddleware {
    pool: PgPool,
}

impl BearerAuthMiddleware {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

impl<S, B> Transform<S, ServiceRequest> for BearerAuthMiddleware
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type Transform = BearerAuthMiddlewareService<S>;
    type InitError = ();
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(BearerAuthMiddlewareService {
            service: Rc::new(service),
            pool: self.pool.clone(),
        }))
    }
}

pub struct BearerAuthMiddlewareService<S> {
    service: Rc<S>,
    pool: PgPool,
}

impl<S, B> Service<ServiceRequest> for BearerAuthMiddlewareService<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>>>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let service = self.service.clone();
        let pool = self.pool.clone();

        Box::pin(async move {
            let auth_header = req
                .headers()
                .get("Authorization")
                .and_then(|h| h.to_str().ok())
                .ok_or_else(|| {
                    Error::from(AppError::Unauthorized(
                        "missing Authorization header".to_string(),
                    ))
                })?;

            let token = auth_header.strip_prefix("Bearer ").ok_or_else(|| {
                Error::from(AppError::Unauthorized(
                    "invalid Authorization header format".to_string(),
                ))
            })?;

            let row = sqlx::query(
                r#"
                SELECT id, scopes, rate_limit
                FROM api_tokens
                WHERE token = $1
                  AND is_active = TRUE
                  AND (expires_at IS NULL OR expires_at > NOW())
                "#,
            )
            .bind(token)
            .fetch_optional(&pool)
            .await
            .map_err(|e| Error::from(AppError::from(e)))?
            .ok_or_else(|| {
                Error::from(AppError::Unauthorized("invalid or expired token".to_string()))
            })?;

            let token_id: i64 = row
                .try_get("id")
                .map_err(|e| Error::from(AppError::from(e)))?;
            let scopes_value: serde_json::Value = row
                .try_get("scopes")
                .map_err(|e| Error::from(AppError::from(e)))?;
            let rate_limit: Option<i32> = row
                .try_get("rate_limit")
                .map_err(|e| Error::from(AppError::from(e)))?;

            let scopes: Vec<String> = serde_json::from_value(scopes_value).unwrap_or_default();

            // Usage stamp is bookkeeping only; never block the request on it.
            let pool_for_stamp = pool.clone();
            tokio::spawn(async move {
                let result =
                    sqlx::query("UPDATE api_tokens SET last_used_at = NOW() WHERE id = $1")
                        .bind(token_id)
                        .execute(&pool_for_stamp)
                        .await;
                if let Err(e) = result {
                    tracing::warn!("Failed to stamp token usage: {}", e);
                }
            });

            req.extensions_mut().insert(AuthContext {
                token_id,
                scopes,
                rate_limit,
            });

            service.call(req).await
        })
    }
}

/// FromRequest implementation for AuthContext
impl actix_web::FromRequest for AuthContext {
    type Error = actix_web::Error;
    type Future = Ready<Result<Self, Self::Error>>;

    fn from_request(
        req: &actix_web::HttpRequest,
        _payload: &mut actix_web::dev::Payload,
    ) -> Self::Future {
        match req.extensions().get::<AuthContext>() {
            Some(ctx) => ready(Ok(ctx.clone())),
            None => ready(Err(Error::from(AppError::Unauthorized(
                "request is not authenticated".to_string(),
            )))),
        }
    }
}

/// Scope check used at the top of each handler.
pub fn require_scope(ctx: &AuthContext, scope: &str) -> Result<(), AppError> {
    if ctx.has_scope(scope) {
        Ok(())
    } else {
        Err(AppError::Forbidden(format!(
            "token lacks required scope '{}'",
            scope
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scope_check_accepts_matching_scope() {
        let ctx = AuthContext {
            token_id: 1,
            scopes: vec!["experiments:read".to_string(), "analytics:read".to_string()],
            rate_limit: Some(100),
        };
        assert!(require_scope(&ctx, "analytics:read").is_ok());
    }

    #[test]
    fn scope_check_rejects_missing_scope() {
        let ctx = AuthContext {
            token_id: 1,
            scopes: vec!["experiments:read".to_string()],
            rate_limit: None,
        };
        assert!(matches!(
            require_scope(&ctx, "experiments:write"),
            Err(AppError::Forbidden(_))
        ));
    }
}
