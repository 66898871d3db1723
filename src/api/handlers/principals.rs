use axum::{
    Json,
    extract::{Extension, rejection::JsonRejection},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use secrecy::SecretString;
use serde::Deserialize;
use std::sync::Arc;
use utoipa::ToSchema;

use super::utils::payload;
use crate::{
    api::{
        error::{ApiError, ErrorBody},
        state::ApiState,
    },
    authority::Principal,
};

#[derive(Deserialize, ToSchema)]
pub struct RegisterRequest {
    pub username: String,
    #[schema(format = Password)]
    pub password: String,
}

#[utoipa::path(
    post,
    path = "/principals",
    request_body = RegisterRequest,
    responses(
        (status = 201, description = "Principal registered", body = Principal),
        (status = 400, description = "Invalid username or password", body = ErrorBody),
        (status = 409, description = "Username taken", body = ErrorBody)
    ),
    tag = "principals"
)]
pub async fn register(
    headers: HeaderMap,
    state: Extension<Arc<ApiState>>,
    request: Result<Json<RegisterRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let request = payload(request).map_err(|e| ApiError::new(e, &headers))?;
    let password = SecretString::from(request.password);
    let principal = state
        .authority()
        .register(&request.username, &password)
        .await
        .map_err(|e| ApiError::new(e, &headers))?;

    Ok((StatusCode::CREATED, Json(principal)).into_response())
}
