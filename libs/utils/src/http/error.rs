use std::borrow::Cow;

use hyper::{header, Body, Response, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

/// Top level HTTP error type, to be returned from handlers. The router's
/// error handler converts it into a JSON response body.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Bad request: {0:#}")]
    BadRequest(anyhow::Error),

    #[error("NotFound: {0}")]
    NotFound(anyhow::Error),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Resource temporarily unavailable: {0}")]
    ResourceUnavailable(Cow<'static, str>),

    #[error("Shutting down")]
    ShuttingDown,

    /// Deliberate non-response on the public token path: the status line is
    /// the nginx 444 convention and the connection is closed right after it,
    /// to keep probing responses uniform and empty.
    #[error("Connection drop")]
    ConnectionDrop,

    #[error(transparent)]
    InternalServerError(anyhow::Error),
}

impl ApiError {
    pub fn into_response(self) -> Response<Body> {
        match self {
            ApiError::BadRequest(err) => HttpErrorBody::response_from_msg_and_status(
                format!("{err:#}"),
                StatusCode::BAD_REQUEST,
            ),
            ApiError::NotFound(err) => HttpErrorBody::response_from_msg_and_status(
                err.to_string(),
                StatusCode::NOT_FOUND,
            ),
            ApiError::Conflict(message) => {
                HttpErrorBody::response_from_msg_and_status(message, StatusCode::CONFLICT)
            }
            ApiError::ResourceUnavailable(message) => HttpErrorBody::response_from_msg_and_status(
                message.into_owned(),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            ApiError::ShuttingDown => HttpErrorBody::response_from_msg_and_status(
                "Shutting down".to_string(),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            ApiError::ConnectionDrop => connection_drop_response(),
            ApiError::InternalServerError(err) => HttpErrorBody::response_from_msg_and_status(
                err.to_string(),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        }
    }
}

/// Empty-bodied response with the non-standard 444 status and
/// `Connection: close`, so the peer learns nothing beyond the drop itself.
pub fn connection_drop_response() -> Response<Body> {
    Response::builder()
        .status(StatusCode::from_u16(444).expect("444 is in the valid status range"))
        .header(header::CONNECTION, "close")
        .body(Body::empty())
        .expect("building an empty response cannot fail")
}

#[derive(Serialize, Deserialize)]
pub struct HttpErrorBody {
    pub msg: String,
}

impl HttpErrorBody {
    pub fn from_msg(msg: String) -> Self {
        HttpErrorBody { msg }
    }

    pub fn response_from_msg_and_status(msg: String, status: StatusCode) -> Response<Body> {
        HttpErrorBody { msg }.to_response(status)
    }

    pub fn to_response(&self, status: StatusCode) -> Response<Body> {
        Response::builder()
            .status(status)
            .header(header::CONTENT_TYPE, "application/json")
            // we do not have nested maps with non string keys so serialization shouldn't fail
            .body(Body::from(serde_json::to_string(self).unwrap()))
            .unwrap()
    }
}

pub async fn route_error_handler(err: routerify::RouteError) -> Response<Body> {
    match err.downcast::<ApiError>() {
        Ok(api_error) => api_error_handler(*api_error),
        Err(other_error) => {
            // We expect all the request handlers to return an ApiError, so this should
            // not be reached. But just in case.
            error!("Error processing HTTP request: {other_error:?}");
            HttpErrorBody::response_from_msg_and_status(
                other_error.to_string(),
                StatusCode::INTERNAL_SERVER_ERROR,
            )
        }
    }
}

pub fn api_error_handler(api_error: ApiError) -> Response<Body> {
    // Print a stack trace for Internal Server errors
    match &api_error {
        ApiError::InternalServerError(err) => error!("Error processing HTTP request: {err:?}"),
        ApiError::ResourceUnavailable(_) | ApiError::ShuttingDown => {
            warn!("Error processing HTTP request: {api_error:#}")
        }
        ApiError::ConnectionDrop => info!("Dropping connection on invalid token"),
        _ => info!("Error processing HTTP request: {api_error:#}"),
    }

    api_error.into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bad_request_maps_to_400() {
        let resp = ApiError::BadRequest(anyhow::anyhow!("boom")).into_response();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn connection_drop_is_444_and_close() {
        let resp = ApiError::ConnectionDrop.into_response();
        assert_eq!(resp.status().as_u16(), 444);
        assert_eq!(resp.headers().get(header::CONNECTION).unwrap(), "close");
    }
}
