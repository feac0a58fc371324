use actix_web::{HttpResponse, HttpResponseBuilder};
pub use common::payloads::*;
use serde::Serialize;

pub trait ToHttpResponse {
    /// Wraps an ErrorablePayload in an HttpResponse.
    /// on_successful is the builder used for an ErrorablePayload::Ok response,
    /// e.g. HttpResponse::Created() for a new job.
    fn to_response(self, on_successful: HttpResponseBuilder) -> HttpResponse;
}

impl<T: Serialize> ToHttpResponse for ErrorablePayload<T> {
    fn to_response(self, mut on_successful: HttpResponseBuilder) -> HttpResponse {
        match self {
            ErrorablePayload::Ok(_) => on_successful.json(self),
            ErrorablePayload::NotFound => HttpResponse::NotFound().json(self),
            ErrorablePayload::Invalid(_) => HttpResponse::BadRequest().json(self),
            ErrorablePayload::Err(_) => HttpResponse::InternalServerError().json(self),
        }
    }
}
