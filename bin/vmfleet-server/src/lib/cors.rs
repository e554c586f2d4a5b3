// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Cross-origin access to the VM API.
//!
//! Any origin is accepted: it is echoed back in `Access-Control-Allow-Origin`.
//! Preflight requests are answered with the methods of the requested path and
//! whatever headers the client asked to send.

use dropshot::{Body, HttpCodedResponse, HttpError, HttpResponseHeaders};
use http::header::{
    ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_METHODS,
    ACCESS_CONTROL_ALLOW_ORIGIN, ACCESS_CONTROL_REQUEST_HEADERS, ORIGIN, VARY,
};
use http::{HeaderMap, HeaderValue, Response, StatusCode};

/// Wraps `response` with the CORS headers for a request carrying
/// `request_headers`.
pub(crate) fn allow_origin<T: HttpCodedResponse>(
    request_headers: &HeaderMap,
    response: T,
) -> HttpResponseHeaders<T> {
    let mut response = HttpResponseHeaders::new_unnamed(response);
    if let Some(origin) = request_headers.get(ORIGIN) {
        let headers = response.headers_mut();
        headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, origin.clone());
        headers.insert(VARY, HeaderValue::from_static("Origin"));
    }
    response
}

/// Answers a preflight request for a path that supports `methods`.
pub(crate) fn preflight(
    request_headers: &HeaderMap,
    methods: &'static str,
) -> Result<Response<Body>, HttpError> {
    let mut builder = Response::builder()
        .status(StatusCode::NO_CONTENT)
        .header(ACCESS_CONTROL_ALLOW_METHODS, methods);
    if let Some(origin) = request_headers.get(ORIGIN) {
        builder = builder
            .header(ACCESS_CONTROL_ALLOW_ORIGIN, origin.clone())
            .header(VARY, "Origin");
    }
    if let Some(requested) = request_headers.get(ACCESS_CONTROL_REQUEST_HEADERS)
    {
        builder = builder.header(ACCESS_CONTROL_ALLOW_HEADERS, requested.clone());
    }
    Ok(builder.body(Body::empty())?)
}
