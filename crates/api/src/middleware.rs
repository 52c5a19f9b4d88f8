use axum::{
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::Response,
};

use studyforge_core::UserId;

use crate::context::UserContext;

/// Header carrying the caller id, set by the authentication proxy in front of us.
pub const USER_ID_HEADER: &str = "x-user-id";

pub async fn user_context_middleware(
    mut req: axum::http::Request<axum::body::Body>,
    next: Next,
) -> Result<Response, StatusCode> {
    let user_id = extract_user_id(req.headers())?;

    req.extensions_mut().insert(UserContext::new(user_id));

    Ok(next.run(req).await)
}

fn extract_user_id(headers: &HeaderMap) -> Result<UserId, StatusCode> {
    let header = headers
        .get(USER_ID_HEADER)
        .ok_or(StatusCode::UNAUTHORIZED)?;

    let header = header.to_str().map_err(|_| StatusCode::UNAUTHORIZED)?;

    let raw = header.trim();
    if raw.is_empty() {
        return Err(StatusCode::UNAUTHORIZED);
    }

    raw.parse::<UserId>().map_err(|_| StatusCode::UNAUTHORIZED)
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;

    #[test]
    fn missing_or_malformed_header_is_unauthorized() {
        let mut headers = HeaderMap::new();
        assert_eq!(extract_user_id(&headers), Err(StatusCode::UNAUTHORIZED));

        headers.insert(USER_ID_HEADER, HeaderValue::from_static("   "));
        assert_eq!(extract_user_id(&headers), Err(StatusCode::UNAUTHORIZED));

        headers.insert(USER_ID_HEADER, HeaderValue::from_static("user-42"));
        assert_eq!(extract_user_id(&headers), Err(StatusCode::UNAUTHORIZED));
    }

    #[test]
    fn uuid_header_resolves_user() {
        let user = UserId::new();
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_ID_HEADER,
            HeaderValue::from_str(&user.to_string()).unwrap(),
        );
        assert_eq!(extract_user_id(&headers), Ok(user));
    }
}
