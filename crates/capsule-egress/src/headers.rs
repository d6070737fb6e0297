//! Header allowlists for both directions of a proxied call.

use reqwest::header::{self, HeaderMap, HeaderName, HeaderValue};

/// Request headers forwarded upstream.
pub const REQUEST_HEADERS: &[&str] = &[
    "accept",
    "accept-language",
    "cache-control",
    "content-language",
    "content-type",
    "if-match",
    "if-modified-since",
    "if-none-match",
    "range",
];

/// Response headers forwarded back to the caller.
pub const RESPONSE_HEADERS: &[&str] = &[
    "accept-ranges",
    "cache-control",
    "content-language",
    "content-range",
    "content-type",
    "etag",
    "expires",
    "last-modified",
    "vary",
];

fn filter(source: &HeaderMap, allowed: &[&str]) -> HeaderMap {
    let mut out = HeaderMap::new();
    for (name, value) in source {
        if name == header::SET_COOKIE || name == header::COOKIE {
            continue;
        }
        if allowed.contains(&name.as_str()) {
            out.append(name.clone(), value.clone());
        }
    }
    out
}

pub fn filter_request_headers(headers: &HeaderMap) -> HeaderMap {
    filter(headers, REQUEST_HEADERS)
}

pub fn filter_response_headers(headers: &HeaderMap) -> HeaderMap {
    filter(headers, RESPONSE_HEADERS)
}

/// Permissive CORS on proxy responses.
pub fn apply_cors(headers: &mut HeaderMap) {
    headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("GET, HEAD, POST, OPTIONS"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("authorization, content-type, accept"),
    );
    let exposed = RESPONSE_HEADERS.join(", ");
    if let Ok(value) = HeaderValue::from_str(&exposed) {
        headers.insert(header::ACCESS_CONTROL_EXPOSE_HEADERS, value);
    }
    headers.insert(HeaderName::from_static("x-capsule-proxy"), HeaderValue::from_static("1"));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut h = HeaderMap::new();
        for (k, v) in pairs {
            h.append(HeaderName::from_static(k), HeaderValue::from_static(v));
        }
        h
    }

    #[test]
    fn request_filter_drops_credentials_and_hop_headers() {
        let out = filter_request_headers(&map(&[
            ("accept", "application/json"),
            ("authorization", "Bearer secret"),
            ("cookie", "session=1"),
            ("x-forwarded-for", "10.0.0.1"),
            ("host", "internal"),
            ("range", "bytes=0-10"),
        ]));
        assert_eq!(out.len(), 2);
        assert_eq!(out["accept"], "application/json");
        assert!(out.get("authorization").is_none());
        assert!(out.get("cookie").is_none());
    }

    #[test]
    fn response_filter_strips_set_cookie() {
        let out = filter_response_headers(&map(&[
            ("content-type", "text/plain"),
            ("set-cookie", "a=b"),
            ("set-cookie", "c=d"),
            ("server", "nginx"),
            ("etag", "\"v1\""),
        ]));
        assert!(out.get("set-cookie").is_none());
        assert!(out.get("server").is_none());
        assert_eq!(out["etag"], "\"v1\"");
    }

    #[test]
    fn cors_is_permissive() {
        let mut h = HeaderMap::new();
        apply_cors(&mut h);
        assert_eq!(h[header::ACCESS_CONTROL_ALLOW_ORIGIN], "*");
        assert!(h[header::ACCESS_CONTROL_EXPOSE_HEADERS].to_str().unwrap().contains("etag"));
    }
}
