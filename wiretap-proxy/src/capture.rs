use std::borrow::Cow;
use std::collections::BTreeMap;
use std::io::Read;

use cookie::Cookie;
use flate2::read::GzDecoder;
use percent_encoding::percent_decode_str;
use tracing::debug;
use url::form_urlencoded;

use wiretap_net::{Header, Response, find_header};
use wiretap_storage::{ParamValue, ParsedRequest, ParsedResponse};

use crate::forward::ForwardRequest;

const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";

pub fn normalize_request(request: &ForwardRequest) -> ParsedRequest {
    let body = String::from_utf8_lossy(&request.body).into_owned();
    let post_params = if carries_form(request) {
        group_params(form_urlencoded::parse(&request.body))
    } else {
        BTreeMap::new()
    };

    ParsedRequest {
        method: request.method.clone(),
        path: percent_decode_str(request.url.path())
            .decode_utf8_lossy()
            .into_owned(),
        get_params: group_params(request.url.query_pairs()),
        headers: join_headers(&request.headers),
        cookies: parse_cookies(&request.headers),
        post_params,
        raw_request: raw_request_text(request, &body),
        body,
        host: request.host.clone(),
    }
}

/// `body` is the payload after content decoding, see [`decode_body`].
pub fn normalize_response(response: &Response, body: &[u8]) -> ParsedResponse {
    let line = &response.line;
    ParsedResponse {
        status_code: line.status_code,
        status_line: format!("{} {}", line.status_code, line.reason)
            .trim_end()
            .to_string(),
        headers: join_headers(&response.headers),
        body: String::from_utf8_lossy(body).into_owned(),
    }
}

/// Undoes gzip content coding. Bodies that are not gzip, or fail to
/// decompress, come back borrowed and untouched.
pub fn decode_body(response: &Response) -> Cow<'_, [u8]> {
    let gzip = find_header(&response.headers, "Content-Encoding")
        .is_some_and(|header| header.value.trim().eq_ignore_ascii_case("gzip"));
    if !gzip || response.body.is_empty() {
        return Cow::Borrowed(&response.body);
    }

    let mut decoded = Vec::new();
    match GzDecoder::new(response.body.as_slice()).read_to_end(&mut decoded) {
        Ok(_) => Cow::Owned(decoded),
        Err(err) => {
            debug!(error = %err, "gzip body did not decode, keeping raw bytes");
            Cow::Borrowed(&response.body)
        }
    }
}

fn carries_form(request: &ForwardRequest) -> bool {
    if !matches!(request.method.as_str(), "POST" | "PUT" | "PATCH") {
        return false;
    }
    find_header(&request.headers, "Content-Type").is_some_and(|header| {
        header
            .value
            .split(';')
            .next()
            .is_some_and(|media| media.trim().eq_ignore_ascii_case(FORM_CONTENT_TYPE))
    })
}

fn group_params<'a>(pairs: impl Iterator<Item = (Cow<'a, str>, Cow<'a, str>)>) -> BTreeMap<String, ParamValue> {
    let mut grouped: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (key, value) in pairs {
        grouped.entry(key.into_owned()).or_default().push(value.into_owned());
    }
    grouped
        .into_iter()
        .map(|(key, values)| (key, ParamValue::from_values(values)))
        .collect()
}

fn join_headers(headers: &[Header]) -> BTreeMap<String, String> {
    let mut joined: BTreeMap<String, String> = BTreeMap::new();
    for header in headers {
        let value = header.value.trim();
        joined
            .entry(canonical_name(&header.name))
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(value);
            })
            .or_insert_with(|| value.to_string());
    }
    joined
}

/// `content-type` becomes `Content-Type`.
fn canonical_name(name: &str) -> String {
    name.trim()
        .split('-')
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => {
                    first.to_ascii_uppercase().to_string() + &chars.as_str().to_ascii_lowercase()
                }
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join("-")
}

/// Later cookies with the same name win.
fn parse_cookies(headers: &[Header]) -> BTreeMap<String, String> {
    let mut cookies = BTreeMap::new();
    for header in headers.iter().filter(|header| header.is("Cookie")) {
        for cookie in Cookie::split_parse(header.value.as_str()).flatten() {
            cookies.insert(
                cookie.name().to_string(),
                cookie.value().trim_matches('"').to_string(),
            );
        }
    }
    cookies
}

fn raw_request_text(request: &ForwardRequest, body: &str) -> String {
    let mut raw = format!(
        "{} {} {}\r\n",
        request.method,
        request.request_uri(),
        request.version.as_str()
    );
    for header in &request.headers {
        raw.push_str(&header.name);
        raw.push_str(": ");
        raw.push_str(&header.value);
        raw.push_str("\r\n");
    }
    raw.push_str("\r\n");
    raw.push_str(body);
    raw
}

#[cfg(test)]
mod tests {
    use std::borrow::Cow;
    use std::io::Write;
    use std::net::SocketAddr;

    use flate2::Compression;
    use flate2::write::GzEncoder;
    use wiretap_net::{BodyFraming, Header, HttpVersion, ParseStatus, RequestParser, Response, StatusLine};
    use wiretap_storage::ParamValue;

    use super::{canonical_name, decode_body, normalize_request, normalize_response};
    use crate::forward::ForwardRequest;

    fn forward(raw: &str) -> ForwardRequest {
        let request = match RequestParser::new().push(raw.as_bytes()) {
            ParseStatus::Complete { message, .. } => message,
            other => panic!("unexpected parse status: {other:?}"),
        };
        let client: SocketAddr = "127.0.0.1:40000".parse().unwrap();
        ForwardRequest::from_parsed(request, client).unwrap()
    }

    fn response(headers: Vec<Header>, body: Vec<u8>) -> Response {
        Response {
            line: StatusLine {
                version: HttpVersion::Http11,
                status_code: 200,
                reason: "OK".to_string(),
            },
            headers,
            body,
            framing: BodyFraming::ContentLength,
        }
    }

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    #[test]
    fn simple_get_is_normalized() {
        let parsed = normalize_request(&forward(
            "GET http://example.com/foo?a=1 HTTP/1.1\r\nCookie: id=9\r\n\r\n",
        ));
        assert_eq!(parsed.method, "GET");
        assert_eq!(parsed.path, "/foo");
        assert_eq!(parsed.host, "example.com");
        assert_eq!(parsed.get_params.get("a"), Some(&ParamValue::from("1")));
        assert_eq!(parsed.cookies.get("id").map(String::as_str), Some("9"));
        assert!(parsed.post_params.is_empty());
        assert!(parsed.body.is_empty());
    }

    #[test]
    fn repeated_query_keys_become_lists() {
        let parsed = normalize_request(&forward(
            "GET http://example.com/?a=1&a=2&b=x%20y HTTP/1.1\r\n\r\n",
        ));
        assert_eq!(
            parsed.get_params.get("a"),
            Some(&ParamValue::Multiple(vec!["1".to_string(), "2".to_string()]))
        );
        assert_eq!(parsed.get_params.get("b"), Some(&ParamValue::from("x y")));
    }

    #[test]
    fn form_body_fills_post_params() {
        let parsed = normalize_request(&forward(
            "POST http://example.com/login HTTP/1.1\r\nContent-Type: application/x-www-form-urlencoded; charset=utf-8\r\nContent-Length: 11\r\n\r\nx=1&x=2&y=z",
        ));
        assert_eq!(
            parsed.post_params.get("x"),
            Some(&ParamValue::Multiple(vec!["1".to_string(), "2".to_string()]))
        );
        assert_eq!(parsed.post_params.get("y"), Some(&ParamValue::from("z")));
        assert_eq!(parsed.body, "x=1&x=2&y=z");
    }

    #[test]
    fn json_body_has_no_post_params() {
        let parsed = normalize_request(&forward(
            "POST http://example.com/api HTTP/1.1\r\nContent-Type: application/json\r\nContent-Length: 7\r\n\r\n{\"a\":1}",
        ));
        assert!(parsed.post_params.is_empty());
        assert_eq!(parsed.body, "{\"a\":1}");
    }

    #[test]
    fn repeated_headers_are_joined() {
        let parsed = normalize_request(&forward(
            "GET http://example.com/ HTTP/1.1\r\naccept: text/html\r\nAccept: */*\r\n\r\n",
        ));
        assert_eq!(parsed.headers.get("Accept").map(String::as_str), Some("text/html, */*"));
    }

    #[test]
    fn last_cookie_wins() {
        let parsed = normalize_request(&forward(
            "GET http://example.com/ HTTP/1.1\r\nCookie: id=1; theme=\"dark\"\r\nCookie: id=2\r\n\r\n",
        ));
        assert_eq!(parsed.cookies.get("id").map(String::as_str), Some("2"));
        assert_eq!(parsed.cookies.get("theme").map(String::as_str), Some("dark"));
    }

    #[test]
    fn raw_request_text_is_replayable() {
        let parsed = normalize_request(&forward(
            "GET http://example.com/foo?a=1 HTTP/1.1\r\nUser-Agent: t\r\n\r\n",
        ));
        assert_eq!(
            parsed.raw_request,
            "GET /foo?a=1 HTTP/1.1\r\nHost: example.com\r\nUser-Agent: t\r\nX-Forwarded-For: 127.0.0.1:40000\r\n\r\n"
        );
    }

    #[test]
    fn gzip_body_is_decoded() {
        let response = response(vec![Header::new("Content-Encoding", "gzip")], gzip(b"hello"));
        let body = decode_body(&response);
        assert!(matches!(body, Cow::Owned(_)));
        let parsed = normalize_response(&response, &body);
        assert_eq!(parsed.body, "hello");
        assert_eq!(parsed.status_code, 200);
        assert_eq!(parsed.status_line, "200 OK");
        assert_eq!(parsed.headers.get("Content-Encoding").map(String::as_str), Some("gzip"));
    }

    #[test]
    fn corrupt_gzip_falls_back_to_raw() {
        let response = response(vec![Header::new("Content-Encoding", "gzip")], b"not gzip".to_vec());
        assert_eq!(decode_body(&response).as_ref(), b"not gzip");
    }

    #[test]
    fn identity_body_is_borrowed() {
        let response = response(Vec::new(), b"plain".to_vec());
        assert!(matches!(decode_body(&response), Cow::Borrowed(body) if body == b"plain"));
    }

    #[test]
    fn canonicalizes_header_names() {
        assert_eq!(canonical_name("content-type"), "Content-Type");
        assert_eq!(canonical_name("X-FORWARDED-FOR"), "X-Forwarded-For");
    }
}
