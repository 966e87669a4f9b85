mod parser;
mod types;

pub use parser::{ParseStatus, RequestParser, ResponseParser};
pub use types::{
    BodyFraming, Header, HttpVersion, Limits, ParseError, ParseErrorKind, ParseWarning,
    ParseWarningKind, Request, RequestLine, Response, StatusLine, find_header,
};
