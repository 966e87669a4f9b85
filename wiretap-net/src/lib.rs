mod http1;
mod tls;

pub use http1::{
    BodyFraming, Header, HttpVersion, Limits, ParseError, ParseErrorKind, ParseStatus,
    ParseWarning, ParseWarningKind, Request, RequestLine, RequestParser, Response, ResponseParser,
    StatusLine, find_header,
};

pub use tls::{
    CertCache, CertLookup, CertificateStore, ForgedCertificate, LEAF_ORGANIZATION, RootAuthority,
    TlsConfig, TlsError, TlsErrorKind, build_acceptor, build_connector, forge_leaf, generate_ca,
};
