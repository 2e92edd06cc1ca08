//! Ordered header sets and the small amount of header-value parsing
//! the protocol layers need.

/// Header names that are only meaningful for a single connection and
/// must be stripped when a message crosses a proxy boundary.
pub const HOP_BY_HOP: &[&str] = &[
    "connection", "keep-alive", "proxy-authenticate",
    "proxy-authorization", "te", "trailers", "transfer-encoding",
    "upgrade",
];

/// Methods that may be safely retried after an idle peer close.
pub const IDEMPOTENT_METHODS: &[&str] =
    &["GET", "HEAD", "PUT", "DELETE", "OPTIONS", "TRACE"];

/// Statuses whose responses never carry a body.
pub const NO_BODY_STATUS: &[u16] = &[100, 101, 204, 304];

pub fn is_idempotent(method: &str) -> bool {
    IDEMPOTENT_METHODS.iter().any(|&m| m == method)
}

pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.iter().any(|&h| name.eq_ignore_ascii_case(h))
}

/// True if a comma-separated header value contains `token`
/// (case-insensitive, surrounding whitespace ignored).
pub fn value_has_token(value: &str, token: &str) -> bool {
    value.split(',').any(|t| t.trim().eq_ignore_ascii_case(token))
}

/// An ordered sequence of `(name, value)` header fields.
///
/// Names compare case-insensitively. The relative order of fields is
/// preserved, which matters when headers are forwarded.
#[derive(Debug, Clone, Default)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
    pub fn new() -> Headers {
        Headers(Vec::new())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn push(&mut self, name: &str, value: &str) {
        self.0.push((name.to_string(), value.to_string()));
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|&(ref n, ref v)| (n.as_str(), v.as_str()))
    }

    /// First value of the named header, if any.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|&&(ref n, _)| n.eq_ignore_ascii_case(name))
            .map(|&(_, ref v)| v.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// All values of the named header, with comma-separated values
    /// split into individual trimmed tokens.
    ///
    /// Not safe for headers whose values may legitimately contain a
    /// comma (Set-Cookie, quoted strings).
    pub fn get_all<'x>(&'x self, name: &'x str)
        -> impl Iterator<Item = &'x str> + 'x
    {
        self.0
            .iter()
            .filter(move |&&(ref n, _)| n.eq_ignore_ascii_case(name))
            .flat_map(|&(_, ref v)| v.split(','))
            .map(|t| t.trim())
            .filter(|t| !t.is_empty())
    }

    /// True if the named header lists `token`.
    pub fn has_token(&self, name: &str, token: &str) -> bool {
        self.get_all(name).any(|t| t.eq_ignore_ascii_case(token))
    }

    /// Drop every hop-by-hop field, for forwarding across a proxy
    /// boundary.
    pub fn strip_hop_by_hop(&mut self) {
        self.0.retain(|&(ref n, _)| !is_hop_by_hop(n));
    }

    /// Drop every field with the given name.
    pub fn remove(&mut self, name: &str) {
        self.0.retain(|&(ref n, _)| !n.eq_ignore_ascii_case(name));
    }
}

impl<'x> From<&'x [(&'x str, &'x str)]> for Headers {
    fn from(pairs: &[(&str, &str)]) -> Headers {
        let mut h = Headers::new();
        for &(n, v) in pairs {
            h.push(n, v);
        }
        h
    }
}
