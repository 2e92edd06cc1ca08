use std::fmt;

/// HTTP protocol version of a message.
#[derive(Debug, Clone, PartialEq, Eq, Copy)]
pub enum Version {
    Http10,
    Http11,
}

impl Version {
    /// Parse the version token of a start line.
    ///
    /// Unknown `HTTP/1.x` minors are treated as HTTP/1.1, the way any
    /// 1.1 peer must treat them. Anything else is unparseable.
    pub fn parse(token: &str) -> Option<Version> {
        match token {
            "HTTP/1.0" => Some(Version::Http10),
            "HTTP/1.1" => Some(Version::Http11),
            _ => {
                if token.starts_with("HTTP/1.")
                    && token["HTTP/1.".len()..].parse::<u32>().is_ok()
                {
                    Some(Version::Http11)
                } else {
                    None
                }
            }
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Version::Http10 => f.write_str("HTTP/1.0"),
            Version::Http11 => f.write_str("HTTP/1.1"),
        }
    }
}

#[cfg(test)]
mod test {
    use super::Version;

    #[test]
    fn parse() {
        assert_eq!(Version::parse("HTTP/1.0"), Some(Version::Http10));
        assert_eq!(Version::parse("HTTP/1.1"), Some(Version::Http11));
        assert_eq!(Version::parse("HTTP/1.7"), Some(Version::Http11));
        assert_eq!(Version::parse("HTTP/2.0"), None);
        assert_eq!(Version::parse("HTTP/"), None);
        assert_eq!(Version::parse("ICY"), None);
    }

    #[test]
    fn display() {
        assert_eq!(format!("{}", Version::Http10), "HTTP/1.0");
        assert_eq!(format!("{}", Version::Http11), "HTTP/1.1");
    }
}
