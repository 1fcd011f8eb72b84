//! Status line parsing and reply classification.

/// Reply codes the client branches on.
pub mod code {
    pub const GREETING_POSTING_OK: u16 = 200;
    pub const GREETING_READ_ONLY: u16 = 201;
    pub const CLOSING: u16 = 205;
    pub const HEAD_FOLLOWS: u16 = 221;
    pub const BODY_FOLLOWS: u16 = 222;
    pub const ARTICLE_EXISTS: u16 = 223;
    pub const AUTH_ACCEPTED: u16 = 281;
    pub const PASSWORD_REQUIRED: u16 = 381;
    pub const NO_SUCH_ARTICLE_NUMBER: u16 = 420;
    pub const NO_NEXT_ARTICLE: u16 = 423;
    pub const NO_SUCH_ARTICLE: u16 = 430;
    pub const AUTH_REQUIRED: u16 = 480;
    pub const AUTH_REJECTED: u16 = 481;
    pub const AUTH_OUT_OF_SEQUENCE: u16 = 482;
    pub const NO_PERMISSION: u16 = 502;
}

/// One parsed status line.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Response {
    pub code: u16,
    /// Full line as received, trailing CRLF stripped.
    pub line: String,
}

impl Response {
    /// Parse a status line. `None` when the line does not begin with a
    /// three-digit code, which on this wire means the peer is not speaking
    /// NNTP at all.
    pub fn parse(line: &str) -> Option<Response> {
        let line = line.trim_end_matches(['\r', '\n']);
        let digits = line.get(..3)?;
        if !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        // "223" alone is valid; anything longer needs a separator.
        match line.as_bytes().get(3) {
            None | Some(b' ') => {}
            Some(_) => return None,
        }
        let code: u16 = digits.parse().ok()?;
        Some(Response {
            code,
            line: line.to_string(),
        })
    }

    pub fn class(&self) -> ResponseClass {
        ResponseClass::of(self.code)
    }
}

/// The reply space collapsed to what the layers above care about.
///
/// Exactly three of these govern article addressing: `ContentFollows`
/// (payload on the way), `Ok` with code 223 (exists, no payload), and
/// `Missing` (authoritative absence). Everything in `Auth` and `Fault` is a
/// server problem, not an article answer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResponseClass {
    /// Positive completion, no payload: greetings, 223, 281, 205.
    Ok,
    /// Positive completion with a multiline payload: 220/221/222, listings.
    ContentFollows,
    /// The article is definitively not on this server: 430 by message-id,
    /// 420/423 by number.
    Missing,
    /// Authentication domain: 381 continue, 480 required, 481/482 rejected,
    /// 502 no permission. Context decides which of these is fatal.
    Auth,
    /// Everything else, including 400 service shutdown and syntax errors.
    Fault,
}

impl ResponseClass {
    pub fn of(code: u16) -> ResponseClass {
        use code::*;
        match code {
            100 | 101 | 215 | 220 | HEAD_FOLLOWS | BODY_FOLLOWS | 224 | 225 | 230 | 231 => {
                ResponseClass::ContentFollows
            }
            GREETING_POSTING_OK | GREETING_READ_ONLY | 203 | CLOSING | ARTICLE_EXISTS
            | AUTH_ACCEPTED | 111 => ResponseClass::Ok,
            NO_SUCH_ARTICLE_NUMBER | NO_NEXT_ARTICLE | NO_SUCH_ARTICLE => ResponseClass::Missing,
            PASSWORD_REQUIRED | AUTH_REQUIRED | AUTH_REJECTED | AUTH_OUT_OF_SEQUENCE
            | NO_PERMISSION => ResponseClass::Auth,
            _ => ResponseClass::Fault,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_code_and_keeps_full_line() {
        let r = Response::parse("223 0 <a@b> article exists\r\n").unwrap();
        assert_eq!(r.code, 223);
        assert_eq!(r.line, "223 0 <a@b> article exists");
    }

    #[test]
    fn parses_bare_code() {
        assert_eq!(Response::parse("205\r\n").unwrap().code, 205);
    }

    #[test]
    fn rejects_lines_that_are_not_status_lines() {
        assert!(Response::parse("").is_none());
        assert!(Response::parse("hello world").is_none());
        assert!(Response::parse("22x nope").is_none());
        assert!(Response::parse("2234 too many digits").is_none());
    }

    #[test]
    fn classification_table() {
        use ResponseClass::*;
        let table: &[(u16, ResponseClass)] = &[
            (200, Ok),
            (201, Ok),
            (205, Ok),
            (223, Ok),
            (281, Ok),
            (220, ContentFollows),
            (221, ContentFollows),
            (222, ContentFollows),
            (420, Missing),
            (423, Missing),
            (430, Missing),
            (381, Auth),
            (480, Auth),
            (481, Auth),
            (482, Auth),
            (502, Auth),
            (400, Fault),
            (500, Fault),
            (503, Fault),
            (999, Fault),
        ];
        for (code, expected) in table {
            assert_eq!(ResponseClass::of(*code), *expected, "code {code}");
        }
    }
}
