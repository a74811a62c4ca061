use ember::http::{HttpParser, ParseResult};

fn parser() -> HttpParser {
    HttpParser::new(8192, 32 * 1024)
}

fn expect_done(res: ParseResult) -> ember::http::HttpRequest {
    match res {
        ParseResult::Done(req) => req,
        other => panic!("expected Done, got {:?}", other),
    }
}

#[cfg(test)]
mod request_line_tests {
    use super::*;

    #[test]
    fn test_simple_get() {
        let mut p = parser();
        let req = expect_done(p.parse(b"GET /index.html HTTP/1.1\r\nHost: x\r\n\r\n"));
        assert_eq!(req.method, "GET");
        assert_eq!(req.target, "/index.html");
        assert_eq!(req.version, "HTTP/1.1");
        assert_eq!(req.header("host"), Some("x"));
        assert!(req.keep_alive);
    }

    #[test]
    fn test_head_request() {
        let mut p = parser();
        let req = expect_done(p.parse(b"HEAD /a.txt HTTP/1.1\r\n\r\n"));
        assert_eq!(req.method, "HEAD");
    }

    #[test]
    fn test_missing_tokens_is_bad_request() {
        for raw in [
            &b"GET\r\n\r\n"[..],
            b"GET /index.html\r\n\r\n",
            b"INVALID REQUEST\r\n\r\n",
        ] {
            let mut p = parser();
            assert!(
                matches!(p.parse(raw), ParseResult::BadRequest),
                "should reject {:?}",
                raw
            );
        }
    }

    #[test]
    fn test_double_space_is_bad_request() {
        // Tokens must be separated by single spaces.
        let mut p = parser();
        assert!(matches!(
            p.parse(b"GET  /index.html HTTP/1.1\r\n\r\n"),
            ParseResult::BadRequest
        ));
    }

    #[test]
    fn test_version_must_start_with_http() {
        let mut p = parser();
        assert!(matches!(
            p.parse(b"GET / FTP/1.1\r\n\r\n"),
            ParseResult::BadRequest
        ));
    }

    #[test]
    fn test_method_with_separator_chars_is_rejected() {
        let mut p = parser();
        assert!(matches!(
            p.parse(b"GE(T / HTTP/1.1\r\n\r\n"),
            ParseResult::BadRequest
        ));
        let mut p = parser();
        assert!(matches!(
            p.parse(b"G\x01T / HTTP/1.1\r\n\r\n"),
            ParseResult::BadRequest
        ));
    }
}

#[cfg(test)]
mod header_tests {
    use super::*;

    #[test]
    fn test_header_names_are_lowercased_and_values_trimmed() {
        let mut p = parser();
        let req = expect_done(p.parse(b"GET / HTTP/1.1\r\nX-Thing:   padded value  \r\n\r\n"));
        assert_eq!(req.header("x-thing"), Some("padded value"));
        assert_eq!(req.header("X-THING"), Some("padded value"));
    }

    #[test]
    fn test_header_without_colon_is_bad_request() {
        let mut p = parser();
        assert!(matches!(
            p.parse(b"GET / HTTP/1.1\r\nBrokenHeader\r\n\r\n"),
            ParseResult::BadRequest
        ));
    }

    #[test]
    fn test_last_duplicate_header_wins() {
        let mut p = parser();
        let req = expect_done(p.parse(b"GET / HTTP/1.1\r\nA: 1\r\nA: 2\r\n\r\n"));
        assert_eq!(req.header("a"), Some("2"));
    }
}

#[cfg(test)]
mod keep_alive_tests {
    use super::*;

    #[test]
    fn test_http11_defaults_to_keep_alive() {
        let mut p = parser();
        assert!(expect_done(p.parse(b"GET / HTTP/1.1\r\n\r\n")).keep_alive);
    }

    #[test]
    fn test_http11_connection_close() {
        let mut p = parser();
        let req = expect_done(p.parse(b"GET / HTTP/1.1\r\nConnection: close\r\n\r\n"));
        assert!(!req.keep_alive);
    }

    #[test]
    fn test_connection_tokens_are_case_insensitive() {
        let mut p = parser();
        let req = expect_done(p.parse(b"GET / HTTP/1.1\r\nConnection: CLOSE\r\n\r\n"));
        assert!(!req.keep_alive);

        let mut p = parser();
        let req = expect_done(p.parse(b"GET / HTTP/1.0\r\nConnection: Keep-Alive\r\n\r\n"));
        assert!(req.keep_alive);
    }

    #[test]
    fn test_http10_defaults_to_close() {
        let mut p = parser();
        assert!(!expect_done(p.parse(b"GET / HTTP/1.0\r\n\r\n")).keep_alive);
    }
}

#[cfg(test)]
mod incremental_tests {
    use super::*;

    const REQ_A: &[u8] = b"GET /a.txt HTTP/1.1\r\nHost: one\r\n\r\n";
    const REQ_B: &[u8] = b"GET /b.txt HTTP/1.1\r\nHost: two\r\n\r\n";

    #[test]
    fn test_every_prefix_is_incomplete() {
        for cut in 1..REQ_A.len() {
            let mut p = parser();
            assert!(
                matches!(p.parse(&REQ_A[..cut]), ParseResult::Incomplete),
                "prefix of {} bytes should be Incomplete",
                cut
            );
        }
    }

    #[test]
    fn test_arbitrary_splits_yield_two_requests_in_order() {
        let mut joined = Vec::new();
        joined.extend_from_slice(REQ_A);
        joined.extend_from_slice(REQ_B);

        for cut in 0..=joined.len() {
            let mut p = parser();
            let mut done = Vec::new();

            for chunk in [&joined[..cut], &joined[cut..]] {
                let mut res = p.parse(chunk);
                loop {
                    match res {
                        ParseResult::Done(req) => {
                            done.push(req);
                            res = p.parse(&[]);
                        }
                        ParseResult::Incomplete => break,
                        ParseResult::BadRequest => panic!("unexpected BadRequest at cut {}", cut),
                    }
                }
            }

            assert_eq!(done.len(), 2, "cut at {}", cut);
            assert_eq!(done[0].target, "/a.txt");
            assert_eq!(done[1].target, "/b.txt");
        }
    }

    #[test]
    fn test_leftover_is_retained_after_done() {
        let mut p = parser();
        let mut joined = Vec::new();
        joined.extend_from_slice(REQ_A);
        joined.extend_from_slice(b"GET /b.txt HTT"); // partial second request

        let req = expect_done(p.parse(&joined));
        assert_eq!(req.target, "/a.txt");
        assert!(matches!(p.parse(&[]), ParseResult::Incomplete));

        let req = expect_done(p.parse(b"P/1.1\r\n\r\n"));
        assert_eq!(req.target, "/b.txt");
    }

    #[test]
    fn test_reset_discards_buffered_bytes() {
        let mut p = parser();
        assert!(matches!(p.parse(b"GET /a"), ParseResult::Incomplete));
        p.reset();
        let req = expect_done(p.parse(b"GET /b HTTP/1.1\r\n\r\n"));
        assert_eq!(req.target, "/b");
    }
}

#[cfg(test)]
mod limit_tests {
    use super::*;

    #[test]
    fn test_oversized_request_line() {
        let mut p = HttpParser::new(64, 1024);
        let long = format!("GET /{} HTTP/1.1\r\n\r\n", "a".repeat(200));
        assert!(matches!(p.parse(long.as_bytes()), ParseResult::BadRequest));
    }

    #[test]
    fn test_oversized_header_section() {
        let mut p = HttpParser::new(8192, 64);
        let raw = format!("GET / HTTP/1.1\r\nX-Pad: {}\r\n\r\n", "b".repeat(200));
        assert!(matches!(p.parse(raw.as_bytes()), ParseResult::BadRequest));
    }

    #[test]
    fn test_unterminated_flood_is_rejected() {
        let mut p = HttpParser::new(64, 64);
        // No CRLFCRLF ever arrives; the parser must give up once the
        // buffered bytes exceed what any valid head could occupy.
        let mut res = p.parse(b"GET /");
        for _ in 0..20 {
            match res {
                ParseResult::BadRequest => return,
                ParseResult::Incomplete => {}
                ParseResult::Done(_) => panic!("flood parsed as a request"),
            }
            res = p.parse(&[b'a'; 16]);
        }
        panic!("flood was never rejected");
    }

    #[test]
    fn test_request_exactly_at_limits_is_accepted() {
        let mut p = HttpParser::new(32, 1024);
        // "GET /aaaa HTTP/1.1" is 18 bytes, inside the 32-byte line cap.
        let req = expect_done(p.parse(b"GET /aaaa HTTP/1.1\r\n\r\n"));
        assert_eq!(req.target, "/aaaa");
    }
}
