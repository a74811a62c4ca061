use ember::rdma::protocol::{
    chunk_for, make_request_bytes, make_resp_header, parse_request, parse_resp_header, Op,
    Request, RespHeader, REQ_HEADER_LEN, RESP_HEADER_LEN,
};

#[cfg(test)]
mod request_framing_tests {
    use super::*;

    #[test]
    fn test_get_round_trip() {
        let req = Request {
            op: Op::Get,
            path: "/a".to_string(),
        };
        let bytes = make_request_bytes(&req);
        assert_eq!(bytes.len(), REQ_HEADER_LEN + 2);
        assert_eq!(bytes[0], 1); // op
        assert_eq!(&bytes[1..3], &2u16.to_le_bytes()); // path_len
        assert_eq!(parse_request(&bytes), Some(req));
    }

    #[test]
    fn test_ping_round_trip() {
        let req = Request {
            op: Op::Ping,
            path: String::new(),
        };
        let bytes = make_request_bytes(&req);
        assert_eq!(bytes.len(), REQ_HEADER_LEN);
        assert_eq!(bytes[0], 2);
        assert_eq!(parse_request(&bytes), Some(req));
    }

    #[test]
    fn test_round_trip_for_longer_paths() {
        for path in ["/", "/index.html", "/deep/ly/nested/file.bin"] {
            let req = Request {
                op: Op::Get,
                path: path.to_string(),
            };
            assert_eq!(parse_request(&make_request_bytes(&req)), Some(req));
        }
    }

    #[test]
    fn test_short_header_is_rejected() {
        assert_eq!(parse_request(&[]), None);
        assert_eq!(parse_request(&[1]), None);
        assert_eq!(parse_request(&[1, 0]), None);
    }

    #[test]
    fn test_path_len_past_payload_is_rejected() {
        // Claims a 10-byte path but carries only 2.
        let mut bytes = vec![1u8];
        bytes.extend_from_slice(&10u16.to_le_bytes());
        bytes.extend_from_slice(b"/a");
        assert_eq!(parse_request(&bytes), None);
    }

    #[test]
    fn test_unknown_op_is_rejected() {
        let mut bytes = vec![9u8];
        bytes.extend_from_slice(&0u16.to_le_bytes());
        assert_eq!(parse_request(&bytes), None);
    }

    #[test]
    fn test_trailing_bytes_beyond_path_are_ignored() {
        // A RECV completion can report more bytes than the framed request.
        let mut bytes = make_request_bytes(&Request {
            op: Op::Get,
            path: "/a".to_string(),
        });
        bytes.extend_from_slice(b"junk");
        let parsed = parse_request(&bytes).unwrap();
        assert_eq!(parsed.path, "/a");
    }

    #[test]
    fn test_ping_ignores_path_bytes() {
        let mut bytes = vec![2u8];
        bytes.extend_from_slice(&3u16.to_le_bytes());
        bytes.extend_from_slice(b"abc");
        let parsed = parse_request(&bytes).unwrap();
        assert_eq!(parsed.op, Op::Ping);
        assert!(parsed.path.is_empty());
    }
}

#[cfg(test)]
mod response_framing_tests {
    use super::*;

    #[test]
    fn test_resp_header_layout_is_little_endian() {
        let bytes = make_resp_header(200, 100, 32);
        assert_eq!(bytes.len(), RESP_HEADER_LEN);
        assert_eq!(&bytes[0..2], &200u16.to_le_bytes());
        assert_eq!(&bytes[2..10], &100u64.to_le_bytes());
        assert_eq!(&bytes[10..14], &32u32.to_le_bytes());
    }

    #[test]
    fn test_resp_header_round_trip() {
        for (status, content_len, chunk) in
            [(200u16, 0u64, 0u32), (404, 0, 0), (200, 1 << 40, 32768)]
        {
            let parsed = parse_resp_header(&make_resp_header(status, content_len, chunk)).unwrap();
            assert_eq!(
                parsed,
                RespHeader {
                    status,
                    content_len,
                    chunk_size: chunk,
                }
            );
        }
    }

    #[test]
    fn test_short_resp_header_is_rejected() {
        assert_eq!(parse_resp_header(&[0u8; RESP_HEADER_LEN - 1]), None);
    }
}

#[cfg(test)]
mod chunking_tests {
    use super::*;

    #[test]
    fn test_chunk_is_clamped_to_content_len() {
        assert_eq!(chunk_for(32768, 100), 100);
        assert_eq!(chunk_for(32, 100), 32);
        assert_eq!(chunk_for(32, 32), 32);
    }

    #[test]
    fn test_empty_body_still_gets_nonzero_chunk() {
        assert_eq!(chunk_for(32768, 0), 1);
    }

    /// 100-byte body with a 32-byte cap splits into 32+32+32+4, in order,
    /// summing to exactly content_len.
    #[test]
    fn test_chunk_plan_for_100_bytes() {
        let content_len = 100usize;
        let chunk = chunk_for(32, content_len as u64) as usize;
        assert_eq!(chunk, 32);

        let mut sizes = Vec::new();
        let mut off = 0;
        while off < content_len {
            let n = chunk.min(content_len - off);
            sizes.push(n);
            off += n;
        }
        assert_eq!(sizes, vec![32, 32, 32, 4]);
        assert_eq!(sizes.iter().sum::<usize>(), content_len);
    }

    #[test]
    fn test_chunk_sends_always_sum_to_content_len() {
        for content_len in [1usize, 31, 32, 33, 63, 64, 1000, 4096] {
            for cap in [1usize, 7, 32, 4096] {
                let chunk = chunk_for(cap, content_len as u64) as usize;
                let mut total = 0;
                let mut off = 0;
                while off < content_len {
                    let n = chunk.min(content_len - off);
                    assert!(n >= 1 && n <= chunk);
                    total += n;
                    off += n;
                }
                assert_eq!(total, content_len);
            }
        }
    }
}
