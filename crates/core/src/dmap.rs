//! DMAP tagged payload decoding.
//!
//! `tag(4, BE) || length(4, BE) || bytes[length]`, concatenated; the
//! first 8 bytes of the whole body are a header and are skipped.

/// One decoded DMAP tuple.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DmapTuple {
    pub tag: [u8; 4],
    pub value: Vec<u8>,
}

/// Decode a DMAP-tagged body into its tuples. Malformed trailing bytes
/// (a truncated tag or length header) stop decoding rather than erroring
/// — the SDP/line parsers in this core are tolerant of partial tails,
/// and DMAP follows the same posture.
pub fn decode(body: &[u8]) -> Vec<DmapTuple> {
    let mut tuples = Vec::new();
    if body.len() <= 8 {
        return tuples;
    }
    let mut cursor = 8; // skip the fixed 8-byte header
    while cursor + 8 <= body.len() {
        let tag: [u8; 4] = body[cursor..cursor + 4].try_into().unwrap();
        let len = u32::from_be_bytes(body[cursor + 4..cursor + 8].try_into().unwrap()) as usize;
        cursor += 8;
        if cursor + len > body.len() {
            break;
        }
        tuples.push(DmapTuple {
            tag,
            value: body[cursor..cursor + len].to_vec(),
        });
        cursor += len;
    }
    tuples
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tuple_bytes(tag: &[u8; 4], value: &[u8]) -> Vec<u8> {
        let mut out = tag.to_vec();
        out.extend_from_slice(&(value.len() as u32).to_be_bytes());
        out.extend_from_slice(value);
        out
    }

    #[test]
    fn decodes_single_tuple_after_header() {
        let mut body = vec![0u8; 8]; // header, skipped
        body.extend(tuple_bytes(b"asal", b"Album"));
        let tuples = decode(&body);
        assert_eq!(tuples.len(), 1);
        assert_eq!(tuples[0].tag, *b"asal");
        assert_eq!(tuples[0].value, b"Album");
    }

    #[test]
    fn decodes_multiple_tuples() {
        let mut body = vec![0u8; 8];
        body.extend(tuple_bytes(b"minm", b"Track"));
        body.extend(tuple_bytes(b"asar", b"Artist"));
        let tuples = decode(&body);
        assert_eq!(tuples.len(), 2);
        assert_eq!(tuples[1].tag, *b"asar");
        assert_eq!(tuples[1].value, b"Artist");
    }

    #[test]
    fn truncated_trailing_tuple_is_skipped() {
        let mut body = vec![0u8; 8];
        body.extend(tuple_bytes(b"minm", b"Track"));
        body.extend_from_slice(b"asar\x00\x00\x00\xff"); // claims 255 bytes, has none
        let tuples = decode(&body);
        assert_eq!(tuples.len(), 1);
    }

    #[test]
    fn empty_body_decodes_to_nothing() {
        assert!(decode(&[]).is_empty());
        assert!(decode(&[0u8; 8]).is_empty());
    }
}
