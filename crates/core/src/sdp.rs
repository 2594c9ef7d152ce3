//! SDP parsing for ANNOUNCE bodies.
//!
//! Line-oriented and tolerant: unknown `a=` attributes are ignored
//!. Produces a [`StreamDescription`] that the ANNOUNCE
//! handler copies into the connection's codec/encryption state.

use crate::error::{ParseErrorKind, RtspError};

/// Audio codec negotiated via ANNOUNCE.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CodecType {
    #[default]
    Unknown,
    UncompressedPcm,
    AppleLossless,
}

/// Parsed result of an ANNOUNCE SDP body.
#[derive(Debug, Clone, Default)]
pub struct StreamDescription {
    pub session_id: Option<String>,
    pub codec: CodecType,
    pub fmtp: [i64; 12],
    pub max_frames_per_packet: u32,
    pub input_rate: u32,
    pub input_num_channels: u8,
    pub input_bit_depth: u8,
    pub encrypted: bool,
    pub aes_iv: Option<[u8; 16]>,
    pub aes_key_ciphertext: Option<Vec<u8>>,
    pub minimum_latency: Option<u32>,
    pub maximum_latency: Option<u32>,
}

/// Parse an ANNOUNCE SDP body line by line.
///
/// Returns [`RtspError::Parse`] with [`ParseErrorKind::InvalidSdp`] only
/// for attributes this parser claims to understand but cannot make sense
/// of (e.g. a malformed `a=fmtp:` integer list); genuinely unknown `a=`
/// lines are silently skipped.
pub fn parse_announce(body: &str) -> Result<StreamDescription, RtspError> {
    let mut desc = StreamDescription::default();

    for raw_line in body.lines() {
        let line = raw_line.trim_end_matches(['\r', '\n']);
        if let Some(rest) = line.strip_prefix("o=") {
            desc.session_id = rest.split_whitespace().nth(1).map(str::to_string);
        } else if let Some(rest) = line.strip_prefix("a=rtpmap:96 ") {
            if rest.starts_with("L16/44100/2") {
                desc.codec = CodecType::UncompressedPcm;
                desc.max_frames_per_packet = 352;
                desc.input_rate = 44_100;
                desc.input_num_channels = 2;
                desc.input_bit_depth = 16;
            }
        } else if let Some(rest) = line.strip_prefix("a=fmtp:") {
            parse_fmtp(&mut desc, rest)?;
        } else if let Some(rest) = line.strip_prefix("a=aesiv:") {
            let bytes = crate::crypto::base64_decode(rest)?;
            let iv: [u8; 16] = bytes
                .try_into()
                .map_err(|_| RtspError::Parse { kind: ParseErrorKind::InvalidSdp })?;
            desc.aes_iv = Some(iv);
            desc.encrypted = true;
        } else if let Some(rest) = line.strip_prefix("a=rsaaeskey:") {
            desc.aes_key_ciphertext = Some(crate::crypto::base64_decode(rest)?);
            desc.encrypted = true;
        } else if let Some(rest) = line.strip_prefix("a=min-latency:") {
            desc.minimum_latency = rest.trim().parse().ok();
        } else if let Some(rest) = line.strip_prefix("a=max-latency:") {
            desc.maximum_latency = rest.trim().parse().ok();
        }
        // Unknown a= attributes (and all other SDP line types) are
        // ignored.
    }

    Ok(desc)
}

fn parse_fmtp(desc: &mut StreamDescription, rest: &str) -> Result<(), RtspError> {
    // "<payload type> <12 space-separated integers>"
    let mut parts = rest.split_whitespace();
    let _payload_type = parts.next();
    let ints: Vec<i64> = parts
        .map(|p| p.parse::<i64>())
        .collect::<Result<_, _>>()
        .map_err(|_| RtspError::Parse { kind: ParseErrorKind::InvalidSdp })?;

    if ints.len() != 12 {
        return Err(RtspError::Parse { kind: ParseErrorKind::InvalidSdp });
    }

    desc.codec = CodecType::AppleLossless;
    desc.fmtp.copy_from_slice(&ints);
    desc.max_frames_per_packet = desc.fmtp[1] as u32;
    desc.input_num_channels = desc.fmtp[7] as u8;
    desc.input_bit_depth = desc.fmtp[3] as u8;
    desc.input_rate = desc.fmtp[11] as u32;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_uncompressed_pcm() {
        let body = "v=0\r\no=iTunes 1234 0 IN IP4 10.0.0.1\r\ns=iTunes\r\nc=IN IP4 10.0.0.2\r\nt=0 0\r\nm=audio 0 RTP/AVP 96\r\na=rtpmap:96 L16/44100/2\r\n";
        let desc = parse_announce(body).unwrap();
        assert_eq!(desc.codec, CodecType::UncompressedPcm);
        assert_eq!(desc.max_frames_per_packet, 352);
        assert_eq!(desc.input_rate, 44_100);
        assert_eq!(desc.input_num_channels, 2);
        assert_eq!(desc.input_bit_depth, 16);
        assert_eq!(desc.session_id.as_deref(), Some("1234"));
        assert!(!desc.encrypted);
    }

    #[test]
    fn parses_apple_lossless_fmtp() {
        let body = "o=iTunes 1 0 IN IP4 10.0.0.1\r\nm=audio 0 RTP/AVP 96\r\na=fmtp:96 352 0 16 40 10 14 2 255 0 0 44100\r\n";
        let desc = parse_announce(body).unwrap();
        assert_eq!(desc.codec, CodecType::AppleLossless);
        assert_eq!(desc.max_frames_per_packet, 352);
        assert_eq!(desc.input_num_channels, 2);
        assert_eq!(desc.input_bit_depth, 16);
        assert_eq!(desc.input_rate, 44_100);
    }

    #[test]
    fn malformed_fmtp_is_invalid_sdp() {
        let body = "a=fmtp:96 not-enough-ints\r\n";
        let err = parse_announce(body).unwrap_err();
        assert!(matches!(err, RtspError::Parse { kind: ParseErrorKind::InvalidSdp }));
    }

    #[test]
    fn unknown_attributes_are_ignored() {
        let body = "a=some-future-attribute:whatever\r\nm=audio 0 RTP/AVP 96\r\na=rtpmap:96 L16/44100/2\r\n";
        let desc = parse_announce(body).unwrap();
        assert_eq!(desc.codec, CodecType::UncompressedPcm);
    }

    #[test]
    fn encrypted_announce_parses_aesiv_and_key() {
        let iv = crate::crypto::base64_encode(&[1u8; 16]);
        let key = crate::crypto::base64_encode(&[2u8; 128]);
        let body = format!("a=rtpmap:96 L16/44100/2\r\na=aesiv:{iv}\r\na=rsaaeskey:{key}\r\n");
        let desc = parse_announce(&body).unwrap();
        assert!(desc.encrypted);
        assert_eq!(desc.aes_iv, Some([1u8; 16]));
        assert_eq!(desc.aes_key_ciphertext, Some(vec![2u8; 128]));
    }

    #[test]
    fn latency_bounds_are_advisory() {
        let body = "a=min-latency:4410\r\na=max-latency:88200\r\n";
        let desc = parse_announce(body).unwrap();
        assert_eq!(desc.minimum_latency, Some(4410));
        assert_eq!(desc.maximum_latency, Some(88200));
    }
}
