//! Streaming decompression for binary gateway frames.
//!
//! Two transport modes exist. The zlib stream shares one inflate context for
//! the whole connection and frames a message with a 4-byte sync-flush marker;
//! the zstd mode ships each frame as a self-contained compressed chunk.
//! Independently of transport compression, the legacy identify flag can ask
//! for whole-payload compression, decoded one frame at a time.

use crate::traits::{GatewayError, Result};
use flate2::{Decompress, FlushDecompress};
use serde_json::Value;
#[cfg(not(feature = "zstd"))]
use tracing::warn;

/// Marker terminating one zlib-stream message. The gateway ends every
/// message with a sync flush, so the accumulated input is only inflatable
/// once these four bytes arrive.
pub const ZLIB_SUFFIX: [u8; 4] = [0x00, 0x00, 0xFF, 0xFF];

/// Transport-level compression negotiated in the connection query string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransportCompression {
    /// Binary frames are not transport-compressed.
    #[default]
    None,
    /// Shared-window deflate stream with sync-flush framing.
    ZlibStream,
    /// Independent zstd frames.
    ZstdFrames,
}

impl TransportCompression {
    /// Whether a decoder for this mode was compiled in.
    pub fn is_available(self) -> bool {
        match self {
            TransportCompression::ZstdFrames => cfg!(feature = "zstd"),
            _ => true,
        }
    }

    /// Query parameter value advertised to the gateway, if any.
    pub fn query_value(self) -> Option<&'static str> {
        match self {
            TransportCompression::None => None,
            TransportCompression::ZlibStream => Some("zlib-stream"),
            TransportCompression::ZstdFrames => Some("zstd-stream"),
        }
    }
}

enum Inner {
    Zlib {
        ctx: Box<Decompress>,
        pending: Vec<u8>,
    },
    Zstd,
    None,
}

/// Stateful decoder turning binary socket frames into parsed payloads.
///
/// One instance lives exactly as long as one socket; reconnecting replaces
/// it, which resets the zlib window and any partially buffered message.
pub struct Decompressor {
    inner: Inner,
}

impl Decompressor {
    pub fn new(mode: TransportCompression) -> Self {
        let inner = match mode {
            TransportCompression::ZlibStream => Inner::Zlib {
                ctx: Box::new(Decompress::new(true)),
                pending: Vec::new(),
            },
            TransportCompression::ZstdFrames => Inner::Zstd,
            TransportCompression::None => Inner::None,
        };
        Self { inner }
    }

    /// Feed one binary frame. Returns a parsed payload once a complete
    /// message is available and `None` while a zlib message is still
    /// accumulating.
    pub fn feed(&mut self, frame: &[u8]) -> Result<Option<Value>> {
        match &mut self.inner {
            Inner::Zlib { ctx, pending } => {
                pending.extend_from_slice(frame);
                if pending.len() < ZLIB_SUFFIX.len()
                    || pending[pending.len() - ZLIB_SUFFIX.len()..] != ZLIB_SUFFIX
                {
                    return Ok(None);
                }
                let message = std::mem::take(pending);
                let bytes = inflate(ctx, &message)?;
                parse(&bytes).map(Some)
            }
            Inner::Zstd => decode_zstd(frame).map(Some),
            Inner::None => Err(GatewayError::Configuration(
                "binary frame received but no transport compression was negotiated".into(),
            )),
        }
    }
}

/// Decode one self-contained zlib payload (legacy whole-payload compression).
pub fn inflate_payload(frame: &[u8]) -> Result<Value> {
    let mut ctx = Decompress::new(true);
    let bytes = inflate(&mut ctx, frame)?;
    parse(&bytes)
}

fn inflate(ctx: &mut Decompress, input: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    let mut offset = 0usize;
    loop {
        out.reserve(16 * 1024);
        let before = ctx.total_in();
        ctx.decompress_vec(&input[offset..], &mut out, FlushDecompress::Sync)
            .map_err(|e| GatewayError::Decompression(e.to_string()))?;
        offset += (ctx.total_in() - before) as usize;
        // done once everything was consumed and the decoder stopped short of
        // the buffer, i.e. it has nothing more to flush
        if offset >= input.len() && out.len() < out.capacity() {
            break;
        }
    }
    Ok(out)
}

#[cfg(feature = "zstd")]
fn decode_zstd(frame: &[u8]) -> Result<Value> {
    let bytes =
        zstd::stream::decode_all(frame).map_err(|e| GatewayError::Decompression(e.to_string()))?;
    parse(&bytes)
}

#[cfg(not(feature = "zstd"))]
fn decode_zstd(_frame: &[u8]) -> Result<Value> {
    warn!("zstd frame received but the zstd feature is compiled out");
    Err(GatewayError::Configuration(
        "zstd transport compression requires the `zstd` feature".into(),
    ))
}

fn parse(bytes: &[u8]) -> Result<Value> {
    let text = std::str::from_utf8(bytes).map_err(|e| GatewayError::Parse(e.to_string()))?;
    serde_json::from_str(text).map_err(|e| GatewayError::Parse(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::{Compress, Compression, FlushCompress};

    /// Compress `text` through a shared deflate context, ending with a sync
    /// flush exactly like the gateway does per message.
    fn deflate_message(ctx: &mut Compress, text: &str) -> Vec<u8> {
        let input = text.as_bytes();
        let mut out = Vec::new();
        let mut offset = 0usize;
        loop {
            out.reserve(1024);
            let before = ctx.total_in();
            ctx.compress_vec(&input[offset..], &mut out, FlushCompress::Sync)
                .unwrap();
            offset += (ctx.total_in() - before) as usize;
            if offset >= input.len() && out.len() < out.capacity() {
                break;
            }
        }
        out
    }

    #[test]
    fn single_chunk_yields_exactly_one_payload() {
        let mut compress = Compress::new(Compression::default(), true);
        let frame = deflate_message(&mut compress, r#"{"op":10,"d":{"heartbeat_interval":45000}}"#);
        assert_eq!(frame[frame.len() - 4..], ZLIB_SUFFIX);

        let mut decoder = Decompressor::new(TransportCompression::ZlibStream);
        let payload = decoder.feed(&frame).unwrap().expect("complete message");
        assert_eq!(payload["op"], 10);
        assert_eq!(payload["d"]["heartbeat_interval"], 45000);
    }

    #[test]
    fn marker_split_across_frames_defers_the_payload() {
        let mut compress = Compress::new(Compression::default(), true);
        let frame = deflate_message(&mut compress, r#"{"op":11,"d":null}"#);

        // split inside the 4-byte flush marker
        let cut = frame.len() - 2;
        let mut decoder = Decompressor::new(TransportCompression::ZlibStream);
        assert!(decoder.feed(&frame[..cut]).unwrap().is_none());
        let payload = decoder.feed(&frame[cut..]).unwrap().expect("complete message");
        assert_eq!(payload["op"], 11);
    }

    #[test]
    fn context_is_shared_across_messages() {
        let mut compress = Compress::new(Compression::default(), true);
        let first = deflate_message(&mut compress, r#"{"op":0,"t":"READY","s":1,"d":{}}"#);
        let second = deflate_message(&mut compress, r#"{"op":0,"t":"READY","s":2,"d":{}}"#);

        let mut decoder = Decompressor::new(TransportCompression::ZlibStream);
        let one = decoder.feed(&first).unwrap().expect("first message");
        let two = decoder.feed(&second).unwrap().expect("second message");
        assert_eq!(one["s"], 1);
        assert_eq!(two["s"], 2);
    }

    #[test]
    fn corrupt_stream_reports_decompression_error() {
        let mut decoder = Decompressor::new(TransportCompression::ZlibStream);
        let mut garbage = vec![0xAB; 32];
        garbage.extend_from_slice(&ZLIB_SUFFIX);
        assert!(matches!(
            decoder.feed(&garbage),
            Err(GatewayError::Decompression(_))
        ));
    }

    #[test]
    fn no_context_is_a_configuration_error() {
        let mut decoder = Decompressor::new(TransportCompression::None);
        assert!(matches!(
            decoder.feed(&[1, 2, 3]),
            Err(GatewayError::Configuration(_))
        ));
    }

    #[test]
    fn whole_payload_mode_decodes_one_shot() {
        let mut ctx = Compress::new(Compression::default(), true);
        let frame = deflate_message(&mut ctx, r#"{"op":9,"d":false}"#);
        let payload = inflate_payload(&frame).unwrap();
        assert_eq!(payload["op"], 9);
    }

    #[cfg(feature = "zstd")]
    #[test]
    fn zstd_frames_decode_standalone() {
        let frame = zstd::stream::encode_all(r#"{"op":1,"d":2}"#.as_bytes(), 0).unwrap();
        let mut decoder = Decompressor::new(TransportCompression::ZstdFrames);
        let payload = decoder.feed(&frame).unwrap().expect("complete frame");
        assert_eq!(payload["d"], 2);
    }
}
