// Length-delimited, compressed framing over TCP.
//
// Wire format: a 4-byte big-endian length, then that many bytes of a zlib
// stream. The decompressed bytes are the caller's payload (for messages, the
// JSON text produced by `codec.rs`). This module is payload-agnostic and
// works on any `Read`/`Write`.
//
// `MAX_MESSAGE_SIZE` (16 MB) bounds both the announced compressed block and
// the decompressed payload, so a hostile length prefix or a zlib bomb cannot
// force an unbounded allocation.
//
// Reads never return partial data: `read_frame` blocks until a whole block is
// in, or reports how the stream ended (`ConnectionClosed` between frames,
// `TruncatedHeader` / `TruncatedBody` inside one).

use std::io::{self, Read, Write};

use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;

use crate::error::{CodecError, Result};

/// Maximum allowed block size, compressed or not (16 MB).
pub const MAX_MESSAGE_SIZE: u32 = 16 * 1024 * 1024;

/// Size of the big-endian length prefix.
pub const HEADER_LEN: usize = 4;

/// Compress `payload` and prepend the length prefix, producing one complete
/// frame ready to be written to any number of streams.
pub fn encode_frame(payload: &[u8]) -> Result<Vec<u8>> {
    check_size(payload.len())?;

    let mut encoder = ZlibEncoder::new(
        Vec::with_capacity(HEADER_LEN + payload.len() / 2),
        Compression::default(),
    );
    // Reserve the prefix in place; patched once the block length is known.
    encoder.get_mut().extend_from_slice(&[0u8; HEADER_LEN]);
    encoder.write_all(payload)?;
    let mut frame = encoder.finish()?;

    let block_len = check_size(frame.len() - HEADER_LEN)?;
    frame[..HEADER_LEN].copy_from_slice(&block_len.to_be_bytes());
    Ok(frame)
}

/// Write one frame carrying `payload`, then flush.
pub fn write_frame<W: Write>(writer: &mut W, payload: &[u8]) -> Result<()> {
    let frame = encode_frame(payload)?;
    writer.write_all(&frame)?;
    writer.flush()?;
    Ok(())
}

/// Read one frame and return its decompressed payload.
pub fn read_frame<R: Read>(reader: &mut R) -> Result<Vec<u8>> {
    let len = u32::from_be_bytes(read_header(reader)?);
    if len > MAX_MESSAGE_SIZE {
        return Err(CodecError::TooLarge {
            size: len as usize,
            max: MAX_MESSAGE_SIZE,
        });
    }

    let mut block = vec![0u8; len as usize];
    reader.read_exact(&mut block).map_err(|e| match e.kind() {
        io::ErrorKind::UnexpectedEof => CodecError::TruncatedBody { expected: len },
        _ => CodecError::Io(e),
    })?;

    decompress(&block)
}

fn read_header<R: Read>(reader: &mut R) -> Result<[u8; HEADER_LEN]> {
    let mut buf = [0u8; HEADER_LEN];
    let mut filled = 0;
    while filled < HEADER_LEN {
        match reader.read(&mut buf[filled..]) {
            Ok(0) if filled == 0 => return Err(CodecError::ConnectionClosed),
            Ok(0) => return Err(CodecError::TruncatedHeader),
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(CodecError::Io(e)),
        }
    }
    Ok(buf)
}

fn decompress(block: &[u8]) -> Result<Vec<u8>> {
    let mut payload = Vec::new();
    ZlibDecoder::new(block)
        .take(u64::from(MAX_MESSAGE_SIZE) + 1)
        .read_to_end(&mut payload)
        .map_err(|e| CodecError::MalformedPayload(format!("decompression failed: {e}")))?;
    check_size(payload.len())?;
    Ok(payload)
}

/// Validate `size` against `MAX_MESSAGE_SIZE`, returning it as a prefix value.
fn check_size(size: usize) -> Result<u32> {
    match u32::try_from(size) {
        Ok(len) if len <= MAX_MESSAGE_SIZE => Ok(len),
        _ => Err(CodecError::TooLarge {
            size,
            max: MAX_MESSAGE_SIZE,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    /// Deterministic, incompressible filler (xorshift).
    fn noise(len: usize, mut seed: u64) -> Vec<u8> {
        (0..len)
            .map(|_| {
                seed ^= seed << 13;
                seed ^= seed >> 7;
                seed ^= seed << 17;
                (seed >> 24) as u8
            })
            .collect()
    }

    fn roundtrip(payload: &[u8]) -> Vec<u8> {
        let mut wire = Vec::new();
        write_frame(&mut wire, payload).unwrap();
        read_frame(&mut Cursor::new(&wire)).unwrap()
    }

    #[test]
    fn roundtrip_simple_payload() {
        assert_eq!(roundtrip(b"hello, spectators!"), b"hello, spectators!");
    }

    #[test]
    fn roundtrip_empty_payload() {
        assert_eq!(roundtrip(b""), Vec::<u8>::new());
    }

    #[test]
    fn roundtrip_incompressible_payloads() {
        for (len, seed) in [(1, 3), (255, 7), (4096, 11), (200_000, 0x9E37_79B9)] {
            let payload = noise(len, seed);
            assert_eq!(roundtrip(&payload), payload, "len {len}");
        }
    }

    #[test]
    fn prefix_announces_compressed_block() {
        let payload = vec![b'a'; 10_000];
        let frame = encode_frame(&payload).unwrap();
        let len = u32::from_be_bytes(frame[..HEADER_LEN].try_into().unwrap()) as usize;
        assert_eq!(len, frame.len() - HEADER_LEN);
        assert!(len < payload.len(), "repetitive payload should shrink");
    }

    #[test]
    fn clean_close_before_header() {
        let err = read_frame(&mut Cursor::new(Vec::new())).unwrap_err();
        assert!(err.is_closed(), "got {err:?}");
    }

    #[test]
    fn truncated_header() {
        let err = read_frame(&mut Cursor::new(vec![0u8, 1])).unwrap_err();
        assert!(matches!(err, CodecError::TruncatedHeader), "got {err:?}");
    }

    #[test]
    fn truncated_body() {
        let mut wire = encode_frame(b"some payload that is long enough").unwrap();
        wire.truncate(wire.len() - 3);
        let err = read_frame(&mut Cursor::new(wire)).unwrap_err();
        assert!(
            matches!(err, CodecError::TruncatedBody { .. }),
            "got {err:?}"
        );
    }

    #[test]
    fn rejects_oversized_prefix() {
        let fake_len = (MAX_MESSAGE_SIZE + 1).to_be_bytes();
        let err = read_frame(&mut Cursor::new(fake_len.to_vec())).unwrap_err();
        assert!(matches!(err, CodecError::TooLarge { .. }), "got {err:?}");
    }

    #[test]
    fn rejects_oversized_write() {
        let big = vec![0u8; MAX_MESSAGE_SIZE as usize + 1];
        let err = encode_frame(&big).unwrap_err();
        assert!(matches!(err, CodecError::TooLarge { .. }), "got {err:?}");
    }

    #[test]
    fn garbage_block_is_malformed() {
        let mut wire = 5u32.to_be_bytes().to_vec();
        wire.extend_from_slice(b"nope!");
        let err = read_frame(&mut Cursor::new(wire)).unwrap_err();
        assert!(
            matches!(err, CodecError::MalformedPayload(_)),
            "got {err:?}"
        );
    }

    #[test]
    fn multiple_frames_in_sequence() {
        let payloads: Vec<&[u8]> = vec![b"first", b"second", b"third"];
        let mut wire = Vec::new();
        for payload in &payloads {
            write_frame(&mut wire, payload).unwrap();
        }

        let mut cursor = Cursor::new(&wire);
        for expected in &payloads {
            assert_eq!(read_frame(&mut cursor).unwrap(), *expected);
        }
        assert!(read_frame(&mut cursor).unwrap_err().is_closed());
    }
}
