/// Path of Building share-code codec
///
/// A share code is a zlib stream wrapped in URL-safe base64. Decoding is:
/// strip whitespace -> URL-safe alphabet to standard -> pad to a multiple of 4
/// -> base64 decode -> decompress to text.
///
/// Producers in the wild do not agree on framing, so decompression walks an
/// ordered list of inflate strategies and keeps the first one that succeeds.
use crate::metrics;
use base64::{engine::general_purpose, Engine as _};
use flate2::read::{DeflateDecoder, GzDecoder, ZlibDecoder};
use flate2::write::ZlibEncoder;
use flate2::Compression;
use std::io::{Read, Write};
use thiserror::Error;
use tracing::{debug, trace, warn};

/// Magic prefixes of a base64-encoded zlib stream (default and best compression headers)
pub const SHARE_CODE_PREFIXES: [&str; 2] = ["eJ", "eN"];

/// Root element every decoded build document starts with
pub const ROOT_MARKER: &str = "<PathOfBuilding>";

/// Upper bound on decompressed output, guards against compression bombs
pub const MAX_DOCUMENT_SIZE: u64 = 16 * 1024 * 1024;

/// Characters of the input echoed back in error messages
const ERROR_PREFIX_CHARS: usize = 8;

/// Codec errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Input could not be turned back into a build document
    #[error("share code could not be decoded (length {length}, starts with {prefix:?})")]
    Undecodable { length: usize, prefix: String },

    /// Compressing a document failed
    #[error("build document could not be encoded: {0}")]
    Encode(String),
}

impl CodecError {
    pub fn undecodable(sanitized: &str) -> Self {
        CodecError::Undecodable {
            length: sanitized.len(),
            prefix: sanitized.chars().take(ERROR_PREFIX_CHARS).collect(),
        }
    }
}

/// Inflate strategies, tried in declaration order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Inflate {
    /// zlib header and adler32 trailer both enforced
    Zlib,
    /// zlib header parsed for its declared window size, trailer not enforced
    ZlibUnchecked,
    /// gzip member framing
    Gzip,
    /// headerless deflate stream
    Raw,
}

impl Inflate {
    pub const ORDER: [Inflate; 4] = [
        Inflate::Zlib,
        Inflate::ZlibUnchecked,
        Inflate::Gzip,
        Inflate::Raw,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Inflate::Zlib => "zlib",
            Inflate::ZlibUnchecked => "zlib_unchecked",
            Inflate::Gzip => "gzip",
            Inflate::Raw => "raw",
        }
    }

    fn inflate(&self, data: &[u8]) -> std::io::Result<Vec<u8>> {
        match self {
            Inflate::Zlib => read_capped(ZlibDecoder::new(data)),
            Inflate::ZlibUnchecked => {
                let window_bits = zlib_window_bits(data).ok_or_else(|| {
                    std::io::Error::new(std::io::ErrorKind::InvalidData, "invalid zlib header")
                })?;
                trace!("zlib header declares a {}-bit window", window_bits);
                read_capped(DeflateDecoder::new(&data[2..]))
            }
            Inflate::Gzip => read_capped(GzDecoder::new(data)),
            Inflate::Raw => read_capped(DeflateDecoder::new(data)),
        }
    }
}

/// Parse a two-byte zlib header, returning the declared LZ77 window size in bits.
///
/// Preset dictionaries are rejected since share codes never carry one.
fn zlib_window_bits(data: &[u8]) -> Option<u8> {
    let (cmf, flg) = match data {
        [cmf, flg, ..] => (*cmf, *flg),
        _ => return None,
    };

    let method = cmf & 0x0F;
    let info = cmf >> 4;
    let header = u16::from(cmf) << 8 | u16::from(flg);

    if method != 8 || info > 7 || header % 31 != 0 || flg & 0x20 != 0 {
        return None;
    }

    Some(info + 8)
}

fn read_capped<R: Read>(reader: R) -> std::io::Result<Vec<u8>> {
    let mut out = Vec::new();
    reader.take(MAX_DOCUMENT_SIZE + 1).read_to_end(&mut out)?;

    if out.len() as u64 > MAX_DOCUMENT_SIZE {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "decompressed document exceeds size limit",
        ));
    }

    Ok(out)
}

fn strip_whitespace(text: &str) -> String {
    text.chars().filter(|c| !c.is_whitespace()).collect()
}

/// Check whether text looks like a share code rather than an already-decoded document
pub fn is_share_code(text: &str) -> bool {
    let sanitized = strip_whitespace(text);

    !sanitized.starts_with('<')
        && SHARE_CODE_PREFIXES
            .iter()
            .any(|prefix| sanitized.starts_with(prefix))
}

/// Check whether text is a decoded build document
pub fn is_build_document(text: &str) -> bool {
    text.trim_start().starts_with(ROOT_MARKER)
}

/// Decode a share code into build document text
pub fn decode(code: &str) -> Result<String, CodecError> {
    let sanitized = strip_whitespace(code);

    let mut base64_text: String = sanitized
        .chars()
        .map(|c| match c {
            '-' => '+',
            '_' => '/',
            other => other,
        })
        .collect();
    while base64_text.len() % 4 != 0 {
        base64_text.push('=');
    }

    let bytes = general_purpose::STANDARD
        .decode(base64_text.as_bytes())
        .map_err(|e| {
            debug!("Share code base64 decode failed: {}", e);
            CodecError::undecodable(&sanitized)
        })?;

    for strategy in Inflate::ORDER {
        match strategy.inflate(&bytes) {
            Ok(inflated) if inflated.is_empty() => {
                trace!(strategy = strategy.as_str(), "inflate produced no output")
            }
            Ok(inflated) => match String::from_utf8(inflated) {
                Ok(text) => {
                    debug!(
                        strategy = strategy.as_str(),
                        "Decoded share code: {} chars -> {} bytes",
                        sanitized.len(),
                        text.len()
                    );
                    metrics::CODEC_DECODE_TOTAL
                        .with_label_values(&[strategy.as_str()])
                        .inc();
                    return Ok(text);
                }
                Err(_) => trace!(strategy = strategy.as_str(), "inflated output is not UTF-8"),
            },
            Err(e) => trace!(strategy = strategy.as_str(), "inflate failed: {}", e),
        }
    }

    warn!(
        length = sanitized.len(),
        "Share code could not be inflated by any strategy"
    );
    metrics::CODEC_DECODE_TOTAL
        .with_label_values(&["failed"])
        .inc();
    Err(CodecError::undecodable(&sanitized))
}

/// Encode build document text into a share code.
///
/// Mirror of [`decode`]: zlib at the default level, then URL-safe base64.
pub fn encode(document: &str) -> Result<String, CodecError> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(document.as_bytes())
        .map_err(|e| CodecError::Encode(e.to_string()))?;
    let compressed = encoder
        .finish()
        .map_err(|e| CodecError::Encode(e.to_string()))?;

    Ok(general_purpose::URL_SAFE.encode(compressed))
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::{DeflateEncoder, GzEncoder};

    const DOCUMENT: &str = r#"<PathOfBuilding><Build level="92" className="Witch" ascendClassName="Necromancer"/><Items><Item id="1">Rarity: UNIQUE
Bones of Ullr
Silk Slippers</Item></Items><Tree activeSpec="1"><Spec treeVersion="3_25" nodes="1,2,3"/></Tree></PathOfBuilding>"#;

    fn deflate_raw(text: &str) -> Vec<u8> {
        let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(text.as_bytes()).unwrap();
        encoder.finish().unwrap()
    }

    #[test]
    fn test_round_trip() {
        let code = encode(DOCUMENT).unwrap();
        assert!(is_share_code(&code));
        assert_eq!(decode(&code).unwrap(), DOCUMENT);
    }

    #[test]
    fn test_decode_is_repeatable() {
        let code = encode(DOCUMENT).unwrap();
        let first = decode(&code).unwrap();
        let second = decode(&code).unwrap();
        assert_eq!(first.as_bytes(), second.as_bytes());
    }

    #[test]
    fn test_decode_tolerates_whitespace_and_missing_padding() {
        let code = encode(DOCUMENT).unwrap();
        let unpadded = code.trim_end_matches('=');
        let (head, tail) = unpadded.split_at(unpadded.len() / 2);
        let mangled = format!("  {}\n\t{}  \r\n", head, tail);

        assert_eq!(decode(&mangled).unwrap(), DOCUMENT);
    }

    #[test]
    fn test_decode_accepts_standard_alphabet() {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(DOCUMENT.as_bytes()).unwrap();
        let code = general_purpose::STANDARD.encode(encoder.finish().unwrap());

        assert_eq!(decode(&code).unwrap(), DOCUMENT);
    }

    #[test]
    fn test_raw_deflate_only_stream_decodes() {
        let raw = deflate_raw(DOCUMENT);
        assert!(Inflate::Zlib.inflate(&raw).is_err());
        assert!(Inflate::Gzip.inflate(&raw).is_err());

        let code = general_purpose::URL_SAFE_NO_PAD.encode(raw);
        assert_eq!(decode(&code).unwrap(), DOCUMENT);
    }

    #[test]
    fn test_bad_checksum_falls_back_to_unchecked_zlib() {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(DOCUMENT.as_bytes()).unwrap();
        let mut bytes = encoder.finish().unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;

        assert!(Inflate::Zlib.inflate(&bytes).is_err());
        let code = general_purpose::URL_SAFE.encode(bytes);
        assert_eq!(decode(&code).unwrap(), DOCUMENT);
    }

    #[test]
    fn test_gzip_stream_decodes() {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(DOCUMENT.as_bytes()).unwrap();
        let code = general_purpose::URL_SAFE.encode(encoder.finish().unwrap());

        assert_eq!(decode(&code).unwrap(), DOCUMENT);
    }

    #[test]
    fn test_undecodable_error_names_length_and_prefix_only() {
        let garbage = "eJthis-is-definitely-not-a-valid-build-code-at-all";
        let err = decode(garbage).unwrap_err();

        match &err {
            CodecError::Undecodable { length, prefix } => {
                assert_eq!(*length, garbage.len());
                assert_eq!(prefix, "eJthis-i");
            }
            other => panic!("Expected Undecodable, got {:?}", other),
        }
        assert!(!err.to_string().contains(garbage));
    }

    #[test]
    fn test_invalid_base64_length_is_codec_error() {
        assert!(matches!(
            decode("eJx"),
            Err(CodecError::Undecodable { length: 3, .. })
        ));
    }

    #[test]
    fn test_is_share_code() {
        assert!(is_share_code("eJztWV1v2zgW"));
        assert!(is_share_code("  eN\n1Zxb  "));
        assert!(!is_share_code("<PathOfBuilding>"));
        assert!(!is_share_code("   <eJ"));
        assert!(!is_share_code("https://pobb.in/abc"));
        assert!(!is_share_code(""));
    }

    #[test]
    fn test_default_compression_produces_known_prefix() {
        let code = encode("<PathOfBuilding/>").unwrap();
        assert!(code.starts_with("eJ"));
    }

    #[test]
    fn test_zlib_window_bits() {
        assert_eq!(zlib_window_bits(&[0x78, 0x9C]), Some(15));
        assert_eq!(zlib_window_bits(&[0x78, 0xDA]), Some(15));
        assert_eq!(zlib_window_bits(&[0x08, 0x1D]), Some(8));
        assert_eq!(zlib_window_bits(&[0x78, 0x9D]), None);
        assert_eq!(zlib_window_bits(&[0x79, 0x9C]), None);
        assert_eq!(zlib_window_bits(&[0x78]), None);
    }

    #[test]
    fn test_is_build_document() {
        assert!(is_build_document("  <PathOfBuilding><Build/></PathOfBuilding>"));
        assert!(!is_build_document("Sure! Here is your XML: <PathOfBuilding>"));
    }
}
