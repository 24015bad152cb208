//! Frame format for value-store WAL segments
//!
//! Every frame on disk has the same envelope:
//!
//! ```text
//! [0..4]        length:  i32 LE - payload length in bytes, 1..=MAX_FRAME_BYTES
//! [4..4+len]    payload: UTF-8 JSON object discriminated by its "t" field
//! [4+len..8+len] crc:    u32 LE - CRC32C of the payload bytes
//! ```
//!
//! Payload types: `"V"` segment header, `"M"` mint record, `"S"` segment summary.
//!
//! Decoding separates two failure classes. Structural faults (bad length,
//! truncation, CRC mismatch, unparseable payload) come back as
//! `FrameRead::Corrupt` and mean "stop here, the log is incomplete". A mint
//! frame whose value-kind code is unknown is a hard `Err`: the bytes are
//! intact but were written by a format this build does not understand.

use std::borrow::Cow;
use std::io::{ErrorKind, Read};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::{WalError, WalResult};

/// Log sequence number
pub type Lsn = u64;

/// Sentinel for "no LSN". Assigned LSNs start at 1.
pub const NO_LSN: Lsn = 0;

/// Hard upper bound on a single payload (512MB)
pub const MAX_FRAME_BYTES: usize = 512 * 1024 * 1024;

/// Length prefix plus CRC trailer
pub const FRAME_OVERHEAD: usize = 8;

/// Header `ver` field written by this build
pub const FORMAT_VERSION: u32 = 1;

/// Header `engine` field
pub const ENGINE_TAG: &str = "valuestore";

/// Category of a minted term
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ValueKind {
    Namespace,
    Iri,
    BNode,
    Literal,
}

impl ValueKind {
    /// Single-letter wire code
    pub fn code(self) -> &'static str {
        match self {
            ValueKind::Namespace => "N",
            ValueKind::Iri => "I",
            ValueKind::BNode => "B",
            ValueKind::Literal => "L",
        }
    }

    /// Parse a wire code. Unknown codes are a format fault.
    pub fn from_code(code: &str) -> WalResult<Self> {
        match code {
            "N" => Ok(ValueKind::Namespace),
            "I" => Ok(ValueKind::Iri),
            "B" => Ok(ValueKind::BNode),
            "L" => Ok(ValueKind::Literal),
            other => Err(WalError::UnknownValueKind { code: other.to_string() }),
        }
    }
}

/// One minted term as recorded in the WAL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalRecord {
    pub lsn: Lsn,
    pub id: u32,
    pub kind: ValueKind,
    pub lexical: String,
    pub datatype: String,
    pub language: String,
    pub hash: i32,
}

/// First frame of every segment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentHeader {
    pub version: u32,
    pub store_uuid: String,
    pub engine: String,
    /// Creation time, seconds since the Unix epoch
    pub created: u64,
    pub sequence: u64,
    /// First id minted into the segment; 0 when the segment was opened before any mint
    pub first_id: u32,
}

impl SegmentHeader {
    pub fn new(store_uuid: &str, sequence: u64, first_id: u32) -> Self {
        let created = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        Self {
            version: FORMAT_VERSION,
            store_uuid: store_uuid.to_string(),
            engine: ENGINE_TAG.to_string(),
            created,
            sequence,
            first_id,
        }
    }
}

/// Trailing frame of a sealed segment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentSummary {
    /// Highest id minted into the segment
    pub last_id: u32,
    /// zlib CRC32 over every segment byte preceding this frame
    pub crc32: u32,
}

/// Decoded frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Header(SegmentHeader),
    Mint(WalRecord),
    Summary(SegmentSummary),
}

/// JSON shape of a payload. Encoding borrows, decoding owns.
#[derive(Serialize, Deserialize)]
#[serde(tag = "t")]
enum Payload<'a> {
    #[serde(rename = "V")]
    Header {
        ver: u32,
        store: Cow<'a, str>,
        engine: Cow<'a, str>,
        created: u64,
        segment: u64,
        #[serde(rename = "firstId", default)]
        first_id: u32,
    },
    #[serde(rename = "M")]
    Mint {
        lsn: u64,
        id: u32,
        vk: Cow<'a, str>,
        #[serde(default)]
        lex: Cow<'a, str>,
        #[serde(default)]
        dt: Cow<'a, str>,
        #[serde(default)]
        lang: Cow<'a, str>,
        hash: i32,
    },
    #[serde(rename = "S")]
    Summary {
        #[serde(rename = "lastId")]
        last_id: u32,
        crc32: u32,
    },
}

impl<'a> From<&'a Frame> for Payload<'a> {
    fn from(frame: &'a Frame) -> Self {
        match frame {
            Frame::Header(h) => Payload::Header {
                ver: h.version,
                store: Cow::Borrowed(&h.store_uuid),
                engine: Cow::Borrowed(&h.engine),
                created: h.created,
                segment: h.sequence,
                first_id: h.first_id,
            },
            Frame::Mint(r) => Payload::from(r),
            Frame::Summary(s) => Payload::Summary { last_id: s.last_id, crc32: s.crc32 },
        }
    }
}

impl<'a> From<&'a WalRecord> for Payload<'a> {
    fn from(r: &'a WalRecord) -> Self {
        Payload::Mint {
            lsn: r.lsn,
            id: r.id,
            vk: Cow::Borrowed(r.kind.code()),
            lex: Cow::Borrowed(&r.lexical),
            dt: Cow::Borrowed(&r.datatype),
            lang: Cow::Borrowed(&r.language),
            hash: r.hash,
        }
    }
}

impl Payload<'_> {
    fn into_frame(self) -> WalResult<Frame> {
        Ok(match self {
            Payload::Header { ver, store, engine, created, segment, first_id } => {
                Frame::Header(SegmentHeader {
                    version: ver,
                    store_uuid: store.into_owned(),
                    engine: engine.into_owned(),
                    created,
                    sequence: segment,
                    first_id,
                })
            }
            Payload::Mint { lsn, id, vk, lex, dt, lang, hash } => Frame::Mint(WalRecord {
                lsn,
                id,
                kind: ValueKind::from_code(&vk)?,
                lexical: lex.into_owned(),
                datatype: dt.into_owned(),
                language: lang.into_owned(),
                hash,
            }),
            Payload::Summary { last_id, crc32 } => {
                Frame::Summary(SegmentSummary { last_id, crc32 })
            }
        })
    }
}

/// Content checksum of a term, stored in each mint record.
///
/// Every call starts from a fresh CRC32C state, so the result depends only
/// on the four inputs.
pub fn value_hash(kind: ValueKind, lexical: &str, datatype: &str, language: &str) -> i32 {
    let mut crc = crc32c::crc32c(kind.code().as_bytes());
    for field in [lexical, datatype, language] {
        crc = crc32c::crc32c_append(crc, &[0]);
        crc = crc32c::crc32c_append(crc, field.as_bytes());
    }
    crc as i32
}

/// Append one encoded frame to `out`, returning the number of bytes added.
pub fn encode_frame(frame: &Frame, out: &mut Vec<u8>) -> WalResult<usize> {
    encode_payload(&Payload::from(frame), out)
}

/// Append one encoded mint frame without building a `Frame`.
pub fn encode_mint(record: &WalRecord, out: &mut Vec<u8>) -> WalResult<usize> {
    encode_payload(&Payload::from(record), out)
}

fn encode_payload(payload: &Payload<'_>, out: &mut Vec<u8>) -> WalResult<usize> {
    let payload =
        serde_json::to_vec(payload).map_err(|e| WalError::Encode { reason: e.to_string() })?;

    if payload.len() > MAX_FRAME_BYTES {
        return Err(WalError::OversizedFrame {
            frame_size: payload.len() as u64,
            max_size: MAX_FRAME_BYTES as u64,
        });
    }

    out.reserve(payload.len() + FRAME_OVERHEAD);
    out.extend_from_slice(&(payload.len() as i32).to_le_bytes());
    out.extend_from_slice(&payload);
    out.extend_from_slice(&crc32c::crc32c(&payload).to_le_bytes());
    Ok(payload.len() + FRAME_OVERHEAD)
}

/// Why decoding stopped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CorruptReason {
    /// EOF inside the 4-byte length prefix
    TruncatedLength,
    /// Length was non-positive or above MAX_FRAME_BYTES
    InvalidLength(i64),
    /// EOF inside the payload
    TruncatedPayload { expected: usize, available: usize },
    /// EOF inside the CRC trailer
    TruncatedChecksum,
    ChecksumMismatch { expected: u32, actual: u32 },
    /// CRC was valid but the payload is not a known frame
    MalformedPayload(String),
    /// The underlying stream failed (for example a damaged gzip member)
    Io(ErrorKind),
}

/// Outcome of reading one frame
#[derive(Debug)]
pub enum FrameRead {
    Frame(Frame),
    /// Clean end of stream on a frame boundary
    End,
    Corrupt { offset: u64, reason: CorruptReason },
}

/// Sequential frame decoder over any byte stream
pub struct FrameReader<R> {
    inner: R,
    offset: u64,
    raw: Vec<u8>,
}

impl<R: Read> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner, offset: 0, raw: Vec::new() }
    }

    /// Byte offset of the next frame in the (decompressed) stream
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Complete bytes (length, payload, CRC) of the frame last returned
    pub fn raw_frame(&self) -> &[u8] {
        &self.raw
    }

    /// Decode the next frame.
    ///
    /// Returns `Err` only for an unknown value kind inside an intact mint frame.
    pub fn next_frame(&mut self) -> WalResult<FrameRead> {
        let start = self.offset;
        self.raw.clear();

        let mut len_bytes = [0u8; 4];
        match read_full(&mut self.inner, &mut len_bytes) {
            Ok(0) => return Ok(FrameRead::End),
            Ok(4) => {}
            Ok(_) => return Ok(corrupt(start, CorruptReason::TruncatedLength)),
            Err(e) => return Ok(corrupt(start, CorruptReason::Io(e.kind()))),
        }

        let len = i32::from_le_bytes(len_bytes);
        if len <= 0 || len as usize > MAX_FRAME_BYTES {
            return Ok(corrupt(start, CorruptReason::InvalidLength(len as i64)));
        }
        let len = len as usize;
        self.raw.extend_from_slice(&len_bytes);

        // Grows with the bytes actually present, so a damaged length cannot
        // force a huge allocation.
        let available = match (&mut self.inner).take(len as u64).read_to_end(&mut self.raw) {
            Ok(n) => n,
            Err(e) => return Ok(corrupt(start, CorruptReason::Io(e.kind()))),
        };
        if available < len {
            return Ok(corrupt(start, CorruptReason::TruncatedPayload { expected: len, available }));
        }

        let mut crc_bytes = [0u8; 4];
        match read_full(&mut self.inner, &mut crc_bytes) {
            Ok(4) => {}
            Ok(_) => return Ok(corrupt(start, CorruptReason::TruncatedChecksum)),
            Err(e) => return Ok(corrupt(start, CorruptReason::Io(e.kind()))),
        }

        let payload = &self.raw[4..];
        let expected = u32::from_le_bytes(crc_bytes);
        let actual = crc32c::crc32c(payload);
        if expected != actual {
            return Ok(corrupt(start, CorruptReason::ChecksumMismatch { expected, actual }));
        }

        let decoded: Payload<'_> = match serde_json::from_slice(payload) {
            Ok(p) => p,
            Err(e) => return Ok(corrupt(start, CorruptReason::MalformedPayload(e.to_string()))),
        };
        let frame = decoded.into_frame()?;

        self.raw.extend_from_slice(&crc_bytes);
        self.offset += self.raw.len() as u64;
        Ok(FrameRead::Frame(frame))
    }
}

fn corrupt(offset: u64, reason: CorruptReason) -> FrameRead {
    FrameRead::Corrupt { offset, reason }
}

/// Fill `buf` as far as the stream allows; returns bytes read (short only at EOF).
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}
