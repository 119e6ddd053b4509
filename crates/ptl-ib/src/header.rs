//! Fragment wire headers.
//!
//! Every fragment starts with a fixed 56-byte base header. Rendezvous start
//! and ack fragments append a 24-byte remote handle; FIN and FIN-ACK append
//! the 16-byte `{mr_addr, mr_size}` of the region to release. All fields are
//! written in native byte order: peers run on a homogeneous fabric.
//!
//! ```text
//! 0      1      2        4      8         16        24          32        40            48         52    56
//! | kind | flags| rsvd   | seq  | src_req | dst_req | match_bits | msg_len | frag_offset | frag_len | pad |
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Length of the base header.
pub const BASE_HEADER_LEN: usize = 56;
/// Length of the remote handle extension.
pub const HANDLE_EXT_LEN: usize = 24;
/// Length of the FIN extension.
pub const FIN_EXT_LEN: usize = 16;
/// Largest header of any fragment kind.
pub const MAX_HEADER_LEN: usize = BASE_HEADER_LEN + HANDLE_EXT_LEN;

/// Header decoding errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HeaderError {
    /// Fewer bytes than the header of this kind needs.
    #[error("header truncated: need {needed} bytes, have {available}")]
    Truncated {
        /// Bytes required.
        needed: usize,
        /// Bytes present.
        available: usize,
    },

    /// The kind byte is not a known fragment kind.
    #[error("unknown fragment kind {0}")]
    UnknownKind(u8),

    /// The extension does not match the fragment kind.
    #[error("{kind:?} fragment with mismatched extension")]
    ExtensionMismatch {
        /// The declared kind.
        kind: FragKind,
    },
}

/// Fragment kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum FragKind {
    /// Inline payload follows the header.
    Eager = 1,
    /// Rendezvous start advertising the source region.
    Rndv = 2,
    /// Receiver answer advertising the destination region.
    Ack = 3,
    /// Sender notice that every RDMA write landed.
    Fin = 4,
    /// Receiver notice that the destination region was released.
    FinAck = 5,
}

impl FragKind {
    /// Parses the kind byte.
    pub fn from_u8(b: u8) -> Result<Self, HeaderError> {
        match b {
            1 => Ok(FragKind::Eager),
            2 => Ok(FragKind::Rndv),
            3 => Ok(FragKind::Ack),
            4 => Ok(FragKind::Fin),
            5 => Ok(FragKind::FinAck),
            other => Err(HeaderError::UnknownKind(other)),
        }
    }

    /// Length of the full header for this kind.
    pub fn header_len(self) -> usize {
        match self {
            FragKind::Eager => BASE_HEADER_LEN,
            FragKind::Rndv | FragKind::Ack => BASE_HEADER_LEN + HANDLE_EXT_LEN,
            FragKind::Fin | FragKind::FinAck => BASE_HEADER_LEN + FIN_EXT_LEN,
        }
    }
}

/// Fields common to every fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BaseHeader {
    /// Fragment kind.
    pub kind: FragKind,
    /// Messaging-layer flags passed through to the peer.
    pub flags: u8,
    /// Per-request fragment sequence number.
    pub seq: u32,
    /// Sender's request cookie.
    pub src_req: u64,
    /// Receiver's message cookie, zero until the receiver answered.
    pub dst_req: u64,
    /// Opaque messaging-layer match information.
    pub match_bits: u64,
    /// Total message length.
    pub msg_len: u64,
    /// Offset of this fragment's data within the message.
    pub frag_offset: u64,
    /// Inline payload bytes following the header.
    pub frag_len: u32,
}

impl BaseHeader {
    /// Creates a header of `kind` with every other field zero.
    pub fn new(kind: FragKind) -> Self {
        Self {
            kind,
            flags: 0,
            seq: 0,
            src_req: 0,
            dst_req: 0,
            match_bits: 0,
            msg_len: 0,
            frag_offset: 0,
            frag_len: 0,
        }
    }
}

/// A registered region advertised to the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RemoteHandle {
    /// Start address.
    pub addr: u64,
    /// Length in bytes.
    pub size: u64,
    /// Remote key.
    pub rkey: u32,
}

/// Region released at the end of a rendezvous.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FinHeader {
    /// Start address of the region.
    pub mr_addr: u64,
    /// Length of the region.
    pub mr_size: u64,
}

/// Kind-specific trailer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Extension {
    /// Eager fragments carry none.
    None,
    /// Rendezvous start and ack.
    Handle(RemoteHandle),
    /// FIN and FIN-ACK.
    Fin(FinHeader),
}

/// A complete fragment header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FragHeader {
    /// Common fields.
    pub base: BaseHeader,
    /// Kind-specific trailer.
    pub ext: Extension,
}

impl FragHeader {
    /// Header for an eager fragment.
    pub fn eager(base: BaseHeader) -> Self {
        Self {
            base: BaseHeader {
                kind: FragKind::Eager,
                ..base
            },
            ext: Extension::None,
        }
    }

    /// Header for a fragment carrying a remote handle (`Rndv` or `Ack`).
    pub fn with_handle(base: BaseHeader, handle: RemoteHandle) -> Self {
        Self {
            base,
            ext: Extension::Handle(handle),
        }
    }

    /// Header for a fragment carrying a FIN extension (`Fin` or `FinAck`).
    pub fn with_fin(base: BaseHeader, fin: FinHeader) -> Self {
        Self {
            base,
            ext: Extension::Fin(fin),
        }
    }

    /// Fragment kind.
    pub fn kind(&self) -> FragKind {
        self.base.kind
    }

    /// Encoded length.
    pub fn encoded_len(&self) -> usize {
        self.base.kind.header_len()
    }

    /// The remote handle, for `Rndv` and `Ack`.
    pub fn handle(&self) -> Option<RemoteHandle> {
        match self.ext {
            Extension::Handle(h) => Some(h),
            _ => None,
        }
    }

    /// The FIN extension, for `Fin` and `FinAck`.
    pub fn fin(&self) -> Option<FinHeader> {
        match self.ext {
            Extension::Fin(f) => Some(f),
            _ => None,
        }
    }

    /// Checks that the extension matches the kind.
    pub fn validate(&self) -> Result<(), HeaderError> {
        let ok = matches!(
            (self.base.kind, &self.ext),
            (FragKind::Eager, Extension::None)
                | (FragKind::Rndv | FragKind::Ack, Extension::Handle(_))
                | (FragKind::Fin | FragKind::FinAck, Extension::Fin(_))
        );
        if ok {
            Ok(())
        } else {
            Err(HeaderError::ExtensionMismatch {
                kind: self.base.kind,
            })
        }
    }

    /// Writes the header in native byte order.
    pub fn encode<B: BufMut>(&self, buf: &mut B) -> Result<(), HeaderError> {
        self.validate()?;
        let b = &self.base;
        buf.put_u8(b.kind as u8);
        buf.put_u8(b.flags);
        buf.put_u16_ne(0);
        buf.put_u32_ne(b.seq);
        buf.put_u64_ne(b.src_req);
        buf.put_u64_ne(b.dst_req);
        buf.put_u64_ne(b.match_bits);
        buf.put_u64_ne(b.msg_len);
        buf.put_u64_ne(b.frag_offset);
        buf.put_u32_ne(b.frag_len);
        buf.put_u32_ne(0);
        match self.ext {
            Extension::None => {}
            Extension::Handle(h) => {
                buf.put_u64_ne(h.addr);
                buf.put_u64_ne(h.size);
                buf.put_u32_ne(h.rkey);
                buf.put_u32_ne(0);
            }
            Extension::Fin(f) => {
                buf.put_u64_ne(f.mr_addr);
                buf.put_u64_ne(f.mr_size);
            }
        }
        Ok(())
    }

    /// Encodes into a fresh buffer.
    pub fn to_bytes(&self) -> Result<Bytes, HeaderError> {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode(&mut buf)?;
        Ok(buf.freeze())
    }

    /// Reads a header, leaving `buf` positioned at the inline payload.
    pub fn decode<B: Buf>(buf: &mut B) -> Result<Self, HeaderError> {
        if buf.remaining() < BASE_HEADER_LEN {
            return Err(HeaderError::Truncated {
                needed: BASE_HEADER_LEN,
                available: buf.remaining(),
            });
        }
        let kind = FragKind::from_u8(buf.chunk()[0])?;
        let needed = kind.header_len();
        if buf.remaining() < needed {
            return Err(HeaderError::Truncated {
                needed,
                available: buf.remaining(),
            });
        }
        buf.advance(1);
        let flags = buf.get_u8();
        let _reserved = buf.get_u16_ne();
        let base = BaseHeader {
            kind,
            flags,
            seq: buf.get_u32_ne(),
            src_req: buf.get_u64_ne(),
            dst_req: buf.get_u64_ne(),
            match_bits: buf.get_u64_ne(),
            msg_len: buf.get_u64_ne(),
            frag_offset: buf.get_u64_ne(),
            frag_len: buf.get_u32_ne(),
        };
        let _pad = buf.get_u32_ne();
        let ext = match kind {
            FragKind::Eager => Extension::None,
            FragKind::Rndv | FragKind::Ack => {
                let handle = RemoteHandle {
                    addr: buf.get_u64_ne(),
                    size: buf.get_u64_ne(),
                    rkey: buf.get_u32_ne(),
                };
                let _pad = buf.get_u32_ne();
                Extension::Handle(handle)
            }
            FragKind::Fin | FragKind::FinAck => Extension::Fin(FinHeader {
                mr_addr: buf.get_u64_ne(),
                mr_size: buf.get_u64_ne(),
            }),
        };
        Ok(Self { base, ext })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn base(kind: FragKind) -> BaseHeader {
        BaseHeader {
            kind,
            flags: 0x3,
            seq: 9,
            src_req: 0x1111,
            dst_req: 0x2222,
            match_bits: 0xdead_beef,
            msg_len: 1 << 20,
            frag_offset: 4096,
            frag_len: 512,
        }
    }

    #[test]
    fn test_fin_roundtrip_preserves_handle() {
        let fin = FinHeader {
            mr_addr: 0x7f00_1234_5000,
            mr_size: 1 << 20,
        };
        let hdr = FragHeader::with_fin(base(FragKind::Fin), fin);
        let bytes = hdr.to_bytes().unwrap();
        assert_eq!(bytes.len(), BASE_HEADER_LEN + FIN_EXT_LEN);
        assert_eq!(bytes.len() % 8, 0);

        let decoded = FragHeader::decode(&mut bytes.clone()).unwrap();
        assert_eq!(decoded, hdr);
        let got = decoded.fin().unwrap();
        assert_eq!(got.mr_addr, 0x7f00_1234_5000);
        assert_eq!(got.mr_size, 1 << 20);
    }

    #[test]
    fn test_layout_offsets() {
        let hdr = FragHeader::eager(base(FragKind::Eager));
        let bytes = hdr.to_bytes().unwrap();
        assert_eq!(bytes.len(), BASE_HEADER_LEN);
        assert_eq!(bytes[0], FragKind::Eager as u8);
        assert_eq!(bytes[1], 0x3);
        assert_eq!(&bytes[4..8], &9u32.to_ne_bytes());
        assert_eq!(&bytes[8..16], &0x1111u64.to_ne_bytes());
        assert_eq!(&bytes[24..32], &0xdead_beefu64.to_ne_bytes());
        assert_eq!(&bytes[48..52], &512u32.to_ne_bytes());
    }

    #[test]
    fn test_handle_extension_len() {
        let hdr = FragHeader::with_handle(
            base(FragKind::Rndv),
            RemoteHandle {
                addr: 0x1000,
                size: 8192,
                rkey: 0x8000_0007,
            },
        );
        let bytes = hdr.to_bytes().unwrap();
        assert_eq!(bytes.len(), MAX_HEADER_LEN);
        let decoded = FragHeader::decode(&mut &bytes[..]).unwrap();
        assert_eq!(decoded.handle().unwrap().rkey, 0x8000_0007);
    }

    #[test]
    fn test_decode_leaves_payload() {
        let hdr = FragHeader::eager(base(FragKind::Eager));
        let mut buf = BytesMut::new();
        hdr.encode(&mut buf).unwrap();
        buf.put_slice(b"payload");
        let mut cursor = buf.freeze();
        FragHeader::decode(&mut cursor).unwrap();
        assert_eq!(&cursor[..], b"payload");
    }

    #[test]
    fn test_truncated() {
        let bytes = FragHeader::with_fin(base(FragKind::Fin), FinHeader { mr_addr: 1, mr_size: 2 })
            .to_bytes()
            .unwrap();
        let err = FragHeader::decode(&mut &bytes[..60]).unwrap_err();
        assert_eq!(
            err,
            HeaderError::Truncated {
                needed: 72,
                available: 60
            }
        );
        assert!(FragHeader::decode(&mut &bytes[..10]).is_err());
    }

    #[test]
    fn test_unknown_kind() {
        let mut bytes = vec![0u8; BASE_HEADER_LEN];
        bytes[0] = 42;
        assert_eq!(
            FragHeader::decode(&mut &bytes[..]).unwrap_err(),
            HeaderError::UnknownKind(42)
        );
    }

    #[test]
    fn test_mismatched_extension_rejected() {
        let hdr = FragHeader {
            base: base(FragKind::Fin),
            ext: Extension::None,
        };
        assert!(matches!(
            hdr.to_bytes(),
            Err(HeaderError::ExtensionMismatch { kind: FragKind::Fin })
        ));
    }

    fn arb_base() -> impl Strategy<Value = BaseHeader> {
        (
            any::<u8>(),
            any::<u32>(),
            any::<u64>(),
            any::<u64>(),
            any::<u64>(),
            any::<u64>(),
            any::<u64>(),
            any::<u32>(),
        )
            .prop_map(|(flags, seq, src_req, dst_req, match_bits, msg_len, frag_offset, frag_len)| {
                BaseHeader {
                    kind: FragKind::Eager,
                    flags,
                    seq,
                    src_req,
                    dst_req,
                    match_bits,
                    msg_len,
                    frag_offset,
                    frag_len,
                }
            })
    }

    proptest! {
        #[test]
        fn prop_fin_roundtrip(b in arb_base(), mr_addr in any::<u64>(), mr_size in any::<u64>(), ack in any::<bool>()) {
            let kind = if ack { FragKind::FinAck } else { FragKind::Fin };
            let hdr = FragHeader::with_fin(BaseHeader { kind, ..b }, FinHeader { mr_addr, mr_size });
            let bytes = hdr.to_bytes().unwrap();
            prop_assert_eq!(FragHeader::decode(&mut &bytes[..]).unwrap(), hdr);
        }
    }
}
