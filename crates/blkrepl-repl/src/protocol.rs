//! Wire packets exchanged between the two nodes.
//!
//! Every packet is an 8-byte header `{magic: u32, command: u16, length: u16}`
//! followed by `length` payload bytes. Integers are big-endian, except for
//! bitmap words which travel little-endian exactly as they sit on disk.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{ReplError, ReplResult};
use crate::uuid::EXT_UUID_SLOTS;

/// Header magic.
pub const MAGIC: u32 = 0x8374_0267;
/// Header size in bytes.
pub const HEADER_SIZE: usize = 8;
/// Largest payload a header can describe.
pub const MAX_PAYLOAD: usize = u16::MAX as usize;
/// Bitmap words per `ReportBitMap` packet (one page including the header).
pub const BM_PACKET_WORDS: usize = (4096 - HEADER_SIZE - 8) / 8;
/// Longest authentication challenge we accept from a peer.
pub const MAX_CHALLENGE_LEN: usize = 128;

/// Command codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
#[allow(missing_docs)]
pub enum Command {
    Data = 0x00,
    DataReply = 0x01,
    RSDataReply = 0x02,
    Barrier = 0x03,
    ReportBitMap = 0x04,
    BecomeSyncTarget = 0x05,
    BecomeSyncSource = 0x06,
    UnplugRemote = 0x07,
    DataRequest = 0x08,
    RSDataRequest = 0x09,
    SyncParam = 0x0a,
    ReportProtocol = 0x0b,
    ReportUUIDs = 0x0c,
    ReportSizes = 0x0d,
    ReportState = 0x0e,
    ReportSyncUUID = 0x0f,
    AuthChallenge = 0x10,
    AuthResponse = 0x11,
    StateChgRequest = 0x12,
    Ping = 0x13,
    PingAck = 0x14,
    RecvAck = 0x15,
    WriteAck = 0x16,
    RSWriteAck = 0x17,
    DiscardAck = 0x18,
    NegAck = 0x19,
    NegDReply = 0x1a,
    NegRSDReply = 0x1b,
    BarrierAck = 0x1c,
    StateChgReply = 0x1d,
    OVRequest = 0x1e,
    OVReply = 0x1f,
    OVResult = 0x20,
    CsumRSRequest = 0x21,
    RSIsInSync = 0x22,
    SyncParam89 = 0x23,
    HandShakeM = 0xfff1,
    HandShakeS = 0xfff2,
    HandShake = 0xfffe,
}

/// Commands at or above this value may be skipped by receivers that do not know them.
pub const MAY_IGNORE: u16 = 0x100;

impl Command {
    /// Decode a command code.
    pub fn from_u16(v: u16) -> Option<Self> {
        use Command::*;
        Some(match v {
            0x00 => Data,
            0x01 => DataReply,
            0x02 => RSDataReply,
            0x03 => Barrier,
            0x04 => ReportBitMap,
            0x05 => BecomeSyncTarget,
            0x06 => BecomeSyncSource,
            0x07 => UnplugRemote,
            0x08 => DataRequest,
            0x09 => RSDataRequest,
            0x0a => SyncParam,
            0x0b => ReportProtocol,
            0x0c => ReportUUIDs,
            0x0d => ReportSizes,
            0x0e => ReportState,
            0x0f => ReportSyncUUID,
            0x10 => AuthChallenge,
            0x11 => AuthResponse,
            0x12 => StateChgRequest,
            0x13 => Ping,
            0x14 => PingAck,
            0x15 => RecvAck,
            0x16 => WriteAck,
            0x17 => RSWriteAck,
            0x18 => DiscardAck,
            0x19 => NegAck,
            0x1a => NegDReply,
            0x1b => NegRSDReply,
            0x1c => BarrierAck,
            0x1d => StateChgReply,
            0x1e => OVRequest,
            0x1f => OVReply,
            0x20 => OVResult,
            0x21 => CsumRSRequest,
            0x22 => RSIsInSync,
            0x23 => SyncParam89,
            0xfff1 => HandShakeM,
            0xfff2 => HandShakeS,
            0xfffe => HandShake,
            _ => return None,
        })
    }

    /// Whether the command travels on the meta (acknowledgement) channel.
    pub fn is_meta(self) -> bool {
        use Command::*;
        matches!(
            self,
            Ping | PingAck
                | RecvAck
                | WriteAck
                | RSWriteAck
                | DiscardAck
                | NegAck
                | NegDReply
                | NegRSDReply
                | BarrierAck
                | StateChgReply
                | OVResult
                | RSIsInSync
                | HandShakeM
        )
    }
}

/// Which of the two sockets a packet belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    /// Bulk data, bitmaps and negotiation.
    Data,
    /// Short acknowledgements and pings.
    Meta,
}

/// Acknowledgement packet types; all share the [`BlockAck`] layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum AckKind {
    RecvAck,
    WriteAck,
    RSWriteAck,
    DiscardAck,
    NegAck,
    NegDReply,
    NegRSDReply,
    RSIsInSync,
    OVResult,
}

impl AckKind {
    fn command(self) -> Command {
        match self {
            AckKind::RecvAck => Command::RecvAck,
            AckKind::WriteAck => Command::WriteAck,
            AckKind::RSWriteAck => Command::RSWriteAck,
            AckKind::DiscardAck => Command::DiscardAck,
            AckKind::NegAck => Command::NegAck,
            AckKind::NegDReply => Command::NegDReply,
            AckKind::NegRSDReply => Command::NegRSDReply,
            AckKind::RSIsInSync => Command::RSIsInSync,
            AckKind::OVResult => Command::OVResult,
        }
    }

    fn from_command(cmd: Command) -> Option<Self> {
        Some(match cmd {
            Command::RecvAck => AckKind::RecvAck,
            Command::WriteAck => AckKind::WriteAck,
            Command::RSWriteAck => AckKind::RSWriteAck,
            Command::DiscardAck => AckKind::DiscardAck,
            Command::NegAck => AckKind::NegAck,
            Command::NegDReply => AckKind::NegDReply,
            Command::NegRSDReply => AckKind::NegRSDReply,
            Command::RSIsInSync => AckKind::RSIsInSync,
            Command::OVResult => AckKind::OVResult,
            _ => return None,
        })
    }
}

/// Body of every acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockAck {
    /// First sector of the block.
    pub sector: u64,
    /// Sender-side request identifier, echoed back.
    pub block_id: u64,
    /// Size of the block in bytes.
    pub blksize: u32,
    /// Sequence number of the acknowledged write.
    pub seq_num: u32,
}

/// Body of a read, resync or verify request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockRequest {
    /// First sector.
    pub sector: u64,
    /// Requester's identifier.
    pub block_id: u64,
    /// Size in bytes.
    pub blksize: u32,
}

/// Body of a read or resync reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockReply {
    /// First sector.
    pub sector: u64,
    /// Requester's identifier.
    pub block_id: u64,
    /// Block contents.
    pub data: Bytes,
}

/// A replicated write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataPacket {
    /// First sector.
    pub sector: u64,
    /// Sender's request identifier.
    pub block_id: u64,
    /// Per-connection write sequence number.
    pub seq_num: u32,
    /// `DP_*` flags.
    pub dp_flags: u32,
    /// Integrity digest over `data`, empty when not configured.
    pub digest: Bytes,
    /// Block contents.
    pub data: Bytes,
}

/// `block_id` of resync and verify requests.
pub const ID_SYNCER: u64 = u64::MAX;
/// `block_id` of an `OVResult` for a matching block.
pub const ID_IN_SYNC: u64 = 4711;
/// `block_id` of an `OVResult` for a differing block.
pub const ID_OUT_OF_SYNC: u64 = 4712;

/// Write carries the barrier flag of the application request.
pub const DP_HARDBARRIER: u32 = 1;
/// Write was synchronous on the Primary.
pub const DP_RW_SYNC: u32 = 2;

/// One protocol packet.
#[derive(Debug, Clone, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum Packet {
    /// First packet on the data socket.
    HandShakeS,
    /// First packet on the meta socket.
    HandShakeM,
    HandShake {
        protocol_min: u32,
        protocol_max: u32,
    },
    AuthChallenge(Bytes),
    AuthResponse(Bytes),
    ReportProtocol {
        protocol: u32,
        after_sb_0p: u32,
        after_sb_1p: u32,
        after_sb_2p: u32,
        want_lose: bool,
        two_primaries: bool,
        integrity_alg: String,
    },
    ReportUuids([u64; EXT_UUID_SLOTS]),
    ReportSizes {
        d_size: u64,
        u_size: u64,
        c_size: u64,
        max_segment_size: u32,
        queue_order_type: u32,
    },
    ReportState(u32),
    ReportSyncUuid(u64),
    StateChgRequest {
        mask: u32,
        val: u32,
    },
    StateChgReply(i32),
    /// A chunk of the sender's bitmap starting at `offset` words.
    ReportBitMap {
        offset: u64,
        words: Vec<u64>,
    },
    Barrier(u32),
    BarrierAck {
        barrier: u32,
        set_size: u32,
    },
    Data(DataPacket),
    DataReply(BlockReply),
    RSDataReply(BlockReply),
    DataRequest(BlockRequest),
    RSDataRequest(BlockRequest),
    OVRequest(BlockRequest),
    CsumRSRequest {
        req: BlockRequest,
        digest: Bytes,
    },
    OVReply {
        req: BlockRequest,
        digest: Bytes,
    },
    Ack(AckKind, BlockAck),
    Ping,
    PingAck,
    UnplugRemote,
    SyncParam {
        rate: u32,
        verify_alg: String,
        csums_alg: String,
    },
    /// An optional packet we do not understand.
    Ignored(u16),
}

impl Packet {
    /// Command code of this packet.
    pub fn command(&self) -> u16 {
        use Packet::*;
        let cmd = match self {
            HandShakeS => Command::HandShakeS,
            HandShakeM => Command::HandShakeM,
            HandShake { .. } => Command::HandShake,
            AuthChallenge(_) => Command::AuthChallenge,
            AuthResponse(_) => Command::AuthResponse,
            ReportProtocol { .. } => Command::ReportProtocol,
            ReportUuids(_) => Command::ReportUUIDs,
            ReportSizes { .. } => Command::ReportSizes,
            ReportState(_) => Command::ReportState,
            ReportSyncUuid(_) => Command::ReportSyncUUID,
            StateChgRequest { .. } => Command::StateChgRequest,
            StateChgReply(_) => Command::StateChgReply,
            ReportBitMap { .. } => Command::ReportBitMap,
            Barrier(_) => Command::Barrier,
            BarrierAck { .. } => Command::BarrierAck,
            Data(_) => Command::Data,
            DataReply(_) => Command::DataReply,
            RSDataReply(_) => Command::RSDataReply,
            DataRequest(_) => Command::DataRequest,
            RSDataRequest(_) => Command::RSDataRequest,
            OVRequest(_) => Command::OVRequest,
            CsumRSRequest { .. } => Command::CsumRSRequest,
            OVReply { .. } => Command::OVReply,
            Ack(kind, _) => kind.command(),
            Ping => Command::Ping,
            PingAck => Command::PingAck,
            UnplugRemote => Command::UnplugRemote,
            SyncParam { .. } => Command::SyncParam89,
            Ignored(cmd) => return *cmd,
        };
        cmd as u16
    }

    /// The channel this packet is sent on.
    pub fn channel(&self) -> Channel {
        match Command::from_u16(self.command()) {
            Some(cmd) if cmd.is_meta() => Channel::Meta,
            _ => Channel::Data,
        }
    }

    /// Serialize header and payload into one frame.
    pub fn encode(&self) -> ReplResult<Bytes> {
        let mut p = BytesMut::new();
        use Packet::*;
        match self {
            HandShakeS | HandShakeM | Ping | PingAck | UnplugRemote | Ignored(_) => {}
            HandShake {
                protocol_min,
                protocol_max,
            } => {
                p.put_u32(*protocol_min);
                p.put_u32(*protocol_max);
            }
            AuthChallenge(b) | AuthResponse(b) => p.put_slice(b),
            ReportProtocol {
                protocol,
                after_sb_0p,
                after_sb_1p,
                after_sb_2p,
                want_lose,
                two_primaries,
                integrity_alg,
            } => {
                p.put_u32(*protocol);
                p.put_u32(*after_sb_0p);
                p.put_u32(*after_sb_1p);
                p.put_u32(*after_sb_2p);
                p.put_u32(u32::from(*want_lose));
                p.put_u32(u32::from(*two_primaries));
                p.put_slice(integrity_alg.as_bytes());
            }
            ReportUuids(u) => {
                for v in u {
                    p.put_u64(*v);
                }
            }
            ReportSizes {
                d_size,
                u_size,
                c_size,
                max_segment_size,
                queue_order_type,
            } => {
                p.put_u64(*d_size);
                p.put_u64(*u_size);
                p.put_u64(*c_size);
                p.put_u32(*max_segment_size);
                p.put_u32(*queue_order_type);
            }
            ReportState(s) => p.put_u32(*s),
            ReportSyncUuid(u) => p.put_u64(*u),
            StateChgRequest { mask, val } => {
                p.put_u32(*mask);
                p.put_u32(*val);
            }
            StateChgReply(rc) => p.put_i32(*rc),
            ReportBitMap { offset, words } => {
                if words.len() > BM_PACKET_WORDS {
                    return Err(ReplError::protocol(format!(
                        "bitmap chunk of {} words exceeds {BM_PACKET_WORDS}",
                        words.len()
                    )));
                }
                p.put_u64(*offset);
                for w in words {
                    p.put_u64_le(*w);
                }
            }
            Barrier(nr) => p.put_u32(*nr),
            BarrierAck { barrier, set_size } => {
                p.put_u32(*barrier);
                p.put_u32(*set_size);
            }
            Data(d) => {
                p.put_u64(d.sector);
                p.put_u64(d.block_id);
                p.put_u32(d.seq_num);
                p.put_u32(d.dp_flags);
                put_short_bytes(&mut p, &d.digest)?;
                p.put_slice(&d.data);
            }
            DataReply(r) | RSDataReply(r) => {
                p.put_u64(r.sector);
                p.put_u64(r.block_id);
                p.put_slice(&r.data);
            }
            DataRequest(r) | RSDataRequest(r) | OVRequest(r) => put_request(&mut p, r),
            CsumRSRequest { req, digest } | OVReply { req, digest } => {
                put_request(&mut p, req);
                p.put_slice(digest);
            }
            Ack(_, a) => {
                p.put_u64(a.sector);
                p.put_u64(a.block_id);
                p.put_u32(a.blksize);
                p.put_u32(a.seq_num);
            }
            SyncParam {
                rate,
                verify_alg,
                csums_alg,
            } => {
                p.put_u32(*rate);
                put_short_bytes(&mut p, verify_alg.as_bytes())?;
                put_short_bytes(&mut p, csums_alg.as_bytes())?;
            }
        }

        if p.len() > MAX_PAYLOAD {
            return Err(ReplError::protocol(format!(
                "payload of {} bytes does not fit a header",
                p.len()
            )));
        }
        let mut frame = BytesMut::with_capacity(HEADER_SIZE + p.len());
        frame.put_u32(MAGIC);
        frame.put_u16(self.command());
        frame.put_u16(p.len() as u16);
        frame.extend_from_slice(&p);
        Ok(frame.freeze())
    }

    /// Parse one frame.
    ///
    /// Unknown commands below [`MAY_IGNORE`] and malformed payloads are
    /// protocol errors; unknown optional commands decode as [`Packet::Ignored`].
    pub fn decode(mut frame: Bytes) -> ReplResult<Packet> {
        if frame.len() < HEADER_SIZE {
            return Err(ReplError::protocol("truncated header"));
        }
        let magic = frame.get_u32();
        if magic != MAGIC {
            return Err(ReplError::protocol(format!("magic?? on data m: {magic:#x}")));
        }
        let cmd = frame.get_u16();
        let len = frame.get_u16() as usize;
        if frame.len() != len {
            return Err(ReplError::protocol(format!(
                "length mismatch for command {cmd:#x}: header {len}, frame {}",
                frame.len()
            )));
        }

        let Some(command) = Command::from_u16(cmd) else {
            if cmd >= MAY_IGNORE {
                return Ok(Packet::Ignored(cmd));
            }
            return Err(ReplError::protocol(format!("unknown packet type {cmd:#x}")));
        };

        let mut d = Decoder { buf: frame };
        use Command as C;
        let packet = match command {
            C::HandShakeS => Packet::HandShakeS,
            C::HandShakeM => Packet::HandShakeM,
            C::HandShake => Packet::HandShake {
                protocol_min: d.u32()?,
                protocol_max: d.u32()?,
            },
            C::AuthChallenge => Packet::AuthChallenge(d.rest()),
            C::AuthResponse => Packet::AuthResponse(d.rest()),
            C::ReportProtocol => Packet::ReportProtocol {
                protocol: d.u32()?,
                after_sb_0p: d.u32()?,
                after_sb_1p: d.u32()?,
                after_sb_2p: d.u32()?,
                want_lose: d.u32()? != 0,
                two_primaries: d.u32()? != 0,
                integrity_alg: bytes_to_name(&d.rest())?,
            },
            C::ReportUUIDs => {
                let mut u = [0u64; EXT_UUID_SLOTS];
                for v in u.iter_mut() {
                    *v = d.u64()?;
                }
                Packet::ReportUuids(u)
            }
            C::ReportSizes => Packet::ReportSizes {
                d_size: d.u64()?,
                u_size: d.u64()?,
                c_size: d.u64()?,
                max_segment_size: d.u32()?,
                queue_order_type: d.u32()?,
            },
            C::ReportState => Packet::ReportState(d.u32()?),
            C::ReportSyncUUID => Packet::ReportSyncUuid(d.u64()?),
            C::StateChgRequest => Packet::StateChgRequest {
                mask: d.u32()?,
                val: d.u32()?,
            },
            C::StateChgReply => Packet::StateChgReply(d.u32()? as i32),
            C::ReportBitMap => {
                let offset = d.u64()?;
                let rest = d.rest();
                if rest.len() % 8 != 0 || rest.len() / 8 > BM_PACKET_WORDS {
                    return Err(ReplError::protocol(format!(
                        "bitmap chunk of {} bytes is malformed",
                        rest.len()
                    )));
                }
                let words = rest
                    .chunks_exact(8)
                    .map(|c| {
                        let mut w = [0u8; 8];
                        w.copy_from_slice(c);
                        u64::from_le_bytes(w)
                    })
                    .collect();
                Packet::ReportBitMap { offset, words }
            }
            C::Barrier => Packet::Barrier(d.u32()?),
            C::BarrierAck => Packet::BarrierAck {
                barrier: d.u32()?,
                set_size: d.u32()?,
            },
            C::Data => Packet::Data(DataPacket {
                sector: d.u64()?,
                block_id: d.u64()?,
                seq_num: d.u32()?,
                dp_flags: d.u32()?,
                digest: d.short_bytes()?,
                data: d.rest(),
            }),
            C::DataReply | C::RSDataReply => {
                let r = BlockReply {
                    sector: d.u64()?,
                    block_id: d.u64()?,
                    data: d.rest(),
                };
                if command == C::DataReply {
                    Packet::DataReply(r)
                } else {
                    Packet::RSDataReply(r)
                }
            }
            C::DataRequest => Packet::DataRequest(d.request()?),
            C::RSDataRequest => Packet::RSDataRequest(d.request()?),
            C::OVRequest => Packet::OVRequest(d.request()?),
            C::CsumRSRequest => Packet::CsumRSRequest {
                req: d.request()?,
                digest: d.rest(),
            },
            C::OVReply => Packet::OVReply {
                req: d.request()?,
                digest: d.rest(),
            },
            C::Ping => Packet::Ping,
            C::PingAck => Packet::PingAck,
            C::UnplugRemote => Packet::UnplugRemote,
            C::SyncParam | C::SyncParam89 => Packet::SyncParam {
                rate: d.u32()?,
                verify_alg: bytes_to_name(&d.short_bytes()?)?,
                csums_alg: bytes_to_name(&d.short_bytes()?)?,
            },
            C::BecomeSyncTarget | C::BecomeSyncSource => {
                return Err(ReplError::protocol(format!(
                    "unexpected obsolete packet {command:?}"
                )));
            }
            other => match AckKind::from_command(other) {
                Some(kind) => Packet::Ack(
                    kind,
                    BlockAck {
                        sector: d.u64()?,
                        block_id: d.u64()?,
                        blksize: d.u32()?,
                        seq_num: d.u32()?,
                    },
                ),
                None => {
                    return Err(ReplError::protocol(format!("unexpected packet {other:?}")));
                }
            },
        };

        if d.buf.has_remaining() {
            return Err(ReplError::protocol(format!(
                "{} trailing bytes after {command:?}",
                d.buf.remaining()
            )));
        }
        Ok(packet)
    }
}

fn put_request(p: &mut BytesMut, r: &BlockRequest) {
    p.put_u64(r.sector);
    p.put_u64(r.block_id);
    p.put_u32(r.blksize);
}

fn put_short_bytes(p: &mut BytesMut, b: &[u8]) -> ReplResult<()> {
    let len = u8::try_from(b.len())
        .map_err(|_| ReplError::protocol(format!("field of {} bytes too long", b.len())))?;
    p.put_u8(len);
    p.put_slice(b);
    Ok(())
}

fn bytes_to_name(b: &[u8]) -> ReplResult<String> {
    let end = b.iter().position(|&c| c == 0).unwrap_or(b.len());
    String::from_utf8(b[..end].to_vec())
        .map_err(|_| ReplError::protocol("algorithm name is not valid UTF-8"))
}

struct Decoder {
    buf: Bytes,
}

impl Decoder {
    fn ensure_available(&self, len: usize) -> ReplResult<()> {
        if self.buf.remaining() < len {
            return Err(ReplError::protocol("truncated data"));
        }
        Ok(())
    }

    fn u32(&mut self) -> ReplResult<u32> {
        self.ensure_available(4)?;
        Ok(self.buf.get_u32())
    }

    fn u64(&mut self) -> ReplResult<u64> {
        self.ensure_available(8)?;
        Ok(self.buf.get_u64())
    }

    fn short_bytes(&mut self) -> ReplResult<Bytes> {
        self.ensure_available(1)?;
        let len = self.buf.get_u8() as usize;
        self.ensure_available(len)?;
        Ok(self.buf.split_to(len))
    }

    fn request(&mut self) -> ReplResult<BlockRequest> {
        Ok(BlockRequest {
            sector: self.u64()?,
            block_id: self.u64()?,
            blksize: self.u32()?,
        })
    }

    fn rest(&mut self) -> Bytes {
        let len = self.buf.remaining();
        self.buf.split_to(len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(p: Packet) -> Packet {
        Packet::decode(p.encode().unwrap()).unwrap()
    }

    #[test]
    fn test_header_layout() {
        let frame = Packet::ReportState(0x1234).encode().unwrap();
        assert_eq!(&frame[..4], &MAGIC.to_be_bytes());
        assert_eq!(&frame[4..6], &(Command::ReportState as u16).to_be_bytes());
        assert_eq!(&frame[6..8], &4u16.to_be_bytes());
        assert_eq!(&frame[8..], &0x1234u32.to_be_bytes());
    }

    #[test]
    fn test_data_packet_with_digest() {
        let p = Packet::Data(DataPacket {
            sector: 8,
            block_id: 77,
            seq_num: 3,
            dp_flags: DP_RW_SYNC,
            digest: Bytes::from_static(&[9; 32]),
            data: Bytes::from(vec![0xAB; 4096]),
        });
        assert_eq!(round_trip(p.clone()), p);
        assert_eq!(p.channel(), Channel::Data);
    }

    #[test]
    fn test_bitmap_words_little_endian() {
        let frame = Packet::ReportBitMap {
            offset: 2,
            words: vec![1],
        }
        .encode()
        .unwrap();
        assert_eq!(&frame[HEADER_SIZE + 8..], &1u64.to_le_bytes());
        let too_many = Packet::ReportBitMap {
            offset: 0,
            words: vec![0; BM_PACKET_WORDS + 1],
        };
        assert!(too_many.encode().is_err());
    }

    #[test]
    fn test_report_protocol_alg_name() {
        let p = Packet::ReportProtocol {
            protocol: 3,
            after_sb_0p: 0,
            after_sb_1p: 0,
            after_sb_2p: 0,
            want_lose: true,
            two_primaries: false,
            integrity_alg: "sha256".to_string(),
        };
        assert_eq!(round_trip(p.clone()), p);
    }

    #[test]
    fn test_ack_channel() {
        let p = Packet::Ack(
            AckKind::WriteAck,
            BlockAck {
                sector: 16,
                block_id: 5,
                blksize: 4096,
                seq_num: 9,
            },
        );
        assert_eq!(p.channel(), Channel::Meta);
        assert_eq!(round_trip(p.clone()), p);
        assert_eq!(Packet::BarrierAck { barrier: 1, set_size: 2 }.channel(), Channel::Meta);
        assert_eq!(Packet::Barrier(1).channel(), Channel::Data);
        assert_eq!(Packet::StateChgRequest { mask: 0, val: 0 }.channel(), Channel::Data);
        assert_eq!(Packet::StateChgReply(1).channel(), Channel::Meta);
    }

    #[test]
    fn test_bad_magic_and_truncation() {
        let mut raw = BytesMut::new();
        raw.put_u32(0xdeadbeef);
        raw.put_u16(Command::Ping as u16);
        raw.put_u16(0);
        assert!(Packet::decode(raw.freeze()).is_err());

        let mut raw = BytesMut::new();
        raw.put_u32(MAGIC);
        raw.put_u16(Command::Barrier as u16);
        raw.put_u16(2);
        raw.put_u16(7);
        let err = Packet::decode(raw.freeze()).unwrap_err();
        assert!(err.to_string().contains("truncated"));
    }

    #[test]
    fn test_unknown_commands() {
        let mut raw = BytesMut::new();
        raw.put_u32(MAGIC);
        raw.put_u16(0x0150);
        raw.put_u16(3);
        raw.put_slice(&[1, 2, 3]);
        assert_eq!(Packet::decode(raw.freeze()).unwrap(), Packet::Ignored(0x150));

        let mut raw = BytesMut::new();
        raw.put_u32(MAGIC);
        raw.put_u16(0x0050);
        raw.put_u16(0);
        assert!(Packet::decode(raw.freeze()).is_err());
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let mut raw = BytesMut::new();
        raw.put_u32(MAGIC);
        raw.put_u16(Command::ReportState as u16);
        raw.put_u16(6);
        raw.put_u32(1);
        raw.put_u16(0);
        assert!(Packet::decode(raw.freeze()).is_err());
    }

    #[test]
    fn test_sync_param_names() {
        let p = Packet::SyncParam {
            rate: 250,
            verify_alg: "sha256".to_string(),
            csums_alg: String::new(),
        };
        assert_eq!(round_trip(p.clone()), p);
    }
}
