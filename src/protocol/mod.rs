//! Binary package framing: a fixed 36 byte little-endian header, a bencoded
//! command body and a bencoded common section describing both peers.

mod body;
mod internal;
pub mod piece;

use std::collections::BTreeMap;

use bytes::{Buf, BufMut};

use crate::common::{Endpoint, Hash, NatType, PeerInfo, ServiceDescriptor};

use internal::{WireCommon, WireNode};

pub use body::*;

pub const HEADER_SIZE: usize = 36;
pub const MAGIC: u16 = 0x4448;
pub const VERSION: u16 = 1;
/// Set on the command type of every response.
pub const RESPONSE_FLAG: u16 = 0x80;

/// UDP MTU budget for a whole package.
pub const DEFAULT_PACKAGE_LIMIT: usize = 1450;
pub const DEFAULT_MAX_TTL: u8 = 5;
/// Largest package `totalLength` can describe, fragmented or not.
pub const MAX_PACKAGE_SIZE: usize = u16::MAX as usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Command {
    Ping = 1,
    FindPeer = 2,
    GetValue = 3,
    SaveValue = 4,
    BroadcastEvent = 5,
    HoleCall = 6,
    HoleCalled = 7,
    Handshake = 8,
    PackagePiece = 9,
}

impl Command {
    pub fn from_u16(value: u16) -> Option<Command> {
        Some(match value {
            1 => Command::Ping,
            2 => Command::FindPeer,
            3 => Command::GetValue,
            4 => Command::SaveValue,
            5 => Command::BroadcastEvent,
            6 => Command::HoleCall,
            7 => Command::HoleCalled,
            8 => Command::Handshake,
            9 => Command::PackagePiece,
            _ => return None,
        })
    }

    /// Fragments carry no common section.
    pub fn is_fragment(&self) -> bool {
        matches!(self, Command::PackagePiece)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub command: Command,
    pub is_response: bool,
    pub appid: u32,
    pub src_hash: u32,
    /// Seconds the sender has been online.
    pub src_online_duration: u32,
    pub src_nat_type: NatType,
    pub dest_hash: u32,
    pub seq: u32,
    /// Seq of the request a response answers, 0 in requests.
    pub ack_seq: u32,
    pub ttl: u8,
}

impl Header {
    pub fn cmd_type(&self) -> u16 {
        let cmd = self.command as u16;
        if self.is_response {
            cmd | RESPONSE_FLAG
        } else {
            cmd
        }
    }

    fn write(&self, buf: &mut Vec<u8>, total_length: u16, body_length: u16) {
        buf.put_u16_le(MAGIC);
        buf.put_u16_le(VERSION);
        buf.put_u16_le(self.cmd_type());
        buf.put_u16_le(total_length);
        buf.put_u32_le(self.appid);
        buf.put_u16_le(body_length);
        buf.put_u32_le(self.src_hash);
        buf.put_u32_le(self.src_online_duration);
        buf.put_u8(self.src_nat_type.as_u8());
        buf.put_u32_le(self.dest_hash);
        buf.put_u32_le(self.seq);
        buf.put_u32_le(self.ack_seq);
        buf.put_u8(self.ttl);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
/// Who sent a package, who it is for, and referrals.
pub struct Common {
    /// Sender description, only `peerid` is mandatory.
    pub src: PeerInfo,
    pub dest_peerid: String,
    /// The endpoint the sender used to reach us, telling us our public mapping.
    pub dest_ep: Option<Endpoint>,
    /// Referral nodes, `peerid` and `eplist` only.
    pub nodes: Vec<PeerInfo>,
}

impl Common {
    fn to_wire(&self) -> WireCommon {
        WireCommon {
            src_peerid: self.src.peerid.clone(),
            src_eplist: self.src.eplist.iter().map(|ep| ep.to_string()).collect(),
            src_services: (!self.src.services.is_empty()).then(|| self.src.services.clone()),
            src_additional_info: (!self.src.additional_info.is_empty())
                .then(|| self.src.additional_info.clone()),
            dest_peerid: self.dest_peerid.clone(),
            dest_ep: self.dest_ep.map(|ep| ep.to_string()),
            nodes: self
                .nodes
                .iter()
                .map(|node| WireNode {
                    id: node.peerid.clone(),
                    eplist: node.eplist.iter().map(|ep| ep.to_string()).collect(),
                })
                .collect(),
        }
    }

    fn from_wire(wire: WireCommon) -> Result<Common, DecodeError> {
        let mut nodes = Vec::with_capacity(wire.nodes.len());
        for node in wire.nodes {
            let eplist = parse_eplist(&node.eplist);
            if node.id.is_empty() || eplist.is_empty() {
                return Err(DecodeError::InvalidReferral);
            }
            nodes.push(PeerInfo {
                peerid: node.id,
                eplist,
                ..Default::default()
            });
        }

        Ok(Common {
            src: PeerInfo {
                peerid: wire.src_peerid,
                eplist: parse_eplist(&wire.src_eplist),
                services: wire.src_services.unwrap_or_else(ServiceDescriptor::new),
                additional_info: wire.src_additional_info.unwrap_or_else(BTreeMap::new),
            },
            dest_peerid: wire.dest_peerid,
            dest_ep: wire.dest_ep.and_then(|ep| ep.parse().ok()),
            nodes,
        })
    }
}

/// Parse endpoint strings, skipping the ones that are malformed.
pub fn parse_eplist(eplist: &[String]) -> Vec<Endpoint> {
    eplist.iter().filter_map(|ep| ep.parse().ok()).collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Package {
    pub header: Header,
    pub body: Body,
    /// Absent only in fragments.
    pub common: Option<Common>,
}

impl Package {
    // === Getters ===

    pub fn command(&self) -> Command {
        self.header.command
    }

    pub fn is_response(&self) -> bool {
        self.header.is_response
    }

    pub fn src_peerid(&self) -> Option<&str> {
        self.common.as_ref().map(|c| c.src.peerid.as_str())
    }

    pub fn nodes(&self) -> &[PeerInfo] {
        self.common
            .as_ref()
            .map(|c| c.nodes.as_slice())
            .unwrap_or_default()
    }

    // === Encoding ===

    pub fn to_bytes(&self) -> Result<Vec<u8>, EncodeError> {
        let body = self.body.to_bytes()?;
        let common = match &self.common {
            Some(common) => common.to_wire().to_bytes()?,
            None => Vec::new(),
        };

        let total_length = HEADER_SIZE + body.len() + common.len();
        let (Ok(total), Ok(body_length)) =
            (u16::try_from(total_length), u16::try_from(body.len()))
        else {
            return Err(EncodeError::TooLarge(total_length));
        };

        let mut buf = Vec::with_capacity(total_length);
        self.header.write(&mut buf, total, body_length);
        buf.extend_from_slice(&body);
        buf.extend_from_slice(&common);

        Ok(buf)
    }

    /// Encoded size of a request carrying `body` from `src` to `dest_peerid`,
    /// without referrals or destination endpoint.
    pub fn request_len(body: &Body, src: &PeerInfo, dest_peerid: &str) -> Result<usize, EncodeError> {
        let common = Common {
            src: src.clone(),
            dest_peerid: dest_peerid.to_string(),
            dest_ep: None,
            nodes: Vec::new(),
        };

        Ok(HEADER_SIZE + body.to_bytes()?.len() + common.to_wire().to_bytes()?.len())
    }

    /// Encode, dropping referral nodes from the end until the package fits `limit`.
    ///
    /// Returns an oversized encoding when even zero referrals don't fit.
    pub fn to_bytes_within(&mut self, limit: usize) -> Result<Vec<u8>, EncodeError> {
        loop {
            let can_shrink = self.common.as_ref().is_some_and(|c| !c.nodes.is_empty());

            match self.to_bytes() {
                Ok(bytes) if bytes.len() <= limit || !can_shrink => return Ok(bytes),
                Err(EncodeError::TooLarge(_)) if can_shrink => {}
                Err(error) => return Err(error),
                Ok(_) => {}
            }

            if let Some(common) = self.common.as_mut() {
                common.nodes.pop();
            }
        }
    }

    // === Decoding ===

    /// Decode and validate a package, clamping its ttl to `max_ttl`.
    pub fn from_bytes(bytes: &[u8], max_ttl: u8) -> Result<Package, DecodeError> {
        if bytes.len() < HEADER_SIZE {
            return Err(DecodeError::Truncated(bytes.len()));
        }

        let mut buf = bytes;

        let magic = buf.get_u16_le();
        if magic != MAGIC {
            return Err(DecodeError::BadMagic(magic));
        }
        let version = buf.get_u16_le();
        if version != VERSION {
            return Err(DecodeError::UnsupportedVersion(version));
        }
        let cmd_type = buf.get_u16_le();
        let total_length = buf.get_u16_le() as usize;
        let appid = buf.get_u32_le();
        let body_length = buf.get_u16_le() as usize;
        let src_hash = buf.get_u32_le();
        let src_online_duration = buf.get_u32_le();
        let src_nat_type = NatType::from_u8(buf.get_u8());
        let dest_hash = buf.get_u32_le();
        let seq = buf.get_u32_le();
        let ack_seq = buf.get_u32_le();
        let ttl = buf.get_u8().min(max_ttl);

        if total_length != bytes.len() || HEADER_SIZE + body_length > total_length {
            return Err(DecodeError::LengthMismatch {
                declared: total_length,
                actual: bytes.len(),
            });
        }

        let command = Command::from_u16(cmd_type & !RESPONSE_FLAG)
            .ok_or(DecodeError::UnknownCommand(cmd_type))?;
        let is_response = cmd_type & RESPONSE_FLAG != 0;

        if src_hash == 0 || dest_hash == 0 {
            return Err(DecodeError::MissingHash);
        }
        if is_response && ack_seq == 0 {
            return Err(DecodeError::MissingAckSeq);
        }

        let body_bytes = &bytes[HEADER_SIZE..HEADER_SIZE + body_length];
        let common_bytes = &bytes[HEADER_SIZE + body_length..];

        let body = Body::from_bytes(command, body_bytes)?;

        let common = if command.is_fragment() {
            None
        } else {
            if common_bytes.is_empty() {
                return Err(DecodeError::MissingPeerid);
            }
            let common = Common::from_wire(WireCommon::from_bytes(common_bytes)?)?;
            if common.src.peerid.is_empty() || common.dest_peerid.is_empty() {
                return Err(DecodeError::MissingPeerid);
            }
            Some(common)
        };

        // Wire hashes are advisory, routing always uses the recomputed one.
        let src_hash = match &common {
            Some(common) => {
                let computed = Hash::of(&common.src.peerid);
                if !computed.matches_wire(src_hash) {
                    tracing::trace!(
                        context = "protocol",
                        peerid = %common.src.peerid,
                        wire = src_hash,
                        "Recomputed mismatching source hash"
                    );
                }
                computed.as_u32()
            }
            None => src_hash,
        };

        Ok(Package {
            header: Header {
                command,
                is_response,
                appid,
                src_hash,
                src_online_duration,
                src_nat_type,
                dest_hash,
                seq,
                ack_seq,
                ttl,
            },
            body,
            common,
        })
    }
}

#[derive(thiserror::Error, Debug)]
/// Reasons an outbound package can't be encoded.
pub enum EncodeError {
    #[error("Package of {0} bytes overflows the u16 length fields")]
    TooLarge(usize),

    #[error("Failed to bencode section: {0}")]
    Bencode(#[from] serde_bencode::Error),
}

#[derive(thiserror::Error, Debug)]
/// Reasons an inbound package is dropped.
pub enum DecodeError {
    #[error("Package shorter than the header: {0} bytes")]
    Truncated(usize),

    #[error("Unexpected magic {0:#06x}")]
    BadMagic(u16),

    #[error("Unsupported protocol version {0}")]
    UnsupportedVersion(u16),

    #[error("Declared length {declared} doesn't match {actual} received bytes")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("Unknown command type {0:#06x}")]
    UnknownCommand(u16),

    #[error("Missing source or destination hash")]
    MissingHash,

    #[error("Missing source or destination peerid")]
    MissingPeerid,

    #[error("Response without ack seq")]
    MissingAckSeq,

    #[error("Referral node without id or parsable endpoints")]
    InvalidReferral,

    #[error("Failed to parse bencoded section: {0}")]
    Bencode(#[from] serde_bencode::Error),
}

#[cfg(test)]
mod test {
    use std::net::SocketAddr;

    use super::*;

    fn udp(port: u16) -> Endpoint {
        Endpoint::udp(SocketAddr::from(([10, 0, 0, 1], port)))
    }

    fn header(command: Command, is_response: bool) -> Header {
        Header {
            command,
            is_response,
            appid: 42,
            src_hash: Hash::of("alice").as_u32(),
            src_online_duration: 3600,
            src_nat_type: NatType::RestrictedNat,
            dest_hash: Hash::of("bob").as_u32(),
            seq: 7,
            ack_seq: if is_response { 3 } else { 0 },
            ttl: 2,
        }
    }

    fn common() -> Common {
        let mut src = PeerInfo::new("alice").with_endpoint(udp(4000));
        src.services
            .signin("chat", crate::common::ServiceRole::Server);
        src.additional_info
            .insert("version".to_string(), "1".to_string());

        Common {
            src,
            dest_peerid: "bob".to_string(),
            dest_ep: Some(udp(5000)),
            nodes: vec![PeerInfo::new("carol").with_endpoint(udp(6000))],
        }
    }

    fn package(body: Body, is_response: bool) -> Package {
        let command = body.command();
        Package {
            header: header(command, is_response),
            common: (!command.is_fragment()).then(common),
            body,
        }
    }

    #[test]
    fn header_layout() {
        let package = package(Body::Ping(PingBody {}), false);
        let bytes = package.to_bytes().unwrap();

        assert_eq!(&bytes[0..2], &MAGIC.to_le_bytes());
        assert_eq!(&bytes[2..4], &VERSION.to_le_bytes());
        assert_eq!(&bytes[4..6], &1u16.to_le_bytes());
        assert_eq!(&bytes[6..8], &(bytes.len() as u16).to_le_bytes());
        assert_eq!(&bytes[8..12], &42u32.to_le_bytes());
        assert_eq!(&bytes[12..14], &2u16.to_le_bytes()); // "de"
        assert_eq!(&bytes[18..22], &3600u32.to_le_bytes());
        assert_eq!(bytes[22], NatType::RestrictedNat as u8);
        assert_eq!(&bytes[27..31], &7u32.to_le_bytes());
        assert_eq!(bytes[35], 2);
        assert_eq!(&bytes[36..38], b"de");
    }

    #[test]
    fn response_flag() {
        let package = package(Body::Ping(PingBody {}), true);
        let bytes = package.to_bytes().unwrap();

        assert_eq!(&bytes[4..6], &(1u16 | RESPONSE_FLAG).to_le_bytes());
    }

    #[test]
    fn every_command_round_trips() {
        let bodies = vec![
            Body::Ping(PingBody {}),
            Body::FindPeer(FindPeerBody {
                taskid: 1,
                target: "dave".to_string(),
                service: Some("chat".to_string()),
                reached: vec!["alice".to_string()],
            }),
            Body::GetValue(GetValueBody {
                taskid: 2,
                table: "t".to_string(),
                keys: vec!["k".to_string()],
                fuzzy: 1,
                values: BTreeMap::from([("k".to_string(), "v".to_string())]),
                ..Default::default()
            }),
            Body::SaveValue(SaveValueBody {
                taskid: 3,
                table: "t".to_string(),
                values: BTreeMap::from([("k".to_string(), "v".to_string())]),
                ..Default::default()
            }),
            Body::BroadcastEvent(BroadcastEventBody {
                taskid: 4,
                source: "alice".to_string(),
                event_id: 9,
                event: serde_bytes::ByteBuf::from(b"hello".to_vec()),
                ..Default::default()
            }),
            Body::HoleCall(HoleCallBody {
                taskid: 5,
                target: "dave".to_string(),
                eplist: vec![udp(7000).to_string()],
            }),
            Body::HoleCalled(HoleCalledBody {
                taskid: 6,
                source: "alice".to_string(),
                eplist: vec![udp(4000).to_string()],
            }),
            Body::Handshake(HandshakeBody { taskid: 7 }),
            Body::Piece(PieceBody {
                taskid: 8,
                sender: "alice".to_string(),
                max: 2,
                no: 1,
                buf: serde_bytes::ByteBuf::from(vec![1, 2, 3]),
            }),
        ];

        for body in bodies {
            for is_response in [false, true] {
                let package = package(body.clone(), is_response);
                let decoded = Package::from_bytes(&package.to_bytes().unwrap(), 5).unwrap();

                assert_eq!(decoded, package);
            }
        }
    }

    #[test]
    fn ttl_is_clamped() {
        let mut package = package(Body::Ping(PingBody {}), false);
        package.header.ttl = 200;

        let decoded = Package::from_bytes(&package.to_bytes().unwrap(), 5).unwrap();
        assert_eq!(decoded.header.ttl, 5);
    }

    #[test]
    fn validation() {
        let valid = package(Body::Ping(PingBody {}), false);

        let bytes = valid.to_bytes().unwrap();
        assert!(matches!(
            Package::from_bytes(&bytes[..20], 5),
            Err(DecodeError::Truncated(20))
        ));
        assert!(matches!(
            Package::from_bytes(&bytes[..bytes.len() - 1], 5),
            Err(DecodeError::LengthMismatch { .. })
        ));

        let mut bad_magic = bytes.clone();
        bad_magic[0] = 0;
        assert!(matches!(
            Package::from_bytes(&bad_magic, 5),
            Err(DecodeError::BadMagic(_))
        ));

        let mut no_hash = valid.clone();
        no_hash.header.dest_hash = 0;
        assert!(matches!(
            Package::from_bytes(&no_hash.to_bytes().unwrap(), 5),
            Err(DecodeError::MissingHash)
        ));

        let mut no_ack = package(Body::Ping(PingBody {}), true);
        no_ack.header.ack_seq = 0;
        assert!(matches!(
            Package::from_bytes(&no_ack.to_bytes().unwrap(), 5),
            Err(DecodeError::MissingAckSeq)
        ));

        let mut no_peerid = valid.clone();
        if let Some(common) = no_peerid.common.as_mut() {
            common.dest_peerid.clear();
        }
        assert!(matches!(
            Package::from_bytes(&no_peerid.to_bytes().unwrap(), 5),
            Err(DecodeError::MissingPeerid)
        ));

        let mut bad_referral = valid.clone();
        if let Some(common) = bad_referral.common.as_mut() {
            common.nodes.push(PeerInfo::new("eve"));
        }
        assert!(matches!(
            Package::from_bytes(&bad_referral.to_bytes().unwrap(), 5),
            Err(DecodeError::InvalidReferral)
        ));
    }

    #[test]
    fn mismatching_wire_hash_is_recomputed() {
        let mut package = package(Body::Ping(PingBody {}), false);
        package.header.src_hash = 12345;

        let decoded = Package::from_bytes(&package.to_bytes().unwrap(), 5).unwrap();
        assert_eq!(decoded.header.src_hash, Hash::of("alice").as_u32());
    }

    #[test]
    fn referrals_shrink_to_fit() {
        let mut package = package(Body::Ping(PingBody {}), false);
        if let Some(common) = package.common.as_mut() {
            common.nodes = (0..200)
                .map(|i| PeerInfo::new(format!("node-{i:04}")).with_endpoint(udp(i + 1)))
                .collect();
        }

        let bytes = package.to_bytes_within(DEFAULT_PACKAGE_LIMIT).unwrap();
        assert!(bytes.len() <= DEFAULT_PACKAGE_LIMIT);

        let decoded = Package::from_bytes(&bytes, 5).unwrap();
        let kept = decoded.nodes().len();
        assert!(kept > 0 && kept < 200);
        assert_eq!(decoded.nodes()[0].peerid, "node-0000");
    }

    #[test]
    fn referral_with_only_garbage_endpoints() {
        let valid = package(Body::Ping(PingBody {}), false);
        let body = valid.body.to_bytes().unwrap();

        let mut wire = common().to_wire();
        wire.nodes = vec![WireNode {
            id: "eve".to_string(),
            eplist: vec!["not an endpoint".to_string()],
        }];
        let common = wire.to_bytes().unwrap();

        let total = HEADER_SIZE + body.len() + common.len();
        let mut bytes = Vec::new();
        valid
            .header
            .write(&mut bytes, total as u16, body.len() as u16);
        bytes.extend_from_slice(&body);
        bytes.extend_from_slice(&common);

        assert!(matches!(
            Package::from_bytes(&bytes, 5),
            Err(DecodeError::InvalidReferral)
        ));
    }

    #[test]
    fn too_large_for_length_fields() {
        let mut package = package(
            Body::SaveValue(SaveValueBody {
                taskid: 3,
                table: "t".to_string(),
                values: BTreeMap::from([("k".to_string(), "x".repeat(MAX_PACKAGE_SIZE))]),
                ..Default::default()
            }),
            false,
        );

        assert!(matches!(package.to_bytes(), Err(EncodeError::TooLarge(_))));
        assert!(matches!(
            package.to_bytes_within(DEFAULT_PACKAGE_LIMIT),
            Err(EncodeError::TooLarge(_))
        ));
    }
}
