//! Command specific package bodies.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;

use super::{Command, DecodeError};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct PingBody {}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct FindPeerBody {
    #[serde(rename = "i")]
    pub taskid: u32,

    #[serde(rename = "t")]
    pub target: String,

    #[serde(default, rename = "s", skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,

    /// Peers the lookup already reached.
    #[serde(default, rename = "r", skip_serializing_if = "Vec::is_empty")]
    pub reached: Vec<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct GetValueBody {
    #[serde(rename = "i")]
    pub taskid: u32,

    #[serde(rename = "n")]
    pub table: String,

    #[serde(default, rename = "k", skip_serializing_if = "Vec::is_empty")]
    pub keys: Vec<String>,

    /// Non zero asks for the closest keys instead of exact matches.
    #[serde(default, rename = "f", skip_serializing_if = "is_zero")]
    pub fuzzy: u8,

    #[serde(default, rename = "s", skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,

    #[serde(default, rename = "r", skip_serializing_if = "Vec::is_empty")]
    pub reached: Vec<String>,

    /// Found values, in responses.
    #[serde(default, rename = "v", skip_serializing_if = "BTreeMap::is_empty")]
    pub values: BTreeMap<String, String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct SaveValueBody {
    #[serde(rename = "i")]
    pub taskid: u32,

    #[serde(rename = "n")]
    pub table: String,

    #[serde(default, rename = "v", skip_serializing_if = "BTreeMap::is_empty")]
    pub values: BTreeMap<String, String>,

    #[serde(default, rename = "s", skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,

    #[serde(default, rename = "r", skip_serializing_if = "Vec::is_empty")]
    pub reached: Vec<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct BroadcastEventBody {
    #[serde(rename = "i")]
    pub taskid: u32,

    /// Peer that emitted the event.
    #[serde(rename = "o")]
    pub source: String,

    #[serde(rename = "e")]
    pub event_id: u32,

    #[serde(default, rename = "d")]
    pub event: ByteBuf,

    #[serde(default, rename = "s", skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,

    #[serde(default, rename = "r", skip_serializing_if = "Vec::is_empty")]
    pub reached: Vec<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
/// Ask an agency to reach `target` for us, the response carries the
/// agency's endpoints for `target`.
pub struct HoleCallBody {
    #[serde(rename = "i")]
    pub taskid: u32,

    #[serde(rename = "t")]
    pub target: String,

    #[serde(default, rename = "e", skip_serializing_if = "Vec::is_empty")]
    pub eplist: Vec<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
/// Sent by an agency: `source` is about to handshake with us.
pub struct HoleCalledBody {
    #[serde(rename = "i")]
    pub taskid: u32,

    #[serde(rename = "o")]
    pub source: String,

    #[serde(default, rename = "e", skip_serializing_if = "Vec::is_empty")]
    pub eplist: Vec<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct HandshakeBody {
    #[serde(rename = "i")]
    pub taskid: u32,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct PieceBody {
    #[serde(rename = "i")]
    pub taskid: u32,

    #[serde(rename = "p")]
    pub sender: String,

    /// Index of the last piece.
    #[serde(rename = "m")]
    pub max: u32,

    #[serde(rename = "n")]
    pub no: u32,

    #[serde(default, rename = "b", skip_serializing_if = "is_empty_buf")]
    pub buf: ByteBuf,
}

fn is_zero(value: &u8) -> bool {
    *value == 0
}

fn is_empty_buf(buf: &ByteBuf) -> bool {
    buf.is_empty()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Body {
    Ping(PingBody),
    FindPeer(FindPeerBody),
    GetValue(GetValueBody),
    SaveValue(SaveValueBody),
    BroadcastEvent(BroadcastEventBody),
    HoleCall(HoleCallBody),
    HoleCalled(HoleCalledBody),
    Handshake(HandshakeBody),
    Piece(PieceBody),
}

impl Body {
    pub fn command(&self) -> Command {
        match self {
            Body::Ping(_) => Command::Ping,
            Body::FindPeer(_) => Command::FindPeer,
            Body::GetValue(_) => Command::GetValue,
            Body::SaveValue(_) => Command::SaveValue,
            Body::BroadcastEvent(_) => Command::BroadcastEvent,
            Body::HoleCall(_) => Command::HoleCall,
            Body::HoleCalled(_) => Command::HoleCalled,
            Body::Handshake(_) => Command::Handshake,
            Body::Piece(_) => Command::PackagePiece,
        }
    }

    /// Task id echoed between a request and its response, pings have none.
    pub fn taskid(&self) -> Option<u32> {
        match self {
            Body::Ping(_) => None,
            Body::FindPeer(b) => Some(b.taskid),
            Body::GetValue(b) => Some(b.taskid),
            Body::SaveValue(b) => Some(b.taskid),
            Body::BroadcastEvent(b) => Some(b.taskid),
            Body::HoleCall(b) => Some(b.taskid),
            Body::HoleCalled(b) => Some(b.taskid),
            Body::Handshake(b) => Some(b.taskid),
            Body::Piece(b) => Some(b.taskid),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_bencode::Error> {
        match self {
            Body::Ping(b) => serde_bencode::to_bytes(b),
            Body::FindPeer(b) => serde_bencode::to_bytes(b),
            Body::GetValue(b) => serde_bencode::to_bytes(b),
            Body::SaveValue(b) => serde_bencode::to_bytes(b),
            Body::BroadcastEvent(b) => serde_bencode::to_bytes(b),
            Body::HoleCall(b) => serde_bencode::to_bytes(b),
            Body::HoleCalled(b) => serde_bencode::to_bytes(b),
            Body::Handshake(b) => serde_bencode::to_bytes(b),
            Body::Piece(b) => serde_bencode::to_bytes(b),
        }
    }

    pub fn from_bytes(command: Command, bytes: &[u8]) -> Result<Body, DecodeError> {
        Ok(match command {
            Command::Ping => Body::Ping(serde_bencode::from_bytes(bytes)?),
            Command::FindPeer => Body::FindPeer(serde_bencode::from_bytes(bytes)?),
            Command::GetValue => Body::GetValue(serde_bencode::from_bytes(bytes)?),
            Command::SaveValue => Body::SaveValue(serde_bencode::from_bytes(bytes)?),
            Command::BroadcastEvent => Body::BroadcastEvent(serde_bencode::from_bytes(bytes)?),
            Command::HoleCall => Body::HoleCall(serde_bencode::from_bytes(bytes)?),
            Command::HoleCalled => Body::HoleCalled(serde_bencode::from_bytes(bytes)?),
            Command::Handshake => Body::Handshake(serde_bencode::from_bytes(bytes)?),
            Command::PackagePiece => Body::Piece(serde_bencode::from_bytes(bytes)?),
        })
    }
}
