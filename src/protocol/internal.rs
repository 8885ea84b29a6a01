use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::common::ServiceDescriptor;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct WireCommon {
    #[serde(rename = "sp")]
    pub src_peerid: String,

    #[serde(default, rename = "se", skip_serializing_if = "Vec::is_empty")]
    pub src_eplist: Vec<String>,

    #[serde(default, rename = "ss", skip_serializing_if = "Option::is_none")]
    pub src_services: Option<ServiceDescriptor>,

    #[serde(default, rename = "sa", skip_serializing_if = "Option::is_none")]
    pub src_additional_info: Option<BTreeMap<String, String>>,

    #[serde(rename = "dp")]
    pub dest_peerid: String,

    #[serde(default, rename = "de", skip_serializing_if = "Option::is_none")]
    pub dest_ep: Option<String>,

    #[serde(default, rename = "n", skip_serializing_if = "Vec::is_empty")]
    pub nodes: Vec<WireNode>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct WireNode {
    #[serde(rename = "i")]
    pub id: String,

    #[serde(default, rename = "e")]
    pub eplist: Vec<String>,
}

impl WireCommon {
    pub fn from_bytes(bytes: &[u8]) -> Result<WireCommon, serde_bencode::Error> {
        serde_bencode::from_bytes(bytes)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_bencode::Error> {
        serde_bencode::to_bytes(self)
    }
}
