use std::net::IpAddr;
use anyhow::{anyhow, Error};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use crate::data::Trace;

/// One trace as printed by a capture command, a JSON object per line.
/// `timestamp` and `node` may be left out; the receiving agent stamps
/// them.
#[derive(Debug, Deserialize)]
struct Raw {
    timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    node:      String,
    #[serde(default)]
    pod:       String,
    srciface:  String,
    dstiface:  String,
    srcip:     IpAddr,
    dstip:     IpAddr,
    #[serde(default)]
    srcport:   u32,
    #[serde(default)]
    dstport:   u32,
}

impl TryFrom<&[u8]> for Trace {
    type Error = Error;

    fn try_from(buf: &[u8]) -> Result<Self, Self::Error> {
        let raw: Raw = serde_json::from_slice(buf).map_err(|e| {
            anyhow!("invalid trace line: {}", e)
        })?;

        let srcport = u16::try_from(raw.srcport)?;
        let dstport = u16::try_from(raw.dstport)?;

        Ok(Self {
            timestamp: raw.timestamp.unwrap_or_else(Utc::now),
            node:      raw.node,
            pod:       raw.pod,
            src_iface: raw.srciface,
            dst_iface: raw.dstiface,
            src_ip:    raw.srcip.to_string(),
            dst_ip:    raw.dstip.to_string(),
            src_port:  srcport.into(),
            dst_port:  dstport.into(),
        })
    }
}
