// DNS wire codec
//
// Just enough of RFC 1035 for the resolver client: encode a recursive A or
// AAAA question, decode the answer section of the reply. Name compression
// pointers are handled on the skip path; the client never needs the
// decompressed names themselves.

use crate::error::{ClusterError, Result};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

pub(crate) const QTYPE_A: u16 = 1;
pub(crate) const QTYPE_AAAA: u16 = 28;
const CLASS_IN: u16 = 1;
const HEADER_SIZE: usize = 12;
const FLAG_RESPONSE: u16 = 0x8000;
const FLAG_RECURSION_DESIRED: u16 = 0x0100;
const RCODE_NAME_ERROR: u16 = 3;

/// Addresses and the smallest TTL from one response's answer section.
#[derive(Debug, Clone)]
pub(crate) struct DnsAnswer {
    pub addresses: Vec<IpAddr>,
    pub min_ttl: u32,
}

/// Build one recursive query for `domain`.
pub(crate) fn encode_query(id: u16, domain: &str, qtype: u16) -> Result<Vec<u8>> {
    let name = domain.trim_end_matches('.');
    if name.is_empty() || name.len() > 253 {
        return Err(ClusterError::UnknownDomain(domain.to_string()));
    }

    let mut buf = Vec::with_capacity(HEADER_SIZE + name.len() + 6);
    buf.extend_from_slice(&id.to_be_bytes());
    buf.extend_from_slice(&FLAG_RECURSION_DESIRED.to_be_bytes());
    buf.extend_from_slice(&1u16.to_be_bytes()); // questions
    buf.extend_from_slice(&0u16.to_be_bytes()); // answers
    buf.extend_from_slice(&0u16.to_be_bytes()); // authority
    buf.extend_from_slice(&0u16.to_be_bytes()); // additional

    for label in name.split('.') {
        if label.is_empty() || label.len() > 63 {
            return Err(ClusterError::UnknownDomain(domain.to_string()));
        }
        buf.push(label.len() as u8);
        buf.extend_from_slice(label.as_bytes());
    }
    buf.push(0);
    buf.extend_from_slice(&qtype.to_be_bytes());
    buf.extend_from_slice(&CLASS_IN.to_be_bytes());
    Ok(buf)
}

fn read_u16(buf: &[u8], pos: usize) -> Result<u16> {
    let bytes = buf
        .get(pos..pos + 2)
        .ok_or_else(|| ClusterError::ServerError("truncated DNS response".to_string()))?;
    Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
}

fn read_u32(buf: &[u8], pos: usize) -> Result<u32> {
    let bytes = buf
        .get(pos..pos + 4)
        .ok_or_else(|| ClusterError::ServerError("truncated DNS response".to_string()))?;
    Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

/// Advance past one (possibly compressed) name.
fn skip_name(buf: &[u8], mut pos: usize) -> Result<usize> {
    loop {
        let len = *buf
            .get(pos)
            .ok_or_else(|| ClusterError::ServerError("truncated DNS name".to_string()))?;
        if len == 0 {
            return Ok(pos + 1);
        }
        if len & 0xC0 == 0xC0 {
            // Compression pointer terminates the name.
            return Ok(pos + 2);
        }
        pos += 1 + len as usize;
    }
}

/// Parse a response, returning every A/AAAA address in the answer section.
pub(crate) fn decode_response(buf: &[u8], expected_id: u16, domain: &str) -> Result<DnsAnswer> {
    if buf.len() < HEADER_SIZE {
        return Err(ClusterError::ServerError(
            "truncated DNS response".to_string(),
        ));
    }

    let id = read_u16(buf, 0)?;
    if id != expected_id {
        return Err(ClusterError::ServerError(format!(
            "response id mismatch: expected {}, got {}",
            expected_id, id
        )));
    }

    let flags = read_u16(buf, 2)?;
    if flags & FLAG_RESPONSE == 0 {
        return Err(ClusterError::ServerError(
            "not a DNS response".to_string(),
        ));
    }
    match flags & 0x000F {
        0 => {}
        RCODE_NAME_ERROR => return Err(ClusterError::UnknownDomain(domain.to_string())),
        rcode => {
            return Err(ClusterError::ServerError(format!(
                "DNS server returned rcode {}",
                rcode
            )))
        }
    }

    let questions = read_u16(buf, 4)?;
    let answers = read_u16(buf, 6)?;

    let mut pos = HEADER_SIZE;
    for _ in 0..questions {
        pos = skip_name(buf, pos)?;
        pos += 4; // qtype + qclass
    }

    let mut addresses = Vec::new();
    let mut min_ttl = u32::MAX;
    for _ in 0..answers {
        pos = skip_name(buf, pos)?;
        let rtype = read_u16(buf, pos)?;
        let ttl = read_u32(buf, pos + 4)?;
        let rdlength = read_u16(buf, pos + 8)? as usize;
        pos += 10;
        let rdata = buf
            .get(pos..pos + rdlength)
            .ok_or_else(|| ClusterError::ServerError("truncated DNS rdata".to_string()))?;
        pos += rdlength;

        match (rtype, rdlength) {
            (QTYPE_A, 4) => {
                let octets: [u8; 4] = rdata.try_into().expect("length checked");
                addresses.push(IpAddr::V4(Ipv4Addr::from(octets)));
                min_ttl = min_ttl.min(ttl);
            }
            (QTYPE_AAAA, 16) => {
                let octets: [u8; 16] = rdata.try_into().expect("length checked");
                addresses.push(IpAddr::V6(Ipv6Addr::from(octets)));
                min_ttl = min_ttl.min(ttl);
            }
            // CNAMEs and anything else in the answer section are skipped.
            _ => {}
        }
    }

    if addresses.is_empty() {
        return Err(ClusterError::UnknownDomain(domain.to_string()));
    }

    Ok(DnsAnswer {
        addresses,
        min_ttl: if min_ttl == u32::MAX { 0 } else { min_ttl },
    })
}
