//! A small, purpose-built DNS message codec covering exactly the subset
//! this resolver needs: the 12-byte header, the first question, and
//! A/CNAME answer records. Not a general DNS stack -- recursion, multiple
//! questions, and record types outside A/CNAME are out of scope.

use std::net::Ipv4Addr;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("message too short to contain a valid header")]
    Truncated,
    #[error("malformed or empty name")]
    MalformedName,
}

/// DNS response codes this resolver emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseCode {
    NoError,
    FormErr,
    ServFail,
    NxDomain,
    Refused,
}

impl ResponseCode {
    fn code(self) -> u16 {
        match self {
            ResponseCode::NoError => 0,
            ResponseCode::FormErr => 1,
            ResponseCode::ServFail => 2,
            ResponseCode::NxDomain => 3,
            ResponseCode::Refused => 5,
        }
    }
}

/// Query types this resolver understands; anything else is carried through
/// as `Other` so the answer section can still mirror the question type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QType {
    A,
    Cname,
    Other(u16),
}

impl QType {
    fn from_u16(v: u16) -> Self {
        match v {
            1 => QType::A,
            5 => QType::Cname,
            other => QType::Other(other),
        }
    }

    fn to_u16(self) -> u16 {
        match self {
            QType::A => 1,
            QType::Cname => 5,
            QType::Other(v) => v,
        }
    }
}

/// A parsed query: the header fields needed to mirror a response, plus the
/// first (and only) question considered.
#[derive(Debug, Clone)]
pub struct Query {
    pub id: u16,
    pub opcode: u8,
    pub name: String,
    pub qtype: QType,
}

/// A single authoritative answer record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Answer {
    A(Ipv4Addr),
    Cname(String),
}

const ANSWER_TTL: u32 = 60;

/// Parse a query message, considering only the header and the first
/// question.
pub fn parse_query(buf: &[u8]) -> Result<Query, WireError> {
    if buf.len() < 12 {
        return Err(WireError::Truncated);
    }
    let id = u16::from_be_bytes([buf[0], buf[1]]);
    let flags = u16::from_be_bytes([buf[2], buf[3]]);
    let opcode = ((flags >> 11) & 0x0F) as u8;
    let qdcount = u16::from_be_bytes([buf[4], buf[5]]);
    if qdcount == 0 {
        return Err(WireError::MalformedName);
    }

    let (name, offset) = read_name(buf, 12)?;
    if buf.len() < offset + 4 {
        return Err(WireError::Truncated);
    }
    let qtype = QType::from_u16(u16::from_be_bytes([buf[offset], buf[offset + 1]]));

    Ok(Query {
        id,
        opcode,
        name,
        qtype,
    })
}

/// Read a name starting at `offset`. Compression pointers are tolerated
/// (skipped over, not followed) since a well-formed first question never
/// needs one; this keeps the parser a fixed-size single pass.
fn read_name(buf: &[u8], mut offset: usize) -> Result<(String, usize), WireError> {
    let mut labels = Vec::new();
    let start = offset;
    loop {
        let len = *buf.get(offset).ok_or(WireError::Truncated)? as usize;
        if len == 0 {
            offset += 1;
            break;
        }
        if len & 0xC0 == 0xC0 {
            if buf.len() < offset + 2 {
                return Err(WireError::Truncated);
            }
            offset += 2;
            break;
        }
        let label_start = offset + 1;
        let label_end = label_start + len;
        let label = buf.get(label_start..label_end).ok_or(WireError::Truncated)?;
        labels.push(String::from_utf8_lossy(label).to_ascii_lowercase());
        offset = label_end;
    }
    if offset == start {
        return Err(WireError::MalformedName);
    }
    Ok((labels.join("."), offset))
}

fn write_name(out: &mut Vec<u8>, name: &str) {
    if name.is_empty() {
        out.push(0);
        return;
    }
    for label in name.split('.') {
        out.push(label.len() as u8);
        out.extend_from_slice(label.as_bytes());
    }
    out.push(0);
}

/// Build a response mirroring `query`'s id, opcode, and question, with
/// `QR=1`, `AA=1` when there are answers, `RA=0`.
pub fn build_response(query: &Query, rcode: ResponseCode, answers: &[Answer]) -> Vec<u8> {
    let mut out = Vec::with_capacity(64);
    out.extend_from_slice(&query.id.to_be_bytes());

    let mut flags: u16 = 0x8000; // QR
    flags |= (query.opcode as u16) << 11;
    if !answers.is_empty() {
        flags |= 0x0400; // AA
    }
    flags |= rcode.code();
    out.extend_from_slice(&flags.to_be_bytes());

    out.extend_from_slice(&1u16.to_be_bytes()); // qdcount
    out.extend_from_slice(&(answers.len() as u16).to_be_bytes());
    out.extend_from_slice(&0u16.to_be_bytes()); // nscount
    out.extend_from_slice(&0u16.to_be_bytes()); // arcount

    write_name(&mut out, &query.name);
    out.extend_from_slice(&query.qtype.to_u16().to_be_bytes());
    out.extend_from_slice(&1u16.to_be_bytes()); // IN

    for answer in answers {
        write_name(&mut out, &query.name);
        match answer {
            Answer::A(addr) => {
                out.extend_from_slice(&1u16.to_be_bytes());
                out.extend_from_slice(&1u16.to_be_bytes());
                out.extend_from_slice(&ANSWER_TTL.to_be_bytes());
                out.extend_from_slice(&4u16.to_be_bytes());
                out.extend_from_slice(&addr.octets());
            }
            Answer::Cname(target) => {
                out.extend_from_slice(&5u16.to_be_bytes());
                out.extend_from_slice(&1u16.to_be_bytes());
                out.extend_from_slice(&ANSWER_TTL.to_be_bytes());
                let mut rdata = Vec::new();
                write_name(&mut rdata, target);
                out.extend_from_slice(&(rdata.len() as u16).to_be_bytes());
                out.extend_from_slice(&rdata);
            }
        }
    }

    out
}

/// Build an error response (FORMERR, typically) when the query itself
/// could not be parsed far enough to build a [`Query`]. Mirrors the id if
/// the header was at least readable, else uses `0`.
pub fn build_header_only_error(buf: &[u8], rcode: ResponseCode) -> Vec<u8> {
    let id = if buf.len() >= 2 {
        u16::from_be_bytes([buf[0], buf[1]])
    } else {
        0
    };
    let mut out = Vec::with_capacity(12);
    out.extend_from_slice(&id.to_be_bytes());
    let flags: u16 = 0x8000 | rcode.code();
    out.extend_from_slice(&flags.to_be_bytes());
    out.extend_from_slice(&0u16.to_be_bytes()); // qdcount
    out.extend_from_slice(&0u16.to_be_bytes()); // ancount
    out.extend_from_slice(&0u16.to_be_bytes()); // nscount
    out.extend_from_slice(&0u16.to_be_bytes()); // arcount
    out
}
