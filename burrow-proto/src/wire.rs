//! RFC 1035 wire parsing and rendering, with EDNS0 OPT handling.
//!
//! Rendering writes names without compression (always legal). Parsing
//! accepts compression pointers anywhere a name may appear. Parse failures
//! distinguish a message that simply ended early from one that is
//! structurally malformed; the response classifier treats the two
//! differently.

use std::net::{Ipv4Addr, Ipv6Addr};

use thiserror::Error;

use crate::{
    message::{Flags, Message, MessageName, Opcode, Question, Rcode, Section},
    name::{MAX_LABEL_LEN, Name},
    rdata::{Rclass, Rdata, RdataType},
    rdataset::Rdataset,
};

/// Wire-format errors.
#[derive(Debug, Error)]
pub enum WireError {
    /// The buffer ended before the message was complete.
    ///
    /// `question_ok` records whether the header and question section were
    /// intact, and `truncated` whether the header had TC set; the
    /// classifier needs both to decide between a TCP retry and writing the
    /// server off.
    #[error("message ended unexpectedly")]
    UnexpectedEnd { question_ok: bool, truncated: bool },

    /// The message violates the wire format.
    #[error("malformed message: {0}")]
    FormErr(&'static str),

    /// A compression pointer loops or points forward.
    #[error("bad compression pointer")]
    BadPointer,

    /// A name exceeded the 255-octet limit while being decoded.
    #[error("name too long")]
    NameTooLong,

    /// The rendered message does not fit in the available buffer.
    #[error("message does not fit in {0} bytes")]
    NoSpace(usize),
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    const fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len().saturating_sub(self.pos)
    }

    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        if self.remaining() < n {
            return None;
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Some(out)
    }

    fn u8(&mut self) -> Option<u8> {
        self.take(1).map(|b| b[0])
    }

    fn u16(&mut self) -> Option<u16> {
        self.take(2).map(|b| u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Option<u32> {
        self.take(4)
            .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Reads a possibly-compressed name starting at the cursor.
    fn name(&mut self) -> Result<Name, NameParseFault> {
        let mut labels: Vec<&'a [u8]> = Vec::new();
        let mut wire_len = 1usize;
        let mut jump_pos: Option<usize> = None;
        let mut pos = self.pos;
        let mut jumps = 0u32;

        loop {
            let Some(&len) = self.buf.get(pos) else {
                return Err(NameParseFault::Truncated);
            };
            match len {
                0 => {
                    if jump_pos.is_none() {
                        self.pos = pos + 1;
                    }
                    let name =
                        Name::from_labels(labels).map_err(|_| NameParseFault::Malformed)?;
                    return Ok(name);
                }
                1..=63 => {
                    let end = pos + 1 + len as usize;
                    let Some(label) = self.buf.get(pos + 1..end) else {
                        return Err(NameParseFault::Truncated);
                    };
                    wire_len += label.len() + 1;
                    if wire_len > crate::name::MAX_NAME_LEN {
                        return Err(NameParseFault::Malformed);
                    }
                    labels.push(label);
                    pos = end;
                }
                0xC0..=0xFF => {
                    let Some(&low) = self.buf.get(pos + 1) else {
                        return Err(NameParseFault::Truncated);
                    };
                    let target = usize::from(u16::from_be_bytes([len & 0x3F, low]));
                    // Pointers must point backwards; bound the chase.
                    if target >= pos || jumps > 64 {
                        return Err(NameParseFault::BadPointer);
                    }
                    if jump_pos.is_none() {
                        jump_pos = Some(pos + 2);
                        self.pos = pos + 2;
                    }
                    jumps += 1;
                    pos = target;
                }
                _ => return Err(NameParseFault::Malformed),
            }
        }
    }
}

enum NameParseFault {
    Truncated,
    Malformed,
    BadPointer,
}

struct HeaderInfo {
    question_ok: bool,
    truncated: bool,
}

impl HeaderInfo {
    fn unexpected_end(&self) -> WireError {
        WireError::UnexpectedEnd {
            question_ok: self.question_ok,
            truncated: self.truncated,
        }
    }

    fn name_fault(&self, fault: NameParseFault) -> WireError {
        match fault {
            NameParseFault::Truncated => self.unexpected_end(),
            NameParseFault::Malformed => WireError::FormErr("bad name"),
            NameParseFault::BadPointer => WireError::BadPointer,
        }
    }
}

impl Message {
    /// Parses a message from wire format.
    ///
    /// # Errors
    ///
    /// Returns [`WireError::UnexpectedEnd`] when the buffer ends early
    /// (carrying whether the question section survived and whether TC was
    /// set), and [`WireError::FormErr`] or [`WireError::BadPointer`] for
    /// structural faults.
    pub fn from_wire(buf: &[u8]) -> Result<Self, WireError> {
        let mut cur = Cursor::new(buf);
        let mut info = HeaderInfo {
            question_ok: false,
            truncated: false,
        };

        let id = cur.u16().ok_or_else(|| info.unexpected_end())?;
        let flagword = cur.u16().ok_or_else(|| info.unexpected_end())?;

        let flags = Flags {
            qr: flagword & 0x8000 != 0,
            aa: flagword & 0x0400 != 0,
            tc: flagword & 0x0200 != 0,
            rd: flagword & 0x0100 != 0,
            ra: flagword & 0x0080 != 0,
        };
        info.truncated = flags.tc;
        #[allow(clippy::cast_possible_truncation)]
        let opcode = Opcode::from_u8(((flagword >> 11) & 0xF) as u8);
        #[allow(clippy::cast_possible_truncation)]
        let rcode = Rcode::from_u8((flagword & 0xF) as u8);

        let qdcount = cur.u16().ok_or_else(|| info.unexpected_end())?;
        let ancount = cur.u16().ok_or_else(|| info.unexpected_end())?;
        let nscount = cur.u16().ok_or_else(|| info.unexpected_end())?;
        let arcount = cur.u16().ok_or_else(|| info.unexpected_end())?;

        let mut message = Self {
            id,
            flags,
            opcode,
            rcode,
            ..Self::default()
        };

        for _ in 0..qdcount {
            let name = cur.name().map_err(|f| info.name_fault(f))?;
            let rtype = cur.u16().ok_or_else(|| info.unexpected_end())?;
            let rclass = cur.u16().ok_or_else(|| info.unexpected_end())?;
            message.questions.push(Question {
                name,
                rtype: RdataType::from_u16(rtype),
                rclass: Rclass::from_u16(rclass),
            });
        }
        info.question_ok = true;

        for (section, count) in [
            (Section::Answer, ancount),
            (Section::Authority, nscount),
            (Section::Additional, arcount),
        ] {
            for _ in 0..count {
                parse_record(&mut cur, &info, &mut message, section)?;
            }
        }

        Ok(message)
    }

    /// Renders the message into at most `max` bytes, without compression.
    ///
    /// # Errors
    ///
    /// Returns [`WireError::NoSpace`] when the rendered message would not
    /// fit.
    pub fn to_wire(&self, max: usize) -> Result<Vec<u8>, WireError> {
        let mut out = Vec::with_capacity(max.min(512));

        let mut flagword = (u16::from(self.opcode.to_u8() & 0xF) << 11)
            | u16::from(self.rcode.to_u8() & 0xF);
        if self.flags.qr {
            flagword |= 0x8000;
        }
        if self.flags.aa {
            flagword |= 0x0400;
        }
        if self.flags.tc {
            flagword |= 0x0200;
        }
        if self.flags.rd {
            flagword |= 0x0100;
        }
        if self.flags.ra {
            flagword |= 0x0080;
        }

        out.extend_from_slice(&self.id.to_be_bytes());
        out.extend_from_slice(&flagword.to_be_bytes());
        let qdcount =
            u16::try_from(self.questions.len()).map_err(|_| WireError::FormErr("qdcount"))?;
        out.extend_from_slice(&qdcount.to_be_bytes());

        let counts_at = out.len();
        out.extend_from_slice(&[0u8; 6]);

        for q in &self.questions {
            render_name(&mut out, &q.name);
            out.extend_from_slice(&q.rtype.to_u16().to_be_bytes());
            out.extend_from_slice(&q.rclass.to_u16().to_be_bytes());
        }

        let mut counts = [0u16; 3];
        for (i, section) in Section::ALL.iter().enumerate() {
            for mn in self.section(*section) {
                for rs in &mn.rdatasets {
                    for rdata in &rs.rdatas {
                        render_record(&mut out, &mn.name, rs, rdata)?;
                        counts[i] += 1;
                    }
                }
            }
        }

        if let Some(size) = self.edns_udp_size {
            // EDNS0 OPT pseudo-record: root owner, class carries the
            // advertised buffer size, TTL carries extended rcode/version.
            out.push(0);
            out.extend_from_slice(&RdataType::Opt.to_u16().to_be_bytes());
            out.extend_from_slice(&size.to_be_bytes());
            out.extend_from_slice(&0u32.to_be_bytes());
            out.extend_from_slice(&0u16.to_be_bytes());
            counts[2] += 1;
        }

        out[counts_at..counts_at + 2].copy_from_slice(&counts[0].to_be_bytes());
        out[counts_at + 2..counts_at + 4].copy_from_slice(&counts[1].to_be_bytes());
        out[counts_at + 4..counts_at + 6].copy_from_slice(&counts[2].to_be_bytes());

        if out.len() > max {
            return Err(WireError::NoSpace(max));
        }
        Ok(out)
    }
}

fn parse_record(
    cur: &mut Cursor<'_>,
    info: &HeaderInfo,
    message: &mut Message,
    section: Section,
) -> Result<(), WireError> {
    let name = cur.name().map_err(|f| info.name_fault(f))?;
    let rtype = RdataType::from_u16(cur.u16().ok_or_else(|| info.unexpected_end())?);
    let rclass = cur.u16().ok_or_else(|| info.unexpected_end())?;
    let ttl = cur.u32().ok_or_else(|| info.unexpected_end())?;
    let rdlen = cur.u16().ok_or_else(|| info.unexpected_end())? as usize;

    if rtype == RdataType::Opt {
        // The OPT pseudo-record carries EDNS0 parameters in its fixed
        // fields; it never joins a section.
        cur.take(rdlen).ok_or_else(|| info.unexpected_end())?;
        message.edns_udp_size = Some(rclass);
        return Ok(());
    }

    let rdata_start = cur.pos;
    let rdata_buf = cur.take(rdlen).ok_or_else(|| info.unexpected_end())?;
    let rdata = parse_rdata(cur.buf, rdata_start, rdata_buf, rtype, info)?;

    let (key_type, covers) = match &rdata {
        Rdata::Sig { covers, .. } => (RdataType::Sig, Some(*covers)),
        _ => (rtype, None),
    };

    let idx = message.entry_for(section, &name);
    let entry = &mut message.section_mut(section)[idx];
    if let Some(rs) = entry
        .rdatasets
        .iter_mut()
        .find(|rs| rs.rtype == key_type && rs.covers == covers)
    {
        rs.ttl = rs.ttl.min(ttl);
        rs.rdatas.push(rdata);
    } else {
        let mut rs = Rdataset::new(key_type, ttl);
        rs.covers = covers;
        rs.rdatas.push(rdata);
        entry.rdatasets.push(rs);
    }
    Ok(())
}

fn parse_rdata(
    whole: &[u8],
    start: usize,
    rdata: &[u8],
    rtype: RdataType,
    info: &HeaderInfo,
) -> Result<Rdata, WireError> {
    // Names inside rdata may be compressed, so parse them against the
    // whole message with the cursor positioned at the rdata.
    let mut cur = Cursor {
        buf: whole,
        pos: start,
    };
    let end = start + rdata.len();

    let parsed = match rtype {
        RdataType::A => {
            let b: [u8; 4] = rdata
                .try_into()
                .map_err(|_| WireError::FormErr("bad A rdata"))?;
            Rdata::A(Ipv4Addr::from(b))
        }
        RdataType::Aaaa => {
            let b: [u8; 16] = rdata
                .try_into()
                .map_err(|_| WireError::FormErr("bad AAAA rdata"))?;
            Rdata::Aaaa(Ipv6Addr::from(b))
        }
        RdataType::Ns => Rdata::Ns(cur.name().map_err(|f| info.name_fault(f))?),
        RdataType::Cname => Rdata::Cname(cur.name().map_err(|f| info.name_fault(f))?),
        RdataType::Dname => Rdata::Dname(cur.name().map_err(|f| info.name_fault(f))?),
        RdataType::Ptr => Rdata::Ptr(cur.name().map_err(|f| info.name_fault(f))?),
        RdataType::Mx => {
            let preference = cur.u16().ok_or(WireError::FormErr("bad MX rdata"))?;
            let exchange = cur.name().map_err(|f| info.name_fault(f))?;
            Rdata::Mx {
                preference,
                exchange,
            }
        }
        RdataType::Soa => {
            let mname = cur.name().map_err(|f| info.name_fault(f))?;
            let rname = cur.name().map_err(|f| info.name_fault(f))?;
            let mut field = || cur.u32().ok_or(WireError::FormErr("bad SOA rdata"));
            Rdata::Soa {
                mname,
                rname,
                serial: field()?,
                refresh: field()?,
                retry: field()?,
                expire: field()?,
                minimum: field()?,
            }
        }
        RdataType::Sig => {
            if rdata.len() < 2 {
                return Err(WireError::FormErr("bad SIG rdata"));
            }
            Rdata::Sig {
                covers: RdataType::from_u16(u16::from_be_bytes([rdata[0], rdata[1]])),
                data: rdata[2..].to_vec(),
            }
        }
        _ => Rdata::Other(rdata.to_vec()),
    };

    // A name inside the rdata must not run past the declared length.
    if matches!(
        rtype,
        RdataType::Ns | RdataType::Cname | RdataType::Dname | RdataType::Ptr | RdataType::Mx
    ) && cur.pos > end
    {
        return Err(WireError::FormErr("rdata overrun"));
    }

    Ok(parsed)
}

fn render_name(out: &mut Vec<u8>, name: &Name) {
    for label in name.labels() {
        debug_assert!(label.len() <= MAX_LABEL_LEN);
        #[allow(clippy::cast_possible_truncation)]
        out.push(label.len() as u8);
        out.extend_from_slice(label);
    }
    out.push(0);
}

fn render_rdata(out: &mut Vec<u8>, rdata: &Rdata) {
    match rdata {
        Rdata::A(addr) => out.extend_from_slice(&addr.octets()),
        Rdata::Aaaa(addr) => out.extend_from_slice(&addr.octets()),
        Rdata::Ns(name) | Rdata::Cname(name) | Rdata::Dname(name) | Rdata::Ptr(name) => {
            render_name(out, name);
        }
        Rdata::Mx {
            preference,
            exchange,
        } => {
            out.extend_from_slice(&preference.to_be_bytes());
            render_name(out, exchange);
        }
        Rdata::Soa {
            mname,
            rname,
            serial,
            refresh,
            retry,
            expire,
            minimum,
        } => {
            render_name(out, mname);
            render_name(out, rname);
            for field in [serial, refresh, retry, expire, minimum] {
                out.extend_from_slice(&field.to_be_bytes());
            }
        }
        Rdata::Sig { covers, data } => {
            out.extend_from_slice(&covers.to_u16().to_be_bytes());
            out.extend_from_slice(data);
        }
        Rdata::Other(data) => out.extend_from_slice(data),
    }
}

fn render_record(
    out: &mut Vec<u8>,
    name: &Name,
    rs: &Rdataset,
    rdata: &Rdata,
) -> Result<(), WireError> {
    render_name(out, name);
    out.extend_from_slice(&rs.rtype.to_u16().to_be_bytes());
    out.extend_from_slice(&Rclass::In.to_u16().to_be_bytes());
    out.extend_from_slice(&rs.ttl.to_be_bytes());
    let len_at = out.len();
    out.extend_from_slice(&[0, 0]);
    render_rdata(out, rdata);
    let rdlen =
        u16::try_from(out.len() - len_at - 2).map_err(|_| WireError::FormErr("rdata too long"))?;
    out[len_at..len_at + 2].copy_from_slice(&rdlen.to_be_bytes());
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::rdataset::Trust;

    fn name(s: &str) -> Name {
        s.parse().unwrap()
    }

    fn answer(msg: &mut Message, owner: &str, rdata: Rdata, rtype: RdataType, ttl: u32) {
        let idx = msg.entry_for(Section::Answer, &name(owner));
        let mut rs = Rdataset::new(rtype, ttl);
        rs.trust = Trust::Answer;
        rs.rdatas.push(rdata);
        msg.answers[idx].rdatasets.push(rs);
    }

    #[test]
    fn test_query_round_trip() {
        let mut msg = Message::query(0xBEEF, name("www.example.com"), RdataType::A, Rclass::In);
        msg.flags.rd = true;
        msg.edns_udp_size = Some(2048);

        let wire = msg.to_wire(512).unwrap();
        let parsed = Message::from_wire(&wire).unwrap();

        assert_eq!(parsed.id, 0xBEEF);
        assert!(parsed.flags.rd);
        assert_eq!(parsed.questions.len(), 1);
        assert_eq!(parsed.questions[0].name, name("www.example.com"));
        assert_eq!(parsed.questions[0].rtype, RdataType::A);
        assert_eq!(parsed.edns_udp_size, Some(2048));
    }

    #[test]
    fn test_response_round_trip() {
        let mut msg = Message::query(1, name("www.example.com"), RdataType::A, Rclass::In);
        msg.flags.qr = true;
        msg.flags.aa = true;
        answer(
            &mut msg,
            "www.example.com",
            Rdata::A("93.184.216.34".parse().unwrap()),
            RdataType::A,
            3600,
        );

        let wire = msg.to_wire(512).unwrap();
        let parsed = Message::from_wire(&wire).unwrap();

        assert!(parsed.flags.qr);
        assert!(parsed.flags.aa);
        assert_eq!(parsed.answers.len(), 1);
        let rs = &parsed.answers[0].rdatasets[0];
        assert_eq!(rs.rtype, RdataType::A);
        assert_eq!(rs.ttl, 3600);
        assert_eq!(rs.rdatas, vec![Rdata::A("93.184.216.34".parse().unwrap())]);
    }

    #[test]
    fn test_records_group_into_rdatasets() {
        let mut msg = Message::query(1, name("example.com"), RdataType::Ns, Rclass::In);
        msg.flags.qr = true;
        answer(
            &mut msg,
            "example.com",
            Rdata::Ns(name("ns1.example.com")),
            RdataType::Ns,
            300,
        );
        answer(
            &mut msg,
            "example.com",
            Rdata::Ns(name("ns2.example.com")),
            RdataType::Ns,
            200,
        );

        let wire = msg.to_wire(512).unwrap();
        let parsed = Message::from_wire(&wire).unwrap();

        assert_eq!(parsed.answers.len(), 1);
        assert_eq!(parsed.answers[0].rdatasets.len(), 1);
        let rs = &parsed.answers[0].rdatasets[0];
        assert_eq!(rs.rdatas.len(), 2);
        // Grouped TTL is the minimum over the set.
        assert_eq!(rs.ttl, 200);
    }

    #[test]
    fn test_sig_groups_by_covered_type() {
        let mut msg = Message::query(1, name("example.com"), RdataType::A, Rclass::In);
        msg.flags.qr = true;
        answer(
            &mut msg,
            "example.com",
            Rdata::A(Ipv4Addr::LOCALHOST),
            RdataType::A,
            60,
        );
        answer(
            &mut msg,
            "example.com",
            Rdata::Sig {
                covers: RdataType::A,
                data: vec![1, 2, 3],
            },
            RdataType::Sig,
            60,
        );

        let wire = msg.to_wire(512).unwrap();
        let parsed = Message::from_wire(&wire).unwrap();

        let entry = &parsed.answers[0];
        assert_eq!(entry.rdatasets.len(), 2);
        let sig = entry.find_type(RdataType::Sig, Some(RdataType::A)).unwrap();
        assert_eq!(sig.covers, Some(RdataType::A));
    }

    #[test]
    fn test_truncated_message_reports_question_state() {
        let msg = Message::query(7, name("www.example.com"), RdataType::A, Rclass::In);
        let wire = msg.to_wire(512).unwrap();

        // Chop inside the question.
        match Message::from_wire(&wire[..14]) {
            Err(WireError::UnexpectedEnd { question_ok, .. }) => assert!(!question_ok),
            other => panic!("unexpected: {other:?}"),
        }

        // A response chopped inside a record keeps the question intact.
        let mut resp = Message::query(7, name("www.example.com"), RdataType::A, Rclass::In);
        resp.flags.qr = true;
        resp.flags.tc = true;
        answer(
            &mut resp,
            "www.example.com",
            Rdata::A(Ipv4Addr::LOCALHOST),
            RdataType::A,
            60,
        );
        let wire = resp.to_wire(512).unwrap();
        match Message::from_wire(&wire[..wire.len() - 2]) {
            Err(WireError::UnexpectedEnd {
                question_ok,
                truncated,
            }) => {
                assert!(question_ok);
                assert!(truncated);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_compression_pointer_parses() {
        // Hand-build: header + question www.example.com A IN + one answer
        // whose owner is a pointer to the question name.
        let mut wire = Vec::new();
        wire.extend_from_slice(&0x0101u16.to_be_bytes());
        wire.extend_from_slice(&0x8000u16.to_be_bytes()); // QR
        wire.extend_from_slice(&1u16.to_be_bytes()); // qdcount
        wire.extend_from_slice(&1u16.to_be_bytes()); // ancount
        wire.extend_from_slice(&0u16.to_be_bytes());
        wire.extend_from_slice(&0u16.to_be_bytes());
        let name_at = wire.len();
        render_name(&mut wire, &name("www.example.com"));
        wire.extend_from_slice(&1u16.to_be_bytes()); // A
        wire.extend_from_slice(&1u16.to_be_bytes()); // IN
        // Answer record: pointer to the question owner.
        #[allow(clippy::cast_possible_truncation)]
        wire.extend_from_slice(&(0xC000u16 | name_at as u16).to_be_bytes());
        wire.extend_from_slice(&1u16.to_be_bytes()); // A
        wire.extend_from_slice(&1u16.to_be_bytes()); // IN
        wire.extend_from_slice(&60u32.to_be_bytes());
        wire.extend_from_slice(&4u16.to_be_bytes());
        wire.extend_from_slice(&[127, 0, 0, 1]);

        let parsed = Message::from_wire(&wire).unwrap();
        assert_eq!(parsed.answers[0].name, name("www.example.com"));
    }

    #[test]
    fn test_forward_pointer_rejected() {
        let mut wire = Vec::new();
        wire.extend_from_slice(&1u16.to_be_bytes());
        wire.extend_from_slice(&0x8000u16.to_be_bytes());
        wire.extend_from_slice(&1u16.to_be_bytes());
        wire.extend_from_slice(&[0u8; 6]);
        // Question name is a pointer to itself.
        wire.extend_from_slice(&0xC00Cu16.to_be_bytes());
        wire.extend_from_slice(&1u16.to_be_bytes());
        wire.extend_from_slice(&1u16.to_be_bytes());

        assert!(matches!(
            Message::from_wire(&wire),
            Err(WireError::BadPointer)
        ));
    }

    #[test]
    fn test_no_space() {
        let msg = Message::query(1, name("www.example.com"), RdataType::A, Rclass::In);
        assert!(matches!(msg.to_wire(10), Err(WireError::NoSpace(10))));
    }
}
