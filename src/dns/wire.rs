//! The narrow DNS wire-format helper surface this engine needs.
//!
//! A full message parser/builder is explicitly out of scope (§1): this
//! module is deliberately small and byte-oriented, covering exactly what
//! a transport has to touch — the 12-byte header, the transaction ID,
//! qname case handling, and a minimal EDNS OPT pseudo-RR. It is not a
//! general-purpose RR reader; callers that need to inspect answer record
//! contents beyond the EDNS-malformed check of §6 are out of scope too.

use rand::RngCore;

pub const HEADER_LEN: usize = 12;

/// Requestor's UDP payload size advertised under normal conditions.
pub const EDNS_ADVERTISED_SIZE: u16 = 4096;
/// Smaller advertised size used in the `UdpEdnsFrag` fallback state.
pub const EDNS_FRAG_SIZE_V4: u16 = 1480;
pub const EDNS_FRAG_SIZE_V6: u16 = 1232;

/// TC bit, byte 2 of the header, combined into the big-endian flags word.
const FLAG_TC: u16 = 0x0200;
/// CD bit, byte 3 of the header.
const FLAG_CD: u16 = 0x0010;
/// DO bit inside the EDNS OPT extended-flags word.
const EDNS_DO_BIT: u16 = 0x8000;

fn read_u16(packet: &[u8], offset: usize) -> Option<u16> {
    packet.get(offset..offset + 2).map(|s| u16::from_be_bytes([s[0], s[1]]))
}

pub fn read_id(packet: &[u8]) -> Option<u16> {
    read_u16(packet, 0)
}

pub fn write_id(packet: &mut [u8], id: u16) {
    let bytes = id.to_be_bytes();
    if packet.len() >= 2 {
        packet[0] = bytes[0];
        packet[1] = bytes[1];
    }
}

fn flags(packet: &[u8]) -> Option<u16> {
    read_u16(packet, 2)
}

pub fn has_tc(packet: &[u8]) -> bool {
    flags(packet).map(|f| f & FLAG_TC != 0).unwrap_or(false)
}

pub fn set_cd_bit(packet: &mut [u8]) {
    if packet.len() >= 4 {
        packet[3] |= FLAG_CD as u8;
    }
}

/// Low 4 bits of the flags word (the non-extended RCODE).
pub fn rcode(packet: &[u8]) -> Option<u8> {
    flags(packet).map(|f| (f & 0x000F) as u8)
}

pub fn qdcount(packet: &[u8]) -> Option<u16> {
    read_u16(packet, 4)
}

pub fn ancount(packet: &[u8]) -> Option<u16> {
    read_u16(packet, 6)
}

/// Length in bytes (including the terminating root label, following a
/// compression pointer if one appears) of the name starting at `start`.
fn name_len(packet: &[u8], start: usize) -> Option<usize> {
    let mut i = start;
    loop {
        let len = *packet.get(i)? as usize;
        if len & 0xC0 == 0xC0 {
            packet.get(i + 1)?;
            return Some(i + 2 - start);
        }
        if len == 0 {
            return Some(i + 1 - start);
        }
        i += 1 + len;
        if i > packet.len() {
            return None;
        }
    }
}

/// Lower-cases every alphabetic byte of the question qname in place —
/// used to build the dedup key, never applied to the wire bytes actually
/// sent (those may carry 0x20 case perturbation).
pub fn extract_qname_lower(packet: &[u8]) -> Option<Vec<u8>> {
    let mut out = Vec::new();
    let mut i = HEADER_LEN;
    loop {
        let len = *packet.get(i)? as usize;
        if len & 0xC0 == 0xC0 {
            // Compression pointers don't belong in the question section.
            return None;
        }
        out.push(len as u8);
        if len == 0 {
            break;
        }
        i += 1;
        let label = packet.get(i..i + len)?;
        out.extend(label.iter().map(|b| b.to_ascii_lowercase()));
        i += len;
    }
    Some(out)
}

/// Copies the raw (case-preserved) question qname bytes, for stashing what
/// was actually put on the wire so a later reply can be bitwise-compared
/// against it (§4.5), as opposed to [`extract_qname_lower`]'s dedup key.
pub fn extract_qname_raw(packet: &[u8]) -> Option<Vec<u8>> {
    let len = name_len(packet, HEADER_LEN)?;
    packet.get(HEADER_LEN..HEADER_LEN + len).map(|s| s.to_vec())
}

/// Randomizes the case of every alphabetic byte in a label-length-prefixed
/// qname region (0x20 mixing, §4.5). Operates in place on the raw
/// label bytes of the question's qname within the full packet.
pub fn randomize_qname_case(packet: &mut [u8], qname_start: usize, rng: &mut dyn RngCore) {
    let mut i = qname_start;
    loop {
        let len = match packet.get(i) {
            Some(&l) => l as usize,
            None => return,
        };
        if len == 0 || len & 0xC0 == 0xC0 {
            return;
        }
        i += 1;
        let end = (i + len).min(packet.len());
        for b in &mut packet[i..end] {
            if b.is_ascii_alphabetic() {
                let mut bit = [0u8; 1];
                rng.fill_bytes(&mut bit);
                if bit[0] & 1 == 1 {
                    *b ^= 0x20;
                }
            }
        }
        i = end;
    }
}

/// Compares the name found at `offset` in `packet` byte-for-byte against
/// `expected` (a label-length-prefixed qname), following compression
/// pointers, capped at 256 hops per §4.5.
pub fn qname_matches_bitwise(packet: &[u8], mut offset: usize, expected: &[u8]) -> bool {
    let mut hops = 0u32;
    let mut expected_i = 0usize;
    loop {
        if hops > 256 {
            return false;
        }
        let len = match packet.get(offset) {
            Some(&l) => l as usize,
            None => return false,
        };
        if len & 0xC0 == 0xC0 {
            let lo = match packet.get(offset + 1) {
                Some(&b) => b as usize,
                None => return false,
            };
            offset = ((len & 0x3F) << 8) | lo;
            hops += 1;
            continue;
        }
        if expected.get(expected_i) != Some(&(len as u8)) {
            return false;
        }
        expected_i += 1;
        if len == 0 {
            return expected_i == expected.len();
        }
        let label = match packet.get(offset + 1..offset + 1 + len) {
            Some(s) => s,
            None => return false,
        };
        if expected.get(expected_i..expected_i + len) != Some(label) {
            return false;
        }
        expected_i += len;
        offset += 1 + len;
        hops += 1;
    }
}

/// Appends a minimal EDNS OPT pseudo-RR (root name, TYPE=41, requestor's
/// UDP payload size, extended RCODE/version of 0, optional DO bit, empty
/// RDATA) and bumps ARCOUNT. No EDNS options (ECS, cookies, ...) are
/// encoded — the options list itself is out of this transport's scope;
/// only the capability-negotiation fields §6 calls out are needed.
pub fn attach_edns_opt(packet: &mut Vec<u8>, udp_payload_size: u16, dnssec_do: bool) {
    if let Some(arcount) = ancount_as_additional(packet) {
        let bumped = arcount.wrapping_add(1).to_be_bytes();
        packet[10] = bumped[0];
        packet[11] = bumped[1];
    }
    packet.push(0); // root name
    packet.extend_from_slice(&41u16.to_be_bytes()); // TYPE = OPT
    packet.extend_from_slice(&udp_payload_size.to_be_bytes()); // CLASS = UDP payload size
    packet.push(0); // extended RCODE
    packet.push(0); // EDNS version
    let ext_flags: u16 = if dnssec_do { EDNS_DO_BIT } else { 0 };
    packet.extend_from_slice(&ext_flags.to_be_bytes());
    packet.extend_from_slice(&0u16.to_be_bytes()); // RDLEN = 0
}

fn ancount_as_additional(packet: &[u8]) -> Option<u16> {
    read_u16(packet, 10)
}

/// The "malformed EDNS" detector of §6: NOERROR, QDCOUNT=1, ANCOUNT>=1,
/// a parseable non-root qname, and the first three bytes of the first
/// answer record (name + type prefix) are all zero.
pub fn is_edns_malformed_reply(packet: &[u8]) -> bool {
    if packet.len() < HEADER_LEN {
        return false;
    }
    if rcode(packet) != Some(0) {
        return false;
    }
    if qdcount(packet) != Some(1) {
        return false;
    }
    match ancount(packet) {
        Some(n) if n >= 1 => {}
        _ => return false,
    }
    let qname_len = match name_len(packet, HEADER_LEN) {
        Some(len) if len > 1 => len,
        _ => return false,
    };
    let after_question = HEADER_LEN + qname_len + 4; // + QTYPE + QCLASS
    match packet.get(after_question..after_question + 3) {
        Some(bytes) => bytes == [0, 0, 0],
        None => false,
    }
}

/// Offset of the question's qname, for callers building the 0x20 mask or
/// verifying the answer's first name against it.
pub fn question_qname_offset() -> usize {
    HEADER_LEN
}

/// Renders a label-length-prefixed qname (as produced by
/// [`extract_qname_lower`]) as dotted presentation text, for logging —
/// never used for wire comparison, where the raw bytes are authoritative.
pub fn format_qname(qname: &[u8]) -> String {
    let mut out = String::new();
    let mut i = 0;
    while let Some(&len) = qname.get(i) {
        let len = len as usize;
        if len == 0 {
            break;
        }
        i += 1;
        match qname.get(i..i + len) {
            Some(label) => out.push_str(&String::from_utf8_lossy(label)),
            None => break,
        }
        i += len;
        out.push('.');
    }
    if out.is_empty() {
        out.push('.');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn sample_query(qname_labels: &[&str]) -> Vec<u8> {
        let mut packet = vec![0u8; HEADER_LEN];
        write_id(&mut packet, 0x1234);
        packet[4] = 0;
        packet[5] = 1; // QDCOUNT = 1
        for label in qname_labels {
            packet.push(label.len() as u8);
            packet.extend_from_slice(label.as_bytes());
        }
        packet.push(0);
        packet.extend_from_slice(&1u16.to_be_bytes()); // QTYPE A
        packet.extend_from_slice(&1u16.to_be_bytes()); // QCLASS IN
        packet
    }

    #[test]
    fn id_roundtrip() {
        let mut packet = vec![0u8; HEADER_LEN];
        write_id(&mut packet, 0xBEEF);
        assert_eq!(read_id(&packet), Some(0xBEEF));
    }

    #[test]
    fn qname_lowercasing_is_case_insensitive() {
        let a = sample_query(&["eXaMpLe", "CoM"]);
        let b = sample_query(&["example", "com"]);
        assert_eq!(extract_qname_lower(&a), extract_qname_lower(&b));
    }

    #[test]
    fn edns_opt_bumps_arcount_and_sets_do() {
        let mut packet = sample_query(&["example", "com"]);
        attach_edns_opt(&mut packet, EDNS_ADVERTISED_SIZE, true);
        assert_eq!(ancount_as_additional(&packet), Some(1));
        assert!(packet.ends_with(&[0, 0]));
    }

    #[test]
    fn malformed_edns_detector_flags_zeroed_answer_prefix() {
        let mut packet = sample_query(&["example", "com"]);
        packet[3] = 0; // RCODE NOERROR
        packet[6] = 0;
        packet[7] = 1; // ANCOUNT = 1
        packet.extend_from_slice(&[0, 0, 0, 0, 0]); // zeroed answer prefix
        assert!(is_edns_malformed_reply(&packet));
    }

    #[test]
    fn bitwise_qname_match_follows_compression_pointer() {
        let mut packet = sample_query(&["example", "com"]);
        let answer_start = packet.len();
        // compression pointer back to the question's qname.
        packet.push(0xC0);
        packet.push(HEADER_LEN as u8);
        let expected = extract_qname_lower(&packet).unwrap();
        // Compare against the *original* case bytes, not the lowercased key.
        let qname_bytes = &packet[HEADER_LEN..answer_start - 4];
        assert!(qname_matches_bitwise(&packet, answer_start, qname_bytes));
        let _ = expected;
    }

    #[test]
    fn format_qname_renders_dotted_text() {
        let packet = sample_query(&["example", "com"]);
        let qname = extract_qname_lower(&packet).unwrap();
        assert_eq!(format_qname(&qname), "example.com.");
    }

    #[test]
    fn case_randomization_only_touches_alphabetic_bytes() {
        let mut packet = sample_query(&["example", "com"]);
        let before = packet.clone();
        let mut rng = StdRng::seed_from_u64(7);
        randomize_qname_case(&mut packet, HEADER_LEN, &mut rng);
        for (b, o) in packet.iter().zip(before.iter()) {
            if !o.is_ascii_alphabetic() {
                assert_eq!(b, o);
            }
        }
    }
}
