//! Transport stream packet helpers
//!
//! Only the 4-byte header matters here: the sync byte and the 13-bit PID
//! used for subscription filtering. Table contents are never parsed.

use std::collections::BTreeMap;

/// Size of one transport unit
pub const TS_PACKET_SIZE: usize = 188;

/// First byte of every transport unit
pub const TS_SYNC_BYTE: u8 = 0x47;

/// PID carrying the program association table
pub const PAT_PID: u16 = 0x0000;

/// Null packet PID
pub const NULL_PID: u16 = 0x1FFF;

/// Subscription set: PID to caller-defined metadata (e.g. stream type)
pub type PidMap = BTreeMap<u16, u16>;

/// Extract the 13-bit PID from a packet header
///
/// Returns `None` if the slice is too short to hold a header.
pub fn packet_pid(packet: &[u8]) -> Option<u16> {
    if packet.len() < 3 {
        return None;
    }
    Some((((packet[1] & 0x1f) as u16) << 8) | packet[2] as u16)
}

/// Check whether a packet belongs to the PAT
pub fn is_pat(packet: &[u8]) -> bool {
    packet_pid(packet) == Some(PAT_PID)
}

#[cfg(test)]
pub(crate) fn make_packet(pid: u16, fill: u8) -> [u8; TS_PACKET_SIZE] {
    let mut pkt = [fill; TS_PACKET_SIZE];
    pkt[0] = TS_SYNC_BYTE;
    pkt[1] = ((pid >> 8) as u8) & 0x1f;
    pkt[2] = (pid & 0xff) as u8;
    pkt[3] = 0x10;
    pkt
}
