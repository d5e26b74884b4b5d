//! PM4 packet encoding for a6xx-class command processors
//!
//! Two packet families are emitted. Type-4 writes consecutive registers,
//! type-7 runs a command-processor opcode. Both carry odd-parity bits over
//! their count and register/opcode fields. The emitters here assume the
//! caller already reserved room in the stream.

use super::CommandStream;

/// Type-4 packet tag
pub const CP_TYPE4_PKT: u32 = 4 << 28;
/// Type-7 packet tag
pub const CP_TYPE7_PKT: u32 = 7 << 28;

/// Command-processor opcodes
pub mod opcode {
    /// No operation; payload is skipped
    pub const CP_NOP: u8 = 0x10;
    /// Wait for outstanding memory writes
    pub const CP_WAIT_MEM_WRITES: u8 = 0x12;
    /// Wait for the micro engine to catch up
    pub const CP_WAIT_FOR_ME: u8 = 0x13;
    /// Wait for the GPU to go idle
    pub const CP_WAIT_FOR_IDLE: u8 = 0x26;
    /// Indirect non-indexed draw
    pub const CP_DRAW_INDIRECT: u8 = 0x28;
    /// Indirect indexed draw
    pub const CP_DRAW_INDX_INDIRECT: u8 = 0x29;
    /// Compute dispatch
    pub const CP_EXEC_CS: u8 = 0x33;
    /// Direct draw
    pub const CP_DRAW_INDX_OFFSET: u8 = 0x38;
    /// Write immediate values to memory
    pub const CP_MEM_WRITE: u8 = 0x3d;
    /// Copy a register to memory
    pub const CP_REG_TO_MEM: u8 = 0x3e;
    /// Call another command buffer
    pub const CP_INDIRECT_BUFFER: u8 = 0x3f;
    /// Indirect compute dispatch
    pub const CP_EXEC_CS_INDIRECT: u8 = 0x41;
    /// Trigger a pipeline event
    pub const CP_EVENT_WRITE: u8 = 0x46;
    /// Render-mode marker
    pub const CP_SET_MARKER: u8 = 0x65;
    /// Copy dwords between memory locations
    pub const CP_MEM_TO_MEM: u8 = 0x73;
}

/// Pipeline events for `CP_EVENT_WRITE`
pub mod event {
    /// Flush all caches
    pub const CACHE_FLUSH_TS: u32 = 4;
    /// Invalidate the depth CCU
    pub const PC_CCU_INVALIDATE_DEPTH: u32 = 24;
    /// Invalidate the color CCU
    pub const PC_CCU_INVALIDATE_COLOR: u32 = 25;
    /// Flush the depth CCU
    pub const PC_CCU_FLUSH_DEPTH_TS: u32 = 28;
    /// Flush the color CCU
    pub const PC_CCU_FLUSH_COLOR_TS: u32 = 29;
    /// Invalidate UCHE
    pub const CACHE_INVALIDATE: u32 = 49;
}

/// Registers written by the recording helpers
pub mod reg {
    /// Base vertex for the next draw
    pub const VFD_INDEX_OFFSET: u32 = 0xa40e;
    /// Base instance for the next draw
    pub const VFD_INSTANCE_START_OFFSET: u32 = 0xa40f;
}

/// Draw initiator primitive type: triangle list
pub const DI_PT_TRILIST: u32 = 4;
/// Draw initiator source select: auto-generated indices
pub const DI_SRC_SEL_AUTO_INDEX: u32 = 2;

/// Odd parity of `val`: 1 when `val` has an even number of set bits
pub fn odd_parity_bit(val: u32) -> u32 {
    let mut v = val;
    v ^= v >> 16;
    v ^= v >> 8;
    v ^= v >> 4;
    v &= 0xf;
    (!0x6996u32 >> v) & 1
}

/// Header of a type-4 packet writing `count` registers from `reg`
pub fn pkt4_header(reg: u32, count: u32) -> u32 {
    CP_TYPE4_PKT
        | (count & 0x7f)
        | (odd_parity_bit(count) << 7)
        | ((reg & 0x3ffff) << 8)
        | (odd_parity_bit(reg) << 27)
}

/// Header of a type-7 packet running `opcode` with `count` payload words
pub fn pkt7_header(opcode: u8, count: u32) -> u32 {
    let opcode = opcode as u32;
    CP_TYPE7_PKT
        | (count & 0x3fff)
        | (odd_parity_bit(count) << 15)
        | ((opcode & 0x7f) << 16)
        | (odd_parity_bit(opcode) << 23)
}

/// Decoded packet header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketHeader {
    /// Register write
    Type4 {
        /// First register
        reg: u32,
        /// Number of payload words
        count: u32,
    },
    /// Opcode
    Type7 {
        /// Opcode
        opcode: u8,
        /// Number of payload words
        count: u32,
    },
}

impl PacketHeader {
    /// Decode a header word, rejecting unknown tags and bad parity
    pub fn decode(word: u32) -> Option<Self> {
        match word >> 28 {
            4 => {
                let count = word & 0x7f;
                let reg = (word >> 8) & 0x3ffff;
                (pkt4_header(reg, count) == word).then_some(PacketHeader::Type4 { reg, count })
            }
            7 => {
                let count = word & 0x3fff;
                let opcode = ((word >> 16) & 0x7f) as u8;
                (pkt7_header(opcode, count) == word).then_some(PacketHeader::Type7 { opcode, count })
            }
            _ => None,
        }
    }

    /// Number of payload words following the header
    pub fn count(&self) -> u32 {
        match *self {
            PacketHeader::Type4 { count, .. } | PacketHeader::Type7 { count, .. } => count,
        }
    }
}

/// Split a word stream into packets; `None` if a header is malformed or a
/// payload runs past the end
pub fn decode_stream(words: &[u32]) -> Option<Vec<(PacketHeader, &[u32])>> {
    let mut packets = Vec::new();
    let mut pos = 0;
    while pos < words.len() {
        let header = PacketHeader::decode(words[pos])?;
        let start = pos + 1;
        let end = start.checked_add(header.count() as usize)?;
        packets.push((header, words.get(start..end)?));
        pos = end;
    }
    Some(packets)
}

/// Emit a type-4 header
pub fn emit_pkt4_header(cs: &mut CommandStream, reg: u32, count: u32) {
    cs.emit(pkt4_header(reg, count));
}

/// Emit a type-7 header
pub fn emit_pkt7_header(cs: &mut CommandStream, opcode: u8, count: u32) {
    cs.emit(pkt7_header(opcode, count));
}

/// Emit a register write of `values` starting at `reg`
pub fn emit_pkt4(cs: &mut CommandStream, reg: u32, values: &[u32]) {
    emit_pkt4_header(cs, reg, values.len() as u32);
    cs.emit_slice(values);
}

/// Emit an opcode packet with `payload`
pub fn emit_pkt7(cs: &mut CommandStream, opcode: u8, payload: &[u32]) {
    emit_pkt7_header(cs, opcode, payload.len() as u32);
    cs.emit_slice(payload);
}

/// Emit a 64-bit value as low/high words
pub fn emit_qw(cs: &mut CommandStream, value: u64) {
    cs.emit(value as u32);
    cs.emit((value >> 32) as u32);
}

/// Emit a NOP skipping `count` zero words
pub fn emit_nop(cs: &mut CommandStream, count: u32) {
    emit_pkt7_header(cs, opcode::CP_NOP, count);
    for _ in 0..count {
        cs.emit(0);
    }
}

/// Emit a wait-for-idle
pub fn emit_wfi(cs: &mut CommandStream) {
    emit_pkt7_header(cs, opcode::CP_WAIT_FOR_IDLE, 0);
}

/// Emit a pipeline event
pub fn emit_event_write(cs: &mut CommandStream, event: u32) {
    emit_pkt7(cs, opcode::CP_EVENT_WRITE, &[event]);
}

/// Emit a call into `size_dwords` words at `gpu_addr`
pub fn emit_indirect_buffer(cs: &mut CommandStream, gpu_addr: u64, size_dwords: u32) {
    emit_pkt7_header(cs, opcode::CP_INDIRECT_BUFFER, 3);
    emit_qw(cs, gpu_addr);
    cs.emit(size_dwords);
}

/// Emit an immediate write of `values` to `gpu_addr`
pub fn emit_mem_write(cs: &mut CommandStream, gpu_addr: u64, values: &[u32]) {
    emit_pkt7_header(cs, opcode::CP_MEM_WRITE, 2 + values.len() as u32);
    emit_qw(cs, gpu_addr);
    cs.emit_slice(values);
}

/// Emit a one-dword copy from `src` to `dst`
pub fn emit_mem_to_mem(cs: &mut CommandStream, dst: u64, src: u64) {
    emit_pkt7_header(cs, opcode::CP_MEM_TO_MEM, 5);
    cs.emit(0);
    emit_qw(cs, dst);
    emit_qw(cs, src);
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(0, 1)]
    #[case(1, 0)]
    #[case(3, 1)]
    #[case(7, 0)]
    #[case(0x55, 1)]
    #[case(0x8000_0000, 0)]
    #[case(0xffff_ffff, 1)]
    fn test_odd_parity(#[case] val: u32, #[case] bit: u32) {
        assert_eq!(odd_parity_bit(val), bit);
        assert_eq!((val.count_ones() + bit) % 2, 1);
    }

    #[test]
    fn test_pkt7_header() {
        assert_eq!(pkt7_header(0x55, 1), 0x70D5_0001);
        assert_eq!(pkt7_header(opcode::CP_WAIT_FOR_IDLE, 0), 0x7026_8000);
    }

    #[test]
    fn test_pkt4_header() {
        assert_eq!(pkt4_header(reg::VFD_INDEX_OFFSET, 1), 0x48A4_0E01);
    }

    #[test]
    fn test_decode_round_trips_headers() {
        let h = pkt7_header(opcode::CP_INDIRECT_BUFFER, 3);
        assert_eq!(
            PacketHeader::decode(h),
            Some(PacketHeader::Type7 {
                opcode: opcode::CP_INDIRECT_BUFFER,
                count: 3
            })
        );
        let h = pkt4_header(reg::VFD_INSTANCE_START_OFFSET, 2);
        assert_eq!(
            PacketHeader::decode(h),
            Some(PacketHeader::Type4 {
                reg: reg::VFD_INSTANCE_START_OFFSET,
                count: 2
            })
        );
    }

    #[test]
    fn test_decode_rejects_bad_parity() {
        let h = pkt7_header(0x55, 1);
        assert_eq!(PacketHeader::decode(h ^ (1 << 23)), None);
        assert_eq!(PacketHeader::decode(h ^ (1 << 15)), None);
        assert_eq!(PacketHeader::decode(0), None);
    }

    #[test]
    fn test_decode_stream() {
        let words = [pkt7_header(0x55, 1), 0xDEAD, pkt7_header(opcode::CP_NOP, 0)];
        let packets = decode_stream(&words).unwrap();
        assert_eq!(packets.len(), 2);
        assert_eq!(packets[0].1, &[0xDEAD]);
        assert!(decode_stream(&words[..1]).is_none());
    }
}
