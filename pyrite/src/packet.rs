//! Command-word encodings owned by this layer.
//!
//! The emitting layer hands us pre-encoded packets; the only words this crate
//! writes itself are padding no-ops, the indirect-buffer packets that link or
//! launch other buffers, and the memory write/wait pair backing gang
//! ordering. All of them use the self-describing header produced by
//! [`header`], so a trailing packet can be located and rewritten later
//! without a full stream parse.

/// Packet body lengths are limited to 16 bits by the header format.
const BODY_LEN_MASK: u32 = 0xffff;

const OP_NOP: u32 = 0x10;
const OP_INDIRECT: u32 = 0x11;
const OP_WRITE_MEM: u32 = 0x12;
const OP_WAIT_MEM: u32 = 0x13;

/// Maximum value of the indirect packet's length field, and therefore the
/// hard ceiling on any segment submitted through one.
pub(crate) const MAX_INDIRECT_SIZE_DW: u32 = 0xf_ffff;

const INDIRECT_SIZE_MASK: u32 = MAX_INDIRECT_SIZE_DW;
/// The target buffer continues the current stream; execution does not return.
const INDIRECT_CHAIN_BIT: u32 = 1 << 31;
/// The link has been patched with a real target.
const INDIRECT_VALID_BIT: u32 = 1 << 30;

/// Memory waits compare with greater-or-equal, the only function the gang
/// counters need.
const WAIT_MEM_FUNC_GEQ: u32 = 0x5;

pub(crate) const CHAIN_PACKET_WORDS: u32 = 4;
pub(crate) const WRITE_MEM_PACKET_WORDS: u32 = 4;
pub(crate) const WAIT_MEM_PACKET_WORDS: u32 = 5;

#[inline]
pub(crate) const fn header(opcode: u32, body_len: u32) -> u32 {
    (0b11 << 30) | (opcode << 16) | (body_len & BODY_LEN_MASK)
}

#[inline]
pub(crate) const fn opcode(word: u32) -> u32 {
    (word >> 16) & 0x3fff
}

#[inline]
pub(crate) const fn body_len(word: u32) -> u32 {
    word & BODY_LEN_MASK
}

#[inline]
pub(crate) const fn is_packet_header(word: u32) -> bool {
    word >> 30 == 0b11
}

/// Single-word no-op, used for padding on engines that execute packets.
#[inline]
pub(crate) const fn nop_word() -> u32 {
    header(OP_NOP, 0)
}

/// The patchable trailing slot of a chain-capable stream: four no-ops that
/// a later [`chain_packet`] may overwrite in place.
#[inline]
pub(crate) const fn nop_slot() -> [u32; 4] {
    [nop_word(); 4]
}

fn indirect_packet(gpu_address: u64, size_dw: u32, chain: bool) -> [u32; 4] {
    debug_assert!(size_dw <= MAX_INDIRECT_SIZE_DW);
    debug_assert_eq!(gpu_address & 0x3, 0);
    let mut control = (size_dw & INDIRECT_SIZE_MASK) | INDIRECT_VALID_BIT;
    if chain {
        control |= INDIRECT_CHAIN_BIT;
    }
    [
        header(OP_INDIRECT, 3),
        gpu_address as u32,
        (gpu_address >> 32) as u32,
        control,
    ]
}

/// Continue execution at `gpu_address` for `size_dw` words; never returns to
/// the current buffer.
#[inline]
pub(crate) fn chain_packet(gpu_address: u64, size_dw: u32) -> [u32; 4] {
    indirect_packet(gpu_address, size_dw, true)
}

/// Execute `size_dw` words at `gpu_address`, then resume after this packet.
#[inline]
pub(crate) fn launch_packet(gpu_address: u64, size_dw: u32) -> [u32; 4] {
    indirect_packet(gpu_address, size_dw, false)
}

/// Writes `value` to the GPU address.
#[inline]
pub(crate) fn write_mem_packet(gpu_address: u64, value: u32) -> [u32; 4] {
    [
        header(OP_WRITE_MEM, 3),
        gpu_address as u32,
        (gpu_address >> 32) as u32,
        value,
    ]
}

/// Stalls the engine until the word at the GPU address is >= `reference`.
#[inline]
pub(crate) fn wait_mem_geq_packet(gpu_address: u64, reference: u32) -> [u32; 5] {
    [
        header(OP_WAIT_MEM, 4),
        gpu_address as u32,
        (gpu_address >> 32) as u32,
        reference,
        WAIT_MEM_FUNC_GEQ,
    ]
}

/// A decoded indirect-buffer packet.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct IndirectOp {
    pub gpu_address: u64,
    pub size_dw: u32,
    pub chain: bool,
}

/// Decodes `words` as an indirect packet. Returns `None` for anything else,
/// including an unpatched (still no-op) trailing slot.
pub(crate) fn decode_indirect(words: &[u32]) -> Option<IndirectOp> {
    if words.len() < 4 || opcode(words[0]) != OP_INDIRECT || body_len(words[0]) != 3 {
        return None;
    }
    let control = words[3];
    if control & INDIRECT_VALID_BIT == 0 {
        return None;
    }
    Some(IndirectOp {
        gpu_address: words[1] as u64 | ((words[2] as u64) << 32),
        size_dw: control & INDIRECT_SIZE_MASK,
        chain: control & INDIRECT_CHAIN_BIT != 0,
    })
}

/// One step of packet-level interpretation, used by the software device in
/// tests and by nothing else. The second element of [`decode`]'s result is
/// the total number of words consumed, header included.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum DecodedPacket {
    Nop,
    Indirect(IndirectOp),
    WriteMem { gpu_address: u64, value: u32 },
    WaitMemGeq { gpu_address: u64, reference: u32 },
    Unknown,
}

pub(crate) fn decode(words: &[u32]) -> Option<(DecodedPacket, usize)> {
    let &head = words.first()?;
    if !is_packet_header(head) {
        // Raw data words outside a packet are skipped one at a time.
        return Some((DecodedPacket::Unknown, 1));
    }
    let body = body_len(head) as usize;
    if words.len() < 1 + body {
        return None;
    }
    // Fixed-size opcodes decode only with their exact body length; a header
    // lying about it must not send the reads past the checked bound.
    let packet = match (opcode(head), body) {
        (OP_NOP, _) => DecodedPacket::Nop,
        (OP_INDIRECT, 3) => match decode_indirect(&words[..4]) {
            Some(op) => DecodedPacket::Indirect(op),
            // Unpatched slot: plain filler.
            None => DecodedPacket::Nop,
        },
        (OP_WRITE_MEM, 3) => DecodedPacket::WriteMem {
            gpu_address: words[1] as u64 | ((words[2] as u64) << 32),
            value: words[3],
        },
        (OP_WAIT_MEM, 4) => DecodedPacket::WaitMemGeq {
            gpu_address: words[1] as u64 | ((words[2] as u64) << 32),
            reference: words[3],
        },
        _ => DecodedPacket::Unknown,
    };
    Some((packet, 1 + body))
}
