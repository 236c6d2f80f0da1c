//! ATL message record, §4.F.
//!
//! Field-for-field grounded on `atomicMsg`/`qData` in
//! `examples/original_source/src/common/atomic_queue.h`: a fixed-size header carrying a
//! flag bitset, the client's fabric address, the FAM target location, the client-side
//! memory handle to RDMA into/out of, and the operand set shared by the stride/index
//! scatter-gather variants. `flag` is stored as a plain `u32` so the whole header stays
//! `bytemuck::Pod` (a `bitflags` type isn't `Pod` on its own); [`MessageFlags`] is the
//! ergonomic view used everywhere else.

use bitflags::bitflags;
use bytemuck::{Pod, Zeroable};

use crate::util::constants::MAX_DATA_IN_MSG;

bitflags! {
    /// Mirrors `enum flag` in `atomic_queue.h`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MessageFlags: u32 {
        const READ              = 1 << 0;
        const WRITE              = 1 << 1;
        const SCATTER_STRIDE      = 1 << 2;
        const SCATTER_INDEX       = 1 << 3;
        const GATHER_STRIDE       = 1 << 4;
        const GATHER_INDEX        = 1 << 5;
        const WRITE_IN_PROGRESS   = 1 << 6;
        const WRITE_COMPLETED     = 1 << 7;
        const BUFFER_ALLOCATED    = 1 << 8;
        const CONTAIN_DATA        = 1 << 9;
    }
}

/// Largest serialized fabric address this header can carry inline.
pub const CLIENT_FABRIC_ADDRESS_CAP: usize = 64;

/// Fixed-size ATL message header, stored at the front of each ring-buffer slot.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct MessageHeader {
    flag: u32,
    _reserved0: u32,
    pub client_fabric_address: [u8; CLIENT_FABRIC_ADDRESS_CAP],
    pub client_fabric_address_len: u32,
    _reserved1: u32,
    pub target_region_id: u64,
    pub target_offset: u64,
    pub client_memory_key: u64,
    pub client_base_addr: u64,
    pub client_buffer_offset: u64,
    pub op_size: u64,
    pub op_first_element: u64,
    pub op_stride: u64,
    pub op_element_size: u64,
    pub op_n_elements: u64,
}

impl MessageHeader {
    pub fn flags(&self) -> MessageFlags {
        MessageFlags::from_bits_truncate(self.flag)
    }

    pub fn set_flags(&mut self, flags: MessageFlags) {
        self.flag = flags.bits();
    }

    pub fn insert_flags(&mut self, flags: MessageFlags) {
        self.set_flags(self.flags() | flags);
    }

    pub fn client_address_bytes(&self) -> &[u8] {
        let len = self.client_fabric_address_len as usize;
        &self.client_fabric_address[..len.min(CLIENT_FABRIC_ADDRESS_CAP)]
    }
}

/// A full ring-buffer slot: header plus its inline payload capacity. Payloads larger
/// than `MAX_DATA_IN_MSG` are staged by the client at `client_base_addr +
/// client_buffer_offset` via RDMA before the push completes (`BUFFER_ALLOCATED`).
#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
pub struct MessageSlot {
    pub header: MessageHeader,
    pub inline_payload: [u8; MAX_DATA_IN_MSG],
}

impl MessageSlot {
    pub fn empty() -> Self {
        Zeroable::zeroed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_round_trip_through_header() {
        let mut header = MessageHeader::zeroed();
        header.set_flags(MessageFlags::WRITE | MessageFlags::CONTAIN_DATA);
        assert!(header.flags().contains(MessageFlags::WRITE));
        assert!(header.flags().contains(MessageFlags::CONTAIN_DATA));
        assert!(!header.flags().contains(MessageFlags::READ));
        header.insert_flags(MessageFlags::WRITE_COMPLETED);
        assert!(header.flags().contains(MessageFlags::WRITE_COMPLETED));
        assert!(header.flags().contains(MessageFlags::WRITE));
    }

    #[test]
    fn message_slot_is_zeroed_by_default() {
        let slot = MessageSlot::empty();
        assert_eq!(slot.header.flag, 0);
        assert_eq!(slot.inline_payload[0], 0);
    }
}
