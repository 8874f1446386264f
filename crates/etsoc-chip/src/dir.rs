//! Device interface registers (DIRs).
//!
//! Firmware publishes one descriptor per command channel at a fixed BAR2
//! offset (see [`crate::bar`]). The host polls [`GenericAttr::status`] until
//! it reaches the channel's ready value, reads the whole structure and checks
//! `crc32` against everything after the generic attributes.
//!
//! ```text
//! generic_attr   40 bytes   version, sizes, crc32, boot status, config
//! vq_attr        24 bytes   interrupt trigger, SQ/CQ offsets and sizes
//! mem_regions[]  32 bytes × num_mem_regions
//! ```
//!
//! All fields are little-endian and packed.

// ── Layout ───────────────────────────────────────────────────────────────────

/// Size of [`GenericAttr`] on the wire.
pub const GENERIC_ATTR_SIZE: usize = 40;

/// Size of [`VqAttr`] on the wire.
pub const VQ_ATTR_SIZE: usize = 24;

/// Size of one [`MemRegion`] on the wire.
pub const MEM_REGION_SIZE: usize = 32;

/// Offset of the boot status (`i16`) inside the descriptor.
pub const STATUS_OFFSET: u64 = 24;

/// Offset of the checksum (`u32`) inside the descriptor.
pub const CRC32_OFFSET: usize = 20;

/// Descriptor version understood by this host.
pub const DIR_VERSION: u16 = 1;

// ── Boot status ──────────────────────────────────────────────────────────────

/// Boot status values shared by both channels.
pub mod boot {
    /// Firmware failed to boot.
    pub const BOOT_ERROR: i16 = -1;
    /// Nothing published yet.
    pub const DEV_NOT_READY: i16 = 0;
    /// Virtual queues initialised.
    pub const VQ_READY: i16 = 1;
    /// Service processor fully up; management channel usable.
    pub const SP_DEV_READY: i16 = 13;
    /// Master minion firmware up; compute channel usable.
    pub const MM_READY: i16 = 4;
}

// ── Memory region types ──────────────────────────────────────────────────────

/// Memory region type codes.
pub mod region {
    /// Ring buffers of the channel.
    pub const VQ_BUFFER: u8 = 0;
    /// Interrupt trigger registers.
    pub const VQ_INT_TRIGGER: u8 = 1;
    /// Management scratch area (firmware image staging).
    pub const MGMT_SCRATCH: u8 = 2;
    /// Service processor trace buffer.
    pub const MGMT_TRACE: u8 = 3;
    /// Host-managed device DRAM (compute channel).
    pub const OPS_HOST_MANAGED: u8 = 2;
}

/// Board form factor codes.
pub mod form_factor {
    /// PCIe add-in card.
    pub const PCIE: u16 = 1;
    /// M.2 module.
    pub const M_2: u16 = 2;
}

fn le_u16(bytes: &[u8], at: usize) -> Option<u16> {
    Some(u16::from_le_bytes(bytes.get(at..at + 2)?.try_into().ok()?))
}

fn le_u32(bytes: &[u8], at: usize) -> Option<u32> {
    Some(u32::from_le_bytes(bytes.get(at..at + 4)?.try_into().ok()?))
}

fn le_u64(bytes: &[u8], at: usize) -> Option<u64> {
    Some(u64::from_le_bytes(bytes.get(at..at + 8)?.try_into().ok()?))
}

// ── Structures ───────────────────────────────────────────────────────────────

/// Generic attributes at the start of every descriptor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct GenericAttr {
    pub attributes_size: u16,
    pub version: u16,
    pub total_size: u16,
    pub num_mem_regions: u16,
    pub minion_shires_mask: u64,
    pub minion_boot_freq: u32,
    pub crc32: u32,
    pub status: i16,
    pub form_factor: u16,
    pub device_tdp: u16,
    pub l3_size: u16,
    pub l2_size: u16,
    pub scp_size: u16,
    pub cache_line_size: u16,
}

impl GenericAttr {
    /// Decode from the first [`GENERIC_ATTR_SIZE`] bytes.
    pub fn decode(b: &[u8]) -> Option<Self> {
        if b.len() < GENERIC_ATTR_SIZE {
            return None;
        }
        Some(Self {
            attributes_size: le_u16(b, 0)?,
            version: le_u16(b, 2)?,
            total_size: le_u16(b, 4)?,
            num_mem_regions: le_u16(b, 6)?,
            minion_shires_mask: le_u64(b, 8)?,
            minion_boot_freq: le_u32(b, 16)?,
            crc32: le_u32(b, 20)?,
            status: i16::from_le_bytes(b.get(24..26)?.try_into().ok()?),
            form_factor: le_u16(b, 26)?,
            device_tdp: le_u16(b, 28)?,
            l3_size: le_u16(b, 30)?,
            l2_size: le_u16(b, 32)?,
            scp_size: le_u16(b, 34)?,
            cache_line_size: le_u16(b, 36)?,
        })
    }

    fn encode_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.attributes_size.to_le_bytes());
        out.extend_from_slice(&self.version.to_le_bytes());
        out.extend_from_slice(&self.total_size.to_le_bytes());
        out.extend_from_slice(&self.num_mem_regions.to_le_bytes());
        out.extend_from_slice(&self.minion_shires_mask.to_le_bytes());
        out.extend_from_slice(&self.minion_boot_freq.to_le_bytes());
        out.extend_from_slice(&self.crc32.to_le_bytes());
        out.extend_from_slice(&self.status.to_le_bytes());
        out.extend_from_slice(&self.form_factor.to_le_bytes());
        out.extend_from_slice(&self.device_tdp.to_le_bytes());
        out.extend_from_slice(&self.l3_size.to_le_bytes());
        out.extend_from_slice(&self.l2_size.to_le_bytes());
        out.extend_from_slice(&self.scp_size.to_le_bytes());
        out.extend_from_slice(&self.cache_line_size.to_le_bytes());
        out.extend_from_slice(&[0u8; 2]);
    }
}

/// Virtual queue attributes of one channel.
///
/// `sq_offset` and `cq_offset` are relative to the channel's
/// [`region::VQ_BUFFER`] region. Submission queue `i` starts at
/// `sq_offset + i * per_sq_size`; the completion queue spans
/// `per_cq_size * cq_count` bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct VqAttr {
    pub attributes_size: u16,
    pub int_trg_size: u8,
    pub int_id: u8,
    pub int_trg_offset: u32,
    pub sq_offset: u32,
    pub sq_count: u16,
    pub per_sq_size: u16,
    pub cq_offset: u32,
    pub cq_count: u16,
    pub per_cq_size: u16,
}

impl VqAttr {
    /// Decode from the first [`VQ_ATTR_SIZE`] bytes.
    pub fn decode(b: &[u8]) -> Option<Self> {
        if b.len() < VQ_ATTR_SIZE {
            return None;
        }
        Some(Self {
            attributes_size: le_u16(b, 0)?,
            int_trg_size: b[2],
            int_id: b[3],
            int_trg_offset: le_u32(b, 4)?,
            sq_offset: le_u32(b, 8)?,
            sq_count: le_u16(b, 12)?,
            per_sq_size: le_u16(b, 14)?,
            cq_offset: le_u32(b, 16)?,
            cq_count: le_u16(b, 20)?,
            per_cq_size: le_u16(b, 22)?,
        })
    }

    fn encode_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.attributes_size.to_le_bytes());
        out.push(self.int_trg_size);
        out.push(self.int_id);
        out.extend_from_slice(&self.int_trg_offset.to_le_bytes());
        out.extend_from_slice(&self.sq_offset.to_le_bytes());
        out.extend_from_slice(&self.sq_count.to_le_bytes());
        out.extend_from_slice(&self.per_sq_size.to_le_bytes());
        out.extend_from_slice(&self.cq_offset.to_le_bytes());
        out.extend_from_slice(&self.cq_count.to_le_bytes());
        out.extend_from_slice(&self.per_cq_size.to_le_bytes());
    }
}

/// One entry of the memory-region table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct MemRegion {
    pub attributes_size: u16,
    pub region_type: u8,
    pub bar: u8,
    pub access_attr: u32,
    pub bar_offset: u64,
    pub bar_size: u64,
    pub dev_address: u64,
}

impl MemRegion {
    /// Decode from the first [`MEM_REGION_SIZE`] bytes.
    pub fn decode(b: &[u8]) -> Option<Self> {
        if b.len() < MEM_REGION_SIZE {
            return None;
        }
        Some(Self {
            attributes_size: le_u16(b, 0)?,
            region_type: b[2],
            bar: b[3],
            access_attr: le_u32(b, 4)?,
            bar_offset: le_u64(b, 8)?,
            bar_size: le_u64(b, 16)?,
            dev_address: le_u64(b, 24)?,
        })
    }

    fn encode_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.attributes_size.to_le_bytes());
        out.push(self.region_type);
        out.push(self.bar);
        out.extend_from_slice(&self.access_attr.to_le_bytes());
        out.extend_from_slice(&self.bar_offset.to_le_bytes());
        out.extend_from_slice(&self.bar_size.to_le_bytes());
        out.extend_from_slice(&self.dev_address.to_le_bytes());
    }
}

/// A complete channel descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInterface {
    /// Generic attributes.
    pub generic: GenericAttr,
    /// Queue attributes.
    pub vq: VqAttr,
    /// Memory-region table, `generic.num_mem_regions` entries.
    pub regions: Vec<MemRegion>,
}

impl DeviceInterface {
    /// Size of a descriptor carrying `regions` memory regions.
    pub const fn wire_size(regions: usize) -> usize {
        GENERIC_ATTR_SIZE + VQ_ATTR_SIZE + regions * MEM_REGION_SIZE
    }

    /// Decode a full descriptor. The region count and total size come from
    /// the generic attributes and must fit inside `bytes`.
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        let generic = GenericAttr::decode(bytes)?;
        let count = usize::from(generic.num_mem_regions);
        if usize::from(generic.total_size) < Self::wire_size(count)
            || usize::from(generic.total_size) > bytes.len()
        {
            return None;
        }
        let vq = VqAttr::decode(bytes.get(GENERIC_ATTR_SIZE..)?)?;
        let table = GENERIC_ATTR_SIZE + VQ_ATTR_SIZE;
        let regions = (0..count)
            .map(|i| MemRegion::decode(bytes.get(table + i * MEM_REGION_SIZE..)?))
            .collect::<Option<Vec<_>>>()?;
        Some(Self {
            generic,
            vq,
            regions,
        })
    }

    /// Encode as published by firmware. The stored `crc32` is written as-is;
    /// use [`patch_crc32`] once the checksum is known.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::wire_size(self.regions.len()));
        self.generic.encode_into(&mut out);
        self.vq.encode_into(&mut out);
        for region in &self.regions {
            region.encode_into(&mut out);
        }
        out
    }

    /// First region of the given type.
    pub fn region(&self, region_type: u8) -> Option<&MemRegion> {
        self.regions.iter().find(|r| r.region_type == region_type)
    }
}

/// Bytes covered by the checksum: from the end of the generic attributes to
/// `total_size`.
pub fn checksum_span(bytes: &[u8]) -> Option<&[u8]> {
    let generic = GenericAttr::decode(bytes)?;
    let start = usize::from(generic.attributes_size);
    let end = usize::from(generic.total_size);
    if start > end {
        return None;
    }
    bytes.get(start..end)
}

/// Overwrite the checksum field of an encoded descriptor.
pub fn patch_crc32(bytes: &mut [u8], crc: u32) -> bool {
    match bytes.get_mut(CRC32_OFFSET..CRC32_OFFSET + 4) {
        Some(field) => {
            field.copy_from_slice(&crc.to_le_bytes());
            true
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> DeviceInterface {
        let total = DeviceInterface::wire_size(2);
        DeviceInterface {
            generic: GenericAttr {
                attributes_size: GENERIC_ATTR_SIZE as u16,
                version: DIR_VERSION,
                total_size: total as u16,
                num_mem_regions: 2,
                minion_shires_mask: 0xFFFF_FFFF,
                status: boot::SP_DEV_READY,
                form_factor: form_factor::PCIE,
                ..GenericAttr::default()
            },
            vq: VqAttr {
                attributes_size: VQ_ATTR_SIZE as u16,
                sq_count: 1,
                per_sq_size: 1024,
                cq_offset: 1024,
                cq_count: 1,
                per_cq_size: 1024,
                ..VqAttr::default()
            },
            regions: vec![
                MemRegion {
                    region_type: region::VQ_BUFFER,
                    bar_offset: 0x1000,
                    bar_size: 0x800,
                    ..MemRegion::default()
                },
                MemRegion {
                    region_type: region::MGMT_SCRATCH,
                    bar_offset: 0x2000,
                    bar_size: 0x1000,
                    ..MemRegion::default()
                },
            ],
        }
    }

    #[test]
    fn layout_sizes_match_packed_structs() {
        let dir = sample();
        let bytes = dir.encode();
        assert_eq!(bytes.len(), 40 + 24 + 64);
        assert_eq!(&bytes[STATUS_OFFSET as usize..][..2], &13i16.to_le_bytes());
    }

    #[test]
    fn decode_recovers_tables() {
        let dir = sample();
        let decoded = DeviceInterface::decode(&dir.encode()).unwrap();
        assert_eq!(decoded, dir);
        assert_eq!(decoded.region(region::MGMT_SCRATCH).unwrap().bar_offset, 0x2000);
    }

    #[test]
    fn checksum_span_skips_generic_attributes() {
        let mut bytes = sample().encode();
        let span = checksum_span(&bytes).unwrap().to_vec();
        assert_eq!(span.len(), 24 + 64);
        assert_eq!(span, bytes[40..].to_vec());
        assert!(patch_crc32(&mut bytes, 0xDEAD_BEEF));
        assert_eq!(GenericAttr::decode(&bytes).unwrap().crc32, 0xDEAD_BEEF);
    }

    #[test]
    fn truncated_descriptor_is_rejected() {
        let bytes = sample().encode();
        assert!(DeviceInterface::decode(&bytes[..bytes.len() - 1]).is_none());
    }
}
