use crate::error::{DecodeError, DecodeResult};

// Capture layout:
// frame_count u32 LE
// frame_count x { offset u32 LE, length u32 LE }
// records, each `length` bytes at table_end + offset:
//   sub-header [SUB_HEADER_SIZE] (skipped)
//   samples i16 LE, row-major
pub const COUNT_LEN: usize = 4;
pub const ENTRY_LEN: usize = 8;
pub const SUB_HEADER_SIZE: u64 = 422;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameTableEntry {
    pub offset: u32,
    pub length: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameTable {
    pub frame_count: u32,
    pub entries: Vec<FrameTableEntry>,
    pub header_end: u64,
}

impl FrameTableEntry {
    // Absolute `[start, end)` of this record's samples; `start` may exceed `end`
    // when the record is shorter than its sub-header.
    pub fn payload_range(&self, header_end: u64) -> (u64, u64) {
        let record_start = header_end + u64::from(self.offset);
        (
            record_start + SUB_HEADER_SIZE,
            record_start + u64::from(self.length),
        )
    }
}

impl FrameTable {
    pub fn entry(&self, index: usize) -> Option<&FrameTableEntry> {
        self.entries.get(index)
    }
}

pub fn parse_header(buf: &[u8]) -> DecodeResult<FrameTable> {
    if buf.len() < COUNT_LEN {
        return Err(DecodeError::TruncatedHeader(format!(
            "need {} bytes for the frame count, have {}",
            COUNT_LEN,
            buf.len()
        )));
    }
    let frame_count = read_u32_le(buf, 0);

    let header_end = COUNT_LEN as u64 + u64::from(frame_count) * ENTRY_LEN as u64;
    if (buf.len() as u64) < header_end {
        return Err(DecodeError::TruncatedTable(format!(
            "{} frames need a {}-byte table, buffer has {} bytes",
            frame_count,
            header_end,
            buf.len()
        )));
    }

    let entries = (0..frame_count as usize)
        .map(|i| {
            let at = COUNT_LEN + i * ENTRY_LEN;
            FrameTableEntry {
                offset: read_u32_le(buf, at),
                length: read_u32_le(buf, at + 4),
            }
        })
        .collect();

    Ok(FrameTable {
        frame_count,
        entries,
        header_end,
    })
}

fn read_u32_le(buf: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

#[cfg(test)]
pub fn build_capture(frames: &[Vec<i16>]) -> Vec<u8> {
    let mut table = Vec::with_capacity(COUNT_LEN + frames.len() * ENTRY_LEN);
    let mut records = Vec::new();
    table.extend_from_slice(&(frames.len() as u32).to_le_bytes());
    for samples in frames {
        let offset = records.len() as u32;
        let length = SUB_HEADER_SIZE as u32 + (samples.len() * 2) as u32;
        table.extend_from_slice(&offset.to_le_bytes());
        table.extend_from_slice(&length.to_le_bytes());
        records.resize(records.len() + SUB_HEADER_SIZE as usize, 0u8);
        for s in samples {
            records.extend_from_slice(&s.to_le_bytes());
        }
    }
    table.extend_from_slice(&records);
    table
}
