use serde::{Deserialize, Serialize};

pub const MAX_STANDARD_ID: u32 = 0x7ff;
pub const MAX_EXTENDED_ID: u32 = 0x1fff_ffff;
pub const MAX_DATA_LENGTH: usize = 8;

/// A classic CAN frame as seen by the mailboxes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CanFrame {
    pub id: u32,
    pub extended: bool,
    pub length: u8,
    pub data: [u8; MAX_DATA_LENGTH],
}

impl CanFrame {
    /// Build a frame from a payload; bytes beyond the eighth are ignored.
    pub fn new(id: u32, payload: &[u8]) -> Self {
        let length = payload.len().min(MAX_DATA_LENGTH);
        let mut data = [0u8; MAX_DATA_LENGTH];
        data[..length].copy_from_slice(&payload[..length]);

        Self {
            id: id & MAX_EXTENDED_ID,
            extended: id > MAX_STANDARD_ID,
            length: length as u8,
            data,
        }
    }

    /// Zeroed eight byte frame stamped with `id`.
    pub fn output(id: u32) -> Self {
        Self {
            id: id & MAX_EXTENDED_ID,
            extended: id > MAX_STANDARD_ID,
            length: MAX_DATA_LENGTH as u8,
            data: [0; MAX_DATA_LENGTH],
        }
    }

    pub fn payload(&self) -> &[u8] {
        &self.data[..usize::from(self.length).min(MAX_DATA_LENGTH)]
    }

    /// Bytes 0..4 as a little endian word (the controller's "low" register).
    pub fn low(&self) -> u32 {
        u32::from_le_bytes([self.data[0], self.data[1], self.data[2], self.data[3]])
    }

    /// Bytes 4..8 as a little endian word (the controller's "high" register).
    pub fn high(&self) -> u32 {
        u32::from_le_bytes([self.data[4], self.data[5], self.data[6], self.data[7]])
    }

    pub fn set_low(&mut self, value: u32) {
        self.data[..4].copy_from_slice(&value.to_le_bytes());
    }

    pub fn set_high(&mut self, value: u32) {
        self.data[4..].copy_from_slice(&value.to_le_bytes());
    }

    /// Whether `id` passes a filter of `filter_id` under `mask`.
    pub fn matches(&self, filter_id: u32, mask: u32) -> bool {
        id_matches(self.id, filter_id, mask)
    }
}

/// Masked identifier comparison: both sides are ANDed with the mask.
pub fn id_matches(id: u32, filter_id: u32, mask: u32) -> bool {
    id & mask == filter_id & mask
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_frame_is_zeroed() {
        let frame = CanFrame::output(0x728);
        assert_eq!(frame.id, 0x728);
        assert!(!frame.extended);
        assert_eq!(frame.length, 8);
        assert_eq!(frame.data, [0; 8]);
    }

    #[test]
    fn test_extended_flag_from_id() {
        assert!(CanFrame::output(0x18ff_50e5).extended);
        assert!(!CanFrame::new(0x7ff, &[]).extended);
    }

    #[test]
    fn test_payload_truncated_to_eight_bytes() {
        let frame = CanFrame::new(0x100, &[1, 2, 3, 4, 5, 6, 7, 8, 9, 10]);
        assert_eq!(frame.length, 8);
        assert_eq!(frame.payload(), &[1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn test_low_high_words() {
        let mut frame = CanFrame::output(0x729);
        frame.set_low(0x0102_0304);
        frame.set_high(500);
        assert_eq!(frame.data[..4], [0x04, 0x03, 0x02, 0x01]);
        assert_eq!(frame.low(), 0x0102_0304);
        assert_eq!(frame.high(), 500);
    }

    #[test]
    fn test_mask_admits_range() {
        // 0x724 / 0x7fe admits the status and the analog frame only
        assert!(id_matches(0x724, 0x724, 0x7fe));
        assert!(id_matches(0x725, 0x724, 0x7fe));
        assert!(!id_matches(0x726, 0x724, 0x7fe));
        assert!(!id_matches(0x723, 0x724, 0x7fe));
    }
}
