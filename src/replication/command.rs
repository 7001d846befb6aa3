//! Encoding of replicated WAL transactions.
//!
//! A `COMMAND` log entry carries one WAL write: the target database, the
//! page size, the commit and truncate markers, and the rewritten pages. The
//! origin fields let the member that proposed the entry recognize it at
//! apply time and resume the suspended connection instead of re-injecting
//! frames it already holds.

use crate::error::{Error, Result};
use crate::vfs::FrameData;
use crate::wire::{Builder, Cursor};

#[derive(Debug, Clone, PartialEq)]
pub struct FramesCommand {
    /// Server id of the member that proposed the entry.
    pub origin_id: u64,
    /// Per-origin transaction sequence number.
    pub origin_seq: u64,
    pub db_name: String,
    pub page_size: u32,
    pub truncate: u32,
    pub commit: bool,
    pub frames: Vec<FrameData>,
}

impl FramesCommand {
    pub fn encode(&self) -> Vec<u8> {
        let mut b = Builder::new();
        b.put_u64(self.origin_id);
        b.put_u64(self.origin_seq);
        b.put_text(&self.db_name);
        b.put_u64(self.page_size as u64);
        b.put_u64(self.frames.len() as u64);
        b.put_u64(self.commit as u64);
        b.put_u64(self.truncate as u64);
        for frame in &self.frames {
            b.put_u64(frame.page_number as u64);
        }
        let mut out = b.finish().to_vec();
        for frame in &self.frames {
            out.extend_from_slice(&frame.data);
        }
        out
    }

    pub fn decode(data: &[u8]) -> Result<FramesCommand> {
        let mut cursor = Cursor::new(data);
        let origin_id = cursor.get_u64()?;
        let origin_seq = cursor.get_u64()?;
        let db_name = cursor.get_text()?.to_owned();
        let page_size = cursor.get_u64()? as u32;
        let n = cursor.get_u64()? as usize;
        let commit = cursor.get_u64()? != 0;
        let truncate = cursor.get_u64()? as u32;

        let mut page_numbers = Vec::with_capacity(n);
        for _ in 0..n {
            page_numbers.push(cursor.get_u64()? as u32);
        }
        let mut frames = Vec::with_capacity(n);
        for page_number in page_numbers {
            let data = cursor.get_bytes(page_size as usize)?;
            frames.push(FrameData { page_number, data: data.to_vec() });
        }
        if cursor.remaining() != 0 {
            return Err(Error::Parse("trailing bytes in frames command".into()));
        }
        Ok(FramesCommand {
            origin_id,
            origin_seq,
            db_name,
            page_size,
            truncate,
            commit,
            frames,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn round_trip() {
        let command = FramesCommand {
            origin_id: 1,
            origin_seq: 42,
            db_name: "test.db".into(),
            page_size: 512,
            truncate: 2,
            commit: true,
            frames: vec![
                FrameData { page_number: 1, data: vec![1u8; 512] },
                FrameData { page_number: 2, data: vec![2u8; 512] },
            ],
        };
        let encoded = command.encode();
        assert_eq!(FramesCommand::decode(&encoded).unwrap(), command);
    }

    #[test]
    fn rejects_trailing_garbage() {
        let command = FramesCommand {
            origin_id: 1,
            origin_seq: 1,
            db_name: "test.db".into(),
            page_size: 512,
            truncate: 0,
            commit: false,
            frames: vec![FrameData { page_number: 1, data: vec![0u8; 512] }],
        };
        let mut encoded = command.encode();
        encoded.extend_from_slice(&[0u8; 8]);
        assert!(FramesCommand::decode(&encoded).is_err());
    }
}
