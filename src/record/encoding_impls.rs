//! Wire-format implementations for record types.

use crate::encoding::{Decode, Encode, EncodingError};

use super::{LogRecord, LogUpdate, RefRecord, RefValue};

impl Encode for RefValue {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        match self {
            RefValue::Deletion => 0u32.encode_to(buf),
            RefValue::Direct(id) => {
                1u32.encode_to(buf)?;
                id.encode_to(buf)
            }
            RefValue::DirectPeeled { id, peeled } => {
                2u32.encode_to(buf)?;
                id.encode_to(buf)?;
                peeled.encode_to(buf)
            }
            RefValue::Symbolic(target) => {
                3u32.encode_to(buf)?;
                target.encode_to(buf)
            }
        }
    }
}

impl Decode for RefValue {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let (tag, mut offset) = u32::decode_from(buf)?;
        match tag {
            0 => Ok((RefValue::Deletion, offset)),
            1 => {
                let (id, n) = Vec::<u8>::decode_from(&buf[offset..])?;
                offset += n;
                Ok((RefValue::Direct(id), offset))
            }
            2 => {
                let (id, n) = Vec::<u8>::decode_from(&buf[offset..])?;
                offset += n;
                let (peeled, n) = Vec::<u8>::decode_from(&buf[offset..])?;
                offset += n;
                Ok((RefValue::DirectPeeled { id, peeled }, offset))
            }
            3 => {
                let (target, n) = String::decode_from(&buf[offset..])?;
                offset += n;
                Ok((RefValue::Symbolic(target), offset))
            }
            _ => Err(EncodingError::InvalidTag {
                tag,
                type_name: "RefValue",
            }),
        }
    }
}

impl Encode for RefRecord {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.name.encode_to(buf)?;
        self.update_index.encode_to(buf)?;
        self.value.encode_to(buf)
    }
}

impl Decode for RefRecord {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut offset = 0;
        let (name, n) = String::decode_from(&buf[offset..])?;
        offset += n;
        let (update_index, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        let (value, n) = RefValue::decode_from(&buf[offset..])?;
        offset += n;
        Ok((
            Self {
                name,
                update_index,
                value,
            },
            offset,
        ))
    }
}

impl Encode for LogUpdate {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.old_id.encode_to(buf)?;
        self.new_id.encode_to(buf)?;
        self.committer.encode_to(buf)?;
        self.email.encode_to(buf)?;
        self.time.encode_to(buf)?;
        self.tz_offset.encode_to(buf)?;
        self.message.encode_to(buf)
    }
}

impl Decode for LogUpdate {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut offset = 0;
        let (old_id, n) = Vec::<u8>::decode_from(&buf[offset..])?;
        offset += n;
        let (new_id, n) = Vec::<u8>::decode_from(&buf[offset..])?;
        offset += n;
        let (committer, n) = String::decode_from(&buf[offset..])?;
        offset += n;
        let (email, n) = String::decode_from(&buf[offset..])?;
        offset += n;
        let (time, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        let (tz_offset, n) = i16::decode_from(&buf[offset..])?;
        offset += n;
        let (message, n) = String::decode_from(&buf[offset..])?;
        offset += n;
        Ok((
            Self {
                old_id,
                new_id,
                committer,
                email,
                time,
                tz_offset,
                message,
            },
            offset,
        ))
    }
}

impl Encode for LogRecord {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.name.encode_to(buf)?;
        self.update_index.encode_to(buf)?;
        self.update.encode_to(buf)
    }
}

impl Decode for LogRecord {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut offset = 0;
        let (name, n) = String::decode_from(&buf[offset..])?;
        offset += n;
        let (update_index, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        let (update, n) = Option::<LogUpdate>::decode_from(&buf[offset..])?;
        offset += n;
        Ok((
            Self {
                name,
                update_index,
                update,
            },
            offset,
        ))
    }
}
