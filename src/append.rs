//! Typed appends. Each value becomes one data record whose payload layout is
//! fixed by the entry's type string:
//!
//! | type        | payload                                            |
//! |-------------|----------------------------------------------------|
//! | `raw`       | the bytes as given                                 |
//! | `boolean`   | 1 byte, 0 or 1                                     |
//! | `int64`     | 8 bytes                                            |
//! | `float`     | 4 bytes IEEE-754                                   |
//! | `double`    | 8 bytes IEEE-754                                   |
//! | `string`    | UTF-8 bytes, no prefix                             |
//! | `<scalar>[]`| the scalar encodings back to back                  |
//! | `string[]`  | 4-byte count, then each string length-prefixed     |

use anyhow::Result;

use crate::{format, writer::DataLog};

pub(crate) fn encode_boolean_array(buf: &mut Vec<u8>, values: &[bool]) {
    buf.extend(values.iter().map(|value| u8::from(*value)));
}

pub(crate) fn encode_integer_array(buf: &mut Vec<u8>, values: &[i64]) {
    for value in values {
        buf.extend_from_slice(&value.to_le_bytes());
    }
}

pub(crate) fn encode_float_array(buf: &mut Vec<u8>, values: &[f32]) {
    for value in values {
        buf.extend_from_slice(&value.to_le_bytes());
    }
}

pub(crate) fn encode_double_array(buf: &mut Vec<u8>, values: &[f64]) {
    for value in values {
        buf.extend_from_slice(&value.to_le_bytes());
    }
}

pub(crate) fn string_array_len<S: AsRef<str>>(values: &[S]) -> usize {
    4 + values
        .iter()
        .map(|value| format::string_len(value.as_ref()))
        .sum::<usize>()
}

pub(crate) fn encode_string_array<S: AsRef<str>>(buf: &mut Vec<u8>, values: &[S]) {
    buf.extend_from_slice(&(values.len() as u32).to_le_bytes());
    for value in values {
        format::write_string(buf, value.as_ref());
    }
}

impl DataLog {
    /// Appends `data` unchanged. Struct and protobuf encoders go through here.
    pub fn append_raw(&self, entry: u32, data: &[u8], timestamp: u64) -> Result<()> {
        self.shared()
            .append_with(entry, timestamp, data.len(), |buf| buf.extend_from_slice(data))?;
        Ok(())
    }

    pub fn append_boolean(&self, entry: u32, value: bool, timestamp: u64) -> Result<()> {
        self.shared()
            .append_with(entry, timestamp, 1, |buf| buf.push(u8::from(value)))?;
        Ok(())
    }

    pub fn append_integer(&self, entry: u32, value: i64, timestamp: u64) -> Result<()> {
        self.shared().append_with(entry, timestamp, 8, |buf| {
            buf.extend_from_slice(&value.to_le_bytes());
        })?;
        Ok(())
    }

    pub fn append_float(&self, entry: u32, value: f32, timestamp: u64) -> Result<()> {
        self.shared().append_with(entry, timestamp, 4, |buf| {
            buf.extend_from_slice(&value.to_le_bytes());
        })?;
        Ok(())
    }

    pub fn append_double(&self, entry: u32, value: f64, timestamp: u64) -> Result<()> {
        self.shared().append_with(entry, timestamp, 8, |buf| {
            buf.extend_from_slice(&value.to_le_bytes());
        })?;
        Ok(())
    }

    pub fn append_string(&self, entry: u32, value: &str, timestamp: u64) -> Result<()> {
        self.append_raw(entry, value.as_bytes(), timestamp)
    }

    pub fn append_boolean_array(&self, entry: u32, values: &[bool], timestamp: u64) -> Result<()> {
        self.shared().append_with(entry, timestamp, values.len(), |buf| {
            encode_boolean_array(buf, values);
        })?;
        Ok(())
    }

    pub fn append_integer_array(&self, entry: u32, values: &[i64], timestamp: u64) -> Result<()> {
        self.shared().append_with(entry, timestamp, values.len() * 8, |buf| {
            encode_integer_array(buf, values);
        })?;
        Ok(())
    }

    pub fn append_float_array(&self, entry: u32, values: &[f32], timestamp: u64) -> Result<()> {
        self.shared().append_with(entry, timestamp, values.len() * 4, |buf| {
            encode_float_array(buf, values);
        })?;
        Ok(())
    }

    pub fn append_double_array(&self, entry: u32, values: &[f64], timestamp: u64) -> Result<()> {
        self.shared().append_with(entry, timestamp, values.len() * 8, |buf| {
            encode_double_array(buf, values);
        })?;
        Ok(())
    }

    pub fn append_string_array<S: AsRef<str>>(
        &self,
        entry: u32,
        values: &[S],
        timestamp: u64,
    ) -> Result<()> {
        self.shared()
            .append_with(entry, timestamp, string_array_len(values), |buf| {
                encode_string_array(buf, values);
            })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_array_layout() {
        let mut buf = Vec::new();
        encode_string_array(&mut buf, &["ab", "", "c"]);

        assert_eq!(
            buf,
            [3, 0, 0, 0, 2, 0, 0, 0, b'a', b'b', 0, 0, 0, 0, 1, 0, 0, 0, b'c']
        );
        assert_eq!(buf.len(), string_array_len(&["ab", "", "c"]));
    }

    #[test]
    fn scalar_arrays_are_packed() {
        let mut buf = Vec::new();
        encode_boolean_array(&mut buf, &[true, false, true]);
        encode_integer_array(&mut buf, &[-1]);
        encode_float_array(&mut buf, &[1.5]);

        assert_eq!(&buf[..3], &[1, 0, 1]);
        assert_eq!(&buf[3..11], &[0xff; 8]);
        assert_eq!(&buf[11..], &1.5f32.to_le_bytes());
    }
}
