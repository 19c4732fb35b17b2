use anyhow::Result;
use core::str;
use std::{fs, path::Path};

use crate::{
    error::DataLogError,
    format::{self, LengthDescriptor},
    ControlData, Record, RecordInfo, HEADER_VERSION,
};

/// Reads a complete log held in memory.
///
/// Iteration stops quietly at the first record that is cut short or has an
/// impossible header, so everything written before a crash stays readable.
pub struct DataLogReader<B: AsRef<[u8]>> {
    data: B,
}

impl DataLogReader<Vec<u8>> {
    /// Loads a log file into memory and checks its header.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        DataLogReader::open(fs::read(path)?)
    }
}

impl<B: AsRef<[u8]>> DataLogReader<B> {
    /// Wraps `data` without checking it; see [`DataLogReader::is_valid`].
    pub fn new(data: B) -> Self {
        DataLogReader { data }
    }

    /// Wraps `data`, failing if it does not start with a supported header.
    pub fn open(data: B) -> Result<Self> {
        let Some(version) = format::check_file_header(data.as_ref()) else {
            return Err(DataLogError::InvalidHeader.into());
        };

        if version < HEADER_VERSION {
            return Err(DataLogError::UnsupportedVersion(version).into());
        }

        Ok(DataLogReader { data })
    }

    #[must_use]
    pub fn is_valid(&self) -> bool {
        format::check_file_header(self.data.as_ref())
            .is_some_and(|version| version >= HEADER_VERSION)
    }

    /// Major version in the high byte, minor in the low byte. 0 when invalid.
    #[must_use]
    pub fn version(&self) -> u16 {
        format::check_file_header(self.data.as_ref()).unwrap_or(0)
    }

    /// The extra header bytes, cut short if the buffer is.
    #[must_use]
    pub fn extra_header_bytes(&self) -> &[u8] {
        let data = self.data.as_ref();
        let Some(length) = format::read_u32(data, 8) else {
            return &[];
        };

        let end = format::HEADER_SIZE
            .saturating_add(length as usize)
            .min(data.len());
        &data[format::HEADER_SIZE..end]
    }

    /// The extra header as text, with invalid UTF-8 replaced.
    #[must_use]
    pub fn extra_header(&self) -> String {
        String::from_utf8_lossy(self.extra_header_bytes()).into_owned()
    }

    /// Records in file order. Each call starts again from the first record.
    #[must_use]
    pub fn records(&self) -> RecordIter<'_> {
        let data = self.data.as_ref();
        let pos = if self.is_valid() {
            format::HEADER_SIZE + self.extra_header_bytes().len()
        } else {
            data.len()
        };

        RecordIter { data, pos }
    }
}

impl<'a, B: AsRef<[u8]>> IntoIterator for &'a DataLogReader<B> {
    type Item = DataLogRecord<'a>;
    type IntoIter = RecordIter<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.records()
    }
}

/// Forward-only iterator over the records of a [`DataLogReader`].
pub struct RecordIter<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> RecordIter<'a> {
    fn read_record(&self) -> Option<(DataLogRecord<'a>, usize)> {
        let data = self.data;
        let mut pos = self.pos;

        let descriptor = LengthDescriptor::decode(*data.get(pos)?)?;
        pos += 1;

        let mut read_field = |length: usize| -> Option<u64> {
            let bytes = data.get(pos..pos + length)?;
            pos += length;
            Some(format::read_int(bytes))
        };

        // Entry and size fields are at most 4 bytes wide
        let entry = read_field(descriptor.entry_len)? as u32;
        let size = read_field(descriptor.size_len)? as usize;
        let timestamp = read_field(descriptor.timestamp_len)?;

        let end = pos.checked_add(size)?;
        let payload = data.get(pos..end)?;

        Some((
            DataLogRecord {
                entry,
                timestamp,
                data: payload,
            },
            end,
        ))
    }
}

impl<'a> Iterator for RecordIter<'a> {
    type Item = DataLogRecord<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.read_record() {
            Some((record, next)) => {
                self.pos = next;
                Some(record)
            }
            None => {
                self.pos = self.data.len();
                None
            }
        }
    }
}

/// Start control record contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StartRecordData<'a> {
    pub entry: u32,
    pub name: &'a str,
    pub r#type: &'a str,
    pub metadata: &'a str,
}

/// Set-metadata control record contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetadataRecordData<'a> {
    pub entry: u32,
    pub metadata: &'a str,
}

/// One record borrowed from the log buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataLogRecord<'a> {
    entry: u32,
    timestamp: u64,
    data: &'a [u8],
}

impl<'a> DataLogRecord<'a> {
    /// Entry id; 0 for control records.
    #[must_use]
    pub fn entry(&self) -> u32 {
        self.entry
    }

    #[must_use]
    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn data(&self) -> &'a [u8] {
        self.data
    }

    #[must_use]
    pub fn is_control(&self) -> bool {
        self.entry == 0
    }

    fn control_type(&self) -> Option<u8> {
        if self.is_control() {
            self.data.first().copied()
        } else {
            None
        }
    }

    #[must_use]
    pub fn is_start(&self) -> bool {
        self.control_type() == Some(format::CONTROL_START)
            && self.data.len() >= format::MIN_START_PAYLOAD_SIZE
    }

    #[must_use]
    pub fn is_finish(&self) -> bool {
        self.control_type() == Some(format::CONTROL_FINISH)
            && self.data.len() == format::FINISH_PAYLOAD_SIZE
    }

    #[must_use]
    pub fn is_set_metadata(&self) -> bool {
        self.control_type() == Some(format::CONTROL_SET_METADATA)
            && self.data.len() >= format::MIN_SET_METADATA_PAYLOAD_SIZE
    }

    pub fn get_start_data(&self) -> Result<StartRecordData<'a>> {
        if !self.is_start() {
            return Err(DataLogError::TypeMismatch("start").into());
        }

        let data = self.data;
        let entry = format::read_u32(data, 1).ok_or(DataLogError::TypeMismatch("start"))?;
        let (name, pos) = read_str(data, 5, "start")?;
        let (r#type, pos) = read_str(data, pos, "start")?;
        let (metadata, _) = read_str(data, pos, "start")?;

        Ok(StartRecordData {
            entry,
            name,
            r#type,
            metadata,
        })
    }

    /// Id of the entry a Finish record closes.
    pub fn get_finish_entry(&self) -> Result<u32> {
        if !self.is_finish() {
            return Err(DataLogError::TypeMismatch("finish").into());
        }

        Ok(format::read_u32(self.data, 1).ok_or(DataLogError::TypeMismatch("finish"))?)
    }

    pub fn get_set_metadata_data(&self) -> Result<MetadataRecordData<'a>> {
        if !self.is_set_metadata() {
            return Err(DataLogError::TypeMismatch("set metadata").into());
        }

        let data = self.data;
        let entry = format::read_u32(data, 1).ok_or(DataLogError::TypeMismatch("set metadata"))?;
        let (metadata, _) = read_str(data, 5, "set metadata")?;

        Ok(MetadataRecordData { entry, metadata })
    }

    pub fn get_raw(&self) -> &'a [u8] {
        self.data
    }

    pub fn get_boolean(&self) -> Result<bool> {
        match self.data {
            [value] => Ok(*value != 0),
            _ => Err(DataLogError::TypeMismatch("boolean").into()),
        }
    }

    pub fn get_integer(&self) -> Result<i64> {
        let bytes: [u8; 8] = self
            .data
            .try_into()
            .map_err(|_| DataLogError::TypeMismatch("int64"))?;
        Ok(i64::from_le_bytes(bytes))
    }

    pub fn get_float(&self) -> Result<f32> {
        let bytes: [u8; 4] = self
            .data
            .try_into()
            .map_err(|_| DataLogError::TypeMismatch("float"))?;
        Ok(f32::from_le_bytes(bytes))
    }

    pub fn get_double(&self) -> Result<f64> {
        let bytes: [u8; 8] = self
            .data
            .try_into()
            .map_err(|_| DataLogError::TypeMismatch("double"))?;
        Ok(f64::from_le_bytes(bytes))
    }

    pub fn get_string(&self) -> Result<&'a str> {
        Ok(str::from_utf8(self.data).map_err(|_| DataLogError::InvalidUtf8)?)
    }

    pub fn get_boolean_array(&self) -> Result<Vec<bool>> {
        Ok(self.data.iter().map(|value| *value != 0).collect())
    }

    pub fn get_integer_array(&self) -> Result<Vec<i64>> {
        if self.data.len() % 8 != 0 {
            return Err(DataLogError::TypeMismatch("int64[]").into());
        }

        Ok(self
            .data
            .chunks_exact(8)
            .map(|chunk| i64::from_le_bytes(chunk.try_into().unwrap_or_default()))
            .collect())
    }

    pub fn get_float_array(&self) -> Result<Vec<f32>> {
        if self.data.len() % 4 != 0 {
            return Err(DataLogError::TypeMismatch("float[]").into());
        }

        Ok(self
            .data
            .chunks_exact(4)
            .map(|chunk| f32::from_le_bytes(chunk.try_into().unwrap_or_default()))
            .collect())
    }

    pub fn get_double_array(&self) -> Result<Vec<f64>> {
        if self.data.len() % 8 != 0 {
            return Err(DataLogError::TypeMismatch("double[]").into());
        }

        Ok(self
            .data
            .chunks_exact(8)
            .map(|chunk| f64::from_le_bytes(chunk.try_into().unwrap_or_default()))
            .collect())
    }

    pub fn get_string_array(&self) -> Result<Vec<&'a str>> {
        let data = self.data;
        let count = format::read_u32(data, 0).ok_or(DataLogError::TypeMismatch("string[]"))?;

        // Every string needs at least its 4-byte length
        if (count as usize).saturating_mul(4) > data.len() - 4 {
            return Err(DataLogError::TypeMismatch("string[]").into());
        }

        let mut values = Vec::with_capacity(count as usize);
        let mut pos = 4;
        for _ in 0..count {
            let (value, next) = read_str(data, pos, "string[]")?;
            values.push(value);
            pos = next;
        }

        Ok(values)
    }
}

fn read_str<'a>(data: &'a [u8], pos: usize, kind: &'static str) -> Result<(&'a str, usize)> {
    let (bytes, next) = format::read_string(data, pos).ok_or(DataLogError::TypeMismatch(kind))?;
    let value = str::from_utf8(bytes).map_err(|_| DataLogError::InvalidUtf8)?;
    Ok((value, next))
}

impl TryFrom<DataLogRecord<'_>> for Record {
    type Error = anyhow::Error;

    fn try_from(record: DataLogRecord<'_>) -> std::result::Result<Self, Self::Error> {
        if !record.is_control() {
            return Ok(Record {
                id: record.entry,
                timestamp: record.timestamp,
                info: RecordInfo::Data(record.data.into()),
            });
        }

        let (id, info) = if record.is_start() {
            let start = record.get_start_data()?;
            (
                start.entry,
                ControlData::Start {
                    name: start.name.into(),
                    r#type: start.r#type.into(),
                    metadata: start.metadata.into(),
                },
            )
        } else if record.is_finish() {
            (record.get_finish_entry()?, ControlData::Finish)
        } else if record.is_set_metadata() {
            let set = record.get_set_metadata_data()?;
            (set.entry, ControlData::SetMetadata(set.metadata.into()))
        } else {
            return Err(DataLogError::TypeMismatch("control").into());
        };

        Ok(Record {
            id,
            timestamp: record.timestamp,
            info: RecordInfo::Control(info),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn log_bytes(extra_header: &str, records: &[(u32, u64, &[u8])]) -> Vec<u8> {
        let mut buf = Vec::new();
        format::write_file_header(&mut buf, extra_header);
        for (entry, timestamp, payload) in records {
            format::write_record_header(&mut buf, *entry, payload.len() as u32, *timestamp);
            buf.extend_from_slice(payload);
        }
        buf
    }

    fn start_payload(entry: u32, name: &str, r#type: &str, metadata: &str) -> Vec<u8> {
        let mut buf = Vec::new();
        format::write_start_payload(&mut buf, entry, name, r#type, metadata);
        buf
    }

    #[test]
    fn header_checks() {
        assert!(DataLogReader::open(&b"WPILOG"[..]).is_err());
        assert!(DataLogReader::open(&b"WPILOX\x00\x01\x00\x00\x00\x00"[..]).is_err());

        let err = DataLogReader::open(&b"WPILOG\x00\x00\x00\x00\x00\x00"[..])
            .err()
            .unwrap();
        assert_eq!(
            err.downcast_ref::<DataLogError>(),
            Some(&DataLogError::UnsupportedVersion(0))
        );

        let newer = DataLogReader::open(&b"WPILOG\x01\x01\x00\x00\x00\x00"[..]).unwrap();
        assert_eq!(newer.version(), 0x0101);
    }

    #[test]
    fn extra_header_is_exposed() {
        let data = log_bytes("team 1234", &[]);
        let reader = DataLogReader::open(&data[..]).unwrap();

        assert_eq!(reader.extra_header(), "team 1234");
        assert_eq!(reader.records().count(), 0);
    }

    #[test]
    fn decodes_control_and_data_records() {
        let start = start_payload(1, "voltage", "double", "");
        let finish = [format::CONTROL_FINISH, 1, 0, 0, 0];
        let value = 12.3f64.to_le_bytes();
        let data = log_bytes(
            "",
            &[(0, 0, &start[..]), (1, 1000, &value[..]), (0, 2000, &finish[..])],
        );

        let reader = DataLogReader::open(data).unwrap();
        let records: Vec<DataLogRecord<'_>> = reader.records().collect();
        assert_eq!(records.len(), 3);

        assert!(records[0].is_start());
        assert_eq!(
            records[0].get_start_data().unwrap(),
            StartRecordData {
                entry: 1,
                name: "voltage",
                r#type: "double",
                metadata: "",
            }
        );

        assert_eq!(records[1].entry(), 1);
        assert_eq!(records[1].timestamp(), 1000);
        assert!((records[1].get_double().unwrap() - 12.3).abs() < f64::EPSILON);

        assert!(records[2].is_finish());
        assert_eq!(records[2].get_finish_entry().unwrap(), 1);
    }

    #[test]
    fn finish_requires_exact_size() {
        let long_finish = [format::CONTROL_FINISH, 1, 0, 0, 0, 0];
        let data = log_bytes("", &[(0, 0, &long_finish[..])]);
        let reader = DataLogReader::open(&data[..]).unwrap();
        let record = reader.records().next().unwrap();

        assert!(record.is_control());
        assert!(!record.is_finish());
        let err = record.get_finish_entry().unwrap_err();
        assert_eq!(
            err.downcast_ref::<DataLogError>(),
            Some(&DataLogError::TypeMismatch("finish"))
        );
    }

    #[test]
    fn typed_getters_reject_wrong_shapes() {
        let data = log_bytes("", &[(1, 1, &[1u8, 2, 3][..])]);
        let reader = DataLogReader::open(&data[..]).unwrap();
        let record = reader.records().next().unwrap();

        assert!(!record.is_start());
        assert!(record.get_start_data().is_err());
        assert!(record.get_boolean().is_err());
        assert!(record.get_integer().is_err());
        assert!(record.get_float().is_err());
        assert!(record.get_double_array().is_err());
        assert!(record.get_string_array().is_err());
        assert_eq!(record.get_boolean_array().unwrap(), [true, true, true]);
    }

    #[test]
    fn truncated_record_ends_iteration() {
        let value = 5i64.to_le_bytes();
        let mut data = log_bytes("", &[(1, 1, &value[..]), (1, 2, &value[..])]);
        data.truncate(data.len() - 3);

        let reader = DataLogReader::open(&data[..]).unwrap();
        let values: Vec<i64> = reader
            .records()
            .map(|record| record.get_integer().unwrap())
            .collect();
        assert_eq!(values, [5]);
    }

    #[test]
    fn reserved_descriptor_bit_ends_iteration() {
        let mut data = log_bytes("", &[(1, 1, &[1u8][..])]);
        data.extend_from_slice(&[0x80, 1, 1, 1, 1]);

        let reader = DataLogReader::open(&data[..]).unwrap();
        assert_eq!(reader.records().count(), 1);
    }

    #[test]
    fn converts_to_owned_records() {
        let mut set = Vec::new();
        format::write_set_metadata_payload(&mut set, 4, "{\"unit\":\"V\"}");
        let data = log_bytes("", &[(0, 9, &set[..])]);
        let reader = DataLogReader::open(&data[..]).unwrap();

        let record = Record::try_from(reader.records().next().unwrap()).unwrap();
        assert_eq!(record.id, 4);
        assert_eq!(record.timestamp, 9);
        assert!(matches!(
            record.info,
            RecordInfo::Control(ControlData::SetMetadata(ref metadata))
                if &**metadata == "{\"unit\":\"V\"}"
        ));
    }

    #[test]
    fn string_array_decodes() {
        let mut payload = Vec::new();
        crate::append::encode_string_array(&mut payload, &["Hello", ", ", "World"]);
        let data = log_bytes("", &[(2, 1, &payload[..])]);
        let reader = DataLogReader::open(&data[..]).unwrap();

        let record = reader.records().next().unwrap();
        assert_eq!(record.get_string_array().unwrap(), ["Hello", ", ", "World"]);
    }

    proptest! {
        #[test]
        fn arbitrary_bytes_never_panic(tail in proptest::collection::vec(any::<u8>(), 0..256)) {
            let mut data = log_bytes("", &[]);
            data.extend_from_slice(&tail);

            let reader = DataLogReader::open(&data[..]).unwrap();
            for record in &reader {
                let _ = Record::try_from(record);
                let _ = record.get_string_array();
            }
        }
    }
}
