use anyhow::Result;
use parking_lot::Mutex;
use std::{borrow::Cow, collections::HashSet, marker::PhantomData};

use crate::{append, error::DataLogError, writer::DataLog};

/// A value with a standard data log encoding.
pub trait LogValue {
    /// Type string announced in the entry's Start record.
    fn type_string() -> Cow<'static, str>;

    /// Exact number of bytes [`LogValue::encode`] appends.
    fn payload_len(&self) -> usize;

    fn encode(&self, buf: &mut Vec<u8>);
}

impl LogValue for bool {
    fn type_string() -> Cow<'static, str> {
        "boolean".into()
    }

    fn payload_len(&self) -> usize {
        1
    }

    fn encode(&self, buf: &mut Vec<u8>) {
        buf.push(u8::from(*self));
    }
}

impl LogValue for i64 {
    fn type_string() -> Cow<'static, str> {
        "int64".into()
    }

    fn payload_len(&self) -> usize {
        8
    }

    fn encode(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.to_le_bytes());
    }
}

impl LogValue for f32 {
    fn type_string() -> Cow<'static, str> {
        "float".into()
    }

    fn payload_len(&self) -> usize {
        4
    }

    fn encode(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.to_le_bytes());
    }
}

impl LogValue for f64 {
    fn type_string() -> Cow<'static, str> {
        "double".into()
    }

    fn payload_len(&self) -> usize {
        8
    }

    fn encode(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.to_le_bytes());
    }
}

impl LogValue for String {
    fn type_string() -> Cow<'static, str> {
        "string".into()
    }

    fn payload_len(&self) -> usize {
        self.len()
    }

    fn encode(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(self.as_bytes());
    }
}

/// Opaque bytes, logged with type `raw`.
impl LogValue for Vec<u8> {
    fn type_string() -> Cow<'static, str> {
        "raw".into()
    }

    fn payload_len(&self) -> usize {
        self.len()
    }

    fn encode(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(self);
    }
}

impl LogValue for Vec<bool> {
    fn type_string() -> Cow<'static, str> {
        "boolean[]".into()
    }

    fn payload_len(&self) -> usize {
        self.len()
    }

    fn encode(&self, buf: &mut Vec<u8>) {
        append::encode_boolean_array(buf, self);
    }
}

impl LogValue for Vec<i64> {
    fn type_string() -> Cow<'static, str> {
        "int64[]".into()
    }

    fn payload_len(&self) -> usize {
        self.len() * 8
    }

    fn encode(&self, buf: &mut Vec<u8>) {
        append::encode_integer_array(buf, self);
    }
}

impl LogValue for Vec<f32> {
    fn type_string() -> Cow<'static, str> {
        "float[]".into()
    }

    fn payload_len(&self) -> usize {
        self.len() * 4
    }

    fn encode(&self, buf: &mut Vec<u8>) {
        append::encode_float_array(buf, self);
    }
}

impl LogValue for Vec<f64> {
    fn type_string() -> Cow<'static, str> {
        "double[]".into()
    }

    fn payload_len(&self) -> usize {
        self.len() * 8
    }

    fn encode(&self, buf: &mut Vec<u8>) {
        append::encode_double_array(buf, self);
    }
}

impl LogValue for Vec<String> {
    fn type_string() -> Cow<'static, str> {
        "string[]".into()
    }

    fn payload_len(&self) -> usize {
        append::string_array_len(self)
    }

    fn encode(&self, buf: &mut Vec<u8>) {
        append::encode_string_array(buf, self);
    }
}

/// Something values can be appended to.
pub trait Entry {
    type Value;

    /// Returns `Ok(false)` when the log dropped the value, for example while
    /// paused or for an entry that failed to start.
    fn append(&self, value: &Self::Value, timestamp: u64) -> Result<bool>;
}

/// A started entry that logs values of one type. Dropping it finishes the entry.
pub struct LogEntry<V: LogValue> {
    log: DataLog,
    id: u32,
    _value: PhantomData<fn(&V)>,
}

impl<V: LogValue> LogEntry<V> {
    pub fn new(log: &DataLog, name: &str, metadata: &str, timestamp: u64) -> Result<Self> {
        LogEntry::with_type(log, name, &V::type_string(), metadata, timestamp)
    }

    pub(crate) fn with_type(
        log: &DataLog,
        name: &str,
        r#type: &str,
        metadata: &str,
        timestamp: u64,
    ) -> Result<Self> {
        let id = log.start(name, r#type, metadata, timestamp)?;

        Ok(LogEntry {
            log: log.clone(),
            id,
            _value: PhantomData,
        })
    }

    /// Entry id, or 0 if the name was already live with another type.
    #[must_use]
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn set_metadata(&self, metadata: &str, timestamp: u64) -> Result<()> {
        self.log.set_metadata(self.id, metadata, timestamp)
    }

    pub(crate) fn append_with(
        &self,
        timestamp: u64,
        size: usize,
        fill: impl FnOnce(&mut Vec<u8>),
    ) -> Result<bool> {
        self.log.shared().append_with(self.id, timestamp, size, fill)
    }
}

impl<V: LogValue> Entry for LogEntry<V> {
    type Value = V;

    fn append(&self, value: &V, timestamp: u64) -> Result<bool> {
        self.append_with(timestamp, value.payload_len(), |buf| value.encode(buf))
    }
}

impl<V: LogValue> Drop for LogEntry<V> {
    fn drop(&mut self) {
        if self.id != 0 {
            let _ = self.log.finish(self.id, 0);
        }
    }
}

/// Skips values equal to the last one it wrote.
///
/// The memory belongs to this wrapper alone: two wrappers around the same
/// entry each write their first value.
pub struct Lazy<E: Entry> {
    entry: E,
    last: Mutex<Option<E::Value>>,
}

impl<E: Entry> Lazy<E>
where
    E::Value: PartialEq + Clone,
{
    pub fn new(entry: E) -> Self {
        Lazy {
            entry,
            last: Mutex::new(None),
        }
    }

    /// Appends `value` unless it equals the last value written.
    pub fn update(&self, value: &E::Value, timestamp: u64) -> Result<bool> {
        let mut last = self.last.lock();
        if last.as_ref() == Some(value) {
            return Ok(false);
        }

        let written = self.entry.append(value, timestamp)?;
        if written {
            *last = Some(value.clone());
        }

        Ok(written)
    }

    #[must_use]
    pub fn last_value(&self) -> Option<E::Value> {
        self.last.lock().clone()
    }

    pub fn inner(&self) -> &E {
        &self.entry
    }
}

impl<E: Entry> Entry for Lazy<E>
where
    E::Value: PartialEq + Clone,
{
    type Value = E::Value;

    fn append(&self, value: &E::Value, timestamp: u64) -> Result<bool> {
        self.update(value, timestamp)
    }
}

/// A fixed-layout value described by a struct schema.
pub trait StructSerializable {
    /// Name used in the `struct:<name>` type string.
    const TYPE_NAME: &'static str;
    /// Schema text, such as `"double x;double y"`.
    const SCHEMA: &'static str;
    /// Packed size in bytes.
    const SIZE: usize;

    /// Appends exactly [`StructSerializable::SIZE`] bytes.
    fn pack(&self, buf: &mut Vec<u8>);

    /// Structs embedded in this one, whose schemas are registered alongside.
    fn nested() -> Vec<StructDescriptor> {
        Vec::new()
    }
}

/// The schema side of a [`StructSerializable`] type.
#[derive(Debug, Clone, Copy)]
pub struct StructDescriptor {
    pub type_name: &'static str,
    pub schema: &'static str,
    pub nested: fn() -> Vec<StructDescriptor>,
}

impl StructDescriptor {
    #[must_use]
    pub fn of<T: StructSerializable>() -> Self {
        StructDescriptor {
            type_name: T::TYPE_NAME,
            schema: T::SCHEMA,
            nested: T::nested,
        }
    }

    /// `struct:<name>`, the schema name and the entry type of single values.
    #[must_use]
    pub fn type_string(&self) -> String {
        format!("struct:{}", self.type_name)
    }
}

/// Logs packed structs, registering their schemas when created.
pub struct StructLogEntry<T: StructSerializable> {
    inner: LogEntry<Vec<u8>>,
    _value: PhantomData<fn(&T)>,
}

impl<T: StructSerializable> StructLogEntry<T> {
    pub fn new(log: &DataLog, name: &str, metadata: &str, timestamp: u64) -> Result<Self> {
        let descriptor = StructDescriptor::of::<T>();
        log.add_struct_schema(&descriptor, timestamp)?;

        let r#type = descriptor.type_string();
        Ok(StructLogEntry {
            inner: LogEntry::with_type(log, name, &r#type, metadata, timestamp)?,
            _value: PhantomData,
        })
    }

    #[must_use]
    pub fn id(&self) -> u32 {
        self.inner.id()
    }
}

impl<T: StructSerializable> Entry for StructLogEntry<T> {
    type Value = T;

    fn append(&self, value: &T, timestamp: u64) -> Result<bool> {
        self.inner.append_with(timestamp, T::SIZE, |buf| value.pack(buf))
    }
}

/// Logs arrays of packed structs under `struct:<name>[]`, elements back to back.
pub struct StructArrayLogEntry<T: StructSerializable> {
    inner: LogEntry<Vec<u8>>,
    _value: PhantomData<fn(&T)>,
}

impl<T: StructSerializable> StructArrayLogEntry<T> {
    pub fn new(log: &DataLog, name: &str, metadata: &str, timestamp: u64) -> Result<Self> {
        let descriptor = StructDescriptor::of::<T>();
        log.add_struct_schema(&descriptor, timestamp)?;

        let r#type = format!("{}[]", descriptor.type_string());
        Ok(StructArrayLogEntry {
            inner: LogEntry::with_type(log, name, &r#type, metadata, timestamp)?,
            _value: PhantomData,
        })
    }

    #[must_use]
    pub fn id(&self) -> u32 {
        self.inner.id()
    }
}

impl<T: StructSerializable> Entry for StructArrayLogEntry<T> {
    type Value = Vec<T>;

    fn append(&self, values: &Vec<T>, timestamp: u64) -> Result<bool> {
        let size = T::SIZE.saturating_mul(values.len());
        self.inner.append_with(timestamp, size, |buf| {
            for value in values {
                value.pack(buf);
            }
        })
    }
}

impl DataLog {
    pub fn new_entry<V: LogValue>(&self, name: &str, metadata: &str) -> Result<LogEntry<V>> {
        LogEntry::new(self, name, metadata, 0)
    }

    pub fn new_lazy_entry<V: LogValue + PartialEq + Clone>(
        &self,
        name: &str,
        metadata: &str,
    ) -> Result<Lazy<LogEntry<V>>> {
        Ok(Lazy::new(LogEntry::new(self, name, metadata, 0)?))
    }

    pub fn new_struct_entry<T: StructSerializable>(
        &self,
        name: &str,
        metadata: &str,
    ) -> Result<StructLogEntry<T>> {
        StructLogEntry::new(self, name, metadata, 0)
    }

    pub fn new_struct_array_entry<T: StructSerializable>(
        &self,
        name: &str,
        metadata: &str,
    ) -> Result<StructArrayLogEntry<T>> {
        StructArrayLogEntry::new(self, name, metadata, 0)
    }

    /// Registers the schema of a struct type and, depth first, of every
    /// struct nested in it. Nothing is registered if the nesting loops.
    pub fn add_struct_schema(&self, descriptor: &StructDescriptor, timestamp: u64) -> Result<()> {
        let mut order = Vec::new();
        collect_structs(descriptor, &mut HashSet::new(), &mut order)?;

        for descriptor in order {
            let type_string = descriptor.type_string();
            if !self.has_schema(&type_string)? {
                self.add_schema_str(&type_string, "structschema", descriptor.schema, timestamp)?;
            }
        }

        Ok(())
    }
}

fn collect_structs(
    descriptor: &StructDescriptor,
    path: &mut HashSet<&'static str>,
    order: &mut Vec<StructDescriptor>,
) -> Result<(), DataLogError> {
    if !path.insert(descriptor.type_name) {
        return Err(DataLogError::CircularStruct(descriptor.type_string()));
    }

    if !order.iter().any(|seen| seen.type_name == descriptor.type_name) {
        order.push(*descriptor);
        for inner in (descriptor.nested)() {
            collect_structs(&inner, path, order)?;
        }
    }

    path.remove(descriptor.type_name);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::DataLogConfig, reader::DataLogReader};
    use std::{
        io::{self, Write},
        sync::Arc,
    };

    #[derive(Clone, Default)]
    struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuffer {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn memory_log() -> (DataLog, SharedBuffer) {
        let buffer = SharedBuffer::default();
        let log = DataLog::new(buffer.clone(), DataLogConfig::default()).unwrap();
        (log, buffer)
    }

    #[derive(Debug, Clone, PartialEq)]
    struct Translation {
        x: f64,
        y: f64,
    }

    impl StructSerializable for Translation {
        const TYPE_NAME: &'static str = "Translation2d";
        const SCHEMA: &'static str = "double x;double y";
        const SIZE: usize = 16;

        fn pack(&self, buf: &mut Vec<u8>) {
            buf.extend_from_slice(&self.x.to_le_bytes());
            buf.extend_from_slice(&self.y.to_le_bytes());
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq)]
    struct ThingA(u8);

    impl StructSerializable for ThingA {
        const TYPE_NAME: &'static str = "ThingA";
        const SCHEMA: &'static str = "uint8 value";
        const SIZE: usize = 1;

        fn pack(&self, buf: &mut Vec<u8>) {
            buf.push(self.0);
        }
    }

    #[derive(Debug, Clone, PartialEq)]
    struct Pose {
        translation: Translation,
        heading: f64,
    }

    impl StructSerializable for Pose {
        const TYPE_NAME: &'static str = "Pose2d";
        const SCHEMA: &'static str = "Translation2d translation;double heading";
        const SIZE: usize = 24;

        fn pack(&self, buf: &mut Vec<u8>) {
            self.translation.pack(buf);
            buf.extend_from_slice(&self.heading.to_le_bytes());
        }

        fn nested() -> Vec<StructDescriptor> {
            vec![StructDescriptor::of::<Translation>()]
        }
    }

    struct Left;
    struct Right;

    impl StructSerializable for Left {
        const TYPE_NAME: &'static str = "Left";
        const SCHEMA: &'static str = "Right right";
        const SIZE: usize = 0;

        fn pack(&self, _buf: &mut Vec<u8>) {}

        fn nested() -> Vec<StructDescriptor> {
            vec![StructDescriptor::of::<Right>()]
        }
    }

    impl StructSerializable for Right {
        const TYPE_NAME: &'static str = "Right";
        const SCHEMA: &'static str = "Left left";
        const SIZE: usize = 0;

        fn pack(&self, _buf: &mut Vec<u8>) {}

        fn nested() -> Vec<StructDescriptor> {
            vec![StructDescriptor::of::<Left>()]
        }
    }

    fn schema_starts(data: &[u8]) -> Vec<String> {
        let reader = DataLogReader::open(data).unwrap();
        reader
            .records()
            .filter(|record| record.is_start())
            .map(|record| record.get_start_data().unwrap().name.to_string())
            .filter(|name| name.starts_with("/.schema/"))
            .collect()
    }

    #[test]
    fn type_strings_match_standard_names() {
        assert_eq!(bool::type_string(), "boolean");
        assert_eq!(i64::type_string(), "int64");
        assert_eq!(f32::type_string(), "float");
        assert_eq!(f64::type_string(), "double");
        assert_eq!(String::type_string(), "string");
        assert_eq!(Vec::<u8>::type_string(), "raw");
        assert_eq!(Vec::<String>::type_string(), "string[]");
    }

    #[test]
    fn lazy_skips_repeats() {
        let (log, buffer) = memory_log();
        let entry = log.new_lazy_entry::<i64>("a", "").unwrap();

        assert_eq!(entry.last_value(), None);
        assert!(entry.update(&0, 7).unwrap());
        assert!(!entry.update(&0, 8).unwrap());
        assert!(entry.update(&2, 9).unwrap());
        assert_eq!(entry.last_value(), Some(2));

        drop(entry);
        log.close().unwrap();

        let data = buffer.0.lock().clone();
        let reader = DataLogReader::open(&data[..]).unwrap();
        let values: Vec<(u64, i64)> = reader
            .records()
            .filter(|record| !record.is_control())
            .map(|record| (record.timestamp(), record.get_integer().unwrap()))
            .collect();
        assert_eq!(values, [(7, 0), (9, 2)]);
    }

    #[test]
    fn lazy_state_is_per_wrapper() {
        let (log, buffer) = memory_log();
        let first = log.new_lazy_entry::<bool>("flag", "").unwrap();
        let second = log.new_lazy_entry::<bool>("flag", "").unwrap();
        assert_eq!(first.inner().id(), second.inner().id());

        assert!(first.update(&true, 1).unwrap());
        assert!(second.update(&true, 2).unwrap());
        log.flush().unwrap();

        let data = buffer.0.lock().clone();
        let reader = DataLogReader::open(&data[..]).unwrap();
        assert_eq!(reader.records().filter(|r| !r.is_control()).count(), 2);
    }

    #[test]
    fn lazy_retries_after_pause() {
        let (log, _buffer) = memory_log();
        let entry = log.new_lazy_entry::<f64>("v", "").unwrap();

        log.pause().unwrap();
        assert!(!entry.update(&1.0, 1).unwrap());
        assert_eq!(entry.last_value(), None);

        log.resume().unwrap();
        assert!(entry.update(&1.0, 2).unwrap());
    }

    #[test]
    fn dropping_entry_finishes_it() {
        let (log, buffer) = memory_log();
        let entry = log.new_entry::<String>("s", "").unwrap();
        let id = entry.id();
        entry.append(&"x".to_string(), 5).unwrap();
        drop(entry);
        log.flush().unwrap();

        let data = buffer.0.lock().clone();
        let reader = DataLogReader::open(&data[..]).unwrap();
        let last = reader.records().last().unwrap();
        assert_eq!(last.get_finish_entry().unwrap(), id);
        assert!(log.live_entries().unwrap().is_empty());
    }

    #[test]
    fn struct_entry_registers_schema_once() {
        let (log, buffer) = memory_log();
        let first = log.new_struct_entry::<Translation>("pose", "").unwrap();
        let _second = log.new_struct_entry::<Translation>("other", "").unwrap();
        first.append(&Translation { x: 1.0, y: 2.0 }, 3).unwrap();
        log.flush().unwrap();

        assert!(log.has_schema("struct:Translation2d").unwrap());

        let data = buffer.0.lock().clone();
        let reader = DataLogReader::open(&data[..]).unwrap();
        let starts: Vec<(String, String)> = reader
            .records()
            .filter(|record| record.is_start())
            .map(|record| {
                let start = record.get_start_data().unwrap();
                (start.name.to_string(), start.r#type.to_string())
            })
            .collect();
        assert_eq!(
            starts,
            [
                (
                    "/.schema/struct:Translation2d".to_string(),
                    "structschema".to_string()
                ),
                ("pose".to_string(), "struct:Translation2d".to_string()),
                ("other".to_string(), "struct:Translation2d".to_string()),
            ]
        );

        let data_records: Vec<_> = reader.records().filter(|r| !r.is_control()).collect();
        assert_eq!(data_records.len(), 2);
        assert_eq!(data_records[0].get_string().unwrap(), "double x;double y");
        assert_eq!(data_records[1].entry(), first.id());
        assert_eq!(data_records[1].size(), 16);
    }

    #[test]
    fn nested_struct_schemas_are_registered() {
        let (log, buffer) = memory_log();
        let pose = log.new_struct_entry::<Pose>("pose", "").unwrap();
        let _translation = log.new_struct_entry::<Translation>("t", "").unwrap();
        let value = Pose {
            translation: Translation { x: 1.0, y: 2.0 },
            heading: 0.5,
        };
        pose.append(&value, 4).unwrap();
        log.flush().unwrap();

        assert!(log.has_schema("struct:Pose2d").unwrap());
        assert!(log.has_schema("struct:Translation2d").unwrap());

        let data = buffer.0.lock().clone();
        assert_eq!(
            schema_starts(&data),
            ["/.schema/struct:Pose2d", "/.schema/struct:Translation2d"]
        );

        let reader = DataLogReader::open(&data[..]).unwrap();
        let last = reader.records().last().unwrap();
        assert_eq!(last.entry(), pose.id());
        assert_eq!(last.size(), 24);
    }

    #[test]
    fn circular_struct_schemas_are_rejected() {
        let (log, _buffer) = memory_log();
        let err = log
            .add_struct_schema(&StructDescriptor::of::<Left>(), 1)
            .unwrap_err();
        assert_eq!(
            err.downcast_ref::<DataLogError>(),
            Some(&DataLogError::CircularStruct("struct:Left".to_string()))
        );

        assert!(log.new_struct_entry::<Right>("r", "").is_err());
        assert!(!log.has_schema("struct:Left").unwrap());
        assert!(!log.has_schema("struct:Right").unwrap());
        assert!(log.live_entries().unwrap().is_empty());
    }

    #[test]
    fn struct_array_entry_packs_elements() {
        let (log, buffer) = memory_log();
        let entry = Lazy::new(StructArrayLogEntry::<ThingA>::new(&log, "a", "", 5).unwrap());
        assert!(entry.update(&vec![ThingA(1), ThingA(2)], 7).unwrap());
        log.flush().unwrap();
        assert_eq!(buffer.0.lock().len(), 125);

        assert!(!entry.update(&vec![ThingA(1), ThingA(2)], 8).unwrap());
        assert!(entry.update(&vec![ThingA(1), ThingA(3)], 9).unwrap());
        log.flush().unwrap();
        assert_eq!(buffer.0.lock().len(), 131);

        assert!(entry.update(&Vec::new(), 10).unwrap());
        log.flush().unwrap();
        assert_eq!(buffer.0.lock().len(), 135);

        let data = buffer.0.lock().clone();
        let reader = DataLogReader::open(&data[..]).unwrap();
        let start = reader
            .records()
            .filter(|record| record.is_start())
            .map(|record| record.get_start_data().unwrap())
            .find(|start| start.name == "a")
            .unwrap();
        assert_eq!(start.r#type, "struct:ThingA[]");

        let payloads: Vec<Vec<u8>> = reader
            .records()
            .filter(|record| !record.is_control() && record.entry() == start.entry)
            .map(|record| record.data().to_vec())
            .collect();
        assert_eq!(payloads, [vec![1, 2], vec![1, 3], vec![]]);
    }
}
