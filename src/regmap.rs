//! # Typed Register Map
//!
//! Keyed store of Modbus elements with JSON load/save. The composite key is
//! `(function_code << 16) | register_address`, so iteration over the
//! underlying `BTreeMap` yields elements in ascending `(fc, addr)` order and
//! bulk refresh and file output stay stable across runs.
//!
//! The function code is part of the key verbatim: two elements may share an
//! address when they belong to different function codes, and a map loaded
//! with FC01 coil entries is not addressable through FC05 writes unless the
//! file also declares an FC05 element at that address. This mirrors the
//! established file format; callers that want one coil visible to both
//! function codes declare it twice.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde_json::{Map, Number, Value};
use tracing::{debug, warn};

use crate::error::{ModbusError, ModbusResult};
use crate::value::{DataType, RegisterValue};

// JSON schema field names
const KEY_PROTOCOL_NAME: &str = "Protocol Name";
const KEY_PROTOCOL_VERSION: &str = "Protocol Version";
const KEY_REGISTERS_MAP: &str = "Registers Map";
const KEY_FUNC_CODE: &str = "FuncCode";
const KEY_ADDRESS: &str = "Address";
const KEY_DATA_TYPE: &str = "DataType";
const KEY_BYTES: &str = "Bytes";
const KEY_REG_NAME: &str = "RegName";
const KEY_DEFAULT: &str = "Default";
const KEY_MIN: &str = "Min";
const KEY_MAX: &str = "Max";
const KEY_DECIMAL_POINTS: &str = "DecimalPoints";
const KEY_UNIT: &str = "Unit";

/// Compute the composite map key
#[inline]
fn element_key(function_code: u8, address: u16) -> u32 {
    (u32::from(function_code) << 16) | u32::from(address)
}

/// One element of the register map
#[derive(Debug, Clone, PartialEq)]
pub struct RegisterElement {
    function_code: u8,
    address: u16,
    data_type: DataType,
    byte_count: u16,
    name: String,
    decimal_points: u8,
    current: RegisterValue,
    min: RegisterValue,
    max: RegisterValue,
    unit: Option<String>,
}

impl RegisterElement {
    /// Function code family the element belongs to
    pub fn function_code(&self) -> u8 {
        self.function_code
    }

    /// 16-bit register address
    pub fn address(&self) -> u16 {
        self.address
    }

    /// Data-type tag
    pub fn data_type(&self) -> DataType {
        self.data_type
    }

    /// Declared byte width (always the tag's native width)
    pub fn byte_count(&self) -> u16 {
        self.byte_count
    }

    /// Human-readable register name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Decimal-point count; meaningful only for the `*_to_float` tags
    pub fn decimal_points(&self) -> u8 {
        self.decimal_points
    }

    /// Current value
    pub fn current(&self) -> &RegisterValue {
        &self.current
    }

    /// Lower bound
    pub fn min(&self) -> &RegisterValue {
        &self.min
    }

    /// Upper bound
    pub fn max(&self) -> &RegisterValue {
        &self.max
    }

    /// Unit string, absent for `file_record` elements
    pub fn unit(&self) -> Option<&str> {
        self.unit.as_deref()
    }

    /// Current value of a `*_to_float` element with decimal scaling applied.
    ///
    /// Returns `None` for non-scaled tags.
    pub fn scaled_value(&self) -> Option<f64> {
        if !self.data_type.is_scaled() {
            return None;
        }
        let raw = self.current.as_i64()?;
        Some(raw as f64 / 10f64.powi(i32::from(self.decimal_points)))
    }
}

/// Typed keyed store of Modbus elements with JSON persistence.
///
/// Constructed empty, populated by [`RegisterMap::add_element`] or
/// [`RegisterMap::load_from_file`], mutated in place by
/// [`RegisterMap::set_element_value`] and cleared wholesale by
/// [`RegisterMap::clear`].
#[derive(Debug, Default)]
pub struct RegisterMap {
    elements: BTreeMap<u32, RegisterElement>,
    protocol_name: String,
    protocol_version: String,
}

impl RegisterMap {
    /// Create an empty map
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove every element and reset the protocol metadata
    pub fn clear(&mut self) {
        self.elements.clear();
        self.protocol_name.clear();
        self.protocol_version.clear();
    }

    /// Number of elements in the map
    pub fn elements_count(&self) -> usize {
        self.elements.len()
    }

    /// Whether an element exists at `(function_code, address)`
    pub fn element_exists(&self, function_code: u8, address: u16) -> bool {
        self.elements
            .contains_key(&element_key(function_code, address))
    }

    /// Data type of the element at `(function_code, address)`, if any
    pub fn element_type(&self, function_code: u8, address: u16) -> Option<DataType> {
        self.elements
            .get(&element_key(function_code, address))
            .map(|e| e.data_type)
    }

    /// Borrow the element at `(function_code, address)`, if any
    pub fn element(&self, function_code: u8, address: u16) -> Option<&RegisterElement> {
        self.elements.get(&element_key(function_code, address))
    }

    /// Protocol name metadata
    pub fn protocol_name(&self) -> &str {
        &self.protocol_name
    }

    /// Set the protocol name metadata
    pub fn set_protocol_name(&mut self, name: impl Into<String>) {
        self.protocol_name = name.into();
    }

    /// Protocol version metadata
    pub fn protocol_version(&self) -> &str {
        &self.protocol_version
    }

    /// Set the protocol version metadata
    pub fn set_protocol_version(&mut self, version: impl Into<String>) {
        self.protocol_version = version.into();
    }

    /// Iterate elements in ascending `(function_code, address)` order.
    ///
    /// The iterator is restartable; callers that mutate during bulk
    /// operations collect keys first and issue per-key operations.
    pub fn iter(&self) -> impl Iterator<Item = &RegisterElement> + '_ {
        self.elements.values()
    }

    /// Add a new element.
    ///
    /// Fails if the key is already present, the byte count is zero or does
    /// not match the tag's native width, any of the three values is stored
    /// in a variant foreign to the tag, or `default` lies outside
    /// `[min, max]` (floats compared with the crate tolerance).
    #[allow(clippy::too_many_arguments)]
    pub fn add_element(
        &mut self,
        function_code: u8,
        address: u16,
        data_type: DataType,
        byte_count: u16,
        name: &str,
        decimal_points: u8,
        default: RegisterValue,
        min: RegisterValue,
        max: RegisterValue,
        unit: Option<&str>,
    ) -> ModbusResult<()> {
        let key = element_key(function_code, address);
        if self.elements.contains_key(&key) {
            return Err(ModbusError::invalid_data(format!(
                "element fc={function_code:#04x} addr={address:#06x} already present"
            )));
        }
        if byte_count == 0 {
            return Err(ModbusError::invalid_data("element byte count is zero"));
        }
        if byte_count != data_type.byte_count() {
            return Err(ModbusError::invalid_data(format!(
                "byte count {byte_count} does not match native width {} of {data_type}",
                data_type.byte_count()
            )));
        }
        if !default.matches(data_type) || !min.matches(data_type) || !max.matches(data_type) {
            return Err(ModbusError::invalid_data(format!(
                "value storage {} does not match data type {data_type}",
                default.type_name()
            )));
        }
        if let RegisterValue::Text(text) = &default {
            if text.len() != byte_count as usize {
                return Err(ModbusError::invalid_data(format!(
                    "string default '{text}' is not {byte_count} bytes"
                )));
            }
        }
        if !default.within(&min, &max) {
            return Err(ModbusError::invalid_data(format!(
                "default {default} outside range [{min}, {max}]"
            )));
        }

        self.elements.insert(
            key,
            RegisterElement {
                function_code,
                address,
                data_type,
                byte_count,
                name: name.to_string(),
                decimal_points,
                current: default,
                min,
                max,
                unit: unit.map(str::to_string),
            },
        );
        debug!(
            fc = function_code,
            address, %data_type, "register element added"
        );
        Ok(())
    }

    /// Typed raw write.
    ///
    /// The buffer length must equal the tag's native width; numeric writes
    /// are range-checked against the element's `[min, max]`. String writes
    /// accept exactly N bytes of valid UTF-8.
    pub fn set_element_value(
        &mut self,
        function_code: u8,
        address: u16,
        raw: &[u8],
    ) -> ModbusResult<()> {
        let element = self
            .elements
            .get_mut(&element_key(function_code, address))
            .ok_or_else(|| {
                ModbusError::invalid_data(format!(
                    "no element at fc={function_code:#04x} addr={address:#06x}"
                ))
            })?;

        let width = element.data_type.byte_count() as usize;
        if raw.len() != width {
            return Err(ModbusError::invalid_data(format!(
                "write of {} bytes to {} element of {width} bytes",
                raw.len(),
                element.data_type
            )));
        }

        let value = match element.data_type {
            DataType::OneBit => RegisterValue::U8(raw[0]),
            DataType::UInt16 | DataType::UInt16ToFloat | DataType::FileRecord => {
                RegisterValue::U16(u16::from_le_bytes([raw[0], raw[1]]))
            }
            DataType::SInt16 | DataType::SInt16ToFloat => {
                RegisterValue::I16(i16::from_le_bytes([raw[0], raw[1]]))
            }
            DataType::UInt32 | DataType::UInt32ToFloat => {
                RegisterValue::U32(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
            }
            DataType::SInt32 | DataType::SInt32ToFloat => {
                RegisterValue::I32(i32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
            }
            DataType::Float32 => {
                RegisterValue::F32(f32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
            }
            DataType::Char2Byte | DataType::Char4Byte => {
                let text = String::from_utf8(raw.to_vec()).map_err(|_| {
                    ModbusError::invalid_data("string register write is not valid UTF-8")
                })?;
                RegisterValue::Text(text)
            }
        };

        if !element.data_type.is_text() && !value.within(&element.min, &element.max) {
            return Err(ModbusError::invalid_data(format!(
                "value {value} outside range [{}, {}] for '{}'",
                element.min, element.max, element.name
            )));
        }

        element.current = value;
        Ok(())
    }

    /// Typed raw read into `out`.
    ///
    /// Writes the tag's native width in little-endian host order for
    /// numerics, raw bytes (zero-padded to the width) for strings, and
    /// returns the number of bytes written. Fails if the element is absent
    /// or `out` is too small.
    pub fn get_element_value(
        &self,
        function_code: u8,
        address: u16,
        out: &mut [u8],
    ) -> ModbusResult<usize> {
        let element = self
            .elements
            .get(&element_key(function_code, address))
            .ok_or_else(|| {
                ModbusError::invalid_data(format!(
                    "no element at fc={function_code:#04x} addr={address:#06x}"
                ))
            })?;

        let width = element.data_type.byte_count() as usize;
        if out.len() < width {
            return Err(ModbusError::invalid_data(format!(
                "output buffer of {} bytes too small for {width}-byte element",
                out.len()
            )));
        }

        let bytes = element.current.to_le_bytes();
        out[..width].fill(0);
        let copy = bytes.len().min(width);
        out[..copy].copy_from_slice(&bytes[..copy]);
        Ok(width)
    }

    // ========================================================================
    // JSON persistence
    // ========================================================================

    /// Load the map from a JSON file.
    ///
    /// I/O and JSON syntax errors leave the map untouched; once the document
    /// parses, any schema violation clears the map so a partial load is
    /// never observable.
    pub fn load_from_file(&mut self, path: impl AsRef<Path>) -> ModbusResult<()> {
        let text = fs::read_to_string(path.as_ref())?;
        let doc: Value = serde_json::from_str(&text)?;

        self.clear();
        match self.populate_from(&doc) {
            Ok(count) => {
                debug!(
                    elements = count,
                    protocol = %self.protocol_name,
                    "register map loaded"
                );
                Ok(())
            }
            Err(err) => {
                warn!(%err, "register map load failed, map cleared");
                self.clear();
                Err(err)
            }
        }
    }

    /// Save the map to a pretty-printed JSON file in ascending key order.
    pub fn save_to_file(&self, path: impl AsRef<Path>) -> ModbusResult<()> {
        let doc = self.to_json()?;
        let file = fs::File::create(path.as_ref())?;
        serde_json::to_writer_pretty(file, &doc)?;
        Ok(())
    }

    fn populate_from(&mut self, doc: &Value) -> ModbusResult<usize> {
        let root = doc
            .as_object()
            .ok_or_else(|| ModbusError::invalid_data("top-level JSON value is not an object"))?;

        self.protocol_name = parse_string(root, KEY_PROTOCOL_NAME)?.to_string();
        self.protocol_version = parse_string(root, KEY_PROTOCOL_VERSION)?.to_string();

        let registers = field(root, KEY_REGISTERS_MAP)?
            .as_array()
            .ok_or_else(|| ModbusError::invalid_data("'Registers Map' is not an array"))?;
        if registers.is_empty() {
            return Err(ModbusError::invalid_data("'Registers Map' is empty"));
        }

        for entry in registers {
            let obj = entry.as_object().ok_or_else(|| {
                ModbusError::invalid_data("register map entry is not an object")
            })?;
            self.add_element_from_json(obj)?;
        }
        Ok(self.elements.len())
    }

    fn add_element_from_json(&mut self, obj: &Map<String, Value>) -> ModbusResult<()> {
        let tag = parse_string(obj, KEY_DATA_TYPE)?;
        let data_type = DataType::from_tag(tag)
            .ok_or_else(|| ModbusError::invalid_data(format!("unknown data type '{tag}'")))?;

        let function_code = parse_unsigned(obj, KEY_FUNC_CODE, u64::from(u8::MAX))? as u8;
        let address = parse_unsigned(obj, KEY_ADDRESS, u64::from(u16::MAX))? as u16;
        let byte_count = parse_unsigned(obj, KEY_BYTES, u64::from(u16::MAX))? as u16;
        let name = parse_string(obj, KEY_REG_NAME)?.to_string();

        let unit = if data_type == DataType::FileRecord {
            None
        } else {
            Some(parse_string(obj, KEY_UNIT)?.to_string())
        };

        let decimal_points = if data_type.is_scaled() {
            parse_unsigned(obj, KEY_DECIMAL_POINTS, u64::from(u8::MAX))? as u8
        } else {
            0
        };

        let (default, min, max) = parse_values(obj, data_type)?;

        self.add_element(
            function_code,
            address,
            data_type,
            byte_count,
            &name,
            decimal_points,
            default,
            min,
            max,
            unit.as_deref(),
        )
    }

    fn to_json(&self) -> ModbusResult<Value> {
        let mut registers = Vec::with_capacity(self.elements.len());
        for element in self.elements.values() {
            registers.push(element_to_json(element)?);
        }

        let mut root = Map::new();
        root.insert(
            KEY_PROTOCOL_NAME.to_string(),
            Value::String(self.protocol_name.clone()),
        );
        root.insert(
            KEY_PROTOCOL_VERSION.to_string(),
            Value::String(self.protocol_version.clone()),
        );
        root.insert(KEY_REGISTERS_MAP.to_string(), Value::Array(registers));
        Ok(Value::Object(root))
    }
}

// ============================================================================
// JSON helpers
// ============================================================================

fn field<'a>(obj: &'a Map<String, Value>, key: &str) -> ModbusResult<&'a Value> {
    obj.get(key)
        .ok_or_else(|| ModbusError::invalid_data(format!("missing field '{key}'")))
}

fn parse_string<'a>(obj: &'a Map<String, Value>, key: &str) -> ModbusResult<&'a str> {
    field(obj, key)?
        .as_str()
        .ok_or_else(|| ModbusError::invalid_data(format!("field '{key}' is not a string")))
}

fn parse_unsigned(obj: &Map<String, Value>, key: &str, max: u64) -> ModbusResult<u64> {
    let value = field(obj, key)?.as_u64().ok_or_else(|| {
        ModbusError::invalid_data(format!("field '{key}' is not an unsigned integer"))
    })?;
    if value > max {
        return Err(ModbusError::invalid_data(format!(
            "field '{key}' value {value} above maximum {max}"
        )));
    }
    Ok(value)
}

fn parse_signed(obj: &Map<String, Value>, key: &str, min: i64, max: i64) -> ModbusResult<i64> {
    let value = field(obj, key)?.as_i64().ok_or_else(|| {
        ModbusError::invalid_data(format!("field '{key}' is not a signed integer"))
    })?;
    if value < min || value > max {
        return Err(ModbusError::invalid_data(format!(
            "field '{key}' value {value} outside [{min}, {max}]"
        )));
    }
    Ok(value)
}

fn parse_float(obj: &Map<String, Value>, key: &str) -> ModbusResult<f32> {
    let value = field(obj, key)?;
    if !value.is_f64() {
        return Err(ModbusError::invalid_data(format!(
            "field '{key}' is not a floating literal"
        )));
    }
    Ok(value.as_f64().unwrap_or_default() as f32)
}

/// Parse `Default`/`Min`/`Max` as the literal JSON type the tag demands
fn parse_values(
    obj: &Map<String, Value>,
    data_type: DataType,
) -> ModbusResult<(RegisterValue, RegisterValue, RegisterValue)> {
    use RegisterValue as V;

    let values = match data_type {
        DataType::OneBit => (
            V::U8(parse_unsigned(obj, KEY_DEFAULT, u64::from(u8::MAX))? as u8),
            V::U8(parse_unsigned(obj, KEY_MIN, u64::from(u8::MAX))? as u8),
            V::U8(parse_unsigned(obj, KEY_MAX, u64::from(u8::MAX))? as u8),
        ),
        DataType::UInt16 | DataType::UInt16ToFloat => (
            V::U16(parse_unsigned(obj, KEY_DEFAULT, u64::from(u16::MAX))? as u16),
            V::U16(parse_unsigned(obj, KEY_MIN, u64::from(u16::MAX))? as u16),
            V::U16(parse_unsigned(obj, KEY_MAX, u64::from(u16::MAX))? as u16),
        ),
        DataType::SInt16 | DataType::SInt16ToFloat => (
            V::I16(parse_signed(obj, KEY_DEFAULT, i64::from(i16::MIN), i64::from(i16::MAX))? as i16),
            V::I16(parse_signed(obj, KEY_MIN, i64::from(i16::MIN), i64::from(i16::MAX))? as i16),
            V::I16(parse_signed(obj, KEY_MAX, i64::from(i16::MIN), i64::from(i16::MAX))? as i16),
        ),
        DataType::UInt32 | DataType::UInt32ToFloat => (
            V::U32(parse_unsigned(obj, KEY_DEFAULT, u64::from(u32::MAX))? as u32),
            V::U32(parse_unsigned(obj, KEY_MIN, u64::from(u32::MAX))? as u32),
            V::U32(parse_unsigned(obj, KEY_MAX, u64::from(u32::MAX))? as u32),
        ),
        DataType::SInt32 | DataType::SInt32ToFloat => (
            V::I32(parse_signed(obj, KEY_DEFAULT, i64::from(i32::MIN), i64::from(i32::MAX))? as i32),
            V::I32(parse_signed(obj, KEY_MIN, i64::from(i32::MIN), i64::from(i32::MAX))? as i32),
            V::I32(parse_signed(obj, KEY_MAX, i64::from(i32::MIN), i64::from(i32::MAX))? as i32),
        ),
        DataType::Float32 => (
            V::F32(parse_float(obj, KEY_DEFAULT)?),
            V::F32(parse_float(obj, KEY_MIN)?),
            V::F32(parse_float(obj, KEY_MAX)?),
        ),
        DataType::Char2Byte | DataType::Char4Byte => {
            let text = parse_string(obj, KEY_DEFAULT)?;
            if text.len() != data_type.byte_count() as usize {
                return Err(ModbusError::invalid_data(format!(
                    "string default '{text}' is not {} bytes",
                    data_type.byte_count()
                )));
            }
            (
                V::Text(text.to_string()),
                V::Text(String::new()),
                V::Text(String::new()),
            )
        }
        DataType::FileRecord => (V::U16(0), V::U16(0), V::U16(u16::MAX)),
    };
    Ok(values)
}

fn number_from_f32(value: f32) -> ModbusResult<Number> {
    Number::from_f64(f64::from(value))
        .ok_or_else(|| ModbusError::invalid_data("non-finite float cannot be saved to JSON"))
}

fn value_to_json(value: &RegisterValue) -> ModbusResult<Value> {
    Ok(match value {
        RegisterValue::U8(v) => Value::Number(Number::from(u64::from(*v))),
        RegisterValue::U16(v) => Value::Number(Number::from(u64::from(*v))),
        RegisterValue::U32(v) => Value::Number(Number::from(u64::from(*v))),
        RegisterValue::I16(v) => Value::Number(Number::from(i64::from(*v))),
        RegisterValue::I32(v) => Value::Number(Number::from(i64::from(*v))),
        RegisterValue::F32(v) => Value::Number(number_from_f32(*v)?),
        RegisterValue::Text(s) => Value::String(s.clone()),
    })
}

fn element_to_json(element: &RegisterElement) -> ModbusResult<Value> {
    let mut obj = Map::new();
    obj.insert(
        KEY_FUNC_CODE.to_string(),
        Value::Number(Number::from(u64::from(element.function_code()))),
    );
    obj.insert(
        KEY_ADDRESS.to_string(),
        Value::Number(Number::from(u64::from(element.address()))),
    );
    obj.insert(
        KEY_DATA_TYPE.to_string(),
        Value::String(element.data_type().as_str().to_string()),
    );
    obj.insert(
        KEY_BYTES.to_string(),
        Value::Number(Number::from(u64::from(element.byte_count()))),
    );
    obj.insert(
        KEY_REG_NAME.to_string(),
        Value::String(element.name().to_string()),
    );

    let data_type = element.data_type();
    if data_type.is_text() {
        obj.insert(KEY_DEFAULT.to_string(), value_to_json(element.current())?);
    } else if data_type != DataType::FileRecord {
        obj.insert(KEY_DEFAULT.to_string(), value_to_json(element.current())?);
        obj.insert(KEY_MIN.to_string(), value_to_json(element.min())?);
        obj.insert(KEY_MAX.to_string(), value_to_json(element.max())?);
    }
    if data_type.is_scaled() {
        obj.insert(
            KEY_DECIMAL_POINTS.to_string(),
            Value::Number(Number::from(u64::from(element.decimal_points()))),
        );
    }
    if let Some(unit) = element.unit() {
        obj.insert(KEY_UNIT.to_string(), Value::String(unit.to_string()));
    }
    Ok(Value::Object(obj))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_map() -> RegisterMap {
        let mut map = RegisterMap::new();
        map.set_protocol_name("Test Device");
        map.set_protocol_version("1.0");
        map.add_element(
            0x03,
            0x0010,
            DataType::UInt16,
            2,
            "Voltage",
            0,
            RegisterValue::U16(0x1234),
            RegisterValue::U16(0),
            RegisterValue::U16(0xFFFF),
            Some("V"),
        )
        .unwrap();
        map.add_element(
            0x01,
            0x0005,
            DataType::OneBit,
            1,
            "Pump enable",
            0,
            RegisterValue::U8(0),
            RegisterValue::U8(0),
            RegisterValue::U8(1),
            Some(""),
        )
        .unwrap();
        map
    }

    #[test]
    fn test_add_and_lookup() {
        let map = sample_map();
        assert_eq!(map.elements_count(), 2);
        assert!(map.element_exists(0x03, 0x0010));
        assert!(!map.element_exists(0x03, 0x0011));
        assert_eq!(map.element_type(0x01, 0x0005), Some(DataType::OneBit));
        assert_eq!(map.element_type(0x02, 0x0005), None);
    }

    #[test]
    fn test_duplicate_key_rejected() {
        let mut map = sample_map();
        let err = map
            .add_element(
                0x03,
                0x0010,
                DataType::UInt16,
                2,
                "Duplicate",
                0,
                RegisterValue::U16(0),
                RegisterValue::U16(0),
                RegisterValue::U16(1),
                Some(""),
            )
            .unwrap_err();
        assert!(err.to_string().contains("already present"));
    }

    #[test]
    fn test_same_address_different_fc() {
        let mut map = RegisterMap::new();
        for fc in [0x01u8, 0x02] {
            map.add_element(
                fc,
                0x0100,
                DataType::OneBit,
                1,
                "Bit",
                0,
                RegisterValue::U8(0),
                RegisterValue::U8(0),
                RegisterValue::U8(1),
                Some(""),
            )
            .unwrap();
        }
        assert_eq!(map.elements_count(), 2);
    }

    #[test]
    fn test_width_mismatch_rejected() {
        let mut map = RegisterMap::new();
        assert!(map
            .add_element(
                0x03,
                0,
                DataType::UInt16,
                4,
                "Bad width",
                0,
                RegisterValue::U16(0),
                RegisterValue::U16(0),
                RegisterValue::U16(1),
                Some(""),
            )
            .is_err());
    }

    #[test]
    fn test_default_outside_range_rejected() {
        let mut map = RegisterMap::new();
        assert!(map
            .add_element(
                0x03,
                0,
                DataType::SInt16,
                2,
                "Out of range",
                0,
                RegisterValue::I16(50),
                RegisterValue::I16(-10),
                RegisterValue::I16(10),
                Some(""),
            )
            .is_err());
    }

    #[test]
    fn test_set_get_round_trip() {
        let mut map = sample_map();
        map.set_element_value(0x03, 0x0010, &[0x78, 0x56]).unwrap();

        let mut out = [0u8; 4];
        let written = map.get_element_value(0x03, 0x0010, &mut out).unwrap();
        assert_eq!(written, 2);
        assert_eq!(&out[..2], &[0x78, 0x56]);
    }

    #[test]
    fn test_set_enforces_width_and_range() {
        let mut map = RegisterMap::new();
        map.add_element(
            0x03,
            0,
            DataType::UInt16,
            2,
            "Bounded",
            0,
            RegisterValue::U16(5),
            RegisterValue::U16(0),
            RegisterValue::U16(10),
            Some(""),
        )
        .unwrap();

        // wrong width
        assert!(map.set_element_value(0x03, 0, &[1]).is_err());
        // above max (11 little-endian)
        assert!(map.set_element_value(0x03, 0, &[11, 0]).is_err());
        // value survived the failed writes
        let mut out = [0u8; 2];
        map.get_element_value(0x03, 0, &mut out).unwrap();
        assert_eq!(u16::from_le_bytes(out), 5);
    }

    #[test]
    fn test_iteration_order() {
        let map = sample_map();
        let keys: Vec<(u8, u16)> = map.iter().map(|e| (e.function_code(), e.address())).collect();
        assert_eq!(keys, vec![(0x01, 0x0005), (0x03, 0x0010)]);
    }

    #[test]
    fn test_scaled_value() {
        let mut map = RegisterMap::new();
        map.add_element(
            0x04,
            0,
            DataType::SInt16ToFloat,
            2,
            "Temperature",
            1,
            RegisterValue::I16(235),
            RegisterValue::I16(-500),
            RegisterValue::I16(1000),
            Some("degC"),
        )
        .unwrap();
        let element = map.element(0x04, 0).unwrap();
        assert_eq!(element.scaled_value(), Some(23.5));

        let plain = sample_map();
        assert_eq!(plain.element(0x03, 0x0010).unwrap().scaled_value(), None);
    }

    #[test]
    fn test_json_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("map.json");

        let map = sample_map();
        map.save_to_file(&path).unwrap();

        let mut loaded = RegisterMap::new();
        loaded.load_from_file(&path).unwrap();

        assert_eq!(loaded.elements_count(), map.elements_count());
        assert_eq!(loaded.protocol_name(), "Test Device");
        assert_eq!(loaded.protocol_version(), "1.0");
        let original: Vec<_> = map.iter().cloned().collect();
        let reread: Vec<_> = loaded.iter().cloned().collect();
        assert_eq!(original, reread);
    }

    #[test]
    fn test_load_structural_error_clears_map() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(
            &path,
            r#"{"Protocol Name": "X", "Protocol Version": "1", "Registers Map": [
                {"FuncCode": 3, "Address": 1, "DataType": "uint16_t", "Bytes": 2,
                 "RegName": "ok", "Default": 1, "Min": 0, "Max": 5, "Unit": ""},
                {"FuncCode": 3, "Address": 2, "DataType": "uint16_t", "Bytes": 2,
                 "RegName": "bad", "Default": 9, "Min": 0, "Max": 5, "Unit": ""}
            ]}"#,
        )
        .unwrap();

        let mut map = sample_map();
        assert!(map.load_from_file(&path).is_err());
        assert_eq!(map.elements_count(), 0);
        assert_eq!(map.protocol_name(), "");
    }

    #[test]
    fn test_load_io_error_leaves_map_untouched() {
        let mut map = sample_map();
        assert!(map.load_from_file("/nonexistent/map.json").is_err());
        assert_eq!(map.elements_count(), 2);
    }

    #[test]
    fn test_float_literal_required() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("float.json");
        // integer literal where a float is demanded
        std::fs::write(
            &path,
            r#"{"Protocol Name": "X", "Protocol Version": "1", "Registers Map": [
                {"FuncCode": 4, "Address": 1, "DataType": "float32", "Bytes": 4,
                 "RegName": "flow", "Default": 1, "Min": 0.0, "Max": 5.0, "Unit": "l/s"}
            ]}"#,
        )
        .unwrap();
        let mut map = RegisterMap::new();
        assert!(map.load_from_file(&path).is_err());
    }
}
