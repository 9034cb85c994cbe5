//! Register map JSON persistence: full-tag round trip and stable output.

use rtu_modbus::{DataType, RegisterMap, RegisterValue};

/// One element of every data-type tag
fn full_map() -> RegisterMap {
    use DataType as T;
    use RegisterValue as V;

    let mut map = RegisterMap::new();
    map.set_protocol_name("Full Coverage Device");
    map.set_protocol_version("2.3");

    map.add_element(0x01, 1, T::OneBit, 1, "Run flag", 0, V::U8(1), V::U8(0), V::U8(1), Some(""))
        .unwrap();
    map.add_element(
        0x03, 2, T::UInt16, 2, "Speed", 0, V::U16(500), V::U16(0), V::U16(1000), Some("rpm"),
    )
    .unwrap();
    map.add_element(
        0x03, 3, T::SInt16, 2, "Offset", 0, V::I16(-5), V::I16(-100), V::I16(100), Some("mm"),
    )
    .unwrap();
    map.add_element(
        0x03, 4, T::UInt32, 4, "Runtime", 0, V::U32(70_000), V::U32(0), V::U32(1_000_000),
        Some("s"),
    )
    .unwrap();
    map.add_element(
        0x03, 5, T::SInt32, 4, "Drift", 0, V::I32(-70_000), V::I32(-100_000), V::I32(100_000),
        Some("um"),
    )
    .unwrap();
    map.add_element(
        0x04, 6, T::Float32, 4, "Power factor", 0, V::F32(0.5), V::F32(-1.5), V::F32(1.5),
        Some(""),
    )
    .unwrap();
    map.add_element(
        0x03, 7, T::Char2Byte, 2, "Phase id", 0, V::Text("AB".into()), V::Text(String::new()),
        V::Text(String::new()), Some(""),
    )
    .unwrap();
    map.add_element(
        0x03, 8, T::Char4Byte, 4, "Model", 0, V::Text("WXYZ".into()), V::Text(String::new()),
        V::Text(String::new()), Some(""),
    )
    .unwrap();
    map.add_element(
        0x04, 9, T::UInt16ToFloat, 2, "Pressure", 1, V::U16(235), V::U16(0), V::U16(1000),
        Some("bar"),
    )
    .unwrap();
    map.add_element(
        0x04, 10, T::SInt16ToFloat, 2, "Temperature", 2, V::I16(-235), V::I16(-1000),
        V::I16(1000), Some("degC"),
    )
    .unwrap();
    map.add_element(
        0x04, 11, T::UInt32ToFloat, 4, "Energy", 3, V::U32(12_345), V::U32(0), V::U32(99_999),
        Some("kWh"),
    )
    .unwrap();
    map.add_element(
        0x04, 12, T::SInt32ToFloat, 4, "Reactive energy", 3, V::I32(-12_345), V::I32(-99_999),
        V::I32(99_999), Some("kvarh"),
    )
    .unwrap();
    map.add_element(
        0x03, 13, T::FileRecord, 2, "Log file", 0, V::U16(0), V::U16(0), V::U16(u16::MAX), None,
    )
    .unwrap();

    map
}

#[test]
fn round_trip_every_tag() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("full.json");

    let original = full_map();
    original.save_to_file(&path).unwrap();

    let mut reloaded = RegisterMap::new();
    reloaded.load_from_file(&path).unwrap();

    assert_eq!(reloaded.elements_count(), original.elements_count());
    assert_eq!(reloaded.protocol_name(), original.protocol_name());
    assert_eq!(reloaded.protocol_version(), original.protocol_version());

    for (a, b) in original.iter().zip(reloaded.iter()) {
        assert_eq!(a, b, "element fc={:#04x} addr={}", a.function_code(), a.address());
    }
}

#[test]
fn save_clear_load_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("map.json");

    let mut map = full_map();
    map.save_to_file(&path).unwrap();
    let before: Vec<_> = map.iter().cloned().collect();

    map.clear();
    assert_eq!(map.elements_count(), 0);

    map.load_from_file(&path).unwrap();
    let after: Vec<_> = map.iter().cloned().collect();
    assert_eq!(before, after);
}

#[test]
fn saved_output_is_stable() {
    let dir = tempfile::tempdir().unwrap();
    let first = dir.path().join("first.json");
    let second = dir.path().join("second.json");

    let map = full_map();
    map.save_to_file(&first).unwrap();

    let mut reloaded = RegisterMap::new();
    reloaded.load_from_file(&first).unwrap();
    reloaded.save_to_file(&second).unwrap();

    assert_eq!(
        std::fs::read_to_string(&first).unwrap(),
        std::fs::read_to_string(&second).unwrap()
    );
}

#[test]
fn unknown_tag_rejected_and_map_left_empty() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("unknown.json");
    std::fs::write(
        &path,
        r#"{"Protocol Name": "X", "Protocol Version": "1", "Registers Map": [
            {"FuncCode": 3, "Address": 1, "DataType": "unknown", "Bytes": 2,
             "RegName": "mystery", "Default": 0, "Min": 0, "Max": 1, "Unit": ""}
        ]}"#,
    )
    .unwrap();

    let mut map = full_map();
    assert!(map.load_from_file(&path).is_err());
    assert_eq!(map.elements_count(), 0);
}

#[test]
fn scaled_tags_require_decimal_points() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("scaled.json");
    std::fs::write(
        &path,
        r#"{"Protocol Name": "X", "Protocol Version": "1", "Registers Map": [
            {"FuncCode": 4, "Address": 9, "DataType": "uint16_to_float", "Bytes": 2,
             "RegName": "pressure", "Default": 235, "Min": 0, "Max": 1000, "Unit": "bar"}
        ]}"#,
    )
    .unwrap();

    let mut map = RegisterMap::new();
    assert!(map.load_from_file(&path).is_err());
}

#[test]
fn wire_writes_respect_loaded_ranges() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ranged.json");
    full_map().save_to_file(&path).unwrap();

    let mut map = RegisterMap::new();
    map.load_from_file(&path).unwrap();

    // Speed is bounded at 1000
    assert!(map.set_element_value(0x03, 2, &1000u16.to_le_bytes()).is_ok());
    assert!(map.set_element_value(0x03, 2, &1001u16.to_le_bytes()).is_err());

    // range invariant held after the rejected write
    let mut out = [0u8; 2];
    map.get_element_value(0x03, 2, &mut out).unwrap();
    assert_eq!(u16::from_le_bytes(out), 1000);
}
