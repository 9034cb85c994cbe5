//! RTU Modbus Demo
//!
//! Demonstrates the rtu_modbus library features including:
//! - Typed register map construction and JSON persistence
//! - Slave request dispatch with stream resynchronisation
//! - Master request/response state machine with timeout and retry
//!
//! Usage: cargo run --bin demo

use std::sync::Arc;
use std::time::Duration;

use rtu_modbus::{
    DataType, ManualTimer, MemoryTransport, ModbusMaster, ModbusSlave, RegisterMap,
    RegisterValue, TokioTimer,
};

fn build_map() -> RegisterMap {
    let mut map = RegisterMap::new();
    map.set_protocol_name("Demo Power Meter");
    map.set_protocol_version("1.0");
    map.add_element(
        0x03,
        0x0010,
        DataType::UInt16,
        2,
        "Line voltage",
        0,
        RegisterValue::U16(230),
        RegisterValue::U16(0),
        RegisterValue::U16(400),
        Some("V"),
    )
    .unwrap();
    map.add_element(
        0x04,
        0x0020,
        DataType::SInt16ToFloat,
        2,
        "Heatsink temperature",
        1,
        RegisterValue::I16(235),
        RegisterValue::I16(-400),
        RegisterValue::I16(1250),
        Some("degC"),
    )
    .unwrap();
    map.add_element(
        0x01,
        0x0005,
        DataType::OneBit,
        1,
        "Pump running",
        0,
        RegisterValue::U8(0),
        RegisterValue::U8(0),
        RegisterValue::U8(1),
        Some(""),
    )
    .unwrap();
    map
}

fn hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(" ")
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    println!("{}", rtu_modbus::info());
    println!("=========================================\n");

    // =========================================================================
    // Part 1: Register map and JSON persistence
    // =========================================================================
    println!("Part 1: Register Map");
    println!("--------------------");

    let map = build_map();
    for element in map.iter() {
        println!(
            "  fc={:#04x} addr={:#06x} {:16} {:10} current={}",
            element.function_code(),
            element.address(),
            element.data_type().to_string(),
            element.name(),
            element.current(),
        );
        if let Some(scaled) = element.scaled_value() {
            println!("    -> scaled: {scaled} {}", element.unit().unwrap_or(""));
        }
    }

    let dir = std::env::temp_dir().join("rtu_modbus_demo");
    std::fs::create_dir_all(&dir)?;
    let path = dir.join("power_meter.json");
    map.save_to_file(&path)?;
    let mut reloaded = RegisterMap::new();
    reloaded.load_from_file(&path)?;
    println!(
        "\n  Saved and reloaded {} elements via {}",
        reloaded.elements_count(),
        path.display()
    );

    // =========================================================================
    // Part 2: Slave engine with resynchronisation
    // =========================================================================
    println!("\nPart 2: Slave Engine");
    println!("--------------------");

    let slave_tx = Arc::new(MemoryTransport::new());
    let slave = ModbusSlave::new(0x01, build_map(), slave_tx.clone());

    // read holding register 0x0010, with two garbage bytes in front
    let request = [0xDE, 0xAD, 0x01, 0x03, 0x00, 0x10, 0x00, 0x01, 0x85, 0xCF];
    println!("  -> {}", hex(&request));
    slave.on_bytes(&request);
    for frame in slave_tx.take_sent() {
        println!("  <- {}", hex(&frame));
    }

    // =========================================================================
    // Part 3: Master / slave end-to-end
    // =========================================================================
    println!("\nPart 3: Master <-> Slave");
    println!("------------------------");

    let master_tx = Arc::new(MemoryTransport::new());
    let timer = Arc::new(TokioTimer::new());
    let master = ModbusMaster::new(0x01, build_map(), master_tx.clone(), timer);

    // the pump started on the slave side; the master does not know yet
    slave.with_map(|map| {
        map.set_element_value(0x01, 0x0005, &[1]).unwrap();
    });
    master.send_read(0x01, 0x0005, 1)?;

    // pump the request into the slave and the response back
    for frame in master_tx.take_sent() {
        println!("  master -> {}", hex(&frame));
        slave.on_bytes(&frame);
    }
    for frame in slave_tx.take_sent() {
        println!("  slave  -> {}", hex(&frame));
        master.on_bytes(&frame);
    }

    println!("  master state: {:?}", master.state());
    master.with_map(|map| {
        let mut out = [0u8; 1];
        map.get_element_value(0x01, 0x0005, &mut out).unwrap();
        println!("  refreshed pump state: {}", out[0] != 0);
    });

    // =========================================================================
    // Part 4: Timeout and retry
    // =========================================================================
    println!("\nPart 4: Timeout and Retry");
    println!("-------------------------");

    let silent_tx = Arc::new(MemoryTransport::new());
    let manual = Arc::new(ManualTimer::new());
    let lonely = ModbusMaster::with_timing(
        0x01,
        build_map(),
        silent_tx.clone(),
        manual.clone(),
        Duration::from_millis(50),
        2,
        1024,
    );
    lonely.send_read(0x03, 0x0010, 1)?;
    while manual.fire_next() {
        println!(
            "  timeout fired: {} transmissions so far, state {:?}",
            silent_tx.sent_count(),
            lonely.state()
        );
    }
    println!(
        "  gave up after {} transmissions, state {:?}",
        silent_tx.sent_count(),
        lonely.state()
    );

    println!("\nDemo completed.");
    Ok(())
}
