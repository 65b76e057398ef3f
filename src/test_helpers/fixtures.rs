use crate::config::DriverConfig;
use crate::device::ChipType;

/// Render `(address, data)` runs as Intel HEX with 16-byte data records.
///
/// Extended linear address records are emitted whenever the upper half of
/// the address changes.
pub fn intel_hex(runs: &[(u32, Vec<u8>)]) -> String {
    let mut out = String::new();
    let mut upper: u32 = 0;
    for (address, data) in runs {
        for (index, chunk) in data.chunks(16).enumerate() {
            let record_address = address + (index * 16) as u32;
            if record_address >> 16 != upper {
                upper = record_address >> 16;
                push_record(&mut out, 0, 0x04, &(upper as u16).to_be_bytes());
            }
            push_record(&mut out, (record_address & 0xFFFF) as u16, 0x00, chunk);
        }
    }
    push_record(&mut out, 0, 0x01, &[]);
    out
}

fn push_record(out: &mut String, offset: u16, kind: u8, data: &[u8]) {
    let mut record = vec![data.len() as u8];
    record.extend_from_slice(&offset.to_be_bytes());
    record.push(kind);
    record.extend_from_slice(data);
    let sum = record.iter().fold(0u8, |acc, b| acc.wrapping_add(*b));
    record.push(sum.wrapping_neg());
    out.push(':');
    out.push_str(&hex::encode_upper(&record));
    out.push('\n');
}

/// Jennic image for `chip` of `length` bytes with a recognizable body.
pub fn jennic_image(chip: ChipType, length: usize) -> Vec<u8> {
    let mut image: Vec<u8> = (0..length).map(|i| (i % 251) as u8).collect();
    if let Some(tag) = chip.image_tag() {
        image[..4].copy_from_slice(&tag.to_be_bytes());
    }
    image
}

/// Configuration with short timeouts for simulated peers.
pub fn fast_config() -> DriverConfig {
    DriverConfig {
        reply_timeout_ms: 30,
        sync_timeout_ms: 20,
        sync_retries: 3,
        bridge_poll_interval_ms: 5,
        mock_steps: 4,
        mock_sleep_ms: 5,
        ..DriverConfig::default()
    }
}

/// Route `log` output through the test harness. `RUST_LOG` selects the level.
pub fn init_logging() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn"))
        .is_test(true)
        .try_init();
}
