//! Small formatting helpers shared by log output

const UNITS: [&str; 6] = ["B", "KB", "MB", "GB", "TB", "PB"];

/// Render a byte count with binary (1024) unit steps, e.g. `1.50000 KB`
pub fn format_bytes(num_bytes: u64) -> String {
    let mut value = num_bytes as f64;
    for unit in &UNITS[..UNITS.len() - 1] {
        if value < 1024.0 {
            return format!("{value:.5} {unit}");
        }
        value /= 1024.0;
    }
    format!("{value:.5} PB")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes_units() {
        assert_eq!(format_bytes(0), "0.00000 B");
        assert_eq!(format_bytes(1023), "1023.00000 B");
        assert_eq!(format_bytes(1536), "1.50000 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.00000 MB");
    }

    #[test]
    fn test_format_bytes_caps_at_petabytes() {
        let two_pb = 2 * 1024u64.pow(5);
        assert_eq!(format_bytes(two_pb), "2.00000 PB");
        assert_eq!(format_bytes(two_pb * 2048), "4096.00000 PB");
    }
}
