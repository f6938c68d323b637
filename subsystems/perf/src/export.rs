//! CSV export.

use alloc::string::String;
use core::fmt::Write;

use crate::sample::PerfSample;

/// Column header
pub const CSV_HEADER: &str =
    "core,timestamp_ns,utilization,ipc,cache_miss_rate,memory_bandwidth,temperature,power_state";

/// Samples as CSV, header first, one row per sample
pub fn samples_to_csv<'a, I>(samples: I) -> String
where
    I: IntoIterator<Item = &'a PerfSample>,
{
    let mut out = String::from(CSV_HEADER);
    out.push('\n');
    for s in samples {
        // writing into a String cannot fail
        let _ = writeln!(
            out,
            "{},{},{:.2},{:.3},{:.2},{:.2},{:.1},{}",
            s.core.0,
            s.timestamp_ns,
            s.utilization,
            s.ipc,
            s.cache_miss_rate,
            s.memory_bandwidth,
            s.temperature_c,
            s.power_state
        );
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use helix_topology::{CoreId, PowerState};

    #[test]
    fn test_csv_rows() {
        let s = PerfSample {
            utilization: 42.5,
            ipc: 1.25,
            cache_miss_rate: 3.0,
            memory_bandwidth: 10.0,
            temperature_c: 61.0,
            power_state: PowerState::Balanced,
            ..PerfSample::idle(CoreId(4), 1000)
        };
        let csv = samples_to_csv(&[s, PerfSample::idle(CoreId(5), 2000)]);
        let lines: alloc::vec::Vec<_> = csv.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], CSV_HEADER);
        assert!(lines[1].starts_with("4,1000,42.50,1.250,3.00,10.00,61.0,"));
        assert!(lines[2].starts_with("5,2000,0.00,"));
    }
}
