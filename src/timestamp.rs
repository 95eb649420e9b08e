pub fn time_str(sec: f64) -> String {
    let total_ms = (sec * 1000f64) as u64;
    let hours = total_ms / 3_600_000;
    let minutes = (total_ms % 3_600_000) / 60_000;
    let seconds = (total_ms % 60_000) / 1000;
    let milliseconds = total_ms % 1000;

    format!(
        "{hours:0width$}:{minutes:02}:{seconds:02}.{milliseconds:03}",
        width = if hours >= 100 { 0 } else { 2 }
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_durations() {
        assert_eq!(time_str(0.02), "00:00:00.020");
        assert_eq!(time_str(61.5), "00:01:01.500");
        assert_eq!(time_str(3661.0), "01:01:01.000");
    }
}
