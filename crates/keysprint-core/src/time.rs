/// Returns the current Unix time in milliseconds, as carried in wire
/// envelopes and `startTime`/`finishedAt` fields.
pub fn timestamp_ms() -> i64 {
    let dur = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    dur.as_millis() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamp_is_plausible() {
        let ts = timestamp_ms();
        // After 2020-01-01 and before 2100-01-01.
        assert!(ts > 1_577_836_800_000);
        assert!(ts < 4_102_444_800_000);
    }
}
