// Copyright 2023 Pelikan Foundation LLC.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Wall-clock helpers. Kafka timestamps and retention settings are expressed
//! in milliseconds since the unix epoch, so that is the unit used here.

use clocksource::precise::UnixInstant;

/// Returns the current unix time in milliseconds.
pub fn unix_millis() -> i64 {
    let nanos = UnixInstant::now()
        .duration_since(UnixInstant::EPOCH)
        .as_nanos();
    (nanos / 1_000_000) as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monotonic_enough() {
        let a = unix_millis();
        let b = unix_millis();
        assert!(a > 0);
        assert!(b >= a);
    }
}
