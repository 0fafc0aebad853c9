#![no_main]

use libfuzzer_sys::fuzz_target;
use rastro::filter::PathFilter;

fuzz_target!(|data: &[u8]| {
    if let Ok(input) = std::str::from_utf8(data) {
        // Parsing must not panic; every accepted prefix is absolute
        if let Ok(filter) = PathFilter::from_expr(input) {
            assert!(filter.prefixes().iter().all(|p| p.starts_with('/')));
        }
    }
});
