#![no_main]

use libfuzzer_sys::fuzz_target;
use rastro::codec::JobLog;

fuzz_target!(|data: &[u8]| {
    // Arbitrary bytes must decode to a log or a CodecError, never panic
    if let Ok(log) = JobLog::from_bytes(data) {
        // Anything accepted must re-encode to a decodable log
        let bytes = log.to_bytes().expect("re-encode accepted log");
        let again = JobLog::from_bytes(&bytes).expect("decode re-encoded log");
        assert_eq!(again.record_count(), log.record_count());
    }
});
