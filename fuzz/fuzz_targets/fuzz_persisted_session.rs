#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // The persisted blob comes from disk and may be anything.
    let _ = serde_json::from_slice::<heist_sync::protocol::PersistedSession>(data);

    // Backend error bodies carry these codes.
    if let Ok(s) = std::str::from_utf8(data) {
        let _ = serde_json::from_str::<heist_sync::ErrorCode>(s);
    }
});
