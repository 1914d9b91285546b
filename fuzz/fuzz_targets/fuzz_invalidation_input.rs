#![no_main]

use libfuzzer_sys::fuzz_target;

use heist_sync::{CacheKey, DispatchContext, EventKind, KeyPattern};

fuzz_target!(|data: &[u8]| {
    let Ok(s) = std::str::from_utf8(data) else {
        return;
    };

    let _ = s.parse::<EventKind>();

    let key = CacheKey::from(s);
    let _ = (key.resource(), key.arg());

    // Mutation payloads pick the batch for batch-scoped rules.
    if let Ok(payload) = serde_json::from_str::<serde_json::Value>(s) {
        let ctx = DispatchContext::from_payload(&payload);
        let pattern = KeyPattern::resolve("leaderboard:{batch}", &ctx);
        let _ = pattern.matches(&key);
    }
});
