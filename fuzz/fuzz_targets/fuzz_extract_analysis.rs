#![no_main]

use libfuzzer_sys::fuzz_target;

use pitchside::extract::extract_analysis;

fuzz_target!(|data: &str| {
    // Fuzz the three-tier response extractor with arbitrary strings.
    // It must never panic: every input either parses through one of the
    // strategies or comes back as a malformed-response error carrying the
    // original text. Fence matching is regex-based, so libFuzzer's
    // per-input timeout also guards against catastrophic backtracking.
    match extract_analysis(data) {
        Ok(report) => {
            // Whatever parsed must serialize back out cleanly.
            let _ = serde_json::to_string(&report);
        }
        Err(e) => {
            let _ = e.to_string();
        }
    }
});
