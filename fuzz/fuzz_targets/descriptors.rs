#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    uvc_host::fuzz_parse_configuration(data);
});
