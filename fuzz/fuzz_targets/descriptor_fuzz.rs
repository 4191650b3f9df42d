#![no_main]
use fusenfs::modules::constants::PASSWORD_MASK;
use fusenfs::ConnectionDescriptor;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(conn) = std::str::from_utf8(data) {
        if let Ok(desc) = ConnectionDescriptor::parse(conn) {
            let shown = desc.display();
            let _ = format!("{:?}", desc);

            // Parsing the display form never recovers a real password
            if let Ok(again) = ConnectionDescriptor::parse(&shown) {
                if let Some(secret) = &again.password {
                    let value = secret.expose();
                    assert!(value == PASSWORD_MASK || value.is_empty());
                }
                assert_eq!(again.kind, desc.kind);
            }
        }
    }
});
