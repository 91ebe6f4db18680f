#![no_main]

use libfuzzer_sys::fuzz_target;
use secmod_lib::Dn;

fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };
    if let Ok(dn) = Dn::parse(text) {
        // Rendering a parsed name must parse back to the same name.
        let rendered = dn.to_string();
        let again = Dn::parse(&rendered).expect("rendered DN must parse");
        assert_eq!(again, dn);

        let _ = dn.common_name();
        let _ = dn.get("CN");
        for rdn in dn.iter() {
            for ava in rdn.iter() {
                let _ = ava.key();
                let _ = ava.to_string();
            }
        }
        let _ = serde_json::to_string(&dn);
    }
});
