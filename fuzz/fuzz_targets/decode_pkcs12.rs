#![no_main]

use libfuzzer_sys::fuzz_target;
use secmod_lib::{CertDb, Pkcs12Decoder};

fuzz_target!(|data: &[u8]| {
    // The decoder must reject malformed containers without panicking.
    let Ok(db) = CertDb::in_memory() else {
        return;
    };
    if let Ok(decoder) = Pkcs12Decoder::new(data, "", &db.internal_key_slot()) {
        for bag in &decoder {
            let _ = bag.to_string();
            let _ = bag.algorithm();
            let _ = bag.certificate().map(|c| c.subject().to_string());
        }
        let _ = decoder.database_import(&db);
    }
});
